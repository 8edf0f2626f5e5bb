use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use codecoder::agents::AgentRegistry;
use codecoder::bus::Bus;
use codecoder::config::{GlobalConfig, ProjectConfig};
use codecoder::engine::{tools::ToolRegistry, Engine, EngineConfig};
use codecoder::hooks::HookPipeline;
use codecoder::memory::Memory;
use codecoder::permission::requests::AskBroker;
use codecoder::project::{detect_worktree, Project};
use codecoder::provider::scripted::ScriptedProvider;
use codecoder::provider::ModelProvider;
use codecoder::session::SessionStore;
use codecoder::storage::Storage;
use codecoder::{logging, paths, skills};

#[derive(Parser, Debug)]
#[command(name = "ccode", version)]
#[command(about = "CodeCoder — local-first coding-assistant runtime", long_about = None)]
struct Cli {
    /// Worktree root. If omitted, detects by walking up for .git.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a one-shot prompt against the worktree.
    Run {
        /// The user prompt.
        prompt: String,
        /// Agent to run as; defaults to the configured default agent.
        #[arg(long)]
        agent: Option<String>,
    },
    /// List sessions for this project.
    Sessions,
    /// Check configuration, storage, hooks, and skills.
    Doctor,
}

/// Everything a command needs, composed once and injected.
struct Runtime {
    project: Project,
    project_config: ProjectConfig,
    engine: Arc<Engine>,
}

fn compose_runtime(worktree: PathBuf, global: &GlobalConfig) -> Result<Runtime> {
    let data_root = paths::data_dir();
    let storage = Arc::new(Storage::open(paths::memory_dir(&data_root))?);
    let project = Project::provide(&storage, &worktree)?;
    let project_config = ProjectConfig::load(&project.worktree)?;

    let memory = Arc::new(Memory::open(&data_root, &project.id)?);
    let bus = Arc::new(Bus::new());
    let sessions = Arc::new(SessionStore::new(storage.clone()));
    let asks = Arc::new(AskBroker::new(storage, bus.clone()));
    let registry =
        Arc::new(AgentRegistry::build(&project_config).map_err(|e| anyhow::anyhow!("{e}"))?);
    let hooks = Arc::new(HookPipeline::new(&project.worktree));

    let mut tools = ToolRegistry::builtin();
    let discovered = skills::discover_skills(&project.worktree);
    info!("Discovered {} skills", discovered.len());
    skills::register_skill_tools(&mut tools, &discovered);

    let model = project_config
        .model
        .clone()
        .or_else(|| global.model.clone())
        .unwrap_or_else(|| "default".to_string());
    let mut engine_cfg = EngineConfig::new(project.worktree.clone(), &model);
    engine_cfg.max_steps = global.max_steps;

    // Provider transport is configured outside the core; without one the
    // engine surfaces ModelUnavailable on first use.
    let provider: Arc<dyn ModelProvider> = Arc::new(ScriptedProvider::new(Vec::new()));

    let engine = Arc::new(Engine::new(
        engine_cfg,
        provider,
        registry,
        Arc::new(tools),
        sessions,
        bus,
        hooks,
        asks,
        memory,
    ));
    Ok(Runtime {
        project,
        project_config,
        engine,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let global = GlobalConfig::load()?;
    let log_dir = logging::setup_tracing_with_settings(logging::LoggingSettings {
        level: global.logging.level.as_deref(),
        directory: global.logging.directory.as_deref(),
        retention_days: global.logging.retention_days,
    })?;
    info!("Logging to {}", log_dir.display());

    let start = cli.root.clone().unwrap_or(std::env::current_dir()?);
    let worktree = detect_worktree(&start);

    match cli.command {
        Command::Run { prompt, agent } => {
            let runtime = compose_runtime(worktree, &global)?;
            let agent_name = agent
                .or(runtime.project_config.default_agent.clone())
                .unwrap_or_else(|| "build".to_string());
            let session = runtime.engine.sessions.create(&runtime.project.id, None)?;
            match runtime.engine.prompt(&session.id, &agent_name, &prompt).await {
                Ok(message) => println!("{}", message.text()),
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Sessions => {
            let runtime = compose_runtime(worktree, &global)?;
            for session in runtime.engine.sessions.list(&runtime.project.id)? {
                println!(
                    "{}  {}  {}",
                    session.id,
                    chrono::DateTime::from_timestamp(session.time.created as i64, 0)
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_default(),
                    session.title
                );
            }
        }
        Command::Doctor => {
            let runtime = compose_runtime(worktree.clone(), &global)?;
            println!("worktree:  {}", runtime.project.worktree.display());
            println!("project:   {}", runtime.project.id);
            println!("data root: {}", paths::data_dir().display());
            println!("agents:    {}", runtime.engine.registry.names().join(", "));
            println!("tools:     {}", runtime.engine.tools.names().join(", "));
            let hook_files = paths::hook_config_candidates(&worktree)
                .into_iter()
                .filter(|p| p.exists())
                .count();
            println!("hook configs found: {hook_files}");
            let skills = skills::discover_skills(&worktree);
            println!("skills:    {}", skills.len());
        }
    }
    Ok(())
}
