use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{Bus, Event, WriterAction};

// ---------------------------------------------------------------------------
// Long-generation watchdog
// ---------------------------------------------------------------------------

const CHECK_INTERVAL: Duration = Duration::from_secs(5);
const WARNING_AFTER: Duration = Duration::from_secs(45);
const CRITICAL_AFTER: Duration = Duration::from_secs(90);

#[derive(Debug, Clone)]
struct WatchedTask {
    started: Instant,
    last_progress: Instant,
    chapters_done: usize,
    expected_chapters: Option<usize>,
    warned: bool,
}

/// Watches long generation tasks for stalls. Warning after 45 s without
/// progress, critical stop after 90 s; checks run every 5 s.
pub struct WriterSupervisor {
    bus: Arc<Bus>,
    tasks: Arc<Mutex<HashMap<String, WatchedTask>>>,
    ticker: Mutex<Option<CancellationToken>>,
}

impl WriterSupervisor {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self {
            bus,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            ticker: Mutex::new(None),
        }
    }

    pub fn start_task(&self, session_id: &str, expected_chapters: Option<usize>) {
        let now = Instant::now();
        self.tasks.lock().expect("writer tasks lock").insert(
            session_id.to_string(),
            WatchedTask {
                started: now,
                last_progress: now,
                chapters_done: 0,
                expected_chapters,
                warned: false,
            },
        );
        self.bus.publish(Event::WriterProgress {
            session_id: session_id.to_string(),
            action: WriterAction::Outline,
            detail: expected_chapters.map(|n| format!("{n} chapters planned")),
        });
        self.ensure_ticker();
    }

    pub fn update_progress(&self, session_id: &str) {
        let mut tasks = self.tasks.lock().expect("writer tasks lock");
        let Some(task) = tasks.get_mut(session_id) else {
            return;
        };
        task.last_progress = Instant::now();
        task.chapters_done += 1;
        task.warned = false;
        let done = task.chapters_done;
        let expected = task.expected_chapters;
        drop(tasks);
        self.bus.publish(Event::WriterProgress {
            session_id: session_id.to_string(),
            action: WriterAction::ChapterComplete,
            detail: Some(match expected {
                Some(total) => format!("{done}/{total} chapters"),
                None => format!("{done} chapters"),
            }),
        });
    }

    pub fn stop_task(&self, session_id: &str) {
        let removed = self
            .tasks
            .lock()
            .expect("writer tasks lock")
            .remove(session_id);
        if let Some(task) = removed {
            self.bus.publish(Event::WriterProgress {
                session_id: session_id.to_string(),
                action: WriterAction::Complete,
                detail: Some(format!(
                    "{} chapters in {}s",
                    task.chapters_done,
                    task.started.elapsed().as_secs()
                )),
            });
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().expect("writer tasks lock").len()
    }

    fn ensure_ticker(&self) {
        let mut ticker = self.ticker.lock().expect("writer ticker lock");
        if ticker.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *ticker = Some(token.clone());
        let tasks = self.tasks.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(CHECK_INTERVAL) => {}
                }
                check_stalls(&tasks, &bus);
            }
        });
    }

    /// Stop the background ticker (process shutdown).
    pub fn close(&self) {
        if let Some(token) = self.ticker.lock().expect("writer ticker lock").take() {
            token.cancel();
        }
    }

    /// Test hook: run one stall check immediately.
    #[cfg(test)]
    fn check_now(&self) {
        check_stalls(&self.tasks, &self.bus);
    }

    /// Test hook: age a task's progress clock backwards.
    #[cfg(test)]
    fn age_task(&self, session_id: &str, by: Duration) {
        let mut tasks = self.tasks.lock().expect("writer tasks lock");
        if let Some(task) = tasks.get_mut(session_id) {
            task.last_progress -= by;
            task.started -= by;
        }
    }
}

fn check_stalls(tasks: &Mutex<HashMap<String, WatchedTask>>, bus: &Bus) {
    let mut stalled: Vec<(String, Duration)> = Vec::new();
    let mut warned: Vec<(String, Duration)> = Vec::new();
    {
        let mut guard = tasks.lock().expect("writer tasks lock");
        let mut to_remove = Vec::new();
        for (session_id, task) in guard.iter_mut() {
            let idle = task.last_progress.elapsed();
            if idle >= CRITICAL_AFTER {
                to_remove.push(session_id.clone());
                stalled.push((session_id.clone(), idle));
            } else if idle >= WARNING_AFTER && !task.warned {
                task.warned = true;
                warned.push((session_id.clone(), idle));
            }
        }
        for session_id in to_remove {
            guard.remove(&session_id);
        }
    }
    for (session_id, idle) in warned {
        warn!("writer task {session_id} quiet for {}s", idle.as_secs());
        self_publish(bus, &session_id, WriterAction::ChapterStart, format!(
            "no progress for {}s",
            idle.as_secs()
        ));
    }
    for (session_id, idle) in stalled {
        info!("writer task {session_id} stopped after {}s stall", idle.as_secs());
        self_publish(bus, &session_id, WriterAction::Error, format!(
            "stalled for {}s; task stopped",
            idle.as_secs()
        ));
    }
}

fn self_publish(bus: &Bus, session_id: &str, action: WriterAction, detail: String) {
    bus.publish(Event::WriterProgress {
        session_id: session_id.to_string(),
        action,
        detail: Some(detail),
    });
}

// ---------------------------------------------------------------------------
// Progress markers and chunk sizing
// ---------------------------------------------------------------------------

/// Parse `<!-- PROGRESS: N/M chapters -->` from model output; the last
/// occurrence wins.
pub fn parse_progress_marker(text: &str) -> Option<(usize, usize)> {
    static MARKER_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = MARKER_RE.get_or_init(|| {
        regex::Regex::new(r"<!--\s*PROGRESS:\s*(\d+)\s*/\s*(\d+)\s*chapters\s*-->")
            .expect("progress marker regex")
    });
    re.captures_iter(text)
        .last()
        .and_then(|cap| {
            let done = cap.get(1)?.as_str().parse().ok()?;
            let total = cap.get(2)?.as_str().parse().ok()?;
            Some((done, total))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSuggestion {
    pub chapters: usize,
    pub words_per_chapter: usize,
}

/// Suggested chapter split for a long write, biased by provider family:
/// slower local providers get smaller chunks.
pub fn suggest_chunk_size(total_words: usize, provider_id: &str) -> ChunkSuggestion {
    let base_chunk = if provider_id.contains("ollama") || provider_id.contains("local") {
        800
    } else {
        1500
    };
    let chapters = (total_words.div_ceil(base_chunk)).clamp(1, 40);
    ChunkSuggestion {
        chapters,
        words_per_chapter: total_words.div_ceil(chapters),
    }
}
