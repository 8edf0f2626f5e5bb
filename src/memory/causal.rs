use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::storage::Storage;
use crate::util;

// ---------------------------------------------------------------------------
// Nodes and edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionNode {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub prompt: String,
    pub reasoning: String,
    /// Clamped to [0, 1].
    pub confidence: f64,
    pub timestamp: String,
    #[serde(default)]
    pub context_refs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    FileOperation,
    Search,
    ToolExecution,
    ApiCall,
    CodeChange,
    Other,
}

/// Tool name → action type, per the recorder's fixed mapping.
pub fn action_type_for_tool(tool: &str) -> ActionType {
    match tool {
        "write" | "edit" | "read" => ActionType::FileOperation,
        "grep" | "glob" | "websearch" => ActionType::Search,
        "webfetch" => ActionType::ApiCall,
        t if t == "bash" || t.starts_with("mcp_") => ActionType::ToolExecution,
        t if t.contains("code") || t.contains("lint") || t.contains("format") => {
            ActionType::CodeChange
        }
        _ => ActionType::Other,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionNode {
    pub id: String,
    pub decision_id: String,
    pub action_type: ActionType,
    pub description: String,
    pub input: JsonValue,
    pub output: JsonValue,
    pub duration_ms: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Failure,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeNode {
    pub id: String,
    pub action_id: String,
    pub status: OutcomeStatus,
    pub description: String,
    #[serde(default)]
    pub metrics: JsonValue,
    #[serde(default)]
    pub feedback: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    Causes,
    ResultsIn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub relationship: Relationship,
    pub weight: f64,
    #[serde(default)]
    pub metadata: JsonValue,
}

#[derive(Debug, Clone)]
pub struct CausalChain {
    pub decision: DecisionNode,
    pub actions: Vec<(ActionNode, Option<OutcomeNode>)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CausalStats {
    pub decisions: usize,
    pub actions: usize,
    pub outcomes: usize,
    pub edges: usize,
    pub success: usize,
    pub failure: usize,
    pub partial: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CausalQuery {
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub min_confidence: Option<f64>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub action_type: Option<ActionType>,
    pub outcome_status: Option<OutcomeStatus>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Decision→Action→Outcome graph over the record store, one namespace per
/// project. Writes are read-modify-write under a per-store mutex.
pub struct CausalStore {
    storage: Arc<Storage>,
    project_id: String,
    write_lock: Mutex<()>,
    /// Active decision per session; each recorded action links to it.
    active: std::sync::Mutex<HashMap<String, String>>,
}

impl CausalStore {
    pub fn new(storage: Arc<Storage>, project_id: &str) -> Self {
        Self {
            storage,
            project_id: project_id.to_string(),
            write_lock: Mutex::new(()),
            active: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn key<'a>(&'a self, kind: &'a str, id: &'a str) -> [&'a str; 4] {
        ["causal", &self.project_id, kind, id]
    }

    pub async fn record_decision(
        &self,
        session_id: &str,
        agent_id: &str,
        prompt: &str,
        reasoning: &str,
        confidence: f64,
    ) -> Result<DecisionNode> {
        let _guard = self.write_lock.lock().await;
        let decision = DecisionNode {
            id: util::new_id(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            prompt: util::truncate_chars(prompt, 500),
            reasoning: util::truncate_chars(reasoning, 500),
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: util::now_iso(),
            context_refs: Vec::new(),
        };
        self.storage
            .write_as(&self.key("decision", &decision.id), &decision)?;
        self.active
            .lock()
            .expect("active decisions lock")
            .insert(session_id.to_string(), decision.id.clone());
        Ok(decision)
    }

    /// The session's active decision, set by the latest `record_decision`.
    pub fn active_decision(&self, session_id: &str) -> Option<String> {
        self.active
            .lock()
            .expect("active decisions lock")
            .get(session_id)
            .cloned()
    }

    pub async fn record_action(
        &self,
        decision_id: &str,
        action_type: ActionType,
        description: &str,
        input: JsonValue,
        output: JsonValue,
        duration_ms: u64,
    ) -> Result<ActionNode> {
        let _guard = self.write_lock.lock().await;
        let decision: DecisionNode = self
            .storage
            .read_as(&self.key("decision", decision_id))?
            .ok_or_else(|| anyhow::anyhow!("unknown decision: {decision_id}"))?;
        let action = ActionNode {
            id: util::new_id(),
            decision_id: decision_id.to_string(),
            action_type,
            description: util::truncate_chars(description, 200),
            input,
            output,
            duration_ms,
            timestamp: util::now_iso(),
        };
        self.storage
            .write_as(&self.key("action", &action.id), &action)?;
        let edge = CausalEdge {
            id: util::new_id(),
            source: decision_id.to_string(),
            target: action.id.clone(),
            relationship: Relationship::Causes,
            weight: decision.confidence,
            metadata: JsonValue::Null,
        };
        self.storage.write_as(&self.key("edge", &edge.id), &edge)?;
        Ok(action)
    }

    /// Record the action's outcome. Idempotent over `(action_id, status)`:
    /// an identical second call returns the existing node unchanged.
    pub async fn record_outcome(
        &self,
        action_id: &str,
        status: OutcomeStatus,
        description: &str,
        metrics: JsonValue,
        feedback: Option<String>,
    ) -> Result<OutcomeNode> {
        let _guard = self.write_lock.lock().await;
        if self
            .storage
            .read_as::<ActionNode>(&self.key("action", action_id))?
            .is_none()
        {
            anyhow::bail!("unknown action: {action_id}");
        }
        if let Some(existing) = self.outcome_for_action_inner(action_id)? {
            if existing.status == status {
                return Ok(existing);
            }
        }
        let outcome = OutcomeNode {
            id: util::new_id(),
            action_id: action_id.to_string(),
            status,
            description: util::truncate_chars(description, 200),
            metrics,
            feedback,
            timestamp: util::now_iso(),
        };
        self.storage
            .write_as(&self.key("outcome", &outcome.id), &outcome)?;
        let edge = CausalEdge {
            id: util::new_id(),
            source: action_id.to_string(),
            target: outcome.id.clone(),
            relationship: Relationship::ResultsIn,
            weight: match status {
                OutcomeStatus::Success => 1.0,
                OutcomeStatus::Partial => 0.5,
                OutcomeStatus::Failure => 0.0,
            },
            metadata: JsonValue::Null,
        };
        self.storage.write_as(&self.key("edge", &edge.id), &edge)?;
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn load_all<T: serde::de::DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for key in self.storage.list(&["causal", &self.project_id, kind])? {
            let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(node) = self.storage.read_as::<T>(&borrowed)? {
                out.push(node);
            }
        }
        Ok(out)
    }

    fn outcome_for_action_inner(&self, action_id: &str) -> Result<Option<OutcomeNode>> {
        Ok(self
            .load_all::<OutcomeNode>("outcome")?
            .into_iter()
            .find(|o| o.action_id == action_id))
    }

    pub fn get_causal_chain(&self, decision_id: &str) -> Result<Option<CausalChain>> {
        let Some(decision) = self
            .storage
            .read_as::<DecisionNode>(&self.key("decision", decision_id))?
        else {
            return Ok(None);
        };
        let mut actions: Vec<ActionNode> = self
            .load_all::<ActionNode>("action")?
            .into_iter()
            .filter(|a| a.decision_id == decision_id)
            .collect();
        actions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let outcomes = self.load_all::<OutcomeNode>("outcome")?;
        let actions = actions
            .into_iter()
            .map(|action| {
                let outcome = outcomes.iter().find(|o| o.action_id == action.id).cloned();
                (action, outcome)
            })
            .collect();
        Ok(Some(CausalChain { decision, actions }))
    }

    pub fn get_causal_chains_for_session(&self, session_id: &str) -> Result<Vec<CausalChain>> {
        let mut decisions: Vec<DecisionNode> = self
            .load_all::<DecisionNode>("decision")?
            .into_iter()
            .filter(|d| d.session_id == session_id)
            .collect();
        decisions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let mut chains = Vec::with_capacity(decisions.len());
        for decision in decisions {
            if let Some(chain) = self.get_causal_chain(&decision.id)? {
                chains.push(chain);
            }
        }
        Ok(chains)
    }

    /// Filtered decision query; every filter is conjunctive.
    pub fn query(&self, filter: &CausalQuery) -> Result<Vec<CausalChain>> {
        let decisions = self.load_all::<DecisionNode>("decision")?;
        let mut chains = Vec::new();
        for decision in decisions {
            if let Some(agent) = &filter.agent_id {
                if &decision.agent_id != agent {
                    continue;
                }
            }
            if let Some(session) = &filter.session_id {
                if &decision.session_id != session {
                    continue;
                }
            }
            if let Some(min) = filter.min_confidence {
                if decision.confidence < min {
                    continue;
                }
            }
            if let Some(from) = &filter.date_from {
                if decision.timestamp.as_str() < from.as_str() {
                    continue;
                }
            }
            if let Some(to) = &filter.date_to {
                if decision.timestamp.as_str() > to.as_str() {
                    continue;
                }
            }
            let Some(chain) = self.get_causal_chain(&decision.id)? else {
                continue;
            };
            if let Some(action_type) = filter.action_type {
                if !chain.actions.iter().any(|(a, _)| a.action_type == action_type) {
                    continue;
                }
            }
            if let Some(status) = filter.outcome_status {
                let has = chain
                    .actions
                    .iter()
                    .any(|(_, o)| o.as_ref().map(|o| o.status == status).unwrap_or(false));
                if !has {
                    continue;
                }
            }
            chains.push(chain);
        }
        chains.sort_by(|a, b| a.decision.timestamp.cmp(&b.decision.timestamp));
        Ok(chains)
    }

    /// Fraction of known outcomes that are successes, optionally per agent.
    pub fn get_success_rate(&self, agent_id: Option<&str>) -> Result<f64> {
        let decisions = self.load_all::<DecisionNode>("decision")?;
        let actions = self.load_all::<ActionNode>("action")?;
        let outcomes = self.load_all::<OutcomeNode>("outcome")?;

        let decision_ids: std::collections::HashSet<&str> = decisions
            .iter()
            .filter(|d| agent_id.map(|a| d.agent_id == a).unwrap_or(true))
            .map(|d| d.id.as_str())
            .collect();
        let action_ids: std::collections::HashSet<&str> = actions
            .iter()
            .filter(|a| decision_ids.contains(a.decision_id.as_str()))
            .map(|a| a.id.as_str())
            .collect();
        let relevant: Vec<&OutcomeNode> = outcomes
            .iter()
            .filter(|o| action_ids.contains(o.action_id.as_str()))
            .collect();
        if relevant.is_empty() {
            return Ok(0.0);
        }
        let successes = relevant
            .iter()
            .filter(|o| o.status == OutcomeStatus::Success)
            .count();
        Ok(successes as f64 / relevant.len() as f64)
    }

    pub fn get_stats(&self) -> Result<CausalStats> {
        let outcomes = self.load_all::<OutcomeNode>("outcome")?;
        Ok(CausalStats {
            decisions: self.storage.list(&["causal", &self.project_id, "decision"])?.len(),
            actions: self.storage.list(&["causal", &self.project_id, "action"])?.len(),
            outcomes: outcomes.len(),
            edges: self.storage.list(&["causal", &self.project_id, "edge"])?.len(),
            success: outcomes.iter().filter(|o| o.status == OutcomeStatus::Success).count(),
            failure: outcomes.iter().filter(|o| o.status == OutcomeStatus::Failure).count(),
            partial: outcomes.iter().filter(|o| o.status == OutcomeStatus::Partial).count(),
        })
    }

    // ------------------------------------------------------------------
    // Mermaid export
    // ------------------------------------------------------------------

    /// Render chains as a `graph TD` Mermaid diagram. Decisions are
    /// `{{label}}`, actions `[label]`, success outcomes `(label)`, failures
    /// `((label))`, partials `[label]`.
    pub fn to_mermaid(&self, session_id: Option<&str>) -> Result<String> {
        let chains = match session_id {
            Some(sid) => self.get_causal_chains_for_session(sid)?,
            None => self.query(&CausalQuery::default())?,
        };
        let mut out = String::from("graph TD\n");
        for chain in &chains {
            let did = mermaid_id("d", &chain.decision.id);
            out.push_str(&format!(
                "    {}{{{{{}}}}}:::decision\n",
                did,
                mermaid_label(&chain.decision.prompt)
            ));
            for (action, outcome) in &chain.actions {
                let aid = mermaid_id("a", &action.id);
                out.push_str(&format!(
                    "    {}[{}]:::action\n",
                    aid,
                    mermaid_label(&action.description)
                ));
                out.push_str(&format!("    {did} --> {aid}\n"));
                if let Some(outcome) = outcome {
                    let oid = mermaid_id("o", &outcome.id);
                    let (open, close, class) = match outcome.status {
                        OutcomeStatus::Success => ("(", ")", "success"),
                        OutcomeStatus::Failure => ("((", "))", "failure"),
                        OutcomeStatus::Partial => ("[", "]", "action"),
                    };
                    out.push_str(&format!(
                        "    {oid}{open}{}{close}:::{class}\n",
                        mermaid_label(&outcome.description)
                    ));
                    out.push_str(&format!("    {aid} --> {oid}\n"));
                }
            }
        }
        out.push_str("    classDef decision fill:#e1f5fe\n");
        out.push_str("    classDef action fill:#fff9c4\n");
        out.push_str("    classDef success fill:#c8e6c9\n");
        out.push_str("    classDef failure fill:#ffcdd2\n");
        Ok(out)
    }
}

/// Identifiers sanitized for Mermaid: non-alphanumerics become `_`.
fn mermaid_id(prefix: &str, id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{prefix}_{cleaned}")
}

/// Labels truncated to 64 chars with brackets stripped.
fn mermaid_label(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| match c {
            '{' | '}' | '[' | ']' | '(' | ')' | '"' | '\n' => ' ',
            c => c,
        })
        .collect();
    util::truncate_chars(cleaned.trim(), 64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, CausalStore) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(tmp.path().join("memory")).unwrap());
        (tmp, CausalStore::new(storage, "proj-1"))
    }

    async fn chain(
        store: &CausalStore,
        session: &str,
        agent: &str,
        status: OutcomeStatus,
    ) -> (DecisionNode, ActionNode, OutcomeNode) {
        let decision = store
            .record_decision(session, agent, "fix the parser", "tests failing", 0.8)
            .await
            .unwrap();
        let action = store
            .record_action(
                &decision.id,
                ActionType::FileOperation,
                "edit src/parser.rs",
                json!({ "path": "src/parser.rs" }),
                json!({ "ok": true }),
                12,
            )
            .await
            .unwrap();
        let outcome = store
            .record_outcome(&action.id, status, "done", json!({}), None)
            .await
            .unwrap();
        (decision, action, outcome)
    }

    #[tokio::test]
    async fn test_chain_reachability() {
        let (_tmp, store) = store();
        let (decision, action, outcome) =
            chain(&store, "s1", "build", OutcomeStatus::Success).await;
        let loaded = store.get_causal_chain(&decision.id).unwrap().unwrap();
        assert_eq!(loaded.actions.len(), 1);
        assert_eq!(loaded.actions[0].0.id, action.id);
        assert_eq!(loaded.actions[0].1.as_ref().unwrap().id, outcome.id);
        // Every action has exactly one decision parent.
        assert_eq!(loaded.actions[0].0.decision_id, decision.id);
    }

    #[tokio::test]
    async fn test_action_requires_decision() {
        let (_tmp, store) = store();
        let err = store
            .record_action(
                "ghost",
                ActionType::Other,
                "x",
                json!({}),
                json!({}),
                0,
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_success_rate_two_thirds() {
        let (_tmp, store) = store();
        chain(&store, "s1", "build", OutcomeStatus::Success).await;
        chain(&store, "s1", "build", OutcomeStatus::Success).await;
        chain(&store, "s2", "build", OutcomeStatus::Failure).await;
        chain(&store, "s3", "plan", OutcomeStatus::Failure).await;

        let rate = store.get_success_rate(Some("build")).unwrap();
        assert!((rate - 0.6667).abs() < 1e-4);
        let overall = store.get_success_rate(None).unwrap();
        assert!((overall - 0.5).abs() < 1e-9);
        assert_eq!(store.get_success_rate(Some("ghost")).unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_record_outcome_idempotent() {
        let (_tmp, store) = store();
        let (_d, action, first) = chain(&store, "s1", "build", OutcomeStatus::Success).await;
        let second = store
            .record_outcome(&action.id, OutcomeStatus::Success, "done", json!({}), None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.get_stats().unwrap().outcomes, 1);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let (_tmp, store) = store();
        chain(&store, "s1", "build", OutcomeStatus::Success).await;
        chain(&store, "s2", "plan", OutcomeStatus::Failure).await;

        let by_agent = store
            .query(&CausalQuery {
                agent_id: Some("plan".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_agent.len(), 1);
        assert_eq!(by_agent[0].decision.agent_id, "plan");

        let by_status = store
            .query(&CausalQuery {
                outcome_status: Some(OutcomeStatus::Failure),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_status.len(), 1);

        let by_confidence = store
            .query(&CausalQuery {
                min_confidence: Some(0.9),
                ..Default::default()
            })
            .unwrap();
        assert!(by_confidence.is_empty());
    }

    #[tokio::test]
    async fn test_active_decision_tracking() {
        let (_tmp, store) = store();
        assert!(store.active_decision("s1").is_none());
        let decision = store
            .record_decision("s1", "build", "task", "because", 0.9)
            .await
            .unwrap();
        assert_eq!(store.active_decision("s1").as_deref(), Some(decision.id.as_str()));
    }

    #[tokio::test]
    async fn test_mermaid_shapes() {
        let (_tmp, store) = store();
        chain(&store, "s1", "build", OutcomeStatus::Success).await;
        let (_d, action, _o) = chain(&store, "s1", "build", OutcomeStatus::Failure).await;
        let _ = action;

        let mermaid = store.to_mermaid(Some("s1")).unwrap();
        assert!(mermaid.starts_with("graph TD"));
        assert!(mermaid.contains("{{fix the parser}}"));
        assert!(mermaid.contains("[edit src/parser.rs]"));
        assert!(mermaid.contains("(done):::success"));
        assert!(mermaid.contains("((done)):::failure"));
        assert!(mermaid.contains("classDef decision"));
    }

    #[test]
    fn test_action_type_mapping() {
        assert_eq!(action_type_for_tool("write"), ActionType::FileOperation);
        assert_eq!(action_type_for_tool("grep"), ActionType::Search);
        assert_eq!(action_type_for_tool("bash"), ActionType::ToolExecution);
        assert_eq!(action_type_for_tool("mcp_github"), ActionType::ToolExecution);
        assert_eq!(action_type_for_tool("webfetch"), ActionType::ApiCall);
        assert_eq!(action_type_for_tool("codesearch"), ActionType::CodeChange);
        assert_eq!(action_type_for_tool("question"), ActionType::Other);
    }
}
