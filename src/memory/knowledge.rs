use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::Storage;
use crate::util;

// ---------------------------------------------------------------------------
// Structured project knowledge: endpoints, models, components, notes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub id: String,
    pub method: String,
    pub path: String,
    pub file: Option<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataModel {
    pub id: String,
    pub name: String,
    pub file: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub file: Option<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeCounts {
    pub endpoints: usize,
    pub models: usize,
    pub components: usize,
    pub notes: usize,
}

pub struct KnowledgeStore {
    storage: Arc<Storage>,
}

impl KnowledgeStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn add_endpoint(&self, method: &str, path: &str, file: Option<&str>) -> Result<ApiEndpoint> {
        let endpoint = ApiEndpoint {
            id: util::new_id(),
            method: method.to_uppercase(),
            path: path.to_string(),
            file: file.map(str::to_string),
            created_at: util::now_ts_secs(),
        };
        self.storage
            .write_as(&["knowledge", "endpoint", &endpoint.id], &endpoint)?;
        Ok(endpoint)
    }

    pub fn add_model(&self, name: &str, file: Option<&str>, fields: Vec<String>) -> Result<DataModel> {
        let model = DataModel {
            id: util::new_id(),
            name: name.to_string(),
            file: file.map(str::to_string),
            fields,
            created_at: util::now_ts_secs(),
        };
        self.storage
            .write_as(&["knowledge", "model", &model.id], &model)?;
        Ok(model)
    }

    pub fn add_component(&self, name: &str, kind: &str, file: Option<&str>) -> Result<Component> {
        let component = Component {
            id: util::new_id(),
            name: name.to_string(),
            kind: kind.to_string(),
            file: file.map(str::to_string),
            created_at: util::now_ts_secs(),
        };
        self.storage
            .write_as(&["knowledge", "component", &component.id], &component)?;
        Ok(component)
    }

    pub fn add_note(&self, text: &str, tags: Vec<String>) -> Result<Note> {
        let note = Note {
            id: util::new_id(),
            text: text.to_string(),
            tags,
            created_at: util::now_ts_secs(),
        };
        self.storage.write_as(&["knowledge", "note", &note.id], &note)?;
        Ok(note)
    }

    pub fn counts(&self) -> Result<KnowledgeCounts> {
        Ok(KnowledgeCounts {
            endpoints: self.storage.list(&["knowledge", "endpoint"])?.len(),
            models: self.storage.list(&["knowledge", "model"])?.len(),
            components: self.storage.list(&["knowledge", "component"])?.len(),
            notes: self.storage.list(&["knowledge", "note"])?.len(),
        })
    }

    pub fn notes(&self) -> Result<Vec<Note>> {
        let mut notes = Vec::new();
        for key in self.storage.list(&["knowledge", "note"])? {
            let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(note) = self.storage.read_as::<Note>(&borrowed)? {
                notes.push(note);
            }
        }
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_track_additions() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(tmp.path().join("memory")).unwrap());
        let store = KnowledgeStore::new(storage);

        store.add_endpoint("get", "/api/users", Some("src/api.ts")).unwrap();
        store.add_endpoint("post", "/api/users", Some("src/api.ts")).unwrap();
        store.add_model("User", Some("src/models.ts"), vec!["id".into(), "email".into()]).unwrap();
        store.add_component("UserList", "view", None).unwrap();
        store.add_note("auth tokens rotate hourly", vec!["auth".into()]).unwrap();

        let counts = store.counts().unwrap();
        assert_eq!(
            counts,
            KnowledgeCounts {
                endpoints: 2,
                models: 1,
                components: 1,
                notes: 1
            }
        );
        assert_eq!(store.notes().unwrap()[0].text, "auth tokens rotate hourly");
    }
}
