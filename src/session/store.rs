//! On-disk session persistence
//!
//! The session file is shared with other tools (tunnel URLs and the like
//! are written next to the session keys), so every write is a
//! read-merge-write that only touches `sessionId` and `history`.

use super::types::{ConversationEntry, Session};
use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

const SESSION_ID_KEY: &str = "sessionId";
const HISTORY_KEY: &str = "history";
/// Older files stored history under this key
const LEGACY_HISTORY_KEY: &str = "conversationHistory";

/// JSON-file backed session store
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the session, falling back to an empty one.
    ///
    /// Never fails: a missing or unparsable file yields an empty session
    /// and malformed history entries are dropped.
    pub fn load(&self) -> Session {
        let doc = match self.read_document() {
            Ok(Some(doc)) => doc,
            Ok(None) => return Session::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Failed to load session: {}", e);
                return Session::default();
            }
        };

        let session_id = doc
            .get(SESSION_ID_KEY)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let raw_history = doc
            .get(HISTORY_KEY)
            .or_else(|| doc.get(LEGACY_HISTORY_KEY))
            .and_then(Value::as_array);

        let mut history = Vec::new();
        if let Some(items) = raw_history {
            for item in items {
                match serde_json::from_value::<ConversationEntry>(item.clone()) {
                    Ok(entry) => history.push(entry),
                    Err(e) => tracing::debug!("Skipping malformed history entry: {}", e),
                }
            }
        }

        if let Some(id) = &session_id {
            tracing::info!(session_id = %id, "Loaded session");
        }
        if !history.is_empty() {
            tracing::info!(count = history.len(), "Loaded history entries");
        }

        Session {
            session_id,
            history,
        }
    }

    /// Persist the session id and history, preserving every other key
    pub fn save(&self, session_id: Option<&str>, history: &[ConversationEntry]) -> Result<()> {
        let mut doc = self.read_document()?.unwrap_or_default();
        doc.insert(
            SESSION_ID_KEY.to_string(),
            session_id.map_or(Value::Null, |id| Value::String(id.to_string())),
        );
        doc.insert(HISTORY_KEY.to_string(), serde_json::to_value(history)?);
        doc.remove(LEGACY_HISTORY_KEY);
        self.write_document(&doc)?;
        tracing::debug!(count = history.len(), "Saved session");
        Ok(())
    }

    /// Remove the owned keys, leaving the rest of the document intact
    pub fn clear(&self) -> Result<()> {
        let Some(mut doc) = self.read_document()? else {
            return Ok(());
        };
        doc.remove(SESSION_ID_KEY);
        doc.remove(HISTORY_KEY);
        doc.remove(LEGACY_HISTORY_KEY);
        self.write_document(&doc)
    }

    fn read_document(&self) -> Result<Option<Map<String, Value>>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Some(Map::new()));
        }
        match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => Ok(Some(map)),
            _ => Err(Error::Session(format!(
                "{} does not contain a JSON object",
                self.path.display()
            ))),
        }
    }

    fn write_document(&self, doc: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut json = serde_json::to_string_pretty(doc)?;
        json.push('\n');

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> SessionStore {
        SessionStore::new(dir.path().join(".airdock.local.json"))
    }

    fn read_json(store: &SessionStore) -> Value {
        serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap()
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let session = store_in(&dir).load();
        assert!(session.session_id.is_none());
        assert!(session.history.is_empty());
    }

    #[test]
    fn test_load_unparsable_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{ not json").unwrap();
        assert_eq!(store.load(), Session::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let history = vec![
            ConversationEntry::user("add a button", None),
            ConversationEntry::assistant("Sure, adding it."),
        ];
        store.save(Some("sess-1"), &history).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.session_id.as_deref(), Some("sess-1"));
        assert_eq!(loaded.history, history);
    }

    #[test]
    fn test_save_preserves_unrelated_keys() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), r#"{"tunnelUrl": "x"}"#).unwrap();

        store.save(Some("first"), &[]).unwrap();
        store
            .save(Some("second"), &[ConversationEntry::assistant("ok")])
            .unwrap();

        let doc = read_json(&store);
        assert_eq!(doc["tunnelUrl"], "x");
        assert_eq!(doc["sessionId"], "second");
        assert_eq!(doc["history"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_save_replaces_legacy_key() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(
            store.path(),
            json!({
                "sessionId": "old",
                "conversationHistory": [{"role": "user", "content": "hi", "timestamp": 1}]
            })
            .to_string(),
        )
        .unwrap();

        let loaded = store.load();
        assert_eq!(loaded.history.len(), 1);

        store.save(loaded.session_id.as_deref(), &loaded.history).unwrap();
        let doc = read_json(&store);
        assert!(doc.get("conversationHistory").is_none());
        assert_eq!(doc["history"][0]["content"], "hi");
    }

    #[test]
    fn test_load_skips_malformed_entries() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(
            store.path(),
            json!({
                "history": [
                    {"role": "user", "content": "kept", "timestamp": 1},
                    {"role": "alien", "content": "dropped"},
                    42
                ]
            })
            .to_string(),
        )
        .unwrap();

        let loaded = store.load();
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.history[0].content(), Some("kept"));
    }

    #[test]
    fn test_clear_keeps_other_keys() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), r#"{"tunnelUrl": "x", "widgetMetroUrl": "y"}"#).unwrap();
        store
            .save(Some("s"), &[ConversationEntry::assistant("a")])
            .unwrap();

        store.clear().unwrap();

        let doc = read_json(&store);
        assert!(doc.get("sessionId").is_none());
        assert!(doc.get("history").is_none());
        assert_eq!(doc["tunnelUrl"], "x");
        assert_eq!(doc["widgetMetroUrl"], "y");
    }

    #[test]
    fn test_clear_missing_file_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.clear().unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_save_over_non_object_fails() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "[1, 2, 3]").unwrap();
        assert!(matches!(store.save(None, &[]), Err(Error::Session(_))));
    }
}
