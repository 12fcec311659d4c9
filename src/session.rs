//! Per-(team, instance) session state: persisted working directory, the
//! bounded command history, and the pending interactive mode tag.

use crate::store::{KvStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// History keeps the most recent 50 entries; older ones are discarded.
pub const HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub command: String,
    pub output: String,
}

fn cwd_key(team_id: &str, instance_id: &str) -> String {
    format!("cwd:{team_id}:{instance_id}")
}

fn history_key(team_id: &str, instance_id: &str) -> String {
    format!("history:{team_id}:{instance_id}")
}

fn mode_key(team_id: &str, instance_id: &str) -> String {
    format!("mode:{team_id}:{instance_id}")
}

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Current working directory, or empty if unset. A stored value that is
    /// not a path shape (an error string persisted by an earlier bug, say)
    /// is deleted and treated as unset.
    pub async fn cwd(&self, team_id: &str, instance_id: &str) -> Result<String, StoreError> {
        let key = cwd_key(team_id, instance_id);
        let cwd = self.store.get(&key).await?.unwrap_or_default();
        if !cwd.is_empty() && !cwd.starts_with('/') && !cwd.starts_with('~') {
            warn!(team_id, instance_id, cwd, "corrupted cwd, resetting");
            self.store.del(&key).await?;
            return Ok(String::new());
        }
        Ok(cwd)
    }

    pub async fn set_cwd(
        &self,
        team_id: &str,
        instance_id: &str,
        cwd: &str,
    ) -> Result<(), StoreError> {
        self.store.set(&cwd_key(team_id, instance_id), cwd).await
    }

    /// Append one entry and trim the list to the last 50.
    pub async fn append_history(
        &self,
        team_id: &str,
        instance_id: &str,
        entry: &HistoryEntry,
    ) -> Result<(), StoreError> {
        let key = history_key(team_id, instance_id);
        let encoded = serde_json::to_string(entry)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.store.rpush(&key, &encoded).await?;
        self.store.ltrim(&key, -HISTORY_LIMIT, -1).await
    }

    /// Oldest-first history, capped at 50 entries. Legacy plain-string
    /// entries decode as a command with empty output.
    pub async fn history(
        &self,
        team_id: &str,
        instance_id: &str,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let key = history_key(team_id, instance_id);
        let raw = self.store.lrange(&key, 0, HISTORY_LIMIT - 1).await?;
        Ok(raw
            .into_iter()
            .map(|item| {
                serde_json::from_str(&item).unwrap_or(HistoryEntry {
                    command: item,
                    output: String::new(),
                })
            })
            .collect())
    }

    pub async fn clear_history(&self, team_id: &str, instance_id: &str) -> Result<(), StoreError> {
        self.store.del(&history_key(team_id, instance_id)).await
    }

    /// Consume the pending interactive mode, if one was armed by the
    /// previous request.
    pub async fn take_pending_mode(
        &self,
        team_id: &str,
        instance_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let key = mode_key(team_id, instance_id);
        let mode = self.store.get(&key).await?;
        if mode.is_some() {
            self.store.del(&key).await?;
        }
        Ok(mode)
    }

    pub async fn set_pending_mode(
        &self,
        team_id: &str,
        instance_id: &str,
        mode: &str,
    ) -> Result<(), StoreError> {
        self.store.set(&mode_key(team_id, instance_id), mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn history_is_bounded_fifo() {
        let sessions = store();
        for i in 0..60 {
            sessions
                .append_history(
                    "alpha",
                    "i1",
                    &HistoryEntry {
                        command: format!("cmd{i}"),
                        output: String::new(),
                    },
                )
                .await
                .unwrap();
        }
        let history = sessions.history("alpha", "i1").await.unwrap();
        assert_eq!(history.len(), 50);
        // Oldest entries were evicted first.
        assert_eq!(history[0].command, "cmd10");
        assert_eq!(history[49].command, "cmd59");
    }

    #[tokio::test]
    async fn corrupted_cwd_is_reset() {
        let sessions = store();
        sessions
            .set_cwd("alpha", "i1", "Error: permission denied")
            .await
            .unwrap();
        assert_eq!(sessions.cwd("alpha", "i1").await.unwrap(), "");
        // The bad value was deleted, not just masked.
        assert_eq!(sessions.cwd("alpha", "i1").await.unwrap(), "");
    }

    #[tokio::test]
    async fn tilde_and_absolute_cwds_are_kept() {
        let sessions = store();
        sessions.set_cwd("a", "i", "/home/guest").await.unwrap();
        assert_eq!(sessions.cwd("a", "i").await.unwrap(), "/home/guest");
        sessions.set_cwd("a", "i", "~/decode").await.unwrap();
        assert_eq!(sessions.cwd("a", "i").await.unwrap(), "~/decode");
    }

    #[tokio::test]
    async fn legacy_history_entries_normalize() {
        let sessions = store();
        let store = sessions.store.clone();
        store.rpush("history:a:i", "ls -la").await.unwrap();
        sessions
            .append_history(
                "a",
                "i",
                &HistoryEntry {
                    command: "pwd".into(),
                    output: "/home/guest\n".into(),
                },
            )
            .await
            .unwrap();
        let history = sessions.history("a", "i").await.unwrap();
        assert_eq!(
            history[0],
            HistoryEntry {
                command: "ls -la".into(),
                output: String::new(),
            }
        );
        assert_eq!(history[1].output, "/home/guest\n");
    }

    #[tokio::test]
    async fn pending_mode_is_consumed_once() {
        let sessions = store();
        sessions.set_pending_mode("a", "i", "breaking_bad").await.unwrap();
        assert_eq!(
            sessions.take_pending_mode("a", "i").await.unwrap(),
            Some("breaking_bad".to_string())
        );
        assert_eq!(sessions.take_pending_mode("a", "i").await.unwrap(), None);
    }
}
