//! Local JSON persistence for user flags and conversation history.
//!
//! Data lives in a single JSON file (default `persistence/bot_data.json`)
//! that is rewritten atomically on every mutation. When no persistence path
//! is configured the store runs in memory only and data is lost on restart.

use crate::config::get_history_max_turns;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Errors from the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Serialization or deserialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One question/answer exchange with the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationTurn {
    /// Telegram chat the exchange happened in
    pub chat_id: i64,
    /// Telegram user who asked
    pub user_id: i64,
    /// The user's message as forwarded to the backend
    pub message: String,
    /// The backend's answer
    pub response: String,
    /// When the turn was recorded
    pub timestamp: DateTime<Utc>,
}

/// Per-user persisted flags
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserFlags {
    /// Whether source references are appended to answers for this user
    #[serde(default)]
    pub debug_mode: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BotData {
    #[serde(default)]
    user_flags: HashMap<i64, UserFlags>,
    #[serde(default)]
    history: HashMap<i64, Vec<ConversationTurn>>,
}

/// File-backed store shared across handlers
pub struct JsonStore {
    path: Option<PathBuf>,
    data: RwLock<BotData>,
}

impl JsonStore {
    /// Open the store at `path`, creating parent directories as needed.
    ///
    /// An unreadable or corrupt file is logged and replaced with an empty
    /// store rather than aborting startup. `None` opens a memory-only store.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub async fn open(path: Option<PathBuf>) -> Result<Self, StorageError> {
        let Some(path) = path else {
            warn!("Persistence not configured; user data will be lost on restart.");
            return Ok(Self {
                path: None,
                data: RwLock::new(BotData::default()),
            });
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let data = match Self::load(&path).await {
            Ok(Some(data)) => {
                info!("Loaded persisted bot data from {}", path.display());
                data
            }
            Ok(None) => BotData::default(),
            Err(e) => {
                warn!(
                    "Could not read persisted data from {} ({e}); starting empty.",
                    path.display()
                );
                BotData::default()
            }
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    async fn load(path: &Path) -> Result<Option<BotData>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite the backing file via a temp file + rename so a crash mid-write
    /// never leaves a truncated store behind.
    async fn flush(&self, data: &BotData) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let body = serde_json::to_string_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Whether debug mode is enabled for `user_id`
    pub async fn debug_mode(&self, user_id: i64) -> bool {
        self.data
            .read()
            .await
            .user_flags
            .get(&user_id)
            .is_some_and(|f| f.debug_mode)
    }

    /// Persist the debug flag for `user_id`
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be written.
    pub async fn set_debug_mode(&self, user_id: i64, enabled: bool) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.user_flags.entry(user_id).or_default().debug_mode = enabled;
        self.flush(&data).await
    }

    /// Append a conversation turn, dropping the oldest once the per-chat cap
    /// is reached.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be written.
    pub async fn record_turn(&self, turn: ConversationTurn) -> Result<(), StorageError> {
        let cap = get_history_max_turns();
        let mut data = self.data.write().await;
        let turns = data.history.entry(turn.chat_id).or_default();
        turns.push(turn);
        if turns.len() > cap {
            let excess = turns.len() - cap;
            turns.drain(..excess);
        }
        self.flush(&data).await
    }

    /// Recorded turns for `chat_id`, oldest first
    pub async fn history(&self, chat_id: i64) -> Vec<ConversationTurn> {
        self.data
            .read()
            .await
            .history
            .get(&chat_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn turn(chat_id: i64, n: usize) -> ConversationTurn {
        ConversationTurn {
            chat_id,
            user_id: 42,
            message: format!("pregunta {n}"),
            response: format!("respuesta {n}"),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_across_reopen() -> Result<(), StorageError> {
        let dir = tempdir()?;
        let path = dir.path().join("persistence").join("bot_data.json");

        {
            let store = JsonStore::open(Some(path.clone())).await?;
            store.set_debug_mode(42, true).await?;
            store.record_turn(turn(-100, 1)).await?;
            store.record_turn(turn(-100, 2)).await?;
        }

        let store = JsonStore::open(Some(path)).await?;
        assert!(store.debug_mode(42).await);
        assert!(!store.debug_mode(43).await);

        let history = store.history(-100).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "pregunta 1");
        assert_eq!(history[1].response, "respuesta 2");
        assert!(store.history(-200).await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_history_is_capped() -> Result<(), StorageError> {
        let dir = tempdir()?;
        let path = dir.path().join("bot_data.json");
        let store = JsonStore::open(Some(path)).await?;

        for n in 0..(HISTORY_CAP_FOR_TEST + 5) {
            store.record_turn(turn(7, n)).await?;
        }

        let history = store.history(7).await;
        assert_eq!(history.len(), HISTORY_CAP_FOR_TEST);
        // Oldest turns were dropped
        assert_eq!(history[0].message, "pregunta 5");
        Ok(())
    }

    const HISTORY_CAP_FOR_TEST: usize = crate::config::HISTORY_MAX_TURNS;

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() -> Result<(), StorageError> {
        let dir = tempdir()?;
        let path = dir.path().join("bot_data.json");
        tokio::fs::write(&path, b"{ not json").await?;

        let store = JsonStore::open(Some(path)).await?;
        assert!(store.history(1).await.is_empty());

        // The store is still writable after recovering from corruption
        store.record_turn(turn(1, 0)).await?;
        assert_eq!(store.history(1).await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_only_mode() -> Result<(), StorageError> {
        let store = JsonStore::open(None).await?;
        store.set_debug_mode(9, true).await?;
        assert!(store.debug_mode(9).await);
        store.record_turn(turn(9, 0)).await?;
        assert_eq!(store.history(9).await.len(), 1);
        Ok(())
    }
}
