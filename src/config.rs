//! Configuration and settings management
//!
//! Loads settings from environment variables (optionally via `.env`) and
//! defines tunable constants for the Telegram retry policy and the
//! conversation history cap.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_bot_token: String,

    /// Base URL of the KellyBot backend API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bearer key used to authenticate against the KellyBot API
    pub api_access_key: String,

    /// Connect timeout for backend calls, in seconds
    #[serde(default = "default_connect_timeout")]
    pub api_timeout_connect_secs: f64,

    /// Read timeout for backend calls, in seconds. The backend runs a RAG
    /// pipeline, so answers can take a while.
    #[serde(default = "default_read_timeout")]
    pub api_timeout_read_secs: f64,

    /// Word that must appear in a group message for the bot to react
    #[serde(default = "default_trigger_word")]
    pub trigger_word: Option<String>,

    /// Comma-separated list of user IDs allowed to toggle debug mode
    #[serde(rename = "authorized_debug_users")]
    pub authorized_debug_users_str: Option<String>,

    /// Where user flags and conversation history are persisted
    #[serde(default = "default_persistence_path")]
    pub persistence_file_path: Option<PathBuf>,
}

fn default_api_url() -> String {
    "http://localhost:8000".to_string()
}

const fn default_connect_timeout() -> f64 {
    10.0
}

const fn default_read_timeout() -> f64 {
    180.0
}

fn default_trigger_word() -> Option<String> {
    Some("kelly".to_string())
}

fn default_persistence_path() -> Option<PathBuf> {
    Some(PathBuf::from("persistence/bot_data.json"))
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use kelly_telegram_bot::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or a required key is missing.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Optional configuration files, lowest priority first
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Local overrides, not checked into git
            .add_source(File::with_name("config/local").required(false))
            // Environment variables win over files.
            // Environment::default() auto-converts UPPER_SNAKE_CASE to snake_case;
            // ignore_empty treats empty env vars as unset.
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Returns the set of Telegram user IDs allowed to use `/debug`
    #[must_use]
    pub fn debug_users(&self) -> HashSet<i64> {
        self.authorized_debug_users_str
            .as_ref()
            .map(|s| {
                s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|token| !token.is_empty())
                    .filter_map(|id| id.parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// Telegram API retry policy defaults (see utils::retry_telegram_operation)
/// Max retry attempts for transient Telegram API failures
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;
/// Initial backoff delay in milliseconds
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Maximum backoff delay in milliseconds
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;

/// Conversation turns kept per chat before the oldest are dropped
pub const HISTORY_MAX_TURNS: usize = 50;

/// Get the max Telegram retry attempts from env or default.
///
/// Environment variable: `TELEGRAM_API_MAX_RETRIES`.
#[must_use]
pub fn get_telegram_max_retries() -> usize {
    std::env::var("TELEGRAM_API_MAX_RETRIES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(TELEGRAM_API_MAX_RETRIES)
}

/// Get the per-chat history cap from env or default.
///
/// Environment variable: `HISTORY_MAX_TURNS`.
#[must_use]
pub fn get_history_max_turns() -> usize {
    std::env::var("HISTORY_MAX_TURNS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(HISTORY_MAX_TURNS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // These tests touch process-wide environment variables; keep every
    // env-dependent assertion inside this single test to avoid races.
    #[test]
    fn test_config_env_loading() -> Result<(), Box<dyn std::error::Error>> {
        env::set_var("TELEGRAM_BOT_TOKEN", "dummy_token");
        env::set_var("API_ACCESS_KEY", "dummy_key");
        env::set_var("API_URL", "https://kelly.example.com");

        let settings = Settings::new()?;
        assert_eq!(settings.telegram_bot_token, "dummy_token");
        assert_eq!(settings.api_url, "https://kelly.example.com");
        assert_eq!(settings.api_timeout_connect_secs, 10.0);
        assert_eq!(settings.api_timeout_read_secs, 180.0);
        assert_eq!(settings.trigger_word.as_deref(), Some("kelly"));
        assert_eq!(
            settings.persistence_file_path,
            Some(PathBuf::from("persistence/bot_data.json"))
        );

        // Empty env var is treated as unset, so the default URL applies
        env::set_var("API_URL", "");
        let settings = Settings::new()?;
        assert_eq!(settings.api_url, "http://localhost:8000");

        env::remove_var("TELEGRAM_BOT_TOKEN");
        env::remove_var("API_ACCESS_KEY");
        env::remove_var("API_URL");
        Ok(())
    }

    #[test]
    fn test_debug_users_parsing() {
        let mut settings = Settings {
            telegram_bot_token: "dummy".to_string(),
            api_url: default_api_url(),
            api_access_key: "dummy".to_string(),
            api_timeout_connect_secs: 10.0,
            api_timeout_read_secs: 180.0,
            trigger_word: None,
            authorized_debug_users_str: None,
            persistence_file_path: None,
        };

        assert!(settings.debug_users().is_empty());

        // Comma
        settings.authorized_debug_users_str = Some("123,456".to_string());
        let users = settings.debug_users();
        assert!(users.contains(&123));
        assert!(users.contains(&456));
        assert_eq!(users.len(), 2);

        // Semicolon and whitespace mixed
        settings.authorized_debug_users_str = Some("333; 444 555".to_string());
        let users = settings.debug_users();
        assert!(users.contains(&333));
        assert!(users.contains(&444));
        assert!(users.contains(&555));
        assert_eq!(users.len(), 3);

        // Invalid tokens are skipped
        settings.authorized_debug_users_str = Some("abc, 777".to_string());
        let users = settings.debug_users();
        assert!(users.contains(&777));
        assert_eq!(users.len(), 1);
    }
}
