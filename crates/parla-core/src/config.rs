//! Application configuration.
//!
//! Precedence: environment (`PARLA__*`) > file at `PARLA_CONFIG` (default `config/parla`) > defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// BCP-47 tag for replies, recognition and synthesis.
    pub language: String,
    /// Sign-in is mocked; every session belongs to this user.
    pub user_id: String,
    pub storage_path: String,
    /// Falls back to `GEMINI_API_KEY` when unset.
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub image_model: String,
    pub video_model: String,
    pub api_base: String,
    /// Limit on an attachment after base64 encoding.
    pub max_attachment_bytes: usize,
    pub video_poll_interval_secs: u64,
    pub classify_max_attempts: u32,
    pub classify_backoff_ms: u64,
    pub image_probe_timeout_ms: u64,
    /// Ground chat answers in web search (citations become message sources).
    pub chat_web_search: bool,
    /// Number of earlier messages sent as conversation context.
    pub history_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            language: "ar-SA".to_string(),
            user_id: "guest".to_string(),
            storage_path: "./data".to_string(),
            gemini_api_key: None,
            chat_model: "gemini-2.5-flash".to_string(),
            image_model: "gemini-2.5-flash-image".to_string(),
            video_model: "veo-3.0-fast-generate-001".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            max_attachment_bytes: 20 * 1024 * 1024,
            video_poll_interval_secs: 10,
            classify_max_attempts: 3,
            classify_backoff_ms: 750,
            image_probe_timeout_ms: 5000,
            chat_web_search: true,
            history_limit: 20,
        }
    }
}

impl AppConfig {
    /// Load config from file and environment.
    pub fn load() -> Result<Self, ::config::ConfigError> {
        let config_path =
            std::env::var("PARLA_CONFIG").unwrap_or_else(|_| "config/parla".to_string());
        let d = Self::default();
        let built = ::config::Config::builder()
            .set_default("language", d.language)?
            .set_default("user_id", d.user_id)?
            .set_default("storage_path", d.storage_path)?
            .set_default("chat_model", d.chat_model)?
            .set_default("image_model", d.image_model)?
            .set_default("video_model", d.video_model)?
            .set_default("api_base", d.api_base)?
            .set_default("max_attachment_bytes", d.max_attachment_bytes as i64)?
            .set_default("video_poll_interval_secs", d.video_poll_interval_secs as i64)?
            .set_default("classify_max_attempts", d.classify_max_attempts as i64)?
            .set_default("classify_backoff_ms", d.classify_backoff_ms as i64)?
            .set_default("image_probe_timeout_ms", d.image_probe_timeout_ms as i64)?
            .set_default("chat_web_search", d.chat_web_search)?
            .set_default("history_limit", d.history_limit as i64)?
            .add_source(::config::File::with_name(&config_path).required(false))
            .add_source(::config::Environment::with_prefix("PARLA").separator("__"))
            .build()?;

        let mut cfg: Self = built.try_deserialize()?;
        if cfg.gemini_api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            cfg.gemini_api_key = std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty());
        }
        Ok(cfg)
    }

    pub fn video_poll_interval(&self) -> Duration {
        Duration::from_secs(self.video_poll_interval_secs)
    }

    pub fn classify_backoff(&self) -> Duration {
        Duration::from_millis(self.classify_backoff_ms)
    }

    pub fn image_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.image_probe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = AppConfig::default();
        assert_eq!(c.language, "ar-SA");
        assert_eq!(c.user_id, "guest");
        assert_eq!(c.max_attachment_bytes, 20 * 1024 * 1024);
        assert_eq!(c.video_poll_interval(), Duration::from_secs(10));
        assert_eq!(c.classify_max_attempts, 3);
        assert_eq!(c.classify_backoff(), Duration::from_millis(750));
    }
}
