//! Voice mode configuration.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PARLA_VOICE_LANGUAGE | ar-SA | BCP-47 tag for recognition and voice selection. |
//! | PARLA_VOICE_SILENCE_THRESHOLD | 0.02 | Mean absolute deviation above which a frame counts as voice. |
//! | PARLA_VOICE_PAUSE_MS | 1500 | Silence after speech before the turn is handed off. |
//! | PARLA_VOICE_FRAME_MS | 16 | VAD sampling cadence. |
//! | PARLA_VOICE_MAX_SILENT_RESTARTS | unset | Bound on recognition restarts without speech (unset = unbounded). |

use std::time::Duration;

/// Settings shared by the VAD engine, the recognizer adapter and the synthesizer adapter.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Language tag bound to recognition and used to pick a synthesis voice.
    pub language: String,
    /// Energy (mean absolute deviation from `signal_midpoint`) above which a frame is voice.
    pub silence_threshold: f32,
    /// Resting level of the signal. 0.0 for f32 PCM.
    pub signal_midpoint: f32,
    /// How long the signal must stay quiet after speech before the turn is committed.
    pub pause: Duration,
    /// Sampling cadence of the VAD loop.
    pub frame_interval: Duration,
    /// Maximum consecutive recognition restarts with an empty transcript. `None` keeps restarting.
    pub max_silent_restarts: Option<u32>,
    /// Relative pitch jitter applied per utterance (0.10 = ±10%).
    pub pitch_jitter: f32,
    /// Relative rate jitter applied per utterance (0.05 = ±5%).
    pub rate_jitter: f32,
    /// Delay before re-reading an empty voice catalog.
    pub voice_list_retry_delay: Duration,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            language: "ar-SA".to_string(),
            silence_threshold: 0.02,
            signal_midpoint: 0.0,
            pause: Duration::from_millis(1500),
            frame_interval: Duration::from_millis(16),
            max_silent_restarts: None,
            pitch_jitter: 0.10,
            rate_jitter: 0.05,
            voice_list_retry_delay: Duration::from_millis(250),
        }
    }
}

impl VoiceConfig {
    /// Load from environment. Unset or invalid values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            language: env_opt_string("PARLA_VOICE_LANGUAGE").unwrap_or(defaults.language),
            silence_threshold: env_f32("PARLA_VOICE_SILENCE_THRESHOLD")
                .unwrap_or(defaults.silence_threshold)
                .max(0.0),
            pause: env_u64("PARLA_VOICE_PAUSE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.pause),
            frame_interval: env_u64("PARLA_VOICE_FRAME_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.frame_interval),
            max_silent_restarts: env_u64("PARLA_VOICE_MAX_SILENT_RESTARTS").map(|n| n as u32),
            ..defaults
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_f32(name: &str) -> Option<f32> {
    env_opt_string(name).and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    env_opt_string(name).and_then(|v| v.parse().ok())
}
