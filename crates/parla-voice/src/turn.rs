//! Gap logic for segmenting a continuous audio stream into utterances.
//!
//! Used by the cloud recognition engine: speech, then a pause of
//! `gap` (700 ms by default), commits the buffered audio as one segment.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Configuration for segment detection
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Energy above which a frame counts as speech.
    pub speech_threshold: f32,

    /// Silence duration before committing a segment (default: 700ms)
    pub gap: Duration,

    /// Shorter bursts are dropped as clicks or breaths (default: 200ms)
    pub min_speech_duration: Duration,

    /// Segments are force-committed at this length (default: 30s)
    pub max_segment_duration: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.02,
            gap: Duration::from_millis(700),
            min_speech_duration: Duration::from_millis(200),
            max_segment_duration: Duration::from_secs(30),
        }
    }
}

/// A committed span of speech.
#[derive(Debug, Clone)]
pub struct CommittedTurn {
    pub duration: Duration,
    pub samples: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    Idle,
    Speaking,
    SilenceDetected,
}

/// Idle -> Speaking -> SilenceDetected -> (commit | resume).
#[derive(Debug)]
pub struct TurnDetector {
    config: TurnConfig,
    state: TurnState,
    speech_start: Option<Instant>,
    last_speech: Option<Instant>,
    buffer: Vec<f32>,
}

impl TurnDetector {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            state: TurnState::Idle,
            speech_start: None,
            last_speech: None,
            buffer: Vec::new(),
        }
    }

    /// Feed one frame with its energy level.
    pub fn push(&mut self, level: f32, chunk: &[f32], now: Instant) -> Option<CommittedTurn> {
        let is_speech = level > self.config.speech_threshold;
        match (self.state, is_speech) {
            (TurnState::Idle, true) => {
                debug!(target: "parla::recognizer", "segment started");
                self.state = TurnState::Speaking;
                self.speech_start = Some(now);
                self.last_speech = Some(now);
                self.buffer.clear();
                self.buffer.extend_from_slice(chunk);
            }
            (TurnState::Speaking, true) | (TurnState::SilenceDetected, true) => {
                self.state = TurnState::Speaking;
                self.last_speech = Some(now);
                self.buffer.extend_from_slice(chunk);
                let started = self.speech_start.unwrap_or(now);
                if now.duration_since(started) >= self.config.max_segment_duration {
                    debug!(target: "parla::recognizer", "max segment length reached");
                    return self.commit(now);
                }
            }
            (TurnState::Speaking, false) => {
                self.state = TurnState::SilenceDetected;
                // Trailing silence stays in the segment so words are not clipped.
                self.buffer.extend_from_slice(chunk);
            }
            (TurnState::SilenceDetected, false) => {
                self.buffer.extend_from_slice(chunk);
                let last = self.last_speech.unwrap_or(now);
                if now.duration_since(last) >= self.config.gap {
                    return self.commit(now);
                }
            }
            (TurnState::Idle, false) => {}
        }
        None
    }

    /// Commit whatever is buffered (used when recognition is stopped mid-utterance).
    pub fn flush(&mut self, now: Instant) -> Option<CommittedTurn> {
        if self.state == TurnState::Idle {
            return None;
        }
        self.commit(now)
    }

    pub fn is_idle(&self) -> bool {
        self.state == TurnState::Idle
    }

    fn commit(&mut self, now: Instant) -> Option<CommittedTurn> {
        let speech = match (self.speech_start, self.last_speech) {
            (Some(start), Some(last)) => last.duration_since(start),
            _ => Duration::ZERO,
        };
        let duration = self
            .speech_start
            .map(|start| now.duration_since(start))
            .unwrap_or_default();
        let samples = std::mem::take(&mut self.buffer);
        self.reset();

        if speech < self.config.min_speech_duration {
            debug!(target: "parla::recognizer", ?speech, "speech too short, dropping segment");
            return None;
        }
        debug!(target: "parla::recognizer", ?duration, samples = samples.len(), "segment committed");
        Some(CommittedTurn { duration, samples })
    }

    fn reset(&mut self) {
        self.state = TurnState::Idle;
        self.speech_start = None;
        self.last_speech = None;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn commits_after_gap() {
        let mut d = TurnDetector::new(TurnConfig::default());
        let t0 = Instant::now();
        let loud = vec![0.5f32; 480];
        let quiet = vec![0.0f32; 480];

        assert!(d.push(0.5, &loud, t0).is_none());
        assert!(d.push(0.5, &loud, t0 + ms(300)).is_none());
        assert!(d.push(0.0, &quiet, t0 + ms(400)).is_none());
        assert!(d.push(0.0, &quiet, t0 + ms(900)).is_none());
        let turn = d.push(0.0, &quiet, t0 + ms(1000)).expect("committed");
        assert_eq!(turn.samples.len(), 480 * 5);
        assert!(d.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_speech_keeps_segment_open() {
        let mut d = TurnDetector::new(TurnConfig::default());
        let t0 = Instant::now();
        let chunk = vec![0.0f32; 10];
        d.push(0.5, &chunk, t0);
        d.push(0.0, &chunk, t0 + ms(250));
        d.push(0.5, &chunk, t0 + ms(600));
        assert!(d.push(0.0, &chunk, t0 + ms(1200)).is_none());
        assert!(d.push(0.0, &chunk, t0 + ms(1301)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn short_bursts_are_dropped() {
        let mut d = TurnDetector::new(TurnConfig::default());
        let t0 = Instant::now();
        let chunk = vec![0.0f32; 10];
        d.push(0.5, &chunk, t0);
        d.push(0.0, &chunk, t0 + ms(50));
        assert!(d.push(0.0, &chunk, t0 + ms(800)).is_none());
        assert!(d.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_commits_open_segment() {
        let mut d = TurnDetector::new(TurnConfig::default());
        let t0 = Instant::now();
        let chunk = vec![0.0f32; 10];
        d.push(0.5, &chunk, t0);
        d.push(0.5, &chunk, t0 + ms(400));
        assert!(d.flush(t0 + ms(450)).is_some());
        assert!(d.flush(t0 + ms(500)).is_none());
    }
}
