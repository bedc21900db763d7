//! Speech recognizer adapter.
//!
//! Wraps a platform [`RecognitionEngine`] and enforces single-instance discipline:
//! every start opens a new numbered cycle, events from older cycles are dropped,
//! and `Ended` is delivered at most once per cycle no matter how often the engine
//! reports it.

use crate::audio::AudioTap;
use crate::error::{RecognitionErrorCode, VoiceResult};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Normalized recognition callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Interim(String),
    Final(String),
    Ended,
    Error(RecognitionErrorCode),
}

type EmitFn = dyn Fn(u64, RecognitionEvent) + Send + Sync;

/// Where an engine reports events. Every event is stamped with the cycle it was
/// started under.
#[derive(Clone)]
pub struct RecognitionSink {
    cycle: u64,
    emit: Arc<EmitFn>,
}

impl RecognitionSink {
    pub fn new(cycle: u64, emit: Arc<EmitFn>) -> Self {
        Self { cycle, emit }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn emit(&self, event: RecognitionEvent) {
        (self.emit)(self.cycle, event);
    }

    pub fn interim(&self, text: impl Into<String>) {
        self.emit(RecognitionEvent::Interim(text.into()));
    }

    pub fn final_text(&self, text: impl Into<String>) {
        self.emit(RecognitionEvent::Final(text.into()));
    }

    pub fn ended(&self) {
        self.emit(RecognitionEvent::Ended);
    }

    pub fn error(&self, code: RecognitionErrorCode) {
        self.emit(RecognitionEvent::Error(code));
    }
}

impl fmt::Debug for RecognitionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecognitionSink")
            .field("cycle", &self.cycle)
            .finish()
    }
}

/// A continuous, interim-results recognition backend bound to one language.
pub trait RecognitionEngine: Send {
    /// Begin a recognition cycle. Events go to `sink` until `Ended`.
    fn start(
        &mut self,
        language: &str,
        audio: Option<AudioTap>,
        sink: RecognitionSink,
    ) -> VoiceResult<()>;

    /// Finish gracefully: pending audio is still transcribed, then `Ended`.
    fn stop(&mut self);

    /// Tear down immediately. `Ended` follows without further results.
    fn abort(&mut self) -> VoiceResult<()>;
}

/// Owned handle over one engine.
pub struct RecognizerAdapter {
    engine: Box<dyn RecognitionEngine>,
    language: String,
    emit: Arc<EmitFn>,
    cycle: u64,
    active: bool,
    stopping: bool,
    ended_cycle: Option<u64>,
}

impl RecognizerAdapter {
    pub fn new(
        engine: Box<dyn RecognitionEngine>,
        language: impl Into<String>,
        emit: Arc<EmitFn>,
    ) -> Self {
        Self {
            engine,
            language: language.into(),
            emit,
            cycle: 0,
            active: false,
            stopping: false,
            ended_cycle: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Start a new cycle. Returns `Ok(false)` when a cycle is already running.
    pub fn start(&mut self, audio: Option<AudioTap>) -> VoiceResult<bool> {
        if self.active && !self.stopping {
            debug!(target: "parla::recognizer", cycle = self.cycle, "already active, start ignored");
            return Ok(false);
        }

        // Clear whatever the platform may still be holding from the last cycle.
        if let Err(e) = self.engine.abort() {
            debug!(target: "parla::recognizer", "pre-start abort failed: {}", e);
        }

        self.cycle += 1;
        self.stopping = false;
        let sink = RecognitionSink::new(self.cycle, Arc::clone(&self.emit));
        match self.engine.start(&self.language, audio, sink) {
            Ok(()) => {
                self.active = true;
                debug!(target: "parla::recognizer", cycle = self.cycle, language = %self.language, "recognition started");
                Ok(true)
            }
            Err(e) => {
                self.active = false;
                warn!(target: "parla::recognizer", cycle = self.cycle, "recognition failed to start: {}", e);
                Err(e)
            }
        }
    }

    /// Graceful stop. No-op when idle or already stopping.
    pub fn stop(&mut self) {
        if !self.active || self.stopping {
            return;
        }
        self.stopping = true;
        self.engine.stop();
    }

    /// Immediate teardown. No-op when idle.
    pub fn abort(&mut self) {
        if !self.active {
            return;
        }
        self.stopping = true;
        if let Err(e) = self.engine.abort() {
            debug!(target: "parla::recognizer", "abort failed: {}", e);
        }
    }

    /// Filter an incoming event. Stale cycles and repeated `Ended` are dropped.
    pub fn accept(&mut self, cycle: u64, event: RecognitionEvent) -> Option<RecognitionEvent> {
        if cycle != self.cycle {
            debug!(target: "parla::recognizer", cycle, current = self.cycle, "dropping stale event");
            return None;
        }
        if self.ended_cycle == Some(cycle) {
            return None;
        }
        if event == RecognitionEvent::Ended {
            self.ended_cycle = Some(cycle);
            self.active = false;
            self.stopping = false;
        }
        Some(event)
    }
}

impl Drop for RecognizerAdapter {
    fn drop(&mut self) {
        if self.active {
            let _ = self.engine.abort();
        }
    }
}
