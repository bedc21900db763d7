//! Voice session controller.
//!
//! One [`VoiceSession`] context owns every cross-callback flag. The VAD loop, the
//! recognition engine, generation and playback each report into a single event
//! channel, and the session task applies them one at a time, reading the live
//! flags at the moment each event is handled.
//!
//! ```text
//! listening --silence / ended+text--> processing --reply--> speaking --done--> listening
//!     ^  |                                                      |
//!     +--+ ended, empty transcript (restart)                    +--done, end pending--> closed
//! ```

use crate::audio::MicrophoneSource;
use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::recognizer::{RecognitionEngine, RecognitionEvent, RecognizerAdapter};
use crate::synthesizer::SynthesizerAdapter;
use crate::vad::{VadEngine, VadGate};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// Displayed session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    /// Microphone open, no speech heard yet.
    Idle,
    Listening,
    Processing,
    Speaking,
    /// Every resource released; the handle reports this after close.
    Closed,
}

impl fmt::Display for VoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    UserEnded,
    /// A fatal recognizer or device error; the text is user-facing.
    Fatal(String),
    /// `max_silent_restarts` recognition cycles ended without speech.
    NoSpeech,
}

/// Observable session output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    State(VoiceState),
    Interim(String),
    /// Accumulated final transcript of the current turn.
    Transcript(String),
    /// Text about to be spoken.
    Reply(String),
    Error(String),
    Closed(CloseReason),
}

/// Sends a finished transcript through the assistant and returns the text to speak.
#[async_trait]
pub trait TurnDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        transcript: String,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;
}

/// Builds a fresh recognition engine for each session.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn RecognitionEngine> + Send + Sync>;

#[derive(Debug)]
enum SessionEvent {
    Recognition { cycle: u64, event: RecognitionEvent },
    SilenceExceeded { episode: u64 },
    ReplyReady { turn: u64, result: Result<String, String> },
    SpeechFinished { turn: u64, result: VoiceResult<()> },
    EndRequested,
}

/// Starts voice sessions. At most one is alive at a time.
pub struct VoiceSessionController {
    config: VoiceConfig,
    mic: Arc<dyn MicrophoneSource>,
    engines: EngineFactory,
    synthesizer: Arc<SynthesizerAdapter>,
    dispatcher: Arc<dyn TurnDispatcher>,
    active: Arc<AtomicBool>,
}

impl VoiceSessionController {
    pub fn new(
        config: VoiceConfig,
        mic: Arc<dyn MicrophoneSource>,
        engines: EngineFactory,
        synthesizer: Arc<SynthesizerAdapter>,
        dispatcher: Arc<dyn TurnDispatcher>,
    ) -> Self {
        Self {
            config,
            mic,
            engines,
            synthesizer,
            dispatcher,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Acquire the microphone and begin listening. Must be called within a tokio runtime.
    pub fn start(&self) -> VoiceResult<VoiceSessionHandle> {
        let guard = ActiveGuard::acquire(&self.active).ok_or(VoiceError::SessionActive)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = watch::channel(VadGate::default());

        let silence_tx = events_tx.clone();
        let vad = VadEngine::start(self.mic.as_ref(), &self.config, gate_rx, move |episode| {
            let _ = silence_tx.send(SessionEvent::SilenceExceeded { episode });
        })?;

        let recognition_tx = events_tx.clone();
        let recognizer = RecognizerAdapter::new(
            (self.engines)(),
            self.config.language.clone(),
            Arc::new(move |cycle, event| {
                let _ = recognition_tx.send(SessionEvent::Recognition { cycle, event });
            }),
        );

        let (display_tx, display_rx) = watch::channel(VoiceState::Listening);
        let (updates_tx, _) = broadcast::channel(64);
        let (closed_tx, closed_rx) = watch::channel(None);

        let mut session = VoiceSession {
            max_silent_restarts: self.config.max_silent_restarts,
            state: VoiceState::Listening,
            transcript: Vec::new(),
            is_speaking: false,
            termination_pending: false,
            silent_restarts: 0,
            episode: 0,
            turn: 0,
            finished: false,
            recognizer,
            vad,
            synthesizer: Arc::clone(&self.synthesizer),
            dispatcher: Arc::clone(&self.dispatcher),
            events: events_tx.clone(),
            gate: gate_tx,
            display: display_tx,
            updates: updates_tx.clone(),
            closed: closed_tx,
            guard,
        };

        info!(target: "parla::voice", language = %self.config.language, "voice session started");
        session.episode = 1;
        session.set_state(VoiceState::Listening);
        if let Err(e) = session.recognizer.start(session.vad.tap()) {
            session.close(CloseReason::Fatal(e.user_message()), false);
            return Err(e);
        }

        tokio::spawn(session.run(events_rx));

        Ok(VoiceSessionHandle {
            events: events_tx,
            state: display_rx,
            updates: updates_tx,
            closed: closed_rx,
        })
    }
}

/// Caller's side of a running session. Dropping it ends the session.
pub struct VoiceSessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<VoiceState>,
    updates: broadcast::Sender<SessionUpdate>,
    closed: watch::Receiver<Option<CloseReason>>,
}

impl VoiceSessionHandle {
    /// Ask the session to end. If the assistant is speaking, the session closes
    /// once playback completes.
    pub fn end(&self) {
        let _ = self.events.send(SessionEvent::EndRequested);
    }

    pub fn state(&self) -> VoiceState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<VoiceState> {
        self.state.clone()
    }

    pub fn updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Wait until every resource is released.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return rx
                    .borrow()
                    .clone()
                    .unwrap_or(CloseReason::Fatal("voice session task exited".to_string()));
            }
        }
    }
}

impl Drop for VoiceSessionHandle {
    fn drop(&mut self) {
        let _ = self.events.send(SessionEvent::EndRequested);
    }
}

/// Holds the controller's single-session flag.
struct ActiveGuard {
    flag: Arc<AtomicBool>,
    held: bool,
}

impl ActiveGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
                held: true,
            })
    }

    fn release(&mut self) {
        if self.held {
            self.held = false;
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.release();
    }
}

struct VoiceSession {
    max_silent_restarts: Option<u32>,
    state: VoiceState,
    transcript: Vec<String>,
    is_speaking: bool,
    termination_pending: bool,
    silent_restarts: u32,
    episode: u64,
    turn: u64,
    finished: bool,

    recognizer: RecognizerAdapter,
    vad: VadEngine,
    synthesizer: Arc<SynthesizerAdapter>,
    dispatcher: Arc<dyn TurnDispatcher>,

    events: mpsc::UnboundedSender<SessionEvent>,
    gate: watch::Sender<VadGate>,
    display: watch::Sender<VoiceState>,
    updates: broadcast::Sender<SessionUpdate>,
    closed: watch::Sender<Option<CloseReason>>,
    guard: ActiveGuard,
}

impl VoiceSession {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
            if self.finished {
                break;
            }
        }
        debug!(target: "parla::voice", "session task exited");
    }

    fn handle(&mut self, event: SessionEvent) {
        if self.finished {
            return;
        }
        match event {
            SessionEvent::Recognition { cycle, event } => {
                if let Some(event) = self.recognizer.accept(cycle, event) {
                    self.on_recognition(event);
                }
            }
            SessionEvent::SilenceExceeded { episode } => {
                if episode == self.episode
                    && self.state == VoiceState::Listening
                    && !self.is_speaking
                    && !self.transcript.is_empty()
                {
                    debug!(target: "parla::voice", episode, "silence after speech");
                    self.begin_processing();
                }
            }
            SessionEvent::ReplyReady { turn, result } => self.on_reply(turn, result),
            SessionEvent::SpeechFinished { turn, result } => self.on_speech_finished(turn, result),
            SessionEvent::EndRequested => self.on_end_requested(),
        }
    }

    fn on_recognition(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Interim(text) => {
                if self.state == VoiceState::Listening && !self.is_speaking {
                    self.publish(SessionUpdate::Interim(text));
                }
            }
            RecognitionEvent::Final(text) => {
                let text = text.trim();
                if self.state != VoiceState::Listening || self.is_speaking || text.is_empty() {
                    return;
                }
                self.transcript.push(text.to_string());
                self.sync_gate();
                self.publish(SessionUpdate::Transcript(self.transcript.join(" ")));
            }
            RecognitionEvent::Error(code) => {
                if code.is_recoverable() {
                    debug!(target: "parla::voice", code = %code, "recoverable recognition error");
                    return;
                }
                warn!(target: "parla::voice", code = %code, "fatal recognition error");
                self.close(CloseReason::Fatal(code.user_message()), true);
            }
            RecognitionEvent::Ended => self.on_recognition_ended(),
        }
    }

    /// The one place that decides what follows a recognition cycle.
    fn on_recognition_ended(&mut self) {
        if self.is_speaking || self.state != VoiceState::Listening {
            return;
        }
        if !self.transcript.is_empty() {
            self.begin_processing();
            return;
        }

        self.silent_restarts += 1;
        if let Some(max) = self.max_silent_restarts {
            if self.silent_restarts > max {
                info!(target: "parla::voice", restarts = max, "no speech heard, closing");
                self.close(CloseReason::NoSpeech, false);
                return;
            }
        }
        debug!(target: "parla::voice", restarts = self.silent_restarts, "empty cycle, restarting recognition");
        self.start_recognition();
    }

    fn begin_processing(&mut self) {
        let transcript = self.transcript.join(" ");
        self.transcript.clear();
        self.silent_restarts = 0;
        self.set_state(VoiceState::Processing);
        self.recognizer.abort();

        self.turn += 1;
        let turn = self.turn;
        info!(target: "parla::voice", turn, chars = transcript.len(), "dispatching voice turn");

        let dispatcher = Arc::clone(&self.dispatcher);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = dispatcher
                .dispatch(transcript)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(SessionEvent::ReplyReady { turn, result });
        });
    }

    fn on_reply(&mut self, turn: u64, result: Result<String, String>) {
        if turn != self.turn || self.state != VoiceState::Processing {
            return;
        }
        match result {
            Ok(text) if !text.trim().is_empty() => {
                self.publish(SessionUpdate::Reply(text.clone()));
                self.begin_speaking(text);
            }
            Ok(_) => {
                debug!(target: "parla::voice", turn, "empty reply, back to listening");
                self.enter_listening();
            }
            Err(message) => {
                warn!(target: "parla::voice", turn, "voice turn failed: {}", message);
                self.publish(SessionUpdate::Error(message));
                self.enter_listening();
            }
        }
    }

    fn begin_speaking(&mut self, text: String) {
        self.is_speaking = true;
        self.set_state(VoiceState::Speaking);

        let turn = self.turn;
        let synthesizer = Arc::clone(&self.synthesizer);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = synthesizer.speak(&text).await;
            let _ = events.send(SessionEvent::SpeechFinished { turn, result });
        });
    }

    fn on_speech_finished(&mut self, turn: u64, result: VoiceResult<()>) {
        if turn != self.turn || !self.is_speaking {
            return;
        }
        self.is_speaking = false;
        match result {
            Ok(()) | Err(VoiceError::Interrupted) => {}
            Err(e) => {
                warn!(target: "parla::voice", "playback failed: {}", e);
                self.publish(SessionUpdate::Error(e.user_message()));
            }
        }

        if self.termination_pending {
            self.close(CloseReason::UserEnded, false);
        } else {
            self.enter_listening();
        }
    }

    fn on_end_requested(&mut self) {
        if !self.is_speaking {
            self.close(CloseReason::UserEnded, false);
            return;
        }
        if self.termination_pending {
            return;
        }
        // Playback finishes; the close happens from its completion.
        info!(target: "parla::voice", "end requested while speaking, deferring");
        self.termination_pending = true;
        self.recognizer.abort();
        self.display.send_replace(VoiceState::Processing);
        self.publish(SessionUpdate::State(VoiceState::Processing));
    }

    fn enter_listening(&mut self) {
        self.episode += 1;
        self.transcript.clear();
        self.set_state(VoiceState::Listening);
        self.start_recognition();
    }

    fn start_recognition(&mut self) {
        match self.recognizer.start(self.vad.tap()) {
            Ok(_) => {}
            Err(VoiceError::Recognition(code)) if code.is_recoverable() => {
                debug!(target: "parla::voice", code = %code, "recognizer declined to start");
            }
            Err(e) => {
                warn!(target: "parla::voice", "recognition failed to start: {}", e);
                self.close(CloseReason::Fatal(e.user_message()), true);
            }
        }
    }

    fn set_state(&mut self, state: VoiceState) {
        if self.state != state {
            debug!(target: "parla::voice", from = %self.state, to = %state, "state change");
        }
        self.state = state;
        self.sync_gate();
        self.display.send_replace(state);
        self.publish(SessionUpdate::State(state));
    }

    fn sync_gate(&self) {
        self.gate.send_replace(VadGate {
            listening: self.state == VoiceState::Listening,
            speaking: self.is_speaking,
            has_transcript: !self.transcript.is_empty(),
            episode: self.episode,
        });
    }

    fn publish(&self, update: SessionUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    /// Release everything. Runs on every exit path.
    fn close(&mut self, reason: CloseReason, cancel_speech: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        self.recognizer.abort();
        if cancel_speech && self.is_speaking {
            self.synthesizer.cancel();
        }
        self.vad.stop();
        self.is_speaking = false;
        self.termination_pending = false;
        self.transcript.clear();
        self.state = VoiceState::Closed;
        self.sync_gate();
        self.display.send_replace(VoiceState::Closed);
        self.guard.release();

        if let CloseReason::Fatal(message) = &reason {
            self.publish(SessionUpdate::Error(message.clone()));
        }
        info!(target: "parla::voice", reason = ?reason, "voice session closed");
        self.publish(SessionUpdate::Closed(reason.clone()));
        self.closed.send_replace(Some(reason));
    }
}
