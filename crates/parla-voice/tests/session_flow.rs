//! Voice session state machine tests.
//!
//! Every subsystem is a scripted double; time is paused so the 1.5s pause
//! threshold runs on virtual time.

use async_trait::async_trait;
use parla_voice::{
    AudioTap, CaptureStream, CloseReason, DeviceErrorKind, MicrophoneSource,
    RecognitionEngine, RecognitionErrorCode, RecognitionSink, SessionUpdate, SpeechPlatform,
    SynthesizerAdapter, TurnDispatcher, Utterance, VoiceConfig, VoiceError, VoiceInfo,
    VoiceResult, VoiceSessionController, VoiceSessionHandle, VoiceState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

// ---------------------------------------------------------------------------
// Doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeMic {
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
    fail_with: Mutex<Option<DeviceErrorKind>>,
}

impl MicrophoneSource for FakeMic {
    fn acquire(&self) -> VoiceResult<CaptureStream> {
        if let Some(kind) = self.fail_with.lock().unwrap().take() {
            return Err(VoiceError::Device(kind));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let (tx, _) = broadcast::channel(32);
        let released = Arc::clone(&self.released);
        Ok(CaptureStream::new(16000, tx, move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[derive(Default)]
struct EngineLog {
    starts: usize,
    stops: usize,
    aborts: usize,
    sink: Option<RecognitionSink>,
}

/// Behaves like a browser recognizer: stop and abort both end the cycle.
struct ScriptedEngine(Arc<Mutex<EngineLog>>);

impl RecognitionEngine for ScriptedEngine {
    fn start(&mut self, _: &str, _: Option<AudioTap>, sink: RecognitionSink) -> VoiceResult<()> {
        let mut log = self.0.lock().unwrap();
        log.starts += 1;
        log.sink = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        let sink = {
            let mut log = self.0.lock().unwrap();
            log.stops += 1;
            log.sink.take()
        };
        if let Some(sink) = sink {
            sink.ended();
        }
    }

    fn abort(&mut self) -> VoiceResult<()> {
        let sink = {
            let mut log = self.0.lock().unwrap();
            log.aborts += 1;
            log.sink.take()
        };
        if let Some(sink) = sink {
            sink.ended();
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeSpeech {
    spoken: Mutex<Vec<String>>,
    done: Notify,
}

#[async_trait]
impl SpeechPlatform for FakeSpeech {
    fn voices(&self) -> Vec<VoiceInfo> {
        vec![VoiceInfo {
            name: "Maged".to_string(),
            lang: "ar-SA".to_string(),
            default: true,
        }]
    }

    async fn speak(&self, utterance: Utterance) -> VoiceResult<()> {
        let done = self.done.notified();
        self.spoken.lock().unwrap().push(utterance.text);
        done.await;
        Ok(())
    }

    fn cancel(&self) {
        self.done.notify_waiters();
    }
}

#[derive(Default)]
struct RecordingDispatcher {
    turns: Mutex<Vec<String>>,
}

#[async_trait]
impl TurnDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        transcript: String,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        self.turns.lock().unwrap().push(transcript.clone());
        Ok(format!("you said {}", transcript))
    }
}

struct Harness {
    controller: VoiceSessionController,
    mic: Arc<FakeMic>,
    engine: Arc<Mutex<EngineLog>>,
    speech: Arc<FakeSpeech>,
    dispatcher: Arc<RecordingDispatcher>,
}

impl Harness {
    fn new(config: VoiceConfig) -> Self {
        let mic = Arc::new(FakeMic::default());
        let engine = Arc::new(Mutex::new(EngineLog::default()));
        let speech = Arc::new(FakeSpeech::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let log = Arc::clone(&engine);
        let synthesizer = Arc::new(SynthesizerAdapter::new(speech.clone(), &config));
        let controller = VoiceSessionController::new(
            config,
            mic.clone(),
            Arc::new(move || Box::new(ScriptedEngine(Arc::clone(&log))) as Box<dyn RecognitionEngine>),
            synthesizer,
            dispatcher.clone(),
        );
        Self {
            controller,
            mic,
            engine,
            speech,
            dispatcher,
        }
    }

    fn sink(&self) -> RecognitionSink {
        self.engine
            .lock()
            .unwrap()
            .sink
            .clone()
            .expect("recognition cycle running")
    }

    fn starts(&self) -> usize {
        self.engine.lock().unwrap().starts
    }

    async fn wait_spoken(&self, n: usize) {
        while self.speech.spoken.lock().unwrap().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionUpdate>, mut pred: F) -> SessionUpdate
where
    F: FnMut(&SessionUpdate) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let update = rx.recv().await.expect("session updates open");
            if pred(&update) {
                return update;
            }
        }
    })
    .await
    .expect("update arrived")
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Drive a session to `speaking` with one utterance.
async fn speak_one_turn(h: &Harness, handle: &VoiceSessionHandle, text: &str) {
    let mut updates = handle.updates();
    h.sink().final_text(text);
    wait_for(&mut updates, |u| *u == SessionUpdate::State(VoiceState::Speaking)).await;
    h.wait_spoken(1).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn silence_after_speech_dispatches_exactly_one_turn() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let h = Harness::new(VoiceConfig::default());
    let handle = h.controller.start().unwrap();
    assert_eq!(handle.state(), VoiceState::Listening);
    let mut updates = handle.updates();

    h.sink().final_text("marhaba");
    wait_for(&mut updates, |u| matches!(u, SessionUpdate::Transcript(_))).await;

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(handle.state(), VoiceState::Listening);
    assert!(h.dispatcher.turns.lock().unwrap().is_empty());

    wait_for(&mut updates, |u| *u == SessionUpdate::State(VoiceState::Processing)).await;
    let reply = wait_for(&mut updates, |u| matches!(u, SessionUpdate::Reply(_))).await;
    assert_eq!(reply, SessionUpdate::Reply("you said marhaba".to_string()));
    h.wait_spoken(1).await;

    // Stay silent well past the pause again: nothing new is dispatched while speaking.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(*h.dispatcher.turns.lock().unwrap(), vec!["marhaba".to_string()]);
    assert_eq!(handle.state(), VoiceState::Speaking);
}

#[tokio::test(start_paused = true)]
async fn ended_with_transcript_hands_off_to_generation() {
    let h = Harness::new(VoiceConfig::default());
    let handle = h.controller.start().unwrap();
    let mut updates = handle.updates();

    let sink = h.sink();
    sink.final_text("how is");
    sink.final_text("the weather");
    sink.ended();

    wait_for(&mut updates, |u| matches!(u, SessionUpdate::Reply(_))).await;
    assert_eq!(
        *h.dispatcher.turns.lock().unwrap(),
        vec!["how is the weather".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn end_while_speaking_closes_only_after_playback() {
    let h = Harness::new(VoiceConfig::default());
    let handle = h.controller.start().unwrap();
    speak_one_turn(&h, &handle, "tell me a story").await;

    let mut updates = handle.updates();
    handle.end();
    wait_for(&mut updates, |u| *u == SessionUpdate::State(VoiceState::Processing)).await;
    assert_eq!(handle.state(), VoiceState::Processing);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!handle.is_closed());
    assert_eq!(h.mic.released.load(Ordering::SeqCst), 0);

    h.speech.done.notify_waiters();
    assert_eq!(handle.closed().await, CloseReason::UserEnded);
    assert_eq!(h.mic.released.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), VoiceState::Closed);
    assert!(!h.controller.is_active());
}

#[tokio::test(start_paused = true)]
async fn end_while_listening_closes_immediately() {
    let h = Harness::new(VoiceConfig::default());
    let handle = h.controller.start().unwrap();
    assert_eq!(handle.state(), VoiceState::Listening);
    handle.end();
    assert_eq!(handle.closed().await, CloseReason::UserEnded);
    assert_eq!(handle.state(), VoiceState::Closed);
    assert_eq!(h.mic.released.load(Ordering::SeqCst), 1);
    assert!(h.engine.lock().unwrap().aborts >= 2);
}

#[tokio::test(start_paused = true)]
async fn speaking_loops_back_to_listening() {
    let h = Harness::new(VoiceConfig::default());
    let handle = h.controller.start().unwrap();
    speak_one_turn(&h, &handle, "one").await;
    let starts_before = h.starts();

    let mut updates = handle.updates();
    h.speech.done.notify_waiters();
    wait_for(&mut updates, |u| *u == SessionUpdate::State(VoiceState::Listening)).await;
    settle().await;
    assert_eq!(h.starts(), starts_before + 1);
    assert!(!handle.is_closed());
}

#[tokio::test(start_paused = true)]
async fn empty_ended_restarts_recognition_without_dispatch() {
    let h = Harness::new(VoiceConfig::default());
    let handle = h.controller.start().unwrap();
    assert_eq!(h.starts(), 1);

    h.sink().ended();
    settle().await;
    assert_eq!(h.starts(), 2);

    h.sink().ended();
    settle().await;
    assert_eq!(h.starts(), 3);
    assert_eq!(handle.state(), VoiceState::Listening);
    assert!(h.dispatcher.turns.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn bounded_silent_restarts_close_with_no_speech() {
    let config = VoiceConfig {
        max_silent_restarts: Some(2),
        ..VoiceConfig::default()
    };
    let h = Harness::new(config);
    let handle = h.controller.start().unwrap();
    for _ in 0..3 {
        h.sink().ended();
        settle().await;
    }
    assert_eq!(handle.closed().await, CloseReason::NoSpeech);
    assert_eq!(h.starts(), 3);
}

#[tokio::test(start_paused = true)]
async fn recoverable_errors_are_ignored() {
    let h = Harness::new(VoiceConfig::default());
    let handle = h.controller.start().unwrap();
    h.sink().error(RecognitionErrorCode::NoSpeech);
    h.sink().error(RecognitionErrorCode::Aborted);
    settle().await;
    assert!(!handle.is_closed());
    assert_eq!(handle.state(), VoiceState::Listening);
}

#[tokio::test(start_paused = true)]
async fn fatal_error_closes_session_and_frees_controller() {
    let h = Harness::new(VoiceConfig::default());
    let handle = h.controller.start().unwrap();
    let mut updates = handle.updates();

    h.sink().error(RecognitionErrorCode::parse("network"));
    let error = wait_for(&mut updates, |u| matches!(u, SessionUpdate::Error(_))).await;
    assert!(matches!(error, SessionUpdate::Error(ref m) if m.contains("network")));
    assert!(matches!(handle.closed().await, CloseReason::Fatal(_)));
    assert_eq!(h.mic.released.load(Ordering::SeqCst), 1);

    let again = h.controller.start().unwrap();
    assert_eq!(again.state(), VoiceState::Listening);
}

#[tokio::test(start_paused = true)]
async fn repeated_end_requests_while_speaking_close_once() {
    let h = Harness::new(VoiceConfig::default());
    let handle = h.controller.start().unwrap();
    speak_one_turn(&h, &handle, "hello").await;
    let mut updates = handle.updates();

    handle.end();
    handle.end();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!handle.is_closed());

    h.speech.done.notify_waiters();
    assert_eq!(handle.closed().await, CloseReason::UserEnded);
    let mut closes = 0;
    while let Ok(update) = updates.try_recv() {
        if matches!(update, SessionUpdate::Closed(_)) {
            closes += 1;
        }
    }
    assert_eq!(closes, 1);
    assert_eq!(*h.speech.spoken.lock().unwrap(), vec!["you said hello".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn second_session_is_rejected_while_one_is_active() {
    let h = Harness::new(VoiceConfig::default());
    let _first = h.controller.start().unwrap();
    assert!(matches!(h.controller.start(), Err(VoiceError::SessionActive)));
    assert_eq!(h.mic.acquired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn device_failure_is_typed_and_leaves_nothing_open() {
    let h = Harness::new(VoiceConfig::default());
    *h.mic.fail_with.lock().unwrap() = Some(DeviceErrorKind::PermissionDenied);

    let err = h.controller.start().err().expect("start fails");
    assert!(matches!(err, VoiceError::Device(DeviceErrorKind::PermissionDenied)));
    assert!(!h.controller.is_active());
    assert_eq!(h.starts(), 0);

    let handle = h.controller.start().unwrap();
    assert_eq!(handle.state(), VoiceState::Listening);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_ends_the_session() {
    let h = Harness::new(VoiceConfig::default());
    let handle = h.controller.start().unwrap();
    drop(handle);
    settle().await;
    assert_eq!(h.mic.released.load(Ordering::SeqCst), 1);
    assert!(!h.controller.is_active());
}

#[tokio::test(start_paused = true)]
async fn finals_while_processing_are_not_accumulated() {
    let h = Harness::new(VoiceConfig::default());
    let handle = h.controller.start().unwrap();
    let mut updates = handle.updates();
    let first_cycle = h.sink();
    first_cycle.final_text("first");
    first_cycle.ended();
    wait_for(&mut updates, |u| matches!(u, SessionUpdate::Reply(_))).await;

    // Late result from the finished cycle.
    first_cycle.final_text("late");
    h.wait_spoken(1).await;
    h.speech.done.notify_waiters();
    wait_for(&mut updates, |u| *u == SessionUpdate::State(VoiceState::Listening)).await;

    let next = h.sink();
    next.final_text("second");
    next.ended();
    wait_for(&mut updates, |u| *u == SessionUpdate::Reply("you said second".to_string())).await;
    assert_eq!(
        *h.dispatcher.turns.lock().unwrap(),
        vec!["first".to_string(), "second".to_string()]
    );
}
