//! **Speech-to-Text** over an OpenAI-compatible transcription API.
//!
//! [`CloudRecognitionEngine`] turns a microphone tap into a recognition cycle:
//! audio is segmented with gap logic, each committed segment is uploaded as WAV
//! and its text is emitted as a `Final` result. `Ended` is emitted exactly once
//! when the cycle finishes, whichever way it finishes.

use crate::audio::{pcm_f32_to_wav, AudioTap};
use crate::error::{RecognitionErrorCode, VoiceError, VoiceResult};
use crate::recognizer::{RecognitionEngine, RecognitionSink};
use crate::turn::{CommittedTurn, TurnConfig, TurnDetector};
use crate::vad::signal_level;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Converts one PCM segment to text. Empty string means nothing was recognized.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32, language: &str)
        -> VoiceResult<String>;
}

/// OpenAI-compatible transcription endpoint (OpenAI Whisper, OpenRouter, etc.).
/// Uses `STT_API_URL` (e.g. https://api.openai.com/v1), `STT_API_KEY`, and `STT_MODEL` (default whisper-1).
#[derive(Debug, Clone)]
pub struct CloudTranscriber {
    /// Base URL without trailing slash.
    pub base_url: String,
    pub api_key: String,
    /// whisper-1, gpt-4o-transcribe, ...
    pub model: String,
    client: reqwest::Client,
}

impl CloudTranscriber {
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("STT_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("STT_API_KEY")
            .map_err(|_| VoiceError::Config("STT requires STT_API_KEY".to_string()))?;
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }
}

#[async_trait]
impl Transcriber for CloudTranscriber {
    async fn transcribe(
        &self,
        samples: &[f32],
        sample_rate: u32,
        language: &str,
    ) -> VoiceResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_f32_to_wav(samples, sample_rate);
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        // The API takes ISO-639-1, not a full locale tag.
        let primary = language.split('-').next().unwrap_or(language).to_string();
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", primary);

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "parla::recognizer", "STT transport error: {}", e);
                VoiceError::Recognition(RecognitionErrorCode::Network)
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(target: "parla::recognizer", %status, "STT API error: {}", body);
            let code = match status.as_u16() {
                401 | 403 => RecognitionErrorCode::ServiceNotAllowed,
                400 | 422 => RecognitionErrorCode::LanguageNotSupported,
                s if s >= 500 => RecognitionErrorCode::Network,
                s => RecognitionErrorCode::Other(format!("http-{}", s)),
            };
            return Err(VoiceError::Recognition(code));
        }

        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Stop,
    Abort,
}

/// Segmenting recognition engine backed by a [`Transcriber`].
pub struct CloudRecognitionEngine {
    transcriber: Arc<dyn Transcriber>,
    turn_config: TurnConfig,
    midpoint: f32,
    control: Option<mpsc::UnboundedSender<Control>>,
    task: Option<JoinHandle<()>>,
}

impl CloudRecognitionEngine {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            transcriber,
            turn_config: TurnConfig::default(),
            midpoint: 0.0,
            control: None,
            task: None,
        }
    }

    pub fn with_turn_config(mut self, config: TurnConfig) -> Self {
        self.turn_config = config;
        self
    }

    fn signal(&mut self, control: Control) {
        if let Some(tx) = self.control.take() {
            // A closed channel means the cycle already ended on its own.
            let _ = tx.send(control);
        }
    }
}

impl RecognitionEngine for CloudRecognitionEngine {
    fn start(
        &mut self,
        language: &str,
        audio: Option<AudioTap>,
        sink: RecognitionSink,
    ) -> VoiceResult<()> {
        let mut tap = audio.ok_or(VoiceError::Recognition(RecognitionErrorCode::AudioCapture))?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.control = Some(tx);

        let transcriber = Arc::clone(&self.transcriber);
        let mut detector = TurnDetector::new(self.turn_config.clone());
        let midpoint = self.midpoint;
        let language = language.to_string();
        let sample_rate = tap.sample_rate();

        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    control = rx.recv() => {
                        match control {
                            Some(Control::Abort) => break,
                            Some(Control::Stop) | None => {
                                if let Some(turn) = detector.flush(Instant::now()) {
                                    if !emit_segment(&*transcriber, &turn, sample_rate, &language, &sink).await {
                                        break;
                                    }
                                }
                                break;
                            }
                        }
                    }
                    frame = tap.recv() => {
                        let Some(frame) = frame else {
                            debug!(target: "parla::recognizer", "capture closed, ending cycle");
                            break;
                        };
                        let level = signal_level(&frame.samples, midpoint);
                        if let Some(turn) = detector.push(level, &frame.samples, Instant::now()) {
                            if !emit_segment(&*transcriber, &turn, sample_rate, &language, &sink).await {
                                break;
                            }
                        }
                    }
                }
            }
            sink.ended();
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.signal(Control::Stop);
    }

    fn abort(&mut self) -> VoiceResult<()> {
        self.signal(Control::Abort);
        self.task = None;
        Ok(())
    }
}

impl Drop for CloudRecognitionEngine {
    fn drop(&mut self) {
        self.signal(Control::Abort);
    }
}

/// Transcribe one segment and report it. Returns `false` when the cycle must end.
async fn emit_segment(
    transcriber: &dyn Transcriber,
    turn: &CommittedTurn,
    sample_rate: u32,
    language: &str,
    sink: &RecognitionSink,
) -> bool {
    match transcriber.transcribe(&turn.samples, sample_rate, language).await {
        Ok(text) if text.is_empty() => true,
        Ok(text) => {
            debug!(target: "parla::recognizer", cycle = sink.cycle(), chars = text.len(), "segment transcribed");
            sink.final_text(text);
            true
        }
        Err(VoiceError::Recognition(code)) => {
            sink.error(code);
            false
        }
        Err(e) => {
            warn!(target: "parla::recognizer", "transcription failed: {}", e);
            sink.error(RecognitionErrorCode::Network);
            false
        }
    }
}
