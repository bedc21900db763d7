//! **CloudSpeech**: a [`SpeechPlatform`] over an OpenAI-compatible `/audio/speech`
//! endpoint. Playback uses a `rodio::Sink` when built with `native-audio`.

use crate::error::{VoiceError, VoiceResult};
use crate::synthesizer::{SpeechPlatform, Utterance, VoiceInfo};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Voices the speech API offers. The first one is the default.
const CLOUD_VOICES: &[&str] = &["shimmer", "nova", "alloy", "echo", "fable", "onyx", "sage"];

#[cfg(feature = "native-audio")]
type SinkSlot = Arc<Mutex<Option<Arc<rodio::Sink>>>>;
#[cfg(not(feature = "native-audio"))]
type SinkSlot = Arc<Mutex<Option<()>>>;

/// Uses `TTS_API_URL` (e.g. https://api.openai.com/v1), `TTS_API_KEY`, `TTS_MODEL` (default tts-1)
/// and optionally `TTS_VOICE` to pin one voice.
#[derive(Clone)]
pub struct CloudSpeech {
    pub base_url: String,
    pub api_key: String,
    /// tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    /// Language every catalog voice is tagged with; the API voices are multilingual.
    pub language: String,
    pub voice_override: Option<String>,
    client: reqwest::Client,
    generation: Arc<AtomicU64>,
    sink: SinkSlot,
}

impl CloudSpeech {
    pub fn from_env(language: impl Into<String>) -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .map_err(|_| VoiceError::Config("TTS requires TTS_API_KEY".to_string()))?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let mut speech = Self::new(base_url, api_key, model, language)?;
        speech.voice_override = std::env::var("TTS_VOICE")
            .ok()
            .filter(|v| !v.trim().is_empty());
        Ok(speech)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        language: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            language: language.into(),
            voice_override: None,
            client,
            generation: Arc::new(AtomicU64::new(0)),
            sink: Arc::new(Mutex::new(None)),
        })
    }

    /// Fetch encoded audio (mp3) for `text`. Empty text yields empty audio.
    pub async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "speed": speed.clamp(0.25, 4.0),
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().await.map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    #[cfg(feature = "native-audio")]
    async fn play(&self, bytes: Vec<u8>, generation: u64) -> VoiceResult<()> {
        use rodio::{OutputStream, Sink, Source};
        use std::io::Cursor;

        let slot = Arc::clone(&self.sink);
        let current = Arc::clone(&self.generation);
        tokio::task::spawn_blocking(move || -> VoiceResult<()> {
            // OutputStream is !Send, so it lives and dies on this thread.
            let (_stream, handle) =
                OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
            let sink = Arc::new(Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?);
            let source = rodio::Decoder::new(Cursor::new(bytes))
                .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
            {
                let mut guard = slot
                    .lock()
                    .map_err(|_| VoiceError::Playback("sink lock poisoned".to_string()))?;
                if current.load(Ordering::SeqCst) != generation {
                    return Ok(());
                }
                sink.append(source.convert_samples::<f32>());
                *guard = Some(Arc::clone(&sink));
            }
            sink.sleep_until_end();
            if let Ok(mut guard) = slot.lock() {
                if guard.as_ref().is_some_and(|s| Arc::ptr_eq(s, &sink)) {
                    *guard = None;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| VoiceError::Playback(e.to_string()))?
    }

    #[cfg(not(feature = "native-audio"))]
    async fn play(&self, _bytes: Vec<u8>, _generation: u64) -> VoiceResult<()> {
        Err(VoiceError::Playback(
            "audio playback requires the native-audio feature".to_string(),
        ))
    }
}

#[async_trait]
impl SpeechPlatform for CloudSpeech {
    fn voices(&self) -> Vec<VoiceInfo> {
        match &self.voice_override {
            Some(name) => vec![VoiceInfo {
                name: name.clone(),
                lang: self.language.clone(),
                default: true,
            }],
            None => CLOUD_VOICES
                .iter()
                .enumerate()
                .map(|(i, name)| VoiceInfo {
                    name: name.to_string(),
                    lang: self.language.clone(),
                    default: i == 0,
                })
                .collect(),
        }
    }

    async fn speak(&self, utterance: Utterance) -> VoiceResult<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        let voice = utterance
            .voice
            .clone()
            .unwrap_or_else(|| CLOUD_VOICES[0].to_string());
        // The speech API has no pitch control; rate maps to speed.
        let audio = self.synthesize(&utterance.text, &voice, utterance.rate).await?;
        if audio.is_empty() || self.generation.load(Ordering::SeqCst) != generation {
            return Ok(());
        }
        debug!(target: "parla::synth", voice = %voice, bytes = audio.len(), "playing synthesized audio");
        self.play(audio, generation).await
    }

    fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        stop_sink(&self.sink);
    }
}

#[cfg(feature = "native-audio")]
fn stop_sink(slot: &SinkSlot) {
    let sink = slot.lock().ok().and_then(|mut guard| guard.take());
    if let Some(sink) = sink {
        sink.stop();
        tracing::info!(target: "parla::synth", "playback stopped");
    }
}

#[cfg(not(feature = "native-audio"))]
fn stop_sink(slot: &SinkSlot) {
    if let Ok(mut guard) = slot.lock() {
        guard.take();
    }
}

impl std::fmt::Debug for CloudSpeech {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSpeech")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("language", &self.language)
            .field("voice_override", &self.voice_override)
            .finish()
    }
}
