//! Speech synthesizer adapter: one `speak(text)` at a time, newest wins.

use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// An installed synthesis voice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceInfo {
    pub name: String,
    /// BCP-47 tag, e.g. `ar-SA`.
    pub lang: String,
    pub default: bool,
}

/// What the platform is asked to say.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub text: String,
    pub lang: String,
    /// `None` lets the platform use its default voice.
    pub voice: Option<String>,
    /// 1.0 is neutral.
    pub pitch: f32,
    /// 1.0 is neutral.
    pub rate: f32,
}

/// Platform text-to-speech.
#[async_trait]
pub trait SpeechPlatform: Send + Sync {
    /// Current voice catalog. May be empty while the platform is still loading it.
    fn voices(&self) -> Vec<VoiceInfo>;

    /// Resolves when playback ends. A cancelled utterance may resolve either way.
    async fn speak(&self, utterance: Utterance) -> VoiceResult<()>;

    /// Stop whatever is playing.
    fn cancel(&self);
}

/// Pick a voice for `language`: exact tag, then same primary language, else none.
pub fn select_voice<'a>(voices: &'a [VoiceInfo], language: &str) -> Option<&'a VoiceInfo> {
    let wanted = normalize_tag(language);
    let primary = wanted.split('-').next().unwrap_or(&wanted).to_string();
    voices
        .iter()
        .find(|v| normalize_tag(&v.lang) == wanted)
        .or_else(|| {
            voices
                .iter()
                .find(|v| normalize_tag(&v.lang).split('-').next() == Some(primary.as_str()))
        })
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().replace('_', "-").to_ascii_lowercase()
}

pub struct SynthesizerAdapter {
    platform: Arc<dyn SpeechPlatform>,
    language: String,
    pitch_jitter: f32,
    rate_jitter: f32,
    retry_delay: Duration,
    generation: AtomicU64,
}

impl SynthesizerAdapter {
    pub fn new(platform: Arc<dyn SpeechPlatform>, config: &VoiceConfig) -> Self {
        Self {
            platform,
            language: config.language.clone(),
            pitch_jitter: config.pitch_jitter.abs(),
            rate_jitter: config.rate_jitter.abs(),
            retry_delay: config.voice_list_retry_delay,
            generation: AtomicU64::new(0),
        }
    }

    /// Speak `text`, cancelling anything already playing.
    ///
    /// Returns [`VoiceError::Interrupted`] if a later `speak` or `cancel` superseded
    /// this utterance; the caller decides whether that matters.
    pub async fn speak(&self, text: &str) -> VoiceResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.platform.cancel();

        let voices = self.load_voices().await;
        if self.superseded(generation) {
            return Err(VoiceError::Interrupted);
        }

        let voice = select_voice(&voices, &self.language).map(|v| v.name.clone());
        let (pitch, rate) = {
            let mut rng = rand::thread_rng();
            (
                1.0 + jitter(&mut rng, self.pitch_jitter),
                1.0 + jitter(&mut rng, self.rate_jitter),
            )
        };
        debug!(target: "parla::synth", voice = ?voice, pitch, rate, chars = text.len(), "speaking");

        let result = self
            .platform
            .speak(Utterance {
                text: text.to_string(),
                lang: self.language.clone(),
                voice,
                pitch,
                rate,
            })
            .await;

        if self.superseded(generation) {
            return Err(VoiceError::Interrupted);
        }
        result
    }

    /// Stop current playback. A pending `speak` resolves with `Interrupted`.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.platform.cancel();
    }

    fn superseded(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    /// Voice catalogs can load asynchronously; one deferred re-read is enough.
    async fn load_voices(&self) -> Vec<VoiceInfo> {
        let voices = self.platform.voices();
        if !voices.is_empty() {
            return voices;
        }
        tokio::time::sleep(self.retry_delay).await;
        let voices = self.platform.voices();
        if voices.is_empty() {
            info!(target: "parla::synth", "voice catalog still empty, using platform default");
        }
        voices
    }
}

fn jitter(rng: &mut impl Rng, spread: f32) -> f32 {
    if spread <= 0.0 {
        return 0.0;
    }
    rng.gen_range(-spread..=spread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn voice(name: &str, lang: &str) -> VoiceInfo {
        VoiceInfo {
            name: name.to_string(),
            lang: lang.to_string(),
            default: false,
        }
    }

    #[derive(Default)]
    struct HoldingPlatform {
        catalog: Mutex<Vec<VoiceInfo>>,
        late_catalog: Mutex<Option<Vec<VoiceInfo>>>,
        reads: AtomicUsize,
        spoken: Mutex<Vec<Utterance>>,
        release: Notify,
    }

    #[async_trait]
    impl SpeechPlatform for HoldingPlatform {
        fn voices(&self) -> Vec<VoiceInfo> {
            if self.reads.fetch_add(1, Ordering::SeqCst) > 0 {
                if let Some(late) = self.late_catalog.lock().unwrap().take() {
                    *self.catalog.lock().unwrap() = late;
                }
            }
            self.catalog.lock().unwrap().clone()
        }

        async fn speak(&self, utterance: Utterance) -> VoiceResult<()> {
            let released = self.release.notified();
            self.spoken.lock().unwrap().push(utterance);
            released.await;
            Ok(())
        }

        fn cancel(&self) {
            self.release.notify_waiters();
        }
    }

    #[test]
    fn voice_selection_prefers_exact_then_primary() {
        let voices = vec![voice("en", "en-US"), voice("eg", "ar-EG"), voice("sa", "ar_SA")];
        assert_eq!(select_voice(&voices, "ar-SA").unwrap().name, "sa");
        assert_eq!(select_voice(&voices, "ar-MA").unwrap().name, "eg");
        assert!(select_voice(&voices, "fr-FR").is_none());
    }

    #[tokio::test]
    async fn speak_resolves_when_playback_ends() {
        let platform = Arc::new(HoldingPlatform::default());
        *platform.catalog.lock().unwrap() = vec![voice("sa", "ar-SA")];
        let adapter = Arc::new(SynthesizerAdapter::new(platform.clone(), &VoiceConfig::default()));

        let a = Arc::clone(&adapter);
        let speaking = tokio::spawn(async move { a.speak("marhaba").await });
        while platform.spoken.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        assert!(!speaking.is_finished());

        platform.release.notify_waiters();
        speaking.await.unwrap().unwrap();

        let spoken = platform.spoken.lock().unwrap();
        assert_eq!(spoken[0].voice.as_deref(), Some("sa"));
        assert!((0.9..=1.1).contains(&spoken[0].pitch));
        assert!((0.95..=1.05).contains(&spoken[0].rate));
    }

    #[tokio::test]
    async fn newer_utterance_interrupts_older() {
        let platform = Arc::new(HoldingPlatform::default());
        *platform.catalog.lock().unwrap() = vec![voice("sa", "ar-SA")];
        let adapter = Arc::new(SynthesizerAdapter::new(platform.clone(), &VoiceConfig::default()));

        let a = Arc::clone(&adapter);
        let first = tokio::spawn(async move { a.speak("one").await });
        while platform.spoken.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        let b = Arc::clone(&adapter);
        let second = tokio::spawn(async move { b.speak("two").await });
        assert!(matches!(first.await.unwrap(), Err(VoiceError::Interrupted)));

        while platform.spoken.lock().unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }
        platform.release.notify_waiters();
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_catalog_is_read_again_once() {
        let platform = Arc::new(HoldingPlatform::default());
        *platform.late_catalog.lock().unwrap() = Some(vec![voice("sa", "ar-SA")]);
        let adapter = Arc::new(SynthesizerAdapter::new(platform.clone(), &VoiceConfig::default()));

        let a = Arc::clone(&adapter);
        let speaking = tokio::spawn(async move { a.speak("hala").await });
        while platform.spoken.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        adapter.cancel();
        assert!(matches!(speaking.await.unwrap(), Err(VoiceError::Interrupted)));
        assert_eq!(platform.reads.load(Ordering::SeqCst), 2);
        assert_eq!(platform.spoken.lock().unwrap()[0].voice.as_deref(), Some("sa"));
    }
}
