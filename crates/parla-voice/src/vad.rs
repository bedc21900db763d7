//! Energy-based voice activity detection.
//!
//! The engine samples the newest captured frame on a fixed cadence, computes the
//! mean absolute deviation from the signal midpoint, and raises "silence exceeded"
//! once per listening episode after speech has gone quiet for the pause threshold.
//! The session controller publishes a [`VadGate`] so every tick reads the live
//! session flags instead of values captured at start.

use crate::audio::{AudioTap, CaptureStream, MicrophoneSource};
use crate::config::VoiceConfig;
use crate::error::VoiceResult;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Mean absolute deviation of `samples` from `midpoint`.
pub fn signal_level(samples: &[f32], midpoint: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| (s - midpoint).abs()).sum::<f32>() / samples.len() as f32
}

/// Session flags the VAD loop consults on every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadGate {
    pub listening: bool,
    pub speaking: bool,
    pub has_transcript: bool,
    /// Bumped by the controller each time a new listening episode begins.
    pub episode: u64,
}

/// Pure silence timer. Separated from the sampling loop so it can be driven with
/// synthetic levels and instants.
#[derive(Debug)]
pub struct SilenceDetector {
    threshold: f32,
    pause: Duration,
    episode: Option<u64>,
    last_voice: Option<Instant>,
    fired: bool,
}

impl SilenceDetector {
    pub fn new(threshold: f32, pause: Duration) -> Self {
        Self {
            threshold,
            pause,
            episode: None,
            last_voice: None,
            fired: false,
        }
    }

    /// Feed one sample. `level` is `None` when no frame arrived since the last tick.
    /// Returns `true` at most once per episode.
    pub fn observe(&mut self, level: Option<f32>, gate: &VadGate, now: Instant) -> bool {
        if self.episode != Some(gate.episode) {
            self.episode = Some(gate.episode);
            self.last_voice = Some(now);
            self.fired = false;
        }

        if level.is_some_and(|l| l > self.threshold) {
            self.last_voice = Some(now);
            return false;
        }

        // Playback bleed must never look like the end of a user turn.
        if gate.speaking || !gate.listening || !gate.has_transcript || self.fired {
            return false;
        }

        let last_voice = *self.last_voice.get_or_insert(now);
        if now.duration_since(last_voice) > self.pause {
            self.fired = true;
            return true;
        }
        false
    }
}

/// Owns the microphone acquisition and the sampling task.
pub struct VadEngine {
    capture: Option<CaptureStream>,
    task: Option<JoinHandle<()>>,
}

impl VadEngine {
    /// Acquire the microphone and start sampling. `on_silence` receives the episode
    /// the signal belongs to. A device failure returns before anything is opened.
    pub fn start<F>(
        mic: &dyn MicrophoneSource,
        config: &VoiceConfig,
        gate: watch::Receiver<VadGate>,
        on_silence: F,
    ) -> VoiceResult<Self>
    where
        F: Fn(u64) + Send + 'static,
    {
        let capture = mic.acquire()?;
        let Some(mut tap) = capture.tap() else {
            return Ok(Self {
                capture: Some(capture),
                task: None,
            });
        };

        let mut detector = SilenceDetector::new(config.silence_threshold, config.pause);
        let midpoint = config.signal_midpoint;
        let frame_interval = config.frame_interval;
        info!(
            target: "parla::vad",
            sample_rate = capture.sample_rate(),
            threshold = config.silence_threshold,
            pause_ms = config.pause.as_millis() as u64,
            "VAD started"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let level = match tap.latest() {
                    Ok(frame) => frame.map(|f| signal_level(&f.samples, midpoint)),
                    Err(()) => break,
                };
                let snapshot = *gate.borrow();
                if detector.observe(level, &snapshot, Instant::now()) {
                    debug!(target: "parla::vad", episode = snapshot.episode, "silence exceeded");
                    on_silence(snapshot.episode);
                }
            }
            debug!(target: "parla::vad", "capture closed, sampling loop exiting");
        });

        Ok(Self {
            capture: Some(capture),
            task: Some(task),
        })
    }

    /// Another subscription to the captured audio (for the recognition engine).
    pub fn tap(&self) -> Option<AudioTap> {
        self.capture.as_ref().and_then(|c| c.tap())
    }

    pub fn is_running(&self) -> bool {
        self.capture.is_some()
    }

    /// Stop sampling and release the microphone. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.release();
            info!(target: "parla::vad", "VAD stopped");
        }
    }
}

impl Drop for VadEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::broadcast;

    fn gate(listening: bool, speaking: bool, has_transcript: bool) -> VadGate {
        VadGate {
            listening,
            speaking,
            has_transcript,
            episode: 0,
        }
    }

    #[test]
    fn level_is_mean_absolute_deviation() {
        assert_eq!(signal_level(&[], 0.0), 0.0);
        let l = signal_level(&[0.5, -0.5, 0.0, 0.0], 0.0);
        assert!((l - 0.25).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_pause_with_transcript() {
        let mut d = SilenceDetector::new(0.02, Duration::from_millis(1500));
        let g = gate(true, false, true);
        let t0 = Instant::now();
        assert!(!d.observe(Some(0.3), &g, t0));
        assert!(!d.observe(Some(0.0), &g, t0 + Duration::from_millis(1000)));
        assert!(d.observe(Some(0.0), &g, t0 + Duration::from_millis(1501)));
        assert!(!d.observe(Some(0.0), &g, t0 + Duration::from_millis(3000)));
    }

    #[tokio::test(start_paused = true)]
    async fn never_fires_while_speaking() {
        let mut d = SilenceDetector::new(0.02, Duration::from_millis(1500));
        let g = gate(true, true, true);
        let t0 = Instant::now();
        d.observe(Some(0.3), &g, t0);
        for ms in (100..6000).step_by(100) {
            assert!(!d.observe(Some(0.0), &g, t0 + Duration::from_millis(ms)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requires_transcript_and_listening() {
        let mut d = SilenceDetector::new(0.02, Duration::from_millis(1500));
        let t0 = Instant::now();
        let late = t0 + Duration::from_secs(5);
        d.observe(Some(0.3), &gate(true, false, false), t0);
        assert!(!d.observe(None, &gate(true, false, false), late));
        assert!(!d.observe(None, &gate(false, false, true), late));
        assert!(d.observe(None, &gate(true, false, true), late));
    }

    #[tokio::test(start_paused = true)]
    async fn new_episode_rearms_detector() {
        let mut d = SilenceDetector::new(0.02, Duration::from_millis(1500));
        let mut g = gate(true, false, true);
        let t0 = Instant::now();
        d.observe(Some(0.3), &g, t0);
        assert!(d.observe(None, &g, t0 + Duration::from_secs(2)));
        g.episode = 1;
        // Episode change restarts the clock.
        assert!(!d.observe(None, &g, t0 + Duration::from_secs(3)));
        assert!(d.observe(None, &g, t0 + Duration::from_millis(4600)));
    }

    struct ChannelMic {
        frames: broadcast::Sender<AudioFrame>,
        released: Arc<AtomicUsize>,
    }

    impl MicrophoneSource for ChannelMic {
        fn acquire(&self) -> VoiceResult<CaptureStream> {
            let released = Arc::clone(&self.released);
            Ok(CaptureStream::new(16000, self.frames.clone(), move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn engine_reports_silence_and_stops_idempotently() {
        let (frames, _) = broadcast::channel(16);
        let released = Arc::new(AtomicUsize::new(0));
        let mic = ChannelMic {
            frames: frames.clone(),
            released: Arc::clone(&released),
        };
        let (gate_tx, gate_rx) = watch::channel(gate(true, false, true));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);

        let mut engine = VadEngine::start(&mic, &VoiceConfig::default(), gate_rx, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        frames.send(AudioFrame::new(vec![0.4; 160], 16000)).unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(gate_tx);
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
