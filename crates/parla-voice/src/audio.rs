//! Microphone capture.
//!
//! A [`MicrophoneSource`] hands out a [`CaptureStream`]: a scoped acquisition that
//! fans captured frames out to any number of [`AudioTap`]s (the VAD loop and the
//! recognition engine both listen). Releasing or dropping the stream stops the
//! device; there is no other way to keep it open.

use crate::error::{VoiceError, VoiceResult};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Frames buffered per tap before the slowest reader starts lagging.
pub const TAP_CAPACITY: usize = 64;

/// One block of mono PCM from the capture device.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Samples normalized to -1.0..1.0.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            captured_at: Instant::now(),
        }
    }
}

/// Anything that can open the microphone: cpal on desktop, a channel in tests.
pub trait MicrophoneSource: Send + Sync {
    /// Acquire the device. On failure nothing stays open.
    fn acquire(&self) -> VoiceResult<CaptureStream>;
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Owned microphone acquisition. Frames flow until [`CaptureStream::release`] or drop.
pub struct CaptureStream {
    sample_rate: u32,
    frames: Option<broadcast::Sender<AudioFrame>>,
    release: Option<ReleaseFn>,
}

impl CaptureStream {
    /// `release` runs exactly once, on the first of `release()` or drop.
    pub fn new(
        sample_rate: u32,
        frames: broadcast::Sender<AudioFrame>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            sample_rate,
            frames: Some(frames),
            release: Some(Box::new(release)),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Subscribe to captured frames. Returns `None` once released.
    pub fn tap(&self) -> Option<AudioTap> {
        self.frames.as_ref().map(|tx| AudioTap {
            rx: tx.subscribe(),
            sample_rate: self.sample_rate,
        })
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    /// Stop the device. Idempotent.
    pub fn release(&mut self) {
        self.frames = None;
        if let Some(release) = self.release.take() {
            release();
            tracing::debug!(target: "parla::audio", "microphone released");
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Receiving end of a capture stream.
pub struct AudioTap {
    rx: broadcast::Receiver<AudioFrame>,
    sample_rate: u32,
}

impl AudioTap {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Next frame, skipping over lag. `None` when the capture is gone.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::trace!(target: "parla::audio", skipped, "audio tap lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain whatever is queued and keep the newest frame.
    /// `Err(())` when the capture is gone.
    pub fn latest(&mut self) -> Result<Option<AudioFrame>, ()> {
        let mut newest = None;
        loop {
            match self.rx.try_recv() {
                Ok(frame) => newest = Some(frame),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(newest),
                Err(broadcast::error::TryRecvError::Closed) => {
                    return if newest.is_some() { Ok(newest) } else { Err(()) };
                }
            }
        }
    }
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for API upload.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}

/// Average interleaved channels into one.
pub fn downmix_to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Decode any container rodio understands (wav, ogg/vorbis, flac, mp3,
/// aac, mp4/m4a) into mono 16-bit WAV at the source sample rate.
#[cfg(feature = "native-audio")]
pub fn decode_to_wav(bytes: Vec<u8>) -> VoiceResult<Vec<u8>> {
    use rodio::Source;

    let decoder = rodio::Decoder::new(std::io::Cursor::new(bytes))
        .map_err(|e| VoiceError::Decode(e.to_string()))?;
    let channels = decoder.channels();
    let sample_rate = decoder.sample_rate();
    let interleaved: Vec<f32> = decoder.map(|s| s as f32 / 32768.0).collect();
    if interleaved.is_empty() {
        return Err(VoiceError::Decode("no audio samples".to_string()));
    }
    Ok(pcm_f32_to_wav(&downmix_to_mono(&interleaved, channels), sample_rate))
}

#[cfg(feature = "native-audio")]
pub use native::CpalMicrophone;

#[cfg(feature = "native-audio")]
mod native {
    use super::*;
    use crate::error::DeviceErrorKind;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, Stream, StreamConfig};
    use std::sync::mpsc as std_mpsc;
    use tracing::{info, warn};

    /// Default input device via cpal. The stream lives on its own thread because
    /// `cpal::Stream` is `!Send` on some platforms.
    #[derive(Debug, Clone)]
    pub struct CpalMicrophone {
        /// Samples per published frame (default 480).
        pub chunk_size: usize,
    }

    impl Default for CpalMicrophone {
        fn default() -> Self {
            Self { chunk_size: 480 }
        }
    }

    impl MicrophoneSource for CpalMicrophone {
        fn acquire(&self) -> VoiceResult<CaptureStream> {
            let (frames_tx, _) = broadcast::channel(TAP_CAPACITY);
            let producer = frames_tx.clone();
            let chunk_size = self.chunk_size.max(1);
            let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<u32>>();
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

            std::thread::spawn(move || {
                let (stream, sample_rate) = match open_default_input(chunk_size, producer) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(sample_rate));
                // Blocks until release() or the CaptureStream is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                info!(target: "parla::audio", "capture stream closed");
            });

            match ready_rx.recv() {
                Ok(Ok(sample_rate)) => Ok(CaptureStream::new(sample_rate, frames_tx, move || {
                    let _ = stop_tx.send(());
                })),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(VoiceError::AudioStream(
                    "capture thread exited before the stream opened".to_string(),
                )),
            }
        }
    }

    fn open_default_input(
        chunk_size: usize,
        frames: broadcast::Sender<AudioFrame>,
    ) -> VoiceResult<(Stream, u32)> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or(VoiceError::Device(DeviceErrorKind::NotFound))?;
        info!(
            target: "parla::audio",
            device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
            "opening input device"
        );

        let default_config = device.default_input_config()?;
        let sample_rate = default_config.sample_rate().0;
        let channels = default_config.channels();
        let stream_config: StreamConfig = default_config.clone().into();

        let mut pending: Vec<f32> = Vec::with_capacity(chunk_size);
        let mut publish = move |mono: &[f32]| {
            for &sample in mono {
                pending.push(sample);
                if pending.len() >= chunk_size {
                    let frame = AudioFrame::new(std::mem::take(&mut pending), sample_rate);
                    // No subscribers is fine; the VAD may not have tapped yet.
                    let _ = frames.send(frame);
                    pending.reserve(chunk_size);
                }
            }
        };

        let stream = match default_config.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    publish(&downmix_to_mono(data, channels));
                },
                move |err| warn!(target: "parla::audio", "audio stream error: {}", err),
                None,
            )?,
            SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let f: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                    publish(&downmix_to_mono(&f, channels));
                },
                move |err| warn!(target: "parla::audio", "audio stream error: {}", err),
                None,
            )?,
            _ => return Err(VoiceError::Device(DeviceErrorKind::Unsupported)),
        };
        stream.play()?;
        info!(target: "parla::audio", sample_rate, channels, "audio capture started");
        Ok((stream, sample_rate))
    }
}
