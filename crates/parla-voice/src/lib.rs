//! # Parla Voice - hands-free conversation mode
//!
//! Arbitrates between microphone capture, voice-activity detection, streaming
//! speech-to-text, the assistant turn and speech synthesis so they never talk
//! over each other.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                   Voice Session Controller                    │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐     │
//! │  │  Microphone  │→ │  Energy VAD  │→ │                  │     │
//! │  │    (cpal)    │  │ (1.5s pause) │  │  session events  │     │
//! │  └──────────────┘  └──────────────┘  │  (one channel)   │     │
//! │         ↓                            │                  │     │
//! │  ┌──────────────┐                    │                  │     │
//! │  │  Recognizer  │───────────────────→│                  │     │
//! │  │   adapter    │                    └────────┬─────────┘     │
//! │  └──────────────┘                             ↓               │
//! │  ┌──────────────┐                    ┌──────────────────┐     │
//! │  │ Synthesizer  │←───────────────────│  TurnDispatcher  │     │
//! │  │  (rodio)     │     reply text     │   (assistant)    │     │
//! │  └──────────────┘                    └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod recognizer;
pub mod session;
pub mod stt;
pub mod synthesizer;
pub mod turn;
pub mod vad;
pub mod voice_output;

#[cfg(feature = "native-audio")]
pub use audio::{decode_to_wav, CpalMicrophone};
pub use audio::{downmix_to_mono, pcm_f32_to_wav, AudioFrame, AudioTap, CaptureStream, MicrophoneSource};
pub use config::VoiceConfig;
pub use error::{DeviceErrorKind, RecognitionErrorCode, VoiceError, VoiceResult};
pub use recognizer::{RecognitionEngine, RecognitionEvent, RecognitionSink, RecognizerAdapter};
pub use session::{
    CloseReason, EngineFactory, SessionUpdate, TurnDispatcher, VoiceSessionController,
    VoiceSessionHandle, VoiceState,
};
pub use stt::{CloudRecognitionEngine, CloudTranscriber, Transcriber};
pub use synthesizer::{select_voice, SpeechPlatform, SynthesizerAdapter, Utterance, VoiceInfo};
pub use turn::{CommittedTurn, TurnConfig, TurnDetector};
pub use vad::{signal_level, SilenceDetector, VadEngine, VadGate};
pub use voice_output::CloudSpeech;
