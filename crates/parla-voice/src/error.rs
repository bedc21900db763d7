//! Error types for voice mode

use std::fmt;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Why the microphone could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    PermissionDenied,
    NotFound,
    InUse,
    InsecureContext,
    Unsupported,
}

impl DeviceErrorKind {
    /// Actionable text for the user. Device errors are never retried automatically.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Microphone access was denied. Allow microphone access for this app and try again."
            }
            Self::NotFound => "No microphone was found. Connect a microphone and try again.",
            Self::InUse => {
                "The microphone is being used by another application. Close it and try again."
            }
            Self::InsecureContext => {
                "Microphone access requires a secure context. Open the app over HTTPS or localhost."
            }
            Self::Unsupported => "Voice input is not supported on this device.",
        }
    }
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "device not found",
            Self::InUse => "device in use",
            Self::InsecureContext => "insecure context",
            Self::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

/// Platform speech-recognition error codes, parsed once at the adapter boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorCode {
    NoSpeech,
    Aborted,
    AudioCapture,
    Network,
    NotAllowed,
    ServiceNotAllowed,
    BadGrammar,
    LanguageNotSupported,
    Other(String),
}

impl RecognitionErrorCode {
    pub fn parse(code: &str) -> Self {
        match code.trim() {
            "no-speech" => Self::NoSpeech,
            "aborted" => Self::Aborted,
            "audio-capture" => Self::AudioCapture,
            "network" => Self::Network,
            "not-allowed" => Self::NotAllowed,
            "service-not-allowed" => Self::ServiceNotAllowed,
            "bad-grammar" => Self::BadGrammar,
            "language-not-supported" => Self::LanguageNotSupported,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::NoSpeech => "no-speech",
            Self::Aborted => "aborted",
            Self::AudioCapture => "audio-capture",
            Self::Network => "network",
            Self::NotAllowed => "not-allowed",
            Self::ServiceNotAllowed => "service-not-allowed",
            Self::BadGrammar => "bad-grammar",
            Self::LanguageNotSupported => "language-not-supported",
            Self::Other(code) => code.as_str(),
        }
    }

    /// `no-speech` and `aborted` leave the lifecycle to the `Ended` event; everything else is fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoSpeech | Self::Aborted)
    }

    /// Message shown to the user when this code ends the session.
    pub fn user_message(&self) -> String {
        match self {
            Self::AudioCapture => DeviceErrorKind::NotFound.guidance().to_string(),
            Self::NotAllowed | Self::ServiceNotAllowed => {
                DeviceErrorKind::PermissionDenied.guidance().to_string()
            }
            Self::Network => {
                "Speech recognition lost its network connection. Check your connection and start voice mode again."
                    .to_string()
            }
            Self::LanguageNotSupported => {
                "Speech recognition does not support the configured language.".to_string()
            }
            other => format!("Speech recognition failed ({}).", other.as_str()),
        }
    }
}

impl fmt::Display for RecognitionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in voice mode
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    Device(DeviceErrorKind),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Recognition error: {0}")]
    Recognition(RecognitionErrorCode),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Utterance interrupted")]
    Interrupted,

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("A voice session is already active")]
    SessionActive,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Text suitable for the chat surface.
    pub fn user_message(&self) -> String {
        match self {
            Self::Device(kind) => kind.guidance().to_string(),
            Self::Recognition(code) => code.user_message(),
            other => other.to_string(),
        }
    }
}

#[cfg(feature = "native-audio")]
impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                VoiceError::Device(DeviceErrorKind::NotFound)
            }
            cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
                VoiceError::Device(DeviceErrorKind::Unsupported)
            }
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

#[cfg(feature = "native-audio")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::Device(DeviceErrorKind::NotFound)
            }
            cpal::BuildStreamError::StreamConfigNotSupported
            | cpal::BuildStreamError::InvalidArgument => {
                VoiceError::Device(DeviceErrorKind::Unsupported)
            }
            // Backends report exclusive-mode conflicts as backend-specific errors.
            cpal::BuildStreamError::BackendSpecific { .. } => {
                VoiceError::Device(DeviceErrorKind::InUse)
            }
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

#[cfg(feature = "native-audio")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => {
                VoiceError::Device(DeviceErrorKind::NotFound)
            }
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}
