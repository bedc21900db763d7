//! Assistant error taxonomy.
//!
//! Service failures are classified once, where the HTTP response is read, so
//! callers branch on variants instead of inspecting message text.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type AssistantResult<T> = Result<T, AssistantError>;

/// Why a generated asset could not be downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailure {
    /// 400 / 410: the signed link is malformed or has expired.
    InvalidOrExpired,
    /// 401 / 403
    Unauthorized,
    /// 404
    NotFound,
    /// The operation finished without a result link.
    NoDownloadLink,
    Status(u16),
    Transport,
}

impl FetchFailure {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 410 => Self::InvalidOrExpired,
            401 | 403 => Self::Unauthorized,
            404 => Self::NotFound,
            other => Self::Status(other),
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidOrExpired => {
                "The download link is invalid or has expired. Please try generating again.".to_string()
            }
            Self::Unauthorized => {
                "The download was not authorized. Check that the API key is valid.".to_string()
            }
            Self::NotFound => "The generated file could not be found on the server.".to_string(),
            Self::NoDownloadLink => {
                "The generation finished but returned no download link.".to_string()
            }
            Self::Status(code) => format!("Downloading the result failed (HTTP {}).", code),
            Self::Transport => {
                "Downloading the result failed because of a network problem.".to_string()
            }
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOrExpired => f.write_str("invalid or expired link"),
            Self::Unauthorized => f.write_str("unauthorized"),
            Self::NotFound => f.write_str("not found"),
            Self::NoDownloadLink => f.write_str("no download link"),
            Self::Status(code) => write!(f, "HTTP {}", code),
            Self::Transport => f.write_str("transport failure"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AssistantError {
    /// 5xx, 429 or a transport failure. Retried only on the classification path.
    #[error("transient service error ({status:?}): {message}")]
    Transient { status: Option<u16>, message: String },

    #[error("service error ({status}): {message}")]
    Service { status: u16, message: String },

    #[error("content policy rejection: {0}")]
    ContentPolicy(String),

    /// A long-running generation finished with an error of its own.
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("resource fetch failed: {0}")]
    ResourceFetch(FetchFailure),

    #[error("a response is already being generated")]
    Busy,

    #[error("attachment rejected: {0}")]
    Attachment(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("key already exists: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Store(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AssistantError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Text for a failed chat bubble.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transient { .. } => {
                "The service is temporarily unavailable. Please try again in a moment.".to_string()
            }
            Self::Service { status, .. } => {
                format!("The request could not be completed (error {}).", status)
            }
            Self::ContentPolicy(_) => {
                "This request was blocked by the content safety policy. Try rephrasing it.".to_string()
            }
            Self::Generation(reason) => format!("The generation failed: {}", reason),
            Self::MalformedResponse(_) => {
                "The response could not be understood. Please try again.".to_string()
            }
            Self::ResourceFetch(failure) => failure.user_message(),
            Self::Busy => "Please wait for the current response to finish.".to_string(),
            Self::Attachment(reason) => reason.clone(),
            Self::Unsupported(what) => format!("That is not supported: {}.", what),
            Self::Duplicate(_) | Self::NotFound(_) | Self::Store(_) | Self::Serde(_) => {
                "Local storage failed. Your message may not be saved.".to_string()
            }
            Self::Config(reason) => format!("The assistant is not configured: {}.", reason),
        }
    }
}

impl From<reqwest::Error> for AssistantError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::MalformedResponse(err.to_string());
        }
        match err.status() {
            Some(status) => classify_status(status.as_u16(), None, err.to_string()),
            None => Self::Transient {
                status: None,
                message: err.to_string(),
            },
        }
    }
}

/// Vendor status strings that mean "try again".
const TRANSIENT_VENDOR_STATUSES: &[&str] = &[
    "UNAVAILABLE",
    "INTERNAL",
    "DEADLINE_EXCEEDED",
    "RESOURCE_EXHAUSTED",
];

/// Map an HTTP status plus the optional Gemini `error.status` string to the taxonomy.
pub fn classify_status(status: u16, vendor_status: Option<&str>, message: String) -> AssistantError {
    let vendor_transient = vendor_status.is_some_and(|s| TRANSIENT_VENDOR_STATUSES.contains(&s));
    if vendor_transient || matches!(status, 429 | 500 | 502 | 503 | 504) {
        return AssistantError::Transient {
            status: Some(status),
            message,
        };
    }
    AssistantError::Service { status, message }
}
