//! Attachment intake: MIME sniffing, audio transcoding and the encoded size limit.

use crate::error::{AssistantError, AssistantResult};
use crate::generation::{InlineImage, Part};
use crate::message::{AttachmentKind, AttachmentRef};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Audio types that must be transcoded to `audio/wav` before upload.
pub const CONVERTIBLE_AUDIO: &[&str] = &[
    "audio/x-m4a",
    "audio/mp4",
    "audio/aac",
    "audio/ogg",
    "audio/webm",
    "audio/amr",
    "audio/3gpp",
];

const CANONICAL_AUDIO: &str = "audio/wav";

/// A file as the user provided it.
#[derive(Debug, Clone)]
pub struct AttachmentInput {
    pub name: String,
    /// Declared type; may be empty or generic.
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl AttachmentInput {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes,
        }
    }

    /// Read a file from disk, guessing its type from the extension.
    pub async fn from_path(path: impl AsRef<std::path::Path>) -> AssistantResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| AssistantError::Attachment(format!("Could not read {}: {}", path.display(), e)))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let mime = mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_default();
        Ok(Self { name, mime, bytes })
    }
}

/// Converts audio to a canonical playable format.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Returns WAV bytes.
    async fn to_wav(&self, mime: &str, bytes: &[u8]) -> AssistantResult<Vec<u8>>;
}

/// No conversion available; convertible audio is rejected.
pub struct NoTranscoder;

#[async_trait]
impl Transcoder for NoTranscoder {
    async fn to_wav(&self, mime: &str, _bytes: &[u8]) -> AssistantResult<Vec<u8>> {
        Err(AssistantError::Unsupported(format!("converting {} audio", mime)))
    }
}

/// A validated attachment. Immutable; lives for one send.
#[derive(Debug, Clone)]
pub struct Attachment {
    name: String,
    mime: String,
    kind: AttachmentKind,
    encoded: String,
    raw_len: usize,
}

impl Attachment {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn kind(&self) -> AttachmentKind {
        self.kind
    }

    /// base64
    pub fn data(&self) -> &str {
        &self.encoded
    }

    pub fn bytes(&self) -> AssistantResult<Vec<u8>> {
        STANDARD
            .decode(&self.encoded)
            .map_err(|e| AssistantError::Attachment(e.to_string()))
    }

    pub fn to_part(&self) -> Part {
        Part::inline(self.mime.clone(), self.encoded.clone())
    }

    pub fn as_inline_image(&self) -> Option<InlineImage> {
        (self.kind == AttachmentKind::Image).then(|| InlineImage {
            mime: self.mime.clone(),
            data: self.encoded.clone(),
        })
    }

    pub fn reference(&self) -> AttachmentRef {
        AttachmentRef {
            name: self.name.clone(),
            mime: self.mime.clone(),
            kind: self.kind,
            size: self.raw_len,
        }
    }
}

/// Resolve the effective MIME type and kind. Falls back to the file
/// extension when the declared type is missing or generic.
pub fn sniff(input: &AttachmentInput) -> AssistantResult<(String, AttachmentKind)> {
    let declared = input.mime.trim().to_ascii_lowercase();
    let mime = if declared.is_empty() || declared == "application/octet-stream" {
        mime_guess::from_path(&input.name)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or(declared)
    } else {
        declared
    };

    let kind = if mime.starts_with("image/") {
        AttachmentKind::Image
    } else if mime == "application/pdf" {
        AttachmentKind::Pdf
    } else if mime.starts_with("audio/") {
        AttachmentKind::Audio
    } else {
        return Err(AssistantError::Attachment(format!(
            "Files of type \"{}\" are not supported. Attach an image, a PDF or an audio file.",
            if mime.is_empty() { "unknown" } else { mime.as_str() }
        )));
    };
    Ok((mime, kind))
}

/// Validate, transcode and encode.
pub async fn prepare(
    input: AttachmentInput,
    transcoder: &dyn Transcoder,
    max_encoded_bytes: usize,
) -> AssistantResult<Attachment> {
    let (mut mime, kind) = sniff(&input)?;
    let mut bytes = input.bytes;
    if kind == AttachmentKind::Audio && CONVERTIBLE_AUDIO.contains(&mime.as_str()) {
        bytes = transcoder.to_wav(&mime, &bytes).await?;
        mime = CANONICAL_AUDIO.to_string();
    }

    let encoded = STANDARD.encode(&bytes);
    if encoded.len() > max_encoded_bytes {
        return Err(AssistantError::Attachment(format!(
            "The file is too large ({:.1} MB encoded, limit {:.1} MB).",
            encoded.len() as f64 / (1024.0 * 1024.0),
            max_encoded_bytes as f64 / (1024.0 * 1024.0),
        )));
    }

    Ok(Attachment {
        name: input.name,
        mime,
        kind,
        encoded,
        raw_len: bytes.len(),
    })
}
