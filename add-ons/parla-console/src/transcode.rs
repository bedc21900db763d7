//! Audio uploads in formats the model will not take are decoded locally.

use async_trait::async_trait;
use parla_core::{AssistantError, AssistantResult, Transcoder};

pub struct RodioTranscoder;

#[async_trait]
impl Transcoder for RodioTranscoder {
    async fn to_wav(&self, mime: &str, bytes: &[u8]) -> AssistantResult<Vec<u8>> {
        let bytes = bytes.to_vec();
        let wav = tokio::task::spawn_blocking(move || parla_voice::decode_to_wav(bytes))
            .await
            .map_err(|e| AssistantError::Attachment(format!("Audio conversion stopped: {}", e)))?;
        wav.map_err(|e| AssistantError::Attachment(format!("Could not convert {} audio: {}", mime, e)))
    }
}
