//! Generation Client boundary.
//!
//! Request/response and streaming calls against the remote model, plus the
//! long-running operation protocol used for video.

use crate::error::{AssistantError, AssistantResult};
use crate::message::Citation;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// base64
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn inline(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Part::InlineData {
            inline_data: InlineData {
                mime_type: mime_type.into(),
                data: data.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// `user` or `model`.
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![Part::text(text)])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationConfig {
    pub system_instruction: Option<String>,
    /// Attach the web search tool; grounding sources come back as citations.
    pub web_search: bool,
    pub thinking_budget: Option<i32>,
    /// JSON schema for a structured response.
    pub response_schema: Option<serde_json::Value>,
    /// Overrides the client's default chat model.
    pub model: Option<String>,
}

impl GenerationConfig {
    pub fn with_system(instruction: impl Into<String>) -> Self {
        Self {
            system_instruction: Some(instruction.into()),
            ..Default::default()
        }
    }

    pub fn schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn no_thinking(mut self) -> Self {
        self.thinking_budget = Some(0);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime: String,
    /// base64
    pub data: String,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationOutput {
    pub text: String,
    pub citations: Vec<Citation>,
    pub images: Vec<InlineImage>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub text: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle(pub String);

#[derive(Debug, Clone, Default)]
pub struct OperationStatus {
    pub done: bool,
    pub video_uri: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(
        &self,
        contents: Vec<Content>,
        config: GenerationConfig,
    ) -> AssistantResult<GenerationOutput>;

    /// Chunks arrive in order; the channel closes when the stream ends. An
    /// `Err` item ends the stream.
    async fn generate_stream(
        &self,
        contents: Vec<Content>,
        config: GenerationConfig,
    ) -> AssistantResult<mpsc::Receiver<AssistantResult<StreamChunk>>>;

    /// Generate (or edit, when `source` is given) an image.
    async fn generate_image(
        &self,
        prompt: &str,
        source: Option<&InlineImage>,
    ) -> AssistantResult<InlineImage>;

    async fn start_video(&self, prompt: &str) -> AssistantResult<OperationHandle>;

    async fn get_operation(&self, handle: &OperationHandle) -> AssistantResult<OperationStatus>;

    async fn fetch_asset(&self, uri: &str) -> AssistantResult<FetchedAsset>;
}

static CODE_FENCE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n?(.*?)\n?\s*```\s*$").ok());

/// Remove a surrounding ```json fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let inner = CODE_FENCE
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1));
    match inner {
        Some(inner) => inner.as_str().trim(),
        None => text.trim(),
    }
}

/// Structured call: request JSON matching `schema` and parse it.
pub async fn generate_structured<T: DeserializeOwned>(
    client: &dyn GenerationClient,
    contents: Vec<Content>,
    config: GenerationConfig,
) -> AssistantResult<T> {
    let output = client.generate(contents, config).await?;
    let body = strip_code_fences(&output.text);
    serde_json::from_str(body)
        .map_err(|e| AssistantError::MalformedResponse(format!("{}: {}", e, truncate(body, 120))))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[1]\n```  "), "[1]");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn parts_serialize_like_the_rest_api() {
        let v = serde_json::to_value(Part::inline("image/png", "AAA")).unwrap();
        assert_eq!(v["inlineData"]["mimeType"], "image/png");
        let v = serde_json::to_value(Part::text("hi")).unwrap();
        assert_eq!(v["text"], "hi");
    }
}
