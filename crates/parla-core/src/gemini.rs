//! Gemini REST implementation of [`GenerationClient`].

use crate::config::AppConfig;
use crate::error::{classify_status, AssistantError, AssistantResult, FetchFailure};
use crate::generation::{
    Content, FetchedAsset, GenerationClient, GenerationConfig, GenerationOutput, InlineImage,
    OperationHandle, OperationStatus, Part, StreamChunk,
};
use crate::message::Citation;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Finish reasons that mean the output was withheld by a safety filter.
const SAFETY_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "IMAGE_SAFETY",
];

pub struct GeminiClient {
    client: Client,
    api_base: String,
    api_key: String,
    chat_model: String,
    image_model: String,
    video_model: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        let d = AppConfig::default();
        Self {
            client: Client::new(),
            api_base: d.api_base,
            api_key: api_key.into(),
            chat_model: d.chat_model,
            image_model: d.image_model,
            video_model: d.video_model,
        }
    }

    pub fn from_config(config: &AppConfig) -> AssistantResult<Self> {
        let api_key = config
            .gemini_api_key
            .clone()
            .ok_or_else(|| AssistantError::Config("GEMINI_API_KEY is not set".to_string()))?;
        Ok(Self {
            client: Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            chat_model: config.chat_model.clone(),
            image_model: config.image_model.clone(),
            video_model: config.video_model.clone(),
        })
    }

    /// Point the client at another endpoint (proxies, local test servers).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.api_base, model, method)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> AssistantResult<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> AssistantResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read Gemini error body".to_string());
    Err(map_http_error(status, body))
}

fn map_http_error(status: u16, body: String) -> AssistantError {
    match serde_json::from_str::<ErrorWrapper>(&body) {
        Ok(wrapper) => {
            let message = wrapper.error.message.unwrap_or_else(|| body.clone());
            classify_status(status, wrapper.error.status.as_deref(), message)
        }
        Err(_) => classify_status(status, None, body),
    }
}

#[derive(Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: &'a [Content],
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

impl<'a> GenerateContentRequest<'a> {
    fn build(contents: &'a [Content], config: &GenerationConfig) -> Self {
        let mut generation_config = serde_json::Map::new();
        if let Some(budget) = config.thinking_budget {
            generation_config.insert("thinkingConfig".into(), json!({ "thinkingBudget": budget }));
        }
        if let Some(schema) = &config.response_schema {
            generation_config.insert("responseMimeType".into(), json!("application/json"));
            generation_config.insert("responseSchema".into(), schema.clone());
        }
        Self {
            contents,
            system_instruction: config.system_instruction.as_ref().map(|s| SystemInstruction {
                parts: vec![Part::text(s.clone())],
            }),
            tools: if config.web_search {
                vec![json!({ "google_search": {} })]
            } else {
                Vec::new()
            },
            generation_config: if generation_config.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(generation_config))
            },
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    inline_data: Option<ResponseInlineData>,
    /// Thought summaries are not part of the answer.
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    uri: Option<String>,
    title: Option<String>,
}

impl GenerateContentResponse {
    fn blocked_reason(&self) -> Option<String> {
        if let Some(reason) = self.prompt_feedback.as_ref().and_then(|f| f.block_reason.clone()) {
            return Some(reason);
        }
        self.candidates
            .iter()
            .filter_map(|c| c.finish_reason.as_deref())
            .find(|r| SAFETY_FINISH_REASONS.contains(r))
            .map(str::to_string)
    }

    fn into_output(self) -> AssistantResult<GenerationOutput> {
        if let Some(reason) = self.blocked_reason() {
            return Err(AssistantError::ContentPolicy(reason));
        }
        let mut out = GenerationOutput::default();
        for candidate in self.candidates {
            if let Some(meta) = candidate.grounding_metadata {
                out.citations.extend(citations_from(meta));
            }
            let Some(content) = candidate.content else { continue };
            for part in content.parts {
                if part.thought {
                    continue;
                }
                if let Some(text) = part.text {
                    out.text.push_str(&text);
                }
                if let Some(inline) = part.inline_data {
                    out.images.push(InlineImage {
                        mime: inline.mime_type,
                        data: inline.data,
                    });
                }
            }
        }
        Ok(out)
    }
}

fn citations_from(meta: GroundingMetadata) -> impl Iterator<Item = Citation> {
    meta.grounding_chunks.into_iter().filter_map(|chunk| {
        let web = chunk.web?;
        let uri = web.uri?;
        Some(Citation {
            title: web.title.unwrap_or_else(|| uri.clone()),
            uri,
        })
    })
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    name: Option<String>,
    #[serde(default)]
    done: bool,
    error: Option<ErrorBody>,
    response: Option<VideoResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResponse {
    generate_video_response: Option<GenerateVideoResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateVideoResponse {
    #[serde(default)]
    generated_samples: Vec<GeneratedSample>,
}

#[derive(Debug, Deserialize)]
struct GeneratedSample {
    video: Option<VideoRef>,
}

#[derive(Debug, Deserialize)]
struct VideoRef {
    uri: Option<String>,
}

impl OperationResponse {
    fn into_status(self) -> OperationStatus {
        let video_uri = self
            .response
            .and_then(|r| r.generate_video_response)
            .and_then(|r| r.generated_samples.into_iter().find_map(|s| s.video?.uri));
        OperationStatus {
            done: self.done,
            video_uri,
            error: self.error.and_then(|e| e.message),
        }
    }
}

/// Parse one SSE `data:` payload into a chunk.
/// Splits an SSE byte stream into lines. Bytes are held until a newline
/// arrives, so a character split across network chunks stays intact.
#[derive(Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            match std::str::from_utf8(&line) {
                Ok(text) => lines.push(text.trim().to_string()),
                Err(e) => warn!(target: "parla::generation", "dropping non-UTF-8 SSE line: {}", e),
            }
        }
        lines
    }
}

fn parse_stream_event(data: &str) -> AssistantResult<StreamChunk> {
    let response: GenerateContentResponse = serde_json::from_str(data)?;
    let output = response.into_output()?;
    Ok(StreamChunk {
        text: output.text,
        citations: output.citations,
    })
}

#[async_trait]
impl GenerationClient for GeminiClient {
    async fn generate(
        &self,
        contents: Vec<Content>,
        config: GenerationConfig,
    ) -> AssistantResult<GenerationOutput> {
        let model = config.model.clone().unwrap_or_else(|| self.chat_model.clone());
        let body = GenerateContentRequest::build(&contents, &config);
        let response = self
            .post_json(&self.model_url(&model, "generateContent"), &body)
            .await?;
        let parsed: GenerateContentResponse = response.json().await?;
        debug!(target: "parla::generation", model = %model, "generateContent completed");
        parsed.into_output()
    }

    async fn generate_stream(
        &self,
        contents: Vec<Content>,
        config: GenerationConfig,
    ) -> AssistantResult<mpsc::Receiver<AssistantResult<StreamChunk>>> {
        let model = config.model.clone().unwrap_or_else(|| self.chat_model.clone());
        let body = GenerateContentRequest::build(&contents, &config);
        let url = format!("{}?alt=sse", self.model_url(&model, "streamGenerateContent"));
        let response = self.post_json(&url, &body).await?;

        let (tx, rx) = mpsc::channel::<AssistantResult<StreamChunk>>(100);
        tokio::spawn(async move {
            use futures_util::TryStreamExt;
            let mut stream = response.bytes_stream();
            let mut lines = SseLines::default();

            loop {
                let bytes = match stream.try_next().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(AssistantError::from(e))).await;
                        return;
                    }
                };

                for line in lines.push(&bytes) {
                    let Some(data) = line.strip_prefix("data:") else { continue };
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    match parse_stream_event(data) {
                        Ok(chunk) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                        }
                        Err(AssistantError::Serde(e)) => {
                            debug!(target: "parla::generation", "Failed to parse SSE chunk: {}", e);
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
            debug!(target: "parla::generation", model = %model, "stream completed");
        });

        Ok(rx)
    }

    async fn generate_image(
        &self,
        prompt: &str,
        source: Option<&InlineImage>,
    ) -> AssistantResult<InlineImage> {
        let mut parts = Vec::new();
        if let Some(image) = source {
            parts.push(Part::inline(image.mime.clone(), image.data.clone()));
        }
        parts.push(Part::text(prompt));
        let contents = [Content::user(parts)];
        let body = json!({
            "contents": contents,
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
        });
        let response = self
            .post_json(&self.model_url(&self.image_model, "generateContent"), &body)
            .await?;
        let parsed: GenerateContentResponse = response.json().await?;
        let output = parsed.into_output()?;
        output.images.into_iter().next().ok_or_else(|| {
            AssistantError::MalformedResponse("image model returned no image".to_string())
        })
    }

    async fn start_video(&self, prompt: &str) -> AssistantResult<OperationHandle> {
        let body = json!({ "instances": [{ "prompt": prompt }] });
        let response = self
            .post_json(&self.model_url(&self.video_model, "predictLongRunning"), &body)
            .await?;
        let op: OperationResponse = response.json().await?;
        let name = op.name.ok_or_else(|| {
            AssistantError::MalformedResponse("video operation has no name".to_string())
        })?;
        debug!(target: "parla::generation", operation = %name, "video operation started");
        Ok(OperationHandle(name))
    }

    async fn get_operation(&self, handle: &OperationHandle) -> AssistantResult<OperationStatus> {
        let url = format!("{}/{}", self.api_base, handle.0);
        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let response = check_status(response).await?;
        let op: OperationResponse = response.json().await?;
        Ok(op.into_status())
    }

    async fn fetch_asset(&self, uri: &str) -> AssistantResult<FetchedAsset> {
        let response = self
            .client
            .get(uri)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "parla::generation", "asset download failed: {}", e);
                AssistantError::ResourceFetch(FetchFailure::Transport)
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AssistantError::ResourceFetch(FetchFailure::from_status(
                status.as_u16(),
            )));
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("video/mp4")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|_| AssistantError::ResourceFetch(FetchFailure::Transport))?;
        Ok(FetchedAsset {
            mime,
            bytes: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_tools_and_schema() {
        let contents = vec![Content::user_text("hi")];
        let config = GenerationConfig {
            system_instruction: Some("sys".into()),
            web_search: true,
            thinking_budget: Some(0),
            response_schema: Some(json!({"type": "object"})),
            model: None,
        };
        let v = serde_json::to_value(GenerateContentRequest::build(&contents, &config)).unwrap();
        assert_eq!(v["systemInstruction"]["parts"][0]["text"], "sys");
        assert!(v["tools"][0].get("google_search").is_some());
        assert_eq!(v["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(v["generationConfig"]["thinkingConfig"]["thinkingBudget"], 0);
    }

    #[test]
    fn plain_request_omits_optional_sections() {
        let contents = vec![Content::user_text("hi")];
        let v = serde_json::to_value(GenerateContentRequest::build(
            &contents,
            &GenerationConfig::default(),
        ))
        .unwrap();
        assert!(v.get("tools").is_none());
        assert!(v.get("generationConfig").is_none());
        assert!(v.get("systemInstruction").is_none());
    }

    #[test]
    fn response_text_and_citations() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"thinking","thought":true},{"text":"Hello"},{"text":" there"}]},
            "finishReason":"STOP",
            "groundingMetadata":{"groundingChunks":[{"web":{"uri":"https://a","title":"A"}},{"web":{"uri":"https://b"}}]}}]}"#;
        let parsed: GenerateContentResponse = serde_json::from_str(body).unwrap();
        let out = parsed.into_output().unwrap();
        assert_eq!(out.text, "Hello there");
        assert_eq!(out.citations.len(), 2);
        assert_eq!(out.citations[1].title, "https://b");
    }

    #[test]
    fn safety_is_read_from_typed_fields() {
        let blocked: GenerateContentResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert!(matches!(blocked.into_output(), Err(AssistantError::ContentPolicy(_))));

        let finished: GenerateContentResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"IMAGE_SAFETY"}]}"#).unwrap();
        assert!(matches!(finished.into_output(), Err(AssistantError::ContentPolicy(_))));

        let safe_words: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"safety first"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert!(safe_words.into_output().is_ok());
    }

    #[test]
    fn operation_status_finds_video_uri() {
        let op: OperationResponse = serde_json::from_str(
            r#"{"name":"operations/1","done":true,"response":{"generateVideoResponse":{"generatedSamples":[{"video":{"uri":"https://v"}}]}}}"#,
        )
        .unwrap();
        let status = op.into_status();
        assert!(status.done);
        assert_eq!(status.video_uri.as_deref(), Some("https://v"));

        let empty: OperationResponse = serde_json::from_str(r#"{"done":true,"response":{}}"#).unwrap();
        assert!(empty.into_status().video_uri.is_none());
    }

    #[test]
    fn http_errors_use_vendor_status() {
        let body = r#"{"error":{"code":503,"message":"overloaded","status":"UNAVAILABLE"}}"#;
        assert!(map_http_error(503, body.to_string()).is_transient());
        let body = r#"{"error":{"code":400,"message":"bad","status":"INVALID_ARGUMENT"}}"#;
        assert!(matches!(
            map_http_error(400, body.to_string()),
            AssistantError::Service { status: 400, .. }
        ));
    }

    #[test]
    fn sse_lines_keep_characters_split_across_chunks() {
        let event = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"مرحبا\"}]}}]}\n\n";
        let bytes = event.as_bytes();
        let split = event.find('م').unwrap() + 1;

        let mut lines = SseLines::default();
        assert!(lines.push(&bytes[..split]).is_empty());
        let out = lines.push(&bytes[split..]);
        assert_eq!(out.len(), 2);
        let data = out[0].strip_prefix("data:").unwrap().trim();
        assert_eq!(parse_stream_event(data).unwrap().text, "مرحبا");
        assert_eq!(out[1], "");
    }

    #[test]
    fn stream_event_parses_chunk() {
        let chunk = parse_stream_event(r#"{"candidates":[{"content":{"parts":[{"text":"Hi"}]}}]}"#).unwrap();
        assert_eq!(chunk.text, "Hi");
    }
}
