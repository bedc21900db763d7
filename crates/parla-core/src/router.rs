//! Intent Router: picks the task handler for a user turn.

use crate::attachment::Attachment;
use crate::error::AssistantResult;
use crate::generation::{generate_structured, Content, GenerationClient, GenerationConfig, Part};
use crate::message::AttachmentKind;
use crate::prompts;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Intent {
    Chat,
    ImageGenerate,
    ImageEdit,
    VideoGenerate,
    ImageSearch,
    VideoSearch,
    AudioSearch,
    MusicSearch,
    FileEdit,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Intent::Chat => "chat",
            Intent::ImageGenerate => "image-generate",
            Intent::ImageEdit => "image-edit",
            Intent::VideoGenerate => "video-generate",
            Intent::ImageSearch => "image-search",
            Intent::VideoSearch => "video-search",
            Intent::AudioSearch => "audio-search",
            Intent::MusicSearch => "music-search",
            Intent::FileEdit => "file-edit",
        };
        f.write_str(s)
    }
}

/// Intents the classification call may return.
const CLASSIFIABLE: &[&str] = &[
    "chat",
    "image-generate",
    "video-generate",
    "image-search",
    "video-search",
    "audio-search",
    "music-search",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    #[serde(default)]
    pub core_prompt: String,
}

impl Classification {
    pub fn chat(text: &str) -> Self {
        Self {
            intent: Intent::Chat,
            core_prompt: text.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct EditCheck {
    is_edit: bool,
}

fn edit_check_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": { "is_edit": { "type": "boolean" } },
        "required": ["is_edit"],
    })
}

pub struct IntentRouter {
    client: Arc<dyn GenerationClient>,
    max_attempts: u32,
    backoff: Duration,
}

impl IntentRouter {
    pub fn new(client: Arc<dyn GenerationClient>, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            client,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Retry transient failures with linear backoff (`backoff * attempt`).
    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> AssistantResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AssistantResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(target: "parla::router", attempt, call = what, "transient failure, retrying: {}", e);
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Classify free text. Never fails: anything but success falls back to chat.
    pub async fn classify(&self, text: &str) -> Classification {
        let schema = json!({
            "type": "object",
            "properties": {
                "intent": { "type": "string", "enum": CLASSIFIABLE },
                "core_prompt": { "type": "string" },
            },
            "required": ["intent", "core_prompt"],
        });
        let result = self
            .with_retry("classify", || {
                let config = GenerationConfig::with_system(prompts::CLASSIFY)
                    .schema(schema.clone())
                    .no_thinking();
                generate_structured::<Classification>(
                    self.client.as_ref(),
                    vec![Content::user_text(text)],
                    config,
                )
            })
            .await;

        match result {
            Ok(mut c) => {
                // Edit intents come only from the pre-checks.
                if matches!(c.intent, Intent::ImageEdit | Intent::FileEdit) {
                    c.intent = Intent::Chat;
                }
                if c.core_prompt.trim().is_empty() {
                    c.core_prompt = text.to_string();
                }
                info!(target: "parla::router", intent = %c.intent, "classified");
                c
            }
            Err(e) => {
                warn!(target: "parla::router", "classification failed, falling back to chat: {}", e);
                Classification::chat(text)
            }
        }
    }

    async fn edit_check(&self, instruction: &str, parts: Vec<Part>) -> bool {
        let result = self
            .with_retry("edit-check", || {
                let config = GenerationConfig::with_system(instruction)
                    .schema(edit_check_schema())
                    .no_thinking();
                generate_structured::<EditCheck>(
                    self.client.as_ref(),
                    vec![Content::user(parts.clone())],
                    config,
                )
            })
            .await;
        match result {
            Ok(check) => check.is_edit,
            Err(e) => {
                debug!(target: "parla::router", "edit check failed, assuming no: {}", e);
                false
            }
        }
    }

    /// Does `text` ask to modify the image the previous turn produced?
    pub async fn is_follow_up_edit(&self, text: &str) -> bool {
        self.edit_check(prompts::FOLLOW_UP_EDIT, vec![Part::text(text)])
            .await
    }

    /// Does `text` ask to transform the attached file (rather than ask about it)?
    pub async fn is_file_edit_request(&self, text: &str, attachment: &Attachment) -> bool {
        let parts = vec![
            Part::text(format!("[attached {}: {}]", attachment.kind(), attachment.name())),
            Part::text(text),
        ];
        self.edit_check(prompts::FILE_EDIT_CHECK, parts).await
    }

    /// Full routing decision for one turn.
    pub async fn route(
        &self,
        text: &str,
        attachment: Option<&Attachment>,
        follows_image: bool,
    ) -> Classification {
        if let Some(att) = attachment {
            let editable = matches!(att.kind(), AttachmentKind::Image | AttachmentKind::Pdf);
            if editable && !text.trim().is_empty() && self.is_file_edit_request(text, att).await {
                info!(target: "parla::router", intent = %Intent::FileEdit, "attachment edit");
                return Classification {
                    intent: Intent::FileEdit,
                    core_prompt: text.to_string(),
                };
            }
            return Classification::chat(text);
        }
        if follows_image && self.is_follow_up_edit(text).await {
            info!(target: "parla::router", intent = %Intent::ImageEdit, "follow-up edit");
            return Classification {
                intent: Intent::ImageEdit,
                core_prompt: text.to_string(),
            };
        }
        self.classify(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intents_use_kebab_case() {
        let c: Classification =
            serde_json::from_str(r#"{"intent":"music-search","core_prompt":"oud"}"#).unwrap();
        assert_eq!(c.intent, Intent::MusicSearch);
        assert_eq!(Intent::ImageGenerate.to_string(), "image-generate");
        assert!(serde_json::from_str::<Classification>(r#"{"intent":"dance"}"#).is_err());
    }
}
