//! Image generation and follow-up edits.
//!
//! Generation refines the request into a descriptive prompt first. A safety
//! rejection gets exactly one rephrase-and-retry.

use super::{TaskHandler, TaskRequest};
use crate::chat::PendingTurn;
use crate::error::{AssistantError, AssistantResult};
use crate::generation::{Content, GenerationClient, GenerationConfig, InlineImage};
use crate::message::MessageResult;
use crate::prompts;
use crate::router::Intent;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ImageHandler {
    client: Arc<dyn GenerationClient>,
}

impl ImageHandler {
    pub fn new(client: Arc<dyn GenerationClient>) -> Self {
        Self { client }
    }

    /// One plain-text rewrite call. Falls back to `input` on any failure.
    async fn rewrite(&self, instruction: &str, input: &str) -> String {
        let config = GenerationConfig::with_system(instruction).no_thinking();
        match self
            .client
            .generate(vec![Content::user_text(input)], config)
            .await
        {
            Ok(out) if !out.text.trim().is_empty() => out.text.trim().to_string(),
            Ok(_) => input.to_string(),
            Err(e) => {
                warn!(target: "parla::generation", "prompt rewrite failed, using original: {}", e);
                input.to_string()
            }
        }
    }
}

#[async_trait]
impl TaskHandler for ImageHandler {
    fn name(&self) -> &'static str {
        "image"
    }

    async fn run(&self, request: &TaskRequest, turn: &mut PendingTurn) -> AssistantResult<()> {
        let source: Option<&InlineImage> = match request.intent {
            Intent::ImageEdit => Some(request.previous_image.as_ref().ok_or_else(|| {
                AssistantError::NotFound("there is no earlier image to edit".to_string())
            })?),
            _ => None,
        };

        let mut prompt = if source.is_some() {
            turn.set_status_text("Editing the image...");
            request.text.clone()
        } else {
            turn.set_status_text("Refining your idea...");
            self.rewrite(prompts::REFINE_IMAGE, &request.core_prompt).await
        };

        turn.set_status_text("Generating the image...");
        let image = match self.client.generate_image(&prompt, source).await {
            Ok(image) => image,
            Err(AssistantError::ContentPolicy(reason)) => {
                info!(target: "parla::generation", reason = %reason, "image blocked, rephrasing once");
                turn.set_status_text("Adjusting the request...");
                prompt = self.rewrite(prompts::REPHRASE_IMAGE, &prompt).await;
                self.client.generate_image(&prompt, source).await?
            }
            Err(e) => return Err(e),
        };

        turn.set_content(if source.is_some() {
            "Here is the edited image."
        } else {
            "Here is your image."
        });
        turn.set_result(MessageResult::GeneratedImage {
            mime: image.mime,
            data: image.data,
            prompt,
        });
        Ok(())
    }
}
