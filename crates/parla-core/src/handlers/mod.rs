//! Task handlers: one per routed intent.
//!
//! A handler only ever mutates the [`PendingTurn`] it is given and never
//! finalizes it; [`run_handler`] is the catch boundary that does.

pub mod chat;
pub mod file_edit;
pub mod image;
pub mod search;
pub mod video;

use crate::attachment::Attachment;
use crate::chat::PendingTurn;
use crate::error::AssistantResult;
use crate::generation::{Content, InlineImage, Part};
use crate::message::{Message, Role};
use crate::router::Intent;
use async_trait::async_trait;
use tracing::{info, warn};

pub use chat::ChatHandler;
pub use file_edit::{FileEditHandler, ImageOp, MediaTools, NoMediaTools, PdfOp};
pub use image::ImageHandler;
pub use search::{HttpMediaProbe, MediaProbe, SearchHandler};
pub use video::VideoHandler;

/// Everything a handler knows about the turn.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub intent: Intent,
    /// What the user typed or said.
    pub text: String,
    /// The request reduced to its subject by the router.
    pub core_prompt: String,
    pub attachment: Option<Attachment>,
    /// Finished messages before this turn, oldest first.
    pub history: Vec<Message>,
    /// Image produced by the previous assistant turn, for follow-up edits.
    pub previous_image: Option<InlineImage>,
}

impl TaskRequest {
    /// Conversation history plus the current user message.
    pub fn contents(&self) -> Vec<Content> {
        let mut contents: Vec<Content> = self
            .history
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| match m.role {
                Role::User => Content::user_text(m.content.clone()),
                Role::Assistant => Content::model_text(m.content.clone()),
            })
            .collect();
        let mut parts = Vec::new();
        if let Some(att) = &self.attachment {
            parts.push(att.to_part());
        }
        if !self.text.trim().is_empty() || parts.is_empty() {
            parts.push(Part::text(self.text.clone()));
        }
        contents.push(Content::user(parts));
        contents
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, request: &TaskRequest, turn: &mut PendingTurn) -> AssistantResult<()>;
}

/// Run `handler` and finalize the turn: complete on success, failed with a
/// readable reason on any error.
pub async fn run_handler(
    handler: &dyn TaskHandler,
    request: &TaskRequest,
    mut turn: PendingTurn,
) -> Option<Message> {
    match handler.run(request, &mut turn).await {
        Ok(()) => {
            info!(target: "parla::router", handler = handler.name(), "turn complete");
            turn.complete()
        }
        Err(e) => {
            warn!(target: "parla::router", handler = handler.name(), "turn failed: {}", e);
            turn.fail(&e.user_message())
        }
    }
}
