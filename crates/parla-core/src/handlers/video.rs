//! Video generation: submit, poll the long-running operation, download.
//!
//! Polling cannot be cancelled; it ends on completion or failure.

use super::{TaskHandler, TaskRequest};
use crate::chat::PendingTurn;
use crate::error::{AssistantError, AssistantResult, FetchFailure};
use crate::generation::GenerationClient;
use crate::message::MessageResult;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PROGRESS: &[&str] = &[
    "Composing the scenes...",
    "Rendering frames...",
    "Adding motion and light...",
    "Polishing the details...",
    "Almost there...",
];

/// Consecutive transient poll failures tolerated before giving up.
const MAX_POLL_ERRORS: u32 = 3;

pub struct VideoHandler {
    client: Arc<dyn GenerationClient>,
    poll_interval: Duration,
}

impl VideoHandler {
    pub fn new(client: Arc<dyn GenerationClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }
}

#[async_trait]
impl TaskHandler for VideoHandler {
    fn name(&self) -> &'static str {
        "video"
    }

    async fn run(&self, request: &TaskRequest, turn: &mut PendingTurn) -> AssistantResult<()> {
        turn.set_status_text("Submitting the video request...");
        let handle = self.client.start_video(&request.core_prompt).await?;
        info!(target: "parla::generation", operation = %handle.0, "polling video operation");

        let mut polls = 0usize;
        let mut errors = 0u32;
        let status = loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.client.get_operation(&handle).await {
                Ok(status) if status.done => break status,
                Ok(_) => errors = 0,
                Err(e) if e.is_transient() && errors < MAX_POLL_ERRORS => {
                    errors += 1;
                    warn!(target: "parla::generation", errors, "video poll failed: {}", e);
                }
                Err(e) => return Err(e),
            }
            turn.set_status_text(PROGRESS[polls % PROGRESS.len()]);
            polls += 1;
        };
        debug!(target: "parla::generation", polls, "video operation done");

        if let Some(error) = status.error {
            return Err(AssistantError::Generation(error));
        }
        let uri = status
            .video_uri
            .ok_or(AssistantError::ResourceFetch(FetchFailure::NoDownloadLink))?;

        turn.set_status_text("Downloading the video...");
        let asset = self.client.fetch_asset(&uri).await?;
        turn.set_content("Your video is ready.");
        turn.set_result(MessageResult::GeneratedVideo {
            uri,
            mime: asset.mime,
            data: STANDARD.encode(&asset.bytes),
        });
        Ok(())
    }
}
