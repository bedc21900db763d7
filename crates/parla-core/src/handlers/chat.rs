//! Streaming chat continuation with background memory learning.

use super::{TaskHandler, TaskRequest};
use crate::chat::PendingTurn;
use crate::error::AssistantResult;
use crate::generation::{generate_structured, Content, GenerationClient, GenerationConfig};
use crate::memory::{MemoryBook, MemoryUpdate};
use crate::message::{Citation, MessageResult};
use crate::prompts;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ChatHandler {
    client: Arc<dyn GenerationClient>,
    memory: Option<Arc<MemoryBook>>,
    user_id: String,
    language: String,
    web_search: bool,
}

impl ChatHandler {
    pub fn new(client: Arc<dyn GenerationClient>, user_id: &str, language: &str) -> Self {
        Self {
            client,
            memory: None,
            user_id: user_id.to_string(),
            language: language.to_string(),
            web_search: true,
        }
    }

    pub fn with_memory(mut self, memory: Arc<MemoryBook>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_web_search(mut self, enabled: bool) -> Self {
        self.web_search = enabled;
        self
    }

    fn system_instruction(&self) -> String {
        let mut system = prompts::localize(prompts::CHAT, &self.language);
        if let Some(memory) = &self.memory {
            match memory.context_block(&self.user_id) {
                Ok(block) if !block.is_empty() => {
                    system.push_str("\n\n");
                    system.push_str(&block);
                }
                Ok(_) => {}
                Err(e) => warn!(target: "parla::store", "memory unavailable: {}", e),
            }
        }
        system
    }

    /// Fire-and-forget: extract facts from the exchange and merge them, and
    /// remember cited sources as shared knowledge.
    fn learn_in_background(&self, user_text: String, reply: String, citations: &[Citation]) {
        let Some(memory) = self.memory.clone() else { return };

        if !citations.is_empty() {
            let facts: Vec<String> = citations.iter().map(|c| c.title.clone()).collect();
            let shared = memory.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.learn_shared(facts) {
                    warn!(target: "parla::store", "shared knowledge update failed: {}", e);
                }
            });
        }

        let client = self.client.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            let schema = json!({
                "type": "object",
                "properties": {
                    "facts": { "type": "array", "items": { "type": "string" } },
                    "preferences": { "type": "array", "items": { "type": "string" } },
                    "summary": { "type": "string" },
                },
            });
            let exchange = format!("User: {}\nAssistant: {}", user_text, reply);
            let config = GenerationConfig::with_system(prompts::EXTRACT_FACTS)
                .schema(schema)
                .no_thinking();
            let update = match generate_structured::<MemoryUpdate>(
                client.as_ref(),
                vec![Content::user_text(exchange)],
                config,
            )
            .await
            {
                Ok(update) => update,
                Err(e) => {
                    debug!(target: "parla::store", "fact extraction failed: {}", e);
                    return;
                }
            };
            if update.is_empty() {
                return;
            }
            if let Err(e) = memory.learn(&user_id, update) {
                warn!(target: "parla::store", "user memory update failed: {}", e);
            }
        });
    }
}

#[async_trait]
impl TaskHandler for ChatHandler {
    fn name(&self) -> &'static str {
        "chat"
    }

    async fn run(&self, request: &TaskRequest, turn: &mut PendingTurn) -> AssistantResult<()> {
        let config = GenerationConfig {
            system_instruction: Some(self.system_instruction()),
            web_search: self.web_search,
            ..Default::default()
        };
        let mut rx = self.client.generate_stream(request.contents(), config).await?;

        let mut citations: Vec<Citation> = Vec::new();
        while let Some(item) = rx.recv().await {
            let chunk = item?;
            if !chunk.text.is_empty() {
                turn.append(&chunk.text);
            }
            for citation in chunk.citations {
                if !citations.iter().any(|c| c.uri == citation.uri) {
                    citations.push(citation);
                }
            }
        }

        let mut reply = turn.content();
        if reply.trim().is_empty() {
            reply = prompts::CHAT_FALLBACK.to_string();
            turn.set_content(&reply);
        }
        if !citations.is_empty() {
            turn.set_result(MessageResult::Sources {
                citations: citations.clone(),
            });
        }
        self.learn_in_background(request.text.clone(), reply, &citations);
        Ok(())
    }
}
