//! The assistant facade: admission control, attachment intake, routing and
//! the handler catch boundary for every user turn.

use crate::attachment::{prepare, sniff, AttachmentInput, NoTranscoder, Transcoder};
use crate::chat::{ChatSession, PendingTurn};
use crate::config::AppConfig;
use crate::error::{AssistantError, AssistantResult};
use crate::export::{blobs_from_result, chat_export_blob, export_markdown, ExportBlob};
use crate::gemini::GeminiClient;
use crate::generation::GenerationClient;
use crate::handlers::{
    run_handler, ChatHandler, FileEditHandler, HttpMediaProbe, ImageHandler, MediaProbe,
    MediaTools, NoMediaTools, SearchHandler, TaskHandler, TaskRequest, VideoHandler,
};
use crate::memory::MemoryBook;
use crate::message::{AttachmentRef, Message};
use crate::router::{Intent, IntentRouter};
use crate::store::MediaStore;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Assistant {
    config: Arc<AppConfig>,
    client: Arc<dyn GenerationClient>,
    session: ChatSession,
    memory: Arc<MemoryBook>,
    router: IntentRouter,
    probe: Arc<dyn MediaProbe>,
    tools: Arc<dyn MediaTools>,
    transcoder: Arc<dyn Transcoder>,
}

impl Assistant {
    /// Restores the persisted chat log from `store`.
    pub fn new(
        config: AppConfig,
        client: Arc<dyn GenerationClient>,
        store: MediaStore,
    ) -> AssistantResult<Self> {
        let session = ChatSession::restore(store.clone())?;
        let router = IntentRouter::new(
            client.clone(),
            config.classify_max_attempts,
            config.classify_backoff(),
        );
        info!(
            target: "parla::router",
            language = %config.language,
            messages = session.messages().len(),
            "assistant ready"
        );
        Ok(Self {
            config: Arc::new(config),
            client,
            session,
            memory: Arc::new(MemoryBook::new(store)),
            router,
            probe: Arc::new(HttpMediaProbe::new()),
            tools: Arc::new(NoMediaTools),
            transcoder: Arc::new(NoTranscoder),
        })
    }

    /// Gemini client and a store at `config.storage_path`.
    pub fn from_config(config: AppConfig) -> AssistantResult<Self> {
        let client: Arc<dyn GenerationClient> = Arc::new(GeminiClient::from_config(&config)?);
        let store = MediaStore::open_path(&config.storage_path)?;
        Self::new(config, client, store)
    }

    pub fn with_media_probe(mut self, probe: Arc<dyn MediaProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_media_tools(mut self, tools: Arc<dyn MediaTools>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub fn memory(&self) -> &MemoryBook {
        &self.memory
    }

    pub fn is_generating(&self) -> bool {
        self.session.is_generating()
    }

    fn handler(&self, intent: Intent) -> Box<dyn TaskHandler> {
        let client = self.client.clone();
        match intent {
            Intent::Chat => Box::new(
                ChatHandler::new(client, &self.config.user_id, &self.config.language)
                    .with_memory(self.memory.clone())
                    .with_web_search(self.config.chat_web_search),
            ),
            Intent::ImageGenerate | Intent::ImageEdit => Box::new(ImageHandler::new(client)),
            Intent::VideoGenerate => {
                Box::new(VideoHandler::new(client, self.config.video_poll_interval()))
            }
            Intent::ImageSearch | Intent::VideoSearch | Intent::AudioSearch | Intent::MusicSearch => {
                Box::new(SearchHandler::new(
                    client,
                    self.probe.clone(),
                    self.config.image_probe_timeout(),
                ))
            }
            Intent::FileEdit => Box::new(FileEditHandler::new(
                client,
                self.tools.clone(),
                &self.config.language,
            )),
        }
    }

    /// Send one user turn. Rejected with `Busy` while a turn is in flight and
    /// with `Attachment` for unsupported file types; every later failure
    /// ends up in the returned message instead.
    ///
    /// Returns `None` only if the log was cleared while the turn ran.
    pub async fn send(
        &self,
        text: &str,
        attachment: Option<AttachmentInput>,
    ) -> AssistantResult<Option<Message>> {
        if self.session.is_generating() {
            return Err(AssistantError::Busy);
        }
        let mut user = Message::user(text);
        if let Some(input) = &attachment {
            let (mime, kind) = sniff(input)?;
            user = user.with_attachment(AttachmentRef {
                name: input.name.clone(),
                mime,
                kind,
                size: input.bytes.len(),
            });
        }
        let user_id = user.id.clone();
        let turn = self.session.begin_turn(Some(user))?;
        Ok(self.dispatch(&user_id, text, attachment, turn).await)
    }

    /// Replace the text of an earlier user message and answer it again.
    /// Later messages are discarded; the original attachment is not resent.
    pub async fn edit_and_resend(&self, message_id: &str, text: &str) -> AssistantResult<Option<Message>> {
        let (edited, turn) = self.session.begin_edited_turn(message_id, text)?;
        Ok(self.dispatch(&edited.id, text, None, turn).await)
    }

    async fn dispatch(
        &self,
        user_id: &str,
        text: &str,
        input: Option<AttachmentInput>,
        mut turn: PendingTurn,
    ) -> Option<Message> {
        turn.set_status_text("Thinking...");
        let attachment = match input {
            Some(input) => {
                match prepare(input, self.transcoder.as_ref(), self.config.max_attachment_bytes).await {
                    Ok(attachment) => Some(attachment),
                    Err(e) => {
                        warn!(target: "parla::router", "attachment rejected: {}", e);
                        return turn.fail(&e.user_message());
                    }
                }
            }
            None => None,
        };

        let previous_image = self.session.previous_assistant_image(user_id);
        let classification = self
            .router
            .route(text, attachment.as_ref(), previous_image.is_some())
            .await;
        let request = TaskRequest {
            intent: classification.intent,
            text: text.to_string(),
            core_prompt: classification.core_prompt,
            attachment,
            history: self.session.history_before(user_id, self.config.history_limit),
            previous_image,
        };
        let handler = self.handler(request.intent);
        run_handler(handler.as_ref(), &request, turn).await
    }

    pub fn clear(&self) -> AssistantResult<()> {
        self.session.clear()
    }

    pub fn export_markdown(&self) -> String {
        export_markdown(&self.session.messages())
    }

    pub fn export_blob(&self) -> ExportBlob {
        chat_export_blob(&self.session.messages())
    }

    /// Downloadable media attached to a message.
    pub fn media_blobs(&self, message_id: &str) -> AssistantResult<Vec<ExportBlob>> {
        let message = self
            .session
            .message(message_id)
            .ok_or_else(|| AssistantError::NotFound(message_id.to_string()))?;
        match &message.result {
            Some(result) => blobs_from_result(result, &format!("parla-{}", &message.id[..8.min(message.id.len())])),
            None => Ok(Vec::new()),
        }
    }
}
