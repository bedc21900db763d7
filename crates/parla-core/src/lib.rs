//! parla-core: assistant core (chat session state, intent router, task handlers,
//! media store, user memory and the Gemini generation client).
//!
//! Voice mode lives in `parla-voice`; front ends drive [`Assistant`] directly
//! or through a voice turn dispatcher.

mod assistant;
mod attachment;
mod chat;
mod config;
mod error;
mod export;
mod gemini;
mod memory;
mod message;
mod store;
pub mod generation;
pub mod handlers;
pub mod prompts;
pub mod router;

pub use assistant::Assistant;
pub use attachment::{prepare, sniff, Attachment, AttachmentInput, NoTranscoder, Transcoder, CONVERTIBLE_AUDIO};
pub use chat::{ChatSession, PendingTurn};
pub use config::{AppConfig, DEFAULT_API_BASE};
pub use error::{classify_status, AssistantError, AssistantResult, FetchFailure};
pub use export::{blobs_from_result, chat_export_blob, export_markdown, ExportBlob};
pub use gemini::GeminiClient;
pub use generation::{
    generate_structured, strip_code_fences, Content, FetchedAsset, GenerationClient,
    GenerationConfig, GenerationOutput, InlineImage, OperationHandle, OperationStatus, Part,
    StreamChunk,
};
pub use handlers::{
    run_handler, HttpMediaProbe, ImageOp, MediaProbe, MediaTools, NoMediaTools, PdfOp,
    TaskHandler, TaskRequest,
};
pub use memory::{MemoryBook, MemoryUpdate, SharedKnowledge, UserMemory};
pub use message::{
    AttachmentKind, AttachmentRef, Citation, FileBlob, MediaItem, MediaKind, Message,
    MessageResult, MessageStatus, Role,
};
pub use router::{Classification, Intent, IntentRouter};
pub use store::{Collection, Keyed, MediaStore};
