//! File edits on an attached image or PDF.
//!
//! A tool-classification call picks one concrete operation. Pixel and page
//! work goes through [`MediaTools`]; anything it cannot do degrades to an
//! explanatory reply instead of a failed turn.

use super::{TaskHandler, TaskRequest};
use crate::attachment::Attachment;
use crate::chat::PendingTurn;
use crate::error::{AssistantError, AssistantResult};
use crate::generation::{generate_structured, Content, GenerationClient, GenerationConfig, Part};
use crate::message::{AttachmentKind, FileBlob, MessageResult};
use crate::prompts;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum ImageOp {
    Crop {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    Rotate {
        degrees: i32,
    },
    Filter {
        name: String,
    },
    ColorAdjust {
        #[serde(default)]
        brightness: f32,
        #[serde(default)]
        contrast: f32,
        #[serde(default)]
        saturation: f32,
    },
    Flip {
        #[serde(default = "default_true")]
        horizontal: bool,
    },
    /// Regenerate the image from a prompt, keeping it as the reference.
    Reimagine {
        prompt: String,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvertTarget {
    Text,
    Images,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum PdfOp {
    Convert {
        #[serde(default = "default_target")]
        to: ConvertTarget,
    },
    Summarize,
    /// Split before each listed (1-based) page.
    Split {
        #[serde(default)]
        at: Vec<u32>,
    },
    RemovePages {
        pages: Vec<u32>,
    },
}

fn default_target() -> ConvertTarget {
    ConvertTarget::Text
}

/// Local image and PDF processing.
#[async_trait]
pub trait MediaTools: Send + Sync {
    /// Returns the edited image encoded as `mime`.
    async fn edit_image(&self, op: &ImageOp, mime: &str, bytes: &[u8]) -> AssistantResult<Vec<u8>>;
    async fn pdf_text(&self, pdf: &[u8]) -> AssistantResult<String>;
    /// One PNG per page.
    async fn render_pages(&self, pdf: &[u8]) -> AssistantResult<Vec<Vec<u8>>>;
    async fn remove_pages(&self, pdf: &[u8], pages: &[u32]) -> AssistantResult<Vec<u8>>;
    async fn split_pages(&self, pdf: &[u8], at: &[u32]) -> AssistantResult<Vec<Vec<u8>>>;
}

/// No local processing available.
pub struct NoMediaTools;

#[async_trait]
impl MediaTools for NoMediaTools {
    async fn edit_image(&self, op: &ImageOp, _mime: &str, _bytes: &[u8]) -> AssistantResult<Vec<u8>> {
        Err(AssistantError::Unsupported(format!("local image editing ({})", op_name_image(op))))
    }

    async fn pdf_text(&self, _pdf: &[u8]) -> AssistantResult<String> {
        Err(AssistantError::Unsupported("PDF text extraction".to_string()))
    }

    async fn render_pages(&self, _pdf: &[u8]) -> AssistantResult<Vec<Vec<u8>>> {
        Err(AssistantError::Unsupported("PDF page rendering".to_string()))
    }

    async fn remove_pages(&self, _pdf: &[u8], _pages: &[u32]) -> AssistantResult<Vec<u8>> {
        Err(AssistantError::Unsupported("removing PDF pages".to_string()))
    }

    async fn split_pages(&self, _pdf: &[u8], _at: &[u32]) -> AssistantResult<Vec<Vec<u8>>> {
        Err(AssistantError::Unsupported("splitting PDFs".to_string()))
    }
}

fn op_name_image(op: &ImageOp) -> &'static str {
    match op {
        ImageOp::Crop { .. } => "crop",
        ImageOp::Rotate { .. } => "rotate",
        ImageOp::Filter { .. } => "filter",
        ImageOp::ColorAdjust { .. } => "color-adjust",
        ImageOp::Flip { .. } => "flip",
        ImageOp::Reimagine { .. } => "reimagine",
    }
}

#[derive(Debug, Deserialize)]
struct ToolChoice {
    operation: String,
    #[serde(default)]
    args: serde_json::Value,
    #[serde(default)]
    reason: Option<String>,
}

impl ToolChoice {
    /// Fold `args` into the tagged object the op enums deserialize from.
    fn tagged(&self) -> serde_json::Value {
        let mut obj = match &self.args {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        obj.insert("operation".into(), json!(self.operation));
        serde_json::Value::Object(obj)
    }
}

enum Plan {
    Image(ImageOp),
    Pdf(PdfOp),
    Decline(String),
}

fn plan(kind: AttachmentKind, choice: &ToolChoice) -> Plan {
    if choice.operation == "unsupported" {
        return Plan::Decline(
            choice
                .reason
                .clone()
                .unwrap_or_else(|| "that edit is not available".to_string()),
        );
    }
    let parsed = match kind {
        AttachmentKind::Image => serde_json::from_value(choice.tagged()).map(Plan::Image),
        AttachmentKind::Pdf => serde_json::from_value(choice.tagged()).map(Plan::Pdf),
        AttachmentKind::Audio => return Plan::Decline("audio files cannot be edited".to_string()),
    };
    parsed.unwrap_or_else(|_| {
        Plan::Decline(format!("\"{}\" is not an operation for a {} file", choice.operation, kind))
    })
}

fn stem(name: &str) -> &str {
    name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name)
}

fn blob(filename: String, mime: &str, bytes: &[u8]) -> FileBlob {
    FileBlob {
        filename,
        mime: mime.to_string(),
        data: STANDARD.encode(bytes),
    }
}

pub struct FileEditHandler {
    client: Arc<dyn GenerationClient>,
    tools: Arc<dyn MediaTools>,
    language: String,
}

impl FileEditHandler {
    pub fn new(client: Arc<dyn GenerationClient>, tools: Arc<dyn MediaTools>, language: &str) -> Self {
        Self {
            client,
            tools,
            language: language.to_string(),
        }
    }

    async fn choose(&self, request: &TaskRequest, attachment: &Attachment) -> AssistantResult<ToolChoice> {
        let schema = json!({
            "type": "object",
            "properties": {
                "operation": { "type": "string" },
                "args": { "type": "object" },
                "reason": { "type": "string" },
            },
            "required": ["operation"],
        });
        let parts = vec![
            Part::text(format!("[attached {}: {}]", attachment.kind(), attachment.name())),
            Part::text(request.text.clone()),
        ];
        generate_structured(
            self.client.as_ref(),
            vec![Content::user(parts)],
            GenerationConfig::with_system(prompts::FILE_TOOL)
                .schema(schema)
                .no_thinking(),
        )
        .await
    }

    async fn run_image(
        &self,
        op: ImageOp,
        attachment: &Attachment,
        turn: &mut PendingTurn,
    ) -> AssistantResult<()> {
        if let ImageOp::Reimagine { prompt } = &op {
            let source = attachment.as_inline_image();
            let image = self.client.generate_image(prompt, source.as_ref()).await?;
            turn.set_content("Here is the reimagined image.");
            turn.set_result(MessageResult::GeneratedImage {
                mime: image.mime,
                data: image.data,
                prompt: prompt.clone(),
            });
            return Ok(());
        }
        let edited = self
            .tools
            .edit_image(&op, attachment.mime(), &attachment.bytes()?)
            .await?;
        let filename = format!("{}-{}.{}", stem(attachment.name()), op_name_image(&op), extension(attachment.mime()));
        turn.set_content("Here is the edited image.");
        turn.set_result(MessageResult::Files {
            files: vec![blob(filename, attachment.mime(), &edited)],
        });
        Ok(())
    }

    async fn run_pdf(&self, op: PdfOp, attachment: &Attachment, turn: &mut PendingTurn) -> AssistantResult<()> {
        let pdf = attachment.bytes()?;
        let base = stem(attachment.name()).to_string();
        match op {
            PdfOp::Convert { to: ConvertTarget::Text } => {
                let text = self.tools.pdf_text(&pdf).await?;
                turn.set_content("The document was converted to text.");
                turn.set_result(MessageResult::Files {
                    files: vec![blob(format!("{}.txt", base), "text/plain", text.as_bytes())],
                });
            }
            PdfOp::Convert { to: ConvertTarget::Images } => {
                let pages = self.tools.render_pages(&pdf).await?;
                let files = pages
                    .iter()
                    .enumerate()
                    .map(|(i, png)| blob(format!("{}-page-{}.png", base, i + 1), "image/png", png))
                    .collect();
                turn.set_content(&format!("The document was converted to {} images.", pages.len()));
                turn.set_result(MessageResult::Files { files });
            }
            PdfOp::Summarize => {
                turn.set_status_text("Reading the document...");
                let summary = self.summarize(&pdf, attachment).await?;
                turn.set_content(&summary);
            }
            PdfOp::Split { at } => {
                let parts = self.tools.split_pages(&pdf, &at).await?;
                let files = parts
                    .iter()
                    .enumerate()
                    .map(|(i, doc)| blob(format!("{}-part-{}.pdf", base, i + 1), "application/pdf", doc))
                    .collect();
                turn.set_content(&format!("The document was split into {} parts.", parts.len()));
                turn.set_result(MessageResult::Files { files });
            }
            PdfOp::RemovePages { pages } => {
                let doc = self.tools.remove_pages(&pdf, &pages).await?;
                turn.set_content(&format!("Removed {} page(s).", pages.len()));
                turn.set_result(MessageResult::Files {
                    files: vec![blob(format!("{}-edited.pdf", base), "application/pdf", &doc)],
                });
            }
        }
        Ok(())
    }

    /// Summarize extracted text, or let the model read the PDF itself when
    /// local extraction is unavailable.
    async fn summarize(&self, pdf: &[u8], attachment: &Attachment) -> AssistantResult<String> {
        let config = GenerationConfig::with_system(prompts::localize(prompts::SUMMARIZE_PDF, &self.language));
        let part = match self.tools.pdf_text(pdf).await {
            Ok(text) if !text.trim().is_empty() => Part::text(text),
            Ok(_) | Err(AssistantError::Unsupported(_)) => attachment.to_part(),
            Err(e) => return Err(e),
        };
        let out = self.client.generate(vec![Content::user(vec![part])], config).await?;
        Ok(out.text.trim().to_string())
    }
}

fn extension(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

#[async_trait]
impl TaskHandler for FileEditHandler {
    fn name(&self) -> &'static str {
        "file-edit"
    }

    async fn run(&self, request: &TaskRequest, turn: &mut PendingTurn) -> AssistantResult<()> {
        let attachment = request
            .attachment
            .as_ref()
            .ok_or_else(|| AssistantError::Attachment("Attach a file to edit.".to_string()))?;
        turn.set_status_text("Working on your file...");

        let choice = match self.choose(request, attachment).await {
            Ok(choice) => choice,
            Err(AssistantError::MalformedResponse(e)) => {
                warn!(target: "parla::router", "tool choice unreadable: {}", e);
                ToolChoice {
                    operation: "unsupported".to_string(),
                    args: serde_json::Value::Null,
                    reason: Some("I could not work out which edit you want".to_string()),
                }
            }
            Err(e) => return Err(e),
        };
        info!(target: "parla::router", operation = %choice.operation, kind = %attachment.kind(), "file edit");

        let outcome = match plan(attachment.kind(), &choice) {
            Plan::Image(op) => self.run_image(op, attachment, turn).await,
            Plan::Pdf(op) => self.run_pdf(op, attachment, turn).await,
            Plan::Decline(reason) => Err(AssistantError::Unsupported(reason)),
        };
        match outcome {
            Err(AssistantError::Unsupported(what)) => {
                turn.set_content(&format!(
                    "Sorry, I can't do that with this file: {}. I can crop, rotate, flip, filter, adjust colors or reimagine images, and convert, summarize, split or remove pages from PDFs.",
                    what
                ));
                Ok(())
            }
            other => other,
        }
    }
}
