//! Exported artifacts: the chat log as markdown and media as downloadable blobs.

use crate::error::{AssistantError, AssistantResult};
use crate::message::{Message, MessageResult, MessageStatus, Role};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBlob {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl ExportBlob {
    /// Write into `dir`, returning the full path.
    pub async fn save_to(&self, dir: impl AsRef<std::path::Path>) -> std::io::Result<std::path::PathBuf> {
        let path = dir.as_ref().join(&self.filename);
        tokio::fs::write(&path, &self.bytes).await?;
        Ok(path)
    }
}

pub fn export_markdown(messages: &[Message]) -> String {
    let mut out = String::from("# Conversation\n\n");
    for m in messages {
        let who = match m.role {
            Role::User => "You",
            Role::Assistant => "Parla",
        };
        let _ = writeln!(out, "## {} ({})", who, m.created_at.format("%Y-%m-%d %H:%M"));
        if m.edited {
            out.push_str("_edited_\n");
        }
        if let Some(att) = &m.attachment {
            let _ = writeln!(out, "_attachment: {} ({})_", att.name, att.mime);
        }
        out.push('\n');
        match m.status {
            MessageStatus::Failed => {
                let _ = writeln!(out, "> {}", m.content);
            }
            _ => {
                out.push_str(m.content.trim_end());
                out.push('\n');
            }
        }
        if let Some(result) = &m.result {
            render_result(&mut out, result);
        }
        out.push('\n');
    }
    out
}

fn render_result(out: &mut String, result: &MessageResult) {
    match result {
        MessageResult::Sources { citations } => {
            out.push_str("\nSources:\n");
            for c in citations {
                let _ = writeln!(out, "- [{}]({})", c.title, c.uri);
            }
        }
        MessageResult::GeneratedImage { prompt, .. } => {
            let _ = writeln!(out, "\n_generated image: {}_", prompt);
        }
        MessageResult::GeneratedVideo { uri, .. } => {
            let _ = writeln!(out, "\n_generated video: {}_", uri);
        }
        MessageResult::MediaResults { kind, items, sources } => {
            let _ = writeln!(out, "\n{} results:", kind);
            for i in items {
                let _ = writeln!(out, "- [{}]({})", i.title, i.url);
            }
            for s in sources {
                let _ = writeln!(out, "- [{}]({})", s.title, s.uri);
            }
        }
        MessageResult::Files { files } => {
            out.push_str("\nFiles:\n");
            for f in files {
                let _ = writeln!(out, "- {} ({})", f.filename, f.mime);
            }
        }
    }
}

pub fn chat_export_blob(messages: &[Message]) -> ExportBlob {
    ExportBlob {
        filename: format!("parla-chat-{}.md", Utc::now().format("%Y%m%d-%H%M%S")),
        mime: "text/markdown".to_string(),
        bytes: export_markdown(messages).into_bytes(),
    }
}

fn decode(data: &str) -> AssistantResult<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| AssistantError::MalformedResponse(format!("bad base64 payload: {}", e)))
}

fn extension_for(mime: &str) -> &str {
    match mime {
        "image/jpeg" => return "jpg",
        "video/mp4" => return "mp4",
        _ => {}
    }
    mime_guess::get_mime_extensions_str(mime)
        .and_then(|exts| exts.first().copied())
        .unwrap_or("bin")
}

/// Downloadable media carried by a message result. `stem` names the files.
pub fn blobs_from_result(result: &MessageResult, stem: &str) -> AssistantResult<Vec<ExportBlob>> {
    match result {
        MessageResult::GeneratedImage { mime, data, .. } => Ok(vec![ExportBlob {
            filename: format!("{}.{}", stem, extension_for(mime)),
            mime: mime.clone(),
            bytes: decode(data)?,
        }]),
        MessageResult::GeneratedVideo { mime, data, .. } => Ok(vec![ExportBlob {
            filename: format!("{}.{}", stem, extension_for(mime)),
            mime: mime.clone(),
            bytes: decode(data)?,
        }]),
        MessageResult::Files { files } => files
            .iter()
            .map(|f| {
                Ok(ExportBlob {
                    filename: f.filename.clone(),
                    mime: f.mime.clone(),
                    bytes: decode(&f.data)?,
                })
            })
            .collect(),
        MessageResult::Sources { .. } | MessageResult::MediaResults { .. } => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Citation, FileBlob};

    #[test]
    fn markdown_has_roles_and_sources() {
        let mut answer = Message::user("Riyadh.");
        answer.role = Role::Assistant;
        answer.result = Some(MessageResult::Sources {
            citations: vec![Citation {
                title: "Wiki".into(),
                uri: "https://w".into(),
            }],
        });
        let md = export_markdown(&[Message::user("Capital?"), answer]);
        assert!(md.contains("## You"));
        assert!(md.contains("## Parla"));
        assert!(md.contains("- [Wiki](https://w)"));
    }

    #[test]
    fn file_results_become_blobs() {
        let result = MessageResult::Files {
            files: vec![FileBlob {
                filename: "a.txt".into(),
                mime: "text/plain".into(),
                data: STANDARD.encode(b"hi"),
            }],
        };
        let blobs = blobs_from_result(&result, "ignored").unwrap();
        assert_eq!(blobs[0].bytes, b"hi");

        let image = MessageResult::GeneratedImage {
            mime: "image/png".into(),
            data: STANDARD.encode([1u8, 2]),
            prompt: "p".into(),
        };
        assert_eq!(blobs_from_result(&image, "img").unwrap()[0].filename, "img.png");
    }
}
