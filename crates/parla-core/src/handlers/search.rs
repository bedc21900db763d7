//! Media search (image / video / audio / music).
//!
//! The model answers in a fixed line grammar, `MEDIA|<url>|<title>`. Image
//! candidates are shown only if they actually load within the probe timeout;
//! otherwise the turn falls back to a list of source links.

use super::{TaskHandler, TaskRequest};
use crate::chat::PendingTurn;
use crate::error::{AssistantError, AssistantResult};
use crate::generation::{Content, GenerationClient, GenerationConfig};
use crate::message::{Citation, MediaItem, MediaKind, MessageResult};
use crate::prompts;
use crate::router::Intent;
use async_trait::async_trait;
use futures_util::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MAX_RESULTS: usize = 8;

static MEDIA_LINE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\s*MEDIA\s*\|\s*(https?://[^|\s]+)\s*\|\s*(.*?)\s*$").ok());

/// Checks that a media URL is reachable.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn loads(&self, url: &str) -> bool;
}

/// Probes with a GET and checks the status and the `image/*` content type.
pub struct HttpMediaProbe {
    client: reqwest::Client,
}

impl HttpMediaProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpMediaProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaProbe for HttpMediaProbe {
    async fn loads(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => {
                resp.status().is_success()
                    && resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|ct| ct.starts_with("image/"))
            }
            Err(_) => false,
        }
    }
}

/// Parse the `MEDIA|url|title` grammar. Other lines are ignored.
pub fn parse_media_lines(text: &str) -> Vec<MediaItem> {
    let Some(re) = MEDIA_LINE.as_ref() else {
        return Vec::new();
    };
    let mut items: Vec<MediaItem> = Vec::new();
    for line in text.lines() {
        let Some(caps) = re.captures(line) else { continue };
        let url = caps[1].to_string();
        if items.iter().any(|i| i.url == url) {
            continue;
        }
        let title = match caps[2].trim() {
            "" => url.clone(),
            t => t.to_string(),
        };
        items.push(MediaItem { url, title });
    }
    items.truncate(MAX_RESULTS);
    items
}

fn media_kind(intent: Intent) -> AssistantResult<MediaKind> {
    match intent {
        Intent::ImageSearch => Ok(MediaKind::Image),
        Intent::VideoSearch => Ok(MediaKind::Video),
        Intent::AudioSearch => Ok(MediaKind::Audio),
        Intent::MusicSearch => Ok(MediaKind::Music),
        other => Err(AssistantError::Unsupported(format!("{} as a media search", other))),
    }
}

pub struct SearchHandler {
    client: Arc<dyn GenerationClient>,
    probe: Arc<dyn MediaProbe>,
    probe_timeout: Duration,
}

impl SearchHandler {
    pub fn new(client: Arc<dyn GenerationClient>, probe: Arc<dyn MediaProbe>, probe_timeout: Duration) -> Self {
        Self {
            client,
            probe,
            probe_timeout,
        }
    }

    async fn verified(&self, candidates: Vec<MediaItem>) -> Vec<MediaItem> {
        let checks = candidates.iter().map(|item| {
            let probe = self.probe.clone();
            let url = item.url.clone();
            let limit = self.probe_timeout;
            async move {
                tokio::time::timeout(limit, probe.loads(&url))
                    .await
                    .unwrap_or(false)
            }
        });
        let results = join_all(checks).await;
        candidates
            .into_iter()
            .zip(results)
            .filter_map(|(item, ok)| ok.then_some(item))
            .collect()
    }
}

#[async_trait]
impl TaskHandler for SearchHandler {
    fn name(&self) -> &'static str {
        "search"
    }

    async fn run(&self, request: &TaskRequest, turn: &mut PendingTurn) -> AssistantResult<()> {
        let kind = media_kind(request.intent)?;
        turn.set_status_text("Searching...");

        let config = GenerationConfig {
            system_instruction: Some(prompts::MEDIA_SEARCH.replace("{kind}", &kind.to_string())),
            web_search: true,
            ..Default::default()
        };
        let output = self
            .client
            .generate(vec![Content::user_text(request.core_prompt.clone())], config)
            .await?;

        let candidates = parse_media_lines(&output.text);
        let items = if kind == MediaKind::Image {
            self.verified(candidates.clone()).await
        } else {
            candidates.clone()
        };
        debug!(target: "parla::router", %kind, candidates = candidates.len(), shown = items.len(), "media search");

        if !items.is_empty() {
            turn.set_content(&format!("Here is what I found for \"{}\".", request.core_prompt));
            turn.set_result(MessageResult::MediaResults {
                kind,
                items,
                sources: output.citations,
            });
            return Ok(());
        }

        let mut sources = output.citations;
        for item in candidates {
            if !sources.iter().any(|s| s.uri == item.url) {
                sources.push(Citation {
                    title: item.title,
                    uri: item.url,
                });
            }
        }
        if sources.is_empty() {
            turn.set_content(&format!("I could not find any {} results for \"{}\".", kind, request.core_prompt));
            return Ok(());
        }
        turn.set_content("I could not display the results directly. Here are the sources I found:");
        turn.set_result(MessageResult::MediaResults {
            kind,
            items: Vec::new(),
            sources,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_media_grammar() {
        let text = "Here you go\nMEDIA|https://a.example/x.png|A cat\nMEDIA | https://b.example/y.jpg |\nMEDIA|ftp://no|bad\nMEDIA|https://a.example/x.png|dup";
        let items = parse_media_lines(text);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "A cat");
        assert_eq!(items[1].title, "https://b.example/y.jpg");
    }
}
