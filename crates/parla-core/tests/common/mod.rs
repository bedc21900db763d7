//! Scripted doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parla_core::{
    prompts, AppConfig, Assistant, AssistantError, AssistantResult, FetchedAsset,
    GenerationClient, GenerationConfig, GenerationOutput, InlineImage, MediaProbe, MediaStore,
    OperationHandle, OperationStatus, StreamChunk, Content, Citation,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Model calls are told apart by their system instruction.
const CALLS: &[(&str, &str)] = &[
    ("chat", prompts::CHAT),
    ("classify", prompts::CLASSIFY),
    ("follow-up-edit", prompts::FOLLOW_UP_EDIT),
    ("file-edit-check", prompts::FILE_EDIT_CHECK),
    ("file-tool", prompts::FILE_TOOL),
    ("refine-image", prompts::REFINE_IMAGE),
    ("rephrase-image", prompts::REPHRASE_IMAGE),
    ("extract-facts", prompts::EXTRACT_FACTS),
    ("media-search", prompts::MEDIA_SEARCH),
    ("summarize-pdf", prompts::SUMMARIZE_PDF),
];

fn call_name(config: &GenerationConfig) -> &'static str {
    let system = config.system_instruction.as_deref().unwrap_or_default();
    CALLS
        .iter()
        .find(|(_, template)| {
            let head: String = template.chars().take(16).collect();
            system.starts_with(&head)
        })
        .map(|(name, _)| *name)
        .unwrap_or("unknown")
}

pub fn text(s: &str) -> AssistantResult<GenerationOutput> {
    Ok(GenerationOutput {
        text: s.to_string(),
        ..Default::default()
    })
}

pub fn text_with_sources(s: &str, sources: &[(&str, &str)]) -> AssistantResult<GenerationOutput> {
    Ok(GenerationOutput {
        text: s.to_string(),
        citations: sources
            .iter()
            .map(|(title, uri)| Citation {
                title: title.to_string(),
                uri: uri.to_string(),
            })
            .collect(),
        ..Default::default()
    })
}

pub fn transient() -> AssistantError {
    AssistantError::Transient {
        status: Some(503),
        message: "overloaded".to_string(),
    }
}

pub fn chunk(s: &str) -> AssistantResult<StreamChunk> {
    Ok(StreamChunk {
        text: s.to_string(),
        citations: Vec::new(),
    })
}

pub fn png(tag: u8) -> InlineImage {
    InlineImage {
        mime: "image/png".to_string(),
        data: format!("aW1n{}", tag),
    }
}

#[derive(Default)]
pub struct ScriptedClient {
    generate: Mutex<HashMap<&'static str, VecDeque<AssistantResult<GenerationOutput>>>>,
    streams: Mutex<VecDeque<Vec<AssistantResult<StreamChunk>>>>,
    images: Mutex<VecDeque<AssistantResult<InlineImage>>>,
    operations: Mutex<VecDeque<AssistantResult<OperationStatus>>>,
    assets: Mutex<VecDeque<AssistantResult<FetchedAsset>>>,
    calls: Mutex<Vec<&'static str>>,
    /// Prompt and whether a source image was supplied, per image call.
    pub image_calls: Mutex<Vec<(String, bool)>>,
    pub stream_contents: Mutex<Vec<Vec<Content>>>,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, call: &'static str, response: AssistantResult<GenerationOutput>) -> &Self {
        self.generate
            .lock()
            .unwrap()
            .entry(call)
            .or_default()
            .push_back(response);
        self
    }

    pub fn stream(&self, chunks: Vec<AssistantResult<StreamChunk>>) -> &Self {
        self.streams.lock().unwrap().push_back(chunks);
        self
    }

    pub fn image(&self, response: AssistantResult<InlineImage>) -> &Self {
        self.images.lock().unwrap().push_back(response);
        self
    }

    pub fn operation(&self, response: AssistantResult<OperationStatus>) -> &Self {
        self.operations.lock().unwrap().push_back(response);
        self
    }

    pub fn asset(&self, response: AssistantResult<FetchedAsset>) -> &Self {
        self.assets.lock().unwrap().push_back(response);
        self
    }

    pub fn calls(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

fn unscripted(what: &str) -> AssistantError {
    AssistantError::Service {
        status: 404,
        message: format!("unscripted {}", what),
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn generate(
        &self,
        _contents: Vec<Content>,
        config: GenerationConfig,
    ) -> AssistantResult<GenerationOutput> {
        let call = call_name(&config);
        self.record(call);
        self.generate
            .lock()
            .unwrap()
            .get_mut(call)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(unscripted(call)))
    }

    async fn generate_stream(
        &self,
        contents: Vec<Content>,
        config: GenerationConfig,
    ) -> AssistantResult<mpsc::Receiver<AssistantResult<StreamChunk>>> {
        let call = call_name(&config);
        self.record(call);
        self.stream_contents.lock().unwrap().push(contents);
        let chunks = self.streams.lock().unwrap().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(chunks.len() + 1);
        for c in chunks {
            let _ = tx.send(c).await;
        }
        Ok(rx)
    }

    async fn generate_image(
        &self,
        prompt: &str,
        source: Option<&InlineImage>,
    ) -> AssistantResult<InlineImage> {
        self.record("image");
        self.image_calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), source.is_some()));
        self.images
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("image")))
    }

    async fn start_video(&self, _prompt: &str) -> AssistantResult<OperationHandle> {
        self.record("start-video");
        Ok(OperationHandle("operations/test".to_string()))
    }

    async fn get_operation(&self, _handle: &OperationHandle) -> AssistantResult<OperationStatus> {
        self.record("poll");
        self.operations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("operation")))
    }

    async fn fetch_asset(&self, _uri: &str) -> AssistantResult<FetchedAsset> {
        self.record("fetch");
        self.assets
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("asset")))
    }
}

pub struct FixedProbe(pub AtomicBool);

impl FixedProbe {
    pub fn new(loads: bool) -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(loads)))
    }
}

#[async_trait]
impl MediaProbe for FixedProbe {
    async fn loads(&self, _url: &str) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn assistant(client: &Arc<ScriptedClient>) -> Assistant {
    assistant_with_store(client, MediaStore::temporary().unwrap())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn assistant_with_store(client: &Arc<ScriptedClient>, store: MediaStore) -> Assistant {
    init_tracing();
    let generation: Arc<dyn GenerationClient> = client.clone();
    Assistant::new(AppConfig::default(), generation, store)
        .unwrap()
        .with_media_probe(FixedProbe::new(false))
}

pub fn classified(intent: &str, core_prompt: &str) -> AssistantResult<GenerationOutput> {
    text(&format!(
        r#"{{"intent":"{}","core_prompt":"{}"}}"#,
        intent, core_prompt
    ))
}
