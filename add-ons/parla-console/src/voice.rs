//! `/voice`: microphone in, assistant turn, speech out.

use crate::Input;
use async_trait::async_trait;
use parla_core::Assistant;
use parla_voice::{
    CloseReason, CloudRecognitionEngine, CloudSpeech, CloudTranscriber, CpalMicrophone,
    EngineFactory, RecognitionEngine, SessionUpdate, SynthesizerAdapter, Transcriber,
    TurnDispatcher, VoiceConfig, VoiceSessionController,
};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Each committed transcript goes through the same path as a typed message.
struct VoiceTurns(Arc<Assistant>);

#[async_trait]
impl TurnDispatcher for VoiceTurns {
    async fn dispatch(&self, transcript: String) -> Result<String, Box<dyn Error + Send + Sync>> {
        let reply = self.0.send(&transcript, None).await?;
        crate::turns::spoken_reply(reply).map_err(Into::into)
    }
}

pub async fn run(assistant: Arc<Assistant>, input: &mut Input) -> Result<(), Box<dyn Error>> {
    let mut config = VoiceConfig::from_env();
    if std::env::var("PARLA_VOICE_LANGUAGE").is_err() {
        config = config.with_language(assistant.config().language.clone());
    }

    let transcriber: Arc<dyn Transcriber> = Arc::new(CloudTranscriber::from_env()?);
    let engines: EngineFactory = Arc::new(move || {
        Box::new(CloudRecognitionEngine::new(Arc::clone(&transcriber))) as Box<dyn RecognitionEngine>
    });
    let speech = Arc::new(CloudSpeech::from_env(config.language.clone())?);
    let synthesizer = Arc::new(SynthesizerAdapter::new(speech, &config));

    let controller = VoiceSessionController::new(
        config,
        Arc::new(CpalMicrophone::default()),
        engines,
        synthesizer,
        Arc::new(VoiceTurns(assistant)),
    );
    let handle = controller.start()?;
    let mut updates = handle.updates();
    let mut ending = false;
    println!("Listening. Press Enter to stop.");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(SessionUpdate::State(state)) => println!("({})", state),
                Ok(SessionUpdate::Interim(text)) => println!("  … {}", text),
                Ok(SessionUpdate::Transcript(text)) => println!("you: {}", text),
                Ok(SessionUpdate::Reply(text)) => println!("parla: {}", text),
                Ok(SessionUpdate::Error(text)) => eprintln!("{}", text),
                Ok(SessionUpdate::Closed(_)) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(target: "parla::voice", skipped, "console lagged behind session updates");
                }
            },
            _ = handle.closed() => break,
            _ = input.next_line(), if !ending => {
                ending = true;
                handle.end();
            }
        }
    }

    match handle.closed().await {
        CloseReason::UserEnded => println!("Voice mode ended."),
        CloseReason::NoSpeech => println!("No speech heard; voice mode ended."),
        CloseReason::Fatal(message) => eprintln!("Voice mode stopped: {}", message),
    }
    Ok(())
}
