//! Parla console
//!
//! Text REPL over the assistant core. With the `native-audio` feature, `/voice`
//! starts a hands-free voice session on the default microphone.

#[cfg(feature = "native-audio")]
mod transcode;
mod turns;
#[cfg(feature = "native-audio")]
mod voice;

use parla_core::{AppConfig, Assistant, AttachmentInput, Message, MessageResult, MessageStatus, Role};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Input = Lines<BufReader<Stdin>>;

const HELP: &str = "\
Commands:
  /history               list the conversation
  /attach <path> <text>  send a file with a message
  /edit <n> <text>       rewrite message n and answer again
  /save <n> [dir]        save media from message n
  /export [dir]          export the conversation as markdown
  /clear                 delete the conversation
  /voice                 hands-free voice mode
  /quit

Files: images and PDFs can be asked about, summarized or reimagined. Pixel
edits (crop, rotate, flip, filter, color) and PDF page tools need a media
tools backend, which this console does not ship. Audio in ogg, m4a, mp4 or
aac is converted to WAV in builds with `native-audio`.";

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parla] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load().expect("load AppConfig");
    tracing::info!(
        language = %config.language,
        storage_path = %config.storage_path,
        "Parla console started"
    );
    let assistant = Assistant::from_config(config).expect("open assistant");
    #[cfg(feature = "native-audio")]
    let assistant = assistant.with_transcoder(Arc::new(transcode::RodioTranscoder));
    let assistant = Arc::new(assistant);

    println!("Parla. Type a message, or /help.");
    let mut input: Input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = input.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        handle_line(&assistant, line, &mut input).await;
    }
}

async fn handle_line(assistant: &Arc<Assistant>, line: &str, input: &mut Input) {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "/help" => println!("{}", HELP),
        "/history" => {
            for (i, m) in assistant.session().messages().iter().enumerate() {
                print_message(i + 1, m);
            }
        }
        "/clear" => match assistant.clear() {
            Ok(()) => println!("Conversation cleared."),
            Err(e) => eprintln!("{}", e.user_message()),
        },
        "/export" => {
            let dir = if rest.is_empty() { "." } else { rest };
            match assistant.export_blob().save_to(dir).await {
                Ok(path) => println!("Saved {}", path.display()),
                Err(e) => eprintln!("Export failed: {}", e),
            }
        }
        "/attach" => {
            let (path, text) = rest.split_once(' ').unwrap_or((rest, ""));
            match AttachmentInput::from_path(path).await {
                Ok(file) => send(assistant, text.trim(), Some(file)).await,
                Err(e) => eprintln!("{}", e.user_message()),
            }
        }
        "/edit" => {
            let (n, text) = rest.split_once(' ').unwrap_or((rest, ""));
            let Some(message) = nth_message(assistant, n) else {
                eprintln!("No message {}.", n);
                return;
            };
            match assistant.edit_and_resend(&message.id, text.trim()).await {
                Ok(reply) => print_reply(reply),
                Err(e) => eprintln!("{}", e.user_message()),
            }
        }
        "/save" => {
            let (n, dir) = rest.split_once(' ').unwrap_or((rest, "."));
            let Some(message) = nth_message(assistant, n) else {
                eprintln!("No message {}.", n);
                return;
            };
            match assistant.media_blobs(&message.id) {
                Ok(blobs) if blobs.is_empty() => println!("Message {} has no media.", n),
                Ok(blobs) => {
                    for blob in blobs {
                        match blob.save_to(dir.trim()).await {
                            Ok(path) => println!("Saved {}", path.display()),
                            Err(e) => eprintln!("Save failed: {}", e),
                        }
                    }
                }
                Err(e) => eprintln!("{}", e.user_message()),
            }
        }
        "/voice" => run_voice(assistant, input).await,
        _ if command.starts_with('/') => println!("Unknown command. {}", HELP),
        _ => send(assistant, line, None).await,
    }
}

#[cfg(feature = "native-audio")]
async fn run_voice(assistant: &Arc<Assistant>, input: &mut Input) {
    if let Err(e) = voice::run(Arc::clone(assistant), input).await {
        eprintln!("Voice mode failed: {}", e);
    }
}

#[cfg(not(feature = "native-audio"))]
async fn run_voice(_assistant: &Arc<Assistant>, _input: &mut Input) {
    println!("Voice mode needs a build with `--features native-audio`.");
}

fn nth_message(assistant: &Assistant, n: &str) -> Option<Message> {
    let index = n.parse::<usize>().ok()?.checked_sub(1)?;
    assistant.session().messages().get(index).cloned()
}

async fn send(assistant: &Assistant, text: &str, file: Option<AttachmentInput>) {
    match assistant.send(text, file).await {
        Ok(reply) => print_reply(reply),
        Err(e) => eprintln!("{}", e.user_message()),
    }
}

fn print_reply(reply: Option<Message>) {
    match reply {
        Some(message) => print_message(0, &message),
        None => println!("(conversation was cleared)"),
    }
}

fn print_message(n: usize, m: &Message) {
    let who = match m.role {
        Role::User => "you",
        Role::Assistant => "parla",
    };
    let marker = match m.status {
        MessageStatus::Pending => " …",
        MessageStatus::Failed => " (failed)",
        MessageStatus::Complete => "",
    };
    if n > 0 {
        println!("[{}] {}{}: {}", n, who, marker, m.content);
    } else {
        println!("{}{}: {}", who, marker, m.content);
    }
    if let Some(att) = &m.attachment {
        println!("    attachment: {} ({})", att.name, att.mime);
    }
    match &m.result {
        Some(MessageResult::Sources { citations }) => {
            for c in citations {
                println!("    - {} <{}>", c.title, c.uri);
            }
        }
        Some(MessageResult::GeneratedImage { mime, .. }) => println!("    [image {}; /save to keep it]", mime),
        Some(MessageResult::GeneratedVideo { uri, .. }) => println!("    [video {}; /save to keep it]", uri),
        Some(MessageResult::MediaResults { kind, items, sources }) => {
            for item in items {
                println!("    {} {} <{}>", kind, item.title, item.url);
            }
            for s in sources {
                println!("    - {} <{}>", s.title, s.uri);
            }
        }
        Some(MessageResult::Files { files }) => {
            for f in files {
                println!("    [file {}; /save to keep it]", f.filename);
            }
        }
        None => {}
    }
}
