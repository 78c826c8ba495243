use anyhow::Result;
use chatloom::{ClientError, Config, ConversationManager, Message, SendOptions};
use std::future::Future;
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const NEW_COMMAND: &str = "/new";
const QUIT_COMMAND: &str = "/quit";

/// Where the next message attaches.
#[derive(Default)]
struct Thread {
    conversation_id: Option<String>,
    parent_message_id: Option<String>,
}

impl Thread {
    fn advance(&mut self, reply: &Message) {
        self.conversation_id = Some(reply.conversation_id.clone());
        self.parent_message_id = Some(reply.id.clone());
    }
}

enum Input {
    Line(String),
    Eof,
    Interrupted,
}

/// Next stdin line, or `Interrupted` when `interrupt` resolves first.
async fn next_input<R, F>(lines: &mut Lines<R>, interrupt: F) -> Result<Input>
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        line = lines.next_line() => Ok(line?.map_or(Input::Eof, Input::Line)),
        _ = interrupt => Ok(Input::Interrupted),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn prompt_marker() -> Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()?;
    Ok(())
}

async fn send_turn(
    manager: &ConversationManager,
    config: &Config,
    thread: &Thread,
    text: String,
) -> Result<Message, ClientError> {
    let cancel = CancellationToken::new();
    let mut options = SendOptions {
        conversation_id: thread.conversation_id.clone(),
        parent_message_id: thread.parent_message_id.clone(),
        cancel: Some(cancel.clone()),
        stream: Some(config.stream),
        ..SendOptions::default()
    };

    let printer = if config.stream {
        let (tx, mut rx) = mpsc::unbounded_channel();
        options.progress = Some(tx);
        Some(tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            let mut started = false;
            while let Some(update) = rx.recv().await {
                let delta = if started {
                    update.delta.as_str()
                } else {
                    update.delta.trim_start()
                };
                started |= !delta.is_empty();
                let _ = write!(stdout, "{delta}");
                let _ = stdout.flush();
            }
            started
        }))
    } else {
        None
    };

    let outcome = tokio::select! {
        reply = manager.send_message(text, options) => reply,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            Err(ClientError::Cancelled)
        }
    };

    let streamed_output = match printer {
        Some(handle) => handle.await.unwrap_or(false),
        None => false,
    };
    match &outcome {
        Ok(reply) if !streamed_output => println!("{}", reply.text),
        _ if streamed_output => println!(),
        _ => {}
    }
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::load()?;
    config.validate()?;
    let manager = ConversationManager::from_config(&config).await?;

    let mut thread = Thread::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    prompt_marker()?;
    loop {
        // Ctrl-C interrupts a running turn; at the prompt it exits.
        let line = match next_input(&mut lines, tokio::signal::ctrl_c()).await? {
            Input::Line(line) => line,
            Input::Interrupted => {
                println!();
                break;
            }
            Input::Eof => break,
        };
        let text = line.trim();
        match text {
            "" => {}
            QUIT_COMMAND => break,
            NEW_COMMAND => {
                thread = Thread::default();
                println!("(new conversation)");
            }
            _ => match send_turn(&manager, &config, &thread, text.to_string()).await {
                Ok(reply) => thread.advance(&reply),
                Err(error) if error.is_interrupted() => println!("(interrupted: {error})"),
                Err(error) => eprintln!("error: {error}"),
            },
        }
        prompt_marker()?;
    }

    Ok(())
}
