//! trickle - stream chat completions and keep the transcripts

mod config;
mod utils;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use trickle_chat::{
    ChatEvent, ConversationId, ConversationLedger, Finalized, JsonlLedger, StreamController,
    StreamOutcome,
};
use trickle_wire::{CompletionRequest, HttpTransport, Message};

/// trickle - stream chat completions from the terminal
#[derive(Parser, Debug)]
#[command(name = "trickle")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Endpoint base URL (overrides the config file)
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    /// Model identifier
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a prompt and stream the reply (Ctrl-C stops and keeps the partial reply)
    Send {
        prompt: String,

        /// Continue an existing conversation
        #[arg(short, long)]
        conversation: Option<String>,

        /// System prompt for this request
        #[arg(short, long)]
        system: Option<String>,

        /// Sampling temperature
        #[arg(short, long)]
        temperature: Option<f32>,

        /// Completion token limit
        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// List stored conversations, newest first
    List,

    /// Print a conversation transcript
    History { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so streamed text on stdout stays clean
    let filter = if args.verbose {
        EnvFilter::new("trickle=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let mut cfg = config::Config::load();
    if let Some(endpoint) = args.endpoint {
        cfg.endpoint.base_url = endpoint;
    }
    if args.model.is_some() {
        cfg.model = args.model;
    }

    let ledger = Arc::new(
        JsonlLedger::open(cfg.data_dir())
            .with_context(|| format!("opening conversation store {}", cfg.data_dir().display()))?,
    );

    match args.command {
        Some(Command::Send {
            prompt,
            conversation,
            system,
            temperature,
            max_tokens,
        }) => {
            if let Some(t) = temperature {
                cfg.temperature = Some(t);
            }
            if let Some(n) = max_tokens {
                cfg.max_tokens = Some(n);
            }
            if system.is_some() {
                cfg.system_prompt = system;
            }
            send(&cfg, ledger, prompt, conversation.map(ConversationId::from)).await
        }
        Some(Command::List) => list_conversations(ledger.as_ref()),
        Some(Command::History { id }) => print_history(ledger.as_ref(), &ConversationId::from(id)),
        None => {
            eprintln!("Nothing to do. Try `trickle send \"hello\"` or `trickle --help`.");
            Ok(())
        }
    }
}

/// Build the request: system prompt, prior transcript, then the new prompt
fn build_request(
    cfg: &config::Config,
    history: Vec<Message>,
    prompt: String,
) -> CompletionRequest {
    let mut context = Vec::with_capacity(history.len() + 2);
    if let Some(ref system) = cfg.system_prompt {
        context.push(Message::system(system.clone()));
    }
    context.extend(history);
    context.push(Message::user(prompt));

    let mut request = CompletionRequest::new(&context);
    if let Some(ref model) = cfg.model {
        request = request.with_model(model.clone());
    }
    if let Some(t) = cfg.temperature {
        request = request.with_temperature(t);
    }
    if let Some(n) = cfg.max_tokens {
        request = request.with_max_tokens(n);
    }
    request
}

async fn send(
    cfg: &config::Config,
    ledger: Arc<JsonlLedger>,
    prompt: String,
    conversation_id: Option<ConversationId>,
) -> anyhow::Result<()> {
    let history = match conversation_id {
        Some(ref id) => match ledger.get_history(id) {
            Ok(history) => history,
            Err(trickle_chat::Error::ConversationNotFound(_)) => {
                tracing::debug!(conversation_id = %id, "Unknown conversation, starting it fresh");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        },
        None => Vec::new(),
    };
    let request = build_request(cfg, history, prompt);

    let transport = Arc::new(HttpTransport::new(cfg.endpoint_config())?);
    let controller = StreamController::new(transport, ledger);
    let mut events = controller.subscribe();

    let task = controller.start(conversation_id, request).await?;
    let join = task.join();
    tokio::pin!(join);

    let mut stdout = std::io::stdout();
    let mut kept_in: Option<ConversationId> = None;
    let outcome = loop {
        tokio::select! {
            outcome = &mut join => break outcome,
            event = events.recv() => match event {
                Ok(ChatEvent::Delta { text, .. }) => {
                    write!(stdout, "{}", text)?;
                    stdout.flush()?;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Display fell behind the stream");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                if let Some(Finalized::Committed { conversation_id, .. }) = controller.abort()? {
                    kept_in = Some(conversation_id);
                }
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        if let ChatEvent::Delta { text, .. } = event {
            write!(stdout, "{}", text)?;
        }
    }
    writeln!(stdout)?;
    stdout.flush()?;

    match outcome {
        Ok(StreamOutcome::Completed {
            conversation_id, ..
        }) => {
            eprintln!("[conversation {}]", conversation_id);
        }
        Ok(StreamOutcome::Aborted) => match kept_in {
            Some(id) => eprintln!("[aborted, partial reply kept in conversation {}]", id),
            None => eprintln!("[aborted]"),
        },
        Err(e) => {
            if e.is_retryable() {
                eprintln!("Request failed, it may succeed if retried.");
            }
            return Err(e.into());
        }
    }
    Ok(())
}

fn list_conversations(ledger: &JsonlLedger) -> anyhow::Result<()> {
    let conversations = ledger.list_conversations()?;
    if conversations.is_empty() {
        println!("No saved conversations found.");
        println!("Conversations are stored in: {}", ledger.dir().display());
        return Ok(());
    }

    println!("Saved conversations:\n");
    println!("{:<38} {:<18} {:<6} First query", "ID", "Created", "Msgs");
    println!("{}", "-".repeat(90));
    for c in conversations {
        println!(
            "{:<38} {:<18} {:<6} {}",
            c.id,
            utils::format_timestamp(c.created_at),
            c.message_count,
            utils::preview(&c.first_query, 40)
        );
    }
    println!("\nContinue with: trickle send --conversation <id> \"...\"");
    Ok(())
}

fn print_history(ledger: &JsonlLedger, id: &ConversationId) -> anyhow::Result<()> {
    let conversation = ledger.get_conversation(id)?;
    println!(
        "Conversation {} ({})\n",
        conversation.id,
        utils::format_timestamp(conversation.created_at)
    );
    for message in conversation.messages {
        println!(
            "[{}] {}:\n{}\n",
            utils::format_timestamp(message.created_at),
            message.role,
            message.content
        );
    }
    Ok(())
}
