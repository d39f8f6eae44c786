//! Terminal chat client for the folio proxy.
//! Run with: cargo run --bin folio-chat -- --proxy-url http://127.0.0.1:3000

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use folio_chat::chat::{ChatSession, ChatState, Chatbot, HttpTransport, SESSION_KEY, Sender};
use folio_chat::config::ClientConfig;
use folio_chat::session::{ChangeBus, KvBackend, MarkerPoller, MemoryBackend, SqliteBackend, TtlStore};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "folio-chat")]
#[command(about = "Chat with the folio agent from the terminal")]
struct Cli {
    /// Base URL of the folio proxy
    #[arg(long, env = "FOLIO_PROXY_URL", default_value = "http://127.0.0.1:3000")]
    proxy_url: String,

    /// SQLite file for the session id (in-memory when omitted)
    #[arg(long, env = "FOLIO_SESSION_STORE")]
    session_store: Option<PathBuf>,

    /// How often to check for session changes from other clients, in milliseconds
    #[arg(long, env = "FOLIO_POLL_INTERVAL_MS", default_value_t = 2000)]
    poll_interval_ms: u64,
}

impl From<Cli> for ClientConfig {
    fn from(cli: Cli) -> Self {
        Self {
            proxy_url: cli.proxy_url,
            session_store: cli.session_store,
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
        }
    }
}

enum Turn {
    Send(String),
    Retry,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::from(Cli::parse());
    config.validate()?;

    let backend: Arc<dyn KvBackend> = match &config.session_store {
        Some(path) => Arc::new(
            SqliteBackend::open(path)
                .await
                .with_context(|| format!("opening session store {}", path.display()))?,
        ),
        None => Arc::new(MemoryBackend::new()),
    };
    let bus = ChangeBus::default();
    let poller = MarkerPoller::new(Arc::clone(&backend), bus.clone(), SESSION_KEY, config.poll_interval);
    let stop_poller = poller.shutdown_token();
    let poller_handle = poller.spawn();

    let session = ChatSession::open(TtlStore::new(backend, bus)).await;
    let transport = Arc::new(HttpTransport::new(&config.proxy_url)?);
    let bot = Arc::new(Chatbot::new(transport, session));

    tokio::spawn({
        let bot = Arc::clone(&bot);
        async move { bot.warmup_server().await }
    });

    println!("Connected to {}. Commands: /retry /new /clear /quit", config.proxy_url);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => {}
            "/quit" => break,
            "/clear" => {
                bot.clear_messages();
                println!("(transcript cleared)");
            }
            "/new" => match bot.start_new_session().await {
                Ok(id) => println!("(new session {id})"),
                Err(e) => eprintln!("Could not start a new session: {e}"),
            },
            "/retry" => run_turn(&bot, Turn::Retry).await?,
            text => run_turn(&bot, Turn::Send(text.to_string())).await?,
        }
    }

    stop_poller.cancel();
    poller_handle.await?;
    Ok(())
}

/// Run one send cycle, printing the reply as it streams. Ctrl-C cancels it.
async fn run_turn(bot: &Arc<Chatbot>, turn: Turn) -> Result<()> {
    let mut updates = bot.subscribe();
    let mut printer = ReplyPrinter::after(&updates.borrow_and_update());

    let mut task = tokio::spawn({
        let bot = Arc::clone(bot);
        async move {
            match turn {
                Turn::Send(text) => bot.send_message(&text).await,
                Turn::Retry => bot.retry_last_message().await,
            }
        }
    });

    loop {
        tokio::select! {
            joined = &mut task => {
                joined?;
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                printer.render(&updates.borrow_and_update())?;
            }
            _ = tokio::signal::ctrl_c() => {
                bot.cancel_request().await;
            }
        }
    }

    let state = bot.snapshot();
    printer.render(&state)?;
    println!();
    if let Some(error) = &state.error {
        eprintln!("! {}{}", error.message, if error.can_retry { " (type /retry)" } else { "" });
    }
    Ok(())
}

/// Prints the new suffix of each AI message created after the turn started.
struct ReplyPrinter {
    floor: u64,
    printed: HashMap<u64, usize>,
}

impl ReplyPrinter {
    fn after(state: &ChatState) -> Self {
        Self {
            floor: state.messages.iter().map(|m| m.id).max().unwrap_or(0),
            printed: HashMap::new(),
        }
    }

    fn render(&mut self, state: &ChatState) -> Result<()> {
        let mut out = std::io::stdout().lock();
        for message in state
            .messages
            .iter()
            .filter(|m| m.sender == Sender::Ai && m.id > self.floor)
        {
            let done = self.printed.entry(message.id).or_insert(0);
            if let Some(rest) = message.text.get(*done..) {
                if !rest.is_empty() {
                    if *done == 0 && message.is_error {
                        writeln!(out)?;
                    }
                    write!(out, "{rest}")?;
                    *done = message.text.len();
                }
            }
        }
        out.flush()?;
        Ok(())
    }
}
