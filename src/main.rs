//! refine-chat - terminal client for the sentence correction backend
//!
//! Reads sentences from stdin, submits them through the session
//! controller, and prints the corrected sentence and the reply as they
//! arrive.

use refine_chat::config::ClientConfig;
use refine_chat::session::{
    SessionController, SessionHandle, SessionSettings, SessionUpdate, Turn, TurnId, TurnOutcome,
};
use refine_chat::transport::{HttpTransport, Style, WsConnector};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "commands: /style formal|casual  /stream on|off  /reconnect  /health  /history  /quit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ClientConfig::from_env()?;
    tracing::info!(
        base_url = %config.base_url,
        ws_url = %config.ws_url,
        streaming = config.streaming,
        style = %config.style,
        "Starting refine-chat"
    );

    let http = Arc::new(HttpTransport::new(&config.base_url, config.request_timeout)?);
    let connector = WsConnector::new(&config.ws_url, config.connect_timeout);
    let handle =
        SessionController::spawn(SessionSettings::from(&config), Arc::clone(&http), connector);

    let renderer = tokio::spawn(render(handle.subscribe()));
    println!("session {}", handle.session_id());
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(input) = Input::parse(&line) else {
            continue;
        };
        match input {
            Input::Submit(text) => {
                if handle.snapshot().is_busy() {
                    println!("(still waiting for the previous reply)");
                }
                handle.submit_current(text).await?;
            }
            Input::Style(style) => handle.set_style(style).await?,
            Input::Streaming(enabled) => handle.set_streaming_enabled(enabled).await?,
            Input::Reconnect => handle.reconnect().await?,
            Input::Health => match http.health().await {
                Ok(()) => println!("backend is healthy"),
                Err(e) => println!("health check failed: {e}"),
            },
            Input::History => print_history(&http, &handle).await,
            Input::Quit => break,
            Input::Invalid(reason) => println!("{reason}\n{HELP}"),
        }
    }

    handle.shutdown().await?;
    renderer.abort();
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "refine_chat=info".into());
    // stdout belongs to the conversation
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("REFINE_CHAT_LOG_JSON").is_ok_and(|v| v == "1") {
        registry
            .with(fmt.json().with_current_span(false).with_span_list(false))
            .init();
    } else {
        registry.with(fmt).init();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Submit(String),
    Style(Style),
    Streaming(bool),
    Reconnect,
    Health,
    History,
    Quit,
    Invalid(String),
}

impl Input {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Input::Submit(line.to_string()));
        };

        let (name, arg) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, arg)| (name, arg.trim()));
        let input = match (name, arg) {
            ("style", arg) => match arg.parse() {
                Ok(style) => Input::Style(style),
                Err(e) => Input::Invalid(e.to_string()),
            },
            ("stream", "on") => Input::Streaming(true),
            ("stream", "off") => Input::Streaming(false),
            ("stream", other) => Input::Invalid(format!("expected on or off, got {other:?}")),
            ("reconnect", _) => Input::Reconnect,
            ("health", _) => Input::Health,
            ("history", _) => Input::History,
            ("quit" | "exit", _) => Input::Quit,
            (other, _) => Input::Invalid(format!("unknown command /{other}")),
        };
        Some(input)
    }
}

async fn print_history(http: &HttpTransport, handle: &SessionHandle) {
    match http.history(&handle.session_id()).await {
        Ok(entries) if entries.is_empty() => println!("no stored history"),
        Ok(entries) => {
            for entry in entries {
                println!("- {} -> {}", entry.original_text, entry.refined_text);
                println!("  {}", entry.reply_text);
            }
        }
        Err(e) => println!("could not load history: {e}"),
    }
}

// ============================================================================
// Rendering
// ============================================================================

async fn render(updates: broadcast::Receiver<SessionUpdate>) {
    let mut view = TurnView::default();
    let mut updates = BroadcastStream::new(updates);
    while let Some(update) = updates.next().await {
        match update {
            Ok(update) => {
                print!("{}", view.apply(&update));
                let _ = std::io::stdout().flush();
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Renderer fell behind");
            }
        }
    }
}

/// Renders each turn incrementally
#[derive(Default)]
struct TurnView {
    /// Turn the counters below describe
    current: Option<TurnId>,
    refined_shown: bool,
    /// Bytes of the reply already on screen
    printed: usize,
}

impl TurnView {
    /// Text to print for one update
    fn apply(&mut self, update: &SessionUpdate) -> String {
        match update {
            SessionUpdate::TurnAdded(turn) => {
                self.track(turn.id);
                String::new()
            }
            SessionUpdate::TurnUpdated(turn) => self.show_turn(turn),
            SessionUpdate::ConnectionChanged(connection) => format!("[{connection}]\n"),
            SessionUpdate::SettingsChanged {
                style,
                streaming_enabled,
            } => {
                let mode = if *streaming_enabled { "streaming" } else { "request/response" };
                format!("[style {style}, {mode}]\n")
            }
        }
    }

    /// Start over when updates move to another turn, even if its
    /// `TurnAdded` was lost to lag
    fn track(&mut self, id: TurnId) {
        if self.current != Some(id) {
            self.current = Some(id);
            self.refined_shown = false;
            self.printed = 0;
        }
    }

    fn show_turn(&mut self, turn: &Turn) -> String {
        self.track(turn.id);
        let mut out = String::new();

        if let Some(TurnOutcome::Failed { .. }) = turn.outcome {
            if self.printed > 0 {
                out.push('\n');
            }
            out.push_str(&format!("{} ({})\n", turn.refined_text, turn.reply_text));
            return out;
        }

        if !self.refined_shown && !turn.refined_text.is_empty() {
            out.push_str(&format!("= {}\n", turn.refined_text));
            self.refined_shown = true;
        }

        // A reply restart clears what was streamed so far
        if turn.reply_text.len() < self.printed || !turn.reply_text.is_char_boundary(self.printed) {
            self.printed = 0;
        }
        out.push_str(&turn.reply_text[self.printed..]);
        self.printed = turn.reply_text.len();

        if turn.outcome == Some(TurnOutcome::Completed) {
            out.push('\n');
        }
        out
    }
}
