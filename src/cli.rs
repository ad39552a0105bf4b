//! Interactive terminal chat.
//!
//! Reads lines from stdin; lines starting with `/` are commands, anything
//! else is sent as a message. Replies are revealed progressively.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::error::ChatError;
use crate::orchestrator::ChatService;
use crate::render::{
    EntryKind, RenderedBlock, RevealEngine, RevealTick, ScrollSignal, SearchState, Span, Transcript, format_blocks,
};
use crate::session::{Message, Role};

mod ansi {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const INVERSE: &str = "\x1b[7m";
    pub const RED: &str = "\x1b[31m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GRAY: &str = "\x1b[90m";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New(Option<String>),
    Model(String),
    Models,
    Title(String),
    Stats,
    Archive,
    Clear,
    Search(String),
    History,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if !line.starts_with('/') {
            return Some(Self::Send(line.to_owned()));
        }
        let (cmd, arg) = line.split_once(' ').unwrap_or((line, ""));
        let arg = arg.trim();
        let cmd = match cmd {
            "/new" => Self::New(Some(arg.to_owned()).filter(|a| !a.is_empty())),
            "/model" if !arg.is_empty() => Self::Model(arg.to_owned()),
            "/model" | "/models" => Self::Models,
            "/title" => Self::Title(arg.to_owned()),
            "/stats" => Self::Stats,
            "/archive" => Self::Archive,
            "/clear" => Self::Clear,
            "/search" => Self::Search(arg.to_owned()),
            "/history" => Self::History,
            "/help" => Self::Help,
            "/quit" | "/exit" => Self::Quit,
            other => Self::Unknown(other.to_owned()),
        };
        Some(cmd)
    }
}

fn spans_to_ansi(spans: &[Span]) -> String {
    spans
        .iter()
        .map(|s| match s {
            Span::Text(t) => t.clone(),
            Span::Emphasis(t) => format!("{}{}{}", ansi::BOLD, t, ansi::RESET),
            Span::Highlight(t) => format!("{}{}{}", ansi::INVERSE, t, ansi::RESET),
        })
        .collect()
}

/// Renders formatted blocks for a terminal, one block per line group.
pub fn blocks_to_ansi(blocks: &[RenderedBlock]) -> String {
    let mut out = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block {
            RenderedBlock::Heading { level, spans } => out.push(format!(
                "{}{}{} {}{}",
                ansi::BOLD,
                ansi::CYAN,
                "#".repeat(usize::from(*level)),
                spans_to_ansi(spans),
                ansi::RESET
            )),
            RenderedBlock::List { items } => {
                out.extend(items.iter().map(|i| format!("  • {}", spans_to_ansi(i))));
            }
            RenderedBlock::Paragraph { spans } => out.push(spans_to_ansi(spans)),
        }
    }
    out.join("\n")
}

/// Escape sequence that replaces the `drawn` lines of a reply with the
/// formatted `displayed` prefix. Returns the sequence and the new line count.
pub fn redraw(drawn: usize, displayed: &str) -> (String, usize) {
    let body = blocks_to_ansi(&format_blocks(displayed, None));
    let mut out = String::from("\r");
    if drawn > 1 {
        out.push_str(&format!("\x1b[{}A", drawn - 1));
    }
    out.push_str("\x1b[J");
    out.push_str(&body);
    (out, body.lines().count().max(1))
}

fn label(role: Role) -> String {
    match role {
        Role::User => format!("{}you{}", ansi::BOLD, ansi::RESET),
        Role::Assistant => format!("{}{}assistant{}", ansi::BOLD, ansi::CYAN, ansi::RESET),
        Role::System => format!("{}system{}", ansi::GRAY, ansi::RESET),
    }
}

fn help() {
    println!("Commands:");
    println!("  /new [model]     - Start a new chat");
    println!("  /model <id>      - Switch model (no id lists models)");
    println!("  /models          - List models");
    println!("  /title <text>    - Rename the chat");
    println!("  /stats           - Show chat statistics");
    println!("  /archive         - Archive the chat");
    println!("  /clear           - Leave the chat without archiving");
    println!("  /search <query>  - Find and highlight a message");
    println!("  /history         - Show the formatted conversation");
    println!("  /quit            - Exit");
}

pub struct ChatRepl {
    service: Arc<ChatService>,
    transcript: Transcript,
    reveal: RevealEngine,
    ticks: mpsc::UnboundedReceiver<RevealTick>,
    search: SearchState,
}

impl ChatRepl {
    pub fn new(service: Arc<ChatService>, reveal_delay: Duration) -> Self {
        let (reveal, ticks) = RevealEngine::new(reveal_delay);
        Self { service, transcript: Transcript::new(), reveal, ticks, search: SearchState::default() }
    }

    async fn committed(&self) -> Vec<Message> {
        match self.service.full_history().await {
            Ok(views) => views.into_iter().map(|v| v.message).collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn resync(&mut self) {
        let committed = self.committed().await;
        self.transcript.sync(&committed);
    }

    fn notice(&mut self, err: &ChatError) {
        self.transcript.push_notice(err);
        println!("{}{}{}", ansi::RED, err.notice(), ansi::RESET);
    }

    pub async fn run(mut self) -> Result<()> {
        self.resync().await;
        if let Some(s) = self.service.current_session().await {
            println!("{}Resuming \"{}\" ({}){}", ansi::DIM, s.title, s.model_id, ansi::RESET);
        }
        println!("{}Type a message, or /help for commands.{}", ansi::DIM, ansi::RESET);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            std::io::stdout().flush()?;
            let Some(line) = lines.next_line().await? else { break };
            let Some(cmd) = Command::parse(&line) else { continue };
            if cmd == Command::Quit {
                break;
            }
            self.handle(cmd).await?;
        }
        self.reveal.clear();
        Ok(())
    }

    async fn handle(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Send(content) => self.send(&content).await?,
            Command::New(model) => match self.service.create_session(model.as_deref(), None).await {
                Ok(s) => {
                    self.reveal.clear();
                    self.search.close();
                    self.transcript.clear();
                    println!("New chat with {}", s.model_id);
                }
                Err(e) => self.notice(&e),
            },
            Command::Model(id) => match self.service.switch_model(&id).await {
                Ok(s) => println!("Model: {}", s.model_id),
                Err(e) => self.notice(&e),
            },
            Command::Models => {
                let current = self.service.current_session().await.map(|s| s.model_id);
                for m in self.service.available_models().await {
                    let marker = if current.as_deref() == Some(m.model_id.as_str()) { "*" } else { " " };
                    println!("{marker} {:<40} {} ({})", m.model_id, m.display_name, m.provider);
                }
            }
            Command::Title(title) => match self.service.update_title(&title).await {
                Ok(s) => println!("Title: {}", s.title),
                Err(e) => self.notice(&e),
            },
            Command::Stats => match self.service.session_stats().await {
                Ok(st) => println!(
                    "{} messages ({} user, {} assistant), {} tokens, avg {:.0} ms",
                    st.total_messages, st.user_messages, st.assistant_messages, st.total_tokens, st.avg_response_time_ms
                ),
                Err(e) => self.notice(&e),
            },
            Command::Archive => match self.service.archive_session().await {
                Ok(()) => {
                    self.reveal.clear();
                    self.transcript.clear();
                    println!("Chat archived.");
                }
                Err(e) => self.notice(&e),
            },
            Command::Clear => match self.service.clear_session().await {
                Ok(()) => {
                    self.reveal.clear();
                    self.transcript.clear();
                    println!("Conversation cleared.");
                }
                Err(e) => self.notice(&e),
            },
            Command::Search(query) => self.search(&query),
            Command::History => self.history(),
            Command::Help => help(),
            Command::Unknown(c) => println!("Unknown command {c}; try /help"),
            Command::Quit => {}
        }
        Ok(())
    }

    async fn send(&mut self, content: &str) -> Result<()> {
        let echo = self.transcript.echo(content);
        let result = self.service.send_message(content, None).await;
        self.resync().await;
        match result {
            Ok(outcome) => {
                let reply = outcome.assistant_message;
                println!("{}", label(reply.role));
                self.reveal.start_reveal(reply.id, reply.content.as_str());
                self.print_reveal(reply.id, &reply.content).await?;
                println!(
                    "{}[{} · {} ms]{}",
                    ansi::GRAY,
                    reply.model_id.as_deref().unwrap_or("-"),
                    outcome.response_time_ms,
                    ansi::RESET
                );
            }
            Err(e) => {
                self.transcript.discard_echo(echo);
                self.notice(&e);
            }
        }
        Ok(())
    }

    /// Redraws the formatted prefix on every tick until the reveal of `slot` completes.
    async fn print_reveal(&mut self, slot: crate::render::SlotId, full: &str) -> Result<()> {
        if full.is_empty() {
            println!();
            return Ok(());
        }
        let mut drawn = 0;
        let mut stdout = std::io::stdout();
        while let Some(tick) = self.ticks.recv().await {
            if tick.slot != slot {
                continue;
            }
            let (frame, lines) = redraw(drawn, &tick.displayed);
            stdout.write_all(frame.as_bytes())?;
            stdout.flush()?;
            drawn = lines;
            if tick.done {
                break;
            }
        }
        println!();
        Ok(())
    }

    fn search(&mut self, query: &str) {
        let entries: Vec<_> = self.transcript.entries().into_iter().cloned().collect();
        match self.search.update(query, &entries) {
            ScrollSignal::Center(slot) => {
                if let Some(entry) = entries.iter().find(|e| e.slot == slot) {
                    println!("{}", label(entry.role));
                    println!("{}", blocks_to_ansi(&format_blocks(&entry.content, self.search.query())));
                }
            }
            ScrollSignal::Clear => println!("{}No match.{}", ansi::DIM, ansi::RESET),
        }
    }

    fn history(&self) {
        let query = self.search.query();
        for entry in self.transcript.entries() {
            match entry.kind {
                EntryKind::Notice => println!("{}{}{}", ansi::RED, entry.content, ansi::RESET),
                EntryKind::Committed | EntryKind::Echo => {
                    println!("{}", label(entry.role));
                    println!("{}", blocks_to_ansi(&format_blocks(&entry.content, query)));
                }
            }
        }
    }
}
