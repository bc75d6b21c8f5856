//! Line-oriented presentation: command parsing and plain-text rendering of the
//! dashboard.

use std::fmt::Write as _;

use snafu::{OptionExt, Snafu};

use crate::dashboard::{Dashboard, EMPTY_GALLERY_TEXT, Tab};
use crate::records::{ConversationTurn, GeneratedImageRecord, ImageLoads, TurnSender};
use crate::sync::{Projection, SyncState};

pub const HELP_TEXT: &str = "\
commands:
  login <email>        sign in
  logout               sign out
  tab <chat|generate|gallery>
  chat <message>       send a message
  imagine <prompt>     generate an image
  gallery              show your images
  delete <n>           delete gallery image n
  download [n]         save gallery image n, or the latest preview
  help                 show this text
  quit                 exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login(String),
    Logout,
    Tab(Tab),
    Chat(String),
    Imagine(String),
    Gallery,
    /// 1-based position in the gallery as rendered.
    Delete(usize),
    Download(Option<usize>),
    Help,
    Quit,
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command '{raw}' (try 'help')"))]
    UnknownCommand { stage: &'static str, raw: String },
    #[snafu(display("'{command}' needs an argument"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
    },
    #[snafu(display("'{raw}' is not a valid argument for '{command}': {reason}"))]
    InvalidArgument {
        stage: &'static str,
        command: &'static str,
        raw: String,
        reason: String,
    },
}

/// Parses one input line. Returns `None` for a blank line.
///
/// The text after `chat` or `imagine` is passed through untouched apart from the
/// single separating space, so prompts keep their exact wording.
pub fn parse_command(line: &str) -> Option<Result<Command, CommandError>> {
    let line = line.trim_start().trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest),
        None => (line, ""),
    };
    Some(parse_words(word, rest))
}

fn parse_words(word: &str, rest: &str) -> Result<Command, CommandError> {
    let argument = rest.trim();
    match word.to_ascii_lowercase().as_str() {
        "login" => {
            let email = non_empty(argument, "login")?;
            Ok(Command::Login(email.to_string()))
        }
        "logout" => Ok(Command::Logout),
        "tab" => {
            let raw = non_empty(argument, "tab")?;
            raw.parse::<Tab>()
                .map(Command::Tab)
                .map_err(|reason| CommandError::InvalidArgument {
                    stage: "console-parse-tab",
                    command: "tab",
                    raw: raw.to_string(),
                    reason,
                })
        }
        "chat" => Ok(Command::Chat(rest.to_string())),
        "imagine" => Ok(Command::Imagine(rest.to_string())),
        "gallery" => Ok(Command::Gallery),
        "delete" => {
            let raw = non_empty(argument, "delete")?;
            parse_position(raw, "delete").map(Command::Delete)
        }
        "download" => {
            if argument.is_empty() {
                return Ok(Command::Download(None));
            }
            parse_position(argument, "download").map(|position| Command::Download(Some(position)))
        }
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        _ => UnknownCommandSnafu {
            stage: "console-parse-command",
            raw: word.to_string(),
        }
        .fail(),
    }
}

fn non_empty<'a>(argument: &'a str, command: &'static str) -> Result<&'a str, CommandError> {
    (!argument.is_empty())
        .then_some(argument)
        .context(MissingArgumentSnafu {
            stage: "console-parse-argument",
            command,
        })
}

fn parse_position(raw: &str, command: &'static str) -> Result<usize, CommandError> {
    let position = raw
        .parse::<usize>()
        .map_err(|error| error.to_string())
        .and_then(|position| {
            if position == 0 {
                Err("positions start at 1".to_string())
            } else {
                Ok(position)
            }
        });
    position.map_err(|reason| {
        InvalidArgumentSnafu {
            stage: "console-parse-position",
            command,
            raw,
            reason,
        }
        .build()
    })
}

/// Looks up the gallery entry shown at 1-based `position`.
pub fn gallery_entry(
    gallery: &[GeneratedImageRecord],
    position: usize,
) -> Result<&GeneratedImageRecord, CommandError> {
    position
        .checked_sub(1)
        .and_then(|index| gallery.get(index))
        .context(InvalidArgumentSnafu {
            stage: "console-gallery-entry",
            command: "gallery",
            raw: position.to_string(),
            reason: format!("the gallery has {} image(s)", gallery.len()),
        })
}

pub fn render_chat(turns: &[ConversationTurn], pending: bool) -> String {
    let mut out = String::new();
    if turns.is_empty() {
        out.push_str("No messages yet. Say hello!\n");
    }
    for turn in turns {
        let speaker = match turn.sender {
            TurnSender::User => "you",
            TurnSender::Assistant => "ai",
        };
        let _ = writeln!(
            out,
            "[{}] {speaker}: {}",
            turn.created_at.format("%H:%M"),
            turn.text
        );
    }
    if pending {
        out.push_str("ai is typing...\n");
    }
    out
}

/// Lists the gallery; images whose fetch failed show the placeholder instead.
pub fn render_gallery(images: &[GeneratedImageRecord], loads: &ImageLoads) -> String {
    if images.is_empty() {
        return format!("{EMPTY_GALLERY_TEXT}\n");
    }
    let mut out = String::new();
    for (index, image) in images.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. {} ({})\n   {}",
            index + 1,
            image.prompt,
            image.created_at.format("%Y-%m-%d"),
            image.display_url(loads.get(&image.url))
        );
    }
    out
}

pub fn render_generate(preview: Option<&str>, generating: bool, loads: &ImageLoads) -> String {
    match (generating, preview) {
        (true, _) => "generating...\n".to_string(),
        (false, Some(url)) => format!("latest image:\n   {}\n", loads.display_url(url)),
        (false, None) => "Describe an image with 'imagine <prompt>'.\n".to_string(),
    }
}

/// One-line status for a projection that is not simply showing data.
pub fn render_sync_state<T>(label: &str, projection: &Projection<T>) -> Option<String> {
    match projection.state {
        SyncState::Active => None,
        SyncState::Subscribing => Some(format!("{label}: loading...")),
        SyncState::Unsubscribed => Some(format!("{label}: not connected")),
        SyncState::Error => Some(format!(
            "{label}: sync error: {}",
            projection.last_error.as_deref().unwrap_or("unknown failure")
        )),
    }
}

/// Renders the active tab. Signed-out users only see the sign-in hint.
pub fn render_dashboard(
    dashboard: &Dashboard,
    chat_pending: bool,
    preview: Option<&str>,
    generating: bool,
    loads: &ImageLoads,
) -> String {
    let Some(workspace) = dashboard.workspace() else {
        return "Signed out. Use 'login <email>' to start.\n".to_string();
    };

    let mut out = String::new();
    if let Some(greeting) = dashboard.greeting() {
        let _ = writeln!(out, "{greeting}  [{}]", dashboard.tab());
    }
    match dashboard.tab() {
        Tab::Chat => {
            let chat = workspace.chat.snapshot();
            if let Some(status) = render_sync_state("chat", &chat) {
                let _ = writeln!(out, "{status}");
            }
            out.push_str(&render_chat(&chat.items, chat_pending));
        }
        Tab::Generate => out.push_str(&render_generate(preview, generating, loads)),
        Tab::Gallery => {
            let gallery = workspace.gallery.snapshot();
            if let Some(status) = render_sync_state("gallery", &gallery) {
                let _ = writeln!(out, "{status}");
            }
            out.push_str(&render_gallery(&gallery.items, loads));
        }
    }
    out
}
