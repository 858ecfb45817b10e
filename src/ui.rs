//! Line-oriented terminal front-end.

use crate::api::ApiClient;
use crate::auth::{self, CredentialStore};
use crate::chat::{
    ActionCoordinator, Outcome, StreamSynchronizer, StreamTicket, Transcript, TranscriptChange,
};
use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult};
use crate::types::{Action, FileMeta, Message, ReplyStatus, UserMessage};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use time::{OffsetDateTime, UtcOffset, format_description::FormatItem, macros::format_description};
use tokio::io::{AsyncBufReadExt, BufReader};

const MESSAGE_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[hour repr:12 padding:zero]:[minute padding:zero] [period case:upper]");

const HELP: &str = "\
Commands:
  /login <email> <password>     sign in
  /register <email> <password>  create an account
  /logout                       sign out
  /me                           show the signed-in user
  /files                        list documents
  /upload <path>...             upload PDF documents
  /delete <id|#>                delete a document
  /status <id|#>                show indexing status
  /url <id|#>                   print a temporary download link
  /download <id|#> <path>       save a document locally
  /open <id|#>                  open the conversation for a document
  /translate <text>             translate a snippet
  /explain <text>               explain a snippet
  /ask <text>                   ask about a snippet
  /context                      show the sources behind the last answer
  /cancel                       stop the current answer
  /help                         show this help
  /quit                         exit
Anything else is sent as a question about the open document.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Login { email: String, password: String },
    Register { email: String, password: String },
    Logout,
    Me,
    Files,
    Upload(Vec<PathBuf>),
    Delete(String),
    Status(String),
    Url(String),
    Download { file: String, path: PathBuf },
    Open(String),
    Shortcut { action: Action, text: String },
    Context,
    Cancel,
    Help,
    Quit,
    Say(String),
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let words: Vec<&str> = args.split_whitespace().collect();

    let command = match name {
        "login" | "register" => {
            let [email, password] = words.as_slice() else {
                return Err(format!("usage: /{name} <email> <password>"));
            };
            let (email, password) = (email.to_string(), password.to_string());
            if name == "login" {
                Command::Login { email, password }
            } else {
                Command::Register { email, password }
            }
        }
        "logout" => Command::Logout,
        "me" => Command::Me,
        "files" | "ls" => Command::Files,
        "upload" => {
            if words.is_empty() {
                return Err("usage: /upload <path>...".to_string());
            }
            Command::Upload(words.iter().map(PathBuf::from).collect())
        }
        "delete" | "status" | "url" | "open" => {
            let [file] = words.as_slice() else {
                return Err(format!("usage: /{name} <id|#>"));
            };
            let file = file.to_string();
            match name {
                "delete" => Command::Delete(file),
                "status" => Command::Status(file),
                "url" => Command::Url(file),
                _ => Command::Open(file),
            }
        }
        "download" => {
            let [file, path] = words.as_slice() else {
                return Err("usage: /download <id|#> <path>".to_string());
            };
            Command::Download {
                file: file.to_string(),
                path: PathBuf::from(path),
            }
        }
        "translate" | "explain" | "ask" => {
            if args.is_empty() {
                return Err(format!("usage: /{name} <text>"));
            }
            let action = name.parse::<Action>().map_err(|err| err.to_string())?;
            Command::Shortcut {
                action,
                text: args.to_string(),
            }
        }
        "context" => Command::Context,
        "cancel" => Command::Cancel,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(Some(command))
}

fn format_message_timestamp(timestamp: Option<OffsetDateTime>) -> Option<String> {
    let mut datetime = timestamp?;
    if let Ok(offset) = UtcOffset::current_local_offset() {
        datetime = datetime.to_offset(offset);
    }
    datetime.format(MESSAGE_TIME_FORMAT).ok()
}

/// One-line rendering of a message for transcript listings.
pub fn render_message(message: &Message) -> String {
    let stamp = format_message_timestamp(message.created_at())
        .map(|ts| format!("[{ts}] "))
        .unwrap_or_default();
    match message {
        Message::User(user) => match (&user.snippet, user.action) {
            (Some(snippet), action) if action != Action::Default => {
                format!("{stamp}you ({action}): {snippet}")
            }
            _ => format!("{stamp}you: {}", user.content),
        },
        Message::Assistant(reply) => {
            let suffix = match reply.status {
                ReplyStatus::Streaming => " …",
                ReplyStatus::Complete => "",
                ReplyStatus::Failed => " [failed]",
                ReplyStatus::Cancelled => " [cancelled]",
            };
            format!("{stamp}assistant: {}{suffix}", reply.content)
        }
    }
}

/// Prints streamed replies incrementally as the transcript changes.
#[derive(Default)]
struct StreamPrinter {
    printed: usize,
    open: bool,
}

impl StreamPrinter {
    fn observe(&mut self, transcript: &Transcript, change: TranscriptChange) {
        let reply = match change {
            TranscriptChange::Loaded => {
                self.open = false;
                return;
            }
            TranscriptChange::Appended(_) => match transcript.last().and_then(Message::as_assistant)
            {
                Some(reply) => {
                    self.printed = 0;
                    self.open = true;
                    print!("assistant: ");
                    reply
                }
                None => return,
            },
            TranscriptChange::Updated(_) if self.open => {
                match transcript.last().and_then(Message::as_assistant) {
                    Some(reply) => reply,
                    None => return,
                }
            }
            TranscriptChange::Updated(_) => return,
        };

        if reply.content.len() > self.printed {
            print!("{}", &reply.content[self.printed..]);
            self.printed = reply.content.len();
        }
        match reply.status {
            ReplyStatus::Streaming => {}
            ReplyStatus::Complete => self.close(""),
            ReplyStatus::Failed => self.close(" [failed]"),
            ReplyStatus::Cancelled => self.close(" [cancelled]"),
        }
        let _ = std::io::stdout().flush();
    }

    fn close(&mut self, note: &str) {
        println!("{note}");
        self.open = false;
    }
}

pub struct App {
    api: ApiClient,
    sync: StreamSynchronizer,
    shortcuts: ActionCoordinator,
    files: Vec<FileMeta>,
}

impl App {
    /// Wires the API client, synchronizer and shortcut coordinator together.
    pub fn new(config: &ClientConfig) -> Self {
        let api = ApiClient::new(config);
        let sync = StreamSynchronizer::new(Arc::new(api.clone()), config.idle_timeout);

        let printer = Mutex::new(StreamPrinter::default());
        sync.with_conversation(|conversation| {
            conversation
                .transcript_mut()
                .subscribe(move |transcript, change| {
                    printer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .observe(transcript, change);
                });
        });

        let shortcuts = ActionCoordinator::new(sync.clone(), config.trusted_origin.clone());

        Self {
            api,
            sync,
            shortcuts,
            files: Vec::new(),
        }
    }

    /// Accepts a file id or a `#n` index into the last listing.
    fn resolve_file(&self, raw: &str) -> String {
        raw.strip_prefix('#')
            .and_then(|idx| idx.parse::<usize>().ok())
            .and_then(|idx| idx.checked_sub(1))
            .and_then(|idx| self.files.get(idx))
            .map(|file| file.file_id.clone())
            .unwrap_or_else(|| raw.to_string())
    }

    fn require_sign_in() -> ChatResult<()> {
        auth::current().map(|_| ()).ok_or(ChatError::NotSignedIn)
    }

    pub async fn execute(&mut self, command: Command) -> ChatResult<()> {
        match command {
            Command::Login { email, password } => {
                let session = self.api.login(&email, &password).await?;
                println!("signed in as {}", session.email);
            }
            Command::Register { email, password } => {
                let session = self.api.register(&email, &password).await?;
                println!("registered and signed in as {}", session.email);
            }
            Command::Logout => {
                self.sync.cancel();
                if let Err(err) = self.api.logout().await {
                    tracing::debug!("logout request failed: {err}");
                }
                self.files.clear();
                println!("signed out");
            }
            Command::Me => {
                Self::require_sign_in()?;
                println!("{}", self.api.me().await?);
            }
            Command::Files => {
                Self::require_sign_in()?;
                self.files = self.api.list_files().await?;
                if self.files.is_empty() {
                    println!("no documents yet, /upload one");
                }
                for (idx, file) in self.files.iter().enumerate() {
                    let indexed = if file.is_indexed { "" } else { " (indexing)" };
                    println!("#{:<3} {}  {}{indexed}", idx + 1, file.file_id, file.filename);
                }
            }
            Command::Upload(paths) => {
                Self::require_sign_in()?;
                for file in self.api.upload_files(&paths).await? {
                    println!("uploaded {} as {}", file.filename, file.file_id);
                }
            }
            Command::Delete(file) => {
                Self::require_sign_in()?;
                let file_id = self.resolve_file(&file);
                if self.sync.with_conversation(|c| c.transcript().key() == Some(file_id.as_str())) {
                    self.sync.cancel();
                }
                let deleted = self.api.delete_file(&file_id).await?;
                println!("{}", if deleted { "deleted" } else { "not deleted" });
            }
            Command::Status(file) => {
                Self::require_sign_in()?;
                let indexed = self.api.file_status(&self.resolve_file(&file)).await?;
                println!("{}", if indexed { "indexed" } else { "indexing" });
            }
            Command::Url(file) => {
                Self::require_sign_in()?;
                println!("{}", self.api.signed_url(&self.resolve_file(&file)).await?);
            }
            Command::Download { file, path } => {
                Self::require_sign_in()?;
                let bytes = self.api.file_bytes(&self.resolve_file(&file)).await?;
                tokio::fs::write(&path, &bytes).await?;
                println!("saved {} bytes to {}", bytes.len(), path.display());
            }
            Command::Open(file) => {
                Self::require_sign_in()?;
                let file_id = self.resolve_file(&file);
                if !self.api.file_status(&file_id).await? {
                    println!("document is still indexing, answers may fail until it is ready");
                }
                let history = self.api.history(&file_id).await?;
                let count = history.len();
                self.sync.switch_conversation(file_id.clone(), history);
                self.sync.with_conversation(|conversation| {
                    for message in conversation.transcript().messages() {
                        println!("{}", render_message(message));
                    }
                });
                println!("opened {file_id} ({count} earlier messages)");
            }
            Command::Shortcut { action, text } => {
                Self::require_sign_in()?;
                match self.shortcuts.submit(action, &text) {
                    Outcome::Started(ticket) => report_when_done(ticket),
                    Outcome::Ignored(reason) => println!("ignored: {reason:?}"),
                    Outcome::Rejected(err) => return Err(err),
                }
            }
            Command::Context => {
                let chunks = self.sync.with_conversation(|conversation| {
                    conversation
                        .transcript()
                        .messages()
                        .iter()
                        .rev()
                        .find_map(Message::as_assistant)
                        .map(|reply| reply.context_chunks.clone())
                });
                match chunks {
                    Some(chunks) if !chunks.is_empty() => {
                        for (idx, chunk) in chunks.iter().enumerate() {
                            println!("[{}] {chunk}", idx + 1);
                        }
                    }
                    _ => println!("no sources for the last answer"),
                }
            }
            Command::Cancel => match self.sync.cancel() {
                Some(session) => tracing::debug!(%session, "cancelled from prompt"),
                None => println!("nothing to cancel"),
            },
            Command::Help => println!("{HELP}"),
            Command::Quit => {}
            Command::Say(text) => {
                Self::require_sign_in()?;
                let ticket = self.sync.start_stream(UserMessage::text(text))?;
                report_when_done(ticket);
            }
        }
        Ok(())
    }
}

fn report_when_done(ticket: StreamTicket) {
    tokio::spawn(async move {
        match ticket.outcome().await {
            Ok(()) | Err(ChatError::Cancelled) => {}
            Err(err) => report(&err),
        }
    });
}

fn report(err: &ChatError) {
    match err {
        ChatError::AuthExpired => eprintln!("session expired, please /login again"),
        ChatError::AlreadyStreaming => eprintln!("still answering, wait or /cancel"),
        ChatError::NoConversation => eprintln!("open a document first with /open"),
        other => eprintln!("error: {other}"),
    }
}

/// Runs the interactive prompt until `/quit` or end of input.
pub async fn run() -> anyhow::Result<()> {
    let config = ClientConfig::from_env();
    let store = config
        .session_file
        .clone()
        .map(CredentialStore::new)
        .unwrap_or_else(CredentialStore::default_location);
    let restored = auth::init(store);

    let mut app = App::new(&config);
    println!("docchat connected to {}", config.api_url);
    match restored {
        Some(session) => println!("signed in as {}, /files to begin", session.email),
        None => println!("/login <email> <password> to begin, /help for commands"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(None) => {}
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => {
                if let Err(err) = app.execute(command).await {
                    report(&err);
                }
            }
            Err(usage) => eprintln!("{usage}"),
        }
    }

    app.sync.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_question() {
        assert_eq!(
            parse_command("  what is chapter 2 about? "),
            Ok(Some(Command::Say("what is chapter 2 about?".into())))
        );
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(
            parse_command("/login a@b.c hunter2"),
            Ok(Some(Command::Login {
                email: "a@b.c".into(),
                password: "hunter2".into()
            }))
        );
        assert_eq!(
            parse_command("/translate Der Hund  schläft"),
            Ok(Some(Command::Shortcut {
                action: Action::Translate,
                text: "Der Hund  schläft".into()
            }))
        );
        assert_eq!(
            parse_command("/ask why is the sky blue"),
            Ok(Some(Command::Shortcut {
                action: Action::Ask,
                text: "why is the sky blue".into()
            }))
        );
        assert!(HELP.contains("/ask <text>"));
        assert_eq!(
            parse_command("/download #2 out.pdf"),
            Ok(Some(Command::Download {
                file: "#2".into(),
                path: PathBuf::from("out.pdf")
            }))
        );
        assert_eq!(
            parse_command("/upload a.pdf b.pdf"),
            Ok(Some(Command::Upload(vec![
                PathBuf::from("a.pdf"),
                PathBuf::from("b.pdf")
            ])))
        );
    }

    #[test]
    fn rejects_bad_usage() {
        assert!(parse_command("/login only-email").is_err());
        assert!(parse_command("/open").is_err());
        assert!(parse_command("/explain").is_err());
        assert!(parse_command("/frobnicate").is_err());
    }

    #[test]
    fn renders_shortcut_and_reply() {
        let mut user = UserMessage::shortcut(Action::Explain, "entropy");
        user.created_at = None;
        assert_eq!(
            render_message(&Message::User(user)),
            "you (explain): entropy"
        );

        let mut reply = crate::types::AssistantMessage::placeholder();
        reply.created_at = None;
        reply.content = "partial".into();
        reply.status = ReplyStatus::Failed;
        assert_eq!(
            render_message(&Message::Assistant(reply)),
            "assistant: partial [failed]"
        );
    }
}
