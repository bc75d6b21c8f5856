use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};

use anuja::chat::{ChatTurnProducer, IgnoreReason, SubmitOutcome};
use anuja::console::{self, Command, HELP_TEXT};
use anuja::dashboard::{Dashboard, SessionTransition, Tab, Workspace};
use anuja::images::{GalleryResult, GenerateOutcome, ImageRequestor};
use anuja::records::GeneratedImageRecord;
use anuja::session::{LocalSessionProvider, SessionContext, SessionProvider};
use anuja::settings::{IN_MEMORY_DATABASE, SettingsError, SettingsStore};
use anuja::sync::ViewSync;
use anuja::telemetry;
use anuja_imagine::{ImageClient, ImagineError};
use anuja_storage::{DocumentStore, MemoryDocumentStore, SqliteDocumentStore, StorageError};

#[derive(Debug, Clone, Default)]
struct AppArgs {
    config_path: Option<PathBuf>,
    database: Option<String>,
    write_config: bool,
}

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("failed to open document store '{database}': {source}"))]
    OpenStore {
        stage: &'static str,
        database: String,
        source: StorageError,
    },
    #[snafu(display("failed to set up image client: {source}"))]
    BuildImageClient {
        stage: &'static str,
        source: ImagineError,
    },
    #[snafu(display("failed to write settings: {source}"))]
    WriteConfig {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to read console input: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

type AppResult<T> = Result<T, AppError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("anuja: {error}");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let mut settings_store = args
        .config_path
        .clone()
        .map_or_else(SettingsStore::load, SettingsStore::new);
    let mut settings = settings_store.settings().clone();
    if let Some(database) = args.database {
        settings.database = database;
    }
    telemetry::init_tracing(&settings.log_filter);

    if args.write_config {
        settings_store.update(settings).context(WriteConfigSnafu {
            stage: "write-config",
        })?;
        println!("wrote {}", settings_store.config_path().display());
        return Ok(());
    }

    let store = open_store(&settings.database).await?;
    let sync = ViewSync::new(store);
    let client = ImageClient::new(settings.image.to_endpoint()).context(BuildImageClientSnafu {
        stage: "build-image-client",
    })?;

    let mut app = ConsoleApp {
        sessions: LocalSessionProvider::new(),
        dashboard: Dashboard::new(sync.clone()),
        chat: Arc::new(ChatTurnProducer::new(
            sync.clone(),
            settings.chat.reply_delay(),
        )),
        images: Arc::new(ImageRequestor::new(
            sync,
            client,
            settings.resolved_download_dir(),
        )),
    };

    let mut session_rx = app.sessions.watch();
    let mut chat_pending = app.chat.watch_pending();
    let mut generating = app.images.watch_generating();
    let mut image_loads = app.images.watch_image_loads();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{HELP_TEXT}");
    app.render();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line.context(ReadInputSnafu { stage: "console-read-line" })?;
                let Some(line) = line else {
                    break;
                };
                if app.handle_line(&line) == Flow::Quit {
                    break;
                }
            }
            Ok(()) = session_rx.changed() => {
                let context = session_rx.borrow_and_update().clone();
                if app.apply_session(context) {
                    app.render();
                }
            }
            tab = workspace_changed(app.dashboard.workspace_mut()) => {
                if app.dashboard.tab() == tab {
                    app.render();
                }
            }
            Ok(()) = chat_pending.changed() => {
                chat_pending.borrow_and_update();
                if app.dashboard.tab() == Tab::Chat {
                    app.render();
                }
            }
            Ok(()) = generating.changed() => {
                generating.borrow_and_update();
                if app.dashboard.tab() == Tab::Generate {
                    app.render();
                }
            }
            Ok(()) = image_loads.changed() => {
                image_loads.borrow_and_update();
                if matches!(app.dashboard.tab(), Tab::Generate | Tab::Gallery) {
                    app.render();
                }
            }
        }
    }

    app.apply_session(SessionContext::SignedOut);
    tracing::debug!("console closed");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> AppResult<AppArgs> {
    let mut parsed = AppArgs::default();
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                parsed.config_path = Some(PathBuf::from(value));
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                parsed.database = Some(value);
            }
            "--write-config" => parsed.write_config = true,
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(parsed)
}

async fn open_store(database: &str) -> AppResult<Arc<dyn DocumentStore>> {
    if database == IN_MEMORY_DATABASE {
        tracing::info!("using in-memory document store; nothing will be kept");
        return Ok(Arc::new(MemoryDocumentStore::new()));
    }

    let store = SqliteDocumentStore::open(database)
        .await
        .context(OpenStoreSnafu {
            stage: "open-document-store",
            database: database.to_string(),
        })?;
    tracing::info!(database = store.database_url(), "opened sqlite document store");
    Ok(Arc::new(store))
}

// Resolves with the tab whose projection changed; never resolves while signed out.
async fn workspace_changed(workspace: Option<&mut Workspace>) -> Tab {
    let Some(workspace) = workspace else {
        return std::future::pending().await;
    };
    tokio::select! {
        _ = workspace.chat.changed() => Tab::Chat,
        _ = workspace.gallery.changed() => Tab::Gallery,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

struct ConsoleApp {
    sessions: LocalSessionProvider,
    dashboard: Dashboard,
    chat: Arc<ChatTurnProducer>,
    images: Arc<ImageRequestor>,
}

impl ConsoleApp {
    /// Returns whether the signed-in owner changed. Image state from the previous
    /// session is dropped along with its projections.
    fn apply_session(&mut self, context: SessionContext) -> bool {
        let changed = self.dashboard.apply_session(context) != SessionTransition::Unchanged;
        if changed {
            self.images.clear_session_state();
        }
        changed
    }

    fn screen(&self) -> String {
        let preview = self.images.preview(self.dashboard.context());
        console::render_dashboard(
            &self.dashboard,
            self.chat.pending(),
            preview.as_deref(),
            self.images.generating(),
            &self.images.image_loads(),
        )
    }

    fn render(&self) {
        print!("{}", self.screen());
    }

    fn handle_line(&mut self, line: &str) -> Flow {
        let command = match console::parse_command(line) {
            None => return Flow::Continue,
            Some(Err(error)) => {
                println!("{error}");
                return Flow::Continue;
            }
            Some(Ok(command)) => command,
        };

        match command {
            Command::Login(email) => {
                if let Err(error) = self.sessions.sign_in(&email) {
                    println!("{error}");
                }
            }
            Command::Logout => {
                if !self.sessions.sign_out() {
                    println!("not signed in");
                }
            }
            Command::Tab(tab) => {
                self.dashboard.set_tab(tab);
                self.render();
            }
            Command::Gallery => {
                self.dashboard.set_tab(Tab::Gallery);
                self.render();
            }
            Command::Chat(text) => {
                self.dashboard.set_tab(Tab::Chat);
                let context = self.sessions.current();
                let chat = Arc::clone(&self.chat);
                tokio::spawn(async move {
                    match chat.submit(&context, &text).await {
                        SubmitOutcome::Ignored(reason) => println!("{}", ignored_message(reason)),
                        SubmitOutcome::Delivered { .. } => {}
                        SubmitOutcome::Failed(error) => println!("message not sent: {error}"),
                    }
                });
            }
            Command::Imagine(prompt) => {
                self.dashboard.set_tab(Tab::Generate);
                let context = self.sessions.current();
                let images = Arc::clone(&self.images);
                tokio::spawn(async move {
                    match images.generate(&context, &prompt).await {
                        GenerateOutcome::Ignored(reason) => println!("{}", ignored_message(reason)),
                        GenerateOutcome::Saved { .. } => {}
                        GenerateOutcome::Failed(error) => println!("image not saved: {error}"),
                    }
                });
            }
            Command::Delete(position) => {
                let Some(record) = self.gallery_record(position) else {
                    return Flow::Continue;
                };
                let images = Arc::clone(&self.images);
                tokio::spawn(async move {
                    match images.delete(record.id).await {
                        Ok(true) => {}
                        Ok(false) => println!("that image was already gone"),
                        Err(error) => println!("delete failed: {error}"),
                    }
                });
            }
            Command::Download(Some(position)) => {
                let Some(record) = self.gallery_record(position) else {
                    return Flow::Continue;
                };
                let images = Arc::clone(&self.images);
                tokio::spawn(async move {
                    report_download(images.download_record(&record).await);
                });
            }
            Command::Download(None) => {
                let context = self.sessions.current();
                let images = Arc::clone(&self.images);
                tokio::spawn(async move {
                    report_download(images.download_preview(&context).await);
                });
            }
            Command::Help => println!("{HELP_TEXT}"),
            Command::Quit => return Flow::Quit,
        }

        Flow::Continue
    }

    fn gallery_record(&self, position: usize) -> Option<GeneratedImageRecord> {
        let Some(workspace) = self.dashboard.workspace() else {
            println!("sign in first");
            return None;
        };
        let gallery = workspace.gallery.items();
        match console::gallery_entry(&gallery, position) {
            Ok(record) => Some(record.clone()),
            Err(error) => {
                println!("{error}");
                None
            }
        }
    }
}

fn ignored_message(reason: IgnoreReason) -> &'static str {
    match reason {
        IgnoreReason::Blank => "nothing to send",
        IgnoreReason::SignedOut => "sign in first",
        IgnoreReason::AlreadyPending => "still working on the previous request",
    }
}

fn report_download(result: GalleryResult<PathBuf>) {
    match result {
        Ok(path) => println!("saved {}", path.display()),
        Err(error) => println!("download failed: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anuja_imagine::ImageEndpoint;

    use super::*;

    fn console_app() -> ConsoleApp {
        let sync = ViewSync::new(Arc::new(MemoryDocumentStore::new()));
        let client = ImageClient::new(ImageEndpoint::new(
            "https://image.pollinations.ai",
            1024,
            1024,
            true,
        ))
        .expect("http client");
        ConsoleApp {
            sessions: LocalSessionProvider::new(),
            dashboard: Dashboard::new(sync.clone()),
            chat: Arc::new(ChatTurnProducer::new(sync.clone(), Duration::from_millis(1))),
            images: Arc::new(ImageRequestor::new(sync, client, std::env::temp_dir())),
        }
    }

    #[tokio::test]
    async fn next_user_never_sees_the_previous_preview() {
        let mut app = console_app();
        app.sessions.sign_in("alice@example.com").expect("valid email");
        assert!(app.apply_session(app.sessions.current()));
        let outcome = app
            .images
            .generate(&app.sessions.current(), "alice private prompt")
            .await;
        assert!(matches!(outcome, GenerateOutcome::Saved { .. }));

        app.sessions.sign_out();
        assert!(app.apply_session(app.sessions.current()));
        app.sessions.sign_in("bob@example.com").expect("valid email");
        assert!(app.apply_session(app.sessions.current()));
        app.dashboard.set_tab(Tab::Generate);

        let screen = app.screen();
        assert!(screen.contains("Welcome back, bob"));
        assert!(!screen.contains("alice%20private%20prompt"));
        assert_eq!(app.images.preview(&app.sessions.current()), None);
    }

    #[tokio::test]
    async fn same_session_keeps_its_preview() {
        let mut app = console_app();
        app.sessions.sign_in("alice@example.com").expect("valid email");
        app.apply_session(app.sessions.current());
        app.images
            .generate(&app.sessions.current(), "a lighthouse")
            .await;

        assert!(!app.apply_session(app.sessions.current()));
        app.dashboard.set_tab(Tab::Generate);
        assert!(app.screen().contains("a%20lighthouse"));
    }

    fn args(raw: &[&str]) -> AppResult<AppArgs> {
        parse_args(raw.iter().map(|value| value.to_string()))
    }

    #[test]
    fn flags_are_parsed_strictly() {
        let parsed = args(&["--db", ":memory:", "--config", "/tmp/a.json", "--write-config"])
            .expect("valid arguments");
        assert_eq!(parsed.database.as_deref(), Some(":memory:"));
        assert_eq!(parsed.config_path, Some(PathBuf::from("/tmp/a.json")));
        assert!(parsed.write_config);

        assert!(matches!(
            args(&["--db"]),
            Err(AppError::MissingArgumentValue { arg: "--db", .. })
        ));
        assert!(matches!(args(&["--verbose"]), Err(AppError::UnknownArgument { .. })));
    }
}
