// src/main.rs
use std::env;
use std::error::Error;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use crossterm::event::{Event as CEvent, EventStream, KeyEventKind};
use crossterm::{
    cursor::Show,
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures::StreamExt;
use ratatui::{Terminal, backend::CrosstermBackend};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

mod app;
mod dispatch;
mod error;
mod model;
mod oauth;
mod store;
mod ui;
mod vault;

use app::App;
use dispatch::Dispatcher;
use model::AppEvent;
use oauth::TokenClient;
use store::ClientStore;
use ui::draw_ui;
use vault::Bitwarden;

const LOG_FILE: &str = "tkz.log";
const LOG_ENV: &str = "TKZ_LOG";
const SESSION_ENV: &str = "BW_SESSION";
const TICK_RATE: Duration = Duration::from_millis(100);

const USAGE: &str = "\
tkz - fetch OAuth client-credentials tokens with secrets kept in Bitwarden

Usage: tkz [--debug]

Options:
  -h, --help       Print this help
  -v, --version    Print the version
      --debug      Write a debug log to <config dir>/tkz.log

Environment:
  BW_SESSION       Existing Bitwarden session token (read once at startup)
  TKZ_CONFIG_DIR   Config directory (default: ~/.config/tkz)
  TKZ_LOG          Log filter for --debug (default: debug)

Keys:
  Enter  get token    a  add client    e  edit    d  delete    /  filter
  c      copy token   h  copy header   Esc back   q  quit      Ctrl-C quit
";

fn main() -> ExitCode {
    // parse flags
    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("tkz {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print!("{}", USAGE);
        return ExitCode::SUCCESS;
    }
    let debug_mode = args.iter().any(|a| a == "--debug");

    dotenv::dotenv().ok();

    let dir = match store::config_dir().and_then(|dir| {
        store::ensure_config_dir(&dir)?;
        Ok(dir)
    }) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("tkz: config directory: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // initialize tracing to file only when --debug is passed
    if debug_mode {
        if let Err(e) = init_tracing(&dir) {
            eprintln!("tkz: could not open log file: {}", e);
        }
    }

    let session = env::var(SESSION_ENV).unwrap_or_default();
    // SAFETY: single-threaded at this point; the runtime is built below.
    unsafe { env::remove_var(SESSION_ENV) };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("tkz: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(dir, session)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tkz: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(dir: &Path) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))?;
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("debug"));
    let fmt_layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_target(false)
        .with_ansi(false);
    Registry::default().with(filter).with(fmt_layer).init();
    info!("Tracing initialized to {} ({})", LOG_FILE, env!("CARGO_PKG_VERSION"));
    Ok(())
}

struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, Show);
    }
}

async fn run(dir: PathBuf, session: String) -> Result<(), Box<dyn Error>> {
    info!("Starting tkz");

    let store = ClientStore::in_dir(&dir);
    let (clients, load_error) = match store.load() {
        Ok(clients) => (clients, None),
        Err(e) => {
            warn!("could not load clients: {}", e);
            (Vec::new(), Some(e))
        }
    };
    let mut app = App::new(clients, session);
    if let Some(e) = load_error {
        // the first save would replace the unreadable file
        match store.backup() {
            Ok(copy) => {
                app.status_message = Some(format!(
                    "Error loading clients: {} (copy kept at {})",
                    e,
                    copy.display()
                ));
            }
            Err(backup_err) => {
                app.status_message = Some(format!("Error loading clients: {}", e));
                app.hold_saves(format!("clients file unreadable and not backed up ({})", backup_err));
            }
        }
    }

    // Channel for background tasks -> UI
    let (tx, mut rx) = mpsc::unbounded_channel::<AppEvent>();
    let dispatcher = Dispatcher::new(tx, Bitwarden::default(), TokenClient::new()?, store);
    for command in app.startup_commands() {
        dispatcher.dispatch(command);
    }

    // Terminal setup
    let mut stdout = io::stdout();
    enable_raw_mode()?;
    let _guard = TerminalGuard;
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut events = EventStream::new();
    let mut tick = tokio::time::interval(TICK_RATE);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !app.should_quit {
        terminal.draw(|f| draw_ui(f, &mut app))?;

        let event = tokio::select! {
            maybe_event = events.next() => match maybe_event {
                Some(Ok(CEvent::Key(key))) if key.kind == KeyEventKind::Press => AppEvent::Key(key),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
            Some(event) = rx.recv() => {
                debug!("background result: {}", event_name(&event));
                event
            }
            _ = tick.tick() => AppEvent::Tick,
        };

        for command in app.update(event) {
            dispatcher.dispatch(command);
        }
    }

    info!("Exiting tkz");
    Ok(())
}

fn event_name(event: &AppEvent) -> &'static str {
    match event {
        AppEvent::Key(_) => "key",
        AppEvent::Tick => "tick",
        AppEvent::StatusChecked { .. } => "status checked",
        AppEvent::Unlocked(_) => "unlocked",
        AppEvent::ItemsLoaded(_) => "items loaded",
        AppEvent::TokenFetched { .. } => "token fetched",
        AppEvent::Copied { .. } => "copied",
        AppEvent::ClientsSaved(_) => "clients saved",
    }
}
