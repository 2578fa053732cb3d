//! Weft entrypoint: boots one local session over an app directory and
//! bridges it to a JSON-lines transport on stdin/stdout.
//!
//! Each stdin line is one inbound operation (`create`/`update`/`destroy`,
//! plus a development-only `eval`); each stdout line is one outbound record
//! (variable update or object definition). The watchers keep scripts and
//! viewdefs hot while the loop runs.

use std::io::BufRead;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Once;

use anyhow::Result;
use clap::Parser;
use core_session::{Dispatcher, Inbound, SessionOutput};
use core_viewdef::ViewdefManager;
use core_watch::Watcher;
use core_wrap::Registries;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

mod config;

/// Bounded loop channel: the blocking stdin thread parks on `blocking_send`
/// rather than dropping lines.
const EVENT_CHANNEL_CAP: usize = 1024;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "weft", version, about = "Weft UI engine server core")]
struct Args {
    /// App directory containing `scripts/`, `views/`, and optionally
    /// `weft.toml`.
    pub app_dir: PathBuf,
    /// Configuration file path (overrides `<app-dir>/weft.toml`).
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Session id for the local transport loop.
    #[arg(long, default_value = "local")]
    pub session: String,
}

enum Event {
    Line(String),
    Output(SessionOutput),
    Eof,
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    fn configure_logging(&mut self) {
        let file_appender = tracing_appender::rolling::never(".", "weft.log");
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .try_init()
        {
            Ok(_) => {
                self.log_guard = Some(guard);
            }
            Err(_) => {
                // Global subscriber already installed (tests); drop the
                // guard so the writer shuts down.
            }
        }
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                tracing::error!(target: "runtime.panic", ?info, "panic");
                default_panic(info);
            }));
        });
    }
}

struct Engine {
    dispatcher: Arc<Dispatcher>,
    outbound_rx: crossbeam_channel::Receiver<SessionOutput>,
    watchers: Vec<Watcher>,
}

fn build_engine(app_dir: &Path, cfg: &config::Config) -> Result<Engine> {
    let registries = Arc::new(Registries::with_builtins());
    let viewdefs = Arc::new(ViewdefManager::new(cfg.views_dir(app_dir)));
    let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
    let dispatcher = Arc::new(Dispatcher::new(
        registries,
        viewdefs,
        outbound_tx,
        cfg.session.queue_depth,
    ));

    let mut watchers = Vec::new();
    if cfg.watch.enabled {
        let watch_config = core_watch::WatchConfig {
            debounce: cfg.watch.debounce(),
            tick: cfg.watch.tick(),
        };
        let scripts = cfg.scripts_dir(app_dir);
        if scripts.is_dir() {
            let d = Arc::clone(&dispatcher);
            watchers.push(Watcher::spawn(
                scripts,
                watch_config,
                Box::new(move |path: &Path| d.script_file_changed(path)),
            )?);
        }
        let views = cfg.views_dir(app_dir);
        if views.is_dir() {
            let d = Arc::clone(&dispatcher);
            watchers.push(Watcher::spawn(
                views,
                watch_config,
                Box::new(move |path: &Path| d.viewdef_file_changed(path)),
            )?);
        }
    }

    Ok(Engine {
        dispatcher,
        outbound_rx,
        watchers,
    })
}

fn handle_line(dispatcher: &Dispatcher, session: &str, line: &str) {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return;
    }
    let parsed: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(err) => {
            warn!(target: "runtime.transport", %err, "bad_inbound_line");
            emit_error(&format!("invalid JSON: {err}"));
            return;
        }
    };
    // Development transport extra: evaluate script source in the session.
    if parsed.get("op").and_then(|v| v.as_str()) == Some("eval") {
        let source = parsed.get("source").and_then(|v| v.as_str()).unwrap_or("");
        match dispatcher.run_source(session, "eval", source) {
            Ok(shown) => {
                println_record(&serde_json::json!({ "kind": "eval", "value": shown }));
            }
            Err(err) => emit_error(&err.to_string()),
        }
        return;
    }
    match serde_json::from_value::<Inbound>(parsed) {
        Ok(op) => match dispatcher.handle_batch(session, vec![op]) {
            Ok(failures) => {
                for failure in failures {
                    emit_error(&failure.to_string());
                }
            }
            Err(err) => emit_error(&err.to_string()),
        },
        Err(err) => {
            warn!(target: "runtime.transport", %err, "unknown_inbound_op");
            emit_error(&format!("unknown operation: {err}"));
        }
    }
}

fn emit_error(message: &str) {
    println_record(&serde_json::json!({ "kind": "error", "message": message }));
}

fn println_record(value: &serde_json::Value) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{value}");
    let _ = stdout.flush();
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut startup = AppStartup::new();
    startup.configure_logging();
    AppStartup::install_panic_hook();

    let args = Args::parse();
    info!(target: "runtime", app_dir = %args.app_dir.display(), "startup");
    let cfg = config::load_from(&args.app_dir, args.config.clone())?;

    let engine = build_engine(&args.app_dir, &cfg)?;
    engine
        .dispatcher
        .create_session(&args.session, cfg.scripts_dir(&args.app_dir))?;
    let main_path = cfg.main_path(&args.app_dir);
    if main_path.is_file() {
        if let Err(err) = engine.dispatcher.boot_session(&args.session, main_path) {
            error!(target: "runtime", %err, "boot_failed");
        }
    } else {
        warn!(target: "runtime", main = %main_path.display(), "main_script_missing");
    }

    let (event_tx, mut event_rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAP);

    // Blocking stdin reader; EOF ends the loop.
    let stdin_tx = event_tx.clone();
    std::thread::Builder::new()
        .name("weft-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if stdin_tx.blocking_send(Event::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = stdin_tx.blocking_send(Event::Eof);
        })?;

    // Bridge dispatcher output into the loop.
    let outbound_rx = engine.outbound_rx.clone();
    let output_tx = event_tx.clone();
    std::thread::Builder::new()
        .name("weft-outbound".into())
        .spawn(move || {
            for output in outbound_rx.iter() {
                if output_tx.blocking_send(Event::Output(output)).is_err() {
                    return;
                }
            }
        })?;
    drop(event_tx);

    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Line(line) => handle_line(&engine.dispatcher, &args.session, &line),
            Event::Output(output) => {
                for record in output.records {
                    match serde_json::to_value(&record) {
                        Ok(json) => println_record(&json),
                        Err(err) => warn!(target: "runtime.transport", %err, "encode_failed"),
                    }
                }
            }
            Event::Eof => break,
        }
    }

    info!(target: "runtime", "shutdown");
    for watcher in engine.watchers {
        watcher.stop();
    }
    engine.dispatcher.shutdown();
    Ok(())
}
