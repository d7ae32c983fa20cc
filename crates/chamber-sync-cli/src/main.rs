//! Chamber tail - follow a live agent session from the terminal.
//!
//! This is the entry point for the `chamber-tail` binary. It wires the sync
//! engine to the server's HTTP API and event stream, then prints the
//! transcript as it streams. Connection status goes to stderr so stdout
//! stays a clean transcript.
//!
//! # Bridge mode
//!
//! With `--bridge` the events come through an in-process relay on the
//! server's `/global/event` stream instead of `/event`. The relay emits
//! explicit completion and session activity signals, and the engine runs
//! with native-transport semantics.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chamber_sync_cli::{
    status_line, ApiClient, BridgeRelay, BridgeTransport, FileReadCursors, Printer, SseTransport,
};
use chamber_sync_core::{SessionId, SessionInfo};
use chamber_sync_engine::{EngineConfig, RuntimeDeps, SyncRuntime, Transport, WatchStatusSink};
use chamber_sync_store::{MemoryReadCursors, MemoryStore, ReadCursorSink};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Chamber tail - follow a live agent session from the terminal.
#[derive(Parser, Debug)]
#[command(name = "chamber-tail")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server URL.
    #[arg(long, env = "CHAMBER_SERVER", default_value = "http://localhost:4096")]
    server: String,

    /// Session to follow. Defaults to the most recently updated top-level session.
    #[arg(long)]
    session: Option<String>,

    /// Working directory to scope requests and events to.
    #[arg(long, env = "CHAMBER_DIRECTORY")]
    directory: Option<String>,

    /// Receive events through the bridge relay on /global/event.
    #[arg(long, default_value = "false")]
    bridge: bool,

    /// JSON file with engine settings.
    #[arg(long, env = "CHAMBER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the display frame interval, in milliseconds.
    #[arg(long)]
    frame_ms: Option<u64>,

    /// Keep at most this many messages per session in memory.
    #[arg(long)]
    window: Option<usize>,

    /// Persist read cursors to this JSON file.
    #[arg(long)]
    read_cursors: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, default_value = "false")]
    debug: bool,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

/// The most recently updated session that is not a fork.
fn latest_session(sessions: &[SessionInfo]) -> Option<SessionId> {
    sessions
        .iter()
        .filter(|s| s.parent_id.is_none())
        .max_by_key(|s| s.time.updated)
        .map(|s| s.id.clone())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse arguments
    let args = Args::parse();

    // Initialize logging
    let default_filter = if args.debug {
        "warn,chamber_sync_engine=debug,chamber_sync_store=debug,chamber_sync_cli=debug,chamber_tail=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(io::stderr)
        .init();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(frame_ms) = args.frame_ms {
        config.frame_interval_ms = frame_ms;
    }

    // Create client
    let api = ApiClient::new(&args.server);
    api.set_directory(args.directory.clone());

    let session_id = match args.session.as_deref() {
        Some(id) => SessionId::new(id).context("invalid session id")?,
        None => {
            let sessions = api.list_sessions().await.context("failed to list sessions")?;
            latest_session(&sessions).context("server has no sessions")?
        }
    };

    info!(
        server = %args.server,
        session_id = %session_id,
        directory = ?args.directory,
        bridge = args.bridge,
        "following session"
    );

    let store = Arc::new(match args.window {
        Some(window) => MemoryStore::with_window(window),
        None => MemoryStore::new(),
    });
    let cursors: Arc<dyn ReadCursorSink> = match &args.read_cursors {
        Some(path) => Arc::new(FileReadCursors::open(path)?),
        None => Arc::new(MemoryReadCursors::new()),
    };

    let relay = args.bridge.then(|| BridgeRelay::start(api.clone()));
    let transport: Arc<dyn Transport> = match &relay {
        Some(relay) => Arc::new(BridgeTransport::new(Arc::clone(relay))),
        None => Arc::new(SseTransport::new(api.clone())),
    };

    let (status, mut status_rx) = WatchStatusSink::new();
    let deps = RuntimeDeps {
        transport,
        source: Arc::new(api),
        store: store.clone(),
        permissions: store.clone(),
        cursors,
        status: Arc::new(status),
    };

    let (handle, task) = SyncRuntime::spawn(deps, &config);
    let mut notifications = handle.notifications();
    handle.set_active_session(Some(session_id))?;
    handle.start()?;

    let mut printer = Printer::new(io::stdout().lock(), store.clone(), store);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                eprintln!("{}", status_line(&status_rx.borrow_and_update()));
            }
            notification = notifications.recv() => match notification {
                Ok(notification) => printer.handle(&notification)?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "output fell behind; some updates were coalesced");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown();
    task.await.context("sync runtime panicked")?;
    if let Some(relay) = relay {
        relay.stop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, updated: u64, parent: Option<&str>) -> SessionInfo {
        let mut info = SessionInfo::new(SessionId::new(id).unwrap());
        info.time.updated = updated;
        info.parent_id = parent.map(|p| SessionId::new(p).unwrap());
        info
    }

    #[test]
    fn picks_latest_top_level_session() {
        let sessions = vec![
            session("ses_a", 10, None),
            session("ses_b", 30, Some("ses_a")),
            session("ses_c", 20, None),
        ];
        assert_eq!(latest_session(&sessions).unwrap().as_str(), "ses_c");
        assert!(latest_session(&[]).is_none());
    }

    #[test]
    fn missing_config_path_uses_defaults() {
        assert_eq!(load_config(None).unwrap(), EngineConfig::default());
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"frame_interval_ms": 33, "detect_empty_responses": true}"#)
            .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.frame_interval_ms, 33);
        assert!(config.detect_empty_responses);
        assert_eq!(
            config.staleness_threshold_ms,
            EngineConfig::default().staleness_threshold_ms
        );
    }
}
