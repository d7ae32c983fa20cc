//! Streaming sync engine for chamber-sync.
//!
//! This crate keeps a local transcript in step with an agent server's event
//! stream. It owns the connection lifecycle, interprets server events into
//! store writes, batches token updates per display frame, tracks the
//! streaming phase of every message, and drives autoscroll decisions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │   Transport (SSE/bridge) │        │   SyncHandle (host, UI)  │
//! └──────────────────────────┘        └──────────────────────────┘
//!              │ (subscription id, message)       │ control
//!              ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SyncRuntime                          │
//! │  ┌──────────────┐ ┌──────────────┐ ┌─────────────────────┐  │
//! │  │ Connection   │ │ Event        │ │ Timers              │  │
//! │  │ Manager      │ │ Interpreter  │ │ (reconnect, stale,  │  │
//! │  │              │ │  + queue     │ │  frame, refresh)    │  │
//! │  │              │ │  + tracker   │ │                     │  │
//! │  └──────────────┘ └──────────────┘ └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!        │ status             │ writes             │ notifications
//!        ▼                    ▼                    ▼
//!   ┌──────────┐        ┌──────────┐        ┌──────────────┐
//!   │StatusSink│        │  Store   │        │ Views /      │
//!   └──────────┘        └──────────┘        │ Autoscroll   │
//!                                           └──────────────┘
//! ```
//!
//! The state machines are synchronous. [`ConnectionManager`] answers inputs
//! with [`ConnectionCommand`]s, and every component arms deadlines in a shared
//! [`Timers`] table; only [`SyncRuntime`] touches the network and the clock.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use chamber_sync_engine::{EngineConfig, RuntimeDeps, SyncRuntime, WatchStatusSink};
//! use chamber_sync_store::{MemoryReadCursors, MemoryStore};
//! # use chamber_sync_engine::Transport;
//! # use chamber_sync_store::SessionSource;
//!
//! # async fn example(
//! #     transport: Arc<dyn Transport>,
//! #     source: Arc<dyn SessionSource>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let (status, mut status_rx) = WatchStatusSink::new();
//!
//! let deps = RuntimeDeps {
//!     transport,
//!     source,
//!     store: store.clone(),
//!     permissions: store,
//!     cursors: Arc::new(MemoryReadCursors::new()),
//!     status: Arc::new(status),
//! };
//! let (handle, task) = SyncRuntime::spawn(deps, &EngineConfig::default());
//! handle.start()?;
//!
//! status_rx.changed().await?;
//! println!("status: {}", status_rx.borrow().status);
//!
//! handle.shutdown();
//! task.await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod autoscroll;
pub mod bounded;
pub mod config;
pub mod connection;
pub mod error;
pub mod interpreter;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod status;
pub mod tracker;
pub mod transport;

pub use autoscroll::{
    AutoscrollEngine, ContentMutation, ScrollBehavior, ScrollHost, ScrollMetrics, ScrollState,
    ScrollThresholds, UserScrollInput,
};
pub use bounded::BoundedIdSet;
pub use config::EngineConfig;
pub use connection::{backoff_delay, ConnectionCommand, ConnectionManager, HostSignal, HostState};
pub use error::{EngineError, Result, TransportError};
pub use interpreter::{Collaborators, EventInterpreter, ViewNotification};
pub use queue::{BatchedUpdateQueue, FlushBatch};
pub use runtime::{RuntimeDeps, SyncHandle, SyncRuntime};
pub use scheduler::{TimerKind, Timers};
pub use status::{ConnectionStatus, StatusSink, StatusUpdate, WatchStatusSink};
pub use tracker::{LifecycleMap, LifecycleTracker, MessageLifecycle, StreamPhase};
pub use transport::{
    Subscription, SubscriptionId, TaskSubscription, Transport, TransportKind, TransportMessage,
    TransportSink,
};
