//! Terminal and bridge surfaces for chamber-sync.
//!
//! This crate connects the sync engine to a real agent server:
//!
//! - [`client`] - typed REST client; also the engine's [`SessionSource`](chamber_sync_store::SessionSource)
//! - [`sse`] - the `/event` stream as a web transport
//! - [`bridge`] - the desktop bridge relay on `/global/event`, and its native transport
//! - [`cursor`] - read cursors persisted to a JSON file
//! - [`output`] - plain-text transcript printer used by `chamber-tail`
//!
//! # Architecture
//!
//! ```text
//!                 agent server
//!        /event        │        /global/event
//!          │           │              │
//!          ▼           │              ▼
//!   ┌──────────────┐   │      ┌──────────────┐
//!   │ SseTransport │   │      │ BridgeRelay  │──► other subscribers
//!   └──────┬───────┘   │      └──────┬───────┘
//!          │           │             │ BridgeTransport
//!          └───────────┼─────────────┘
//!                      ▼
//!              ┌───────────────┐   REST   ┌───────────┐
//!              │  SyncRuntime  │◄────────►│ ApiClient │
//!              └───────┬───────┘          └───────────┘
//!                      ▼
//!          MemoryStore ──► Printer ──► stdout
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bridge;
pub mod client;
pub mod cursor;
pub mod output;
pub mod sse;

pub use bridge::{BridgeRelay, BridgeTransport, RelayFilter, RelayItem};
pub use client::{ApiClient, ClientError};
pub use cursor::FileReadCursors;
pub use output::{status_line, Printer};
pub use sse::SseTransport;
