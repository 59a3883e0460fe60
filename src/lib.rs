//! Tilehub core — the I/O and dispatch layer of a collaborative document
//! server.
//!
//! Two subsystems make up the core:
//!
//! - **net** — a non-blocking socket reactor: each [`SocketPoll`] runs one
//!   loop thread over a dynamic set of [`StreamSocket`]s, with thread-safe
//!   insertion, release, wake-ups, and deferred callbacks. Protocol
//!   handlers (HTTP, WebSocket, internal RPC) plug in behind the
//!   [`SocketHandler`] trait and always run on the owning loop thread.
//! - **queue** — [`TileQueue`], the per-document message queue feeding the
//!   renderer: FIFO for ordinary traffic, with tile-request deduplication,
//!   cursor-driven prioritization, and `canceltiles` semantics.
//!
//! # Modules
//!
//! - [`net`] - sockets, stream buffering, the poll reactor
//! - [`queue`] - prioritized tile message queue
//! - [`config`] - runtime tunables (file + env overrides)

pub mod config;
pub mod net;
pub mod queue;

// Re-export commonly used types
pub use config::Config;
pub use net::{HandleResult, Pollable, Socket, SocketHandler, SocketPoll, StreamSocket};
pub use queue::{CursorPosition, Payload, TileDesc, TileQueue};
