//! Non-blocking socket I/O and event dispatch.
//!
//! Three layers, bottom up:
//!
//! - [`socket`] — owned non-blocking fds, socket options, and the
//!   [`Pollable`] contract a reactor drives.
//! - [`stream`] — buffered bidirectional byte streams that feed a
//!   [`SocketHandler`] on readiness.
//! - [`poll`] — the per-document reactor: one loop thread, dynamic socket
//!   membership, external wake-ups, deferred callbacks.
//!
//! Typical wiring: an acceptor wraps each new connection in a
//! [`StreamSocket`] with a protocol handler and hands it to
//! [`SocketPoll::insert`]; from then on everything the handler sees runs on
//! that poll's loop thread.

pub mod poll;
pub mod socket;
pub mod stream;

pub use poll::{SocketPoll, DEFAULT_POLL_TIMEOUT};
pub use socket::{HandleResult, Pollable, Socket};
pub use stream::{SocketHandler, StreamSocket};
