//! Buffered bidirectional byte stream over a non-blocking socket.
//!
//! A [`StreamSocket`] pairs a [`Socket`] with exactly one [`SocketHandler`]
//! and two byte buffers:
//!
//! ```text
//! poll loop ──readable──► read_incoming_data ──► input buffer
//!                                                    │ drained by
//!                                                    ▼
//!                                          handler.handle_incoming_message
//!                                                    │ replies via
//!                                                    ▼
//! any thread ──send()──► output buffer ──loop drains──► write(2)
//! ```
//!
//! The handler gets a `Weak` back-reference at connect time, so dropping the
//! stream socket drops the handler deterministically with no ownership
//! cycle. `on_connect` fires exactly once before any other callback and
//! `on_disconnect` exactly once after all of them.

// Rust guideline compliant 2026-02

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::thread::ThreadId;
use std::time::Instant;

use super::socket::{HandleResult, Pollable, Socket};

/// Read chunk size. SSL peers decode 16 KiB records, so larger reads would
/// not help a handler stacked on top.
const READ_CHUNK: usize = 16 * 1024;

/// Capability driven by a [`StreamSocket`] on its poll loop thread.
///
/// Handlers must not block; work that has to wait is queued and picked up on
/// a later callback.
pub trait SocketHandler: Send {
    /// Receives a non-owning handle to the stream socket. Called exactly
    /// once, before any other callback.
    fn on_connect(&mut self, socket: Weak<StreamSocket>);

    /// Called while the input buffer is non-empty and still shrinking.
    /// Consume at least one byte, or return without consuming to wait for
    /// more data.
    fn handle_incoming_message(&mut self);

    /// Whether the handler has data it wants to write. Consulted every poll
    /// iteration to compute write interest; must be cheap and idempotent.
    fn has_queued_writes(&self) -> bool {
        false
    }

    /// Called when the socket is writable and the output buffer is empty;
    /// append outgoing bytes via [`StreamSocket::send`].
    fn perform_writes(&mut self) {}

    /// Called exactly once when the peer is gone; no callbacks follow.
    fn on_disconnect(&mut self) {}
}

/// A non-blocking, buffered, data streaming socket.
pub struct StreamSocket {
    socket: Socket,
    handler: Mutex<Box<dyn SocketHandler>>,
    /// Filled by the loop thread, drained by the handler through
    /// [`StreamSocket::input`].
    in_buffer: Mutex<Vec<u8>>,
    /// The mutex is the per-socket write lock; `send` appends under it from
    /// any thread, the loop thread drains under it.
    out_buffer: Mutex<Vec<u8>>,
    /// Monotonic: flips false → true once, when disconnect fires.
    closed: AtomicBool,
}

impl StreamSocket {
    /// Wrap `socket` and `handler` into a polled stream socket.
    ///
    /// Fires `on_connect` with a weak handle before returning, so the
    /// handler can stash it for later sends.
    pub fn create(socket: Socket, handler: Box<dyn SocketHandler>) -> Arc<StreamSocket> {
        log::debug!("stream socket #{} created", socket.raw_fd());
        let stream = Arc::new(StreamSocket {
            socket,
            handler: Mutex::new(handler),
            in_buffer: Mutex::new(Vec::new()),
            out_buffer: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        stream.lock_handler().on_connect(Arc::downgrade(&stream));
        stream
    }

    /// The wrapped socket, for option twiddling.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Whether disconnect has already fired.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffered input, for the handler to inspect and drain.
    pub fn input(&self) -> MutexGuard<'_, Vec<u8>> {
        lock_ignore_poison(&self.in_buffer)
    }

    /// Queue `data` for the peer.
    ///
    /// With `flush` set, a caller on the loop thread drains the buffer
    /// immediately; from any other thread the bytes wait for the next poll
    /// iteration to observe the non-empty buffer and declare write interest
    /// (nudge the poll with a wakeup if latency matters).
    pub fn send(&self, data: &[u8], flush: bool) {
        if data.is_empty() {
            return;
        }
        let mut out = lock_ignore_poison(&self.out_buffer);
        out.extend_from_slice(data);
        if flush && self.socket.is_owner_thread() {
            // A broken pipe here surfaces as POLLERR on the next iteration.
            let _ = write_outgoing_data(&self.socket, &mut out);
        }
    }

    /// Queue a pre-formatted HTTP response.
    ///
    /// The socket stays non-blocking: the response is buffered and flushed
    /// like any other write, with partial writes completed by later poll
    /// iterations.
    pub fn send_http_response(&self, response: &[u8]) {
        self.send(response, true);
    }

    /// Read everything currently available into the input buffer.
    ///
    /// Returns false iff the peer closed cleanly (read returned 0).
    /// Interrupted reads retry; other errors leave the remainder to the
    /// next poll iteration, which sees them as events.
    pub fn read_incoming_data(&self) -> bool {
        debug_assert!(self.socket.is_owner_thread());
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = unsafe {
                libc::read(
                    self.socket.raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if n > 0 {
                lock_ignore_poison(&self.in_buffer).extend_from_slice(&buf[..n as usize]);
                if (n as usize) < buf.len() {
                    return true;
                }
                continue;
            }
            if n == 0 {
                return false;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return true,
                _ => {
                    log::debug!("socket #{}: read: {err}", self.socket.raw_fd());
                    return true;
                }
            }
        }
    }

    fn fire_disconnect_once(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("socket #{}: disconnected", self.socket.raw_fd());
            self.lock_handler().on_disconnect();
        }
    }

    /// A handler panic is caught at the poll dispatch site and poisons this
    /// mutex; recover the lock so disconnect teardown still runs.
    fn lock_handler(&self) -> MutexGuard<'_, Box<dyn SocketHandler>> {
        lock_ignore_poison(&self.handler)
    }
}

impl Pollable for StreamSocket {
    fn fd(&self) -> std::os::fd::RawFd {
        self.socket.raw_fd()
    }

    fn poll_events(&self) -> i16 {
        let queued = !lock_ignore_poison(&self.out_buffer).is_empty()
            || self.lock_handler().has_queued_writes();
        if queued {
            libc::POLLIN | libc::POLLOUT
        } else {
            libc::POLLIN
        }
    }

    fn handle_event(&self, _now: Instant, revents: i16) -> HandleResult {
        debug_assert!(self.socket.is_owner_thread());

        let mut closed = revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0;
        closed = !self.read_incoming_data() || closed;

        log::trace!(
            "socket #{}: {} bytes buffered, close? {closed}",
            self.socket.raw_fd(),
            self.input().len()
        );

        // Let the handler consume as many framed messages as it can; stop
        // once a pass leaves the buffer size unchanged (partial frame).
        let mut old_size = 0;
        loop {
            let size = self.input().len();
            if size == 0 || size == old_size {
                break;
            }
            old_size = size;
            self.lock_handler().handle_incoming_message();
        }

        let writable = revents & libc::POLLOUT != 0;
        if writable && lock_ignore_poison(&self.out_buffer).is_empty() {
            self.lock_handler().perform_writes();
        }

        if writable || !lock_ignore_poison(&self.out_buffer).is_empty() {
            // The buffer may have been flushed while another thread held the
            // write lock; skip rather than wait.
            let guard = match self.out_buffer.try_lock() {
                Ok(guard) => Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => None,
            };
            if let Some(mut out) = guard {
                if !out.is_empty() && write_outgoing_data(&self.socket, &mut out) {
                    closed = true;
                }
            }
        }

        if closed {
            self.fire_disconnect_once();
        }

        if self.is_closed() {
            HandleResult::SocketClosed
        } else {
            HandleResult::Continue
        }
    }

    fn shutdown(&self) {
        self.socket.shutdown();
    }

    fn set_thread_owner(&self, owner: ThreadId) {
        self.socket.set_thread_owner(owner);
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        log::debug!("stream socket #{} dropped", self.socket.raw_fd());
        self.fire_disconnect_once();
    }
}

/// Drain `out` with repeated writes until empty or the socket stops taking
/// data. Partial writes trim the front; interrupted writes retry; a broken
/// pipe is reported so the caller can fold it into the close decision.
fn write_outgoing_data(socket: &Socket, out: &mut Vec<u8>) -> bool {
    let mut saw_epipe = false;
    while !out.is_empty() {
        let n = unsafe { libc::write(socket.raw_fd(), out.as_ptr().cast(), out.len()) };
        if n > 0 {
            log::trace!("socket #{}: wrote {n} bytes", socket.raw_fd());
            out.drain(..n as usize);
            continue;
        }
        if n == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        if err.raw_os_error() == Some(libc::EPIPE) {
            saw_epipe = true;
        }
        if err.kind() != io::ErrorKind::WouldBlock {
            log::debug!("socket #{}: write: {err}", socket.raw_fd());
        }
        break;
    }
    saw_epipe
}

/// Mutex poisoning here only ever comes from a caught handler panic; the
/// protected buffers stay structurally valid, so keep going.
fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
