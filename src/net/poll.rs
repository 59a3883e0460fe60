//! Single-threaded socket reactor with thread-safe membership changes.
//!
//! Each [`SocketPoll`] owns one dedicated loop thread blocking in `poll(2)`
//! over its active sockets plus a wake pipe. Every cross-thread intent is
//! staged and realized by the loop itself:
//!
//! ```text
//! any thread                         loop thread
//! insert/release/add_callback ──┐    ┌─ drain releases, build pollfds
//!        (stage under mutex)    │    │  poll(2) until ready or deadline
//! write 1 byte to wake pipe ────┼──► │  dispatch revents (reverse order)
//!                               │    │  wake? splice inserts, run callbacks
//! stop() ───────────────────────┘    └─ loop while !stop
//! ```
//!
//! Staging plus the wake byte turns all membership changes into a
//! single-threaded drain: no iterator is ever invalidated mid-dispatch, and
//! handlers only ever run on the loop thread.
//!
//! `poll(2)` is level-triggered and cheap to reconfigure each spin, which
//! suits a per-document poll of at most a few hundred sockets far better
//! than paying epoll's registration churn.

// Rust guideline compliant 2026-02

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::socket::{HandleResult, Pollable};

/// Default ceiling for one poll iteration.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Deferred work posted from any thread, run on the loop thread.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Cross-thread intents, drained by the loop on each wake.
#[derive(Default)]
struct Staged {
    insert: Vec<Arc<dyn Pollable>>,
    release: Vec<Arc<dyn Pollable>>,
    callbacks: Vec<Callback>,
}

struct PollShared {
    /// Debug name used for logging and the thread name.
    name: String,
    staged: Mutex<Staged>,
    /// Monotonic: once set, the loop finishes its iteration and exits.
    stop: AtomicBool,
    /// Write end of the wake pipe; single-byte writes are safe from any
    /// thread.
    wake_write: OwnedFd,
    /// Sockets currently polled, maintained by the loop for diagnostics.
    active_count: AtomicUsize,
    wakeup_hook: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl PollShared {
    /// Interrupt the poll wait. A full pipe means a wake is already
    /// pending, which is all a wake needs to guarantee.
    fn wakeup(&self) {
        loop {
            let rc =
                unsafe { libc::write(self.wake_write.as_raw_fd(), b"w".as_ptr().cast(), 1) };
            if rc >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return,
                _ => {
                    log::warn!("[{}] wakeup write failed: {err}", self.name);
                    return;
                }
            }
        }
    }
}

/// A reactor owning a dynamic set of sockets and the thread polling them.
///
/// Dropping the poll stops the loop and joins the thread; sockets still
/// active are dropped on the loop thread, firing their disconnect teardown.
pub struct SocketPoll {
    shared: Arc<PollShared>,
    thread: Option<JoinHandle<()>>,
    loop_thread: ThreadId,
}

impl SocketPoll {
    /// Spawn a poll loop with the default iteration timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the wake pipe or the loop thread cannot be
    /// created.
    pub fn new(name: &str) -> Result<SocketPoll> {
        Self::with_timeout(name, DEFAULT_POLL_TIMEOUT)
    }

    /// Spawn a poll loop using the configured iteration timeout.
    pub fn with_config(name: &str, config: &crate::config::Config) -> Result<SocketPoll> {
        Self::with_timeout(name, config.poll_timeout())
    }

    fn with_timeout(name: &str, timeout: Duration) -> Result<SocketPoll> {
        let (wake_read, wake_write) =
            wake_pipe().with_context(|| format!("create wake pipe for poll [{name}]"))?;
        let shared = Arc::new(PollShared {
            name: name.to_owned(),
            staged: Mutex::new(Staged::default()),
            stop: AtomicBool::new(false),
            wake_write,
            active_count: AtomicUsize::new(0),
            wakeup_hook: Mutex::new(None),
        });

        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("poll/{name}"))
            .spawn(move || polling_thread(&loop_shared, &wake_read, timeout))
            .with_context(|| format!("spawn polling thread for [{name}]"))?;
        let loop_thread = thread.thread().id();

        Ok(SocketPoll {
            shared,
            thread: Some(thread),
            loop_thread,
        })
    }

    /// Stage a socket for polling and wake the loop.
    ///
    /// The socket joins the active set, bound to the loop thread, no later
    /// than the next wake drain; events are dispatched from then on.
    pub fn insert(&self, socket: Arc<dyn Pollable>) {
        socket.set_thread_owner(self.loop_thread);
        log::debug!("[{}] queuing socket #{} for insert", self.shared.name, socket.fd());
        self.shared.staged.lock().unwrap().insert.push(socket);
        self.shared.wakeup();
    }

    /// Stage a socket for removal and wake the loop.
    ///
    /// Removal takes effect at the next build or dispatch step; an in-flight
    /// event on the socket may still complete once.
    pub fn release(&self, socket: &Arc<dyn Pollable>) {
        log::debug!("[{}] queuing socket #{} for release", self.shared.name, socket.fd());
        self.shared
            .staged
            .lock()
            .unwrap()
            .release
            .push(Arc::clone(socket));
        self.shared.wakeup();
    }

    /// Post a callback to run on the loop thread after the next wake.
    ///
    /// Callbacks run in posting order, never concurrently with any socket's
    /// event dispatch.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared
            .staged
            .lock()
            .unwrap()
            .callbacks
            .push(Box::new(callback));
        self.shared.wakeup();
    }

    /// Install the hook run at the end of each wake drain.
    pub fn set_wakeup_hook<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.shared.wakeup_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Ask the loop to finish its current iteration and exit.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wakeup();
    }

    /// Interrupt the current poll wait.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Whether the calling thread is this poll's loop thread.
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.loop_thread
    }

    /// Number of sockets in the active set, as of the last iteration.
    pub fn active_count(&self) -> usize {
        self.shared.active_count.load(Ordering::Relaxed)
    }

    /// The poll's diagnostic name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl Drop for SocketPoll {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn polling_thread(shared: &PollShared, wake_read: &OwnedFd, timeout: Duration) {
    log::info!("starting polling thread [{}]", shared.name);
    let mut active: Vec<Arc<dyn Pollable>> = Vec::new();
    let mut pollfds: Vec<libc::pollfd> = Vec::new();

    while !shared.stop.load(Ordering::Acquire) {
        poll_once(shared, wake_read, &mut active, &mut pollfds, timeout);
    }

    log::info!(
        "polling thread [{}] exiting, dropping {} sockets",
        shared.name,
        active.len()
    );
}

/// One reactor iteration: build, wait, dispatch, wake.
fn poll_once(
    shared: &PollShared,
    wake_read: &OwnedFd,
    active: &mut Vec<Arc<dyn Pollable>>,
    pollfds: &mut Vec<libc::pollfd>,
    timeout: Duration,
) {
    let mut deadline = Instant::now() + timeout;

    // Build: realize staged releases, then declare this spin's interest.
    {
        let mut staged = shared.staged.lock().unwrap();
        for victim in staged.release.drain(..) {
            if let Some(pos) = active.iter().position(|s| Arc::ptr_eq(s, &victim)) {
                log::debug!(
                    "[{}] releasing socket #{} (of {})",
                    shared.name,
                    victim.fd(),
                    active.len()
                );
                active.remove(pos);
            }
        }
    }

    pollfds.clear();
    for socket in active.iter() {
        pollfds.push(libc::pollfd {
            fd: socket.fd(),
            events: socket.poll_events(),
            revents: 0,
        });
        socket.update_timeout(&mut deadline);
    }
    // The wake pipe is always the last descriptor.
    pollfds.push(libc::pollfd {
        fd: wake_read.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    });
    shared.active_count.store(active.len(), Ordering::Relaxed);

    // Wait: block until readiness or deadline, resuming interrupted waits
    // with the remaining time.
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe {
            libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
        };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            log::error!("[{}] poll failed: {err}", shared.name);
            break;
        }
    }

    // Dispatch, in reverse index order so in-place removal is safe.
    let now = Instant::now();
    for i in (0..active.len()).rev() {
        let released = {
            let mut staged = shared.staged.lock().unwrap();
            match staged.release.iter().position(|s| Arc::ptr_eq(s, &active[i])) {
                Some(pos) => {
                    staged.release.remove(pos);
                    true
                }
                None => false,
            }
        };
        if released {
            log::debug!(
                "[{}] releasing socket #{} (of {}) during dispatch",
                shared.name,
                active[i].fd(),
                active.len()
            );
            active.remove(i);
            continue;
        }

        let revents = pollfds[i].revents;
        if revents == 0 {
            continue;
        }

        let socket = Arc::clone(&active[i]);
        let result = catch_unwind(AssertUnwindSafe(|| socket.handle_event(now, revents)))
            .unwrap_or_else(|_| {
                log::error!(
                    "[{}] handler panicked for socket #{}; treating as closed",
                    shared.name,
                    socket.fd()
                );
                HandleResult::SocketClosed
            });

        if result == HandleResult::SocketClosed {
            log::debug!(
                "[{}] removing socket #{} (of {})",
                shared.name,
                socket.fd(),
                active.len()
            );
            active.remove(i);
        }
    }

    // Wake: drain the pipe, splice staged inserts, run posted callbacks.
    let woken = pollfds.last().is_some_and(|p| p.revents != 0);
    if woken {
        let mut drain = [0u8; 64];
        let _ = unsafe {
            libc::read(wake_read.as_raw_fd(), drain.as_mut_ptr().cast(), drain.len())
        };

        let callbacks = {
            let mut staged = shared.staged.lock().unwrap();
            active.append(&mut staged.insert);
            std::mem::take(&mut staged.callbacks)
        };
        for callback in callbacks {
            callback();
        }
        if let Some(hook) = shared.wakeup_hook.lock().unwrap().as_mut() {
            hook();
        }
    }

    shared.active_count.store(active.len(), Ordering::Relaxed);
}

/// A non-blocking, close-on-exec pipe: (read end, write end).
fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    for fd in [&read, &write] {
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        if flags < 0
            || unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } != 0
        {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        if fd_flags < 0
            || unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) }
                != 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((read, write))
}
