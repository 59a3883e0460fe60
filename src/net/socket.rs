//! Non-blocking socket ownership, options, and the poll dispatch contract.
//!
//! [`Socket`] owns a file descriptor for its whole lifetime; dropping it
//! closes the fd. Everything layered on top observes non-blocking semantics.
//! [`Pollable`] is the contract a socket poll drives: declare interest,
//! optionally shorten the poll deadline, and handle realized events.

// Rust guideline compliant 2026-02

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use std::time::Instant;

/// Outcome of a socket's event dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// Keep polling this socket.
    Continue,
    /// The socket is done; remove it from the poll.
    SocketClosed,
}

/// Contract between a socket and the poll loop driving it.
///
/// `handle_event` runs only on the poll's loop thread; the other methods are
/// called during the build phase of each iteration, also on the loop thread.
pub trait Pollable: Send + Sync {
    /// The raw fd to include in the poll descriptor vector.
    fn fd(&self) -> RawFd;

    /// Bitmask of poll interest (`POLLIN` / `POLLOUT`) for this iteration.
    fn poll_events(&self) -> i16;

    /// Chance to shorten the poll deadline; never lengthen it.
    fn update_timeout(&self, _deadline: &mut Instant) {}

    /// Handle the realized event mask for this socket.
    fn handle_event(&self, now: Instant, revents: i16) -> HandleResult;

    /// Best-effort shutdown of both directions.
    fn shutdown(&self) {}

    /// Record which thread owns event dispatch for this socket.
    fn set_thread_owner(&self, _owner: ThreadId) {}
}

/// An owned non-blocking TCP socket with its options.
///
/// The fd is valid from construction until drop, which closes it.
pub struct Socket {
    fd: OwnedFd,
    /// Thread expected to run event dispatch. Consulted by the immediate
    /// flush path in `send`, asserted (debug builds only) elsewhere.
    owner: Mutex<Option<ThreadId>>,
}

impl Socket {
    /// Create a fresh non-blocking TCP socket with `TCP_NODELAY` set.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the `socket(2)` call fails.
    pub fn new() -> io::Result<Socket> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let socket = Socket::wrap(unsafe { OwnedFd::from_raw_fd(fd) });
        socket.set_no_delay(true);
        Ok(socket)
    }

    /// Wrap an fd produced elsewhere (typically `accept(2)`), forcing
    /// non-blocking mode and `TCP_NODELAY`.
    pub fn from_fd(fd: OwnedFd) -> Socket {
        let socket = Socket::wrap(fd);
        if !socket.set_nonblocking() {
            log::warn!(
                "socket #{}: failed to set non-blocking: {}",
                socket.raw_fd(),
                io::Error::last_os_error()
            );
        }
        socket.set_no_delay(true);
        socket
    }

    fn wrap(fd: OwnedFd) -> Socket {
        Socket {
            fd,
            owner: Mutex::new(Some(thread::current().id())),
        }
    }

    /// The OS file descriptor.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Half-close both directions, best-effort.
    pub fn shutdown(&self) {
        let rc = unsafe { libc::shutdown(self.raw_fd(), libc::SHUT_RDWR) };
        if rc != 0 {
            log::debug!(
                "socket #{}: shutdown: {}",
                self.raw_fd(),
                io::Error::last_os_error()
            );
        }
    }

    /// Toggle `TCP_NODELAY` to manage latency around packet aggregation.
    /// Returns true on success.
    pub fn set_no_delay(&self, no_delay: bool) -> bool {
        self.setsockopt_int(libc::IPPROTO_TCP, libc::TCP_NODELAY, i32::from(no_delay))
    }

    /// Set the kernel send buffer size in bytes. Must be called before
    /// accept/connect; the kernel doubles the value for bookkeeping, so
    /// [`Socket::send_buffer_size`] reports the larger figure afterwards.
    /// Returns true on success.
    pub fn set_send_buffer_size(&self, size: usize) -> bool {
        self.setsockopt_int(libc::SOL_SOCKET, libc::SO_SNDBUF, size as i32)
    }

    /// The actual kernel send buffer size, if it can be read.
    pub fn send_buffer_size(&self) -> Option<usize> {
        self.getsockopt_int(libc::SOL_SOCKET, libc::SO_SNDBUF)
            .map(|size| size as usize)
    }

    /// Set the kernel receive buffer size in bytes; same doubling and
    /// before-accept/connect caveats as the send buffer. Returns true on
    /// success.
    pub fn set_recv_buffer_size(&self, size: usize) -> bool {
        self.setsockopt_int(libc::SOL_SOCKET, libc::SO_RCVBUF, size as i32)
    }

    /// The actual kernel receive buffer size, if it can be read.
    pub fn recv_buffer_size(&self) -> Option<usize> {
        self.getsockopt_int(libc::SOL_SOCKET, libc::SO_RCVBUF)
            .map(|size| size as usize)
    }

    /// Read and clear the pending socket error, logging it when present.
    pub fn take_error(&self) -> Option<io::Error> {
        match self.getsockopt_int(libc::SOL_SOCKET, libc::SO_ERROR) {
            Some(0) => None,
            Some(errno) => {
                let err = io::Error::from_raw_os_error(errno);
                log::warn!("socket #{}: pending error: {err}", self.raw_fd());
                Some(err)
            }
            None => Some(io::Error::last_os_error()),
        }
    }

    /// Apply configured socket options.
    pub fn apply_config(&self, config: &crate::config::Config) {
        if !self.set_no_delay(config.no_delay) {
            log::warn!("socket #{}: failed to set TCP_NODELAY", self.raw_fd());
        }
        if let Some(size) = config.send_buffer_size {
            if !self.set_send_buffer_size(size) {
                log::warn!("socket #{}: failed to set send buffer to {size}", self.raw_fd());
            }
        }
        if let Some(size) = config.recv_buffer_size {
            if !self.set_recv_buffer_size(size) {
                log::warn!("socket #{}: failed to set recv buffer to {size}", self.raw_fd());
            }
        }
    }

    /// Bind this socket's dispatch to `owner`.
    pub fn set_thread_owner(&self, owner: ThreadId) {
        *self.owner.lock().unwrap() = Some(owner);
    }

    /// Whether the calling thread is the one dispatch is bound to.
    pub fn is_owner_thread(&self) -> bool {
        self.owner
            .lock()
            .unwrap()
            .is_none_or(|owner| owner == thread::current().id())
    }

    fn set_nonblocking(&self) -> bool {
        let fd = self.raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return false;
        }
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == 0 }
    }

    fn setsockopt_int(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> bool {
        let rc = unsafe {
            libc::setsockopt(
                self.raw_fd(),
                level,
                name,
                std::ptr::addr_of!(value).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        rc == 0
    }

    fn getsockopt_int(&self, level: libc::c_int, name: libc::c_int) -> Option<libc::c_int> {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.raw_fd(),
                level,
                name,
                std::ptr::addr_of_mut!(value).cast(),
                &mut len,
            )
        };
        (rc == 0).then_some(value)
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("fd", &self.raw_fd()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_socket_is_valid() {
        let socket = Socket::new().unwrap();
        assert!(socket.raw_fd() >= 0);
    }

    #[test]
    fn test_no_delay_toggles() {
        let socket = Socket::new().unwrap();
        assert!(socket.set_no_delay(false));
        assert!(socket.set_no_delay(true));
    }

    #[test]
    fn test_buffer_sizes_round_trip_doubled() {
        let socket = Socket::new().unwrap();
        assert!(socket.set_send_buffer_size(16 * 1024));
        assert!(socket.set_recv_buffer_size(16 * 1024));

        // The kernel doubles the requested size for its own bookkeeping.
        assert!(socket.send_buffer_size().unwrap() >= 16 * 1024);
        assert!(socket.recv_buffer_size().unwrap() >= 16 * 1024);
    }

    #[test]
    fn test_fresh_socket_has_no_pending_error() {
        let socket = Socket::new().unwrap();
        assert!(socket.take_error().is_none());
    }

    #[test]
    fn test_apply_config_sets_options() {
        let socket = Socket::new().unwrap();
        let config = crate::config::Config {
            no_delay: false,
            send_buffer_size: Some(32 * 1024),
            recv_buffer_size: Some(32 * 1024),
            ..crate::config::Config::default()
        };
        socket.apply_config(&config);
        assert!(socket.send_buffer_size().unwrap() >= 32 * 1024);
        assert!(socket.recv_buffer_size().unwrap() >= 32 * 1024);
    }

    #[test]
    fn test_owner_thread_tracking() {
        let socket = Socket::new().unwrap();
        assert!(socket.is_owner_thread());

        let id = std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap();
        socket.set_thread_owner(id);
        assert!(!socket.is_owner_thread());
    }
}
