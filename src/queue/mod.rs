//! Prioritized message queue for tile rendering traffic.
//!
//! Sessions push protocol messages from socket threads; one worker thread
//! per document blocks in [`TileQueue::get`] and feeds the renderer. Most
//! payloads are plain FIFO traffic, but tile requests get three special
//! treatments at insertion time:
//!
//! - **Dedup**: a newer request for the same tile replaces the queued one
//!   in place instead of rendering the same area twice.
//! - **Priority**: a tile overlapping any registered cursor jumps to the
//!   front, so the area the user is editing renders first.
//! - **Cancel**: `canceltiles` purges pending non-preview tile requests and
//!   takes the front slot itself.
//!
//! Payloads are opaque bytes; they are interpreted as UTF-8 text only to
//! apply policy, never validated.

// Rust guideline compliant 2026-02

pub mod tile;

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub use tile::{CursorPosition, TileDesc};

/// An opaque queued message.
pub type Payload = Vec<u8>;

/// A queued payload with its tile descriptor parsed once at insertion.
/// Priority and reprioritization checks reuse the cached parse.
struct Entry {
    payload: Payload,
    tile: Option<TileDesc>,
}

struct Inner {
    queue: VecDeque<Entry>,
    /// Last known cursor rectangle per view. Stale entries only degrade
    /// priority quality, never correctness.
    cursors: HashMap<u32, CursorPosition>,
}

/// Thread-safe ordered message queue with tile dedup and cursor priority.
///
/// All operations take the single internal mutex; [`TileQueue::get`] blocks
/// on a condition variable until a payload is available.
pub struct TileQueue {
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Default for TileQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TileQueue {
    /// Create an empty queue with no registered cursors.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                cursors: HashMap::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Enqueue a payload, applying the tile insertion policy.
    pub fn put<P: Into<Payload>>(&self, payload: P) {
        let payload = payload.into();
        let mut inner = self.inner.lock().unwrap();
        inner.put_locked(payload);
        drop(inner);
        self.cv.notify_one();
    }

    /// Pop the front payload, blocking until one is available.
    pub fn get(&self) -> Payload {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(entry) = inner.queue.pop_front() {
                return entry.payload;
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Pop the front payload, waiting at most `timeout`.
    ///
    /// Returns `None` on timeout; worker threads use this to interleave
    /// shutdown checks with consumption.
    pub fn get_timeout(&self, timeout: Duration) -> Option<Payload> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(entry) = inner.queue.pop_front() {
                return Some(entry.payload);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, result) = self.cv.wait_timeout(inner, remaining).unwrap();
            inner = guard;
            if result.timed_out() && inner.queue.is_empty() {
                return None;
            }
        }
    }

    /// Drop every queued payload. Registered cursors are kept; they belong
    /// to the session, not to the queue contents.
    pub fn clear(&self) {
        self.inner.lock().unwrap().queue.clear();
    }

    /// Remove every queued payload matching the predicate.
    pub fn remove_if<F>(&self, pred: F)
    where
        F: Fn(&[u8]) -> bool,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.retain(|entry| !pred(&entry.payload));
    }

    /// Number of queued payloads.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record `view_id`'s cursor rectangle for priority checks.
    pub fn update_cursor_position(&self, view_id: u32, cursor: CursorPosition) {
        self.inner.lock().unwrap().cursors.insert(view_id, cursor);
    }

    /// Forget `view_id`'s cursor, typically when its session ends.
    pub fn remove_cursor(&self, view_id: u32) {
        self.inner.lock().unwrap().cursors.remove(&view_id);
    }

    /// Bump the first queued tile overlapping `cursor` to the front.
    ///
    /// At most one entry moves; calling this again with the same cursor is a
    /// no-op, since the moved entry is found first at index 0.
    pub fn reprioritize(&self, cursor: &CursorPosition) {
        let mut inner = self.inner.lock().unwrap();
        for i in 0..inner.queue.len() {
            let intersects = inner.queue[i]
                .tile
                .as_ref()
                .is_some_and(|tile| tile.intersects_cursor(cursor));
            if !intersects {
                continue;
            }
            if i != 0 {
                if let Some(entry) = inner.queue.remove(i) {
                    log::trace!(
                        "bumping tile to top: [{}]",
                        String::from_utf8_lossy(&entry.payload)
                    );
                    inner.queue.push_front(entry);
                }
            }
            return;
        }
    }
}

impl Inner {
    fn put_locked(&mut self, payload: Payload) {
        let text = String::from_utf8_lossy(&payload).into_owned();
        log::trace!("putting [{text}]");

        if text == "canceltiles" {
            // Drop every pending tile request except previews (id=...),
            // which are needed regardless of what the view is doing.
            self.queue.retain(|entry| {
                let queued = String::from_utf8_lossy(&entry.payload);
                !(queued.starts_with("tile ") && !queued.contains("id="))
            });
            self.queue.push_front(Entry { payload, tile: None });
            return;
        }

        if text.starts_with("tile") {
            match TileDesc::parse(&text) {
                Ok(tile) => {
                    self.put_tile_locked(payload, &text, tile);
                    return;
                }
                Err(err) => {
                    // Unparseable requests carry no rectangle to dedup or
                    // prioritize against; queue them as ordinary traffic.
                    log::debug!("queuing unparseable tile request at back: {err:#}");
                    self.queue.push_back(Entry { payload, tile: None });
                    return;
                }
            }
        }

        self.queue.push_back(Entry { payload, tile: None });
    }

    fn put_tile_locked(&mut self, payload: Payload, text: &str, tile: TileDesc) {
        let key = normalized_key(text);
        let priority = self.is_priority(&tile);

        for i in 0..self.queue.len() {
            let matches = {
                let queued = String::from_utf8_lossy(&self.queue[i].payload);
                normalized_key(&queued) == key
            };
            if !matches {
                continue;
            }
            log::debug!("replacing duplicate tile: [{key}]");
            self.queue[i] = Entry { payload, tile: Some(tile) };
            if priority {
                if let Some(entry) = self.queue.remove(i) {
                    log::debug!("and bumping tile to top: [{text}]");
                    self.queue.push_front(entry);
                }
            }
            return;
        }

        if priority {
            log::debug!("priority tile [{text}]");
            self.queue.push_front(Entry { payload, tile: Some(tile) });
        } else {
            self.queue.push_back(Entry { payload, tile: Some(tile) });
        }
    }

    /// A tile is priority when it overlaps any view's cursor rectangle.
    fn is_priority(&self, tile: &TileDesc) -> bool {
        self.cursors
            .values()
            .any(|cursor| tile.intersects_cursor(cursor))
    }
}

/// Dedup key: the message text up to its first ` ver` parameter.
fn normalized_key(text: &str) -> &str {
    match text.find(" ver") {
        Some(pos) => &text[..pos],
        None => text,
    }
}
