//! Bounded per-connection outbound frame queue.
//!
//! Producers (session pumps, the approval broker, the reader task) push
//! frames; the connection's writer task pops them. Above the soft limit,
//! consecutive `content_delta` frames for the same block are coalesced by
//! concatenating their deltas; every other frame type is preserved as-is.
//! If the queue still reaches the hard cap the connection is marked
//! overflowed and closed as a slow consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use weft_shared::frames::ServerFrame;

const SOFT_LIMIT: usize = 256;
const HARD_LIMIT: usize = 4096;

struct Inner {
    queue: VecDeque<ServerFrame>,
    closed: bool,
    overflowed: bool,
}

/// Clonable handle to one connection's outbound queue.
#[derive(Clone)]
pub struct Outbound {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl Outbound {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
                overflowed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a frame. Returns false when the queue is closed (the caller
    /// can stop producing; the connection is going away).
    pub fn push(&self, frame: ServerFrame) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }

        if inner.queue.len() >= SOFT_LIMIT {
            if let Some(true) = try_coalesce(inner.queue.back_mut(), &frame) {
                drop(inner);
                self.notify.notify_one();
                return true;
            }
        }

        if inner.queue.len() >= HARD_LIMIT {
            inner.overflowed = true;
            inner.closed = true;
            drop(inner);
            self.notify.notify_one();
            return false;
        }

        inner.queue.push_back(frame);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Wait for the next frame. `None` means the queue is closed and fully
    /// drained (or overflowed).
    pub async fn pop(&self) -> Option<ServerFrame> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.overflowed {
                    return None;
                }
                if let Some(frame) = inner.queue.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Close the queue; pending frames still drain unless overflowed.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.notify.notify_one();
    }

    pub fn is_overflowed(&self) -> bool {
        self.inner.lock().unwrap().overflowed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}

impl Default for Outbound {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge `frame` into the queue tail when both are deltas for the same block
/// in the same nested context.
fn try_coalesce(tail: Option<&mut ServerFrame>, frame: &ServerFrame) -> Option<bool> {
    let tail = tail?;
    match (tail, frame) {
        (
            ServerFrame::ContentDelta {
                session_id: tail_session,
                index: tail_index,
                delta: tail_delta,
                context: tail_context,
            },
            ServerFrame::ContentDelta {
                session_id,
                index,
                delta,
                context,
            },
        ) if tail_session == session_id && tail_index == index && tail_context == context => {
            tail_delta.push_str(delta);
            Some(true)
        }
        _ => Some(false),
    }
}
