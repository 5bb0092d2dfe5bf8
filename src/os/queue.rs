//! Bounded message queue.
//!
//! A fixed-depth FIFO of owned message slots shared by many producers and one
//! consumer. Blocking operations take an optional timeout: `None` waits
//! forever, `Some(Duration::ZERO)` never blocks. The `try_*` variants are the
//! non-blocking forms used from contexts that must not suspend (timer
//! callbacks, bus handlers).
//!
//! Variable-size payloads are not copied into the slot; a slot carries an
//! owned descriptor and the consumer takes ownership of whatever it points at.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{MeshxError, Result};

struct QueueState<T> {
    items: VecDeque<T>,
    deleted: bool,
}

enum PushError<T> {
    Full(T),
    Deleted,
}

pub struct MessageQueue<T> {
    depth: usize,
    state: Mutex<QueueState<T>>,
    readable: Notify,
    writable: Notify,
}

impl<T> MessageQueue<T> {
    /// Create a queue holding at most `depth` messages.
    pub fn create(depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(MeshxError::invalid_arg("queue depth must be non-zero"));
        }
        let mut items = VecDeque::new();
        items
            .try_reserve_exact(depth)
            .map_err(|_| MeshxError::NoMem(format!("queue of {} slots", depth)))?;
        Ok(Self {
            depth,
            state: Mutex::new(QueueState {
                items,
                deleted: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_deleted(&self) -> bool {
        self.lock().deleted
    }

    fn push(&self, msg: T, front: bool) -> std::result::Result<(), PushError<T>> {
        {
            let mut state = self.lock();
            if state.deleted {
                return Err(PushError::Deleted);
            }
            if state.items.len() >= self.depth {
                return Err(PushError::Full(msg));
            }
            if front {
                state.items.push_front(msg);
            } else {
                state.items.push_back(msg);
            }
        }
        self.readable.notify_waiters();
        Ok(())
    }

    fn pop(&self) -> Result<T> {
        let item = {
            let mut state = self.lock();
            if state.deleted {
                return Err(MeshxError::invalid_state("queue deleted"));
            }
            state.items.pop_front()
        };
        match item {
            Some(item) => {
                self.writable.notify_waiters();
                Ok(item)
            }
            None => Err(MeshxError::Empty),
        }
    }

    async fn send_inner(&self, mut msg: T, timeout: Option<Duration>, front: bool) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.push(msg, front) {
                Ok(()) => return Ok(()),
                Err(PushError::Deleted) => return Err(MeshxError::invalid_state("queue deleted")),
                Err(PushError::Full(m)) => msg = m,
            }

            match deadline {
                None => notified.await,
                Some(at) => {
                    if Instant::now() >= at
                        || tokio::time::timeout_at(at, notified).await.is_err()
                    {
                        return Err(MeshxError::Full);
                    }
                }
            }
        }
    }

    /// Append `msg`, waiting up to `timeout` for a free slot.
    pub async fn send(&self, msg: T, timeout: Option<Duration>) -> Result<()> {
        self.send_inner(msg, timeout, false).await
    }

    /// Insert `msg` at the head, waiting up to `timeout` for a free slot.
    pub async fn send_front(&self, msg: T, timeout: Option<Duration>) -> Result<()> {
        self.send_inner(msg, timeout, true).await
    }

    /// Non-blocking append; `Full` if no slot is free.
    pub fn try_send(&self, msg: T) -> Result<()> {
        match self.push(msg, false) {
            Ok(()) => Ok(()),
            Err(PushError::Full(_)) => Err(MeshxError::Full),
            Err(PushError::Deleted) => Err(MeshxError::invalid_state("queue deleted")),
        }
    }

    /// Non-blocking head insertion; `Full` if no slot is free.
    pub fn try_send_front(&self, msg: T) -> Result<()> {
        match self.push(msg, true) {
            Ok(()) => Ok(()),
            Err(PushError::Full(_)) => Err(MeshxError::Full),
            Err(PushError::Deleted) => Err(MeshxError::invalid_state("queue deleted")),
        }
    }

    /// Take the head message, waiting up to `timeout` for one to arrive.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.pop() {
                Err(MeshxError::Empty) => {}
                other => return other,
            }

            match deadline {
                None => notified.await,
                Some(at) => {
                    if Instant::now() >= at
                        || tokio::time::timeout_at(at, notified).await.is_err()
                    {
                        return Err(MeshxError::Empty);
                    }
                }
            }
        }
    }

    pub fn try_recv(&self) -> Result<T> {
        self.pop()
    }

    /// Drop every queued message and wake all waiters; later calls fail with
    /// `InvalidState`.
    pub fn delete(&self) {
        {
            let mut state = self.lock();
            state.deleted = true;
            state.items.clear();
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

impl<T: Clone> MessageQueue<T> {
    /// Copy of the head message without removing it.
    pub fn peek(&self) -> Result<T> {
        let state = self.lock();
        if state.deleted {
            return Err(MeshxError::invalid_state("queue deleted"));
        }
        state.items.front().cloned().ok_or(MeshxError::Empty)
    }
}
