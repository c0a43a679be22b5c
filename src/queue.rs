// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Thread-safe FIFO used between the network task and the codec consumer
//! threads, and between the consumers and the caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// What [`Queue::enqueue`] does when a bounded queue is full.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the oldest queued item to make room. Never blocks.
    #[default]
    DropOldest,

    /// Wait until a consumer makes room or the queue is closed.
    Block,
}

/// Returned by [`Queue::enqueue`] on a closed queue; gives back the item.
#[derive(Debug, PartialEq, Eq)]
pub struct Closed<T>(pub T);

/// Returned by [`Queue::try_enqueue`]; gives back the item.
#[derive(Debug, PartialEq, Eq)]
pub enum TryEnqueueError<T> {
    /// A bounded [`OverflowPolicy::Block`] queue has no room.
    Full(T),
    Closed(T),
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A mutex/condvar-guarded FIFO, optionally bounded.
pub struct Queue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
    dropped: AtomicU64,
}

impl<T> Queue<T> {
    pub fn unbounded() -> Self {
        Self::new(None, OverflowPolicy::default())
    }

    /// Creates a queue holding at most `capacity` items (`None` is unbounded).
    ///
    /// A zero capacity is treated as one.
    pub fn new(capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        Queue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.map(|c| c.max(1)),
            overflow,
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends `item`, applying the overflow policy if the queue is full.
    pub fn enqueue(&self, item: T) -> Result<(), Closed<T>> {
        let mut l = self.state.lock();
        if let Some(cap) = self.capacity {
            while !l.closed && l.items.len() >= cap {
                match self.overflow {
                    OverflowPolicy::DropOldest => {
                        l.items.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    OverflowPolicy::Block => self.not_full.wait(&mut l),
                }
            }
        }
        if l.closed {
            return Err(Closed(item));
        }
        l.items.push_back(item);
        drop(l);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Appends `item` without blocking.
    ///
    /// A full [`OverflowPolicy::DropOldest`] queue still makes room; a full
    /// [`OverflowPolicy::Block`] queue returns the item instead of waiting.
    pub fn try_enqueue(&self, item: T) -> Result<(), TryEnqueueError<T>> {
        let mut l = self.state.lock();
        if l.closed {
            return Err(TryEnqueueError::Closed(item));
        }
        if let Some(cap) = self.capacity {
            while l.items.len() >= cap {
                match self.overflow {
                    OverflowPolicy::DropOldest => {
                        l.items.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    OverflowPolicy::Block => return Err(TryEnqueueError::Full(item)),
                }
            }
        }
        l.items.push_back(item);
        drop(l);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest item without blocking.
    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Removes the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn dequeue(&self) -> Option<T> {
        let mut l = self.state.lock();
        loop {
            if let Some(item) = l.items.pop_front() {
                drop(l);
                self.not_full.notify_one();
                return Some(item);
            }
            if l.closed {
                return None;
            }
            self.not_empty.wait(&mut l);
        }
    }

    /// Like [`Queue::dequeue`] but gives up after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let mut l = self.state.lock();
        if l.items.is_empty() && !l.closed {
            self.not_empty
                .wait_while_for(&mut l, |s| s.items.is_empty() && !s.closed, timeout);
        }
        let item = l.items.pop_front();
        drop(l);
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Discards all queued items, returning how many there were.
    pub fn clear(&self) -> usize {
        let n = {
            let mut l = self.state.lock();
            let n = l.items.len();
            l.items.clear();
            n
        };
        self.not_full.notify_all();
        n
    }

    /// Rejects further enqueues and wakes all waiters. Queued items can still
    /// be dequeued.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the number of items discarded by [`OverflowPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let l = self.state.lock();
        f.debug_struct("Queue")
            .field("len", &l.items.len())
            .field("closed", &l.closed)
            .field("capacity", &self.capacity)
            .field("overflow", &self.overflow)
            .finish()
    }
}
