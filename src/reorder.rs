// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Restores display order from decode order using picture order counts.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::Timestamp;

/// A picture with its ordering information.
///
/// `P` is whatever represents the picture: decoded pixels in the pipeline,
/// or the encoded access unit.
#[derive(Clone, Debug)]
pub struct Frame<P> {
    pub poc: i64,
    pub dts: Timestamp,
    pub pts: Timestamp,
    pub payload: P,
}

/// Heap entry ordered by `(poc, arrival)`; ties keep arrival order.
struct Entry<P> {
    key: (i64, u64),
    frame: Frame<P>,
}

impl<P> PartialEq for Entry<P> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<P> Eq for Entry<P> {}

impl<P> PartialOrd for Entry<P> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Entry<P> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// Buffers frames between flush points and emits them by ascending POC.
///
/// Frames are flushed at each IDR. With a `max_depth`, the buffer also emits
/// its lowest-POC frame whenever more than `max_depth` frames are held, so
/// latency stays bounded within long GOPs.
pub struct ReorderBuffer<P> {
    heap: BinaryHeap<Reverse<Entry<P>>>,
    max_depth: Option<usize>,
    arrivals: u64,
}

impl<P> ReorderBuffer<P> {
    pub fn new(max_depth: Option<usize>) -> Self {
        Self {
            heap: BinaryHeap::new(),
            max_depth,
            arrivals: 0,
        }
    }

    pub fn set_max_depth(&mut self, max_depth: Option<usize>) {
        self.max_depth = max_depth;
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    /// Adds `frame`, appending any frames now ready for display to `out`.
    ///
    /// `is_flush_point` marks an IDR: everything buffered before it is emitted
    /// first, since no later picture can precede it in display order.
    pub fn push(&mut self, frame: Frame<P>, is_flush_point: bool, out: &mut Vec<Frame<P>>) {
        if is_flush_point {
            self.flush(out);
        }
        self.arrivals += 1;
        self.heap.push(Reverse(Entry {
            key: (frame.poc, self.arrivals),
            frame,
        }));
        if let Some(depth) = self.max_depth {
            while self.heap.len() > depth {
                match self.heap.pop() {
                    Some(Reverse(e)) => out.push(e.frame),
                    None => break,
                }
            }
        }
    }

    /// Emits every buffered frame by ascending POC and empties the buffer.
    pub fn flush(&mut self, out: &mut Vec<Frame<P>>) {
        out.reserve(self.heap.len());
        while let Some(Reverse(e)) = self.heap.pop() {
            out.push(e.frame);
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drops all buffered frames.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.arrivals = 0;
    }
}
