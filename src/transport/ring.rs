// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The async processor's ring-buffer SPSC queue (§4.6, §9): decouples the
//! network-read task from the packet-processing task so a slow consumer
//! can't stall the socket. `push` fails fast when full rather than
//! allocating or blocking the producer; `pull` blocks until data or close.
//! O(1) push/pull, no allocation in the steady state (capacity is fixed at
//! construction).

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Returned by [`RingBuffer::push`] when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    closed: std::sync::atomic::AtomicBool,
    notify: Notify,
}

/// A single-producer, single-consumer ring buffer of fixed power-of-two
/// capacity.
pub struct RingBuffer<T> {
    inner: std::sync::Arc<Inner<T>>,
}

impl<T> Clone for RingBuffer<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> RingBuffer<T> {
    /// `capacity` must be a power of two; panics otherwise (a construction-
    /// time invariant this crate controls, not untrusted input).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity.is_power_of_two(), "ring buffer capacity must be a power of two");
        Self {
            inner: std::sync::Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                closed: std::sync::atomic::AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Fails fast with [`Full`] rather than growing or blocking.
    pub fn push(&self, item: T) -> Result<(), Full> {
        let mut q = self.inner.queue.lock().unwrap();
        if q.len() >= self.inner.capacity {
            return Err(Full);
        }
        q.push_back(item);
        drop(q);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Blocks until an item is available or the buffer is closed and
    /// drained, in which case it returns `None`.
    pub async fn pull(&self) -> Option<T> {
        loop {
            {
                let mut q = self.inner.queue.lock().unwrap();
                if let Some(item) = q.pop_front() {
                    return Some(item);
                }
                if self.inner.closed.load(std::sync::atomic::Ordering::Acquire) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Marks the buffer closed; any queued items are still delivered by
    /// `pull` before it starts returning `None` ("drains").
    pub fn close(&self) {
        self.inner.closed.store(true, std::sync::atomic::Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two_capacity() {
        RingBuffer::<u8>::new(3);
    }

    #[test]
    fn push_fails_fast_when_full() {
        let rb = RingBuffer::new(2);
        rb.push(1).unwrap();
        rb.push(2).unwrap();
        assert_eq!(rb.push(3), Err(Full));
    }

    #[tokio::test]
    async fn pull_drains_then_returns_none_after_close() {
        let rb = RingBuffer::new(4);
        rb.push(1).unwrap();
        rb.push(2).unwrap();
        rb.close();
        assert_eq!(rb.pull().await, Some(1));
        assert_eq!(rb.pull().await, Some(2));
        assert_eq!(rb.pull().await, None);
    }

    #[tokio::test]
    async fn pull_blocks_until_pushed() {
        let rb = RingBuffer::new(2);
        let rb2 = rb.clone();
        let handle = tokio::spawn(async move { rb2.pull().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        rb.push(42).unwrap();
        assert_eq!(handle.await.unwrap(), Some(42));
    }
}
