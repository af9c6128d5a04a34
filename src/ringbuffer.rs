//! Bounded multi-producer/single-consumer queue of inbound packets.
//!
//! The read loop pushes decoded packets; user code pops them one at a time
//! via `read_packet`. The queue is closable: once closed, pushes fail
//! immediately and pops drain whatever is left before returning
//! [`Error::RingBufferClosed`].
//!
//! Waiting uses two [`Notify`] instances with the pinned `enable()` pattern
//! so a `notify_waiters` issued by [`RingBuffer::close`] between a waiter's
//! condition check and its await cannot be lost.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Default queue capacity (power of two).
pub const DEFAULT_CAPACITY: usize = 1 << 19;

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// A bounded, closable FIFO queue.
///
/// `push` and `pop` are async and contention-safe; `close` is idempotent
/// and callable from anywhere. Elements are delivered in push order.
pub struct RingBuffer<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    /// Signaled when an element is pushed or the buffer is closed.
    readable: Notify,
    /// Signaled when an element is popped or the buffer is closed.
    writable: Notify,
}

impl<T> RingBuffer<T> {
    /// Create a ring buffer holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueue an element, waiting for space if the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RingBufferClosed`] if the buffer has been closed.
    /// The element is consumed either way.
    pub async fn push(&self, item: T) -> Result<()> {
        let mut item = Some(item);
        let mut notified = pin!(self.writable.notified());
        loop {
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("ring buffer poisoned");
                if inner.closed {
                    return Err(Error::RingBufferClosed);
                }
                if inner.queue.len() < self.capacity {
                    inner.queue.push_back(item.take().expect("item consumed twice"));
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            notified.as_mut().await;
            notified.set(self.writable.notified());
        }
    }

    /// Dequeue the oldest element, waiting until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RingBufferClosed`] once the buffer has been closed
    /// AND drained. Elements pushed before `close` are still delivered.
    pub async fn pop(&self) -> Result<T> {
        let mut notified = pin!(self.readable.notified());
        loop {
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("ring buffer poisoned");
                if let Some(item) = inner.queue.pop_front() {
                    self.writable.notify_one();
                    return Ok(item);
                }
                if inner.closed {
                    return Err(Error::RingBufferClosed);
                }
            }
            notified.as_mut().await;
            notified.set(self.readable.notified());
        }
    }

    /// Close the buffer. Idempotent.
    ///
    /// After close, any `push` fails and a pending `pop` unblocks once the
    /// queue is drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("ring buffer poisoned");
        if !inner.closed {
            inner.closed = true;
            // Waiters that enabled before this lock was taken are woken here;
            // anyone arriving later observes the closed flag directly.
            self.readable.notify_waiters();
            self.writable.notify_waiters();
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("ring buffer poisoned").closed
    }

    /// Number of elements currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring buffer poisoned").queue.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let buffer = RingBuffer::new(16);
        for i in 0..10u32 {
            buffer.push(i).await.unwrap();
        }
        for i in 0..10u32 {
            assert_eq!(buffer.pop().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let buffer = Arc::new(RingBuffer::new(4));
        let popper = buffer.clone();
        let handle = tokio::spawn(async move { popper.pop().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.push(99u32).await.unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), 99);
    }

    #[tokio::test]
    async fn test_push_waits_for_space() {
        let buffer = Arc::new(RingBuffer::new(1));
        buffer.push(1u32).await.unwrap();

        let pusher = buffer.clone();
        let handle = tokio::spawn(async move { pusher.push(2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(buffer.pop().await.unwrap(), 1);

        handle.await.unwrap().unwrap();
        assert_eq!(buffer.pop().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_push_after_close_fails() {
        let buffer: RingBuffer<u32> = RingBuffer::new(4);
        buffer.close();
        assert!(matches!(
            buffer.push(1).await,
            Err(Error::RingBufferClosed)
        ));
    }

    #[tokio::test]
    async fn test_pop_drains_before_closed_error() {
        let buffer = RingBuffer::new(4);
        buffer.push(1u32).await.unwrap();
        buffer.push(2u32).await.unwrap();
        buffer.close();

        assert_eq!(buffer.pop().await.unwrap(), 1);
        assert_eq!(buffer.pop().await.unwrap(), 2);
        assert!(matches!(buffer.pop().await, Err(Error::RingBufferClosed)));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_pop() {
        let buffer: Arc<RingBuffer<u32>> = Arc::new(RingBuffer::new(4));
        let popper = buffer.clone();
        let handle = tokio::spawn(async move { popper.pop().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.close();

        assert!(matches!(handle.await.unwrap(), Err(Error::RingBufferClosed)));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_push() {
        let buffer = Arc::new(RingBuffer::new(1));
        buffer.push(1u32).await.unwrap();

        let pusher = buffer.clone();
        let handle = tokio::spawn(async move { pusher.push(2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.close();

        assert!(matches!(handle.await.unwrap(), Err(Error::RingBufferClosed)));
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let buffer: RingBuffer<u32> = RingBuffer::new(4);
        buffer.close();
        buffer.close();
        assert!(buffer.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_producers_all_delivered() {
        let buffer = Arc::new(RingBuffer::new(DEFAULT_CAPACITY));
        let mut handles = Vec::new();
        for producer in 0..4u32 {
            let buffer = buffer.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100u32 {
                    buffer.push(producer * 1000 + i).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..400 {
            seen.push(buffer.pop().await.unwrap());
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 400);
    }
}
