// SPDX-License-Identifier: GPL-3.0-only

//! Unbounded FIFO queues with wake-up sentinels
//!
//! Pushing never blocks. Backpressure happens upstream, where the session
//! refuses to generate new frames, never at the push.

use crate::frame::FrameId;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

enum Message<T> {
    Item(T),
    WakeUp,
}

/// Outcome of a blocking pop
#[derive(Debug, PartialEq, Eq)]
pub enum Popped<T> {
    Item(T),
    /// A wake-up sentinel was consumed; the caller should re-check its stop flag
    WakeUp,
    TimedOut,
}

/// Multi-producer multi-consumer FIFO shared between workers
pub struct FrameQueue<T = FrameId> {
    name: Arc<str>,
    tx: Sender<Message<T>>,
    rx: Receiver<Message<T>>,
}

impl<T> Clone for FrameQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> FrameQueue<T> {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded();
        Self {
            name: Arc::from(name),
            tx,
            rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&self, item: T) {
        // Both ends live in self, so the channel can't be disconnected
        let _ = self.tx.send(Message::Item(item));
    }

    /// Unblock one waiter so it re-checks its stop flag
    pub fn wake_up(&self) {
        trace!(queue = %self.name, "Wake-up sentinel pushed");
        let _ = self.tx.send(Message::WakeUp);
    }

    /// Block up to `timeout` for the next entry
    pub fn wait_and_pop(&self, timeout: Duration) -> Popped<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(Message::Item(item)) => Popped::Item(item),
            Ok(Message::WakeUp) => Popped::WakeUp,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Popped::TimedOut
            }
        }
    }

    /// Pop the next item without blocking, discarding sentinels
    pub fn try_pop(&self) -> Option<T> {
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Item(item) = message {
                return Some(item);
            }
        }
        None
    }

    /// Remove every queued item, discarding sentinels
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Item(item) = message {
                items.push(item);
            }
        }
        items
    }

    /// Queued entries, sentinels included
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> std::fmt::Debug for FrameQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue: FrameQueue<u32> = FrameQueue::new("test");
        for i in 0..5 {
            queue.push(i);
        }
        let popped: Vec<u32> = (0..5)
            .filter_map(|_| match queue.wait_and_pop(Duration::from_millis(10)) {
                Popped::Item(i) => Some(i),
                _ => None,
            })
            .collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_timeout() {
        let queue: FrameQueue<u32> = FrameQueue::new("empty");
        let start = Instant::now();
        assert_eq!(queue.wait_and_pop(Duration::from_millis(20)), Popped::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_wake_up_unblocks_waiter() {
        let queue: FrameQueue<u32> = FrameQueue::new("wake");
        let waiter = queue.clone();
        let handle = thread::spawn(move || waiter.wait_and_pop(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(20));
        queue.wake_up();

        assert_eq!(handle.join().unwrap(), Popped::WakeUp);
    }

    #[test]
    fn test_drain_skips_sentinels() {
        let queue: FrameQueue<u32> = FrameQueue::new("drain");
        queue.push(1);
        queue.wake_up();
        queue.push(2);
        assert_eq!(queue.drain(), vec![1, 2]);
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None);
    }
}
