// SPDX-License-Identifier: GPL-3.0-only
//! Named worker threads with cooperative shutdown
//!
//! Every engine thread (pipe stages, frame-done, capture, jpeg save,
//! watchdog) is a [`WorkerController`]: a body called in a loop until it
//! returns [`LoopAction::Stop`] or the stop flag is raised. Workers that
//! block on a queue register a waker so raising the flag also unblocks them.
//!
//! ```text
//!   spawn ──► [flag set?] ──no──► body() ──Continue──┐
//!                 │  ▲                     │          │
//!                yes └─────────────────────┼──────────┘
//!                 │                       Stop
//!                 ▼                        │
//!               exit ◄─────────────────────┘
//! ```

use crate::errors::Result;
use crate::pipes::{FrameQueue, Popped};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// What a worker body wants after one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    /// Leave the loop; the thread exits without waiting for a stop
    Stop,
}

type Waker = Box<dyn Fn() + Send + Sync>;

/// Handle to one worker thread
///
/// Dropping the handle stops and joins the thread.
pub struct WorkerController {
    name: String,
    flag: Arc<AtomicBool>,
    waker: Option<Waker>,
    iterations: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerController {
    /// Spawn a worker with its own stop flag
    pub fn start<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        Self::start_shared(name, Arc::new(AtomicBool::new(false)), body)
    }

    /// Spawn a worker that watches `flag`
    ///
    /// Several workers may share one flag; raising it stops all of them at
    /// their next check.
    pub fn start_shared<F>(name: &str, flag: Arc<AtomicBool>, mut body: F) -> Result<Self>
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        let iterations = Arc::new(AtomicU64::new(0));
        let thread = {
            let flag = Arc::clone(&flag);
            let iterations = Arc::clone(&iterations);
            let name = name.to_string();
            thread::Builder::new().name(name.clone()).spawn(move || {
                let reason = loop {
                    if flag.load(Ordering::SeqCst) {
                        break "stop flag";
                    }
                    let action = body();
                    iterations.fetch_add(1, Ordering::Relaxed);
                    if action == LoopAction::Stop {
                        break "body finished";
                    }
                };
                debug!(
                    worker = %name,
                    reason,
                    iterations = iterations.load(Ordering::Relaxed),
                    "Worker exiting"
                );
            })?
        };
        debug!(worker = %name, "Worker spawned");

        Ok(Self {
            name: name.to_string(),
            flag,
            waker: None,
            iterations,
            thread: Some(thread),
        })
    }

    /// Spawn a worker that feeds every item popped from `queue` to `handler`
    ///
    /// Timeouts and wake-up sentinels only bring the loop back to the flag
    /// check.
    pub fn queue_worker<T, F>(
        name: &str,
        flag: Arc<AtomicBool>,
        queue: FrameQueue<T>,
        wait: Duration,
        mut handler: F,
    ) -> Result<Self>
    where
        T: Send + 'static,
        F: FnMut(T) -> LoopAction + Send + 'static,
    {
        let waker = queue.clone();
        let worker = Self::start_shared(name, flag, move || match queue.wait_and_pop(wait) {
            Popped::Item(item) => handler(item),
            Popped::WakeUp | Popped::TimedOut => LoopAction::Continue,
        })?;
        Ok(worker.with_waker(move || waker.wake_up()))
    }

    /// Called on stop so a body blocked outside the flag check returns
    pub fn with_waker(mut self, waker: impl Fn() + Send + Sync + 'static) -> Self {
        self.waker = Some(Box::new(waker));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completed body iterations
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Raise the flag and run the waker; does not wait
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(waker) = &self.waker {
            waker();
        }
    }

    /// Wait for the thread; does not raise the flag
    pub fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.join().is_err() {
            warn!(worker = %self.name, "Worker panicked");
        }
    }

    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }
}

impl Drop for WorkerController {
    fn drop(&mut self) {
        if self.thread.is_some() {
            debug!(worker = %self.name, "Worker dropped while running");
            self.stop();
        }
    }
}

impl std::fmt::Debug for WorkerController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerController")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("iterations", &self.iterations())
            .finish()
    }
}

/// Workers stopped together
#[derive(Debug, Default)]
pub struct WorkerSet {
    workers: Vec<WorkerController>,
}

impl WorkerSet {
    pub fn push(&mut self, worker: WorkerController) {
        self.workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Raise every flag before joining any, so no worker waits on a stopped peer
    pub fn stop_all(&mut self) {
        self.workers.iter().for_each(WorkerController::request_stop);
        for mut worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_body_can_finish_the_worker() {
        let mut left = 5;
        let mut worker = WorkerController::start("countdown", move || {
            left -= 1;
            if left == 0 { LoopAction::Stop } else { LoopAction::Continue }
        })
        .unwrap();
        assert!(eventually(|| !worker.is_running()));
        worker.join();
        assert_eq!(worker.iterations(), 5);
    }

    #[test]
    fn test_thread_carries_worker_name() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let mut worker = WorkerController::start("pipe-scp", move || {
            *sink.lock().unwrap() = thread::current().name().map(str::to_string);
            LoopAction::Stop
        })
        .unwrap();
        worker.join();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("pipe-scp"));
        assert_eq!(worker.name(), "pipe-scp");
    }

    #[test]
    fn test_shared_flag_stops_every_worker() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut set = WorkerSet::default();
        for i in 0..3 {
            set.push(
                WorkerController::start_shared(&format!("idle-{}", i), Arc::clone(&flag), || {
                    thread::sleep(Duration::from_millis(2));
                    LoopAction::Continue
                })
                .unwrap(),
            );
        }
        assert_eq!(set.len(), 3);
        flag.store(true, Ordering::SeqCst);
        set.stop_all();
        assert!(set.is_empty());
    }

    #[test]
    fn test_queue_worker_sees_items_in_order() {
        let queue: FrameQueue<u32> = FrameQueue::new("ordered");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut worker = WorkerController::queue_worker(
            "ordered",
            Arc::new(AtomicBool::new(false)),
            queue.clone(),
            Duration::from_millis(20),
            move |item| {
                sink.lock().unwrap().push(item);
                LoopAction::Continue
            },
        )
        .unwrap();

        for i in [3, 1, 2] {
            queue.push(i);
        }
        assert!(eventually(|| seen.lock().unwrap().len() == 3));
        worker.stop();
        assert_eq!(*seen.lock().unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_stop_unblocks_a_long_queue_wait() {
        let queue: FrameQueue<u32> = FrameQueue::new("parked");
        let mut worker = WorkerController::queue_worker(
            "parked",
            Arc::new(AtomicBool::new(false)),
            queue,
            Duration::from_secs(30),
            |_| LoopAction::Continue,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!worker.is_running());
    }
}
