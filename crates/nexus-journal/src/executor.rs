//! Single-worker background executors.
//!
//! The journal runs file housekeeping (pre-opening, closing, recycling) and
//! reclamation/compaction on two dedicated executors. Each executor owns one
//! named thread serving a FIFO queue, so tasks on the same executor never run
//! concurrently. Callers that must wait for a task use a [`CountDownLatch`]
//! with a deadline.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::{JournalError, JournalResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Countdown latch with timed waits.
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountDownLatch {
    /// Creates a latch that opens after `count` calls to `count_down`.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Adds one to the count.
    pub fn count_up(&self) {
        *self.count.lock() += 1;
    }

    /// Removes one from the count, waking waiters when it reaches zero.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Returns the current count.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Waits until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Waits until the count reaches zero or the timeout elapses.
    ///
    /// Returns false on timeout.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    shutdown: bool,
    terminated: bool,
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    available: Condvar,
    terminated: Condvar,
}

/// Executor running submitted tasks one at a time on a dedicated thread.
pub struct SingleWorkerExecutor {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SingleWorkerExecutor {
    /// Spawns the worker thread.
    pub fn start(name: impl Into<String>) -> JournalResult<Self> {
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            terminated: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || Self::run(&worker))?;

        debug!(executor = %shared.name, "executor started");

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Returns the executor's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues a task.
    pub fn execute<F>(&self, task: F) -> JournalResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(JournalError::ExecutorClosed {
                name: self.shared.name.clone(),
            });
        }
        state.tasks.push_back(Box::new(task));
        self.shared.available.notify_one();
        Ok(())
    }

    /// Returns the number of queued tasks not yet started.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Returns true once `shutdown` was requested.
    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Waits until every task queued before this call has run.
    pub fn flush(&self, timeout: Duration) -> JournalResult<()> {
        let latch = Arc::new(CountDownLatch::new(1));
        let signal = Arc::clone(&latch);
        self.execute(move || signal.count_down())?;
        if latch.wait_for(timeout) {
            Ok(())
        } else {
            Err(JournalError::timeout("executor flush", timeout))
        }
    }

    /// Stops accepting tasks and waits for the queue to drain.
    ///
    /// Returns false if the worker did not finish within `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.available.notify_all();
            while !state.terminated {
                if self
                    .shared
                    .terminated
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            if !state.terminated {
                warn!(executor = %self.shared.name, "executor did not terminate in time");
                return false;
            }
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!(executor = %self.shared.name, "executor thread panicked");
            }
        }
        debug!(executor = %self.shared.name, "executor stopped");
        true
    }

    fn run(shared: &Shared) {
        loop {
            let task = {
                let mut state = shared.state.lock();
                loop {
                    if let Some(task) = state.tasks.pop_front() {
                        break Some(task);
                    }
                    if state.shutdown {
                        break None;
                    }
                    shared.available.wait(&mut state);
                }
            };

            match task {
                Some(task) => {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(executor = %shared.name, "task panicked");
                    }
                }
                None => {
                    let mut state = shared.state.lock();
                    state.terminated = true;
                    shared.terminated.notify_all();
                    return;
                }
            }
        }
    }
}

impl Drop for SingleWorkerExecutor {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.available.notify_all();
    }
}

impl std::fmt::Debug for SingleWorkerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleWorkerExecutor")
            .field("name", &self.shared.name)
            .field("pending", &self.pending())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_latch() {
        let latch = CountDownLatch::new(2);
        assert!(!latch.wait_for(Duration::from_millis(10)));
        latch.count_down();
        latch.count_up();
        assert_eq!(latch.count(), 2);
        latch.count_down();
        latch.count_down();
        assert!(latch.wait_for(Duration::from_millis(10)));
        latch.wait();
    }

    #[test]
    fn test_tasks_run_in_order() {
        let executor = SingleWorkerExecutor::start("test-worker").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            executor.execute(move || seen.lock().push(i)).unwrap();
        }
        executor.flush(Duration::from_secs(5)).unwrap();

        let seen = seen.lock();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let executor = SingleWorkerExecutor::start("drain-worker").unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let count = Arc::clone(&count);
            executor
                .execute(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert!(executor.shutdown(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert!(executor.is_shutdown());

        let err = executor.execute(|| {}).unwrap_err();
        assert!(matches!(err, JournalError::ExecutorClosed { .. }));
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let executor = SingleWorkerExecutor::start("panic-worker").unwrap();
        executor.execute(|| panic!("boom")).unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        executor
            .execute(move || {
                flag.store(1, Ordering::SeqCst);
            })
            .unwrap();
        executor.flush(Duration::from_secs(5)).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flush_timeout() {
        let executor = SingleWorkerExecutor::start("slow-worker").unwrap();
        executor
            .execute(|| thread::sleep(Duration::from_millis(300)))
            .unwrap();
        let err = executor.flush(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
        assert!(executor.shutdown(Duration::from_secs(5)));
    }
}
