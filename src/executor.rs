use std::sync::Arc;
use std::thread;

use log::error;
use parking_lot::Mutex;

use crate::callback::Task;
use crate::dispatch::Executor;

/// Starts a new named thread for every submitted task, so the pool is
/// effectively unbounded and a task that blocks never starves another.
///
/// If a thread cannot be spawned the task runs inline on the submitting
/// thread instead. When that thread is the coordinating thread, background
/// listeners of that one completion run on it.
#[derive(Debug, Clone)]
pub struct ThreadExecutor {
    name: String,
    stack_size: Option<usize>,
}

impl ThreadExecutor {
    pub fn new(name: impl Into<String>, stack_size: Option<usize>) -> Self {
        ThreadExecutor {
            name: name.into(),
            stack_size,
        }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        ThreadExecutor::new("promise-worker", None)
    }
}

impl Executor for ThreadExecutor {
    fn submit(&self, task: Task) {
        let mut builder = thread::Builder::new().name(self.name.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        // `spawn` hands the closure back only on success, so keep a second
        // route to the task for the fallback.
        let slot = Arc::new(Mutex::new(Some(task)));
        let worker_slot = slot.clone();
        let spawned = builder.spawn(move || {
            let task = worker_slot.lock().take();
            if let Some(task) = task {
                task();
            }
        });
        if let Err(err) = spawned {
            error!("could not spawn {} thread, running task inline: {}", self.name, err);
            let task = slot.lock().take();
            if let Some(task) = task {
                task();
            }
        }
    }
}

/// Runs every task immediately on the submitting thread.
///
/// Paired with a [`ManualCoordinator`](crate::ManualCoordinator) this makes
/// delivery fully deterministic, which is what the unit tests rely on.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn submit(&self, task: Task) {
        task()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn test_thread_executor_runs_on_named_thread() {
        let executor = ThreadExecutor::new("test-worker", None);
        let (tx, rx) = channel();
        executor.submit(Box::new(move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-worker"));
    }

    #[test]
    fn test_unspawnable_task_still_runs() {
        let executor = ThreadExecutor::new("oversized", Some(1 << 60));
        let (tx, rx) = channel();
        executor.submit(Box::new(move || tx.send(()).unwrap()));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_inline_executor_runs_immediately() {
        let (tx, rx) = channel();
        InlineExecutor.submit(Box::new(move || tx.send(thread::current().id()).unwrap()));
        assert_eq!(rx.try_recv().ok(), Some(thread::current().id()));
    }
}
