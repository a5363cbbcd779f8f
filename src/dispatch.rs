use std::fmt;
use std::io;
use std::sync::Arc;

use crate::callback::Task;
use crate::event_loop::EventLoop;
use crate::executor::ThreadExecutor;

/// Runs submitted work on some worker thread.
///
/// No ordering is promised between separate submissions.
pub trait Executor: Send + Sync + 'static {
    fn submit(&self, task: Task);
}

/// Marshals work onto the single coordinating thread.
pub trait Coordinator: Send + Sync + 'static {
    /// Queue `task` to run on the coordinating thread. Tasks scheduled from
    /// one thread run in the order they were scheduled.
    fn schedule(&self, task: Task);

    /// Whether the calling thread is the coordinating thread.
    fn is_coordinator_thread(&self) -> bool;
}

/// Settings for the default thread-backed [`Context`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Name given to every worker thread
    pub worker_thread_name: String,
    /// Name of the event-loop thread that acts as coordinator
    pub coordinator_thread_name: String,
    /// Stack size for worker threads, platform default when `None`
    pub worker_stack_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_thread_name: "promise-worker".to_string(),
            coordinator_thread_name: "promise-coordinator".to_string(),
            worker_stack_size: None,
        }
    }
}

/// The executor and coordinator a promise delivers through.
///
/// Every promise carries its context, and promises derived from it (through
/// `map`, `flat_map`, `recover`, ...) inherit the same one.
#[derive(Clone)]
pub struct Context {
    executor: Arc<dyn Executor>,
    coordinator: Arc<dyn Coordinator>,
}

impl Context {
    pub fn new(executor: Arc<dyn Executor>, coordinator: Arc<dyn Coordinator>) -> Self {
        Context {
            executor,
            coordinator,
        }
    }

    /// A [`ThreadExecutor`] paired with a freshly started [`EventLoop`].
    pub fn with_config(config: Config) -> io::Result<Self> {
        let coordinator = EventLoop::start(&config.coordinator_thread_name)?;
        let executor = ThreadExecutor::new(config.worker_thread_name, config.worker_stack_size);
        Ok(Context::new(Arc::new(executor), Arc::new(coordinator)))
    }

    pub(crate) fn submit(&self, task: Task) {
        self.executor.submit(task)
    }

    pub(crate) fn schedule(&self, task: Task) {
        self.coordinator.schedule(task)
    }

    pub(crate) fn on_coordinator_thread(&self) -> bool {
        self.coordinator.is_coordinator_thread()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("on_coordinator_thread", &self.on_coordinator_thread())
            .finish()
    }
}
