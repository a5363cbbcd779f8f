//! Coordinating-thread implementations.
//!
//! [`EventLoop`] owns a dedicated thread that drains scheduled work in FIFO
//! order. [`ManualCoordinator`] instead adopts the thread that created it and
//! only runs work when that thread asks, which keeps tests deterministic.
use std::fmt;
use std::io;
use std::thread::{self, ThreadId};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error};

use crate::callback::{guard, Task};
use crate::dispatch::Coordinator;

pub struct EventLoop {
    sender: Sender<Task>,
    thread_id: ThreadId,
}

impl EventLoop {
    /// Spawns the coordinating thread. It runs until every handle to the
    /// loop has been dropped and the queue is empty.
    pub fn start(name: &str) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Task>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(receiver))?;
        Ok(EventLoop {
            sender,
            thread_id: handle.thread().id(),
        })
    }
}

fn run_loop(receiver: Receiver<Task>) {
    for task in receiver.iter() {
        if let Err(panicked) = guard(task) {
            error!("coordinator task {}", panicked);
        }
    }
    debug!("event loop stopped");
}

impl Coordinator for EventLoop {
    fn schedule(&self, task: Task) {
        if self.sender.send(task).is_err() {
            error!("event loop is gone, dropping scheduled task");
        }
    }

    fn is_coordinator_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread_id", &self.thread_id)
            .field("queued", &self.sender.len())
            .finish()
    }
}

/// A coordinator driven by hand from the thread that constructed it.
///
/// # Examples
///
/// ```
/// use promise_chain::{Context, InlineExecutor, ManualCoordinator, Promise};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::thread;
///
/// let coordinator = Arc::new(ManualCoordinator::new());
/// let ctx = Context::new(Arc::new(InlineExecutor), coordinator.clone());
/// let promise = Promise::<u32>::new(&ctx);
///
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = fired.clone();
/// promise.on_success(move |_| flag.store(true, Ordering::SeqCst));
///
/// let producer = promise.clone();
/// thread::spawn(move || producer.success(1)).join().unwrap();
/// assert!(!fired.load(Ordering::SeqCst));
///
/// coordinator.run_pending();
/// assert!(fired.load(Ordering::SeqCst));
/// ```
pub struct ManualCoordinator {
    owner: ThreadId,
    sender: Sender<Task>,
    receiver: Receiver<Task>,
}

impl ManualCoordinator {
    /// The calling thread becomes the coordinating thread.
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        ManualCoordinator {
            owner: thread::current().id(),
            sender,
            receiver,
        }
    }

    /// Runs queued work, including work queued by that work, until the
    /// queue is empty. Returns how many tasks ran.
    ///
    /// Calls from any thread but the owner run nothing.
    pub fn run_pending(&self) -> usize {
        if !self.is_coordinator_thread() {
            error!("run_pending called off the coordinating thread");
            return 0;
        }
        let mut ran = 0;
        for task in self.receiver.try_iter() {
            if let Err(panicked) = guard(task) {
                error!("coordinator task {}", panicked);
            }
            ran += 1;
        }
        ran
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Default for ManualCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator for ManualCoordinator {
    fn schedule(&self, task: Task) {
        // Both channel ends live in `self`, so this cannot disconnect.
        let _ = self.sender.send(task);
    }

    fn is_coordinator_thread(&self) -> bool {
        thread::current().id() == self.owner
    }
}

impl fmt::Debug for ManualCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualCoordinator")
            .field("owner", &self.owner)
            .field("pending", &self.pending())
            .finish()
    }
}
