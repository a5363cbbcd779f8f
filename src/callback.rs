//! One-argument sinks that store every listener registration, and the unit
//! of work handed to executors and coordinators.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use log::error;

use crate::Panicked;

/// Receives a single value, once.
///
/// Implemented for every `FnOnce(T) + Send + 'static`; listeners are stored
/// as boxed callbacks.
pub(crate) trait Callback<T>: Send + 'static {
    fn on_callback(self: Box<Self>, value: T);
}

impl<T, F> Callback<T> for F
where
    F: FnOnce(T) + Send + 'static,
{
    fn on_callback(self: Box<Self>, value: T) {
        (*self)(value)
    }
}

pub(crate) type BoxCallback<T> = Box<dyn Callback<T>>;

/// Work submitted to an [`Executor`](crate::Executor) or scheduled on a
/// [`Coordinator`](crate::Coordinator).
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a listener, logging instead of unwinding if it panics.
pub(crate) fn deliver<T: 'static>(callback: BoxCallback<T>, value: T) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback.on_callback(value))) {
        error!("listener panicked: {}", Panicked::from_payload(payload.as_ref()));
    }
}

/// Runs user code that produces a result, turning a panic into [`Panicked`].
pub(crate) fn guard<T>(f: impl FnOnce() -> T) -> Result<T, Panicked> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Panicked::from_payload(payload.as_ref()))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
