//! Composable promises for work that runs on worker threads but reports back
//! to callers on either a worker thread or one designated coordinating
//! thread (an event loop or UI thread).
//!
//! A [`Promise`] completes exactly once. When it does, its listeners are
//! delivered on two independent pathways:
//!
//! * the background pathway, always off the coordinating thread, serves
//!   [`Promise::on_complete`], [`Promise::map`] and [`Promise::flat_map`];
//! * the coordinator pathway, always on the coordinating thread, serves
//!   [`Promise::on_success`] and [`Promise::on_failure`].
//!
//! Whichever pathway belongs to the completing thread runs inline; the other
//! is handed off, so neither side waits on the other.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{combinators, Context};
//! use std::time::Duration;
//!
//! let ctx = Context::with_config(Default::default()).unwrap();
//! let answer = combinators::create(&ctx, || Ok::<_, String>(21))
//!     .map(|x| x * 2)
//!     .get_timeout(Duration::from_secs(5))
//!     .unwrap();
//! assert_eq!(answer, 42);
//! ```
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub mod callback;
pub mod combinators;
pub mod dispatch;
pub mod event_loop;
pub mod executor;
pub mod outcome;
pub mod promise;

pub use callback::Task;
pub use combinators::{create, join, sequence, Joinable};
pub use dispatch::{Config, Context, Coordinator, Executor};
pub use event_loop::{EventLoop, ManualCoordinator};
pub use executor::{InlineExecutor, ThreadExecutor};
pub use outcome::Try;
pub use promise::Promise;

/// Why a promise failed. Shared so one failure can reach every listener.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("promise is not done")]
    NotDone,
    #[error("promise did not succeed")]
    NotSucceeded,
    #[error("promise did not fail")]
    NotFailed,
    #[error("promise was canceled")]
    Canceled,
    #[error("promise failed: {0}")]
    Failed(#[source] Cause),
    #[error("promise timed out after {0:?}")]
    Timeout(Duration),
}

/// Recorded as the failure cause when a computation, transform or recovery
/// function panics.
#[derive(Debug, Clone, Error)]
#[error("computation panicked: {message}")]
pub struct Panicked {
    message: String,
}

impl Panicked {
    pub(crate) fn from_payload(payload: &(dyn std::any::Any + Send)) -> Self {
        Panicked {
            message: callback::panic_message(payload),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
