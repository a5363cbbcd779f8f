//! Ways to start promises and to combine several into one.
use std::error::Error as StdError;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::callback::guard;
use crate::dispatch::Context;
use crate::outcome::Try;
use crate::promise::Promise;

/// Runs `computation` on the executor and returns a promise of its result.
///
/// An `Err` or a panic fails the promise.
///
/// # Examples
///
/// ```
/// use promise_chain::{combinators, Context};
/// use std::time::Duration;
///
/// let ctx = Context::with_config(Default::default()).unwrap();
/// let parsed = combinators::create(&ctx, || "12".parse::<u8>());
/// assert_eq!(parsed.get_timeout(Duration::from_secs(5)).unwrap(), 12);
/// ```
pub fn create<V, E, F>(ctx: &Context, computation: F) -> Promise<V>
where
    V: Clone + Send + 'static,
    E: Into<Box<dyn StdError + Send + Sync>>,
    F: FnOnce() -> Result<V, E> + Send + 'static,
{
    let promise = Promise::new(ctx);
    let target = promise.clone();
    ctx.submit(Box::new(move || {
        let result = match guard(computation) {
            Ok(result) => Try::from(result),
            Err(panicked) => Try::Failure(Arc::new(panicked)),
        };
        target.complete(result);
    }));
    promise
}

/// A promise whose value can be discarded, so promises of different types
/// can be waited on together.
pub trait Joinable {
    fn as_unit(&self) -> Promise<()>;
}

impl<V: Clone + Send + 'static> Joinable for Promise<V> {
    fn as_unit(&self) -> Promise<()> {
        self.map(|_| ())
    }
}

/// Succeeds once every input has succeeded, fails as soon as any fails.
///
/// # Examples
///
/// ```
/// use promise_chain::{combinators, Context, Promise};
/// use std::time::Duration;
///
/// let ctx = Context::with_config(Default::default()).unwrap();
/// let number = combinators::create(&ctx, || Ok::<_, String>(1));
/// let text = combinators::create(&ctx, || Ok::<_, String>("one".to_string()));
/// let both = combinators::join(&ctx, &[&number, &text]);
/// assert!(both.get_timeout(Duration::from_secs(5)).is_ok());
/// ```
pub fn join(ctx: &Context, futures: &[&dyn Joinable]) -> Promise<()> {
    let units: Vec<Promise<()>> = futures.iter().map(|future| future.as_unit()).collect();
    sequence(ctx, units).map(|_| ())
}

struct Gather<V> {
    items: Vec<Option<V>>,
    completed: usize,
}

/// Collects the values of `list` in input order, whatever order they
/// complete in.
///
/// The first failure fails the whole sequence; values arriving after that
/// are ignored. An empty list succeeds immediately with an empty vector.
pub fn sequence<V, I>(ctx: &Context, list: I) -> Promise<Vec<V>>
where
    V: Clone + Send + 'static,
    I: IntoIterator<Item = Promise<V>>,
{
    let inputs: Vec<Promise<V>> = list.into_iter().collect();
    let aggregate = Promise::new(ctx);
    let count = inputs.len();
    if count == 0 {
        aggregate.success(Vec::new());
        return aggregate;
    }

    let gather = Arc::new(Mutex::new(Gather {
        items: (0..count).map(|_| None).collect(),
        completed: 0,
    }));
    for (index, input) in inputs.iter().enumerate() {
        let gather = gather.clone();
        let target = aggregate.clone();
        input.on_complete(move |result| match result {
            Try::Success(value) => {
                let finished = {
                    let mut gather = gather.lock();
                    gather.items[index] = Some(value);
                    gather.completed += 1;
                    trace!("sequence {}/{} complete", gather.completed, count);
                    if gather.completed == count {
                        Some(gather.items.iter_mut().filter_map(Option::take).collect::<Vec<_>>())
                    } else {
                        None
                    }
                };
                if let Some(values) = finished {
                    target.success(values);
                }
            }
            Try::Failure(cause) => {
                target.complete(Try::Failure(cause));
            }
        });
    }
    aggregate
}
