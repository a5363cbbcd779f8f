use std::error::Error as StdError;
use std::sync::Arc;

use crate::Cause;

/// The result of a computation: a value, or the cause it failed with.
///
/// Unlike `Result`, the failure side is always a shared [`Cause`], so the
/// same failure can be handed to any number of listeners and children.
///
/// # Examples
///
/// ```
/// use promise_chain::Try;
///
/// let ok = Try::create(21).map(|x| x * 2);
/// assert_eq!(ok.value(), Some(&42));
///
/// let failed: Try<i32> = Try::failure("boom");
/// let mut called = false;
/// let failed = failed.map(|x| { called = true; x * 2 });
/// assert!(!called);
/// assert_eq!(failed.error().map(|e| e.to_string()), Some("boom".to_string()));
/// ```
#[derive(Debug, Clone)]
pub enum Try<V> {
    Success(V),
    Failure(Cause),
}

impl<V> Try<V> {
    pub fn create(value: V) -> Self {
        Try::Success(value)
    }

    /// A `Failure` when `error` is present, otherwise a `Success` of `value`.
    ///
    /// Lets a unit-valued computation report "no value" as a success.
    pub fn with_error(value: V, error: Option<Cause>) -> Self {
        match error {
            Some(cause) => Try::Failure(cause),
            None => Try::Success(value),
        }
    }

    pub fn failure<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Try::Failure(Arc::from(error.into()))
    }

    /// Transforms a success; a failure passes through and `f` is not called.
    pub fn map<T, F>(self, f: F) -> Try<T>
    where
        F: FnOnce(V) -> T,
    {
        match self {
            Try::Success(value) => Try::Success(f(value)),
            Try::Failure(cause) => Try::Failure(cause),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Try::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Try::Failure(_))
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            Try::Success(value) => Some(value),
            Try::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Cause> {
        match self {
            Try::Success(_) => None,
            Try::Failure(cause) => Some(cause),
        }
    }

    pub fn into_result(self) -> Result<V, Cause> {
        match self {
            Try::Success(value) => Ok(value),
            Try::Failure(cause) => Err(cause),
        }
    }
}

impl<V, E> From<Result<V, E>> for Try<V>
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn from(result: Result<V, E>) -> Self {
        match result {
            Ok(value) => Try::Success(value),
            Err(error) => Try::failure(error),
        }
    }
}
