//! Poll sources
//!
//! A poll source is the "check for work" half of the poller: it is asked for
//! a payload, answers immediately with one or with [`PollResult::Empty`], and
//! is never expected to block waiting for work to arrive.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::BoxError;

/// Outcome of a single poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult<T> {
    /// Nothing available right now
    Empty,
    /// A payload was acquired
    Payload(T),
}

impl<T> PollResult<T> {
    /// Check whether this poll produced a payload
    pub fn is_payload(&self) -> bool {
        matches!(self, Self::Payload(_))
    }

    /// Convert into an `Option`
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Empty => None,
            Self::Payload(payload) => Some(payload),
        }
    }
}

impl<T> From<Option<T>> for PollResult<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(payload) => Self::Payload(payload),
            None => Self::Empty,
        }
    }
}

/// Something that can be polled for payloads
///
/// Errors are fatal to the poll loop; return [`PollResult::Empty`] for the
/// ordinary "nothing yet" case.
#[async_trait]
pub trait PollSource<T>: Send + Sync {
    /// Try to acquire one payload
    async fn try_acquire(&self) -> Result<PollResult<T>, BoxError>;
}

#[async_trait]
impl<T, S> PollSource<T> for Arc<S>
where
    S: PollSource<T> + ?Sized,
    T: Send + 'static,
{
    async fn try_acquire(&self) -> Result<PollResult<T>, BoxError> {
        (**self).try_acquire().await
    }
}

/// Poll source backed by a synchronous closure, see [`poll_fn`]
pub struct PollFn<F> {
    f: F,
}

/// Create a poll source from a synchronous closure
///
/// # Example
///
/// ```
/// use everruns_poller::{poll_fn, PollResult};
/// use std::collections::VecDeque;
/// use std::sync::Mutex;
///
/// let queue = Mutex::new(VecDeque::from(vec!["a", "b"]));
/// let source = poll_fn(move || Ok(PollResult::from(queue.lock().unwrap().pop_front())));
/// # let _ = source;
/// ```
pub fn poll_fn<T, F>(f: F) -> PollFn<F>
where
    F: Fn() -> Result<PollResult<T>, BoxError> + Send + Sync,
{
    PollFn { f }
}

#[async_trait]
impl<T, F> PollSource<T> for PollFn<F>
where
    F: Fn() -> Result<PollResult<T>, BoxError> + Send + Sync,
    T: Send + 'static,
{
    async fn try_acquire(&self) -> Result<PollResult<T>, BoxError> {
        (self.f)()
    }
}

/// Lock serializing poll invocations
///
/// Every poller owns one by default. Clone a single lock into several pollers
/// when their sources share a resource that is not safe to poll concurrently.
/// The lock is held only while the source is being polled, never while the
/// loop sleeps.
#[derive(Debug, Clone, Default)]
pub struct PollLock {
    inner: Arc<Mutex<()>>,
}

impl PollLock {
    /// Create a new, unshared lock
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }

    /// Check whether two handles refer to the same lock
    pub fn is_shared_with(&self, other: &PollLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
