//! Adaptive poller
//!
//! Runs a poll source on a background task and hands payloads either to a
//! single waiter ([`AdaptivePoller::wait_for_payload`]) or to a subscriber
//! callback ([`AdaptivePoller::subscribe`]).
//!
//! # Lifecycle
//!
//! ```text
//! ┌──────┐  wait / subscribe  ┌─────────┐  stop / shutdown  ┌──────────┐  loop exits  ┌─────────┐
//! │ Idle │ ─────────────────► │ Running │ ────────────────► │ Stopping │ ───────────► │ Stopped │
//! └──────┘                    └─────────┘                   └──────────┘              └─────────┘
//!     ▲                            │
//!     └────────────────────────────┘
//!      payload delivered to waiter,
//!      unsubscribe, waiter dropped
//! ```
//!
//! A poll or callback failure moves a running poller straight to `Stopped`.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};
use uuid::Uuid;

use crate::backoff::BackoffSchedule;
use crate::config::PollerConfig;
use crate::error::{panic_message, BoxError, PollerError};
use crate::shutdown::{ShutdownListener, ShutdownSignal};
use crate::source::{PollLock, PollResult, PollSource};

/// Poller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    /// No poll loop is running
    Idle,
    /// A poll loop is running for a waiter or a subscriber
    Running,
    /// Stop requested, waiting for the poll loop to exit
    Stopping,
    /// Stopped for good
    Stopped,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result returned by subscriber callbacks
pub type CallbackResult = Result<(), BoxError>;

/// Subscriber callback type
type Subscriber<T> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = CallbackResult> + Send>> + Send + Sync>;

/// Identifies the active subscription of a poller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: Uuid,
    poller: String,
}

impl SubscriptionHandle {
    /// Subscription ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the poller the subscription belongs to
    pub fn poller_name(&self) -> &str {
        &self.poller
    }
}

/// Point-in-time view of a poller's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerStats {
    pub state: PollerState,
    pub empty_polls: u64,
    pub payload_polls: u64,
    pub current_delay_ms: u64,
}

/// Builder for [`AdaptivePoller`]
pub struct PollerBuilder<T> {
    source: Arc<dyn PollSource<T>>,
    config: PollerConfig,
    name: Option<String>,
    shutdown: Option<ShutdownSignal>,
    poll_lock: Option<PollLock>,
}

impl<T: Send + 'static> PollerBuilder<T> {
    /// Set the poller configuration
    pub fn with_config(mut self, config: PollerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the poller name used in logs
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Observe a shared shutdown signal
    pub fn with_shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    /// Serialize polls through a lock shared with other pollers
    pub fn with_poll_lock(mut self, lock: PollLock) -> Self {
        self.poll_lock = Some(lock);
        self
    }

    /// Validate the configuration and build the poller
    ///
    /// Nothing is polled until the first wait or subscription.
    pub fn build(self) -> Result<AdaptivePoller<T>, PollerError> {
        self.config.validate()?;

        let name = self
            .name
            .unwrap_or_else(|| format!("poller-{}", Uuid::now_v7()));
        let initial_delay = self.config.initial_delay;

        Ok(AdaptivePoller {
            shared: Arc::new(Shared {
                name,
                config: self.config,
                source: self.source,
                poll_lock: self.poll_lock.unwrap_or_default(),
                shutdown: self.shutdown,
                stop: CancellationToken::new(),
                disposed: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle {
                    state: PollerState::Idle,
                    consumer: None,
                    episode: None,
                    next_episode: 0,
                }),
                parked: Mutex::new(None),
                failure: Mutex::new(None),
                empty_polls: AtomicU64::new(0),
                payload_polls: AtomicU64::new(0),
                current_delay_ms: AtomicU64::new(as_millis(initial_delay)),
            }),
        })
    }
}

/// Adaptive poll-to-push adapter
///
/// Polls a [`PollSource`] on a background task. Empty polls back off
/// according to [`PollerConfig`]; every payload resets the delay.
///
/// # Example
///
/// ```ignore
/// use everruns_poller::{poll_fn, AdaptivePoller, PollResult, PollerConfig};
///
/// let poller = AdaptivePoller::new(
///     poll_fn(move || Ok(PollResult::from(queue.try_pop()))),
///     PollerConfig::new(Duration::from_millis(500)),
/// )?;
///
/// // One-shot
/// let next = poller.wait_for_payload().await?;
///
/// // Or continuous; the next poll waits for the callback to finish
/// let handle = poller.subscribe(|message| async move {
///     process(message).await?;
///     Ok(())
/// })?;
///
/// poller.unsubscribe(handle).await?;
/// poller.shutdown().await?;
/// ```
pub struct AdaptivePoller<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> AdaptivePoller<T> {
    /// Create a poller with the given source and configuration
    pub fn new<S>(source: S, config: PollerConfig) -> Result<Self, PollerError>
    where
        S: PollSource<T> + 'static,
    {
        Self::builder(source).with_config(config).build()
    }

    /// Start building a poller for the given source
    pub fn builder<S>(source: S) -> PollerBuilder<T>
    where
        S: PollSource<T> + 'static,
    {
        PollerBuilder {
            source: Arc::new(source),
            config: PollerConfig::default(),
            name: None,
            shutdown: None,
            poll_lock: None,
        }
    }

    /// Wait for the next payload
    ///
    /// Returns `Ok(None)` if the poller is stopped, either locally or via the
    /// shutdown signal, before a payload arrives. A poll failure is returned
    /// as an error and stops the poller.
    ///
    /// Only one caller may wait at a time, and not while a subscription is
    /// active.
    #[instrument(skip(self), fields(poller = %self.shared.name))]
    pub async fn wait_for_payload(&self) -> Result<Option<T>, PollerError> {
        let presence = Arc::new(());

        let (episode, rx) = loop {
            let stale = {
                let mut lifecycle = self.shared.lifecycle.lock();
                self.shared.ensure_usable()?;

                match lifecycle.state {
                    PollerState::Stopping | PollerState::Stopped => return Ok(None),
                    PollerState::Running => match lifecycle.abandoned_episode() {
                        Some(episode) => {
                            debug!("Previous waiter went away, replacing its poll loop");
                            episode.token.cancel();
                            episode.handle.take()
                        }
                        None => return Err(lifecycle.busy_error()),
                    },
                    PollerState::Idle => {
                        if let Some(payload) = self.shared.parked.lock().take() {
                            debug!("Returning parked payload");
                            return Ok(Some(payload));
                        }

                        let (tx, rx) = oneshot::channel();
                        let episode = self.shared.start_episode(
                            &mut lifecycle,
                            Consumer::Waiter(Arc::downgrade(&presence)),
                            Delivery::Waiter(tx),
                        )?;
                        break (episode, rx);
                    }
                }
            };

            match stale {
                Some(handle) => self.shared.join_loop(handle).await,
                None => tokio::task::yield_now().await,
            }
        };

        match rx.await {
            Ok(result) => result,
            // The loop task went away without answering
            Err(_) => self.shared.abort_episode(episode).await,
        }
    }

    /// Register a callback for every payload
    ///
    /// Returns immediately. The callback runs on the poll loop, and the next
    /// poll starts only after the callback's future completes, so a slow
    /// consumer slows polling down. Spawn inside the callback for concurrent
    /// processing.
    ///
    /// A callback error or panic stops the poller; the failure is logged and
    /// returned by the next call on this poller.
    pub fn subscribe<F, Fut>(&self, callback: F) -> Result<SubscriptionHandle, PollerError>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        let callback: Subscriber<T> = Arc::new(move |payload| Box::pin(callback(payload)));

        let mut lifecycle = self.shared.lifecycle.lock();
        self.shared.ensure_usable()?;

        match lifecycle.state {
            PollerState::Stopping | PollerState::Stopped => return Err(PollerError::Stopped),
            PollerState::Running => return Err(lifecycle.busy_error()),
            PollerState::Idle => {}
        }

        let id = Uuid::now_v7();
        self.shared.start_episode(
            &mut lifecycle,
            Consumer::Subscriber(id),
            Delivery::Subscriber { id, callback },
        )?;

        info!(poller = %self.shared.name, subscription = %id, "Subscribed");
        Ok(SubscriptionHandle {
            id,
            poller: self.shared.name.clone(),
        })
    }

    /// End a subscription
    ///
    /// Waits for the poll loop to exit, so the callback is not invoked again
    /// once this returns. The poller goes back to `Idle`.
    #[instrument(skip(self, handle), fields(poller = %self.shared.name, subscription = %handle.id))]
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), PollerError> {
        let join = {
            let mut lifecycle = self.shared.lifecycle.lock();
            self.shared.ensure_usable()?;

            let active = matches!(
                lifecycle.consumer,
                Some(Consumer::Subscriber(id)) if id == handle.id
            );
            let episode = match lifecycle.episode.as_mut() {
                Some(episode) if active => episode,
                _ => return Err(PollerError::UnknownSubscription(handle.id)),
            };

            episode.token.cancel();
            episode.handle.take()
        };

        if let Some(join) = join {
            self.shared.join_loop(join).await;
        }

        debug!("Unsubscribed");
        Ok(())
    }

    /// Request the poll loop to stop
    ///
    /// Idempotent and callable from any task. A sleeping loop wakes up
    /// immediately; a loop in the middle of a poll or callback exits once
    /// that finishes. A stopped poller cannot be restarted.
    pub fn stop(&self) {
        let mut lifecycle = self.shared.lifecycle.lock();
        if !self.shared.stop.is_cancelled() {
            info!(poller = %self.shared.name, state = %lifecycle.state, "Stopping poller");
        }
        self.shared.stop.cancel();

        lifecycle.state = match lifecycle.state {
            PollerState::Running => PollerState::Stopping,
            PollerState::Idle => PollerState::Stopped,
            other => other,
        };
    }

    /// Stop the poller, wait for the poll loop to exit and release it
    ///
    /// Returns a failure recorded by a subscription that has not been
    /// reported yet. Further waits and subscriptions fail with
    /// [`PollerError::Disposed`].
    #[instrument(skip(self), fields(poller = %self.shared.name))]
    pub async fn shutdown(&self) -> Result<(), PollerError> {
        self.stop();
        let first = !self.shared.disposed.swap(true, Ordering::SeqCst);

        let join = self
            .shared
            .lifecycle
            .lock()
            .episode
            .as_mut()
            .and_then(|episode| episode.handle.take());
        if let Some(join) = join {
            self.shared.join_loop(join).await;
        }

        if first {
            info!(
                empty_polls = self.empty_poll_count(),
                payload_polls = self.payload_poll_count(),
                "Poller shut down"
            );
        }

        match self.shared.failure.lock().take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Poller name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Poller configuration
    pub fn config(&self) -> &PollerConfig {
        &self.shared.config
    }

    /// Lock used to serialize polls; clone it into other pollers to share it
    pub fn poll_lock(&self) -> &PollLock {
        &self.shared.poll_lock
    }

    /// Current lifecycle state
    pub fn state(&self) -> PollerState {
        self.shared.lifecycle.lock().state
    }

    /// Check whether a subscription is active
    pub fn is_subscribed(&self) -> bool {
        matches!(
            self.shared.lifecycle.lock().consumer,
            Some(Consumer::Subscriber(_))
        )
    }

    /// Number of polls that came back empty
    pub fn empty_poll_count(&self) -> u64 {
        self.shared.empty_polls.load(Ordering::Relaxed)
    }

    /// Number of polls that produced a payload
    pub fn payload_poll_count(&self) -> u64 {
        self.shared.payload_polls.load(Ordering::Relaxed)
    }

    /// Delay the loop will sleep after its next empty poll
    pub fn current_delay(&self) -> Duration {
        Duration::from_millis(self.shared.current_delay_ms.load(Ordering::Relaxed))
    }

    /// Snapshot of state and counters
    pub fn stats(&self) -> PollerStats {
        PollerStats {
            state: self.state(),
            empty_polls: self.empty_poll_count(),
            payload_polls: self.payload_poll_count(),
            current_delay_ms: self.shared.current_delay_ms.load(Ordering::Relaxed),
        }
    }
}

impl<T> Drop for AdaptivePoller<T> {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

impl<T> fmt::Debug for AdaptivePoller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptivePoller")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// Who is consuming payloads from the running episode
enum Consumer {
    /// Dead once the waiting future has been dropped
    Waiter(Weak<()>),
    Subscriber(Uuid),
}

impl Consumer {
    fn label(&self) -> &'static str {
        match self {
            Self::Waiter(_) => "wait",
            Self::Subscriber(_) => "subscribe",
        }
    }
}

struct Episode {
    id: u64,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Lifecycle {
    state: PollerState,
    consumer: Option<Consumer>,
    episode: Option<Episode>,
    next_episode: u64,
}

impl Lifecycle {
    fn busy_error(&self) -> PollerError {
        match self.consumer {
            Some(Consumer::Subscriber(_)) => PollerError::AlreadySubscribed,
            _ => PollerError::WaitInProgress,
        }
    }

    /// Running episode whose waiter has gone away
    fn abandoned_episode(&mut self) -> Option<&mut Episode> {
        match &self.consumer {
            Some(Consumer::Waiter(presence)) if presence.strong_count() == 0 => {
                self.episode.as_mut()
            }
            _ => None,
        }
    }
}

enum Delivery<T> {
    Waiter(oneshot::Sender<Result<Option<T>, PollerError>>),
    Subscriber { id: Uuid, callback: Subscriber<T> },
}

/// Why a poll loop episode ended
enum EpisodeEnd<T> {
    /// Payload for the waiter
    Delivered(T),
    /// Local stop or unsubscribe
    Cancelled,
    /// Shared shutdown signal
    Shutdown,
    /// The waiter dropped its future
    Abandoned,
    Failed(PollerError),
}

struct Shared<T> {
    name: String,
    config: PollerConfig,
    source: Arc<dyn PollSource<T>>,
    poll_lock: PollLock,
    shutdown: Option<ShutdownSignal>,
    /// Parent of every episode token; cancelled exactly once
    stop: CancellationToken,
    disposed: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    /// Payload acquired after its waiter went away
    parked: Mutex<Option<T>>,
    /// Subscription failure not yet reported to the caller
    failure: Mutex<Option<PollerError>>,
    empty_polls: AtomicU64,
    payload_polls: AtomicU64,
    current_delay_ms: AtomicU64,
}

impl<T: Send + 'static> Shared<T> {
    fn ensure_usable(&self) -> Result<(), PollerError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(PollerError::Disposed);
        }
        match self.failure.lock().take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn start_episode(
        self: &Arc<Self>,
        lifecycle: &mut Lifecycle,
        consumer: Consumer,
        delivery: Delivery<T>,
    ) -> Result<u64, PollerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PollerError::NoRuntime)?;

        lifecycle.next_episode += 1;
        let id = lifecycle.next_episode;
        let token = self.stop.child_token();
        let backlog = self.parked.lock().take();

        let span = info_span!(
            "poll_loop",
            poller = %self.name,
            episode = id,
            mode = consumer.label()
        );
        let shared = Arc::clone(self);
        let loop_token = token.clone();
        let handle = runtime.spawn(
            async move {
                let mut delivery = delivery;
                let run = shared.poll_loop(&loop_token, &mut delivery, backlog);
                let end = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(end) => end,
                    Err(panic) => EpisodeEnd::Failed(PollerError::PollPanicked(panic_message(
                        panic.as_ref(),
                    ))),
                };
                shared.finish(id, end, delivery);
            }
            .instrument(span),
        );

        debug!(poller = %self.name, episode = id, mode = consumer.label(), "Poll loop started");
        lifecycle.state = PollerState::Running;
        lifecycle.consumer = Some(consumer);
        lifecycle.episode = Some(Episode {
            id,
            token,
            handle: Some(handle),
        });
        Ok(id)
    }

    async fn poll_loop(
        &self,
        token: &CancellationToken,
        delivery: &mut Delivery<T>,
        backlog: Option<T>,
    ) -> EpisodeEnd<T> {
        let mut backoff = BackoffSchedule::new(&self.config);
        let mut shutdown = self
            .shutdown
            .as_ref()
            .map_or_else(ShutdownListener::detached, ShutdownSignal::listener);
        self.record_delay(backoff.current());

        if let Some(payload) = backlog {
            debug!("Delivering parked payload");
            match delivery {
                Delivery::Waiter(_) => return EpisodeEnd::Delivered(payload),
                Delivery::Subscriber { callback, .. } => {
                    if let Err(e) = self.dispatch(callback, payload).await {
                        return EpisodeEnd::Failed(e);
                    }
                }
            }
        }

        loop {
            if token.is_cancelled() {
                debug!("Poll loop: stop requested");
                return EpisodeEnd::Cancelled;
            }
            if shutdown.is_triggered() {
                debug!("Poll loop: shutdown signaled");
                self.begin_stopping();
                return EpisodeEnd::Shutdown;
            }

            let result = match self.poll_once().await {
                Ok(result) => result,
                Err(e) => return EpisodeEnd::Failed(e),
            };

            match result {
                PollResult::Payload(payload) => {
                    backoff.reset();
                    self.record_delay(backoff.current());
                    let total = self.payload_polls.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(payload_polls = total, "Payload acquired");

                    // An acquired payload is always handed over, even if a
                    // stop arrived during the poll.
                    match delivery {
                        Delivery::Waiter(_) => return EpisodeEnd::Delivered(payload),
                        Delivery::Subscriber { callback, .. } => {
                            if let Err(e) = self.dispatch(callback, payload).await {
                                return EpisodeEnd::Failed(e);
                            }
                        }
                    }
                }
                PollResult::Empty => {
                    self.empty_polls.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff.current();
                    trace!(delay_ms = as_millis(delay), "No payload, backing off");

                    if let Some(end) = self.pause(delay, token, &mut shutdown, delivery).await {
                        return end;
                    }
                    self.record_delay(backoff.advance());
                }
            }
        }
    }

    /// Poll the source once under the poll lock
    async fn poll_once(&self) -> Result<PollResult<T>, PollerError> {
        let _guard = self.poll_lock.acquire().await;
        match AssertUnwindSafe(self.source.try_acquire())
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(PollerError::Poll),
            Err(panic) => Err(PollerError::PollPanicked(panic_message(panic.as_ref()))),
        }
    }

    /// Run the subscriber callback to completion
    async fn dispatch(&self, callback: &Subscriber<T>, payload: T) -> Result<(), PollerError> {
        let invocation = async move { callback(payload).await };
        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(result) => result.map_err(PollerError::Callback),
            Err(panic) => Err(PollerError::CallbackPanicked(panic_message(panic.as_ref()))),
        }
    }

    /// Sleep between empty polls
    ///
    /// Returns early with the reason if the episode must end.
    async fn pause(
        &self,
        delay: Duration,
        token: &CancellationToken,
        shutdown: &mut ShutdownListener,
        delivery: &mut Delivery<T>,
    ) -> Option<EpisodeEnd<T>> {
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return None;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => None,
            _ = token.cancelled() => Some(EpisodeEnd::Cancelled),
            _ = shutdown.triggered() => {
                self.begin_stopping();
                Some(EpisodeEnd::Shutdown)
            }
            _ = waiter_gone(delivery) => Some(EpisodeEnd::Abandoned),
        }
    }

    /// Record how an episode ended and hand the outcome to the consumer
    fn finish(&self, episode: u64, end: EpisodeEnd<T>, delivery: Delivery<T>) {
        if matches!(end, EpisodeEnd::Shutdown | EpisodeEnd::Failed(_)) {
            self.stop.cancel();
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.episode.as_ref().is_some_and(|e| e.id == episode) {
                lifecycle.episode = None;
                lifecycle.consumer = None;
                lifecycle.state = if self.stop.is_cancelled() {
                    PollerState::Stopped
                } else {
                    PollerState::Idle
                };
            }
        }

        match (end, delivery) {
            (EpisodeEnd::Delivered(payload), Delivery::Waiter(tx)) => {
                if let Err(Ok(Some(payload))) = tx.send(Ok(Some(payload))) {
                    warn!("Waiter went away before delivery, parking payload");
                    *self.parked.lock() = Some(payload);
                }
            }
            (EpisodeEnd::Delivered(payload), Delivery::Subscriber { .. }) => {
                *self.parked.lock() = Some(payload);
            }
            (EpisodeEnd::Failed(failure), Delivery::Waiter(tx)) => {
                error!(error = %failure, "Poll loop failed");
                if let Err(Err(failure)) = tx.send(Err(failure)) {
                    *self.failure.lock() = Some(failure);
                }
            }
            (EpisodeEnd::Failed(failure), Delivery::Subscriber { id, .. }) => {
                error!(
                    subscription = %id,
                    error = %failure,
                    "Poll loop failed, subscription stopped"
                );
                *self.failure.lock() = Some(failure);
            }
            (EpisodeEnd::Cancelled | EpisodeEnd::Shutdown, Delivery::Waiter(tx)) => {
                let _ = tx.send(Ok(None));
            }
            (EpisodeEnd::Cancelled | EpisodeEnd::Shutdown, Delivery::Subscriber { .. }) => {}
            (EpisodeEnd::Abandoned, _) => {
                debug!("Waiter went away, poll loop ended");
            }
        }

        debug!(
            empty_polls = self.empty_polls.load(Ordering::Relaxed),
            payload_polls = self.payload_polls.load(Ordering::Relaxed),
            "Poll loop exited"
        );
    }

    /// Clean up after an episode whose task died before reporting
    async fn abort_episode(&self, episode: u64) -> Result<Option<T>, PollerError> {
        let handle = {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.episode.as_ref().is_some_and(|e| e.id == episode) {
                None
            } else {
                let handle = lifecycle.episode.take().and_then(|mut e| e.handle.take());
                lifecycle.consumer = None;
                lifecycle.state = PollerState::Stopped;
                self.stop.cancel();
                handle
            }
        };

        if let Some(handle) = handle {
            self.join_loop(handle).await;
        }
        match self.failure.lock().take() {
            Some(failure) => Err(failure),
            None if self.stop.is_cancelled() => Ok(None),
            None => Err(PollerError::PollPanicked(
                "poll loop exited without a result".to_string(),
            )),
        }
    }

    /// Stop the instance after the shutdown signal fired
    fn begin_stopping(&self) {
        self.stop.cancel();
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == PollerState::Running {
            lifecycle.state = PollerState::Stopping;
        }
    }

    async fn join_loop(&self, handle: JoinHandle<()>) {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(poller = %self.name, "Poll loop task panicked");
                *self.failure.lock() = Some(PollerError::PollPanicked(panic_message(
                    e.into_panic().as_ref(),
                )));
            }
        }
    }

    fn record_delay(&self, delay: Duration) {
        self.current_delay_ms.store(as_millis(delay), Ordering::Relaxed);
    }
}

/// Resolve when the waiter of a wait-mode episode drops its future
async fn waiter_gone<T>(delivery: &mut Delivery<T>) {
    match delivery {
        Delivery::Waiter(tx) => tx.closed().await,
        Delivery::Subscriber { .. } => std::future::pending().await,
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::poll_fn;

    fn config() -> PollerConfig {
        PollerConfig::new(Duration::from_millis(100))
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PollerState::Idle.to_string(), "idle");
        assert_eq!(PollerState::Stopping.to_string(), "stopping");
        assert_eq!(
            serde_json::to_value(PollerState::Running).unwrap(),
            serde_json::json!("running")
        );
    }

    #[test]
    fn test_build_validates_config() {
        let result = AdaptivePoller::<u32>::new(
            poll_fn(|| Ok(PollResult::Empty)),
            PollerConfig::new(Duration::ZERO),
        );
        assert!(matches!(result, Err(PollerError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_defaults() {
        let poller = AdaptivePoller::<u32>::builder(poll_fn(|| Ok(PollResult::Empty)))
            .with_config(config())
            .build()
            .unwrap();

        assert!(poller.name().starts_with("poller-"));
        assert_eq!(poller.state(), PollerState::Idle);
        assert_eq!(poller.empty_poll_count(), 0);
        assert_eq!(poller.payload_poll_count(), 0);
        assert_eq!(poller.current_delay(), Duration::ZERO);
        assert!(!poller.is_subscribed());
    }

    #[test]
    fn test_subscribe_without_runtime() {
        let poller =
            AdaptivePoller::<u32>::new(poll_fn(|| Ok(PollResult::Empty)), config()).unwrap();

        let result = poller.subscribe(|_| async { Ok(()) });
        assert!(matches!(result, Err(PollerError::NoRuntime)));
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[test]
    fn test_stop_from_idle() {
        let poller =
            AdaptivePoller::<u32>::new(poll_fn(|| Ok(PollResult::Empty)), config()).unwrap();

        poller.stop();
        poller.stop();
        assert_eq!(poller.state(), PollerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_first_payload() {
        let poller = AdaptivePoller::builder(poll_fn(|| Ok(PollResult::Payload(7u32))))
            .with_name("unit")
            .with_config(config())
            .build()
            .unwrap();

        assert_eq!(poller.wait_for_payload().await.unwrap(), Some(7));
        assert_eq!(poller.payload_poll_count(), 1);
        assert_eq!(poller.empty_poll_count(), 0);
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_snapshot() {
        let poller =
            AdaptivePoller::new(poll_fn(|| Ok(PollResult::Payload(1u8))), config()).unwrap();
        poller.wait_for_payload().await.unwrap();

        let stats = poller.stats();
        assert_eq!(
            stats,
            PollerStats {
                state: PollerState::Idle,
                empty_polls: 0,
                payload_polls: 1,
                current_delay_ms: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_payload_served_first() {
        let poller =
            AdaptivePoller::new(poll_fn(|| Ok(PollResult::Payload(2u32))), config()).unwrap();
        *poller.shared.parked.lock() = Some(1);

        assert_eq!(poller.wait_for_payload().await.unwrap(), Some(1));
        assert_eq!(poller.wait_for_payload().await.unwrap(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_loop_task_reported_as_panic() {
        let poller =
            AdaptivePoller::<u32>::new(poll_fn(|| Ok(PollResult::Empty)), config()).unwrap();
        let handle = tokio::spawn(async { panic!("loop task blew up") });
        {
            let mut lifecycle = poller.shared.lifecycle.lock();
            lifecycle.state = PollerState::Running;
            lifecycle.episode = Some(Episode {
                id: 7,
                token: poller.shared.stop.child_token(),
                handle: Some(handle),
            });
        }

        match poller.shared.abort_episode(7).await {
            Err(PollerError::PollPanicked(message)) => {
                assert!(message.contains("loop task blew up"))
            }
            other => panic!("expected PollPanicked, got {other:?}"),
        }
        assert_eq!(poller.state(), PollerState::Stopped);
        assert!(poller.shutdown().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_signal_marks_stopping() {
        let signal = ShutdownSignal::new();
        let poller = AdaptivePoller::<u32>::builder(poll_fn(|| Ok(PollResult::Empty)))
            .with_config(config())
            .with_shutdown_signal(signal.clone())
            .build()
            .unwrap();
        poller.shared.lifecycle.lock().state = PollerState::Running;

        signal.trigger();
        poller.shared.begin_stopping();

        assert_eq!(poller.state(), PollerState::Stopping);
        assert!(poller.shared.stop.is_cancelled());
    }
}
