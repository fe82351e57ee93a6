//! Poller errors

/// Boxed error returned by poll sources and subscriber callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// The poll source returned an error
    #[error("poll source failed: {0}")]
    Poll(#[source] BoxError),

    /// The subscriber callback returned an error
    #[error("subscriber callback failed: {0}")]
    Callback(#[source] BoxError),

    /// The poll source panicked
    #[error("poll source panicked: {0}")]
    PollPanicked(String),

    /// The subscriber callback panicked
    #[error("subscriber callback panicked: {0}")]
    CallbackPanicked(String),

    /// The poller was stopped and cannot start a new subscription
    #[error("poller is stopped")]
    Stopped,

    /// The poller was shut down and can no longer be used
    #[error("poller has been shut down")]
    Disposed,

    /// A subscription is already active on this poller
    #[error("a subscription is already active")]
    AlreadySubscribed,

    /// Another caller is already waiting on this poller
    #[error("another caller is already waiting for a payload")]
    WaitInProgress,

    /// The handle does not belong to the active subscription
    #[error("subscription {0} is not active")]
    UnknownSubscription(uuid::Uuid),

    /// No tokio runtime is available to run the poll loop
    #[error("no tokio runtime available to run the poll loop")]
    NoRuntime,

    /// Invalid configuration
    #[error("invalid poller configuration: {0}")]
    InvalidConfig(String),
}

impl PollerError {
    /// Whether this error was raised by the poll source or the callback,
    /// as opposed to a misuse of the poller API
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Poll(_) | Self::Callback(_) | Self::PollPanicked(_) | Self::CallbackPanicked(_)
        )
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(PollerError::Poll("boom".into()).is_fatal());
        assert!(PollerError::CallbackPanicked("boom".into()).is_fatal());
        assert!(!PollerError::Disposed.is_fatal());
        assert!(!PollerError::AlreadySubscribed.is_fatal());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_display() {
        let err = PollerError::Poll("queue unavailable".into());
        assert_eq!(err.to_string(), "poll source failed: queue unavailable");
    }
}
