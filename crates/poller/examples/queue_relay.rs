//! Relays messages from an in-memory queue to a subscriber
//!
//! A producer pushes messages in bursts with quiet gaps in between; the
//! poller backs off during the gaps and catches up as soon as a burst lands.
//!
//! Run with:
//!   RUST_LOG=everruns_poller=debug,queue_relay=info cargo run -p everruns-poller --example queue_relay
//!
//! Configure via environment variables:
//! - POLLER_MAX_DELAY_MS, POLLER_INITIAL_DELAY_MS, ...: see `PollerConfig::from_env`
//! - RELAY_RUN_SECS: how long to run before shutting down (default: 10)

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use everruns_poller::{poll_fn, AdaptivePoller, PollResult, PollerConfig, ShutdownSignal};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct Message {
    seq: u64,
    body: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("everruns_poller=debug,queue_relay=info")),
        )
        .init();

    let run_for = std::env::var("RELAY_RUN_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(10));

    let queue: Arc<Mutex<VecDeque<Message>>> = Arc::default();
    let signal = ShutdownSignal::new();
    let _ctrl_c = signal.trigger_on_ctrl_c();

    let producer = tokio::spawn(produce(Arc::clone(&queue), signal.clone()));

    let source_queue = Arc::clone(&queue);
    let poller = AdaptivePoller::builder(poll_fn(move || {
        Ok(PollResult::from(source_queue.lock().pop_front()))
    }))
    .with_name("queue-relay")
    .with_config(PollerConfig::from_env())
    .with_shutdown_signal(signal.clone())
    .build()
    .context("Failed to build poller")?;

    let handle = poller
        .subscribe(|message: Message| async move {
            tracing::info!(seq = message.seq, body = %message.body, "Relayed message");
            // Simulated downstream latency; polling pauses meanwhile
            tokio::time::sleep(Duration::from_millis(25)).await;
            Ok(())
        })
        .context("Failed to subscribe")?;

    tracing::info!(run_secs = run_for.as_secs(), "Relay running, press Ctrl+C to stop");

    let deadline = tokio::time::Instant::now() + run_for;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    while !signal.is_triggered() && tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        let stats = poller.stats();
        tracing::info!(
            state = %stats.state,
            empty_polls = stats.empty_polls,
            payload_polls = stats.payload_polls,
            current_delay_ms = stats.current_delay_ms,
            backlog = queue.lock().len(),
            "Relay status"
        );
    }

    if poller.is_subscribed() {
        poller.unsubscribe(handle).await?;
    }
    signal.trigger();
    producer.await.context("Producer task failed")?;
    poller.shutdown().await?;

    tracing::info!(left_in_queue = queue.lock().len(), "Relay shutdown complete");
    Ok(())
}

/// Push bursts of messages with quiet periods in between
async fn produce(queue: Arc<Mutex<VecDeque<Message>>>, signal: ShutdownSignal) {
    let mut seq = 0;
    let mut burst = 1;

    while !signal.is_triggered() {
        {
            let mut queue = queue.lock();
            for _ in 0..burst {
                seq += 1;
                queue.push_back(Message {
                    seq,
                    body: format!("event #{seq}"),
                });
            }
        }
        tracing::debug!(burst, "Produced burst");

        burst = burst % 5 + 1;
        tokio::time::sleep(Duration::from_millis(400 * burst)).await;
    }
}
