//! Bounded event delivery between turn producers and one consumer.
//!
//! Every send is bounded by a timeout and the turn's cancellation token.
//! Events that cannot be delivered go to the [`DeadLetterQueue`], which is
//! drained by exactly one background task and never replayed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TurnError;
use crate::events::Event;
use crate::settings::DeliverySettings;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Cancelled,
    Timeout,
    ChannelClosed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::ChannelClosed => "channel_closed",
        }
    }
}

/// An event that could not be delivered to the live consumer.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub session_id: Option<Uuid>,
    pub event: Event,
    pub reason: DropReason,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Out-of-band consumer of dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, entry: &DeadLetter) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl DeadLetterSink for LogSink {
    async fn record(&self, entry: &DeadLetter) -> anyhow::Result<()> {
        warn!(
            session_id = ?entry.session_id,
            event_id = %entry.event.id,
            event_type = entry.event.event_type.as_str(),
            reason = entry.reason.as_str(),
            attempts = entry.attempts,
            kind = TurnError::DeliveryDropped.kind(),
            "event dead-lettered"
        );
        Ok(())
    }
}

/// Handle to the process-wide, unbounded dead-letter queue.
#[derive(Clone)]
pub struct DeadLetterQueue {
    tx: mpsc::UnboundedSender<DeadLetter>,
}

impl DeadLetterQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Create the queue and start its single drain task.
    pub fn spawn(sinks: Vec<Arc<dyn DeadLetterSink>>) -> (Self, JoinHandle<u64>) {
        let (queue, rx) = Self::channel();
        (queue, spawn_drain(rx, sinks))
    }

    pub fn push(&self, entry: DeadLetter) {
        metrics::counter!("events_dead_lettered_total", "reason" => entry.reason.as_str()).increment(1);
        if let Err(err) = self.tx.send(entry) {
            warn!(event_id = %err.0.event.id, "dead-letter drain is gone, entry lost");
        }
    }
}

/// Drain dead letters into `sinks` until every queue handle is dropped.
/// Resolves to the number of entries drained.
pub fn spawn_drain(
    mut rx: mpsc::UnboundedReceiver<DeadLetter>,
    sinks: Vec<Arc<dyn DeadLetterSink>>,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut drained = 0u64;
        while let Some(entry) = rx.recv().await {
            drained += 1;
            for sink in &sinks {
                if let Err(e) = sink.record(&entry).await {
                    warn!(error = %e, event_id = %entry.event.id, "dead-letter sink failed");
                }
            }
        }
        info!(drained, "dead-letter drain stopped");
        drained
    })
}

/// Producer side of a turn's event channel.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    dead_letters: DeadLetterQueue,
    settings: DeliverySettings,
    session_id: Option<Uuid>,
}

/// Create a bounded event channel for one turn.
pub fn channel(
    settings: DeliverySettings,
    cancel: CancellationToken,
    dead_letters: DeadLetterQueue,
) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(settings.capacity.max(1));
    let sender = EventSender { tx, cancel, dead_letters, settings, session_id: None };
    (sender, rx)
}

impl EventSender {
    pub fn for_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deliver once, waiting at most `send_timeout` for capacity.
    /// Failed events are dead-lettered.
    pub async fn send(&self, event: Event) -> bool {
        match self.attempt(event.stamped()).await {
            Ok(()) => true,
            Err((event, reason)) => {
                self.dead_letter(event, reason, 1);
                false
            }
        }
    }

    /// Deliver with up to `max_attempts` tries and a fixed backoff between
    /// them. Only a timed-out attempt is retried; the event is dead-lettered
    /// once, after the last failure.
    pub async fn send_with_retry(&self, event: Event, max_attempts: u32) -> bool {
        let max_attempts = max_attempts.max(1);
        let mut event = event.stamped();
        let mut attempt = 1;
        loop {
            let (returned, reason) = match self.attempt(event).await {
                Ok(()) => return true,
                Err(failure) => failure,
            };
            if reason != DropReason::Timeout || attempt >= max_attempts {
                self.dead_letter(returned, reason, attempt);
                return false;
            }
            debug!(
                event_id = %returned.id,
                attempt,
                max_attempts,
                "event channel full, backing off"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.dead_letter(returned, DropReason::Cancelled, attempt);
                    return false;
                }
                _ = tokio::time::sleep(self.settings.retry_backoff) => {}
            }
            event = returned;
            attempt += 1;
        }
    }

    /// Retrying send with the configured attempt budget.
    pub async fn emit(&self, event: Event) -> bool {
        self.send_with_retry(event, self.settings.max_attempts).await
    }

    async fn attempt(&self, event: Event) -> Result<(), (Event, DropReason)> {
        if self.cancel.is_cancelled() {
            return Err((event, DropReason::Cancelled));
        }
        let event = match self.tx.try_send(event) {
            Ok(()) => {
                metrics::counter!("events_delivered_total").increment(1);
                return Ok(());
            }
            Err(TrySendError::Closed(event)) => return Err((event, DropReason::ChannelClosed)),
            Err(TrySendError::Full(event)) => event,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err((event, DropReason::Cancelled)),
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(event);
                    metrics::counter!("events_delivered_total").increment(1);
                    Ok(())
                }
                Err(_) => Err((event, DropReason::ChannelClosed)),
            },
            _ = tokio::time::sleep(self.settings.send_timeout) => Err((event, DropReason::Timeout)),
        }
    }

    fn dead_letter(&self, event: Event, reason: DropReason, attempts: u32) {
        self.dead_letters.push(DeadLetter {
            session_id: self.session_id,
            event,
            reason,
            attempts,
            failed_at: Utc::now(),
        });
    }
}

/// Settings with a short timeout, for tests that exercise back-pressure.
#[cfg(test)]
pub fn test_settings(capacity: usize) -> DeliverySettings {
    DeliverySettings {
        capacity,
        send_timeout: std::time::Duration::from_millis(50),
        retry_backoff: std::time::Duration::from_millis(100),
        max_attempts: 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use std::sync::Mutex;
    use std::time::Duration;

    fn setup(capacity: usize) -> (EventSender, mpsc::Receiver<Event>, mpsc::UnboundedReceiver<DeadLetter>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (dlq, dlq_rx) = DeadLetterQueue::channel();
        let (tx, rx) = channel(test_settings(capacity), cancel.clone(), dlq);
        (tx, rx, dlq_rx, cancel)
    }

    fn drain_count(rx: &mut mpsc::UnboundedReceiver<DeadLetter>) -> Vec<DeadLetter> {
        let mut out = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            out.push(entry);
        }
        out
    }

    #[tokio::test]
    async fn send_stamps_and_delivers() {
        let (tx, mut rx, mut dlq, _cancel) = setup(4);
        assert!(tx.send(Event::progress("hello")).await);
        let got = rx.recv().await.unwrap();
        assert!(got.is_stamped());
        assert_eq!(got.event_type, EventType::Progress);
        assert!(drain_count(&mut dlq).is_empty());
    }

    #[tokio::test]
    async fn send_after_cancel_fails_fast() {
        let (tx, _rx, mut dlq, cancel) = setup(4);
        cancel.cancel();
        assert!(!tx.send(Event::progress("late")).await);
        let dead = drain_count(&mut dlq);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DropReason::Cancelled);
        assert!(dead[0].event.is_stamped());
    }

    #[tokio::test(start_paused = true)]
    async fn full_channel_cancelled_before_timeout_dead_letters_once() {
        let (tx, _rx, mut dlq, cancel) = setup(1);
        assert!(tx.send(Event::progress("fills")).await);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        assert!(!tx.send(Event::progress("blocked")).await);
        assert!(started.elapsed() < Duration::from_millis(50));

        let dead = drain_count(&mut dlq);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DropReason::Cancelled);
        assert_eq!(dead[0].event.message.as_deref(), Some("blocked"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_channel_times_out() {
        let (tx, _rx, mut dlq, _cancel) = setup(1);
        assert!(tx.send(Event::progress("fills")).await);
        assert!(!tx.send(Event::progress("blocked")).await);
        let dead = drain_count(&mut dlq);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DropReason::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_second_attempt_without_dead_letter() {
        let (tx, mut rx, mut dlq, _cancel) = setup(1);
        assert!(tx.send(Event::progress("fills")).await);

        // First attempt times out at 50ms; the consumer frees a slot during the backoff.
        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            let first = rx.recv().await;
            (first, rx)
        });

        assert!(tx.send_with_retry(Event::progress("second"), 3).await);
        let (first, mut rx) = consumer.await.unwrap();
        assert_eq!(first.unwrap().message.as_deref(), Some("fills"));
        assert_eq!(rx.recv().await.unwrap().message.as_deref(), Some("second"));
        assert!(drain_count(&mut dlq).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_dead_letters_exactly_once() {
        let (tx, _rx, mut dlq, _cancel) = setup(1);
        assert!(tx.send(Event::progress("fills")).await);
        assert!(!tx.send_with_retry(Event::progress("never"), 3).await);
        let dead = drain_count(&mut dlq);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].reason, DropReason::Timeout);
    }

    #[tokio::test]
    async fn closed_receiver_is_not_retried() {
        let (tx, rx, mut dlq, _cancel) = setup(1);
        drop(rx);
        assert!(!tx.send_with_retry(Event::progress("nobody"), 5).await);
        let dead = drain_count(&mut dlq);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DropReason::ChannelClosed);
        assert_eq!(dead[0].attempts, 1);
    }

    struct Collecting(Mutex<Vec<String>>);

    #[async_trait]
    impl DeadLetterSink for Collecting {
        async fn record(&self, entry: &DeadLetter) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(entry.event.id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn drain_feeds_every_sink_and_stops_with_last_handle() {
        let sink = Arc::new(Collecting(Mutex::new(Vec::new())));
        let (queue, handle) = DeadLetterQueue::spawn(vec![sink.clone(), Arc::new(LogSink)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = channel(test_settings(1), cancel, queue.clone());
        assert!(!tx.send(Event::progress("a")).await);
        assert!(!tx.send(Event::progress("b")).await);
        drop(tx);
        drop(queue);
        assert_eq!(handle.await.unwrap(), 2);
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }
}
