//! Best-effort booking notifications.
//!
//! The engine enqueues one [`Notification`] per recipient after a booking
//! commits. A single delivery worker drains the queue and hands each message
//! to a [`Notifier`]. Nothing here can fail or delay a booking: a full queue
//! drops the message, a failed delivery is logged and counted.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::model::Ms;
use crate::observability::{
    NOTIFICATIONS_DELIVERED_TOTAL, NOTIFICATIONS_DROPPED_TOTAL, NOTIFICATIONS_FAILED_TOTAL,
};

/// "`booker_name` booked the house for `[start, end)`", addressed to one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient_email: String,
    pub recipient_name: String,
    pub booker_name: String,
    pub start: Ms,
    pub end: Ms,
    pub note: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one message. `false` means it was not delivered.
    async fn notify(&self, notification: &Notification) -> bool;
}

/// Records every notification in the log. Stands in for a mail transport.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> bool {
        info!(
            recipient = %n.recipient_email,
            booker = %n.booker_name,
            start = n.start,
            end = n.end,
            note = n.note.as_deref().unwrap_or(""),
            "booking notification for {}",
            n.recipient_name
        );
        true
    }
}

/// Sending half of the notification queue. Cheap to clone.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Notification>,
}

impl Outbox {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a message without waiting. Returns `false` if it was dropped.
    pub fn enqueue(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                warn!("outbox full, dropping notification for {}", n.recipient_email);
                metrics::counter!(NOTIFICATIONS_DROPPED_TOTAL).increment(1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                warn!("delivery worker gone, dropping notification for {}", n.recipient_email);
                metrics::counter!(NOTIFICATIONS_DROPPED_TOTAL).increment(1);
                false
            }
        }
    }
}

/// Drain the queue until every [`Outbox`] is dropped.
pub async fn run_delivery_worker(mut rx: mpsc::Receiver<Notification>, notifier: Arc<dyn Notifier>) {
    while let Some(n) = rx.recv().await {
        if notifier.notify(&n).await {
            debug!("delivered notification to {}", n.recipient_email);
            metrics::counter!(NOTIFICATIONS_DELIVERED_TOTAL).increment(1);
        } else {
            error!("failed to deliver notification to {}", n.recipient_email);
            metrics::counter!(NOTIFICATIONS_FAILED_TOTAL).increment(1);
        }
    }
    debug!("outbox closed, delivery worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, n: &Notification) -> bool {
            self.seen.lock().unwrap().push(n.recipient_email.clone());
            self.fail_for.as_deref() != Some(n.recipient_email.as_str())
        }
    }

    fn note_for(email: &str) -> Notification {
        Notification {
            recipient_email: email.into(),
            recipient_name: "Bea".into(),
            booker_name: "Anna".into(),
            start: 0,
            end: 10,
            note: None,
        }
    }

    #[tokio::test]
    async fn worker_delivers_in_order_and_survives_failures() {
        let (outbox, rx) = Outbox::new(8);
        let recorder = Arc::new(Recorder {
            fail_for: Some("b@x".into()),
            ..Default::default()
        });
        let worker = tokio::spawn(run_delivery_worker(rx, recorder.clone()));

        assert!(outbox.enqueue(note_for("a@x")));
        assert!(outbox.enqueue(note_for("b@x")));
        assert!(outbox.enqueue(note_for("c@x")));
        drop(outbox);
        worker.await.unwrap();

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["a@x", "b@x", "c@x"]);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (outbox, _rx) = Outbox::new(1);
        assert!(outbox.enqueue(note_for("a@x")));
        assert!(!outbox.enqueue(note_for("b@x")));
    }

    #[test]
    fn worker_idles_until_something_is_queued() {
        let (outbox, rx) = Outbox::new(4);
        let recorder = Arc::new(Recorder::default());
        let mut worker = tokio_test::task::spawn(run_delivery_worker(rx, recorder.clone()));

        tokio_test::assert_pending!(worker.poll());
        assert!(outbox.enqueue(note_for("a@x")));
        assert!(worker.is_woken());
        tokio_test::assert_pending!(worker.poll());
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["a@x"]);

        drop(outbox);
        tokio_test::assert_ready!(worker.poll());
    }

    #[test]
    fn closed_queue_drops() {
        let (outbox, rx) = Outbox::new(4);
        drop(rx);
        assert!(!outbox.enqueue(note_for("a@x")));
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        assert!(LogNotifier.notify(&note_for("a@x")).await);
    }
}
