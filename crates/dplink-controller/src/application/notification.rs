//! Notification channel: connect/disconnect delivery to the compositor.
//!
//! Delivery is at-least-once and best-effort:
//!
//! ```text
//! begin()            mark sent, reset completion
//! dispatch(ack)      (connection: compositor or MST topology callback)
//! await_ack()        wait 2 units ─ack─► Delivered
//!                        │ timeout
//!                        ▼
//!                    resend once, wait 3 units ─ack─► Delivered { resent }
//!                        │ timeout
//!                        ▼
//!                    Err(Timeout)   (notification stays marked sent)
//! ```
//!
//! The completion signal is a resettable one-shot built on a `watch`
//! channel, so an acknowledgement that arrives before the waiter subscribes
//! is never lost.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::hardware::HardwareError;
use super::timing::TimingConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification was not acknowledged after one resend")]
    Timeout,
    #[error("notification dispatch failed: {0}")]
    Dispatch(#[source] HardwareError),
}

/// What a `notify` call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The compositor already reflected the requested state.
    Unchanged,
    /// Sent without waiting (skip-wait, trusted UI, or MST connect).
    Sent,
    /// Sent and acknowledged.
    Delivered { resent: bool },
}

/// Resettable one-shot signal.
#[derive(Debug, Clone)]
pub struct Completion {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn reinit(&self) {
        self.tx.send_replace(false);
    }

    pub fn complete(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_complete(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until completed or `timeout` elapses.  Returns `true` on completion.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let acked = match tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) | Err(_) => false,
        };
        acked
    }

    pub fn handle(&self) -> AckHandle {
        AckHandle {
            completion: self.clone(),
        }
    }
}

/// Handed to the compositor with every dispatched event.
#[derive(Debug, Clone)]
pub struct AckHandle {
    completion: Completion,
}

impl AckHandle {
    /// Signals that the compositor processed the event.
    pub fn acknowledge(&self) {
        self.completion.complete();
    }
}

/// Per-connection notification bookkeeping.
#[derive(Debug)]
pub struct NotificationChannel {
    completion: Completion,
    sent: AtomicBool,
    first_wait: Duration,
    resend_wait: Duration,
}

impl NotificationChannel {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            completion: Completion::new(),
            sent: AtomicBool::new(false),
            first_wait: timing.first_ack_wait(),
            resend_wait: timing.resend_ack_wait(),
        }
    }

    /// Marks a notification as sent and resets the completion signal.
    ///
    /// Returns the handle to pass to the compositor with the event.
    pub fn begin(&self) -> AckHandle {
        self.sent.store(true, Ordering::SeqCst);
        self.completion.reinit();
        self.completion.handle()
    }

    /// Whether any notification was sent since construction.
    pub fn was_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }

    /// Waits for the acknowledgement, resending once on the first timeout.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::Timeout`] when neither window saw an
    /// acknowledgement.  A failed resend is logged and the second window is
    /// still awaited, since the original event may yet be acknowledged.
    pub async fn await_ack<F, Fut>(&self, resend: F) -> Result<NotifyOutcome, NotificationError>
    where
        F: FnOnce(AckHandle) -> Fut,
        Fut: Future<Output = Result<(), HardwareError>>,
    {
        if self.completion.wait_timeout(self.first_wait).await {
            return Ok(NotifyOutcome::Delivered { resent: false });
        }

        warn!(wait = ?self.first_wait, "notification not acknowledged; resending once");
        if let Err(e) = resend(self.completion.handle()).await {
            warn!("notification resend failed: {e}");
        }

        if self.completion.wait_timeout(self.resend_wait).await {
            debug!("notification acknowledged after resend");
            return Ok(NotifyOutcome::Delivered { resent: true });
        }

        warn!("notification acknowledgement timed out");
        Err(NotificationError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn channel() -> NotificationChannel {
        NotificationChannel::new(&TimingConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_within_first_window_is_delivered_without_resend() {
        // Arrange
        let chan = channel();
        let ack = chan.begin();
        let resends = AtomicUsize::new(0);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            ack.acknowledge();
        });

        // Act
        let outcome = chan
            .await_ack(|_| async {
                resends.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        // Assert
        assert_eq!(outcome, Ok(NotifyOutcome::Delivered { resent: false }));
        assert_eq!(resends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_after_first_window_triggers_exactly_one_resend() {
        let chan = channel();
        let ack = chan.begin();
        let resends = AtomicUsize::new(0);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            ack.acknowledge();
        });

        let outcome = chan
            .await_ack(|_| async {
                resends.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(outcome, Ok(NotifyOutcome::Delivered { resent: true }));
        assert_eq!(resends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ack_times_out_but_stays_marked_sent() {
        let chan = channel();
        let _ack = chan.begin();

        let outcome = chan.await_ack(|_| async { Ok(()) }).await;

        assert_eq!(outcome, Err(NotificationError::Timeout));
        assert!(chan.was_sent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_before_wait_is_not_lost() {
        let chan = channel();
        let ack = chan.begin();
        ack.acknowledge();

        let outcome = chan.await_ack(|_| async { Ok(()) }).await;

        assert_eq!(outcome, Ok(NotifyOutcome::Delivered { resent: false }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_reports_completion_and_expiry() {
        // Arrange
        let completion = Completion::new();

        // Act
        let before = completion.wait_timeout(Duration::from_millis(100)).await;
        completion.complete();
        let after = completion.wait_timeout(Duration::from_millis(100)).await;

        // Assert
        assert!(!before);
        assert!(after);
    }

    #[test]
    fn test_begin_resets_previous_completion() {
        let chan = channel();
        chan.begin().acknowledge();
        assert!(chan.completion.is_complete());

        chan.begin();

        assert!(!chan.completion.is_complete());
    }
}
