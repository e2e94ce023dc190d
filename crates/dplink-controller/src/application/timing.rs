//! Timing constants, expressed in multiples of one configurable time unit.
//!
//! Production runs with a one-second unit.  Tests shrink nothing: they run
//! on tokio's paused clock, so a five-unit wait completes instantly while
//! keeping the exact ordering of timers.

use std::time::Duration;

/// Upper bound for the post-hpd-high notification delay.
pub const MAX_NOTIFICATION_DELAY: Duration = Duration::from_secs(5);

/// Upper bound for the disconnect settle delay.
pub const MAX_DISCONNECT_DELAY: Duration = Duration::from_secs(5);

/// Every delay and timeout used by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    unit: Duration,
    notification_delay: Duration,
    disconnect_delay: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::ZERO, Duration::ZERO)
    }
}

impl TimingConfig {
    /// Builds a timing set.  Delays above their caps are clamped.
    pub fn new(unit: Duration, notification_delay: Duration, disconnect_delay: Duration) -> Self {
        Self {
            unit,
            notification_delay: notification_delay.min(MAX_NOTIFICATION_DELAY),
            disconnect_delay: disconnect_delay.min(MAX_DISCONNECT_DELAY),
        }
    }

    pub fn unit(&self) -> Duration {
        self.unit
    }

    /// Delay between a successful bring-up and the connect notification.
    pub fn notification_delay(&self) -> Duration {
        self.notification_delay
    }

    /// Delay between the disconnect notification and the hardware teardown.
    pub fn disconnect_delay(&self) -> Duration {
        self.disconnect_delay
    }

    /// First acknowledgement window: 2 units.
    pub fn first_ack_wait(&self) -> Duration {
        self.unit * 2
    }

    /// Acknowledgement window after the single resend: 3 units.
    pub fn resend_ack_wait(&self) -> Duration {
        self.unit * 3
    }

    /// HDCP poll after a stream was enabled: 1/4 unit.
    pub fn hdcp_poll_after_enable(&self) -> Duration {
        self.unit / 4
    }

    /// HDCP poll after the engine reported a state change: 1/2 unit.
    pub fn hdcp_poll_after_status(&self) -> Duration {
        self.unit / 2
    }

    /// HDCP retry after a failure or a not-yet-ready sink: 1 unit.
    pub fn hdcp_retry(&self) -> Duration {
        self.unit
    }

    /// Settle delay once a slow sink reports HDCP-ready: 6 units.
    pub fn sink_sync_settle(&self) -> Duration {
        self.unit * 6
    }

    /// eDP power-rail poll interval: 1/20 unit.
    pub fn edp_rail_poll(&self) -> Duration {
        self.unit / 20
    }

    /// eDP power-rail settle bound: 1/2 unit.
    pub fn edp_rail_timeout(&self) -> Duration {
        self.unit / 2
    }
}
