//! Fault injection for the inventory consumer.
//!
//! An added delay and a forced-failure switch are configuration inputs read
//! at startup. The consumer reads the current value once per message, so a
//! test (or an operator hook) can flip them while the consumer runs.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Fault-injection settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultInjection {
    /// Latency added before each reservation
    pub delay: Duration,
    /// Fail every reservation with `forced_failure`
    pub force_failure: bool,
}

impl FaultInjection {
    /// No injected faults.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            delay: Duration::ZERO,
            force_failure: false,
        }
    }

    /// Settings from a delay in milliseconds and a fail-mode flag.
    #[must_use]
    pub const fn new(delay_ms: u64, force_failure: bool) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            force_failure,
        }
    }
}

/// Shared, updatable fault-injection settings.
///
/// Clones observe the same value.
#[derive(Clone, Debug)]
pub struct FaultSwitch {
    sender: Arc<watch::Sender<FaultInjection>>,
}

impl FaultSwitch {
    /// Create a switch with initial settings.
    #[must_use]
    pub fn new(initial: FaultInjection) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Settings in effect right now.
    #[must_use]
    pub fn current(&self) -> FaultInjection {
        *self.sender.borrow()
    }

    /// Replace the settings.
    pub fn set(&self, faults: FaultInjection) {
        self.sender.send_replace(faults);
    }

    /// Apply the configured delay, if any, and return the settings used.
    pub async fn apply(&self) -> FaultInjection {
        let faults = self.current();
        if !faults.delay.is_zero() {
            tokio::time::sleep(faults.delay).await;
        }
        faults
    }
}

impl Default for FaultSwitch {
    fn default() -> Self {
        Self::new(FaultInjection::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_settings() {
        let switch = FaultSwitch::default();
        let observer = switch.clone();
        switch.set(FaultInjection::new(0, true));
        assert!(observer.current().force_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_sleeps_for_delay() {
        let switch = FaultSwitch::new(FaultInjection::new(250, false));
        let started = tokio::time::Instant::now();
        let faults = switch.apply().await;
        assert_eq!(faults.delay, Duration::from_millis(250));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }
}
