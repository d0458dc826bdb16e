//! Refresh timers driving periodic re-resolution.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Callback run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// A single re-armable countdown.
///
/// Implementations must never run `on_fire` from inside `enable` or
/// `disable`; callers may hold locks while arming.
pub trait RefreshTimer: Send {
    /// Arm the timer, replacing any previously armed countdown.
    fn enable(&mut self, delay: Duration, on_fire: TimerCallback);

    /// Disarm the timer. A disarmed timer never fires.
    fn disable(&mut self);

    /// True while a countdown is armed and has not fired.
    fn is_enabled(&self) -> bool;
}

/// Timer backed by a tokio task per countdown.
#[derive(Debug)]
pub struct TokioRefreshTimer {
    runtime: tokio::runtime::Handle,
    task: Option<JoinHandle<()>>,
}

impl TokioRefreshTimer {
    /// Create a disarmed timer whose countdowns run on `runtime`.
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self {
            runtime,
            task: None,
        }
    }
}

impl RefreshTimer for TokioRefreshTimer {
    fn enable(&mut self, delay: Duration, on_fire: TimerCallback) {
        self.disable();
        trace!(delay_ms = delay.as_millis() as u64, "arming refresh timer");
        self.task = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire();
        }));
    }

    fn disable(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn is_enabled(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for TokioRefreshTimer {
    fn drop(&mut self) {
        self.disable();
    }
}
