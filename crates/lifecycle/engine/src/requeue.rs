//! Requeue decisions handed back to the controller

use lifecycle_types::State;
use std::time::Duration;

/// When the controller should look at a Kyma again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Only on the next watch event
    Never,
    /// Right away, the pass changed something the next pass depends on
    Immediately,
    After(Duration),
}

/// Requeue intervals per outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeueIntervals {
    pub success: Duration,
    pub busy: Duration,
    pub error: Duration,
    pub warning: Duration,
}

impl Default for RequeueIntervals {
    fn default() -> Self {
        Self {
            success: Duration::from_secs(30),
            busy: Duration::from_secs(5),
            error: Duration::from_secs(2),
            warning: Duration::from_secs(30),
        }
    }
}

impl RequeueIntervals {
    /// Interval after a pass that ended in `state`
    pub fn for_state(&self, state: State) -> Duration {
        match state {
            State::Ready => self.success,
            State::Warning => self.warning,
            State::Error => self.error,
            _ => self.busy,
        }
    }
}
