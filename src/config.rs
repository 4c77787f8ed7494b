use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Describes a timer for [`crate::timer::TimerHandle::from_config`].
///
/// Durations use serde's `{ "secs": .., "nanos": .. }` form. `repeating` defaults to
/// `true` and `tolerance` to zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    pub interval: Duration,
    #[serde(default = "default_repeating")]
    pub repeating: bool,
    #[serde(default)]
    pub tolerance: Duration,
}

fn default_repeating() -> bool {
    true
}

impl TimerConfig {
    pub fn new(interval: Duration) -> Self {
        TimerConfig {
            interval,
            repeating: default_repeating(),
            tolerance: Duration::ZERO,
        }
    }
}
