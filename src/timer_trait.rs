use serde::{Deserialize, Serialize};

/// Whether the underlying timer source is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerState {
	Suspended,
	Resumed,
}

pub trait Timer {
	/// Starts the timer. Does nothing if it is already running
	fn resume(&self);
	/// Pauses the timer. Does nothing if it is already paused
	fn suspend(&self);
	/// The state last set by `resume` or `suspend`
	fn state(&self) -> TimerState;
}
