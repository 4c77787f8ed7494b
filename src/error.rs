use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
	#[error("Timer interval must be positive, got {0:?}")]
	InvalidInterval(Duration),
	#[error("Failed to start timer runtime: {0}")]
	Runtime(String),
}
