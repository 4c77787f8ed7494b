//! A dispatch timer wrapper whose `resume` and `suspend` are safe to call repeatedly.
//!
//! Platform timer sources abort the process when their suspend and resume calls get out
//! of balance. [`timer::TimerHandle`] tracks the state itself, only forwards real
//! transitions to the source and tears the source down safely in either state.

pub mod config;
#[cfg(feature = "tokio-source")]
pub mod dispatch;
pub mod error;
pub mod source;
pub mod timer;
pub mod timer_trait;
