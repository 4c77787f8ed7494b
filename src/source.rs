use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Closure run by a timer source every time its deadline passes.
pub type EventHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// Creates the timer source backing a [`crate::timer::TimerHandle`]. Called at most once,
/// the first time the source is needed.
pub type SourceFactory = Box<dyn FnOnce() -> Box<dyn TimerSource> + Send + 'static>;

/// A low-level platform timer with strict suspend/resume balance.
///
/// A freshly created source is suspended. Implementations treat the following as fatal
/// and may abort the process:
///
/// * `resume` on a source that is already running,
/// * `suspend` on a source that is already suspended,
/// * releasing a source that is still suspended.
///
/// `cancel` itself is accepted in either state, so a suspended source must be resumed
/// after cancelling it and before it is dropped.
pub trait TimerSource: Send {
    /// Arms the source to first fire `after` from now and then every `repeating`, or only
    /// once when `repeating` is `None`.
    fn schedule(&mut self, after: Duration, repeating: Option<Duration>);
    /// Replaces the closure run on each fire.
    fn set_event_handler(&mut self, handler: EventHandler);
    fn resume(&mut self);
    fn suspend(&mut self);
    /// Stops all future fires. Irreversible.
    fn cancel(&mut self);
}

/// An event handler that does nothing.
pub fn noop_handler() -> EventHandler {
    Arc::new(|| {})
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
