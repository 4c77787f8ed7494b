use crate::error::TimerError;
use crate::source::{lock, noop_handler, EventHandler, SourceFactory, TimerSource};
use crate::timer_trait::{Timer, TimerState};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[cfg(feature = "tokio-source")]
use crate::config::TimerConfig;
#[cfg(feature = "tokio-source")]
use crate::dispatch::{self, TokioTimerSource};

/// Callback run on each fire that is not suppressed by the tolerance budget.
pub type FireHandler = Arc<dyn Fn(&DispatchTimer) + Send + Sync + 'static>;

struct Lifecycle {
    state: TimerState,
    factory: Option<SourceFactory>,
    source: Option<Box<dyn TimerSource>>,
    closed: bool,
}

/// A timer source wrapper whose `resume` and `suspend` can be called any number of times.
///
/// The wrapped source is only told about actual state changes, so it never sees the
/// double resume or the suspended release that would abort the process. Owned through a
/// [`TimerHandle`]; fire handlers receive a reference to it.
pub struct DispatchTimer {
    interval: Duration,
    repeating: bool,
    tolerance: Mutex<Duration>,
    on_fire: Mutex<Option<FireHandler>>,
    lifecycle: Mutex<Lifecycle>,
    this: Weak<DispatchTimer>,
}

impl DispatchTimer {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn repeating(&self) -> bool {
        self.repeating
    }

    /// The remaining fire-skip budget.
    pub fn tolerance(&self) -> Duration {
        *lock(&self.tolerance)
    }

    /// Skips upcoming fires until `tolerance` is used up. Each fire consumes one
    /// `interval`, so about `ceil(tolerance / interval)` fires are skipped.
    pub fn set_tolerance(&self, tolerance: Duration) {
        *lock(&self.tolerance) = tolerance;
    }

    /// Replaces the fire callback; `None` clears it.
    pub fn set_on_fire(&self, handler: Option<FireHandler>) {
        *lock(&self.on_fire) = handler;
    }

    pub fn clear_on_fire(&self) {
        self.set_on_fire(None);
    }

    pub fn has_on_fire(&self) -> bool {
        lock(&self.on_fire).is_some()
    }

    /// Whether the timer has been torn down.
    pub fn is_closed(&self) -> bool {
        lock(&self.lifecycle).closed
    }

    /// Creates the underlying source now rather than on the first `resume`.
    ///
    /// Returns `false` once the timer has been torn down.
    pub fn materialize(&self) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        !lifecycle.closed && self.source(&mut lifecycle).is_some()
    }

    fn source<'a>(&self, lifecycle: &'a mut Lifecycle) -> Option<&'a mut Box<dyn TimerSource>> {
        if lifecycle.source.is_none() {
            let factory = lifecycle.factory.take()?;
            let mut source = factory();
            source.schedule(self.interval, self.repeating.then_some(self.interval));
            source.set_event_handler(self.event_handler());
            log::debug!(
                "Created timer source (interval {:?}, repeating {})",
                self.interval,
                self.repeating
            );
            lifecycle.source = Some(source);
        }
        lifecycle.source.as_mut()
    }

    /// The handler installed on the source. It only holds a weak reference, so the timer
    /// can be dropped while the source still exists.
    fn event_handler(&self) -> EventHandler {
        let timer = Weak::clone(&self.this);
        Arc::new(move || {
            if let Some(timer) = timer.upgrade() {
                timer.fire();
            }
        })
    }

    fn fire(&self) {
        {
            let mut tolerance = lock(&self.tolerance);
            if !tolerance.is_zero() {
                *tolerance = tolerance.saturating_sub(self.interval);
                log::trace!("Skipped timer fire, {:?} tolerance left", *tolerance);
                return;
            }
        }

        // Cloned out so the handler may call back into the timer.
        let handler = lock(&self.on_fire).clone();
        if let Some(handler) = handler {
            handler(self);
        }
    }

    /// Cancels and releases the source. A suspended source is resumed after cancelling
    /// it, since releasing it while suspended aborts.
    fn teardown(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.closed {
            return;
        }
        lifecycle.closed = true;
        lifecycle.factory = None;

        match lifecycle.source.take() {
            Some(mut source) => {
                source.set_event_handler(noop_handler());
                source.cancel();
                if lifecycle.state != TimerState::Resumed {
                    lifecycle.state = TimerState::Resumed;
                    source.resume();
                }
                drop(source);
                log::debug!("Released timer source");
            }
            None => lifecycle.state = TimerState::Resumed,
        }
        drop(lifecycle);

        self.clear_on_fire();
    }
}

impl Timer for DispatchTimer {
    fn resume(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.closed || lifecycle.state == TimerState::Resumed {
            return;
        }
        lifecycle.state = TimerState::Resumed;
        if let Some(source) = self.source(&mut lifecycle) {
            source.resume();
        }
    }

    fn suspend(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.closed || lifecycle.state == TimerState::Suspended {
            return;
        }
        lifecycle.state = TimerState::Suspended;
        if let Some(source) = self.source(&mut lifecycle) {
            source.suspend();
        }
    }

    fn state(&self) -> TimerState {
        lock(&self.lifecycle).state
    }
}

impl fmt::Debug for DispatchTimer {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("DispatchTimer")
            .field("interval", &self.interval)
            .field("repeating", &self.repeating)
            .field("tolerance", &self.tolerance())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Owns a [`DispatchTimer`] and tears it down when dropped.
pub struct TimerHandle {
    timer: Arc<DispatchTimer>,
}

impl TimerHandle {
    /// Creates a suspended timer firing every `interval` (or once, when `repeating` is
    /// false) on a tokio runtime: the caller's if there is one, a shared background
    /// runtime otherwise.
    ///
    /// # Errors
    ///
    /// * `TimerError::InvalidInterval` if `interval` is zero.
    /// * `TimerError::Runtime` if no runtime is available and the background one fails
    ///   to start.
    ///
    /// # Example
    ///
    /// ```rust
    /// use dispatch_timer::timer::TimerHandle;
    /// use dispatch_timer::timer_trait::{Timer, TimerState};
    /// use std::time::Duration;
    ///
    /// let timer = TimerHandle::new(Duration::from_secs(1), true, None).unwrap();
    /// timer.resume();
    /// timer.resume();
    /// assert_eq!(timer.state(), TimerState::Resumed);
    /// ```
    #[cfg(feature = "tokio-source")]
    pub fn new(
        interval: Duration,
        repeating: bool,
        handler: Option<FireHandler>,
    ) -> Result<Self, TimerError> {
        let runtime = dispatch::runtime_handle()?;
        Self::with_source(interval, repeating, handler, TokioTimerSource::factory(runtime))
    }

    /// Creates a timer from a deserialized [`TimerConfig`].
    ///
    /// # Arguments
    ///
    /// * `config` - Interval, repeat mode and initial tolerance of the timer.
    /// * `handler` - Optional callback run on every fire the tolerance does not skip.
    ///
    /// # Returns
    ///
    /// * `Ok(TimerHandle)` - A suspended timer whose `tolerance()` is `config.tolerance`.
    /// * `Err(TimerError)` - Same failures as [`TimerHandle::new`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use dispatch_timer::config::TimerConfig;
    /// use dispatch_timer::timer::TimerHandle;
    /// use std::time::Duration;
    ///
    /// let config = TimerConfig {
    ///     tolerance: Duration::from_secs(2),
    ///     ..TimerConfig::new(Duration::from_secs(1))
    /// };
    /// let timer = TimerHandle::from_config(&config, None).unwrap();
    /// assert_eq!(timer.tolerance(), Duration::from_secs(2));
    /// ```
    #[cfg(feature = "tokio-source")]
    pub fn from_config(
        config: &TimerConfig,
        handler: Option<FireHandler>,
    ) -> Result<Self, TimerError> {
        let handle = Self::new(config.interval, config.repeating, handler)?;
        handle.set_tolerance(config.tolerance);
        Ok(handle)
    }

    /// Creates a suspended timer backed by any [`TimerSource`].
    ///
    /// # Arguments
    ///
    /// * `interval` - Delay before the first fire and, for repeating timers, between fires.
    /// * `repeating` - Whether the source keeps firing after the first deadline.
    /// * `handler` - Optional callback run on every fire the tolerance does not skip.
    /// * `factory` - Builds the source. It runs at most once, on the first `resume` or
    ///   `materialize`, and never if the timer is dropped before either.
    ///
    /// # Returns
    ///
    /// * `Ok(TimerHandle)` - A timer in the `Suspended` state.
    /// * `Err(TimerError::InvalidInterval)` - If `interval` is zero.
    ///
    /// # Implementation Details
    ///
    /// - The source is scheduled once, right after it is built, and given an event handler
    ///   holding only a weak reference to the timer.
    /// - Only real `Suspended`/`Resumed` transitions reach the source.
    pub fn with_source(
        interval: Duration,
        repeating: bool,
        handler: Option<FireHandler>,
        factory: SourceFactory,
    ) -> Result<Self, TimerError> {
        if interval.is_zero() {
            return Err(TimerError::InvalidInterval(interval));
        }

        let timer = Arc::new_cyclic(|this| DispatchTimer {
            interval,
            repeating,
            tolerance: Mutex::new(Duration::ZERO),
            on_fire: Mutex::new(handler),
            lifecycle: Mutex::new(Lifecycle {
                state: TimerState::Suspended,
                factory: Some(factory),
                source: None,
                closed: false,
            }),
            this: Weak::clone(this),
        });
        Ok(TimerHandle { timer })
    }

    /// Tears the timer down now instead of when the handle is dropped.
    ///
    /// The source, if one was ever created, gets a no-op event handler and is cancelled,
    /// resumed if it was suspended, then released. The fire callback is cleared.
    /// Afterwards `resume` and `suspend` do nothing, `state()` reports `Resumed`, and
    /// further calls to `close` as well as the eventual drop are no-ops.
    ///
    /// # Example
    ///
    /// ```rust
    /// use dispatch_timer::timer::TimerHandle;
    /// use dispatch_timer::timer_trait::Timer;
    /// use std::time::Duration;
    ///
    /// let timer = TimerHandle::new(Duration::from_secs(1), true, None).unwrap();
    /// timer.resume();
    /// timer.suspend();
    /// timer.close();
    /// assert!(timer.is_closed());
    /// ```
    pub fn close(&self) {
        self.timer.teardown();
    }
}

impl Deref for TimerHandle {
    type Target = DispatchTimer;

    fn deref(&self) -> &DispatchTimer {
        &self.timer
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.timer.teardown();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&*self.timer, fmt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Schedule(Duration, Option<Duration>),
        SetHandler,
        Resume,
        Suspend,
        Cancel,
        Release,
    }

    #[derive(Default)]
    struct Journal {
        created: usize,
        calls: Vec<Call>,
        violations: Vec<&'static str>,
        handler: Option<EventHandler>,
    }

    impl Journal {
        fn count(&self, call: Call) -> usize {
            self.calls.iter().filter(|c| **c == call).count()
        }
    }

    /// Records every call and flags the ones a dispatch source would abort on.
    struct RecordingSource {
        journal: Arc<Mutex<Journal>>,
        suspend_count: u32,
    }

    impl TimerSource for RecordingSource {
        fn schedule(&mut self, after: Duration, repeating: Option<Duration>) {
            lock(&self.journal).calls.push(Call::Schedule(after, repeating));
        }

        fn set_event_handler(&mut self, handler: EventHandler) {
            let mut journal = lock(&self.journal);
            journal.calls.push(Call::SetHandler);
            journal.handler = Some(handler);
        }

        fn resume(&mut self) {
            let mut journal = lock(&self.journal);
            journal.calls.push(Call::Resume);
            if self.suspend_count == 0 {
                journal.violations.push("resume while running");
            } else {
                self.suspend_count -= 1;
            }
        }

        fn suspend(&mut self) {
            let mut journal = lock(&self.journal);
            journal.calls.push(Call::Suspend);
            if self.suspend_count > 0 {
                journal.violations.push("suspend while suspended");
            }
            self.suspend_count += 1;
        }

        fn cancel(&mut self) {
            lock(&self.journal).calls.push(Call::Cancel);
        }
    }

    impl Drop for RecordingSource {
        fn drop(&mut self) {
            let mut journal = lock(&self.journal);
            journal.calls.push(Call::Release);
            if self.suspend_count > 0 {
                journal.violations.push("release while suspended");
            }
        }
    }

    fn recording_timer(
        interval: Duration,
        repeating: bool,
        handler: Option<FireHandler>,
    ) -> (TimerHandle, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let factory_journal = Arc::clone(&journal);
        let factory: SourceFactory = Box::new(move || {
            lock(&factory_journal).created += 1;
            Box::new(RecordingSource {
                journal: factory_journal,
                suspend_count: 1,
            }) as Box<dyn TimerSource>
        });
        let timer = TimerHandle::with_source(interval, repeating, handler, factory).unwrap();
        (timer, journal)
    }

    fn fire(journal: &Arc<Mutex<Journal>>) {
        let handler = lock(journal).handler.clone().expect("no event handler installed");
        handler();
    }

    fn counting_handler() -> (FireHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handler: FireHandler = Arc::new(move |_: &DispatchTimer| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    #[test]
    fn repeated_resume_reaches_source_once() {
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, None);
        for _ in 0..5 {
            timer.resume();
        }

        assert_eq!(timer.state(), TimerState::Resumed);
        let journal = lock(&journal);
        assert_eq!(journal.created, 1);
        assert_eq!(journal.count(Call::Resume), 1);
        assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    }

    #[test]
    fn suspend_before_any_resume_never_creates_source() {
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, None);
        timer.suspend();
        timer.suspend();

        assert_eq!(timer.state(), TimerState::Suspended);
        assert_eq!(lock(&journal).created, 0);
    }

    #[test]
    fn repeated_suspend_reaches_source_once() {
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, None);
        timer.resume();
        for _ in 0..4 {
            timer.suspend();
        }

        let journal = lock(&journal);
        assert_eq!(journal.count(Call::Suspend), 1);
        assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    }

    #[test]
    fn alternating_calls_alternate_on_source() {
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, None);
        timer.resume();
        timer.suspend();
        timer.resume();

        let journal = lock(&journal);
        assert_eq!(journal.count(Call::Resume), 2);
        assert_eq!(journal.count(Call::Suspend), 1);
        assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    }

    #[test]
    fn source_is_scheduled_one_interval_out() {
        let interval = Duration::from_millis(250);
        let (repeating, journal) = recording_timer(interval, true, None);
        repeating.resume();
        assert_eq!(lock(&journal).calls[0], Call::Schedule(interval, Some(interval)));

        let (once, journal) = recording_timer(interval, false, None);
        once.resume();
        assert_eq!(lock(&journal).calls[0], Call::Schedule(interval, None));
    }

    #[test]
    fn drop_of_unused_timer_does_not_create_source() {
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, None);
        drop(timer);

        let journal = lock(&journal);
        assert_eq!(journal.created, 0);
        assert!(journal.calls.is_empty());
    }

    #[test]
    fn drop_while_suspended_resumes_after_cancel() {
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, None);
        timer.resume();
        timer.suspend();
        drop(timer);

        let journal = lock(&journal);
        let tail = &journal.calls[journal.calls.len() - 4..];
        assert_eq!(tail, [Call::SetHandler, Call::Cancel, Call::Resume, Call::Release]);
        assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    }

    #[test]
    fn drop_while_resumed_cancels_without_extra_resume() {
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, None);
        timer.resume();
        drop(timer);

        let journal = lock(&journal);
        let tail = &journal.calls[journal.calls.len() - 3..];
        assert_eq!(tail, [Call::SetHandler, Call::Cancel, Call::Release]);
        assert_eq!(journal.count(Call::Resume), 1);
        assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    }

    #[test]
    fn drop_of_materialized_timer_balances_initial_suspend() {
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, None);
        assert!(timer.materialize());
        assert_eq!(timer.state(), TimerState::Suspended);
        drop(timer);

        let journal = lock(&journal);
        assert_eq!(journal.created, 1);
        assert_eq!(journal.count(Call::Resume), 1);
        assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    }

    #[test]
    fn close_is_terminal_and_idempotent() {
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, None);
        timer.resume();
        timer.close();
        timer.close();
        timer.suspend();
        timer.resume();

        assert!(timer.is_closed());
        assert!(!timer.materialize());
        assert_eq!(timer.state(), TimerState::Resumed);
        drop(timer);

        let journal = lock(&journal);
        assert_eq!(journal.count(Call::Cancel), 1);
        assert_eq!(journal.count(Call::Release), 1);
        assert_eq!(journal.count(Call::Suspend), 0);
        assert!(journal.violations.is_empty(), "{:?}", journal.violations);
    }

    #[test]
    fn close_clears_on_fire() {
        let (handler, _) = counting_handler();
        let (timer, _journal) = recording_timer(Duration::from_secs(1), true, Some(handler));
        assert!(timer.has_on_fire());
        timer.close();
        assert!(!timer.has_on_fire());
    }

    #[test]
    fn tolerance_skips_fires_one_interval_at_a_time() {
        let (handler, count) = counting_handler();
        let interval = Duration::from_secs(2);
        let (timer, journal) = recording_timer(interval, true, Some(handler));
        timer.set_tolerance(interval * 5 / 2);
        timer.resume();

        fire(&journal);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.tolerance(), Duration::from_secs(3));

        fire(&journal);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.tolerance(), Duration::from_secs(1));

        // The last partial interval still skips a fire, floored at zero.
        fire(&journal);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timer.tolerance(), Duration::ZERO);

        fire(&journal);
        fire(&journal);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fire_after_drop_is_ignored() {
        let (handler, count) = counting_handler();
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, Some(handler));
        timer.resume();
        let stale = lock(&journal).handler.clone().unwrap();

        drop(timer);
        stale();
        fire(&journal);

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn on_fire_receives_the_timer() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_handler = Arc::clone(&seen);
        let handler: FireHandler = Arc::new(move |timer: &DispatchTimer| {
            seen_by_handler.store(timer as *const DispatchTimer as usize, Ordering::SeqCst);
        });
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, Some(handler));
        timer.resume();
        fire(&journal);

        assert_eq!(seen.load(Ordering::SeqCst), &*timer as *const DispatchTimer as usize);
    }

    #[test]
    fn on_fire_can_suspend_and_replace_itself() {
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, None);
        let (replacement, count) = counting_handler();
        timer.set_on_fire(Some(Arc::new(move |timer: &DispatchTimer| {
            timer.suspend();
            timer.set_on_fire(Some(Arc::clone(&replacement)));
        })));
        timer.resume();

        fire(&journal);
        assert_eq!(timer.state(), TimerState::Suspended);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        fire(&journal);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(lock(&journal).violations.is_empty());
    }

    #[test]
    fn cleared_on_fire_is_not_called() {
        let (handler, count) = counting_handler();
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, Some(handler));
        timer.resume();
        timer.clear_on_fire();
        fire(&journal);

        assert!(!timer.has_on_fire());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_resume_reaches_source_once() {
        let (timer, journal) = recording_timer(Duration::from_secs(1), true, None);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        timer.resume();
                    }
                });
            }
        });

        let journal = lock(&journal);
        assert_eq!(journal.created, 1);
        assert_eq!(journal.count(Call::Resume), 1);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let factory: SourceFactory = Box::new(|| -> Box<dyn TimerSource> {
            unreachable!("source created for an invalid timer")
        });
        let result = TimerHandle::with_source(Duration::ZERO, true, None, factory);
        assert!(matches!(result, Err(TimerError::InvalidInterval(_))));
    }
}
