use crate::error::TimerError;
use crate::source::{lock, noop_handler, EventHandler, SourceFactory, TimerSource};
use lazy_static::lazy_static;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

lazy_static! {
    /// Runs timer sources created outside of any tokio runtime.
    static ref FALLBACK_RUNTIME: Result<Runtime, String> = Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("dispatch-timer")
        .enable_time()
        .build()
        .map_err(|e| e.to_string());
}

/// Returns the runtime of the calling context, or the shared fallback runtime when the
/// caller is not inside one.
pub fn runtime_handle() -> Result<Handle, TimerError> {
    if let Ok(handle) = Handle::try_current() {
        return Ok(handle);
    }
    match &*FALLBACK_RUNTIME {
        Ok(runtime) => Ok(runtime.handle().clone()),
        Err(e) => Err(TimerError::Runtime(e.clone())),
    }
}

// Deadlines that would overflow `Instant` are clamped to this far.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

fn fatal(violation: &str) -> ! {
    log::error!("Timer source contract violated: {}", violation);
    std::process::abort();
}

/// A [`TimerSource`] driven by a task on a tokio runtime.
///
/// It follows the same rules as a dispatch timer source: it starts suspended, fires on the
/// runtime's worker threads, and aborts the process on an unbalanced resume or suspend or
/// when it is dropped while suspended.
pub struct TokioTimerSource {
    runtime: Handle,
    handler: Arc<Mutex<EventHandler>>,
    running: watch::Sender<bool>,
    schedule: Option<(Instant, Option<Duration>)>,
    task: Option<JoinHandle<()>>,
    suspend_count: u32,
    cancelled: bool,
}

impl TokioTimerSource {
    /// Creates a suspended, unscheduled source whose ticking task will run on `runtime`.
    ///
    /// # Arguments
    ///
    /// * `runtime` - The tokio runtime the fire handler runs on, usually obtained from
    ///   [`runtime_handle`].
    ///
    /// # Returns
    ///
    /// A source with one pending suspend. Nothing is spawned until it is first resumed
    /// after being scheduled, and it must be resumed again before it is dropped.
    ///
    /// # Example
    ///
    /// ```rust
    /// use dispatch_timer::dispatch::{runtime_handle, TokioTimerSource};
    /// use dispatch_timer::source::TimerSource;
    /// use std::time::Duration;
    ///
    /// let mut source = TokioTimerSource::new(runtime_handle().unwrap());
    /// source.schedule(Duration::from_secs(1), Some(Duration::from_secs(1)));
    /// source.resume();
    /// source.cancel();
    /// ```
    pub fn new(runtime: Handle) -> Self {
        let (running, _) = watch::channel(false);
        TokioTimerSource {
            runtime,
            handler: Arc::new(Mutex::new(noop_handler())),
            running,
            schedule: None,
            task: None,
            suspend_count: 1,
            cancelled: false,
        }
    }

    /// A factory for [`crate::timer::TimerHandle::with_source`] creating sources on `runtime`.
    ///
    /// The source is only built when the timer first needs it.
    pub fn factory(runtime: Handle) -> SourceFactory {
        Box::new(move || Box::new(TokioTimerSource::new(runtime)) as Box<dyn TimerSource>)
    }

    fn activate(&mut self) {
        if self.cancelled {
            return;
        }
        if self.task.is_none() {
            if let Some((deadline, period)) = self.schedule {
                let handler = Arc::clone(&self.handler);
                let running = self.running.subscribe();
                self.task = Some(self.runtime.spawn(tick(handler, deadline, period, running)));
            }
        }
        self.running.send_replace(true);
    }
}

async fn tick(
    handler: Arc<Mutex<EventHandler>>,
    mut deadline: Instant,
    period: Option<Duration>,
    mut running: watch::Receiver<bool>,
) {
    loop {
        if !*running.borrow_and_update() {
            if running.changed().await.is_err() {
                return;
            }
            continue;
        }

        tokio::select! {
            _ = time::sleep_until(deadline) => {}
            changed = running.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        }

        // Cloned out so the handler may replace itself while running.
        let fire = lock(&handler).clone();
        fire();

        let Some(period) = period else {
            return;
        };
        // Missed fires coalesce into the one just run; if we fell behind, re-phase from now
        let now = Instant::now();
        deadline = match deadline.checked_add(period) {
            Some(next) if next > now => next,
            _ => deadline_after(now, period),
        };
    }
}

impl TimerSource for TokioTimerSource {
    fn schedule(&mut self, after: Duration, repeating: Option<Duration>) {
        let _guard = self.runtime.enter();
        self.schedule = Some((deadline_after(Instant::now(), after), repeating));
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.suspend_count == 0 {
            self.activate();
        }
    }

    fn set_event_handler(&mut self, handler: EventHandler) {
        *lock(&self.handler) = handler;
    }

    fn resume(&mut self) {
        if self.suspend_count == 0 {
            fatal("resume of a running timer source");
        }
        self.suspend_count -= 1;
        if self.suspend_count == 0 {
            self.activate();
        }
    }

    fn suspend(&mut self) {
        if self.suspend_count > 0 {
            fatal("suspend of a suspended timer source");
        }
        self.suspend_count += 1;
        self.running.send_replace(false);
    }

    fn cancel(&mut self) {
        self.cancelled = true;
        self.running.send_replace(false);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TokioTimerSource {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.suspend_count > 0 {
            fatal("release of a suspended timer source");
        }
    }
}
