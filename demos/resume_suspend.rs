use dispatch_timer::timer::{DispatchTimer, TimerHandle};
use dispatch_timer::timer_trait::Timer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);

    let timer = TimerHandle::new(
        Duration::from_millis(500),
        true,
        Some(Arc::new(move |timer: &DispatchTimer| {
            let n = fired_clone.fetch_add(1, Ordering::SeqCst) + 1;
            println!("Timer fired #{} ({:?})", n, timer.state());
        })),
    )?;

    // Calling resume twice would crash a raw dispatch source
    timer.resume();
    timer.resume();
    println!("Timer resumed, waiting for a few fires ...");
    tokio::time::sleep(Duration::from_millis(1600)).await;

    timer.suspend();
    timer.suspend();
    println!("Timer suspended after {} fires.", fired.load(Ordering::SeqCst));
    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("Still {} fires while suspended.", fired.load(Ordering::SeqCst));

    // Dropping a suspended timer is safe too
    drop(timer);
    println!("Timer dropped, exiting now.");
    Ok(())
}
