use dispatch_timer::timer::{DispatchTimer, TimerHandle};
use dispatch_timer::timer_trait::Timer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (sender, mut receiver) = mpsc::unbounded_channel();

    let timer = Arc::new(TimerHandle::new(Duration::from_millis(300), true, None)?);
    timer.set_on_fire(Some(Arc::new(move |_: &DispatchTimer| {
        // Ignore send errors (happens when the receiver is gone)
        let _ = sender.send(());
    })));
    println!("Timer created in main task");

    // Resume and suspend from several tasks at once; the source only sees real transitions
    let mut tasks = Vec::new();
    for i in 0..4 {
        let timer = Arc::clone(&timer);
        tasks.push(tokio::spawn(async move {
            println!("[Task {}] Resuming timer", i);
            timer.resume();
        }));
    }
    for task in tasks {
        task.await?;
    }

    for i in 1..=3 {
        match tokio::time::timeout(Duration::from_secs(2), receiver.recv()).await {
            Ok(Some(())) => println!("[Main] Fire #{}", i),
            Ok(None) => {
                println!("[Main] Timer closed");
                break;
            }
            Err(_) => {
                println!("[Main] Timeout waiting for a fire");
                break;
            }
        }
    }

    let suspender = Arc::clone(&timer);
    tokio::spawn(async move {
        println!("[Task] Suspending timer");
        suspender.suspend();
        suspender.suspend();
    })
    .await?;
    println!("[Main] Timer state: {:?}", timer.state());

    timer.close();
    println!("Timer closed, exiting now.");
    Ok(())
}
