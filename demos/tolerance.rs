use dispatch_timer::config::TimerConfig;
use dispatch_timer::timer::{DispatchTimer, TimerHandle};
use dispatch_timer::timer_trait::Timer;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config: TimerConfig = serde_json::from_str(
        r#"{
            "interval": { "secs": 1, "nanos": 0 },
            "tolerance": { "secs": 2, "nanos": 500000000 }
        }"#,
    )?;

    let timer = TimerHandle::from_config(
        &config,
        Some(Arc::new(|timer: &DispatchTimer| {
            println!("Timer fired, tolerance left: {:?}", timer.tolerance());
        })),
    )?;
    timer.resume();
    println!("Timer started with {:?} tolerance, the first fires are skipped ...", config.tolerance);

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        println!("Tolerance now {:?}", timer.tolerance());
    }

    println!("Skipping the next two fires ...");
    timer.set_tolerance(config.interval * 2);
    tokio::time::sleep(Duration::from_secs(4)).await;

    Ok(())
}
