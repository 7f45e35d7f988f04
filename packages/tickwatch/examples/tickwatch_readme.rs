//! Instruments a pretend request handler the way an application would.
//!
//! Logs at debug level, so the sampler and check lifecycle is visible.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::Duration;

use tickwatch::{
    Check, Delta, PercentileLayouts, Scheduler, TimeSampler, Timer, TriggerHolder, WindowSum,
    Windowed, above,
};
use tracing::Level;

fn main() -> Result<(), tickwatch::Error> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    println!("=== tickwatch README Example ===");

    let scheduler = Scheduler::new();

    let layouts = PercentileLayouts::new()
        .with_layout("request", [0, 1, 2, 5, 10, 20, 50, 100])?
        .with_default("request")?;

    let request_time = Timer::builder()
        .counter(layouts.counter(None)?)
        .unit(Duration::from_millis(1))
        .build();

    let requests_total = Arc::new(AtomicI64::new(0));

    let requests_total_clone = Arc::clone(&requests_total);
    let requests = TimeSampler::builder(Delta::new(move || {
        requests_total_clone.load(Ordering::Relaxed)
    }))
    .interval(Duration::from_millis(100))
    .scheduler(&scheduler)
    .build()?;

    let busy = TriggerHolder::builder(
        &requests,
        Windowed::new(Duration::from_millis(500), WindowSum),
        above(20.0),
    )
    .max_every(Duration::from_secs(1))
    .fire_when_no_longer_met(true)
    .build();

    let _busy_subscription = busy.subscribe(|event| {
        println!("busy: {} at {} ({} requests)", event.kind(), event.timestamp(), event.value());
    });

    let request_time_clone = request_time.clone();
    let slow = Check::polling(
        move || {
            request_time_clone
                .peek()
                .percentile(90.0)
                .is_some_and(|p90| p90 > Duration::from_millis(10))
        },
        Duration::from_millis(250),
        &scheduler,
    )?;

    let _slow_subscription = slow.subscribe(|event| {
        if event.conditions_met() {
            println!("requests slow at {}", event.timestamp());
        }
    });

    for request in 0..60_u64 {
        request_time.time(|| thread::sleep(Duration::from_millis(request % 15)));
        requests_total.fetch_add(1, Ordering::Relaxed);
    }

    let report = request_time.sample();
    println!(
        "{} requests, mean {:?}, p50 {:?}, p90 {:?}, max {:?}",
        report.count(),
        report.mean(),
        report.percentile(50.0),
        report.percentile(90.0),
        report.max()
    );

    println!("README example completed successfully!");
    Ok(())
}
