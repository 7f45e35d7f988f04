//! Timers fed from many threads and reported per interval.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use testing::with_watchdog;
use tickwatch::{BucketPercentileCounter, ManualScheduler, TimeSampler, Timer, TimerSnapshot};

#[test]
fn sampling_starts_a_new_interval() {
    with_watchdog(|| {
        let counter = BucketPercentileCounter::new([0, 10, 100]).unwrap();
        let timer = Timer::builder()
            .counter(Arc::new(counter))
            .unit(Duration::from_millis(1))
            .build();

        thread::scope(|s| {
            for _ in 0..4 {
                let timer = timer.clone();
                s.spawn(move || {
                    for _ in 0..25 {
                        timer.record(Duration::from_millis(50));
                    }
                });
            }
        });

        let first = timer.sample();
        assert_eq!(first.count(), 100);
        assert_eq!(first.percentiles().bucket_counts(), &[0, 100, 0]);
        assert_eq!(first.percentile(50.0), Some(Duration::from_millis(100)));

        let second = timer.sample();
        assert_eq!(second.count(), 0);
        assert_eq!(second.min(), None);
        assert_eq!(second.max(), None);
    });
}

#[test]
fn timer_exported_as_time_sampler_reports_each_interval() {
    with_watchdog(|| {
        let manual = ManualScheduler::new(0);
        let timer = Timer::new();

        let reports = TimeSampler::builder(timer.clone())
            .interval(Duration::from_secs(10))
            .scheduler(&manual.scheduler())
            .build()
            .unwrap();

        let seen: Arc<Mutex<Vec<TimerSnapshot>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _handle = reports.subscribe(move |sample| seen_clone.lock().push(sample.value().clone()));

        thread::scope(|s| {
            for worker in 1..=3_u64 {
                let timer = timer.clone();
                s.spawn(move || timer.record(Duration::from_millis(worker)));
            }
        });

        manual.advance(Duration::from_secs(10));

        timer.record(Duration::from_millis(7));
        manual.advance(Duration::from_secs(10));

        let seen = seen.lock();
        let counts: Vec<_> = seen.iter().map(TimerSnapshot::count).collect();

        // Immediate sample on subscribe, then one per interval.
        assert_eq!(counts, vec![0, 3, 1]);

        let middle = seen.get(1).unwrap();
        assert_eq!(middle.min(), Some(Duration::from_millis(1)));
        assert_eq!(middle.max(), Some(Duration::from_millis(3)));
        assert_eq!(middle.total(), Duration::from_millis(6));

        assert_eq!(seen.get(2).unwrap().max(), Some(Duration::from_millis(7)));
    });
}
