#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! # tickwatch
//!
//! In-process instrumentation: sample application values on a schedule, aggregate them over
//! time, estimate latency percentiles and raise events when thresholds are crossed.
//!
//! # Probes and time samplers
//!
//! A [`Probe`] reads a value on demand. A [`SampledProbe`] is a template for stateful
//! [`Sampler`]s, for example one that reports the increase of a counter since the previous
//! sample. A [`TimeSampler`] drives a sampler on a [`Scheduler`] and delivers each
//! [`Sample`] to its listeners.
//!
//! Time samplers are lazy. Nothing is sampled and no thread is started until the first
//! listener subscribes, and everything stops again when the last listener goes away.
//!
//! ```
//! use std::time::Duration;
//!
//! use tickwatch::{ManualProbe, ManualScheduler, TimeSampler, WindowAverage};
//!
//! // A manual scheduler only ticks when told to. Production code uses the shared scheduler.
//! let manual = ManualScheduler::new(0);
//! let connections = ManualProbe::new(10_u32);
//!
//! let sampler = TimeSampler::builder(connections.clone())
//!     .interval(Duration::from_secs(1))
//!     .scheduler(&manual.scheduler())
//!     .build()?;
//!
//! // Average over the last minute, recomputed on every tick.
//! let average = sampler.rolling_over(Duration::from_secs(60), WindowAverage);
//!
//! let _subscription = average.subscribe(|sample| {
//!     println!("{} connections on average", sample.value());
//! });
//!
//! connections.set(20);
//! manual.advance(Duration::from_secs(1));
//!
//! assert_eq!(average.last_sample().map(|s| *s.value()), Some(15.0));
//! # Ok::<(), tickwatch::Error>(())
//! ```
//!
//! # Derived samplers and operations
//!
//! [`TimeSampler::apply()`] transforms every sample with a [`SampleOperation`] such as
//! [`CumulativeAverage`], [`Change`] or [`Scale`]. [`TimeSampler::rolling_over()`]
//! aggregates a [`RollingWindow`] of recent samples with a [`SampleListOperation`] such as
//! [`WindowSum`], [`WindowMax`] or [`WindowSnapshots`]. Every derived sampler has its own
//! operation state.
//!
//! # Timers and percentiles
//!
//! A [`Timer`] measures durations into a [`PercentileCounter`]. Bucket layouts are defined
//! once in [`PercentileLayouts`] and percentiles are estimated from a
//! [`PercentileSnapshot`]:
//!
//! ```
//! use std::time::Duration;
//!
//! use tickwatch::{PercentileLayouts, Timer};
//!
//! let layouts = PercentileLayouts::new().with_layout("db", [0, 1, 5, 10, 50, 100])?;
//!
//! let query_time = Timer::builder()
//!     .counter(layouts.counter(Some("db"))?)
//!     .unit(Duration::from_millis(1))
//!     .build();
//!
//! query_time.record(Duration::from_millis(3));
//! query_time.record(Duration::from_millis(7));
//!
//! assert_eq!(query_time.peek().percentiles().estimate_percentile(50.0), 5);
//! # Ok::<(), tickwatch::Error>(())
//! ```
//!
//! # Checks and triggers
//!
//! A [`Check`] evaluates a [`Condition`] against a time sampler, on demand or on every tick.
//! A [`TriggerHolder`] watches a value derived by a [`Trigger`] and raises rate-limited
//! events while its condition holds, governed by a [`RepetitionGuard`].
//!
//! # Exporting
//!
//! [`Exports`] hands probes, samplers, timers, events and checks to pluggable
//! [`Exporter`] backends under hierarchical [`ExportPath`]s.
//!
//! # Logging
//!
//! The crate logs through [`tracing`]. Lifecycle changes are logged at `debug` level, every
//! emitted sample at `trace` level and panics raised by listeners at `error` level.

mod check;
mod clock;
mod condition;
mod error;
mod export;
mod layouts;
mod listeners;
mod manual_scheduler;
mod operation;
mod percentiles;
mod probe;
mod repetition;
mod rolling;
mod sample;
mod scheduler;
mod time_sampler;
mod timer;
mod trigger;
mod worker_pool;

pub use check::*;
pub use clock::*;
pub use condition::*;
pub use error::*;
pub use export::*;
pub use layouts::*;
pub use listeners::*;
pub use manual_scheduler::*;
pub use operation::*;
pub use percentiles::*;
pub use probe::*;
pub use repetition::*;
pub use rolling::*;
pub use sample::*;
pub use scheduler::*;
pub use time_sampler::*;
pub use timer::*;
pub use trigger::*;
pub(crate) use worker_pool::*;
