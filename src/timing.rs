//! Named stopwatches for per-request timing
//!
//! Both ingress adapters keep one [`Timings`] per request (HTTP) or per
//! worker (queue) and report the accumulated totals in their log line.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

/// Wall time of the whole request
pub const TOTAL: &str = "total";
/// Time spent talking to the cache store
pub const BACKEND: &str = "backend";

#[derive(Debug, Default)]
struct Stopwatch {
    accumulated: Duration,
    started: Option<Instant>,
}

impl Stopwatch {
    fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.accumulated += started.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        self.accumulated + self.started.map_or(Duration::ZERO, |s| s.elapsed())
    }
}

/// A set of named stopwatches.
///
/// Stopwatches are created on first use. Starting one that is already
/// running is a no-op; stopping accumulates into its total, so repeated
/// start/stop pairs add up.
#[derive(Debug, Default)]
pub struct Timings {
    watches: HashMap<&'static str, Stopwatch>,
}

impl Timings {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or resume) a stopwatch
    pub fn start(&mut self, name: &'static str) {
        self.watches.entry(name).or_default().start();
    }

    /// Stop a stopwatch, keeping its accumulated time
    pub fn stop(&mut self, name: &'static str) {
        self.watches.entry(name).or_default().stop();
    }

    /// Stop and zero every stopwatch
    pub fn reset_all(&mut self) {
        self.watches.clear();
    }

    /// Elapsed time of a stopwatch (zero if never started)
    #[must_use]
    pub fn elapsed(&self, name: &str) -> Duration {
        self.watches.get(name).map_or(Duration::ZERO, Stopwatch::elapsed)
    }

    /// Elapsed time in milliseconds, for log fields
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn elapsed_ms(&self, name: &str) -> f64 {
        self.elapsed(name).as_secs_f64() * 1000.0
    }

    /// Run `fut` with the named stopwatch running
    pub async fn time<F: Future>(&mut self, name: &'static str, fut: F) -> F::Output {
        self.start(name);
        let output = fut.await;
        self.stop(name);
        output
    }
}
