//! Prometheus-text metrics for the master
//!
//! Process-wide counters, gauges and histograms rendered in the Prometheus
//! text exposition format by [`gather`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Anything that can render itself as Prometheus text
pub trait PrometheusMetric: Send + Sync {
    fn to_prometheus(&self) -> String;
}

fn header(name: &str, help: &str, kind: &str) -> String {
    format!("# HELP {} {}\n# TYPE {} {}\n", name, help, name, kind)
}

/// Monotonically increasing counter
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl PrometheusMetric for Counter {
    fn to_prometheus(&self) -> String {
        format!("{}{} {}\n", header(self.name, self.help, "counter"), self.name, self.get())
    }
}

/// Value that can go up or down
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl PrometheusMetric for Gauge {
    fn to_prometheus(&self) -> String {
        format!("{}{} {}\n", header(self.name, self.help, "gauge"), self.name, self.get())
    }
}

/// Cumulative histogram of durations in seconds
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    /// Sum in microseconds
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Start timing; the elapsed time is observed when the timer drops
    pub fn start_timer(&self) -> HistogramTimer<'_> {
        HistogramTimer {
            histogram: self,
            start: Instant::now(),
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl PrometheusMetric for Histogram {
    fn to_prometheus(&self) -> String {
        let mut output = header(self.name, self.help, "histogram");
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name,
                bound,
                bucket.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", self.name, self.count()));
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum));
        output.push_str(&format!("{}_count {}\n", self.name, self.count()));
        output
    }
}

/// Observes elapsed time on drop
pub struct HistogramTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl Drop for HistogramTimer<'_> {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Standard master metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    const SUPERSTEP_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0];

    pub static SUPERSTEPS_TOTAL: Counter =
        Counter::new("bsp_supersteps_total", "Supersteps completed by this master");

    pub static WORKER_FAILURES_TOTAL: Counter = Counter::new(
        "bsp_worker_failures_total",
        "Supersteps that ended in a worker failure",
    );

    pub static CHECKPOINTS_FINALIZED_TOTAL: Counter = Counter::new(
        "bsp_checkpoints_finalized_total",
        "Checkpoints finalized by this master",
    );

    pub static ACTIVE_WORKERS: Gauge =
        Gauge::new("bsp_active_workers", "Workers chosen for the current superstep");

    pub static CURRENT_SUPERSTEP: Gauge =
        Gauge::new("bsp_current_superstep", "Superstep being coordinated");

    pub static APPLICATION_ATTEMPT: Gauge =
        Gauge::new("bsp_application_attempt", "Current application attempt");

    pub static SUPERSTEP_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new(
            "bsp_superstep_duration_seconds",
            "Wall time of one coordinated superstep",
            SUPERSTEP_BUCKETS,
        )
    });
}

/// Render every standard metric
pub fn gather() -> String {
    let metrics: [&dyn PrometheusMetric; 7] = [
        &standard::SUPERSTEPS_TOTAL,
        &standard::WORKER_FAILURES_TOTAL,
        &standard::CHECKPOINTS_FINALIZED_TOTAL,
        &standard::ACTIVE_WORKERS,
        &standard::CURRENT_SUPERSTEP,
        &standard::APPLICATION_ATTEMPT,
        &*standard::SUPERSTEP_DURATION,
    ];
    metrics.iter().map(|m| m.to_prometheus()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new("c", "help");
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
        assert!(counter.to_prometheus().ends_with("c 5\n"));

        let gauge = Gauge::new("g", "help");
        gauge.set(-3);
        assert!(gauge.to_prometheus().contains("# TYPE g gauge"));
        assert_eq!(gauge.get(), -3);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        static BOUNDS: &[f64] = &[0.1, 1.0];
        let histogram = Histogram::new("h", "help", BOUNDS);
        histogram.observe(0.05);
        histogram.observe(0.5);
        histogram.observe(7.0);
        let text = histogram.to_prometheus();
        assert!(text.contains("h_bucket{le=\"0.1\"} 1"));
        assert!(text.contains("h_bucket{le=\"1\"} 2"));
        assert!(text.contains("h_bucket{le=\"+Inf\"} 3"));
        assert!(text.contains("h_count 3"));
    }

    #[test]
    fn test_timer_observes_on_drop() {
        static BOUNDS: &[f64] = &[10.0];
        let histogram = Histogram::new("t", "help", BOUNDS);
        {
            let _timer = histogram.start_timer();
        }
        assert_eq!(histogram.count(), 1);
    }

    #[test]
    fn test_gather_lists_standard_metrics() {
        let text = gather();
        assert!(text.contains("bsp_supersteps_total"));
        assert!(text.contains("bsp_superstep_duration_seconds_count"));
    }
}
