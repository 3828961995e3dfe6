use prometheus::{exponential_buckets, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

use std::fmt::{self, Debug};

/// Counters for a single invocation. These are purely observational, and nothing in the
/// engine reads them back.
pub struct Metrics {
    registry: Registry,
    task_durations: Histogram,
    tasks_started: IntCounter,
    tasks_by_outcome: IntCounterVec,
    tasks_failed: IntCounter,
    tasks_skipped: IntCounter,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

impl Default for Metrics {
    fn default() -> Metrics {
        Metrics::new()
    }
}

const OUTCOME: &[&str] = &["outcome"];

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();

        let duration_opts = HistogramOpts::new("task_duration_seconds",
                "Total time from starting a task to observing its result")
                .subsystem("runner")
                // 10ms, 40ms, 160ms ... roughly 40s
                .buckets(exponential_buckets(0.01, 4.0, 7).unwrap());
        let task_durations = Histogram::with_opts(duration_opts).unwrap();
        registry.register(Box::new(task_durations.clone())).unwrap();

        let started_opts = Opts::new("tasks_started", "total number of tasks that were started").subsystem("runner");
        let tasks_started = IntCounter::with_opts(started_opts).unwrap();
        registry.register(Box::new(tasks_started.clone())).unwrap();

        let outcome_opts = Opts::new("tasks_succeeded", "number of successful tasks by outcome")
                .subsystem("runner")
                .variable_label("outcome");
        let tasks_by_outcome = IntCounterVec::new(outcome_opts, OUTCOME).unwrap();
        registry.register(Box::new(tasks_by_outcome.clone())).unwrap();

        let failed_opts = Opts::new("tasks_failed", "number of tasks that returned an error or panicked").subsystem("runner");
        let tasks_failed = IntCounter::with_opts(failed_opts).unwrap();
        registry.register(Box::new(tasks_failed.clone())).unwrap();

        let skipped_opts = Opts::new("tasks_skipped", "number of tasks skipped because an earlier step in their group failed").subsystem("runner");
        let tasks_skipped = IntCounter::with_opts(skipped_opts).unwrap();
        registry.register(Box::new(tasks_skipped.clone())).unwrap();

        Metrics {
            registry,
            task_durations,
            tasks_started,
            tasks_by_outcome,
            tasks_failed,
            tasks_skipped,
        }
    }

    pub fn task_started(&self) -> prometheus::HistogramTimer {
        self.tasks_started.inc();
        self.task_durations.start_timer()
    }

    pub fn task_succeeded(&self, outcome: &str) {
        self.tasks_by_outcome.with_label_values(&[outcome]).inc();
    }

    pub fn task_failed(&self) {
        self.tasks_failed.inc();
    }

    pub fn task_skipped(&self) {
        self.tasks_skipped.inc();
    }

    pub fn started_count(&self) -> u64 {
        self.tasks_started.get() as u64
    }

    pub fn failed_count(&self) -> u64 {
        self.tasks_failed.get() as u64
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}
