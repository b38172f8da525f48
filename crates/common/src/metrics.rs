use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    tasks_created: CounterVec,
    tasks_completed: CounterVec,
    tasks_evicted: CounterVec,
    task_responses: CounterVec,
    task_send_failures: CounterVec,
    pipelines: CounterVec,
    pipelines_alive: GaugeVec,
    stage_time_seconds: HistogramVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn inc_task_created(&self, kind: &str) {
        self.inner.tasks_created.with_label_values(&[kind]).inc();
    }

    pub fn inc_task_completed(&self, kind: &str) {
        self.inner.tasks_completed.with_label_values(&[kind]).inc();
    }

    pub fn inc_task_evicted(&self, count: u64) {
        self.inner
            .tasks_evicted
            .with_label_values(&["expired"])
            .inc_by(count as f64);
    }

    pub fn inc_task_response(&self, response_type: &str) {
        self.inner
            .task_responses
            .with_label_values(&[response_type])
            .inc();
    }

    pub fn inc_task_send_failure(&self, target: &str) {
        self.inner
            .task_send_failures
            .with_label_values(&[target])
            .inc();
    }

    pub fn record_pipeline(&self, outcome: &str) {
        self.inner.pipelines.with_label_values(&[outcome]).inc();
    }

    pub fn set_pipelines_alive(&self, node: &str, alive: u64) {
        self.inner
            .pipelines_alive
            .with_label_values(&[node])
            .set(alive as f64);
    }

    pub fn record_stage(&self, stage_type: &str, outcome: &str, secs: f64) {
        self.inner
            .stage_time_seconds
            .with_label_values(&[stage_type, outcome])
            .observe(secs.max(0.0));
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        let tasks_created = counter_vec(
            &registry,
            "tsq_tasks_created_total",
            "Task contexts created",
            &["kind"],
        );
        let tasks_completed = counter_vec(
            &registry,
            "tsq_tasks_completed_total",
            "Task contexts that emitted their terminal result",
            &["kind"],
        );
        let tasks_evicted = counter_vec(
            &registry,
            "tsq_tasks_evicted_total",
            "Task contexts evicted by the reaper",
            &["reason"],
        );
        let task_responses = counter_vec(
            &registry,
            "tsq_task_responses_total",
            "Task responses routed to task contexts",
            &["type"],
        );
        let task_send_failures = counter_vec(
            &registry,
            "tsq_task_send_failures_total",
            "Task requests that could not be dispatched",
            &["target"],
        );
        let pipelines = counter_vec(
            &registry,
            "tsq_pipelines_total",
            "Finished local pipelines by outcome",
            &["outcome"],
        );
        let pipelines_alive = gauge_vec(
            &registry,
            "tsq_pipelines_alive",
            "Currently registered pipelines",
            &["node"],
        );
        let stage_time_seconds = histogram_vec(
            &registry,
            "tsq_stage_time_seconds",
            "Time spent executing one stage",
            &["stage", "outcome"],
        );
        Self {
            registry,
            tasks_created,
            tasks_completed,
            tasks_evicted,
            task_responses,
            task_send_failures,
            pipelines,
            pipelines_alive,
            stage_time_seconds,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
