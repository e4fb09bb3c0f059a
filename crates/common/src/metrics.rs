use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Per-node scan totals reported once a scan node closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanTotals {
    /// Batches pushed into the queue by workers, plus batches a worker gave up on.
    pub produced: u64,
    /// Batches returned to the consumer.
    pub delivered: u64,
    /// Batches dropped on cancellation, failure or close.
    pub discarded: u64,
    /// Rows read from sources before filtering.
    pub rows_read: u64,
    /// Rows removed by conjuncts or partition pruning.
    pub rows_filtered: u64,
}

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    scan_batches_produced: CounterVec,
    scan_batches_delivered: CounterVec,
    scan_batches_discarded: CounterVec,
    scan_rows_read: CounterVec,
    scan_rows_filtered: CounterVec,
    scan_consumer_wait_seconds: HistogramVec,
    scan_queue_depth: GaugeVec,
    scan_running_scanners: GaugeVec,
    agg_input_rows: CounterVec,
    agg_groups: GaugeVec,
    agg_hash_level: GaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_scan_totals(&self, query_id: &str, node_id: i32, totals: ScanTotals) {
        let node = node_id.to_string();
        let labels = [query_id, node.as_str()];
        let inner = &self.inner;
        inner
            .scan_batches_produced
            .with_label_values(&labels)
            .inc_by(totals.produced as f64);
        inner
            .scan_batches_delivered
            .with_label_values(&labels)
            .inc_by(totals.delivered as f64);
        inner
            .scan_batches_discarded
            .with_label_values(&labels)
            .inc_by(totals.discarded as f64);
        inner
            .scan_rows_read
            .with_label_values(&labels)
            .inc_by(totals.rows_read as f64);
        inner
            .scan_rows_filtered
            .with_label_values(&labels)
            .inc_by(totals.rows_filtered as f64);
    }

    pub fn observe_consumer_wait(&self, query_id: &str, node_id: i32, secs: f64) {
        self.inner
            .scan_consumer_wait_seconds
            .with_label_values(&[query_id, &node_id.to_string()])
            .observe(secs.max(0.0));
    }

    pub fn set_scan_queue_depth(&self, query_id: &str, node_id: i32, depth: usize) {
        self.inner
            .scan_queue_depth
            .with_label_values(&[query_id, &node_id.to_string()])
            .set(depth as f64);
    }

    pub fn set_running_scanners(&self, query_id: &str, node_id: i32, running: usize) {
        self.inner
            .scan_running_scanners
            .with_label_values(&[query_id, &node_id.to_string()])
            .set(running as f64);
    }

    pub fn record_aggregation(
        &self,
        query_id: &str,
        node_id: i32,
        input_rows: u64,
        groups: usize,
        hash_level: u8,
    ) {
        let node = node_id.to_string();
        let labels = [query_id, node.as_str()];
        self.inner
            .agg_input_rows
            .with_label_values(&labels)
            .inc_by(input_rows as f64);
        self.inner
            .agg_groups
            .with_label_values(&labels)
            .set(groups as f64);
        self.inner
            .agg_hash_level
            .with_label_values(&labels)
            .set(hash_level as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        if TextEncoder::new().encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const NODE_LABELS: &[&str] = &["query_id", "node_id"];

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        Self {
            scan_batches_produced: counter_vec(
                &registry,
                "tundra_scan_batches_produced_total",
                "Batches produced by scanner threads",
            ),
            scan_batches_delivered: counter_vec(
                &registry,
                "tundra_scan_batches_delivered_total",
                "Batches handed to the scan consumer",
            ),
            scan_batches_discarded: counter_vec(
                &registry,
                "tundra_scan_batches_discarded_total",
                "Batches dropped on cancellation or failure",
            ),
            scan_rows_read: counter_vec(
                &registry,
                "tundra_scan_rows_read_total",
                "Rows read from scan ranges",
            ),
            scan_rows_filtered: counter_vec(
                &registry,
                "tundra_scan_rows_filtered_total",
                "Rows removed by conjuncts or partition pruning",
            ),
            scan_consumer_wait_seconds: histogram_vec(
                &registry,
                "tundra_scan_consumer_wait_seconds",
                "Time the consumer blocked waiting for a batch",
            ),
            scan_queue_depth: gauge_vec(
                &registry,
                "tundra_scan_queue_depth",
                "Batches currently buffered in the scan queue",
            ),
            scan_running_scanners: gauge_vec(
                &registry,
                "tundra_scan_running_scanners",
                "Scanner threads that have not finished",
            ),
            agg_input_rows: counter_vec(
                &registry,
                "tundra_agg_input_rows_total",
                "Rows consumed by aggregation nodes",
            ),
            agg_groups: gauge_vec(
                &registry,
                "tundra_agg_groups",
                "Distinct groups held by an aggregation node",
            ),
            agg_hash_level: gauge_vec(
                &registry,
                "tundra_agg_hash_level",
                "Current hash level of an aggregation node",
            ),
            registry,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), NODE_LABELS).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), NODE_LABELS).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), NODE_LABELS)
        .expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
