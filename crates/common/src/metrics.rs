use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    partitions_total: CounterVec,
    partitions_pruned: CounterVec,
    partitions_scanned: CounterVec,
    partitions_skipped: CounterVec,
    partitions_unread: CounterVec,
    rows_emitted: CounterVec,
    rows_filtered: CounterVec,
    values_masked: CounterVec,
    columns_denied: CounterVec,
    partition_read_seconds: HistogramVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Pruning outcome for one query: `total` manifest entries, `kept` to scan.
    pub fn record_pruning(&self, table: &str, total: u64, kept: u64) {
        let labels = [table];
        self.inner
            .partitions_total
            .with_label_values(&labels)
            .inc_by(total as f64);
        self.inner
            .partitions_pruned
            .with_label_values(&labels)
            .inc_by(total.saturating_sub(kept) as f64);
    }

    pub fn record_partition_read(
        &self,
        table: &str,
        role: &str,
        rows_out: u64,
        rows_filtered: u64,
        masked_values: u64,
        secs: f64,
    ) {
        self.inner
            .partitions_scanned
            .with_label_values(&[table])
            .inc();
        let labels = [table, role];
        self.inner
            .rows_emitted
            .with_label_values(&labels)
            .inc_by(rows_out as f64);
        self.inner
            .rows_filtered
            .with_label_values(&labels)
            .inc_by(rows_filtered as f64);
        self.inner
            .values_masked
            .with_label_values(&labels)
            .inc_by(masked_values as f64);
        self.inner
            .partition_read_seconds
            .with_label_values(&[table])
            .observe(secs.max(0.0));
    }

    pub fn record_partition_skipped(&self, table: &str) {
        self.inner
            .partitions_skipped
            .with_label_values(&[table])
            .inc();
    }

    pub fn record_partitions_unread(&self, table: &str, unread: u64) {
        self.inner
            .partitions_unread
            .with_label_values(&[table])
            .inc_by(unread as f64);
    }

    pub fn record_columns_denied(&self, table: &str, role: &str, denied: u64) {
        self.inner
            .columns_denied
            .with_label_values(&[table, role])
            .inc_by(denied as f64);
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

        let partitions_total = counter_vec(
            &registry,
            "riq_partitions_considered_total",
            "Manifest entries considered by partition pruning",
            &["table"],
        );
        let partitions_pruned = counter_vec(
            &registry,
            "riq_partitions_pruned_total",
            "Manifest entries eliminated by partition pruning",
            &["table"],
        );
        let partitions_scanned = counter_vec(
            &registry,
            "riq_partitions_scanned_total",
            "Partitions read and policy-applied",
            &["table"],
        );
        let partitions_skipped = counter_vec(
            &registry,
            "riq_partitions_skipped_total",
            "Corrupt partitions skipped under the skip policy",
            &["table"],
        );
        let partitions_unread = counter_vec(
            &registry,
            "riq_partitions_unread_total",
            "Partitions left unread by timeout or cancellation",
            &["table"],
        );
        let rows_emitted = counter_vec(
            &registry,
            "riq_rows_emitted_total",
            "Rows returned across the query facade",
            &["table", "role"],
        );
        let rows_filtered = counter_vec(
            &registry,
            "riq_rows_filtered_total",
            "Rows removed by residual predicates and row filters",
            &["table", "role"],
        );
        let values_masked = counter_vec(
            &registry,
            "riq_values_masked_total",
            "Cell values rewritten by masking rules",
            &["table", "role"],
        );
        let columns_denied = counter_vec(
            &registry,
            "riq_columns_denied_total",
            "Requested columns removed by access policy",
            &["table", "role"],
        );
        let partition_read_seconds = histogram_vec(
            &registry,
            "riq_partition_read_seconds",
            "Time spent reading and policy-applying one partition",
            &["table"],
        );

        Self {
            registry,
            partitions_total,
            partitions_pruned,
            partitions_scanned,
            partitions_skipped,
            partitions_unread,
            rows_emitted,
            rows_filtered,
            values_masked,
            columns_denied,
            partition_read_seconds,
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
