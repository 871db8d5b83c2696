use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "counterflow";

/// Prometheus metrics for record buffers, labelled by buffer.
#[derive(Clone)]
pub struct BufferMetrics {
    registry: Registry,

    /// Records stored.
    pub records_emplaced: CounterVec,
    /// Records dropped under the discard policy.
    pub records_dropped: CounterVec,
    /// Completed drains.
    pub flushes: CounterVec,
    /// Records delivered per drain.
    pub flush_batch_size: HistogramVec,
    /// Time spent draining, callback included (100us-1s buckets).
    pub flush_duration: HistogramVec,
}

impl BufferMetrics {
    /// Creates buffer metrics registered with a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Creates buffer metrics registered with `registry`.
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let records_emplaced = CounterVec::new(
            Opts::new("records_emplaced_total", "Records stored by buffer.").namespace(NAMESPACE),
            &["buffer"],
        )?;
        let records_dropped = CounterVec::new(
            Opts::new(
                "records_dropped_total",
                "Records dropped because the buffer was full.",
            )
            .namespace(NAMESPACE),
            &["buffer"],
        )?;
        let flushes = CounterVec::new(
            Opts::new("flushes_total", "Completed buffer drains.").namespace(NAMESPACE),
            &["buffer"],
        )?;
        let flush_batch_size = HistogramVec::new(
            HistogramOpts::new("flush_batch_size", "Records delivered per drain by buffer.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 100.0, 1000.0, 10000.0, 100000.0]),
            &["buffer"],
        )?;
        let flush_duration = HistogramVec::new(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to drain a buffer and deliver its batch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["buffer"],
        )?;

        registry.register(Box::new(records_emplaced.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_batch_size.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;

        Ok(Self {
            registry,
            records_emplaced,
            records_dropped,
            flushes,
            flush_batch_size,
            flush_duration,
        })
    }

    /// Label-resolved handles for one buffer.
    pub(crate) fn for_buffer(&self, label: &str) -> InstanceMetrics {
        InstanceMetrics {
            emplaced: self.records_emplaced.with_label_values(&[label]),
            dropped: self.records_dropped.with_label_values(&[label]),
            flushes: self.flushes.with_label_values(&[label]),
            batch_size: self.flush_batch_size.with_label_values(&[label]),
            duration: self.flush_duration.with_label_values(&[label]),
        }
    }

    /// Drops the series of a destroyed buffer.
    pub(crate) fn remove_buffer(&self, label: &str) {
        let _ = self.records_emplaced.remove_label_values(&[label]);
        let _ = self.records_dropped.remove_label_values(&[label]);
        let _ = self.flushes.remove_label_values(&[label]);
        let _ = self.flush_batch_size.remove_label_values(&[label]);
        let _ = self.flush_duration.remove_label_values(&[label]);
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Per-buffer handles, resolved once at configure time so the emplace path
/// never looks up labels.
#[derive(Clone)]
pub(crate) struct InstanceMetrics {
    pub emplaced: Counter,
    pub dropped: Counter,
    pub flushes: Counter,
    pub batch_size: Histogram,
    pub duration: Histogram,
}
