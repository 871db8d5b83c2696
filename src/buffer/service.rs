use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::header::{Record, RecordHeaderBuffer, RecordRef};
use super::metrics::{BufferMetrics, InstanceMetrics};

pub type BufferId = u64;

/// Record buffers behind every logical buffer. One receives records while
/// the other drains.
const INTERNAL_BUFFERS: usize = 2;

/// What happens when a record does not fit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Count the record as dropped and return immediately.
    ///
    /// Never waits on the consumer: a record that would have to wait for a
    /// drain is dropped too.
    #[default]
    Discard,
    /// Flush, wait, and retry until the record is stored.
    ///
    /// A consumer that never returns from its callback blocks producers
    /// forever; no timeout applies.
    Lossless,
}

/// Settings of one logical buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferConfig {
    /// Metric label; the buffer id when empty.
    pub name: String,
    pub context_id: u64,
    /// Bytes per internal record buffer.
    pub size: usize,
    /// Fill level in bytes that triggers a background flush. 0 disables it.
    pub watermark: usize,
    pub policy: Policy,
    /// Opaque value handed back with every batch.
    pub user_data: u64,
}

/// One drained batch as seen by the delivery callback.
///
/// Records borrow the buffer's storage and are reused once the callback
/// returns.
#[derive(Debug)]
pub struct FlushBatch<'a> {
    pub context_id: u64,
    pub buffer_id: BufferId,
    pub records: &'a [RecordRef<'a>],
    pub user_data: u64,
    /// Records dropped by this buffer since it was configured.
    pub drop_count: u64,
}

impl FlushBatch<'_> {
    pub fn count(&self) -> usize {
        self.records.len()
    }
}

pub type DeliveryCallback = Arc<dyn Fn(&FlushBatch<'_>) + Send + Sync>;

/// Wraps a closure as a [`DeliveryCallback`].
pub fn delivery<F>(f: F) -> DeliveryCallback
where
    F: Fn(&FlushBatch<'_>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Outcome of a successful [`BufferService::emplace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emplaced {
    Stored,
    /// The buffer was full under [`Policy::Discard`].
    Dropped,
}

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("unknown buffer {id}")]
    UnknownBuffer { id: BufferId },

    #[error("buffer {id} is not configured")]
    NotConfigured { id: BufferId },

    #[error("buffer {id} is already configured")]
    AlreadyConfigured { id: BufferId },

    #[error("buffer {id} is already flushing")]
    Busy { id: BufferId },

    #[error("record of {size} bytes can never fit buffer {id} of {capacity} bytes")]
    RecordTooLarge {
        id: BufferId,
        size: usize,
        capacity: usize,
    },

    #[error("invalid buffer config: {0}")]
    InvalidConfig(String),

    #[error("flush of buffer {id} did not complete")]
    FlushAborted { id: BufferId },

    #[error("starting flush workers: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("registering buffer metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Service-wide settings.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Threads available to drain tasks.
    pub flush_workers: usize,
    /// Sleep between checks while waiting on a busy buffer.
    pub busy_poll_interval: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            flush_workers: 2,
            busy_poll_interval: Duration::from_micros(100),
        }
    }
}

struct BufferInstance {
    id: BufferId,
    label: String,
    config: BufferConfig,
    buffers: Box<[RecordHeaderBuffer]>,
    buffer_idx: AtomicUsize,
    drop_count: AtomicU64,
    /// Set by the first drop after a flush, for logging.
    dropping: AtomicBool,
    busy: AtomicBool,
    /// Set once `destroy` has taken the buffer out of the registry.
    destroyed: AtomicBool,
    /// `emplace` calls holding this instance.
    active: AtomicU64,
    callback: DeliveryCallback,
    metrics: InstanceMetrics,
}

impl BufferInstance {
    fn current(&self) -> &RecordHeaderBuffer {
        &self.buffers[self.buffer_idx.load(Ordering::Acquire) % self.buffers.len()]
    }

    fn drain(&self, index: usize) {
        let start = Instant::now();
        let delivered = self.buffers[index].process_record_headers(true, |records| {
            if records.is_empty() {
                return 0;
            }
            (self.callback)(&FlushBatch {
                context_id: self.config.context_id,
                buffer_id: self.id,
                records,
                user_data: self.config.user_data,
                drop_count: self.drop_count.load(Ordering::Acquire),
            });
            records.len()
        });
        self.dropping.store(false, Ordering::Release);

        let elapsed = start.elapsed();
        self.metrics.flushes.inc();
        self.metrics.batch_size.observe(delivered as f64);
        self.metrics.duration.observe(elapsed.as_secs_f64());

        debug!(
            buffer = self.id,
            internal = index,
            records = delivered,
            elapsed_us = elapsed.as_micros() as u64,
            "Flushed buffer"
        );
    }
}

/// Counts one `emplace` against an instance until dropped.
struct ActiveGuard<'a>(&'a AtomicU64);

impl<'a> ActiveGuard<'a> {
    fn enter(active: &'a AtomicU64) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Clears a busy flag when dropped, including on callback panic.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Registry of logical record buffers and the workers that drain them.
///
/// Producers call [`BufferService::emplace`] from any thread. Drains run
/// on a dedicated pool; a flush either returns at once or blocks until its
/// drain has delivered. Dropping the service flushes every buffer.
pub struct BufferService {
    buffers: DashMap<BufferId, Option<Arc<BufferInstance>>>,
    next_id: AtomicU64,
    options: ServiceOptions,
    metrics: BufferMetrics,
    runtime: Runtime,
}

impl BufferService {
    pub fn new(options: ServiceOptions) -> Result<Self, BufferError> {
        Self::with_metrics(options, BufferMetrics::new()?)
    }

    pub fn with_metrics(options: ServiceOptions, metrics: BufferMetrics) -> Result<Self, BufferError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(options.flush_workers.max(1))
            .thread_name("counterflow-flush")
            .build()?;

        Ok(Self {
            buffers: DashMap::new(),
            next_id: AtomicU64::new(1),
            options,
            metrics,
            runtime,
        })
    }

    pub fn metrics(&self) -> &BufferMetrics {
        &self.metrics
    }

    /// Reserves a buffer id. No memory is allocated until configured.
    pub fn allocate(&self) -> BufferId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers.insert(id, None);
        debug!(buffer = id, "Allocated buffer");
        id
    }

    /// Allocates the internal record buffers of `id`.
    pub fn configure(
        &self,
        id: BufferId,
        config: BufferConfig,
        callback: DeliveryCallback,
    ) -> Result<(), BufferError> {
        if config.size == 0 {
            return Err(BufferError::InvalidConfig(format!(
                "buffer {id}: size must be positive"
            )));
        }
        if config.watermark > config.size {
            return Err(BufferError::InvalidConfig(format!(
                "buffer {id}: watermark {} exceeds size {}",
                config.watermark, config.size
            )));
        }

        let mut entry = self
            .buffers
            .get_mut(&id)
            .ok_or(BufferError::UnknownBuffer { id })?;
        if entry.is_some() {
            return Err(BufferError::AlreadyConfigured { id });
        }

        let label = if config.name.is_empty() {
            id.to_string()
        } else {
            config.name.clone()
        };
        let buffers = (0..INTERNAL_BUFFERS)
            .map(|_| RecordHeaderBuffer::new(config.size))
            .collect();

        info!(
            buffer = id,
            name = label.as_str(),
            size = config.size,
            watermark = config.watermark,
            policy = ?config.policy,
            "Configured buffer"
        );

        *entry = Some(Arc::new(BufferInstance {
            id,
            metrics: self.metrics.for_buffer(&label),
            label,
            config,
            buffers,
            buffer_idx: AtomicUsize::new(0),
            drop_count: AtomicU64::new(0),
            dropping: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            active: AtomicU64::new(0),
            callback,
        }));
        Ok(())
    }

    fn instance(&self, id: BufferId) -> Result<Arc<BufferInstance>, BufferError> {
        let entry = self
            .buffers
            .get(&id)
            .ok_or(BufferError::UnknownBuffer { id })?;
        entry
            .as_ref()
            .map(Arc::clone)
            .ok_or(BufferError::NotConfigured { id })
    }

    /// Stores a record in buffer `id`, applying its overflow policy.
    ///
    /// Crossing the watermark starts a background flush. Under
    /// [`Policy::Lossless`] this call blocks while the buffer is full. A
    /// buffer destroyed meanwhile fails with [`BufferError::UnknownBuffer`];
    /// every record reported as stored is delivered by the destroy.
    pub fn emplace<T: Record>(
        &self,
        id: BufferId,
        category: u32,
        kind: u32,
        value: T,
    ) -> Result<Emplaced, BufferError> {
        let inst = self.instance(id)?;
        if !inst.buffers[0].can_hold::<T>() {
            return Err(BufferError::RecordTooLarge {
                id,
                size: mem::size_of::<T>(),
                capacity: inst.config.size,
            });
        }

        let _active = ActiveGuard::enter(&inst.active);
        loop {
            if inst.destroyed.load(Ordering::SeqCst) {
                return Err(BufferError::UnknownBuffer { id });
            }

            let buffer = inst.current();
            let stored = match inst.config.policy {
                Policy::Discard => buffer.try_emplace(category, kind, value),
                Policy::Lossless => buffer.emplace(category, kind, value),
            };
            if stored {
                inst.metrics.emplaced.inc();
                if inst.config.watermark > 0 && buffer.count() >= inst.config.watermark {
                    match self.flush_instance(&inst, false) {
                        Ok(()) | Err(BufferError::Busy { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                return Ok(Emplaced::Stored);
            }

            match inst.config.policy {
                Policy::Discard => {
                    let drops = inst.drop_count.fetch_add(1, Ordering::AcqRel) + 1;
                    inst.metrics.dropped.inc();
                    if !inst.dropping.swap(true, Ordering::AcqRel) {
                        warn!(buffer = id, drop_count = drops, "Buffer full, dropping records");
                    }
                    return Ok(Emplaced::Dropped);
                }
                Policy::Lossless => self.flush_instance(&inst, true)?,
            }
        }
    }

    /// Hands the current internal buffer of `id` to a drain task.
    ///
    /// A flush already in progress makes this return
    /// [`BufferError::Busy`], or wait for it when `wait` is set. With
    /// `wait`, returns once the batch has been delivered.
    pub fn flush(&self, id: BufferId, wait: bool) -> Result<(), BufferError> {
        let inst = self.instance(id)?;
        self.flush_instance(&inst, wait)
    }

    /// Flushes every configured buffer.
    ///
    /// Without `wait`, buffers that are already flushing are skipped. With
    /// `wait`, every internal buffer is drained, so records that landed in
    /// a retired buffer during an earlier drain are delivered too.
    pub fn flush_all(&self, wait: bool) -> Result<(), BufferError> {
        let instances: Vec<Arc<BufferInstance>> = self
            .buffers
            .iter()
            .filter_map(|entry| entry.value().clone())
            .collect();

        let mut first_error = None;
        for inst in instances {
            let result = if wait {
                self.drain_all(&inst)
            } else {
                self.flush_instance(&inst, false)
            };
            match result {
                Ok(()) | Err(BufferError::Busy { .. }) => {}
                Err(e) => {
                    error!(buffer = inst.id, error = %e, "Flush failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn drain_all(&self, inst: &Arc<BufferInstance>) -> Result<(), BufferError> {
        for _ in 0..inst.buffers.len() {
            self.flush_instance(inst, true)?;
        }
        Ok(())
    }

    fn flush_instance(&self, inst: &Arc<BufferInstance>, wait: bool) -> Result<(), BufferError> {
        if inst.busy.swap(true, Ordering::AcqRel) {
            if !wait {
                return Err(BufferError::Busy { id: inst.id });
            }
            while inst.busy.swap(true, Ordering::AcqRel) {
                std::thread::sleep(self.options.busy_poll_interval);
            }
        }

        // New writers move to the other internal buffer before the drain
        // starts.
        let retired = inst.buffer_idx.fetch_add(1, Ordering::AcqRel) % inst.buffers.len();

        let (tx, rx) = oneshot::channel();
        let task = Arc::clone(inst);
        self.runtime.spawn_blocking(move || {
            {
                let _busy = BusyGuard(&task.busy);
                task.drain(retired);
            }
            let _ = tx.send(());
        });

        if wait {
            rx.blocking_recv()
                .map_err(|_| BufferError::FlushAborted { id: inst.id })?;
        }
        Ok(())
    }

    /// Removes buffer `id` and delivers everything it still holds.
    ///
    /// Producers still inside [`BufferService::emplace`] are waited for, so
    /// no record they stored is left behind.
    pub fn destroy(&self, id: BufferId) -> Result<(), BufferError> {
        let (_, entry) = self
            .buffers
            .remove(&id)
            .ok_or(BufferError::UnknownBuffer { id })?;

        if let Some(inst) = entry {
            inst.destroyed.store(true, Ordering::SeqCst);
            while inst.active.load(Ordering::SeqCst) > 0 {
                std::thread::sleep(self.options.busy_poll_interval);
            }
            self.drain_all(&inst)?;
            self.metrics.remove_buffer(&inst.label);
            info!(
                buffer = id,
                drop_count = inst.drop_count.load(Ordering::Acquire),
                "Destroyed buffer"
            );
        }
        Ok(())
    }

    /// Records dropped by buffer `id` since it was configured.
    pub fn drop_count(&self, id: BufferId) -> Result<u64, BufferError> {
        Ok(self.instance(id)?.drop_count.load(Ordering::Acquire))
    }

    /// Internal record buffers backing `id`.
    pub fn buffer_count(&self, id: BufferId) -> Result<usize, BufferError> {
        Ok(self.instance(id)?.buffers.len())
    }

    /// Bytes held by the internal buffer currently receiving records.
    pub fn pending_bytes(&self, id: BufferId) -> Result<usize, BufferError> {
        Ok(self.instance(id)?.current().count())
    }

    /// Ids of every allocated buffer, sorted.
    pub fn buffer_ids(&self) -> Vec<BufferId> {
        let mut ids: Vec<BufferId> = self.buffers.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

impl Drop for BufferService {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all(true) {
            error!(error = %e, "Final buffer flush failed");
        }
    }
}
