//! Bounded record buffering: a byte ring, typed record headers over it, and
//! the service that drains full buffers to consumers.

pub mod header;
pub mod metrics;
pub mod ring;
pub mod service;

pub use header::{Record, RecordHeaderBuffer, RecordRef, MIN_RECORD_SIZE};
pub use metrics::BufferMetrics;
pub use ring::{RingBuffer, RingError, Slot};
pub use service::{
    delivery, BufferConfig, BufferError, BufferId, BufferService, DeliveryCallback, Emplaced,
    FlushBatch, Policy, ServiceOptions,
};
