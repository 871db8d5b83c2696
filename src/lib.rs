//! Accelerator performance-counter evaluation and buffered record delivery.
//!
//! Raw hardware samples are combined into derived metrics by
//! [`expression::Evaluator`] and handed to consumers in batches through
//! [`buffer::BufferService`].

pub mod buffer;
pub mod config;
pub mod counters;
pub mod expression;
