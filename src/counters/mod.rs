//! Counter identity: the instance-id codec, the metric catalog and the
//! agent properties constant metrics read from.

pub mod agent;
pub mod definitions;
pub mod dimension;
pub mod metric;
pub mod record;

pub use agent::{resolve_agent_property, AgentDescriptor};
pub use definitions::{load_definitions, load_definitions_file, DefinitionError};
pub use dimension::{CounterInstanceId, Dimension, DimensionError, MetricDimension};
pub use metric::{CatalogError, Metric, MetricCatalog, MetricDefinition};
pub use record::SampleRecord;
