use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use super::dimension::{MetricDimension, MAX_COUNTER_ID};

/// Errors raised while building or querying a [`MetricCatalog`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("metric {name} already registered for {architecture}")]
    DuplicateName { architecture: String, name: String },

    #[error("agent property not found: {name}")]
    PropertyNotFound { name: String },

    #[error("metric id space exhausted after {MAX_COUNTER_ID} metrics")]
    IdSpaceExhausted,
}

/// A metric as supplied by a definition source, before it has an id.
#[derive(Debug, Clone, Default)]
pub struct MetricDefinition {
    pub name: String,
    pub architecture: String,
    /// Hardware block (e.g. "SQ", "TCC"). Empty for derived and constant metrics.
    pub block: String,
    /// Hardware event selector within the block.
    pub event: Option<u32>,
    /// Non-empty for derived metrics.
    pub expression: String,
    /// Non-empty when the value is a static agent property.
    pub constant: String,
    pub description: String,
}

/// An immutable, registered metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    pub id: u64,
    pub name: String,
    pub architecture: String,
    pub block: String,
    pub event: Option<u32>,
    pub expression: String,
    pub constant: String,
    pub description: String,
}

impl Metric {
    /// Whether the value is computed from other metrics.
    pub fn is_derived(&self) -> bool {
        !self.expression.is_empty()
    }

    /// Whether the value is a static agent property.
    pub fn is_constant(&self) -> bool {
        !self.constant.is_empty()
    }
}

/// Registry of metric definitions keyed by `(architecture, name)` and by id.
///
/// Ids are assigned in registration order starting at 1 so that counter id 0
/// stays free for literals.
#[derive(Debug, Clone, Default)]
pub struct MetricCatalog {
    metrics: Vec<Metric>,
    by_name: HashMap<String, HashMap<String, u64>>,
    blocks: HashMap<String, HashMap<String, Vec<MetricDimension>>>,
}

impl MetricCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a metric and returns it with its assigned id.
    pub fn register(&mut self, def: MetricDefinition) -> Result<&Metric, CatalogError> {
        let taken = self
            .by_name
            .get(&def.architecture)
            .is_some_and(|names| names.contains_key(&def.name));
        if taken {
            return Err(CatalogError::DuplicateName {
                architecture: def.architecture,
                name: def.name,
            });
        }

        let id = self.metrics.len() as u64 + 1;
        if id > MAX_COUNTER_ID {
            return Err(CatalogError::IdSpaceExhausted);
        }
        self.by_name
            .entry(def.architecture.clone())
            .or_default()
            .insert(def.name.clone(), id);

        self.metrics.push(Metric {
            id,
            name: def.name,
            architecture: def.architecture,
            block: def.block,
            event: def.event,
            expression: def.expression,
            constant: def.constant,
            description: def.description,
        });

        Ok(&self.metrics[self.metrics.len() - 1])
    }

    /// Looks up a metric by architecture and name.
    pub fn by_name(&self, architecture: &str, name: &str) -> Option<&Metric> {
        let id = *self.by_name.get(architecture)?.get(name)?;
        self.by_id(id)
    }

    /// Looks up a metric by id.
    pub fn by_id(&self, id: u64) -> Option<&Metric> {
        let index = usize::try_from(id.checked_sub(1)?).ok()?;
        self.metrics.get(index)
    }

    /// All metrics of an architecture, in id order.
    pub fn metrics_for_architecture<'a>(
        &'a self,
        architecture: &'a str,
    ) -> impl Iterator<Item = &'a Metric> + 'a {
        self.metrics
            .iter()
            .filter(move |m| m.architecture == architecture)
    }

    /// Metrics of an architecture whose value is a static agent property.
    pub fn constants_for_architecture<'a>(
        &'a self,
        architecture: &'a str,
    ) -> impl Iterator<Item = &'a Metric> + 'a {
        self.metrics_for_architecture(architecture)
            .filter(|m| m.is_constant())
    }

    /// Known architectures, sorted.
    pub fn architectures(&self) -> Vec<&str> {
        let mut archs: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        archs.sort_unstable();
        archs
    }

    /// Number of registered metrics across all architectures.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Records the physical dimension layout of a hardware block.
    pub fn register_block(
        &mut self,
        architecture: &str,
        block: &str,
        dimensions: Vec<MetricDimension>,
    ) {
        self.blocks
            .entry(architecture.to_string())
            .or_default()
            .insert(block.to_string(), dimensions);
    }

    /// Dimension layout of a hardware block.
    ///
    /// Unknown or empty layouts report a single instance.
    pub fn block_dimensions(&self, architecture: &str, block: &str) -> Vec<MetricDimension> {
        match self.blocks.get(architecture).and_then(|b| b.get(block)) {
            Some(dims) if !dims.is_empty() => dims.clone(),
            _ => vec![MetricDimension::scalar()],
        }
    }

    /// Block layouts of an architecture, sorted by block name.
    pub fn blocks_for_architecture(&self, architecture: &str) -> BTreeMap<&str, &[MetricDimension]> {
        self.blocks
            .get(architecture)
            .map(|blocks| {
                blocks
                    .iter()
                    .map(|(name, dims)| (name.as_str(), dims.as_slice()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
