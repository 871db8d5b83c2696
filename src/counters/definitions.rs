//! Loading metric definitions from YAML.
//!
//! ```yaml
//! blocks:
//!   gfx90a:
//!     SQ: { DIMENSION_XCC: 1, DIMENSION_SHADER_ENGINE: 8 }
//! metrics:
//!   - name: SQ_WAVES
//!     description: Count of submitted waves.
//!     architectures:
//!       gfx90a/gfx942: { block: SQ, event: 4 }
//!   - name: WAVES_PER_SE
//!     architectures:
//!       gfx90a: { expression: "SQ_WAVES / 8" }
//! ```
//!
//! An architecture key may name several architectures separated by `/`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use super::agent::agent_property_names;
use super::dimension::{Dimension, MetricDimension, MAX_DIMENSION_SIZE};
use super::metric::{CatalogError, MetricCatalog, MetricDefinition};
use crate::expression::{EvaluateError, Evaluator};

/// Errors raised while loading a definition document.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("parsing metric definitions: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("metric {name} has no architectures")]
    NoArchitectures { name: String },

    #[error(
        "block {block} on {architecture}: {dimension} size {size} outside 1..={MAX_DIMENSION_SIZE}"
    )]
    InvalidBlockDimension {
        architecture: String,
        block: String,
        dimension: Dimension,
        size: u64,
    },

    #[error("invalid definitions for {architecture}: {source}")]
    Expression {
        architecture: String,
        #[source]
        source: EvaluateError,
    },
}

#[derive(Debug, Default, Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    blocks: BTreeMap<String, BTreeMap<String, BTreeMap<Dimension, u64>>>,

    #[serde(default)]
    metrics: Vec<MetricEntry>,
}

#[derive(Debug, Deserialize)]
struct MetricEntry {
    name: String,

    #[serde(default)]
    description: String,

    architectures: BTreeMap<String, ArchitectureEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ArchitectureEntry {
    #[serde(default)]
    block: String,

    #[serde(default)]
    event: Option<u32>,

    #[serde(default)]
    expression: String,

    #[serde(default)]
    constant: String,

    /// Overrides the metric-level description.
    #[serde(default)]
    description: Option<String>,
}

/// Parses a definition document into a catalog.
///
/// Block dimensions must fit the instance-id encoding and constants must
/// name a known agent property. Every architecture is checked by building
/// its evaluator, so malformed expressions, unknown references, cycles and
/// dimension mismatches are all rejected here rather than at first use.
pub fn load_definitions(yaml: &str) -> Result<MetricCatalog, DefinitionError> {
    let file: DefinitionFile = serde_yaml::from_str(yaml)?;
    let mut catalog = MetricCatalog::new();

    for (arch, blocks) in &file.blocks {
        for (block, dims) in blocks {
            let dims = dims
                .iter()
                .map(|(dim, size)| {
                    let dimension = MetricDimension::new(*dim, *size);
                    if dimension.is_encodable() {
                        Ok(dimension)
                    } else {
                        Err(DefinitionError::InvalidBlockDimension {
                            architecture: arch.clone(),
                            block: block.clone(),
                            dimension: *dim,
                            size: *size,
                        })
                    }
                })
                .collect::<Result<_, _>>()?;
            catalog.register_block(arch, block, dims);
        }
    }

    for entry in file.metrics {
        if entry.architectures.is_empty() {
            return Err(DefinitionError::NoArchitectures { name: entry.name });
        }

        for (key, arch_entry) in &entry.architectures {
            let constant = arch_entry.constant.trim();
            if !constant.is_empty() && !agent_property_names().any(|p| p == constant) {
                return Err(CatalogError::PropertyNotFound {
                    name: constant.to_string(),
                }
                .into());
            }

            for arch in key.split('/').map(str::trim).filter(|a| !a.is_empty()) {
                catalog.register(MetricDefinition {
                    name: entry.name.clone(),
                    architecture: arch.to_string(),
                    block: arch_entry.block.clone(),
                    event: arch_entry.event,
                    expression: arch_entry.expression.trim().to_string(),
                    constant: constant.to_string(),
                    description: arch_entry
                        .description
                        .clone()
                        .unwrap_or_else(|| entry.description.clone()),
                })?;
            }
        }
    }

    validate(catalog)
}

fn validate(catalog: MetricCatalog) -> Result<MetricCatalog, DefinitionError> {
    let catalog = Arc::new(catalog);
    let architectures: Vec<String> = catalog
        .architectures()
        .into_iter()
        .map(str::to_string)
        .collect();

    for architecture in &architectures {
        let evaluator = Evaluator::new(Arc::clone(&catalog), architecture).map_err(|source| {
            DefinitionError::Expression {
                architecture: architecture.clone(),
                source,
            }
        })?;
        let derived = catalog
            .metrics_for_architecture(architecture)
            .filter(|m| m.is_derived())
            .count();
        info!(
            architecture = architecture.as_str(),
            metrics = catalog.metrics_for_architecture(architecture).count(),
            derived,
            blocks = catalog.blocks_for_architecture(architecture).len(),
            "Loaded metric definitions"
        );
        drop(evaluator);
    }

    // Evaluators were dropped above, so this is the only reference left.
    Ok(Arc::try_unwrap(catalog).unwrap_or_else(|shared| (*shared).clone()))
}

/// Reads and parses a definition file.
pub fn load_definitions_file(path: &Path) -> anyhow::Result<MetricCatalog> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading metric definitions {}", path.display()))?;

    load_definitions(&data)
        .with_context(|| format!("loading metric definitions {}", path.display()))
}
