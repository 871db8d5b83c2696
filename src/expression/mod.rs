//! Derived-metric expressions: parsing, tree construction and evaluation.

pub mod eval;
pub mod node;
pub mod parse;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::counters::agent::{resolve_agent_property, AgentDescriptor};
use crate::counters::dimension::{CounterInstanceId, DimensionError, MetricDimension};
use crate::counters::metric::{CatalogError, Metric, MetricCatalog};
use crate::counters::record::SampleRecord;

pub use eval::{BaseSamples, EvalCache};
pub use node::{Expander, ExpressionNode, NodeKind};
pub use parse::{parse_expression, AccumulateMode, BinaryOp, Expr, ParseError, ReduceOp};

/// Errors raised while building or evaluating expression trees.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluateError {
    #[error("invalid expression for metric {metric}: {source}")]
    Parse {
        metric: String,
        #[source]
        source: ParseError,
    },

    #[error(transparent)]
    Syntax(#[from] ParseError),

    #[error("unknown metric {name} for architecture {architecture}")]
    UnknownMetric { architecture: String, name: String },

    #[error("cyclic metric definition: {chain}")]
    CyclicDefinition { chain: String },

    #[error("dimension mismatch: {lhs} vs {rhs}")]
    DimensionMismatch { lhs: String, rhs: String },

    #[error("missing samples for base counter {metric} (id {id})")]
    MissingBaseCounter { metric: String, id: u64 },

    #[error("operand size mismatch: {lhs} vs {rhs}")]
    SizeMismatch { lhs: usize, rhs: usize },

    #[error("instance count of metric {metric} overflows")]
    InstanceCountOverflow { metric: String },

    #[error(transparent)]
    Dimension(#[from] DimensionError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Expanded expression trees for every metric of one architecture.
///
/// Trees are built once at construction; evaluation only reads them, so an
/// evaluator can be shared between sampling threads.
#[derive(Debug)]
pub struct Evaluator {
    catalog: Arc<MetricCatalog>,
    architecture: String,
    trees: HashMap<String, ExpressionNode>,
}

impl Evaluator {
    /// Builds, expands and dimension-checks every metric of `architecture`.
    pub fn new(catalog: Arc<MetricCatalog>, architecture: &str) -> Result<Self, EvaluateError> {
        let mut trees = HashMap::new();
        {
            let mut expander = Expander::new(&catalog);
            for metric in catalog.metrics_for_architecture(architecture) {
                let mut node = expander.expanded(metric)?;
                node.set_out_id(metric.id)?;
                node.set_dimensions(&catalog)?;
                trees.insert(metric.name.clone(), node);
            }
        }

        info!(
            architecture = architecture,
            metrics = trees.len(),
            "Built metric evaluator"
        );

        Ok(Self {
            catalog,
            architecture: architecture.to_string(),
            trees,
        })
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    pub fn metric(&self, name: &str) -> Result<&Metric, EvaluateError> {
        self.catalog
            .by_name(&self.architecture, name)
            .ok_or_else(|| self.unknown(name))
    }

    fn tree(&self, name: &str) -> Result<&ExpressionNode, EvaluateError> {
        self.trees.get(name).ok_or_else(|| self.unknown(name))
    }

    fn unknown(&self, name: &str) -> EvaluateError {
        EvaluateError::UnknownMetric {
            architecture: self.architecture.clone(),
            name: name.to_string(),
        }
    }

    /// Distinct base counters the sampler must collect for `name`, in id order.
    pub fn required_counters(&self, name: &str) -> Result<Vec<Metric>, EvaluateError> {
        let mut required = BTreeMap::new();
        self.tree(name)?
            .get_required_counters(&self.catalog, &mut required)?;
        Ok(required.into_values().collect())
    }

    /// Dimension layout of the records produced for `name`.
    pub fn dimensions(&self, name: &str) -> Result<&[MetricDimension], EvaluateError> {
        Ok(self.tree(name)?.dimensions())
    }

    /// Number of records one evaluation of `name` is expected to produce.
    pub fn instance_count(&self, name: &str) -> Result<u64, EvaluateError> {
        self.dimensions(name)?
            .iter()
            .try_fold(1u64, |count, d| count.checked_mul(d.size.max(1)))
            .ok_or_else(|| EvaluateError::InstanceCountOverflow {
                metric: name.to_string(),
            })
    }

    /// Base counters `name` reads through `accumulate(...)`.
    pub fn accumulate_requests(
        &self,
        name: &str,
    ) -> Result<Vec<(Metric, AccumulateMode)>, EvaluateError> {
        let mut out = Vec::new();
        self.tree(name)?.accumulate_requests(&mut out);
        Ok(out)
    }

    /// Evaluates `name` with a scratch cache, returning owned records.
    pub fn evaluate(
        &self,
        name: &str,
        base: &BaseSamples,
    ) -> Result<Vec<SampleRecord>, EvaluateError> {
        let mut cache = EvalCache::new();
        self.evaluate_with_cache(name, base, &mut cache)
            .map(<[SampleRecord]>::to_vec)
    }

    /// Evaluates `name`, borrowing the result from `cache`.
    pub fn evaluate_with_cache<'a>(
        &self,
        name: &str,
        base: &'a BaseSamples,
        cache: &'a mut EvalCache,
    ) -> Result<&'a [SampleRecord], EvaluateError> {
        let tree = self.tree(name)?;
        let out = tree.evaluate(base, cache)?;
        debug!(metric = name, records = out.len(), "Evaluated metric");
        Ok(out)
    }

    /// One sample per constant metric of this architecture, read from `agent`.
    pub fn constant_samples(&self, agent: &AgentDescriptor) -> Result<BaseSamples, EvaluateError> {
        let mut samples = BaseSamples::new();
        for metric in self.catalog.constants_for_architecture(&self.architecture) {
            let value = resolve_agent_property(&metric.constant, agent)?;
            let record = SampleRecord {
                agent_id: agent.agent_id,
                ..SampleRecord::new(CounterInstanceId::default().encode_counter(metric.id)?, value)
            };
            samples.insert(metric.id, vec![record]);
        }
        Ok(samples)
    }
}
