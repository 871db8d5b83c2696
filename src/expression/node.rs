use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::counters::dimension::{Dimension, DimensionError, MetricDimension, MAX_COUNTER_ID};
use crate::counters::metric::{Metric, MetricCatalog};

use super::parse::{parse_expression, AccumulateMode, BinaryOp, Expr, ReduceOp};
use super::EvaluateError;

/// Operation performed by an [`ExpressionNode`].
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Number(f64),
    Reference(Metric),
    Accumulate {
        metric: Metric,
        mode: AccumulateMode,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<ExpressionNode>,
        rhs: Box<ExpressionNode>,
    },
    Reduce {
        child: Box<ExpressionNode>,
        op: ReduceOp,
        dimensions: Vec<Dimension>,
    },
    Select {
        child: Box<ExpressionNode>,
        filters: BTreeMap<Dimension, BTreeSet<u64>>,
    },
}

/// A node of a resolved expression tree.
///
/// Each node owns its children. Trees are acyclic by construction; once
/// [`ExpressionNode::expand_derived`] has run, every reference points at a
/// base counter or a constant.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionNode {
    kind: NodeKind,
    dimensions: Vec<MetricDimension>,
    out_id: Option<u64>,
    expanded: bool,
}

impl ExpressionNode {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            dimensions: Vec::new(),
            out_id: None,
            expanded: false,
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Dimensions computed by the last [`ExpressionNode::set_dimensions`] call.
    pub fn dimensions(&self) -> &[MetricDimension] {
        &self.dimensions
    }

    pub fn out_id(&self) -> Option<u64> {
        self.out_id
    }

    /// Resolves a parsed expression against the catalog.
    pub fn from_expr(
        expr: &Expr,
        catalog: &MetricCatalog,
        architecture: &str,
    ) -> Result<Self, EvaluateError> {
        let lookup = |name: &str| {
            catalog
                .by_name(architecture, name)
                .cloned()
                .ok_or_else(|| EvaluateError::UnknownMetric {
                    architecture: architecture.to_string(),
                    name: name.to_string(),
                })
        };

        let kind = match expr {
            Expr::Number(v) => NodeKind::Number(*v),
            Expr::Metric(name) => NodeKind::Reference(lookup(name)?),
            Expr::Accumulate { metric, mode } => NodeKind::Accumulate {
                metric: lookup(metric)?,
                mode: *mode,
            },
            Expr::Binary { op, lhs, rhs } => NodeKind::Binary {
                op: *op,
                lhs: Box::new(Self::from_expr(lhs, catalog, architecture)?),
                rhs: Box::new(Self::from_expr(rhs, catalog, architecture)?),
            },
            Expr::Reduce {
                expr,
                op,
                dimensions,
            } => NodeKind::Reduce {
                child: Box::new(Self::from_expr(expr, catalog, architecture)?),
                op: *op,
                dimensions: dimensions.clone(),
            },
            Expr::Select { expr, filters } => NodeKind::Select {
                child: Box::new(Self::from_expr(expr, catalog, architecture)?),
                filters: filters.clone(),
            },
        };

        Ok(Self::new(kind))
    }

    /// Parses and resolves an expression string.
    pub fn parse(
        input: &str,
        catalog: &MetricCatalog,
        architecture: &str,
    ) -> Result<Self, EvaluateError> {
        let expr = parse_expression(input)?;
        Self::from_expr(&expr, catalog, architecture)
    }

    /// Builds the tree for a metric: its own expression when derived,
    /// otherwise a single reference to itself.
    pub fn for_metric(metric: &Metric, catalog: &MetricCatalog) -> Result<Self, EvaluateError> {
        if !metric.is_derived() {
            return Ok(Self::new(NodeKind::Reference(metric.clone())));
        }
        let expr =
            parse_expression(&metric.expression).map_err(|source| EvaluateError::Parse {
                metric: metric.name.clone(),
                source,
            })?;
        Self::from_expr(&expr, catalog, &metric.architecture)
    }

    /// Tags every record this node produces with `counter_id`.
    pub fn set_out_id(&mut self, counter_id: u64) -> Result<(), DimensionError> {
        if counter_id > MAX_COUNTER_ID {
            return Err(DimensionError::CounterIdOverflow { counter_id });
        }
        self.out_id = Some(counter_id);
        Ok(())
    }

    /// Infers the dimension layout of every node, bottom-up.
    pub fn set_dimensions(
        &mut self,
        catalog: &MetricCatalog,
    ) -> Result<&[MetricDimension], EvaluateError> {
        let dims = match &mut self.kind {
            NodeKind::Number(_) => vec![MetricDimension::scalar()],
            NodeKind::Reference(metric) | NodeKind::Accumulate { metric, .. } => {
                if metric.is_constant() {
                    vec![MetricDimension::scalar()]
                } else {
                    catalog.block_dimensions(&metric.architecture, &metric.block)
                }
            }
            NodeKind::Binary { lhs, rhs, .. } => {
                let l = lhs.set_dimensions(catalog)?.to_vec();
                let r = rhs.set_dimensions(catalog)?.to_vec();
                if l == r {
                    l
                } else if is_scalar(&l) || (l.len() == 1 && r.len() > 1) {
                    r
                } else if is_scalar(&r) || (r.len() == 1 && l.len() > 1) {
                    l
                } else {
                    return Err(EvaluateError::DimensionMismatch {
                        lhs: format_dimensions(&l),
                        rhs: format_dimensions(&r),
                    });
                }
            }
            NodeKind::Reduce {
                child, dimensions, ..
            } => {
                let child_dims = child.set_dimensions(catalog)?;
                if dimensions.is_empty() {
                    vec![MetricDimension::scalar()]
                } else {
                    remaining_dimensions(child_dims, |d| dimensions.contains(&d))
                }
            }
            NodeKind::Select { child, filters } => {
                let child_dims = child.set_dimensions(catalog)?;
                remaining_dimensions(child_dims, |d| filters.contains_key(&d))
            }
        };

        self.dimensions = dims;
        Ok(&self.dimensions)
    }

    /// Replaces references to derived metrics with their expanded subtrees.
    ///
    /// Each node expands at most once.
    pub fn expand_derived(&mut self, expander: &mut Expander<'_>) -> Result<(), EvaluateError> {
        if self.expanded {
            return Ok(());
        }

        match &mut self.kind {
            NodeKind::Reference(metric) if metric.is_derived() => {
                let out_id = self.out_id;
                let metric = metric.clone();
                *self = expander.expanded(&metric)?;
                if out_id.is_some() {
                    self.out_id = out_id;
                }
            }
            NodeKind::Binary { lhs, rhs, .. } => {
                lhs.expand_derived(expander)?;
                rhs.expand_derived(expander)?;
            }
            NodeKind::Reduce { child, .. } | NodeKind::Select { child, .. } => {
                child.expand_derived(expander)?;
            }
            NodeKind::Number(_) | NodeKind::Reference(_) | NodeKind::Accumulate { .. } => {}
        }

        self.expanded = true;
        Ok(())
    }

    /// Collects the distinct base metrics this tree reads, keyed by id.
    ///
    /// Derived references that were not expanded are followed through their
    /// expressions. Revisiting a metric already on the path is reported as
    /// [`EvaluateError::CyclicDefinition`].
    pub fn get_required_counters(
        &self,
        catalog: &MetricCatalog,
        required: &mut BTreeMap<u64, Metric>,
    ) -> Result<(), EvaluateError> {
        let mut path = Vec::new();
        self.collect_required(catalog, required, &mut path)
    }

    fn collect_required(
        &self,
        catalog: &MetricCatalog,
        required: &mut BTreeMap<u64, Metric>,
        path: &mut Vec<String>,
    ) -> Result<(), EvaluateError> {
        match &self.kind {
            NodeKind::Number(_) => Ok(()),
            NodeKind::Reference(metric) | NodeKind::Accumulate { metric, .. } => {
                if !metric.is_derived() {
                    required.entry(metric.id).or_insert_with(|| metric.clone());
                    return Ok(());
                }
                if path.contains(&metric.name) {
                    path.push(metric.name.clone());
                    return Err(EvaluateError::CyclicDefinition {
                        chain: path.join(" -> "),
                    });
                }
                path.push(metric.name.clone());
                Self::for_metric(metric, catalog)?.collect_required(catalog, required, path)?;
                path.pop();
                Ok(())
            }
            NodeKind::Binary { lhs, rhs, .. } => {
                lhs.collect_required(catalog, required, path)?;
                rhs.collect_required(catalog, required, path)
            }
            NodeKind::Reduce { child, .. } | NodeKind::Select { child, .. } => {
                child.collect_required(catalog, required, path)
            }
        }
    }

    /// Base metrics read through `accumulate(...)`, with their mode.
    pub fn accumulate_requests(&self, out: &mut Vec<(Metric, AccumulateMode)>) {
        match &self.kind {
            NodeKind::Accumulate { metric, mode } => {
                if !out.iter().any(|(m, _)| m.id == metric.id) {
                    out.push((metric.clone(), *mode));
                }
            }
            NodeKind::Binary { lhs, rhs, .. } => {
                lhs.accumulate_requests(out);
                rhs.accumulate_requests(out);
            }
            NodeKind::Reduce { child, .. } | NodeKind::Select { child, .. } => {
                child.accumulate_requests(out);
            }
            NodeKind::Number(_) | NodeKind::Reference(_) => {}
        }
    }
}

/// Memoizes expanded trees per metric while detecting definition cycles.
pub struct Expander<'c> {
    catalog: &'c MetricCatalog,
    done: HashMap<u64, ExpressionNode>,
    path: Vec<u64>,
}

impl<'c> Expander<'c> {
    pub fn new(catalog: &'c MetricCatalog) -> Self {
        Self {
            catalog,
            done: HashMap::new(),
            path: Vec::new(),
        }
    }

    /// Returns the fully expanded tree of `metric`, building it at most once.
    pub fn expanded(&mut self, metric: &Metric) -> Result<ExpressionNode, EvaluateError> {
        if let Some(node) = self.done.get(&metric.id) {
            return Ok(node.clone());
        }

        if self.path.contains(&metric.id) {
            let mut chain: Vec<String> = self
                .path
                .iter()
                .filter_map(|id| self.catalog.by_id(*id))
                .map(|m| m.name.clone())
                .collect();
            chain.push(metric.name.clone());
            self.path.clear();
            return Err(EvaluateError::CyclicDefinition {
                chain: chain.join(" -> "),
            });
        }

        self.path.push(metric.id);
        let mut node = ExpressionNode::for_metric(metric, self.catalog)?;
        // A base counter's tree is just a reference to itself.
        node.expanded = !metric.is_derived();
        node.expand_derived(self)?;
        self.path.pop();

        self.done.insert(metric.id, node.clone());
        Ok(node)
    }
}

fn remaining_dimensions(
    dims: &[MetricDimension],
    removed: impl Fn(Dimension) -> bool,
) -> Vec<MetricDimension> {
    let kept: Vec<MetricDimension> = dims
        .iter()
        .copied()
        .filter(|d| !removed(d.dimension))
        .collect();
    if kept.is_empty() {
        vec![MetricDimension::scalar()]
    } else {
        kept
    }
}

fn is_scalar(dims: &[MetricDimension]) -> bool {
    dims == [MetricDimension::scalar()]
}

fn format_dimensions(dims: &[MetricDimension]) -> String {
    let parts: Vec<String> = dims
        .iter()
        .map(|d| format!("{}:{}", d.dimension, d.size))
        .collect();
    format!("[{}]", parts.join(", "))
}
