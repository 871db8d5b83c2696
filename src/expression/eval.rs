use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::counters::dimension::{CounterInstanceId, Dimension};
use crate::counters::record::SampleRecord;

use super::node::{ExpressionNode, NodeKind};
use super::parse::{BinaryOp, ReduceOp};
use super::EvaluateError;

/// Base-counter samples keyed by metric id.
pub type BaseSamples = HashMap<u64, Vec<SampleRecord>>;

/// Owned intermediate vectors produced while evaluating a tree.
///
/// Reusing one cache across calls keeps its allocations warm. Results
/// returned by [`ExpressionNode::evaluate`] borrow from it.
#[derive(Debug, Default)]
pub struct EvalCache {
    slots: Vec<Vec<SampleRecord>>,
}

impl EvalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    fn push(&mut self, records: Vec<SampleRecord>) -> Slot {
        self.slots.push(records);
        Slot::Cached(self.slots.len() - 1)
    }
}

/// Where a node's result lives: straight in the caller's samples, or in
/// the cache.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Base(u64),
    Cached(usize),
}

fn resolve<'a>(slot: Slot, base: &'a BaseSamples, cache: &'a EvalCache) -> &'a [SampleRecord] {
    match slot {
        Slot::Base(id) => base.get(&id).map(Vec::as_slice).unwrap_or(&[]),
        Slot::Cached(idx) => cache.slots.get(idx).map(Vec::as_slice).unwrap_or(&[]),
    }
}

impl ExpressionNode {
    /// Evaluates the tree against collected base samples.
    ///
    /// On error the cache is left exactly as it was before the call.
    pub fn evaluate<'a>(
        &self,
        base: &'a BaseSamples,
        cache: &'a mut EvalCache,
    ) -> Result<&'a [SampleRecord], EvaluateError> {
        let mark = cache.len();
        match self.eval_slot(base, cache) {
            Ok(slot) => Ok(resolve(slot, base, cache)),
            Err(e) => {
                cache.slots.truncate(mark);
                Err(e)
            }
        }
    }

    fn eval_slot(&self, base: &BaseSamples, cache: &mut EvalCache) -> Result<Slot, EvaluateError> {
        let slot = match self.kind() {
            NodeKind::Number(v) => cache.push(vec![SampleRecord::new(CounterInstanceId::default(), *v)]),
            NodeKind::Reference(metric) | NodeKind::Accumulate { metric, .. } => {
                if !base.contains_key(&metric.id) {
                    return Err(EvaluateError::MissingBaseCounter {
                        metric: metric.name.clone(),
                        id: metric.id,
                    });
                }
                Slot::Base(metric.id)
            }
            NodeKind::Binary { op, lhs, rhs } => {
                let l = lhs.eval_slot(base, cache)?;
                let r = rhs.eval_slot(base, cache)?;
                let out = binary(
                    *op,
                    resolve(l, base, cache),
                    resolve(r, base, cache),
                )?;
                cache.push(out)
            }
            NodeKind::Reduce {
                child,
                op,
                dimensions,
            } => {
                let c = child.eval_slot(base, cache)?;
                let out = reduce(resolve(c, base, cache), *op, dimensions);
                cache.push(out)
            }
            NodeKind::Select { child, filters } => {
                let c = child.eval_slot(base, cache)?;
                let out = select(resolve(c, base, cache), filters);
                cache.push(out)
            }
        };

        let Some(out_id) = self.out_id() else {
            return Ok(slot);
        };

        let mut records = match slot {
            // Base samples are borrowed; tag a copy.
            Slot::Base(_) => resolve(slot, base, cache).to_vec(),
            Slot::Cached(idx) => std::mem::take(&mut cache.slots[idx]),
        };
        for record in &mut records {
            record.id = record.id.encode_counter(out_id)?;
        }
        match slot {
            Slot::Base(_) => Ok(cache.push(records)),
            Slot::Cached(idx) => {
                cache.slots[idx] = records;
                Ok(slot)
            }
        }
    }
}

fn binary(
    op: BinaryOp,
    lhs: &[SampleRecord],
    rhs: &[SampleRecord],
) -> Result<Vec<SampleRecord>, EvaluateError> {
    if lhs.len() == rhs.len() {
        return Ok(lhs
            .iter()
            .zip(rhs)
            .map(|(l, r)| l.with_value(op.apply(l.value, r.value)))
            .collect());
    }

    match (lhs, rhs) {
        ([l], _) => Ok(rhs
            .iter()
            .map(|r| r.with_value(op.apply(l.value, r.value)))
            .collect()),
        (_, [r]) => Ok(lhs
            .iter()
            .map(|l| l.with_value(op.apply(l.value, r.value)))
            .collect()),
        _ => Err(EvaluateError::SizeMismatch {
            lhs: lhs.len(),
            rhs: rhs.len(),
        }),
    }
}

fn combine(op: ReduceOp, acc: f64, value: f64) -> f64 {
    match op {
        ReduceOp::Min => acc.min(value),
        ReduceOp::Max => acc.max(value),
        ReduceOp::Sum | ReduceOp::Avg => acc + value,
    }
}

/// Collapses records with the chosen operator.
///
/// Without dimensions everything folds into one record carrying the first
/// record's counter and attribution. With dimensions, the listed positions
/// are cleared and records sharing the resulting key are merged, in
/// first-seen order.
fn reduce(records: &[SampleRecord], op: ReduceOp, dims: &[Dimension]) -> Vec<SampleRecord> {
    let Some(first) = records.first() else {
        return Vec::new();
    };

    if dims.is_empty() {
        let total = records[1..]
            .iter()
            .fold(first.value, |acc, r| combine(op, acc, r.value));
        let value = match op {
            ReduceOp::Avg => total / records.len() as f64,
            _ => total,
        };
        let id = first.id.clear_dimension(Dimension::None);
        return vec![first.with_id(id).with_value(value)];
    }

    let mut groups: Vec<(SampleRecord, usize)> = Vec::new();
    let mut index: HashMap<CounterInstanceId, usize> = HashMap::new();
    for record in records {
        let key = dims
            .iter()
            .fold(record.id, |id, dim| id.clear_dimension(*dim));
        match index.get(&key) {
            Some(&i) => {
                let (acc, count) = &mut groups[i];
                acc.value = combine(op, acc.value, record.value);
                *count += 1;
            }
            None => {
                index.insert(key, groups.len());
                groups.push((record.with_id(key), 1));
            }
        }
    }

    groups
        .into_iter()
        .map(|(record, count)| match op {
            ReduceOp::Avg => record.with_value(record.value / count as f64),
            _ => record,
        })
        .collect()
}

/// Keeps records whose position on every filtered dimension is allowed,
/// then pins those dimensions to position 0.
fn select(
    records: &[SampleRecord],
    filters: &BTreeMap<Dimension, BTreeSet<u64>>,
) -> Vec<SampleRecord> {
    records
        .iter()
        .filter(|r| {
            filters
                .iter()
                .all(|(dim, allowed)| allowed.contains(&r.id.decode_dimension(*dim)))
        })
        .map(|r| {
            let id = filters
                .keys()
                .fold(r.id, |id, dim| id.clear_dimension(*dim));
            r.with_id(id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::dimension::MetricDimension;
    use crate::counters::metric::{MetricCatalog, MetricDefinition};

    fn catalog() -> MetricCatalog {
        let mut catalog = MetricCatalog::new();
        catalog.register_block(
            "gfx90a",
            "SQ",
            vec![
                MetricDimension::new(Dimension::Xcc, 2),
                MetricDimension::new(Dimension::ShaderEngine, 4),
            ],
        );
        for name in ["A", "B"] {
            catalog
                .register(MetricDefinition {
                    name: name.into(),
                    architecture: "gfx90a".into(),
                    block: "SQ".into(),
                    ..Default::default()
                })
                .expect("register");
        }
        catalog
    }

    /// Eight samples laid out as xcc in 0..2, shader engine in 0..4.
    fn samples(counter_id: u64, values: [f64; 8]) -> Vec<SampleRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let id = CounterInstanceId::pack(
                    counter_id,
                    &[
                        (Dimension::Xcc, i as u64 / 4),
                        (Dimension::ShaderEngine, i as u64 % 4),
                    ],
                )
                .expect("pack");
                SampleRecord::new(id, *v)
            })
            .collect()
    }

    fn base(catalog: &MetricCatalog) -> BaseSamples {
        let a = catalog.by_name("gfx90a", "A").expect("A").id;
        let b = catalog.by_name("gfx90a", "B").expect("B").id;
        let mut base = BaseSamples::new();
        base.insert(a, samples(a, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]));
        base.insert(b, samples(b, [2.0, 0.0, 2.0, 0.0, 4.0, 0.0, 1.0, 0.5]));
        base
    }

    fn eval(input: &str) -> Result<Vec<SampleRecord>, EvaluateError> {
        let catalog = catalog();
        let base = base(&catalog);
        let node = ExpressionNode::parse(input, &catalog, "gfx90a")?;
        let mut cache = EvalCache::new();
        node.evaluate(&base, &mut cache).map(<[SampleRecord]>::to_vec)
    }

    fn values(records: &[SampleRecord]) -> Vec<f64> {
        records.iter().map(|r| r.value).collect()
    }

    #[test]
    fn test_number_is_single_record() {
        let out = eval("42").expect("eval");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 42.0);
        assert_eq!(out[0].id.decode_counter(), 0);
    }

    #[test]
    fn test_elementwise_addition_keeps_lhs_ids() {
        let catalog = catalog();
        let base = base(&catalog);
        let a = catalog.by_name("gfx90a", "A").expect("A").id;

        let node = ExpressionNode::parse("A + B", &catalog, "gfx90a").expect("parse");
        let mut cache = EvalCache::new();
        let out = node.evaluate(&base, &mut cache).expect("eval");
        assert_eq!(values(out), vec![3.0, 2.0, 5.0, 4.0, 9.0, 6.0, 8.0, 8.5]);
        assert!(out.iter().all(|r| r.id.decode_counter() == a));
    }

    #[test]
    fn test_broadcast_scalar() {
        let out = eval("5 * A").expect("eval");
        assert_eq!(values(&out), vec![5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0]);

        let a = samples(1, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        for (got, want) in out.iter().zip(&a) {
            assert_eq!(got.id, want.id);
        }

        let out = eval("A / 2").expect("eval");
        assert_eq!(out[7].value, 4.0);
        let out = eval("10 - A").expect("eval");
        assert_eq!(out[0].value, 9.0);
    }

    #[test]
    fn test_divide_by_zero_yields_zero() {
        let out = eval("A / B").expect("eval");
        assert_eq!(values(&out), vec![0.5, 0.0, 1.5, 0.0, 1.25, 0.0, 7.0, 16.0]);
    }

    #[test]
    fn test_size_mismatch() {
        let err = eval("A + reduce(B, sum, [DIMENSION_SHADER_ENGINE])").unwrap_err();
        assert_eq!(err, EvaluateError::SizeMismatch { lhs: 8, rhs: 2 });
    }

    #[test]
    fn test_reduce_all() {
        assert_eq!(values(&eval("reduce(A, max)").expect("eval")), vec![8.0]);
        assert_eq!(values(&eval("reduce(A, min)").expect("eval")), vec![1.0]);
        assert_eq!(values(&eval("reduce(A, sum)").expect("eval")), vec![36.0]);
        let avg = eval("reduce(A, avg)").expect("eval");
        assert!((avg[0].value - 4.5).abs() < 1e-12);
        assert_eq!(avg[0].id.decode_counter(), 1);
        assert_eq!(avg[0].id.decode_dimension(Dimension::None), 0);
    }

    #[test]
    fn test_reduce_single_element_is_identity() {
        let one = eval("reduce(reduce(A, sum), sum)").expect("eval");
        let inner = eval("reduce(A, sum)").expect("eval");
        assert_eq!(one, inner);
    }

    #[test]
    fn test_reduce_by_dimension() {
        let out = eval("reduce(A, sum, [DIMENSION_SHADER_ENGINE])").expect("eval");
        assert_eq!(values(&out), vec![10.0, 26.0]);
        assert_eq!(out[1].id.decode_dimension(Dimension::Xcc), 1);
        assert_eq!(out[1].id.decode_dimension(Dimension::ShaderEngine), 0);

        let out = eval("reduce(A, avg, [DIMENSION_XCC])").expect("eval");
        assert_eq!(values(&out), vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(out[3].id.decode_dimension(Dimension::ShaderEngine), 3);
    }

    #[test]
    fn test_select() {
        let out = eval("select(A, [DIMENSION_SHADER_ENGINE=[1, 3]])").expect("eval");
        assert_eq!(values(&out), vec![2.0, 4.0, 6.0, 8.0]);
        assert!(out
            .iter()
            .all(|r| r.id.decode_dimension(Dimension::ShaderEngine) == 0));
        assert_eq!(out[2].id.decode_dimension(Dimension::Xcc), 1);

        let out = eval("select(A, [DIMENSION_XCC=[1], DIMENSION_SHADER_ENGINE=[0]])").expect("eval");
        assert_eq!(values(&out), vec![5.0]);
    }

    #[test]
    fn test_reduce_and_select_empty_input() {
        assert!(reduce(&[], ReduceOp::Sum, &[]).is_empty());
        assert!(select(&[], &BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_missing_base_counter_leaves_cache_untouched() {
        let catalog = catalog();
        let mut base = base(&catalog);
        let b = catalog.by_name("gfx90a", "B").expect("B").id;
        base.remove(&b);

        let node = ExpressionNode::parse("(A * 2) + B", &catalog, "gfx90a").expect("parse");
        let mut cache = EvalCache::new();
        let err = node.evaluate(&base, &mut cache).unwrap_err();
        assert_eq!(
            err,
            EvaluateError::MissingBaseCounter {
                metric: "B".into(),
                id: b
            }
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_out_id_retags_counter_bits() {
        let catalog = catalog();
        let base = base(&catalog);

        let mut node = ExpressionNode::parse("A", &catalog, "gfx90a").expect("parse");
        node.set_out_id(77).expect("out id");
        let mut cache = EvalCache::new();
        let out = node.evaluate(&base, &mut cache).expect("eval");
        assert!(out.iter().all(|r| r.id.decode_counter() == 77));
        assert_eq!(out[5].id.decode_dimension(Dimension::ShaderEngine), 1);

        // The caller's samples are not rewritten.
        assert!(base[&1].iter().all(|r| r.id.decode_counter() == 1));
    }
}
