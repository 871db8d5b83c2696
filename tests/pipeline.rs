//! End-to-end: definitions -> evaluator -> record buffer -> delivery.

use std::collections::HashMap;
use std::sync::Arc;

use counterflow::buffer::{delivery, BufferConfig, BufferService, Policy, ServiceOptions};
use counterflow::counters::{load_definitions, AgentDescriptor, Dimension, SampleRecord};
use counterflow::expression::{BaseSamples, EvaluateError, Evaluator};
use parking_lot::Mutex;

const DEFINITIONS: &str = r#"
blocks:
  gfx90a:
    SQ: { DIMENSION_XCC: 2, DIMENSION_INSTANCE: 4 }
    TCC: { DIMENSION_XCC: 2, DIMENSION_INSTANCE: 4 }
metrics:
  - name: SQ_WAVES
    architectures:
      gfx90a: { block: SQ, event: 4 }
  - name: TCC_HIT
    architectures:
      gfx90a: { block: TCC, event: 17 }
  - name: TCC_MISS
    architectures:
      gfx90a: { block: TCC, event: 19 }
  - name: SIMD_NUM
    architectures:
      gfx90a: { constant: simd_count }
  - name: BATES
    architectures:
      gfx90a: { expression: "SQ_WAVES + TCC_HIT" }
  - name: TCC_HIT_PEAK
    architectures:
      gfx90a: { expression: "reduce(TCC_HIT, max)" }
  - name: TCC_HIT_AVG
    architectures:
      gfx90a: { expression: "reduce(TCC_HIT, avg)" }
  - name: TCC_HIT_PER_XCC
    architectures:
      gfx90a: { expression: "reduce(TCC_HIT, sum, [DIMENSION_INSTANCE])" }
  - name: TCC_HIT_RATIO
    architectures:
      gfx90a: { expression: "TCC_HIT / TCC_MISS" }
  - name: TCC_REQ
    architectures:
      gfx90a: { expression: "TCC_HIT + TCC_MISS" }
  - name: TCC_REQ_X2
    architectures:
      gfx90a: { expression: "TCC_REQ * 2" }
  - name: WAVES_X5
    architectures:
      gfx90a: { expression: "5 * SQ_WAVES" }
  - name: WAVES_PER_SIMD
    architectures:
      gfx90a: { expression: "reduce(SQ_WAVES, sum) / SIMD_NUM" }
"#;

fn agent() -> AgentDescriptor {
    AgentDescriptor {
        name: "gpu0".into(),
        architecture: "gfx90a".into(),
        agent_id: 3,
        simd_count: 4,
        ..Default::default()
    }
}

fn setup() -> (Evaluator, BaseSamples) {
    let catalog = Arc::new(load_definitions(DEFINITIONS).expect("load definitions"));
    let evaluator = Evaluator::new(catalog, "gfx90a").expect("evaluator");

    let mut base = evaluator.constant_samples(&agent()).expect("constants");
    let inputs: [(&str, Vec<f64>); 3] = [
        ("SQ_WAVES", (1..=8).map(f64::from).collect()),
        ("TCC_HIT", (1..=8).map(|v| f64::from(v * 10)).collect()),
        ("TCC_MISS", (0..8).map(f64::from).collect()),
    ];
    for (name, values) in inputs {
        let metric = evaluator.metric(name).expect("metric");
        let records = SampleRecord::from_values(
            metric.id,
            evaluator.dimensions(name).expect("dims"),
            &values,
        )
        .expect("layout");
        base.insert(metric.id, records);
    }
    (evaluator, base)
}

fn values(records: &[SampleRecord]) -> Vec<f64> {
    records.iter().map(|r| r.value).collect()
}

#[test]
fn test_sum_of_two_counters() {
    let (evaluator, base) = setup();
    let bates = evaluator.evaluate("BATES", &base).expect("evaluate");

    assert_eq!(
        values(&bates),
        vec![11.0, 22.0, 33.0, 44.0, 55.0, 66.0, 77.0, 88.0]
    );
    let id = evaluator.metric("BATES").expect("metric").id;
    for (i, record) in bates.iter().enumerate() {
        assert_eq!(record.id.decode_counter(), id);
        assert_eq!(record.id.decode_dimension(Dimension::Xcc), i as u64 / 4);
        assert_eq!(record.id.decode_dimension(Dimension::Instance), i as u64 % 4);
    }
}

#[test]
fn test_reductions() {
    let (evaluator, base) = setup();

    let peak = evaluator.evaluate("TCC_HIT_PEAK", &base).expect("max");
    assert_eq!(values(&peak), vec![80.0]);

    let avg = evaluator.evaluate("TCC_HIT_AVG", &base).expect("avg");
    assert_eq!(values(&avg), vec![45.0]);

    let per_xcc = evaluator.evaluate("TCC_HIT_PER_XCC", &base).expect("sum");
    assert_eq!(values(&per_xcc), vec![100.0, 260.0]);
    assert_eq!(per_xcc[1].id.decode_dimension(Dimension::Xcc), 1);
    assert_eq!(per_xcc[1].id.decode_dimension(Dimension::Instance), 0);
    assert_eq!(evaluator.instance_count("TCC_HIT_PER_XCC").expect("count"), 2);
}

#[test]
fn test_division_by_zero_yields_zero() {
    let (evaluator, base) = setup();
    let ratio = evaluator.evaluate("TCC_HIT_RATIO", &base).expect("evaluate");
    assert_eq!(ratio[0].value, 0.0);
    assert_eq!(ratio[1].value, 20.0);
    assert_eq!(ratio[7].value, 80.0 / 7.0);
}

#[test]
fn test_derived_chain_requires_base_counters_once() {
    let (evaluator, base) = setup();

    let required: Vec<String> = evaluator
        .required_counters("TCC_REQ_X2")
        .expect("required")
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(required, vec!["TCC_HIT", "TCC_MISS"]);

    let doubled = evaluator.evaluate("TCC_REQ_X2", &base).expect("evaluate");
    assert_eq!(doubled[0].value, 20.0);
    assert_eq!(doubled[7].value, 2.0 * (80.0 + 7.0));
}

#[test]
fn test_scalar_broadcast_keeps_counter_dimensions() {
    let (evaluator, base) = setup();
    assert_eq!(
        evaluator.dimensions("WAVES_X5").expect("dims"),
        evaluator.dimensions("SQ_WAVES").expect("dims")
    );

    let scaled = evaluator.evaluate("WAVES_X5", &base).expect("evaluate");
    assert_eq!(
        values(&scaled),
        vec![5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0]
    );

    let per_simd = evaluator.evaluate("WAVES_PER_SIMD", &base).expect("evaluate");
    assert_eq!(values(&per_simd), vec![36.0 / 4.0]);
}

#[test]
fn test_missing_sample_reports_counter() {
    let (evaluator, mut base) = setup();
    let miss = evaluator.metric("TCC_MISS").expect("metric").id;
    base.remove(&miss);

    match evaluator.evaluate("TCC_REQ_X2", &base) {
        Err(EvaluateError::MissingBaseCounter { metric, .. }) => assert_eq!(metric, "TCC_MISS"),
        other => panic!("expected missing counter, got {other:?}"),
    }
}

#[test]
fn test_evaluated_records_flow_through_buffer() {
    let (evaluator, base) = setup();
    let bates = evaluator.evaluate("BATES", &base).expect("evaluate");
    let kind = evaluator.metric("BATES").expect("metric").id as u32;

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let batches = Arc::new(Mutex::new(HashMap::new()));

    let service = BufferService::new(ServiceOptions::default()).expect("service");
    let id = service.allocate();
    {
        let delivered = Arc::clone(&delivered);
        let batches = Arc::clone(&batches);
        service
            .configure(
                id,
                BufferConfig {
                    name: "pipeline".into(),
                    context_id: 3,
                    size: 4 * std::mem::size_of::<SampleRecord>(),
                    watermark: 2 * std::mem::size_of::<SampleRecord>(),
                    policy: Policy::Lossless,
                    user_data: 99,
                },
                delivery(move |batch| {
                    assert_eq!(batch.context_id, 3);
                    assert_eq!(batch.user_data, 99);
                    *batches.lock().entry(batch.buffer_id).or_insert(0) += 1;
                    delivered.lock().extend(
                        batch
                            .records
                            .iter()
                            .filter(|r| r.kind() == kind)
                            .filter_map(|r| r.payload::<SampleRecord>().copied()),
                    );
                }),
            )
            .expect("configure");
    }

    for record in &bates {
        service.emplace(id, 1, kind, *record).expect("emplace");
    }
    service.flush_all(true).expect("flush");

    assert_eq!(*delivered.lock(), bates);
    assert_eq!(service.drop_count(id).expect("drops"), 0);
    assert!(batches.lock()[&id] >= 2);

    service.destroy(id).expect("destroy");
}
