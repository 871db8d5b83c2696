use std::sync::Arc;

use counterflow::buffer::{
    delivery, BufferConfig, BufferService, Policy, RecordHeaderBuffer, ServiceOptions,
};
use counterflow::counters::{load_definitions, AgentDescriptor, SampleRecord};
use counterflow::expression::{parse_expression, BaseSamples, EvalCache, Evaluator};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const DEFINITIONS: &str = r#"
blocks:
  gfx942:
    SQ: { DIMENSION_XCC: 8, DIMENSION_SHADER_ENGINE: 4 }
    TCC: { DIMENSION_XCC: 8, DIMENSION_INSTANCE: 16 }
metrics:
  - name: SQ_WAVES
    architectures:
      gfx942: { block: SQ, event: 4 }
  - name: SQ_BUSY_CYCLES
    architectures:
      gfx942: { block: SQ, event: 3 }
  - name: TCC_HIT
    architectures:
      gfx942: { block: TCC, event: 17 }
  - name: TCC_MISS
    architectures:
      gfx942: { block: TCC, event: 19 }
  - name: CU_NUM
    architectures:
      gfx942: { constant: cu_count }
  - name: WAVE_OCCUPANCY
    architectures:
      gfx942: { expression: "reduce(SQ_WAVES, sum) / reduce(SQ_BUSY_CYCLES, max) / CU_NUM" }
  - name: TCC_HIT_RATE
    architectures:
      gfx942: { expression: "100 * reduce(TCC_HIT, sum, [DIMENSION_INSTANCE]) / reduce(TCC_HIT + TCC_MISS, sum, [DIMENSION_INSTANCE])" }
"#;

fn build_evaluator_input() -> (Evaluator, BaseSamples) {
    let catalog = Arc::new(load_definitions(DEFINITIONS).expect("definitions"));
    let evaluator = Evaluator::new(catalog, "gfx942").expect("evaluator");

    let agent = AgentDescriptor {
        name: "gpu0".into(),
        architecture: "gfx942".into(),
        cu_count: 304,
        ..Default::default()
    };
    let mut base: BaseSamples = evaluator.constant_samples(&agent).expect("constants");
    for name in ["SQ_WAVES", "SQ_BUSY_CYCLES", "TCC_HIT", "TCC_MISS"] {
        let metric = evaluator.metric(name).expect("metric");
        let count = evaluator.instance_count(name).expect("count") as usize;
        let values: Vec<f64> = (0..count).map(|i| (i * 7 % 113) as f64).collect();
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

fn bench_parse(c: &mut Criterion) {
    let input = "100 * reduce(TCC_HIT, sum, [DIMENSION_INSTANCE]) / \
                 reduce(TCC_HIT + TCC_MISS, sum, [DIMENSION_INSTANCE])";

    c.bench_function("parse_expression/hit_rate", |b| {
        b.iter(|| parse_expression(black_box(input)).expect("parse"))
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let (evaluator, base) = build_evaluator_input();
    let mut cache = EvalCache::new();

    c.bench_function("evaluate/tcc_hit_rate", |b| {
        b.iter(|| {
            cache.clear();
            let out = evaluator
                .evaluate_with_cache(black_box("TCC_HIT_RATE"), &base, &mut cache)
                .expect("evaluate");
            black_box(out.len())
        })
    });

    c.bench_function("evaluate/wave_occupancy", |b| {
        b.iter(|| {
            cache.clear();
            let out = evaluator
                .evaluate_with_cache(black_box("WAVE_OCCUPANCY"), &base, &mut cache)
                .expect("evaluate");
            black_box(out.len())
        })
    });
}

fn bench_emplace(c: &mut Criterion) {
    let headers = RecordHeaderBuffer::new(1 << 20);
    let record = SampleRecord::default();

    c.bench_function("record_header_buffer/emplace_drain_1k", |b| {
        b.iter(|| {
            for i in 0..1024u32 {
                black_box(headers.emplace(1, i, record));
            }
            headers.process_record_headers(true, |records| black_box(records.len()))
        })
    });

    let service = BufferService::new(ServiceOptions::default()).expect("service");
    let id = service.allocate();
    service
        .configure(
            id,
            BufferConfig {
                name: "bench".into(),
                size: 1 << 20,
                watermark: 1 << 19,
                policy: Policy::Lossless,
                ..Default::default()
            },
            delivery(|batch| {
                black_box(batch.count());
            }),
        )
        .expect("configure");

    c.bench_function("buffer_service/emplace_lossless", |b| {
        b.iter(|| service.emplace(id, 1, 1, black_box(record)).expect("emplace"))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse(c);
    bench_evaluate(c);
    bench_emplace(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
