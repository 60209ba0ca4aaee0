//! Benchmarks for cubeql core operations.
//!
//! Run with: cargo bench

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use cubeql::core::planner::reference_digest;
use cubeql::providers::{InMemoryDatacube, Layer, LayerMeta};
use cubeql::{ExecConfig, Extent, QueryProcessor, Recipe};

const WATER_COUNT: &str = r#"{
    "water": {"type": "concept", "reference": ["entity", "water"]},
    "lake": {"type": "concept", "reference": ["entity", "lake"]},
    "water_count": {
        "type": "processing_chain",
        "with": {"type": "concept", "reference": ["entity", "water"]},
        "do": [{"verb": "reduce", "reducer": "count", "dimension": "time"}]
    }
}"#;

const MAPPING: &str = r#"{
    "entity": {
        "water": {
            "color": {
                "type": "processing_chain",
                "with": {"type": "resource", "reference": ["appearance", "colortype"]},
                "do": [{"verb": "evaluate", "operator": "in", "y": [21, 22, 23]}]
            }
        },
        "lake": {
            "color": {
                "type": "processing_chain",
                "with": {"type": "resource", "reference": ["appearance", "colortype"]},
                "do": [{"verb": "evaluate", "operator": "equal", "y": 21}]
            }
        }
    }
}"#;

fn extent(side: usize) -> Extent {
    Extent::new(3857, 0, side as i64 * 10, 10, side, side, vec![0, 86_400, 172_800], 0)
}

fn datacube(side: usize) -> InMemoryDatacube {
    let e = extent(side);
    let cells = side * side;
    let values: Vec<f64> = (0..cells * 3)
        .map(|i| if i % 7 == 0 { 21.0 } else { 1.0 })
        .collect();
    let mut labels = BTreeMap::new();
    labels.insert(1, "land".to_string());
    labels.insert(21, "deep water".to_string());
    labels.insert(22, "shallow water".to_string());
    labels.insert(23, "turbid water".to_string());
    let mut store = InMemoryDatacube::new();
    store.add_layer(&["appearance", "colortype"], Layer::new(LayerMeta::categorical(labels), e, values));
    store
}

fn bench_recipe_parse(c: &mut Criterion) {
    c.bench_function("recipe_parse", |b| {
        b.iter(|| {
            let recipe = Recipe::parse(black_box(WATER_COUNT)).unwrap();
            black_box(recipe);
        });
    });
}

fn bench_execute(c: &mut Criterion) {
    let recipe = Recipe::parse(WATER_COUNT).unwrap();
    let mapping = cubeql::providers::RuleMapping::parse(MAPPING).unwrap();

    let mut group = c.benchmark_group("execute");
    for side in [8, 16, 32] {
        let store = datacube(side);
        group.bench_with_input(BenchmarkId::new("uncached", side), &side, |b, &side| {
            b.iter(|| {
                let processor = QueryProcessor::new(
                    &recipe,
                    &mapping,
                    &store,
                    extent(side),
                    ExecConfig::default(),
                );
                black_box(processor.execute().unwrap());
            });
        });
        group.bench_with_input(BenchmarkId::new("cached", side), &side, |b, &side| {
            b.iter(|| {
                let processor = QueryProcessor::new(
                    &recipe,
                    &mapping,
                    &store,
                    extent(side),
                    ExecConfig { caching: true, ..ExecConfig::default() },
                );
                black_box(processor.execute().unwrap());
            });
        });
    }
    group.finish();
}

fn bench_reference_digest(c: &mut Criterion) {
    let reference = vec!["appearance".to_string(), "colortype".to_string()];
    c.bench_function("reference_digest", |b| {
        b.iter(|| {
            let key = reference_digest(black_box("resource"), black_box(&reference));
            black_box(key);
        });
    });
}

criterion_group!(benches, bench_recipe_parse, bench_execute, bench_reference_digest);
criterion_main!(benches);
