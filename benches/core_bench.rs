//! Benchmarks for compositor core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use compositor::core::graph::build_graph;
use compositor::core::parser::parse_declaration;
use compositor::core::resolver::{OutputPool, Resolver};
use compositor::core::types::InstanceDecl;
use compositor::tripwire::hasher;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::BTreeMap;

fn input_tree(width: usize) -> Value {
    let mut map = serde_json::Map::new();
    for i in 0..width {
        map.insert(
            format!("field_{i}"),
            json!({"name": format!("value-{i}"), "memory": i * 64, "tags": ["a", "b"]}),
        );
    }
    Value::Object(map)
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    for width in [4, 32, 256] {
        let tree = input_tree(width);
        group.bench_with_input(BenchmarkId::from_parameter(width), &tree, |b, tree| {
            b.iter(|| black_box(hasher::fingerprint(black_box(tree))));
        });
    }
    group.finish();
}

/// A chain where each instance reads the previous one's url.
fn chain(len: usize) -> IndexMap<String, InstanceDecl> {
    (0..len)
        .map(|i| {
            let inputs = if i == 0 {
                json!({"memory": 512})
            } else {
                json!({"upstream": format!("${{n{}.url}}", i - 1)})
            };
            (format!("n{i}"), InstanceDecl::new("Socket", inputs))
        })
        .collect()
}

fn bench_build_graph(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_graph");
    for len in [10, 100, 1000] {
        let instances = chain(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &instances, |b, instances| {
            b.iter(|| black_box(build_graph(black_box(instances)).unwrap()));
        });
    }
    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let mut pool = OutputPool::new();
    pool.insert("api", json!({"url": "wss://api.example", "port": 443}));
    let env = BTreeMap::from([("REGION".to_string(), "us-east-1".to_string())]);
    let inputs = json!({
        "apiUrl": "${api.url}",
        "endpoint": "${api.url}:${api.port}/v1",
        "region": "${env.REGION}",
        "static": {"retries": 3, "names": ["x", "y"]}
    });

    c.bench_function("resolve_inputs", |b| {
        let resolver = Resolver::new(&pool, &env);
        b.iter(|| black_box(resolver.resolve_inputs("site", black_box(&inputs)).unwrap()));
    });
}

fn bench_yaml_parse(c: &mut Criterion) {
    let yaml = r#"
version: "1.0"
project: bench
stage: dev
instances:
  api:
    type: Socket
    inputs:
      memory: 512
  site:
    type: Website
    inputs:
      apiUrl: "${api.url}"
  cdn:
    type: Cdn
    inputs:
      origin: "${site.url}"
"#;
    c.bench_function("parse_declaration", |b| {
        b.iter(|| black_box(parse_declaration(black_box(yaml)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_fingerprint,
    bench_build_graph,
    bench_resolve,
    bench_yaml_parse
);
criterion_main!(benches);
