//! Benchmarks for dependency graph operations.

use buildflow::coordinator::TaskGraph;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// A layered graph: every task depends on every task of the layer below.
fn layered(layers: u32, width: u32) -> TaskGraph {
    let mut graph = TaskGraph::new();
    for id in 0..layers * width {
        graph.add_task(id);
    }
    for layer in 1..layers {
        for task in layer * width..(layer + 1) * width {
            for dependency in (layer - 1) * width..layer * width {
                graph.add_dependency(task, dependency);
            }
        }
    }
    graph
}

fn graph_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_graph");
    for width in [4, 16, 32] {
        group.bench_with_input(BenchmarkId::new("build", width), &width, |b, width| {
            b.iter(|| black_box(layered(8, *width)));
        });

        let graph = layered(8, width);
        let ids: Vec<u32> = (0..8 * width).rev().collect();
        group.bench_with_input(BenchmarkId::new("topological_order", width), &ids, |b, ids| {
            b.iter(|| black_box(graph.topological_order(ids)));
        });
        group.bench_with_input(BenchmarkId::new("transitive_dependants", width), &graph, |b, graph| {
            b.iter(|| black_box(graph.transitive_dependants(0)));
        });
    }
    group.finish();
}

criterion_group!(benches, graph_benchmark);
criterion_main!(benches);
