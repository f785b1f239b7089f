use criterion::{Criterion, criterion_group, criterion_main};
use moe_rs_kernels::{cpu_index_add, cpu_index_select, cpu_matmul, cpu_topk};
use std::hint::black_box;

fn benchmark_expert_matmul(c: &mut Criterion) {
    let mut group = c.benchmark_group("expert_matmul");
    let hidden = 256;
    let expert_size = 1024;

    for &(experts, capacity) in &[(4usize, 64usize), (8, 128), (16, 128)] {
        let lhs_shape = [experts, capacity, hidden];
        let rhs_shape = [experts, hidden, expert_size];
        let lhs = vec![1.0f32; experts * capacity * hidden];
        let rhs = vec![1.0f32; experts * hidden * expert_size];

        group.bench_function(format!("E{experts}_C{capacity}"), |b| {
            b.iter(|| {
                cpu_matmul(
                    black_box(&lhs),
                    black_box(&rhs),
                    black_box(&lhs_shape),
                    black_box(&rhs_shape),
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn benchmark_gather_scatter(c: &mut Criterion) {
    let mut group = c.benchmark_group("gather_scatter");
    let hidden = 512;

    for &tokens in &[256usize, 1024, 4096] {
        let data = vec![1.0f32; tokens * hidden];
        let indices: Vec<usize> = (0..tokens).rev().collect();

        group.bench_function(format!("index_select_{tokens}"), |b| {
            b.iter(|| cpu_index_select(black_box(&data), hidden, black_box(&indices)).unwrap())
        });

        group.bench_function(format!("index_add_{tokens}"), |b| {
            b.iter(|| {
                let mut out = vec![0.0f32; tokens * hidden];
                cpu_index_add(&mut out, hidden, black_box(&indices), black_box(&data)).unwrap();
                out
            })
        });
    }
    group.finish();
}

fn benchmark_topk(c: &mut Criterion) {
    let mut group = c.benchmark_group("topk");

    // Per-expert capacity selection over the token axis.
    for &(experts, tokens) in &[(8usize, 1024usize), (32, 4096)] {
        let data: Vec<f32> = (0..experts * tokens)
            .map(|i| ((i * 7919) % 1000) as f32 / 1000.0)
            .collect();
        let k = tokens / experts;

        group.bench_function(format!("E{experts}_N{tokens}_k{k}"), |b| {
            b.iter(|| cpu_topk(black_box(&data), &[experts, tokens], k).unwrap())
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_expert_matmul,
    benchmark_gather_scatter,
    benchmark_topk
);
criterion_main!(benches);
