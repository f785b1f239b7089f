use criterion::{Criterion, criterion_group, criterion_main};
use moe_rs::autograd::Variable;
use moe_rs::moe::{ExpertChoiceRouter, MoeConfig, MoeLayer, Router, TokenChoiceRouter};
use moe_rs::tensor::Tensor;
use std::hint::black_box;

fn probs(tokens: usize, experts: usize) -> Variable<f32, 2> {
    let logits = Tensor::from_fn([tokens, experts], |i| ((i * 31 % 97) as f32) / 97.0);
    Variable::new(logits.softmax(1).unwrap())
}

fn benchmark_routers(c: &mut Criterion) {
    let mut group = c.benchmark_group("route");

    for &(tokens, experts) in &[(512usize, 8usize), (2048, 16), (4096, 64)] {
        let scores = probs(tokens, experts);
        let token_choice = TokenChoiceRouter::new(experts, 2, 1.25).unwrap();
        let expert_choice = ExpertChoiceRouter::new(experts, 2, 1.25).unwrap();

        group.bench_function(format!("token_choice_N{tokens}_E{experts}"), |b| {
            b.iter(|| token_choice.route(black_box(&scores)).unwrap())
        });
        group.bench_function(format!("expert_choice_N{tokens}_E{experts}"), |b| {
            b.iter(|| expert_choice.route(black_box(&scores)).unwrap())
        });
    }
    group.finish();
}

fn benchmark_layer(c: &mut Criterion) {
    let mut group = c.benchmark_group("moe_layer");
    group.sample_size(20);

    let mut config = MoeConfig::new(64, 8, 128);
    config.top_k = 2;
    config.seed = Some(1);
    let layer = MoeLayer::<f32>::new(config).unwrap();
    let x = Variable::new(Tensor::from_fn([8, 64, 64], |i| ((i % 17) as f32 - 8.0) / 8.0));

    group.bench_function("forward_B8_S64", |b| {
        b.iter(|| layer.forward(black_box(&x)).unwrap())
    });
    group.bench_function("forward_backward_B8_S64", |b| {
        b.iter(|| {
            let out = layer.forward(black_box(&x)).unwrap();
            out.output.sum().backward().unwrap();
        })
    });
    group.finish();
}

criterion_group!(benches, benchmark_routers, benchmark_layer);
criterion_main!(benches);
