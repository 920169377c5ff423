//! Evaluation benchmarks using Criterion.
//!
//! Run with: `cargo bench`
//!
//! These measure the core call path: literal emission, pattern dispatch
//! across many methods, deep call nesting, and combinator capture.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use steplang::module::Module;
use steplang::term::Term;
use steplang::State;

fn module_with(defs: &[&str]) -> Arc<Module> {
    let module = Module::new();
    module.add_definitions(defs).expect("benchmark definitions parse");
    module
}

fn bench_literal_emission(c: &mut Criterion) {
    let module = module_with(&["Test: the quick brown fox jumps over the lazy dog"]);
    c.bench_function("literal_emission", |b| {
        b.iter(|| {
            let out = module.call(&State::empty(), "Test", &[]).unwrap();
            black_box(out)
        })
    });
}

fn bench_method_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("method_dispatch");
    for n in [4usize, 16, 64] {
        let defs: Vec<String> = (0..n).map(|i| format!("F {}: hit", i)).collect();
        let sources: Vec<&str> = defs.iter().map(|s| s.as_str()).collect();
        let module = module_with(&sources);
        let last = Term::Number((n - 1) as f64);

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let out = module
                    .call(&State::empty(), "F", std::slice::from_ref(&last))
                    .unwrap();
                black_box(out)
            })
        });
    }
    group.finish();
}

fn bench_deep_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("deep_calls");
    for depth in [8usize, 32] {
        let mut defs: Vec<String> = (0..depth)
            .map(|i| format!("L{}: [L{}]", i, i + 1))
            .collect();
        defs.push(format!("L{}: bottom", depth));
        let sources: Vec<&str> = defs.iter().map(|s| s.as_str()).collect();
        let module = module_with(&sources);

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                let out = module.call(&State::empty(), "L0", &[]).unwrap();
                black_box(out)
            })
        });
    }
    group.finish();
}

fn bench_do_all_capture(c: &mut Criterion) {
    let defs: Vec<String> = (0..16)
        .map(|i| format!("[fallible] Gen: item{}", i))
        .chain(std::iter::once("Test: [DoAll [Gen]]".to_string()))
        .collect();
    let sources: Vec<&str> = defs.iter().map(|s| s.as_str()).collect();
    let module = module_with(&sources);

    c.bench_function("do_all_capture", |b| {
        b.iter(|| {
            let out = module.call(&State::empty(), "Test", &[]).unwrap();
            black_box(out)
        })
    });
}

criterion_group!(
    benches,
    bench_literal_emission,
    bench_method_dispatch,
    bench_deep_calls,
    bench_do_all_capture
);
criterion_main!(benches);
