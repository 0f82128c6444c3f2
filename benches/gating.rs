#[macro_use]
extern crate criterion;

use criterion::Criterion;
use regate::primitives::gate::*;
use std::sync::Arc;
use std::thread;

fn enter_1k_uncontended() {
    let gate = Gate::new();
    for _ in 0..1000 {
        let _ = gate.enter_for(Timeout::Infinite);
        let _ = gate.exit();
    }
}

fn close_1k_uncontended() {
    let gate = Gate::new();
    for _ in 0..1000 {
        let _ = gate.close_for(Timeout::Infinite);
        let _ = gate.open();
    }
}

fn enter_1k(size: usize) {
    let gate = Arc::new(Gate::new());
    let mut threads = Vec::new();
    for _ in 0..size {
        let gate = gate.clone();
        let tid = thread::spawn(move || for _ in 0..1024 {
            let _ = gate.enter_for(Timeout::Infinite);
            let _ = gate.exit();
        });
        threads.push(tid);
    }

    for tid in threads {
        let _ = tid.join().unwrap();
    }
}

fn enter_1k_with_closer(size: usize) {
    let gate = Arc::new(Gate::new());
    let mut threads = Vec::new();
    for _ in 0..size {
        let gate = gate.clone();
        let tid = thread::spawn(move || for _ in 0..1024 {
            let _ = gate.enter_for(Timeout::Infinite);
            let _ = gate.exit();
        });
        threads.push(tid);
    }

    for _ in 0..64 {
        let _ = gate.close_for(Timeout::Infinite);
        let _ = gate.open();
    }

    for tid in threads {
        let _ = tid.join().unwrap();
    }
}

fn benchmark(c: &mut Criterion) {
    c.bench_function("enter/exit (1K uncontended)", |b| b.iter(|| enter_1k_uncontended()));
    c.bench_function("close/open (1K uncontended)", |b| b.iter(|| close_1k_uncontended()));
    c.bench_function("enter/exit (1K X 4)", |b| b.iter(|| enter_1k(4)));
    c.bench_function("enter/exit (1K X 4, 64 closes)", |b| b.iter(|| enter_1k_with_closer(4)));
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
