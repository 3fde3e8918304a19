use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use plotter::{verify_proof, PlotConfig, PlotKeys, PlotParams, Plotter, Prover};
use tempfile::tempdir;

const K: u8 = 12;

fn params() -> PlotParams {
    PlotParams::new(K, PlotKeys::new([1u8; 32], [2u8; 32]), "bench")
}

fn create_plot_k12(c: &mut Criterion) {
    let mut group = c.benchmark_group("plot");
    group.sample_size(10);
    group.bench_function("create_plot_k12", |b| {
        b.iter_batched(
            || tempdir().unwrap(),
            |dir| {
                let config = PlotConfig::new(dir.path(), dir.path()).with_memory_budget(64 << 20);
                Plotter::new(config).unwrap().create_plot(&params()).unwrap();
                dir
            },
            BatchSize::PerIteration,
        );
    });
    group.finish();
}

fn prove_and_verify_k12(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let config = PlotConfig::new(dir.path(), dir.path()).with_memory_budget(64 << 20);
    let output = Plotter::new(config).unwrap().create_plot(&params()).unwrap();
    let prover = Prover::open(&output.plot_file).unwrap();
    let plot_id = params().plot_id();
    let root_len = prover.reader().root_len();

    c.bench_function("prove_k12", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let challenge = prover.reader().value_at(7, i % root_len).unwrap();
            i += 7;
            prover.find_proofs(challenge).unwrap()
        });
    });

    let challenge = prover.reader().value_at(7, 0).unwrap();
    let proof = prover.find_proofs(challenge).unwrap().remove(0);
    c.bench_function("verify_k12", |b| {
        b.iter(|| assert!(verify_proof(&plot_id, K, challenge, &proof).unwrap()));
    });
}

criterion_group!(benches, create_plot_k12, prove_and_verify_k12);
criterion_main!(benches);
