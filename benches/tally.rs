use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tally::Tally;

fn add_uncontended(c: &mut Criterion) {
    c.bench_function("Tally: add, single thread", |b| {
        b.iter_custom(|iters| {
            let tally = Tally::new();
            let start = Instant::now();
            for _ in 0..iters {
                tally.add(1);
            }
            let elapsed = start.elapsed();
            assert_eq!(tally.sum(), iters as i64);
            elapsed
        })
    });
}

fn add_contended(c: &mut Criterion) {
    let num_threads = 4;
    c.bench_function("Tally: add, contended", move |b| {
        b.iter_custom(|iters| {
            let tally: Arc<Tally> = Arc::new(Tally::new());
            let per_thread = iters / num_threads + 1;
            let start = Instant::now();
            let threads: Vec<_> = (0..num_threads)
                .map(|_| {
                    let tally = tally.clone();
                    thread::spawn(move || {
                        for _ in 0..per_thread {
                            tally.add(1);
                        }
                    })
                })
                .collect();
            for thread in threads {
                assert!(thread.join().is_ok());
            }
            let elapsed = start.elapsed();
            assert_eq!(tally.sum(), (per_thread * num_threads) as i64);
            elapsed
        })
    });
}

fn sum(c: &mut Criterion) {
    c.bench_function("Tally: sum", |b| {
        b.iter_custom(|iters| {
            let tally = Tally::new();
            for _ in 0..1024 {
                tally.add(1);
            }
            let start = Instant::now();
            let mut total = 0_i64;
            for _ in 0..iters {
                total = total.wrapping_add(tally.sum());
            }
            let elapsed = start.elapsed();
            assert_eq!(total, 1024 * iters as i64);
            elapsed
        })
    });
}

criterion_group!(counter, add_contended, add_uncontended, sum);
criterion_main!(counter);
