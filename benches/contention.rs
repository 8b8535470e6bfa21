use std::sync::Arc;
use std::thread;

use ca_tree_set::CaTreeSet;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn populated(n: i64) -> CaTreeSet {
    let set = CaTreeSet::with_capacity_hint(n as usize);
    for k in 0..n {
        set.insert(k);
    }
    set
}

fn bench_single_thread_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_thread");
    for &n in &[1_000i64, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::new("insert", n), &n, |b, &n| {
            b.iter(|| {
                let set = CaTreeSet::with_capacity_hint(n as usize);
                for k in 0..n {
                    black_box(set.insert(k));
                }
            })
        });
        group.bench_with_input(BenchmarkId::new("lookup", n), &n, |b, &n| {
            let set = populated(n);
            b.iter(|| {
                for k in 0..n {
                    black_box(set.lookup(k));
                }
            })
        });
    }
    group.finish();
}

/// Contended inserts from a fixed thread count into disjoint stride ranges, forcing the
/// split/join adaptation loop to keep up with concurrent writers the whole time.
fn bench_contended_inserts(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_inserts");
    for &threads in &[2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &threads| {
            b.iter(|| {
                let set = Arc::new(CaTreeSet::with_capacity_hint(100_000));
                let handles: Vec<_> = (0..threads)
                    .map(|offset| {
                        let set = Arc::clone(&set);
                        thread::spawn(move || {
                            let mut k = offset as i64;
                            while k < 100_000 {
                                set.insert(k);
                                k += threads as i64;
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_thread_ops, bench_contended_inserts);
criterion_main!(benches);
