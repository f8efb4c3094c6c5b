//! Slot pool benchmarks
//!
//! ## Benchmark Path Types
//!
//! - `pool_*`: raw acquire/release on `SlotPool`, no engine involved
//! - `txn_*`: a full transaction cycle through a `Repository` backed by the
//!   in-memory source
//!
//! ## Contention Model
//!
//! `pool_contended/*` runs N threads against a pool of 2 slots. Threads start
//! together on a barrier and each does a fixed number of acquire/release
//! pairs, so the measured time includes queueing in arrival order.
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench slot_pool
//! cargo bench --bench slot_pool -- "pool_contended"
//! ```

use cairndb::{
    Attributes, CairnResult, Credentials, MemorySchema, MemorySource, Repository, RepositoryConfig, SlotConnection,
    SlotPool, Value,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

// =============================================================================
// Fixtures
// =============================================================================

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const OPS_PER_THREAD: usize = 1_000;

struct NoopConnection;

impl SlotConnection for NoopConnection {
    fn commit(&mut self) -> CairnResult<()> {
        Ok(())
    }

    fn rollback(&mut self) -> CairnResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> CairnResult<()> {
        Ok(())
    }
}

fn pool(size: usize) -> SlotPool<NoopConnection> {
    SlotPool::new((0..size).map(|_| NoopConnection).collect())
}

// =============================================================================
// Pool
// =============================================================================

fn pool_uncontended(c: &mut Criterion) {
    let pool = pool(4);
    c.bench_function("pool_uncontended/acquire_release", |b| {
        b.iter(|| {
            let slot = pool.acquire(ACQUIRE_TIMEOUT).unwrap();
            black_box(slot.id());
            pool.release(slot);
        })
    });
}

fn pool_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_contended");
    group.sample_size(20);
    for threads in [2usize, 4, 8] {
        group.throughput(Throughput::Elements((threads * OPS_PER_THREAD) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let pool = Arc::new(pool(2));
                let barrier = Arc::new(Barrier::new(threads));
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let pool = Arc::clone(&pool);
                        let barrier = Arc::clone(&barrier);
                        thread::spawn(move || {
                            barrier.wait();
                            for _ in 0..OPS_PER_THREAD {
                                let slot = pool.acquire(ACQUIRE_TIMEOUT).unwrap();
                                pool.release(slot);
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
                black_box(pool.stats())
            })
        });
    }
    group.finish();
}

// =============================================================================
// Transactions
// =============================================================================

fn txn_commit(c: &mut Criterion) {
    let schema = MemorySchema::builder()
        .attribute("User", "login", "String", true)
        .attribute("Doc", "title", "String", true)
        .build();
    let system = Arc::new(MemorySource::system());
    system.add_user("admin", "root", &["managers"]);
    let repo = Repository::builder(Arc::new(schema))
        .config(RepositoryConfig::default().with_sweep_interval(Duration::ZERO))
        .system_source(system)
        .open()
        .unwrap();
    let session = repo
        .connect("admin", &Credentials::Password("root".to_string()))
        .unwrap();

    let mut attrs = Attributes::new();
    attrs.insert("title".to_string(), Value::from("bench"));

    c.bench_function("txn_commit/add_entity", |b| {
        let mut txn = repo.new_transaction(&session).unwrap();
        b.iter(|| {
            black_box(txn.add_entity("Doc", attrs.clone()).unwrap());
            txn.commit().unwrap();
        })
    });
    repo.shutdown();
}

criterion_group!(benches, pool_uncontended, pool_contended, txn_commit);
criterion_main!(benches);
