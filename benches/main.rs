//! Runtime primitive benchmarks
//!
//! Run with: cargo bench --bench main
//!
//! Four hot paths, each measured at its steady state:
//!
//! | group | scenario |
//! |-------|----------|
//! | `mutex` | uncontended lock/unlock and four-thread contention |
//! | `auto_reset` | two-thread set/wait ping-pong |
//! | `sequencer` | single-producer ring hand-off |
//! | `pool` | schedule() round-trip latency through the work-stealing pool |

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use criterion::{Criterion, criterion_group, criterion_main};

use subito::combinator::sync_wait;
use subito::pool::ThreadPool;
use subito::seq::{SequenceBarrier, SingleProducerSequencer};
use subito::sync::{AsyncAutoResetEvent, AsyncMutex};

fn bench_mutex(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutex");

    group.bench_function("uncontended", |b| {
        let mutex = AsyncMutex::new(0u64);
        b.iter(|| {
            let mut guard = sync_wait(mutex.lock());
            *guard += 1;
        });
    });

    group.bench_function("contended_4_threads", |b| {
        b.iter_custom(|iters| {
            let mutex = Arc::new(AsyncMutex::new(0u64));
            let start = std::time::Instant::now();
            thread::scope(|scope| {
                for _ in 0..4 {
                    let mutex = &mutex;
                    scope.spawn(move || {
                        for _ in 0..iters {
                            let mut guard = sync_wait(mutex.lock());
                            *guard += 1;
                        }
                    });
                }
            });
            start.elapsed()
        });
    });

    group.finish();
}

fn bench_auto_reset(c: &mut Criterion) {
    let mut group = c.benchmark_group("auto_reset");

    group.bench_function("ping_pong", |b| {
        b.iter_custom(|iters| {
            let ping = Arc::new(AsyncAutoResetEvent::new(false));
            let pong = Arc::new(AsyncAutoResetEvent::new(false));

            let start = std::time::Instant::now();
            thread::scope(|scope| {
                {
                    let ping = &ping;
                    let pong = &pong;
                    scope.spawn(move || {
                        for _ in 0..iters {
                            sync_wait(ping.wait());
                            pong.set();
                        }
                    });
                }
                for _ in 0..iters {
                    ping.set();
                    sync_wait(pong.wait());
                }
            });
            start.elapsed()
        });
    });

    group.finish();
}

fn bench_sequencer(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequencer");

    group.bench_function("spsc_handoff", |b| {
        b.iter_custom(|iters| {
            const BUFFER: usize = 1024;
            let consumed = Arc::new(SequenceBarrier::<usize>::new());
            let sequencer = Arc::new(SingleProducerSequencer::new(consumed.clone(), BUFFER));
            let ring = Arc::new(
                (0..BUFFER)
                    .map(|_| AtomicUsize::new(0))
                    .collect::<Vec<_>>(),
            );

            let start = std::time::Instant::now();
            thread::scope(|scope| {
                {
                    let sequencer = &sequencer;
                    let ring = &ring;
                    scope.spawn(move || {
                        sync_wait(async {
                            for value in 0..iters as usize {
                                let seq = sequencer.claim_one().await;
                                ring[seq & (BUFFER - 1)].store(value, Ordering::Relaxed);
                                sequencer.publish(seq);
                            }
                        });
                    });
                }

                sync_wait(async {
                    let mut next = 0usize;
                    while next < iters as usize {
                        let available = sequencer.wait_until_published(next).await;
                        next = available + 1;
                        consumed.publish(available);
                    }
                });
            });
            start.elapsed()
        });
    });

    group.finish();
}

fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");

    group.bench_function("schedule_round_trip", |b| {
        let pool = ThreadPool::with_threads(2);
        b.iter(|| {
            sync_wait(pool.schedule());
        });
    });

    group.bench_function("spawn_join", |b| {
        let pool = ThreadPool::with_threads(2);
        b.iter(|| {
            sync_wait(pool.spawn(async { 1u32 })).unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_mutex,
    bench_auto_reset,
    bench_sequencer,
    bench_pool
);
criterion_main!(benches);
