//! Floods two stages of one shared pool and prints their metrics while the
//! backlog drains.
//!
//! Run with `RUST_LOG=stagepool=debug cargo run --example stage_flood`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stagepool::pool::{PoolConfig, SharedPool};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let pool = SharedPool::with_config(
        "demo",
        PoolConfig {
            max_workers: 4,
            ..PoolConfig::default()
        },
    );
    let reads = pool.new_executor(2, 32, "read");
    let writes = pool.new_executor(1, 8, "write");

    let completed = Arc::new(AtomicUsize::new(0));
    for index in 0..64 {
        let counter = completed.clone();
        reads
            .submit(move || {
                thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("read submission");

        if index % 4 == 0 {
            let counter = completed.clone();
            writes
                .submit(move || {
                    thread::sleep(Duration::from_millis(20));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .expect("write submission");
        }
    }

    while completed.load(Ordering::SeqCst) < 64 + 16 {
        println!(
            "read: active={} pending={} completed={} | write: active={} pending={} completed={}",
            reads.active_count(),
            reads.pending_tasks(),
            reads.completed_count(),
            writes.active_count(),
            writes.pending_tasks(),
            writes.completed_count(),
        );
        thread::sleep(Duration::from_millis(25));
    }

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)));
    println!(
        "drained: read completed={} write completed={}",
        reads.completed_count(),
        writes.completed_count()
    );
}
