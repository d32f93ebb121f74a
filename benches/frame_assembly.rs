//! Frame assembly and loopback echo benchmarks.
//!
//! - Reassembling messages from many small fragments
//! - Send/echo round trips through a polling engine
//!
//! Run with: cargo bench --bench frame_assembly
//! Results saved to: target/criterion/

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use lws_engine::connection::{FrameAssembler, MessageKind};
use lws_engine::{Connection, ConnectionConfig, EnginePool, LoopbackFactory, PoolConfig};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const MESSAGE_SIZE: usize = 64 * 1024;
const FRAGMENT_SIZES: &[usize] = &[16, 256, 4096];
const ECHO_SIZES: &[usize] = &[16, 4096];

// ============================================================================
// Benchmark: Fragment Reassembly
// ============================================================================

fn bench_reassembly(c: &mut Criterion) {
    let payload = vec![b'x'; MESSAGE_SIZE];

    let mut group = c.benchmark_group("reassembly");
    group.throughput(Throughput::Bytes(MESSAGE_SIZE as u64));

    for &fragment_size in FRAGMENT_SIZES {
        group.bench_with_input(
            BenchmarkId::new("text", fragment_size),
            &fragment_size,
            |b, &size| {
                b.iter(|| {
                    let mut assembler = FrameAssembler::new(MessageKind::Text, None);
                    for chunk in payload.chunks(size) {
                        assembler.append(black_box(chunk)).expect("append");
                    }
                    black_box(assembler.finish().expect("finish"))
                });
            },
        );
    }

    group.finish();
}

// ============================================================================
// Benchmark: Loopback Echo
// ============================================================================

fn bench_loopback_echo(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let pool = EnginePool::with_config(
        Arc::new(LoopbackFactory::new()),
        PoolConfig::default()
            .size(1)
            .service_timeout(Duration::from_millis(5)),
    )
    .expect("pool");

    let config = ConnectionConfig::builder("loopback.bench")
        .build()
        .expect("config");
    let connection = rt
        .block_on(Connection::connect(&pool, config))
        .expect("connect");

    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.on_binary(move |_, data| {
        let _ = tx.send(data.len());
    });

    let mut group = c.benchmark_group("loopback_echo");

    for &size in ECHO_SIZES {
        let payload = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("binary", size), &payload, |b, payload| {
            b.iter(|| {
                rt.block_on(async {
                    connection.send_binary(payload.clone()).await.expect("send");
                    black_box(rx.recv().await.expect("echo"))
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_reassembly, bench_loopback_echo);
criterion_main!(benches);
