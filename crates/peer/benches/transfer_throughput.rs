//! Throughput benchmarks for the transfer hot paths:
//! - Encrypting and decrypting payloads (key derivation included)
//! - Streaming a file through a full send/receive session in memory

use std::fs;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use peer::session::{self, NoopObserver, ReceiveOptions, SendOptions, TransferRequest};
use protocol::{decrypt_stream, encrypt_stream, TransferProfile};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn bench_encryption(c: &mut Criterion) {
    let mut group = c.benchmark_group("encryption");
    group.sample_size(10);

    for size in [4 * 1024, 1024 * 1024] {
        let data = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encrypt", size), &data, |b, data| {
            b.iter(|| encrypt_stream(black_box(data), "benchmark password"));
        });

        let blob = encrypt_stream(&data, "benchmark password");
        group.bench_with_input(BenchmarkId::new("decrypt", size), &blob, |b, blob| {
            b.iter(|| decrypt_stream(black_box(blob), "benchmark password"));
        });
    }

    group.finish();
}

fn bench_session_streaming(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("session_streaming");
    group.sample_size(20);

    for chunk_size in [4096usize, 65536] {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("payload.bin");
        let size = 8 * 1024 * 1024;
        fs::write(&source, vec![0xa5u8; size]).unwrap();
        let request = TransferRequest::new(vec![source]).unwrap();

        let profile = TransferProfile {
            chunk_size,
            ..TransferProfile::DESKTOP
        };
        let send_options = SendOptions {
            profile,
            password: None,
            temp_dir: dir.path().join("tmp"),
        };

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(BenchmarkId::new("8MB", chunk_size), |b| {
            b.iter(|| {
                let save_dir = TempDir::new().unwrap();
                let receive_options = ReceiveOptions {
                    save_dir: save_dir.path().to_path_buf(),
                    profile,
                    max_password_attempts: 3,
                };
                rt.block_on(async {
                    let (tx, rx) = tokio::io::duplex(64 * 1024);
                    let cancel = CancellationToken::new();
                    let (sent, received) = tokio::join!(
                        session::send(tx, &request, &send_options, &NoopObserver, &cancel),
                        session::receive(rx, &receive_options, &NoopObserver, &cancel),
                    );
                    sent.unwrap();
                    black_box(received.unwrap());
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encryption, bench_session_streaming);
criterion_main!(benches);
