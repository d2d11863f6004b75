//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Benchmarks for packet codec performance

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tokio_util::codec::{Decoder, Encoder};
use umaster_codec::{Message, Packet, PacketFramer, ServerList, ServerRecord};

// ============================================================================
// Compact Index Benchmarks
// ============================================================================

fn bench_compact_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("compact_index");

    for value in [5i32, 1_000, 500_000, 100_000_000, i32::MIN] {
        group.bench_with_input(BenchmarkId::new("encode", value), &value, |b, &value| {
            b.iter(|| {
                let mut packet = Packet::with_capacity(8);
                packet.push_compact_index(black_box(value));
                packet
            });
        });

        let mut encoded = Packet::outbound();
        encoded.push_compact_index(value);
        let bytes = encoded.as_bytes().to_vec();
        group.bench_with_input(BenchmarkId::new("decode", value), &bytes, |b, bytes| {
            b.iter(|| {
                let mut packet = Packet::inbound(black_box(bytes));
                packet.pop_compact_index().unwrap()
            });
        });
    }

    group.finish();
}

// ============================================================================
// Message Benchmarks
// ============================================================================

fn server_list(count: usize) -> Message {
    let servers = (0..count)
        .map(|i| ServerRecord {
            address: format!("10.0.{}.{}", i / 256, i % 256),
            port: 7777,
            metadata: vec![
                ("hostname".into(), format!("Server {i}")),
                ("mapname".into(), "DM-Deck16][".into()),
                ("numplayers".into(), "8".into()),
                ("maxplayers".into(), "16".into()),
            ],
        })
        .collect();
    Message::ServerList(ServerList {
        sequence: 0,
        total: 1,
        servers,
    })
}

fn bench_server_list(c: &mut Criterion) {
    let mut group = c.benchmark_group("server_list");

    for count in [1usize, 10, 100] {
        let message = server_list(count);
        let encoded = message.encode();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", count), &message, |b, message| {
            b.iter(|| black_box(message).encode());
        });

        let bytes = encoded.as_bytes().to_vec();
        group.bench_with_input(BenchmarkId::new("decode", count), &bytes, |b, bytes| {
            b.iter(|| Message::decode_bytes(black_box(bytes)).unwrap());
        });
    }

    group.finish();
}

fn bench_framer(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");
    let message = server_list(10);

    group.bench_function("encode_decode", |b| {
        let mut framer = PacketFramer::default();
        let mut buffer = BytesMut::with_capacity(4096);
        b.iter(|| {
            buffer.clear();
            framer.encode(black_box(&message), &mut buffer).unwrap();
            framer.decode(&mut buffer).unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_compact_index, bench_server_list, bench_framer);
criterion_main!(benches);
