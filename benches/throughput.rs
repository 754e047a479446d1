//! Throughput Benchmark for the RESP Codec
//!
//! The network-free hot path of every request is parse-dispatch-encode;
//! this measures the parse and encode halves plus the in-process pieces
//! that sit on the read path (cache lookups, glob matching).

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use postkeys::cache::Cache;
use postkeys::glob::glob_match;
use postkeys::protocol::{parse_message, RespValue, RespVersion};
use std::time::Duration;

/// Benchmark parsing command frames of various shapes
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    let get = b"*2\r\n$3\r\nGET\r\n$8\r\nuser:101\r\n".to_vec();
    group.bench_function("get_command", |b| {
        b.iter(|| black_box(parse_message(&get).unwrap().unwrap()));
    });

    let set_small = b"*3\r\n$3\r\nSET\r\n$8\r\nuser:101\r\n$11\r\nsmall_value\r\n".to_vec();
    group.bench_function("set_small", |b| {
        b.iter(|| black_box(parse_message(&set_small).unwrap().unwrap()));
    });

    let payload = "x".repeat(64 * 1024);
    let set_large = format!(
        "*3\r\n$3\r\nSET\r\n$8\r\nuser:101\r\n${}\r\n{}\r\n",
        payload.len(),
        payload
    )
    .into_bytes();
    group.bench_function("set_64k", |b| {
        b.iter(|| black_box(parse_message(&set_large).unwrap().unwrap()));
    });

    let mut pipeline = Vec::new();
    for i in 0..16 {
        pipeline.extend_from_slice(
            format!("*2\r\n$3\r\nGET\r\n$6\r\nkey:{:02}\r\n", i).as_bytes(),
        );
    }
    group.bench_function("pipelined_16", |b| {
        b.iter(|| {
            let mut offset = 0;
            while offset < pipeline.len() {
                let (value, consumed) = parse_message(&pipeline[offset..]).unwrap().unwrap();
                black_box(value);
                offset += consumed;
            }
        });
    });

    group.finish();
}

/// Benchmark encoding replies in both protocol versions
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    let bulk = RespValue::bulk(Bytes::from("x".repeat(1024)));
    group.bench_function("bulk_1k_resp2", |b| {
        b.iter(|| black_box(bulk.encode(RespVersion::Resp2)));
    });

    let array = RespValue::Array(
        (0..100)
            .map(|i| RespValue::bulk(Bytes::from(format!("element:{i}"))))
            .collect(),
    );
    group.bench_function("array_100_resp2", |b| {
        b.iter(|| black_box(array.encode(RespVersion::Resp2)));
    });

    let map = RespValue::Map(
        (0..50)
            .map(|i| {
                (
                    RespValue::bulk(Bytes::from(format!("field:{i}"))),
                    RespValue::bulk(Bytes::from(format!("value:{i}"))),
                )
            })
            .collect(),
    );
    group.bench_function("map_50_resp3", |b| {
        b.iter(|| black_box(map.encode(RespVersion::Resp3)));
    });

    group.finish();
}

/// Benchmark the GET fast path through the in-process cache
fn bench_cache(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let cache = runtime.block_on(async { Cache::new(Duration::from_secs(60), 0, None) });

    for i in 0..100_000 {
        cache.set(
            Bytes::from(format!("key:{i}")),
            Bytes::from(format!("value:{i}")),
        );
    }

    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key:{}", i % 100_000);
            black_box(cache.get(key.as_bytes()));
            i += 1;
        });
    });

    group.bench_function("get_miss", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("missing:{i}");
            black_box(cache.get(key.as_bytes()));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark glob matching (KEYS post-filter, pattern fan-out)
fn bench_glob(c: &mut Criterion) {
    let mut group = c.benchmark_group("glob");
    group.throughput(Throughput::Elements(1));

    group.bench_function("prefix_star", |b| {
        b.iter(|| black_box(glob_match(b"user:*", b"user:101:profile:settings")));
    });

    group.bench_function("multi_star", |b| {
        b.iter(|| black_box(glob_match(b"*:profile:*", b"user:101:profile:settings")));
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_encode, bench_cache, bench_glob);

criterion_main!(benches);
