//! Performance benchmarks for the pending-query index

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use hermes::dns::key::QueryKey;
use hermes::dns::pending::{Pending, PendingIndex, PendingStore};

fn server_addr(n: u16) -> SocketAddr {
    let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, (n % 200) as u8 + 1));
    SocketAddr::new(ip, 53)
}

fn filled_index(count: u16) -> (PendingStore, PendingIndex) {
    let mut store = PendingStore::new();
    let mut index = PendingIndex::new();
    let now = Instant::now();

    for id in 0..count {
        let addr = server_addr(id);
        let handle = store.insert(Pending::new(addr, now, Box::new(|_| {})));
        index.insert(QueryKey::new(id, addr), handle);
    }
    (store, index)
}

fn bench_insert_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("pending_index_insert_remove");
    for &size in &[64u16, 1024, 8192] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let (mut store, mut index) = filled_index(size);
                let addr = server_addr(size);
                let now = Instant::now();

                let handle = store.insert(Pending::new(addr, now, Box::new(|_| {})));
                let key = QueryKey::new(size, addr);
                index.insert(black_box(key), handle);
                index.remove(black_box(&key));
                store.remove(handle);
            })
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let (_store, index) = filled_index(8192);
    let hit = QueryKey::new(4096, server_addr(4096));
    let miss = QueryKey::new(4096, server_addr(4097));

    c.bench_function("pending_index_lookup_hit", |b| {
        b.iter(|| index.lookup(black_box(&hit)))
    });
    c.bench_function("pending_index_lookup_miss", |b| {
        b.iter(|| index.lookup(black_box(&miss)))
    });
}

criterion_group!(benches, bench_insert_remove, bench_lookup);
criterion_main!(benches);
