//! B+tree benchmarks for cowtree
//!
//! These benchmarks measure the operations that dominate address-map
//! performance: transactional inserts (with their structural splits),
//! point lookups and full iteration over the LBA tree.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cowtree::extent::cache::ExtentCache;
use cowtree::extent::Paddr;
use cowtree::lba::{LbaBtree, LbaMapping, LbaTreeSpec};
use cowtree::tree::with_btree;

fn setup_cache() -> ExtentCache {
    let cache = ExtentCache::new();
    cache.mkfs().unwrap();
    let mut trans = cache.begin();
    with_btree::<LbaTreeSpec, _>(&cache, &mut trans, |_tree, c| {
        LbaBtree::mkfs(c)?;
        Ok(())
    })
    .unwrap();
    cache.commit(trans).unwrap();
    cache
}

fn populated_cache(count: u64) -> ExtentCache {
    let cache = setup_cache();
    let mut trans = cache.begin();
    with_btree::<LbaTreeSpec, _>(&cache, &mut trans, |tree, c| {
        for i in 0..count {
            tree.insert(c, i * 8, LbaMapping::new(Paddr::new(0x10000 + i * 4096), 4096))?;
        }
        Ok(())
    })
    .unwrap();
    cache.commit(trans).unwrap();
    cache
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_insert");

    for count in [100u64, 1000].iter() {
        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::new("sequential", count), count, |b, &count| {
            b.iter_with_setup(setup_cache, |cache| {
                let mut trans = cache.begin();
                with_btree::<LbaTreeSpec, _>(&cache, &mut trans, |tree, c| {
                    for i in 0..count {
                        tree.insert(
                            c,
                            i * 8,
                            LbaMapping::new(Paddr::new(0x10000 + i * 4096), 4096),
                        )?;
                    }
                    Ok(())
                })
                .unwrap();
                cache.commit(trans).unwrap();
                cache
            });
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_lookup");

    for count in [1000u64, 10_000].iter() {
        let cache = populated_cache(*count);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("point", count), count, |b, &count| {
            let mut key = 0u64;
            b.iter(|| {
                key = (key + 7919) % count;
                let mut trans = cache.begin_weak();
                let val = with_btree::<LbaTreeSpec, _>(&cache, &mut trans, |tree, c| {
                    let iter = tree.lower_bound(c, key * 8)?;
                    Ok(iter.get_val())
                })
                .unwrap();
                black_box(val);
            });
        });
    }

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_scan");

    for count in [1000u64].iter() {
        let cache = populated_cache(*count);
        group.throughput(Throughput::Elements(*count));
        group.bench_function(BenchmarkId::new("full", count), |b| {
            b.iter(|| {
                let mut trans = cache.begin_weak();
                let total = with_btree::<LbaTreeSpec, _>(&cache, &mut trans, |tree, c| {
                    let mut n = 0u64;
                    let mut iter = tree.begin(c)?;
                    while !iter.is_end() {
                        n += u64::from(iter.get_val().len);
                        iter = iter.next(c)?;
                    }
                    Ok(n)
                })
                .unwrap();
                black_box(total);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_lookup, bench_scan);
criterion_main!(benches);
