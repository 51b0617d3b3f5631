use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pmgc::{
    layout::{KeyRecord, ObjDf, Record, ValueRecord},
    tree, Config, GcType, Pool, PoolId,
};

fn punched_pool(items: usize) -> Pool {
    let mut pool = Pool::create(PoolId(1), Config::default()).unwrap();
    pool.tx_begin().unwrap();
    for _ in 0..items {
        let key = pool
            .umem_mut()
            .alloc(Record::Key(KeyRecord::punched()))
            .unwrap();
        pool.gc_add_item(None, GcType::Akey, key, 0).unwrap();
    }
    pool.tx_end(Ok(())).unwrap();
    pool
}

fn object_pool(objects: usize) -> Pool {
    let mut pool = Pool::create(PoolId(1), Config::default()).unwrap();
    pool.tx_begin().unwrap();
    for _ in 0..objects {
        let umem = pool.umem_mut();
        let obj = umem.alloc(Record::Object(ObjDf::new())).unwrap();
        for _ in 0..4 {
            let dkey = umem.alloc(Record::Key(KeyRecord::dkey())).unwrap();
            tree::insert(umem, obj, dkey).unwrap();
            let akey = umem.alloc(Record::Key(KeyRecord::akey(false))).unwrap();
            tree::insert(umem, dkey, akey).unwrap();
            for _ in 0..8 {
                let v = umem.alloc(Record::Value(ValueRecord::new(64))).unwrap();
                tree::insert(umem, akey, v).unwrap();
            }
        }
        pool.gc_add_item(None, GcType::Object, obj, 0).unwrap();
    }
    pool.tx_end(Ok(())).unwrap();
    pool
}

pub fn bench_reclaim(c: &mut Criterion) {
    let mut group = c.benchmark_group("reclaim");
    group.sample_size(20);

    for items in [1_000usize, 10_000] {
        group.bench_function(BenchmarkId::new("punched akeys", items), |b| {
            b.iter_batched_ref(
                || punched_pool(items),
                |pool| {
                    while !pool.gc_is_idle() {
                        pool.gc_run(256).unwrap();
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    for objects in [64usize, 512] {
        group.bench_function(BenchmarkId::new("objects", objects), |b| {
            b.iter_batched_ref(
                || object_pool(objects),
                |pool| {
                    while !pool.gc_is_idle() {
                        pool.gc_run(256).unwrap();
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_reclaim);
criterion_main!(benches);
