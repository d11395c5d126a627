//! Benchmarks for the anti-cache hot paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use anticache::cache::block::{Block, BlockCodec, BlockEntry};
use anticache::cache::lru::LruTracker;
use anticache::cache::sketch::{tuple_key, FrequencySketch};
use anticache::config::{ChainKind, SketchConfig};
use anticache::table::{Table, TableId, Tuple};

fn loaded(kind: ChainKind, n: usize) -> (Table, LruTracker) {
    let mut table = Table::new(TableId(1), "bench");
    let mut lru = LruTracker::new(kind);
    lru.init_table(table.id());
    for i in 0..n {
        let id = table.insert(Tuple::new(vec![i as u8; 100]));
        let _ = lru.on_insert_or_update(table.id(), id, true);
    }
    (table, lru)
}

fn bench_chain_touch(c: &mut Criterion) {
    for (name, kind) in [
        ("lru_touch_doubly_100k", ChainKind::Doubly),
        ("lru_touch_singly_100k", ChainKind::Singly),
    ] {
        let (table, mut lru) = loaded(kind, 100_000);
        let t = table.id();
        let mut key = 0u32;

        c.bench_function(name, |b| {
            b.iter(|| {
                key = key.wrapping_mul(2_654_435_761).wrapping_add(1) % 100_000;
                let _ = lru.on_insert_or_update(t, black_box(key), false);
            })
        });
    }
}

fn bench_candidate_selection(c: &mut Criterion) {
    let (table, lru) = loaded(ChainKind::Doubly, 100_000);

    // One 1MB block worth of 124-byte rows.
    c.bench_function("lru_candidates_1mb_from_100k", |b| {
        b.iter(|| {
            let picked = lru
                .select_eviction_candidates(&table, black_box(1 << 20))
                .map(|c| c.count())
                .unwrap_or(0);
            black_box(picked);
        })
    });
}

fn bench_sketch(c: &mut Criterion) {
    let mut sketch = FrequencySketch::new(&SketchConfig::default());
    let mut id = 0u32;

    c.bench_function("sketch_record", |b| {
        b.iter(|| {
            id = id.wrapping_add(7) % 50_000;
            sketch.record(black_box(tuple_key(TableId(1), id)));
        })
    });

    c.bench_function("sketch_is_hot", |b| {
        b.iter(|| black_box(sketch.is_hot(tuple_key(TableId(1), black_box(42)))))
    });
}

fn bench_codec(c: &mut Criterion) {
    let mut block = Block::new(TableId(1));
    for i in 0..800u32 {
        let tuple = Tuple::new(vec![(i % 17) as u8; 100]);
        block.push(BlockEntry::new(TableId(1), i, &tuple));
    }

    for (name, compress) in [("block_encode_raw_100kb", false), ("block_encode_zstd_100kb", true)] {
        let codec = BlockCodec::new(compress, 3);
        c.bench_function(name, |b| {
            b.iter(|| black_box(codec.encode(black_box(&block))))
        });
    }

    let codec = BlockCodec::new(true, 3);
    let encoded = codec.encode(&block).unwrap_or_default();
    c.bench_function("block_decode_zstd_100kb", |b| {
        b.iter(|| black_box(codec.decode(black_box(&encoded))))
    });
}

criterion_group!(
    benches,
    bench_chain_touch,
    bench_candidate_selection,
    bench_sketch,
    bench_codec,
);
criterion_main!(benches);
