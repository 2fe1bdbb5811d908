//! Micro benchmarks for the copy-on-write B+ tree engine.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::sync::Arc;

use copse::btree::{BTree, PlainValue, TreeInfo};
use copse::store::{BlockStore, MemoryBlockStore};
use copse::types::BlockId;
use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const INSERT_COUNT: u64 = 16_384;
const LOOKUP_SAMPLES: u64 = 4_096;

struct FreshTree {
    tree: BTree,
    root: BlockId,
}

impl FreshTree {
    fn new() -> Self {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new(4096));
        let tree = BTree::new(
            store,
            TreeInfo {
                levels: 1,
                value_type: Arc::new(PlainValue::new(8)),
            },
        )
        .expect("valid tree geometry");
        let root = tree.empty().expect("allocate empty root");
        Self { tree, root }
    }

    fn insert_keys(&mut self, keys: impl Iterator<Item = u64>) {
        for key in keys {
            self.root = self
                .tree
                .insert(self.root, &[key], &key.to_le_bytes())
                .expect("insert");
        }
    }
}

fn tree_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_ops");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |mut tree| {
                tree.insert_keys(0..INSERT_COUNT);
                black_box(tree.root);
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xC0FF_EE00));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |mut tree| {
                tree.insert_keys(random_keys.iter().copied());
                black_box(tree.root);
            },
            BatchSize::SmallInput,
        );
    });

    let mut populated = FreshTree::new();
    populated.insert_keys(0..INSERT_COUNT);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES));
    group.bench_function("point_lookup", |b| {
        b.iter(|| {
            for key in 0..LOOKUP_SAMPLES {
                let value = populated
                    .tree
                    .lookup(populated.root, &[key * 4])
                    .expect("key present");
                black_box(value);
            }
        });
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("cursor_scan", |b| {
        b.iter(|| {
            let mut cursor = populated
                .tree
                .cursor(populated.root, false)
                .expect("non-empty tree");
            let mut sum = 0u64;
            loop {
                let (key, _) = cursor.get_value().expect("positioned");
                sum = sum.wrapping_add(key);
                if cursor.next().is_err() {
                    break;
                }
            }
            black_box(sum);
        });
    });

    group.finish();
}

criterion_group!(benches, tree_ops);
criterion_main!(benches);
