//! B+ 树的性质测试与场景测试
//!
//! 以 `Vec<i64>` 为对照做差分测试，并在每步之后校验结构不变式。

use olap_array_node::alloc::{Allocator, SlabAlloc};
use olap_array_node::array::Array;
use olap_array_node::bptree::{locate_leaf, BpTree, EraseHandler, IntEraseHandler, RootReplacement};
use olap_array_node::common::{ArrayError, Ref, Result};
use olap_array_node::config::ArrayConfig;
use olap_array_node::query::Cond;
use olap_array_node::writer::MemoryOutputStream;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
enum Op {
    Insert(usize, i64),
    Append(i64),
    Erase(usize),
    Set(usize, i64),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (any::<usize>(), any::<i64>()).prop_map(|(p, v)| Op::Insert(p, v)),
            2 => (-1000i64..1000).prop_map(Op::Append),
            3 => any::<usize>().prop_map(Op::Erase),
            1 => (any::<usize>(), any::<i32>()).prop_map(|(p, v)| Op::Set(p, v as i64)),
        ],
        0..=max_ops,
    )
}

/// 计数每个回调被调用的次数，其余行为同默认处理器
struct CountingHandler {
    inner:         IntEraseHandler,
    erase_calls:   usize,
    destroy_calls: usize,
    replace_calls: usize,
}

impl CountingHandler {
    fn new() -> Self {
        Self { inner: IntEraseHandler { leaf_capacity: 128 }, erase_calls: 0, destroy_calls: 0, replace_calls: 0 }
    }
}

impl EraseHandler for CountingHandler {
    fn erase_leaf_elem(&mut self, alloc: &mut dyn Allocator, leaf: &mut Array<'_>, ndx: Option<usize>) -> Result<bool> {
        self.erase_calls += 1;
        self.inner.erase_leaf_elem(alloc, leaf, ndx)
    }

    fn destroy_leaf(&mut self, alloc: &mut dyn Allocator, leaf: Ref) {
        self.destroy_calls += 1;
        self.inner.destroy_leaf(alloc, leaf);
    }

    fn replace_root(&mut self, alloc: &mut dyn Allocator, replacement: RootReplacement) -> Result<Ref> {
        self.replace_calls += 1;
        self.inner.replace_root(alloc, replacement)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn random_ops_match_vec(max in 2usize..8, ops in operations(400)) {
        let mut alloc = SlabAlloc::new();
        let config = ArrayConfig::default().with_max_node_size(max);
        let mut tree = BpTree::new(&mut alloc, &config).unwrap();
        let mut model: Vec<i64> = Vec::new();
        let mut handler = CountingHandler::new();

        for op in ops {
            match op {
                Op::Insert(p, v) => {
                    let ndx = p % (model.len() + 1);
                    tree.insert(&mut alloc, ndx, v).unwrap();
                    model.insert(ndx, v);
                }
                Op::Append(v) => {
                    tree.append(&mut alloc, v).unwrap();
                    model.push(v);
                }
                Op::Erase(p) if !model.is_empty() => {
                    let ndx = p % model.len();
                    let before = handler.erase_calls;
                    tree.erase(&mut alloc, ndx, &mut handler).unwrap();
                    prop_assert_eq!(handler.erase_calls, before + 1);
                    model.remove(ndx);
                }
                Op::Set(p, v) if !model.is_empty() => {
                    let ndx = p % model.len();
                    tree.set(&mut alloc, ndx, v).unwrap();
                    model[ndx] = v;
                }
                _ => {}
            }
            prop_assert_eq!(tree.verify(&alloc), model.len());
        }
        prop_assert_eq!(tree.to_vec(&alloc), model.clone());
        for (k, &v) in model.iter().enumerate() {
            prop_assert_eq!(tree.get(&alloc, k), v);
        }

        tree.destroy(&mut alloc);
        prop_assert_eq!(alloc.live_blocks(), 0);
    }

    #[test]
    fn queries_match_vec(values in prop::collection::vec(-50i64..50, 0..500), key in -55i64..55) {
        let mut alloc = SlabAlloc::new();
        let config = ArrayConfig::default().with_max_node_size(7);
        let mut tree = BpTree::new(&mut alloc, &config).unwrap();
        for &v in &values {
            tree.append(&mut alloc, v).unwrap();
        }
        let first = values.iter().position(|&v| v > key).unwrap_or(olap_array_node::NPOS);
        prop_assert_eq!(tree.find_first(&alloc, Cond::Greater, key), first);
        prop_assert_eq!(tree.count(&alloc, Cond::Equal, key), values.iter().filter(|&&v| v == key).count());
        let mut hits = Vec::new();
        tree.find_all(&alloc, Cond::Less, key, &mut hits);
        let expected: Vec<usize> = values.iter().enumerate().filter(|(_, &v)| v < key).map(|(i, _)| i).collect();
        prop_assert_eq!(hits, expected);
        prop_assert_eq!(tree.sum(&alloc), values.iter().sum::<i64>());
        prop_assert_eq!(tree.maximum(&alloc), values.iter().copied().max());
        prop_assert_eq!(tree.minimum(&alloc), values.iter().copied().min());
    }
}

// ============================================================================
//  Scenarios
// ============================================================================

#[test]
fn sequential_inserts_locate_every_index() {
    let mut alloc = SlabAlloc::new();
    let config = ArrayConfig::default().with_max_node_size(16);
    let mut tree = BpTree::new(&mut alloc, &config).unwrap();
    for i in 0..1000usize {
        tree.insert(&mut alloc, i, i as i64).unwrap();
    }
    assert_eq!(tree.size(&alloc), 1000);
    for k in 0..1000 {
        let (leaf, ndx_in_leaf) = locate_leaf(&alloc, tree.root_ref(), k);
        assert!(leaf.is_leaf());
        assert_eq!(leaf.get(ndx_in_leaf), k as i64);
    }
}

#[test]
fn erase_handler_sees_the_whole_lifecycle() {
    let mut alloc = SlabAlloc::new();
    let config = ArrayConfig::default().with_max_node_size(3);
    let mut tree = BpTree::new(&mut alloc, &config).unwrap();
    for i in 0..30 {
        tree.append(&mut alloc, i).unwrap();
    }
    let mut handler = CountingHandler::new();
    for _ in 0..30 {
        tree.erase(&mut alloc, 0, &mut handler).unwrap();
    }
    assert_eq!(handler.erase_calls, 30);
    // 每个叶子最后一个元素由 destroy_leaf 回收（根叶子的一次也算）
    assert_eq!(handler.destroy_calls, 10);
    assert!(handler.replace_calls >= 1);
    assert!(tree.is_empty(&alloc));
    assert_eq!(alloc.live_blocks(), 1);
}

#[test]
fn destroy_frees_subtree_but_erase_does_not() {
    let mut alloc = SlabAlloc::new();
    let config = ArrayConfig::default().with_max_node_size(4);
    let mut tree = BpTree::new(&mut alloc, &config).unwrap();
    for i in 0..64 {
        tree.append(&mut alloc, i).unwrap();
    }
    let blocks = alloc.live_blocks();
    assert!(blocks > 16);

    let mut root = Array::from_ref(&alloc, tree.root_ref());
    let leaked = root.get_as_ref(&alloc, 1);
    root.erase(&mut alloc, 1).unwrap();
    assert_eq!(alloc.live_blocks(), blocks);

    Array::destroy_ref(&mut alloc, leaked);
    Array::destroy_ref(&mut alloc, root.get_ref());
    assert_eq!(alloc.live_blocks(), 0);
}

#[test]
fn randomized_churn_keeps_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut alloc = SlabAlloc::new();
    let config = ArrayConfig::default().with_max_node_size(5);
    let mut tree = BpTree::new(&mut alloc, &config).unwrap();
    let mut model = Vec::new();
    for round in 0..4000 {
        let grow = round < 2000 || rng.gen_bool(0.3);
        if grow || model.is_empty() {
            let ndx = rng.gen_range(0..=model.len());
            let v: i64 = rng.gen_range(-1_000_000..1_000_000);
            tree.insert(&mut alloc, ndx, v).unwrap();
            model.insert(ndx, v);
        } else {
            let ndx = rng.gen_range(0..model.len());
            tree.remove(&mut alloc, ndx).unwrap();
            model.remove(ndx);
        }
    }
    assert_eq!(tree.verify(&alloc), model.len());
    assert_eq!(tree.to_vec(&alloc), model);
}

#[test]
fn persisted_tree_copies_on_write() {
    let mut alloc = SlabAlloc::new();
    let config = ArrayConfig::default().with_max_node_size(8);
    let mut tree = BpTree::new(&mut alloc, &config).unwrap();
    for i in 0..200 {
        tree.append(&mut alloc, i * 3).unwrap();
    }
    let mut out = MemoryOutputStream::new();
    let root = Array::from_ref(&alloc, tree.root_ref()).write(&alloc, &mut out, true, true).unwrap();
    let checksum = out.checksum();
    let image = out.into_bytes();
    assert_eq!(crc32fast::hash(&image), checksum);

    let mut alloc = SlabAlloc::from_image(image.clone());
    let mut tree = BpTree::open(root, &config);
    assert!(alloc.is_read_only(tree.root_ref()));
    assert_eq!(tree.verify(&alloc), 200);
    assert_eq!(tree.get(&alloc, 150), 450);

    tree.set(&mut alloc, 150, -1).unwrap();
    // 根到叶子路径上的每个节点各复制一次
    let height = tree.height(&alloc);
    assert_eq!(alloc.live_blocks(), height);
    assert_eq!(alloc.stats().read_only_frees, height);
    assert!(!alloc.is_read_only(tree.root_ref()));
    assert_eq!(tree.get(&alloc, 150), -1);
    assert_eq!(tree.get(&alloc, 149), 447);

    // 增量写出：只追加修改过的节点，未修改的子树沿用原 ref
    let image_len = image.len();
    let mut out = MemoryOutputStream::from_image(image);
    let new_root = Array::from_ref(&alloc, tree.root_ref()).write(&alloc, &mut out, true, true).unwrap();
    assert!(new_root >= image_len);
    let appended = out.len() - image_len;
    assert!(appended > 0 && appended < image_len);

    let alloc = SlabAlloc::from_image(out.into_bytes());
    let tree = BpTree::open(new_root, &config);
    assert_eq!(tree.verify(&alloc), 200);
    assert_eq!(tree.get(&alloc, 150), -1);
    assert_eq!(tree.get(&alloc, 0), 0);
}

#[test]
fn memory_limit_surfaces_as_error() {
    let config = ArrayConfig::default().with_max_node_size(4).with_memory_limit(512);
    let mut alloc = SlabAlloc::with_config(&config);
    let mut tree = BpTree::new(&mut alloc, &config).unwrap();
    let mut appended = 0;
    let err = loop {
        match tree.append(&mut alloc, appended) {
            Ok(()) => appended += 1,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, ArrayError::OutOfMemory { limit: 512, .. }));
    assert!(appended > 0);
}

#[test]
fn refused_insert_leaves_tree_intact() {
    let config = ArrayConfig::default().with_max_node_size(4);
    for limit in (200..6000).step_by(8) {
        let mut alloc = SlabAlloc::new().with_memory_limit(limit);
        let mut tree = BpTree::new(&mut alloc, &config).unwrap();
        let mut model = Vec::new();
        let err = loop {
            let ndx   = model.len() / 2;
            let value = model.len() as i64 * 37 - 500;
            match tree.insert(&mut alloc, ndx, value) {
                Ok(()) => model.insert(ndx, value),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, ArrayError::OutOfMemory { .. }), "limit {limit}: {err:?}");

        alloc.set_memory_limit(None);
        assert_eq!(tree.verify(&alloc), model.len(), "limit {limit}");
        assert_eq!(tree.to_vec(&alloc), model, "limit {limit}");

        // 解除上限后仍可继续插入，且失败的那次插入没有遗留孤立的块
        let ndx = model.len() / 2;
        tree.insert(&mut alloc, ndx, 1).unwrap();
        model.insert(ndx, 1);
        assert_eq!(tree.to_vec(&alloc), model, "limit {limit}");
        tree.destroy(&mut alloc);
        assert_eq!(alloc.live_blocks(), 0, "limit {limit}");
    }
}

#[test]
fn refused_edits_on_image_leave_tree_intact() {
    let config = ArrayConfig::default().with_max_node_size(4);
    let (image, root, expected) = {
        let mut alloc = SlabAlloc::new();
        let mut tree = BpTree::new(&mut alloc, &config).unwrap();
        let mut model = Vec::new();
        for i in 0..150i64 {
            let pos = (i as usize * 7) % (model.len() + 1);
            tree.insert(&mut alloc, pos, i * 11).unwrap();
            model.insert(pos, i * 11);
        }
        let mut out = MemoryOutputStream::new();
        let root = Array::from_ref(&alloc, tree.root_ref()).write(&alloc, &mut out, true, true).unwrap();
        (out.into_bytes(), root, model)
    };

    for limit in (0..3000).step_by(16) {
        // 中间删除走 offsets 定位，末尾删除走「最后一个元素」分支
        for erase_last in [false, true] {
            let mut alloc = SlabAlloc::from_image(image.clone()).with_memory_limit(limit);
            let mut tree = BpTree::open(root, &config);
            let mut model = expected.clone();
            while !model.is_empty() {
                let ndx = if erase_last { model.len() - 1 } else { model.len() / 2 };
                if tree.remove(&mut alloc, ndx).is_err() {
                    break;
                }
                model.remove(ndx);
            }
            alloc.set_memory_limit(None);
            assert_eq!(tree.verify(&alloc), model.len(), "limit {limit}, erase_last {erase_last}");
            assert_eq!(tree.to_vec(&alloc), model, "limit {limit}, erase_last {erase_last}");
        }

        let mut alloc = SlabAlloc::from_image(image.clone()).with_memory_limit(limit);
        let mut tree = BpTree::open(root, &config);
        let mut model = expected.clone();
        loop {
            let ndx = model.len() / 2;
            if tree.insert(&mut alloc, ndx, -7).is_err() {
                break;
            }
            model.insert(ndx, -7);
        }
        alloc.set_memory_limit(None);
        assert_eq!(tree.verify(&alloc), model.len(), "limit {limit}, insert");
        assert_eq!(tree.to_vec(&alloc), model, "limit {limit}, insert");
    }
}
