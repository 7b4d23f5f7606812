//! # olap-array-node 使用案例
//!
//! 1. 自适应位宽的节点
//! 2. 有序节点上的二分查找
//! 3. 查询引擎：条件 × 动作
//! 4. B+ 树插入、分裂、删除
//! 5. 跨叶子查询
//! 6. 写出镜像，重新挂载后 copy-on-write

use olap_array_node::{
    alloc::SlabAlloc,
    array::{Array, NodeKind},
    bptree::BpTree,
    config::ArrayConfig,
    query::{self, Action, Callback, Cond, QueryState},
    writer::MemoryOutputStream,
    Allocator, NPOS,
};

fn main() -> olap_array_node::Result<()> {
    println!("═══════════════════════════════════════════════════════════");
    println!("   olap-array-node 演示                                    ");
    println!("═══════════════════════════════════════════════════════════\n");

    let config = ArrayConfig::default().with_max_node_size(64);
    query::simd::apply_config(&config);
    let mut alloc = SlabAlloc::with_config(&config);

    // =========================================================================
    // 1. 位宽随写入值自动升级
    // =========================================================================
    println!("【1】自适应位宽 ...");
    let mut node = Array::create(&mut alloc, NodeKind::Normal)?;
    for v in [0i64, 1, 3, 12, 100, -7, 40_000, 5_000_000_000] {
        node.add(&mut alloc, v)?;
        println!("    add {:>13} → width = {:>2}, byte_size = {}", v, node.width(), node.byte_size());
    }
    node.set_all_to_zero(&mut alloc)?;
    println!("    set_all_to_zero → width = {}\n", node.width());
    node.destroy(&mut alloc);

    // =========================================================================
    // 2. 有序节点二分查找
    // =========================================================================
    println!("【2】lower_bound / upper_bound ...");
    let mut sorted = Array::create(&mut alloc, NodeKind::Normal)?;
    for v in [10i64, 20, 20, 30, 40] {
        sorted.add(&mut alloc, v)?;
    }
    for key in [5i64, 20, 25, 45] {
        println!(
            "    key {:>2}: lower = {}, upper = {}",
            key,
            sorted.lower_bound_int(&alloc, key),
            sorted.upper_bound_int(&alloc, key),
        );
    }
    println!();
    sorted.destroy(&mut alloc);

    // =========================================================================
    // 3. 查询引擎
    // =========================================================================
    println!("【3】查询引擎 ...");
    let mut col = Array::create(&mut alloc, NodeKind::Normal)?;
    for i in 0..1000i64 {
        col.add(&mut alloc, (i * 37) % 101 - 50)?;
    }
    println!("    width        = {}", col.width());
    println!("    first == 0   = {}", col.find_first(&alloc, Cond::Equal, 0, 0, NPOS));
    println!("    count == 7   = {}", col.count(&alloc, 7));

    let mut sum = QueryState::new(Action::Sum, NPOS);
    col.find(&alloc, Cond::Greater, 40, 0, NPOS, 0, &mut sum);
    println!("    sum(> 40)    = {}", sum.state);

    let mut max = QueryState::new(Action::Max, NPOS);
    col.find(&alloc, Cond::Less, 0, 0, NPOS, 0, &mut max);
    println!("    max(< 0)     = {}", max.state);

    let mut first_three = Vec::new();
    let mut state = QueryState::find_all(&mut first_three, 3);
    col.find(&alloc, Cond::Equal, -50, 0, NPOS, 0, &mut state);
    println!("    find_all(== -50, limit 3) = {:?}", first_three);

    let mut printed = 0;
    let mut cb = |ndx: usize, v: i64| {
        printed += 1;
        println!("    callback: [{}] = {}", ndx, v);
        printed < 2
    };
    let mut state = QueryState::with_callback(Callback::Both(&mut cb), NPOS);
    col.find(&alloc, Cond::Greater, 48, 0, NPOS, 0, &mut state);
    println!("    simd enabled = {}\n", query::simd::enabled());
    col.destroy(&mut alloc);

    // =========================================================================
    // 4. B+ 树
    // =========================================================================
    println!("【4】B+ 树 (max_node_size = {}) ...", config.max_node_size);
    let mut tree = BpTree::new(&mut alloc, &config)?;
    for i in 0..10_000i64 {
        tree.append(&mut alloc, i)?;
    }
    println!("    append 10000 → size = {}, height = {}", tree.size(&alloc), tree.height(&alloc));
    for i in 0..100i64 {
        tree.insert(&mut alloc, 5000, -i)?;
    }
    println!("    insert 100 @5000 → get(5000) = {}, get(5099) = {}", tree.get(&alloc, 5000), tree.get(&alloc, 5099));
    for _ in 0..2000 {
        tree.remove(&mut alloc, 0)?;
    }
    println!("    remove 2000 @0 → size = {}, front = {}", tree.size(&alloc), tree.get(&alloc, 0));
    println!("    verify → {} elements ✓\n", tree.verify(&alloc));

    // =========================================================================
    // 5. 跨叶子查询
    // =========================================================================
    println!("【5】树上查询 ...");
    println!("    find_first(== 9000) = {}", tree.find_first(&alloc, Cond::Equal, 9000));
    println!("    count(< 0)          = {}", tree.count(&alloc, Cond::Less, 0));
    println!("    sum                 = {}", tree.sum(&alloc));
    println!("    min / max           = {:?} / {:?}\n", tree.minimum(&alloc), tree.maximum(&alloc));

    // =========================================================================
    // 6. 写出镜像并重新挂载
    // =========================================================================
    println!("【6】持久化 + copy-on-write ...");
    let mut out = MemoryOutputStream::new();
    let root_pos = Array::from_ref(&alloc, tree.root_ref()).write(&alloc, &mut out, true, true)?;
    println!("    image bytes = {}, crc32 = {:08x}, root @{}", out.len(), out.checksum(), root_pos);
    tree.destroy(&mut alloc);

    let mut image_alloc = SlabAlloc::from_image(out.into_bytes());
    let mut reopened    = BpTree::open(root_pos, &config);
    println!("    reopened size = {}, root read-only = {}", reopened.size(&image_alloc), image_alloc.is_read_only(reopened.root_ref()));
    reopened.set(&mut image_alloc, 0, 123)?;
    println!(
        "    after set(0): root @{} (read-only = {}), cow blocks = {}, released image blocks = {}",
        reopened.root_ref(),
        image_alloc.is_read_only(reopened.root_ref()),
        image_alloc.live_blocks(),
        image_alloc.stats().read_only_frees,
    );

    println!("\n═══════════════════════════════════════════════════════════");
    println!("   演示完成");
    println!("═══════════════════════════════════════════════════════════");
    Ok(())
}
