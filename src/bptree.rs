//! B+ 树操作
//!
//! 内部节点布局：
//!
//! ```text
//! ┌──────────┬─────────┬─────────┬─────┬────────────────────┐
//! │ first    │ child 0 │ child 1 │ ... │ 1 + 2 * total_elems │
//! └──────────┴─────────┴─────────┴─────┴────────────────────┘
//!   first 为奇数：紧凑形式，1 + 2 * elems_per_child（除最后一个子树外大小相同）
//!   first 为偶数：指向 offsets 数组（长度 = 子节点数 - 1，存每个子树的累计结束下标）
//! ```
//!
//! - 紧凑形式只会单向转换为一般形式，且插入/删除时沿根到叶的路径依次转换，
//!   因此紧凑节点的子节点要么是叶子，要么也是紧凑节点
//! - 插入落在两个子树边界时总是追加到左子树（lower_bound）
//! - 分裂时新兄弟节点在挂入父节点之前已经完整构造好
//! - 插入与删除先完成所有可能失败的分配与 copy-on-write，再修改树；
//!   内存不足时返回错误，树保持原状

use tracing::debug;

use crate::alloc::Allocator;
use crate::array::{is_ref, partition_point, Array, ArrayParent, MemRef, NodeKind};
use crate::common::{Ref, Result, NPOS};
use crate::config::ArrayConfig;
use crate::header;
use crate::query::state::{Action, QueryState};
use crate::query::{self, Cond};

// ── 协作接口 ──────────────────────────────────────────────────────────────────

/// 删除导致整棵树或根节点变化时，用什么替换根
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootReplacement {
    /// 树已空，换成一个新的空叶子
    EmptyLeaf,
    /// 根只剩单一子树，用该子树（叶子或内部节点）做新根
    Node(Ref),
}

/// 删除回调。每次 `BpTree::erase` 恰好调用一次 `erase_leaf_elem`。
pub trait EraseHandler {
    /// 叶子多于一个元素时删除 ndx（None 表示最后一个元素）并返回 false；
    /// 只剩一个元素时不做修改，返回 true，由调用方销毁整个叶子。
    fn erase_leaf_elem(&mut self, alloc: &mut dyn Allocator, leaf: &mut Array<'_>, ndx: Option<usize>) -> Result<bool>;

    fn destroy_leaf(&mut self, alloc: &mut dyn Allocator, leaf: Ref);

    /// 返回新根的 ref；不得销毁旧根，旧根由调用方回收
    fn replace_root(&mut self, alloc: &mut dyn Allocator, replacement: RootReplacement) -> Result<Ref>;
}

/// 对叶子做原地修改
pub trait UpdateHandler {
    fn update(&mut self, alloc: &mut dyn Allocator, leaf: &mut Array<'_>, ndx_in_leaf: usize) -> Result<()>;
}

/// 整数叶子的默认删除行为
#[derive(Debug, Clone, Copy)]
pub struct IntEraseHandler {
    pub leaf_capacity: usize,
}

impl EraseHandler for IntEraseHandler {
    fn erase_leaf_elem(&mut self, alloc: &mut dyn Allocator, leaf: &mut Array<'_>, ndx: Option<usize>) -> Result<bool> {
        let size = leaf.size();
        if size <= 1 {
            return Ok(true);
        }
        leaf.erase(alloc, ndx.unwrap_or(size - 1))?;
        Ok(false)
    }

    fn destroy_leaf(&mut self, alloc: &mut dyn Allocator, leaf: Ref) {
        Array::destroy_ref(alloc, leaf);
    }

    fn replace_root(&mut self, alloc: &mut dyn Allocator, replacement: RootReplacement) -> Result<Ref> {
        match replacement {
            RootReplacement::Node(r) => Ok(r),
            RootReplacement::EmptyLeaf => {
                let mut leaf = Array::create_with_capacity(alloc, NodeKind::Normal, self.leaf_capacity)?;
                Ok(leaf.release_ownership())
            }
        }
    }
}

struct SetValue(i64);

impl UpdateHandler for SetValue {
    fn update(&mut self, alloc: &mut dyn Allocator, leaf: &mut Array<'_>, ndx_in_leaf: usize) -> Result<()> {
        leaf.set(alloc, ndx_in_leaf, self.0)
    }
}

// ── 只读遍历 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct TreeParams {
    max_node_size:    usize,
    initial_capacity: usize,
}

/// 分裂向上报告的信息：左半部分元素数、分裂前后合计元素数
#[derive(Debug, Default, Clone, Copy)]
struct SplitState {
    split_offset: usize,
    split_size:   usize,
}

/// 内部节点子树的元素总数
pub fn bptree_size(node: &MemRef<'_>) -> usize {
    debug_assert!(!node.is_leaf());
    (node.back() / 2) as usize
}

fn lower_bound(mem: &MemRef<'_>, value: i64) -> usize {
    partition_point(mem.size(), |i| mem.get(i) < value)
}

fn upper_bound(mem: &MemRef<'_>, value: i64) -> usize {
    partition_point(mem.size(), |i| mem.get(i) <= value)
}

/// 内部节点中包含 ndx 的子节点序号及其局部下标
fn child_for(alloc: &dyn Allocator, node: &MemRef<'_>, ndx: usize) -> (usize, usize) {
    let first = node.get(0);
    if first % 2 != 0 {
        let elems_per_child = (first / 2) as usize;
        let child_ndx       = ndx / elems_per_child;
        debug_assert!(child_ndx < node.size() - 2);
        (child_ndx, ndx - child_ndx * elems_per_child)
    } else {
        let offsets   = MemRef::new(alloc, first as Ref);
        let child_ndx = upper_bound(&offsets, ndx as i64);
        let base      = if child_ndx == 0 { 0 } else { offsets.get(child_ndx - 1) as usize };
        (child_ndx, ndx - base)
    }
}

/// 只读下降到包含 ndx 的叶子，不构造任何访问器
pub fn locate_leaf(alloc: &dyn Allocator, root: Ref, ndx: usize) -> (MemRef<'_>, usize) {
    let mut mem = MemRef::new(alloc, root);
    let mut ndx = ndx;
    while !mem.is_leaf() {
        let (child_ndx, local) = child_for(alloc, &mem, ndx);
        mem = MemRef::new(alloc, mem.get_as_ref(1 + child_ndx));
        ndx = local;
    }
    (mem, ndx)
}

fn for_each_leaf(alloc: &dyn Allocator, r: Ref, base: usize, f: &mut dyn FnMut(MemRef<'_>, usize) -> bool) -> (bool, usize) {
    let mem = MemRef::new(alloc, r);
    if mem.is_leaf() {
        return (f(mem, base), base + mem.size());
    }
    let mut base = base;
    for i in 1..mem.size() - 1 {
        let (go, next) = for_each_leaf(alloc, mem.get_as_ref(i), base, f);
        if !go {
            return (false, next);
        }
        base = next;
    }
    (true, base)
}

// ── 插入 ──────────────────────────────────────────────────────────────────────
//
// 插入分三步，任何一步内存不足都不会留下半截修改：
// 1. prepare_path：沿根到叶 copy-on-write，为路径上每个节点预留再插入一个元素的容量
// 2. InsertPlan::build：自底向上预先构造分裂产生的新节点，只分配，不改已有节点
// 3. InsertPlan::apply：改写路径上的节点；容量已预留，这一步不再分配

fn create_filled(alloc: &mut dyn Allocator, kind: NodeKind, capacity: usize, values: &[i64]) -> Result<Ref> {
    let mut node = Array::create_with_capacity(alloc, kind, capacity)?;
    for &v in values {
        if let Err(e) = node.add(alloc, v) {
            alloc.free(node.release_ownership());
            return Err(e);
        }
    }
    Ok(node.release_ownership())
}

/// 构造完整的内部节点：[first, children..., 1 + 2 * total]。失败时只释放节点自身，
/// 不触碰 children。
fn build_inner(alloc: &mut dyn Allocator, p: TreeParams, first: i64, children: &[Ref], total: usize) -> Result<Ref> {
    let mut values = Vec::with_capacity(children.len() + 2);
    values.push(first);
    values.extend(children.iter().map(|&c| c as i64));
    values.push(1 + 2 * total as i64);
    create_filled(alloc, NodeKind::InnerNode, p.initial_capacity, &values)
}

/// 紧凑形式转一般形式，返回 offsets 数组 ref
fn ensure_offsets(node: &mut Array<'_>, alloc: &mut dyn Allocator, p: TreeParams) -> Result<Ref> {
    let first = node.get(alloc, 0);
    if first % 2 == 0 {
        return Ok(first as Ref);
    }
    let elems_per_child = first / 2;
    let num_children    = node.size() - 2;
    let values: Vec<i64> = (1..num_children as i64).map(|i| i * elems_per_child).collect();
    let offsets = create_filled(alloc, NodeKind::Normal, p.initial_capacity, &values)?;
    if let Err(e) = node.set(alloc, 0, offsets as i64) {
        alloc.free(offsets);
        return Err(e);
    }
    debug!(node = node.get_ref(), children = num_children, "offsets materialized");
    Ok(offsets)
}

/// 插入路径上的一个内部节点及下降到的子节点序号
#[derive(Debug, Clone, Copy)]
struct PathStep {
    node:      Ref,
    child_ndx: usize,
}

/// 沿插入路径下降并预留容量，返回叶子 ref 与叶内插入位置。
///
/// 内部节点与其 offsets 按 64 位预留一个空位，之后挂入任意 ref、调整总数都不会搬迁；
/// 节点一旦预留完成，其 ref 在本次插入内保持不变，path 中记录的就是最终 ref。
fn prepare_path(node: &mut Array<'_>, alloc: &mut dyn Allocator, ndx: usize, value: i64, append: bool, p: TreeParams, path: &mut Vec<PathStep>) -> Result<(Ref, usize)> {
    if node.is_leaf() {
        let size = node.size();
        let ndx  = if append { size } else { ndx };
        // 满叶子在末尾分裂时新值只进兄弟节点，叶子本身不变
        if size < p.max_node_size || ndx < size {
            node.ensure_minimum_width(alloc, value)?;
            let width = node.width();
            node.reserve_insert(alloc, width)?;
        }
        return Ok((node.get_ref(), ndx));
    }

    debug_assert!(node.size() >= 3, "inner node without children");
    node.reserve_insert(alloc, 64)?;
    if !append {
        ensure_offsets(node, alloc, p)?;
    }
    if node.get(alloc, 0) % 2 == 0 {
        Array::child_of(alloc, node, 0).reserve_insert(alloc, 64)?;
    }

    let (child_ndx, ndx_in_child) = if append {
        (node.size() - 3, 0)
    } else if ndx == 0 {
        (0, 0)
    } else {
        let offsets   = MemRef::new(alloc, node.get_as_ref(alloc, 0));
        let child_ndx = lower_bound(&offsets, ndx as i64);
        debug_assert!(child_ndx < node.size() - 2);
        let base      = if child_ndx == 0 { 0 } else { offsets.get(child_ndx - 1) as usize };
        (child_ndx, ndx - base)
    };

    path.push(PathStep { node: node.get_ref(), child_ndx });
    let mut child = Array::child_of(alloc, node, 1 + child_ndx);
    prepare_path(&mut child, alloc, ndx_in_child, value, append, p, path)
}

/// 内部节点在一次插入中的改动
#[derive(Debug, Clone, Copy)]
enum Link {
    /// 子节点未分裂，只有总数 +1
    Grow,
    /// 子节点分裂出 sibling，本节点有空位直接挂入
    Attach { sibling: Ref, split_offset: usize },
    /// 本节点已满，sibling 连同其后的子节点移入 new_node；本节点只剩 new_total 个元素
    Split { new_node: Ref, new_total: usize, at_end: bool },
}

/// 一次插入的完整改动。build 只分配新节点，apply 才修改树中已有节点。
#[derive(Debug)]
struct InsertPlan {
    leaf:       Ref,
    ndx:        usize,
    value:      i64,
    /// 叶子已满时分裂出的兄弟
    leaf_split: Option<Ref>,
    /// 自底向上，与 path 逆序一一对应
    links:      Vec<Link>,
    new_root:   Option<Ref>,
}

impl InsertPlan {
    fn new(leaf: Ref, ndx: usize, value: i64, depth: usize) -> Self {
        Self { leaf, ndx, value, leaf_split: None, links: Vec::with_capacity(depth), new_root: None }
    }

    /// 预先构造所有新节点；失败时释放已构造的部分，树保持原状
    fn build(&mut self, alloc: &mut dyn Allocator, root: Ref, path: &[PathStep], append: bool, p: TreeParams) -> Result<()> {
        if let Err(e) = self.build_nodes(alloc, root, path, append, p) {
            self.discard(alloc);
            return Err(e);
        }
        Ok(())
    }

    fn build_nodes(&mut self, alloc: &mut dyn Allocator, root: Ref, path: &[PathStep], append: bool, p: TreeParams) -> Result<()> {
        let mut state   = SplitState::default();
        let mut sibling = self.split_leaf(alloc, p, &mut state)?;
        for step in path.iter().rev() {
            let link = match sibling {
                Some(s) => split_inner(alloc, step, s, p, &mut state)?,
                None => Link::Grow,
            };
            sibling = match link {
                Link::Split { new_node, .. } => Some(new_node),
                _ => None,
            };
            self.links.push(link);
        }
        if let Some(s) = sibling {
            self.new_root = Some(build_root(alloc, root, s, &state, append, p)?);
        }
        Ok(())
    }

    fn split_leaf(&mut self, alloc: &mut dyn Allocator, p: TreeParams, state: &mut SplitState) -> Result<Option<Ref>> {
        let moved = {
            let leaf = MemRef::new(alloc, self.leaf);
            let size = leaf.size();
            if size < p.max_node_size {
                return Ok(None);
            }
            state.split_offset = if self.ndx == size { size } else { self.ndx + 1 };
            state.split_size   = size + 1;
            if self.ndx == size {
                vec![self.value]
            } else {
                (self.ndx..size).map(|i| leaf.get(i)).collect::<Vec<_>>()
            }
        };
        let sibling = create_filled(alloc, NodeKind::Normal, p.initial_capacity, &moved)?;
        self.leaf_split = Some(sibling);
        debug!(leaf = self.leaf, sibling, split_offset = state.split_offset, "leaf split");
        Ok(Some(sibling))
    }

    fn discard(&mut self, alloc: &mut dyn Allocator) {
        if let Some(s) = self.leaf_split.take() {
            alloc.free(s);
        }
        for link in self.links.drain(..) {
            if let Link::Split { new_node, .. } = link {
                free_inner_shallow(alloc, new_node);
            }
        }
    }

    /// 按计划改写叶子与路径上的内部节点
    fn apply(&self, alloc: &mut dyn Allocator, path: &[PathStep]) -> Result<()> {
        let mut leaf = Array::from_ref(alloc, self.leaf);
        match self.leaf_split {
            None => leaf.insert(alloc, self.ndx, self.value)?,
            Some(_) if self.ndx == leaf.size() => {}
            Some(_) => {
                leaf.truncate(alloc, self.ndx)?;
                leaf.add(alloc, self.value)?;
            }
        }
        debug_assert_eq!(leaf.get_ref(), self.leaf, "leaf relocated after reservation");

        for (step, link) in path.iter().rev().zip(&self.links) {
            let c = step.child_ndx;
            let mut node = Array::from_ref(alloc, step.node);
            let first    = node.get(alloc, 0);
            let mut offsets = if first % 2 == 0 { Some(Array::from_ref(alloc, first as Ref)) } else { None };

            match *link {
                Link::Grow => {
                    if let Some(offsets) = offsets.as_mut() {
                        let n = offsets.size();
                        offsets.adjust_range(alloc, c, n, 1)?;
                    }
                    let last = node.size() - 1;
                    node.adjust(alloc, last, 2)?;
                }
                Link::Attach { sibling, split_offset } => {
                    node.insert(alloc, c + 2, sibling as i64)?;
                    if let Some(offsets) = offsets.as_mut() {
                        let base = if c == 0 { 0 } else { offsets.get(alloc, c - 1) };
                        offsets.insert(alloc, c, base + split_offset as i64)?;
                        let n = offsets.size();
                        offsets.adjust_range(alloc, c + 1, n, 1)?;
                    }
                    let last = node.size() - 1;
                    node.adjust(alloc, last, 2)?;
                }
                Link::Split { new_total, at_end, .. } => {
                    let total = 1 + 2 * new_total as i64;
                    if at_end {
                        let last = node.size() - 1;
                        node.set(alloc, last, total)?;
                    } else {
                        // 保留 first + child_0..=child_c
                        node.truncate(alloc, 2 + c)?;
                        node.add(alloc, total)?;
                        if let Some(offsets) = offsets.as_mut() {
                            offsets.truncate(alloc, c)?;
                        }
                    }
                }
            }
            debug_assert_eq!(node.get_ref(), step.node, "inner node relocated after reservation");
        }
        Ok(())
    }
}

/// 子节点 c 分裂出 sibling 时本节点的改动；本节点已满则预先构造它的新兄弟
fn split_inner(alloc: &mut dyn Allocator, step: &PathStep, sibling: Ref, p: TreeParams, state: &mut SplitState) -> Result<Link> {
    let c = step.child_ndx;
    let (num_children, first, old_total, offs, tail) = {
        let mem   = MemRef::new(alloc, step.node);
        let first = mem.get(0);
        let offs: Vec<i64> = if first % 2 == 0 {
            let o = MemRef::new(alloc, first as Ref);
            (0..o.size()).map(|i| o.get(i)).collect()
        } else {
            Vec::new()
        };
        let tail: Vec<Ref> = (c + 2..mem.size() - 1).map(|i| mem.get_as_ref(i)).collect();
        (mem.size() - 2, first, bptree_size(&mem), offs, tail)
    };

    if num_children < p.max_node_size {
        return Ok(Link::Attach { sibling, split_offset: state.split_offset });
    }

    let general = first % 2 == 0;
    let new_ndx = c + 1;
    let base_c  = if general {
        if c == 0 { 0 } else { offs[c - 1] as usize }
    } else {
        c * (first / 2) as usize
    };
    let size_s    = state.split_size - state.split_offset;
    let new_total = base_c + state.split_offset;
    let at_end    = new_ndx == num_children;

    let new_node = if at_end {
        // 新兄弟落在末尾：新内部节点只含 sibling
        let first2 = if general {
            create_filled(alloc, NodeKind::Normal, p.initial_capacity, &[])? as i64
        } else {
            first
        };
        match build_inner(alloc, p, first2, &[sibling], size_s) {
            Ok(r) => r,
            Err(e) => {
                if general {
                    alloc.free(first2 as Ref);
                }
                return Err(e);
            }
        }
    } else {
        debug_assert!(general, "mid-node split requires offsets");
        // 新节点：[offsets2, sibling, child_{c+1}..child_{k-1}, total2]
        let off_c = offs[c];
        let mut offs2 = Vec::with_capacity(num_children - new_ndx);
        offs2.push(size_s as i64);
        for &o in &offs[new_ndx..] {
            offs2.push(size_s as i64 + o - off_c);
        }
        let mut children = Vec::with_capacity(1 + tail.len());
        children.push(sibling);
        children.extend_from_slice(&tail);
        let total2 = size_s + old_total - off_c as usize;

        let offsets2 = create_filled(alloc, NodeKind::Normal, p.initial_capacity, &offs2)?;
        match build_inner(alloc, p, offsets2 as i64, &children, total2) {
            Ok(r) => r,
            Err(e) => {
                alloc.free(offsets2);
                return Err(e);
            }
        }
    };

    debug!(node = step.node, new_node, left = new_total, total = old_total + 1, "inner node split");
    state.split_offset = new_total;
    state.split_size   = old_total + 1;
    Ok(Link::Split { new_node, new_total, at_end })
}

/// 根分裂时的新根：[first, old_root, sibling, total]
fn build_root(alloc: &mut dyn Allocator, old_root: Ref, sibling: Ref, state: &SplitState, append: bool, p: TreeParams) -> Result<Ref> {
    // 紧凑形式要求两侧都是叶子或都是紧凑内部节点
    let compact = append && {
        let mem = MemRef::new(alloc, old_root);
        mem.is_leaf() || mem.get(0) % 2 != 0
    };
    let first = if compact {
        1 + 2 * state.split_offset as i64
    } else {
        create_filled(alloc, NodeKind::Normal, p.initial_capacity, &[state.split_offset as i64])? as i64
    };
    match build_inner(alloc, p, first, &[old_root, sibling], state.split_size) {
        Ok(r) => {
            debug!(old_root, new_root = r, total = state.split_size, compact, "new root built");
            Ok(r)
        }
        Err(e) => {
            if !compact {
                alloc.free(first as Ref);
            }
            Err(e)
        }
    }
}

// ── 删除 ──────────────────────────────────────────────────────────────────────

fn free_inner_shallow(alloc: &mut dyn Allocator, r: Ref) {
    let first = MemRef::new(alloc, r).get(0);
    if is_ref(first) {
        alloc.free(first as Ref);
    }
    alloc.free(r);
}

/// 释放一条单子节点链，底部叶子交给 handler
fn destroy_singlet(alloc: &mut dyn Allocator, r: Ref, handler: &mut dyn EraseHandler) {
    let mut r = r;
    loop {
        let next = {
            let mem = MemRef::new(alloc, r);
            if mem.is_leaf() { None } else { Some(mem.get_as_ref(1)) }
        };
        match next {
            None => {
                handler.destroy_leaf(alloc, r);
                return;
            }
            Some(child) => {
                free_inner_shallow(alloc, r);
                r = child;
            }
        }
    }
}

/// 返回 true 表示整个子树将变空（此时本节点未被修改）
fn do_erase(node: &mut Array<'_>, alloc: &mut dyn Allocator, ndx: Option<usize>, p: TreeParams, handler: &mut dyn EraseHandler) -> Result<bool> {
    let num_children = node.size() - 2;
    debug_assert!(num_children >= 1, "inner node without children");

    let (child_ndx, ndx_in_child) = match ndx {
        Some(ndx) => {
            ensure_offsets(node, alloc, p)?;
            let offsets   = MemRef::new(alloc, node.get_as_ref(alloc, 0));
            let child_ndx = upper_bound(&offsets, ndx as i64);
            let base      = if child_ndx == 0 { 0 } else { offsets.get(child_ndx - 1) as usize };
            (child_ndx, Some(ndx - base))
        }
        None => (num_children - 1, None),
    };

    // 叶子改动之后的回写只剩缩小数值与删除，先取得可写副本即可保证不再分配
    node.copy_on_write(alloc)?;
    if node.get(alloc, 0) % 2 == 0 {
        Array::child_of(alloc, node, 0).copy_on_write(alloc)?;
    }
    let destroy_child = {
        let mut child = Array::child_of(alloc, node, 1 + child_ndx);
        if child.is_leaf() {
            handler.erase_leaf_elem(alloc, &mut child, ndx_in_child)?
        } else {
            do_erase(&mut child, alloc, ndx_in_child, p, handler)?
        }
    };

    if destroy_child {
        if num_children == 1 {
            return Ok(true);
        }
        let child_ref = node.get_as_ref(alloc, 1 + child_ndx);
        node.erase(alloc, 1 + child_ndx)?;
        destroy_singlet(alloc, child_ref, handler);
    }

    if node.get(alloc, 0) % 2 == 0 {
        let mut offsets = Array::child_of(alloc, node, 0);
        let mut begin = child_ndx;
        if destroy_child {
            if child_ndx == num_children - 1 {
                begin -= 1;
            }
            offsets.erase(alloc, begin)?;
        }
        let n = offsets.size();
        offsets.adjust_range(alloc, begin, n, -1)?;
    }
    let last = node.size() - 1;
    node.adjust(alloc, last, -2)?;
    Ok(false)
}

// ── 更新 ──────────────────────────────────────────────────────────────────────

fn update_elem(node: &mut Array<'_>, alloc: &mut dyn Allocator, ndx: usize, handler: &mut dyn UpdateHandler) -> Result<()> {
    let (child_ndx, local) = child_for(alloc, &node.mem(alloc), ndx);
    let mut child = Array::child_of(alloc, node, 1 + child_ndx);
    if child.is_leaf() {
        handler.update(alloc, &mut child, local)
    } else {
        update_elem(&mut child, alloc, local, handler)
    }
}

fn update_leaves(node: &mut Array<'_>, alloc: &mut dyn Allocator, handler: &mut dyn UpdateHandler) -> Result<()> {
    for i in 1..node.size() - 1 {
        let mut child = Array::child_of(alloc, node, i);
        if child.is_leaf() {
            handler.update(alloc, &mut child, 0)?;
        } else {
            update_leaves(&mut child, alloc, handler)?;
        }
    }
    Ok(())
}

// ── BpTree ────────────────────────────────────────────────────────────────────

/// 持有根 ref 的整数 B+ 树；根既可以是叶子也可以是内部节点
#[derive(Debug)]
pub struct BpTree {
    root:   Ref,
    params: TreeParams,
}

impl ArrayParent for BpTree {
    fn update_child_ref(&mut self, _alloc: &mut dyn Allocator, _child_ndx: usize, new_ref: Ref) -> Result<()> {
        self.root = new_ref;
        Ok(())
    }

    fn get_child_ref(&self, _alloc: &dyn Allocator, _child_ndx: usize) -> Ref { self.root }
}

impl BpTree {
    /// 以一个空叶子为根新建
    pub fn new(alloc: &mut dyn Allocator, config: &ArrayConfig) -> Result<Self> {
        let mut leaf = Array::create_with_capacity(alloc, NodeKind::Normal, config.initial_capacity)?;
        Ok(Self::open(leaf.release_ownership(), config))
    }

    /// 挂载已有的树
    pub fn open(root: Ref, config: &ArrayConfig) -> Self {
        Self {
            root,
            params: TreeParams {
                max_node_size:    config.max_node_size,
                initial_capacity: config.initial_capacity,
            },
        }
    }

    pub fn root_ref(&self) -> Ref { self.root }

    pub fn max_node_size(&self) -> usize { self.params.max_node_size }

    pub fn root_is_leaf(&self, alloc: &dyn Allocator) -> bool {
        header::read_is_leaf(alloc.translate(self.root))
    }

    pub fn size(&self, alloc: &dyn Allocator) -> usize {
        let mem = MemRef::new(alloc, self.root);
        if mem.is_leaf() { mem.size() } else { bptree_size(&mem) }
    }

    pub fn is_empty(&self, alloc: &dyn Allocator) -> bool { self.size(alloc) == 0 }

    /// 树高度（只有叶子时为 1）
    pub fn height(&self, alloc: &dyn Allocator) -> usize {
        let mut mem = MemRef::new(alloc, self.root);
        let mut h   = 1;
        while !mem.is_leaf() {
            mem = MemRef::new(alloc, mem.get_as_ref(1));
            h += 1;
        }
        h
    }

    pub fn get(&self, alloc: &dyn Allocator, ndx: usize) -> i64 {
        let (leaf, local) = locate_leaf(alloc, self.root, ndx);
        leaf.get(local)
    }

    pub fn to_vec(&self, alloc: &dyn Allocator) -> Vec<i64> {
        let mut out = Vec::new();
        self.visit_leaves(alloc, &mut |leaf, _| {
            out.extend((0..leaf.size()).map(|i| leaf.get(i)));
            true
        });
        out
    }

    /// 按顺序访问每个叶子，回调参数为叶子及其首元素的树下标；回调返回 false 时提前结束
    pub fn visit_leaves(&self, alloc: &dyn Allocator, f: &mut dyn FnMut(MemRef<'_>, usize) -> bool) -> bool {
        for_each_leaf(alloc, self.root, 0, f).0
    }

    pub fn set(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: i64) -> Result<()> {
        self.update_elem(alloc, ndx, &mut SetValue(value))
    }

    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: i64) -> Result<()> {
        let size = self.size(alloc);
        debug_assert!(ndx <= size, "insert position {ndx} beyond size {size}");
        self.do_insert(alloc, ndx, value, ndx == size)
    }

    pub fn append(&mut self, alloc: &mut dyn Allocator, value: i64) -> Result<()> {
        let size = self.size(alloc);
        self.do_insert(alloc, size, value, true)
    }

    fn do_insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: i64, append: bool) -> Result<()> {
        let p        = self.params;
        let root_ref = self.root;
        let mut path = Vec::new();
        let (leaf, ndx_in_leaf) = {
            let mut root = Array::with_parent(alloc, root_ref, self, 0);
            prepare_path(&mut root, alloc, ndx, value, append, p, &mut path)?
        };

        let mut plan = InsertPlan::new(leaf, ndx_in_leaf, value, path.len());
        plan.build(alloc, self.root, &path, append, p)?;
        plan.apply(alloc, &path)?;
        if let Some(new_root) = plan.new_root {
            debug!(old_root = self.root, new_root, "new root introduced");
            self.root = new_root;
        }
        Ok(())
    }

    /// 用默认整数叶子行为删除
    pub fn remove(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        let mut handler = IntEraseHandler { leaf_capacity: self.params.initial_capacity };
        self.erase(alloc, ndx, &mut handler)
    }

    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize, handler: &mut dyn EraseHandler) -> Result<()> {
        let size = self.size(alloc);
        debug_assert!(ndx < size, "erase position {ndx} out of range {size}");
        let local    = if ndx + 1 == size { None } else { Some(ndx) };
        let p        = self.params;
        let root_ref = self.root;

        if self.root_is_leaf(alloc) {
            let empty = {
                let mut leaf = Array::with_parent(alloc, root_ref, self, 0);
                handler.erase_leaf_elem(alloc, &mut leaf, local)?
            };
            if empty {
                let old_root = self.root;
                self.root = handler.replace_root(alloc, RootReplacement::EmptyLeaf)?;
                handler.destroy_leaf(alloc, old_root);
            }
            return Ok(());
        }

        let destroy_root = {
            let mut root = Array::with_parent(alloc, root_ref, self, 0);
            do_erase(&mut root, alloc, local, p, handler)?
        };
        if destroy_root {
            let old_root = self.root;
            self.root = handler.replace_root(alloc, RootReplacement::EmptyLeaf)?;
            destroy_singlet(alloc, old_root, handler);
            debug!(old_root, new_root = self.root, "tree emptied");
            return Ok(());
        }

        // 根只剩一个子节点时，沿单子节点链下降到第一个有多个子节点的节点或叶子
        let mut chain = Vec::new();
        let mut r = self.root;
        loop {
            let mem = MemRef::new(alloc, r);
            if mem.is_leaf() || mem.size() > 3 {
                break;
            }
            chain.push(r);
            r = mem.get_as_ref(1);
        }
        if chain.is_empty() {
            return Ok(());
        }
        self.root = handler.replace_root(alloc, RootReplacement::Node(r))?;
        for n in &chain {
            free_inner_shallow(alloc, *n);
        }
        debug!(new_root = self.root, dropped = chain.len(), "root collapsed");
        Ok(())
    }

    pub fn update_elem(&mut self, alloc: &mut dyn Allocator, ndx: usize, handler: &mut dyn UpdateHandler) -> Result<()> {
        let root_ref = self.root;
        let mut root = Array::with_parent(alloc, root_ref, self, 0);
        if root.is_leaf() {
            handler.update(alloc, &mut root, ndx)
        } else {
            update_elem(&mut root, alloc, ndx, handler)
        }
    }

    /// 对每个叶子调用 handler（叶内下标恒为 0）
    pub fn update_leaves(&mut self, alloc: &mut dyn Allocator, handler: &mut dyn UpdateHandler) -> Result<()> {
        let root_ref = self.root;
        let mut root = Array::with_parent(alloc, root_ref, self, 0);
        if root.is_leaf() {
            handler.update(alloc, &mut root, 0)
        } else {
            update_leaves(&mut root, alloc, handler)
        }
    }

    /// 清空为一个空叶子
    pub fn clear(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        let mut leaf = Array::create_with_capacity(alloc, NodeKind::Normal, self.params.initial_capacity)?;
        let old_root = self.root;
        self.root = leaf.release_ownership();
        Array::destroy_ref(alloc, old_root);
        Ok(())
    }

    pub fn destroy(&mut self, alloc: &mut dyn Allocator) {
        if self.root != 0 {
            Array::destroy_ref(alloc, self.root);
            self.root = 0;
        }
    }

    // ── 查询 ──────────────────────────────────────────────────────────────────

    /// 在所有叶子上运行 find，每个叶子的 base_index 为其首元素的树下标
    pub fn find(&self, alloc: &dyn Allocator, cond: Cond, value: i64, state: &mut QueryState<'_>) -> bool {
        self.visit_leaves(alloc, &mut |leaf, base| query::find(&leaf, cond, value, 0, leaf.size(), base, state))
    }

    pub fn find_first(&self, alloc: &dyn Allocator, cond: Cond, value: i64) -> usize {
        let mut state = QueryState::new(Action::ReturnFirst, NPOS);
        self.find(alloc, cond, value, &mut state);
        state.first_index()
    }

    pub fn find_all(&self, alloc: &dyn Allocator, cond: Cond, value: i64, out: &mut Vec<usize>) {
        let mut state = QueryState::find_all(out, NPOS);
        self.find(alloc, cond, value, &mut state);
    }

    pub fn count(&self, alloc: &dyn Allocator, cond: Cond, value: i64) -> usize {
        let mut state = QueryState::new(Action::Count, NPOS);
        self.find(alloc, cond, value, &mut state);
        state.state as usize
    }

    pub fn sum(&self, alloc: &dyn Allocator) -> i64 {
        let mut sum = 0i64;
        self.visit_leaves(alloc, &mut |leaf, _| {
            sum = (0..leaf.size()).fold(sum, |acc, i| acc.wrapping_add(leaf.get(i)));
            true
        });
        sum
    }

    pub fn maximum(&self, alloc: &dyn Allocator) -> Option<i64> {
        let mut max = None;
        self.visit_leaves(alloc, &mut |leaf, _| {
            max = (0..leaf.size()).map(|i| leaf.get(i)).chain(max).max();
            true
        });
        max
    }

    pub fn minimum(&self, alloc: &dyn Allocator) -> Option<i64> {
        let mut min = None;
        self.visit_leaves(alloc, &mut |leaf, _| {
            min = (0..leaf.size()).map(|i| leaf.get(i)).chain(min).min();
            true
        });
        min
    }

    // ── 校验 ──────────────────────────────────────────────────────────────────

    /// 校验整棵树的结构不变式，返回元素总数；不满足时 panic
    pub fn verify(&self, alloc: &dyn Allocator) -> usize {
        verify_node(alloc, self.root, self.params.max_node_size)
    }
}

fn verify_node(alloc: &dyn Allocator, r: Ref, max: usize) -> usize {
    let mem = MemRef::new(alloc, r);
    if mem.is_leaf() {
        assert!(mem.size() <= max, "leaf {r} holds {} > {max} elements", mem.size());
        return mem.size();
    }
    assert!(mem.size() >= 3, "inner node {r} has no children");
    let num_children = mem.size() - 2;
    assert!(num_children <= max, "inner node {r} has {num_children} > {max} children");
    let back = mem.back();
    assert!(back % 2 == 1, "inner node {r} total slot is not odd");

    let sizes: Vec<usize> = (0..num_children).map(|i| verify_node(alloc, mem.get_as_ref(1 + i), max)).collect();
    let total: usize = sizes.iter().sum();
    assert_eq!(total, (back / 2) as usize, "inner node {r} total mismatch");

    let first = mem.get(0);
    if first % 2 != 0 {
        let per_child = (first / 2) as usize;
        for (i, &s) in sizes.iter().enumerate() {
            if i + 1 < num_children {
                assert_eq!(s, per_child, "compact node {r} child {i} size");
            } else {
                assert!(s <= per_child, "compact node {r} last child too large");
            }
        }
    } else {
        let offsets = MemRef::new(alloc, first as Ref);
        assert_eq!(offsets.size(), num_children - 1, "inner node {r} offsets length");
        let mut acc = 0usize;
        for (i, &s) in sizes.iter().take(num_children - 1).enumerate() {
            acc += s;
            assert_eq!(offsets.get(i) as usize, acc, "inner node {r} offset {i}");
        }
    }
    total
}
