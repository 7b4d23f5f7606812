//! 节点访问器（Array）
//!
//! `Array` 是一块「头 + 打包负载」节点上的非拥有视图：
//! - 元素位宽自适应增长（0/1/2/4/8/16/32/64），从不因删除而收缩
//! - 节点位于只读内存时，任何修改都先 copy-on-write，再通过父节点接口回写新 ref
//! - 访问器析构不释放内存，只有 `destroy` / `destroy_ref` 会递归释放
//!
//! 访问器本身不借用分配器：每个操作显式接收 `&dyn Allocator`（只读）或
//! `&mut dyn Allocator`（可能分配/搬迁），节点地址只在调用期间经由 `translate` 得到。
//!
//! ```text
//!   BpTree (ArrayParent)
//!     └─ Array<'p> root ── parent: &'p mut dyn ArrayParent, ndx
//!          └─ Array<'c> child ── parent: &'c mut Array<'p>, ndx
//! ```

use std::fmt;

use tracing::trace;

use crate::alloc::Allocator;
use crate::common::{round_up_8, ArrayError, Ref, Result, HEADER_SIZE, MAX_NODE_BYTES, NPOS};
use crate::header::{self, NodeHeader, WidthType};
use crate::packed;
use crate::writer::ArrayWriter;

/// 新建节点的默认容量（字节，含头）
pub const INITIAL_CAPACITY: usize = 128;

/// copy-on-write 时在实际大小之外多预留的字节
const COW_SLACK: usize = 64;

const MAX_CAPACITY: usize = MAX_NODE_BYTES & !7;

// ── NodeKind ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// 普通叶子，元素均为值
    Normal,
    /// 叶子，元素可以是子节点 ref
    HasRefs,
    /// B+ 树内部节点
    InnerNode,
}

impl NodeKind {
    /// (is_leaf, has_refs)
    fn flags(self) -> (bool, bool) {
        match self {
            NodeKind::Normal    => (true, false),
            NodeKind::HasRefs   => (true, true),
            NodeKind::InnerNode => (false, true),
        }
    }

    fn of(h: &NodeHeader) -> Self {
        if !h.is_leaf {
            NodeKind::InnerNode
        } else if h.has_refs {
            NodeKind::HasRefs
        } else {
            NodeKind::Normal
        }
    }
}

/// 元素是否是子节点引用（偶数且非 0）
#[inline]
pub fn is_ref(v: i64) -> bool { v != 0 && v & 1 == 0 }

// ── ArrayParent ───────────────────────────────────────────────────────────────

/// 父节点能力：子节点搬迁后回写新 ref，或被子节点查询自己的 ref
pub trait ArrayParent {
    fn update_child_ref(&mut self, alloc: &mut dyn Allocator, child_ndx: usize, new_ref: Ref) -> Result<()>;
    fn get_child_ref(&self, alloc: &dyn Allocator, child_ndx: usize) -> Ref;
}

struct ParentLink<'p> {
    parent: &'p mut dyn ArrayParent,
    ndx:    usize,
}

/// 访问器是否负责释放所指节点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// 刚创建、尚未挂到任何父节点上
    Owned,
    /// 视图，节点归父节点（或外部）所有
    Borrowed,
}

// ── MemRef ────────────────────────────────────────────────────────────────────

/// 节点内存的只读视图，不构造访问器、不记录父节点
#[derive(Clone, Copy)]
pub struct MemRef<'a> {
    ref_:   Ref,
    header: NodeHeader,
    data:   &'a [u8],
}

impl<'a> MemRef<'a> {
    pub fn new(alloc: &'a dyn Allocator, r: Ref) -> Self {
        let data = alloc.translate(r);
        Self { ref_: r, header: header::decode(data), data }
    }

    pub fn get_ref(&self)  -> Ref         { self.ref_ }
    pub fn header(&self)   -> &NodeHeader { &self.header }
    pub fn size(&self)     -> usize       { self.header.size }
    pub fn width(&self)    -> usize       { self.header.width }
    pub fn is_leaf(&self)  -> bool        { self.header.is_leaf }
    pub fn has_refs(&self) -> bool        { self.header.has_refs }
    pub fn lbound(&self)   -> i64         { packed::lbound(self.header.width) }
    pub fn ubound(&self)   -> i64         { packed::ubound(self.header.width) }

    pub fn payload(&self) -> &'a [u8] { &self.data[HEADER_SIZE..] }

    /// 节点实际占用的字节（含头）
    pub fn bytes(&self) -> &'a [u8] { &self.data[..self.header.byte_size()] }

    #[inline]
    pub fn get(&self, ndx: usize) -> i64 {
        debug_assert!(ndx < self.header.size, "index {ndx} out of range {}", self.header.size);
        packed::get(self.header.width, self.payload(), ndx)
    }

    pub fn get_as_ref(&self, ndx: usize) -> Ref { self.get(ndx) as Ref }

    pub fn back(&self) -> i64 { self.get(self.header.size - 1) }
}

impl fmt::Debug for MemRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRef").field("ref", &self.ref_).field("header", &self.header).finish()
    }
}

// ── MemStats ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemStats {
    /// 分配的容量之和
    pub allocated:   usize,
    /// 实际占用字节之和
    pub used:        usize,
    pub array_count: usize,
}

impl MemStats {
    pub fn add(&mut self, other: &MemStats) {
        self.allocated   += other.allocated;
        self.used        += other.used;
        self.array_count += other.array_count;
    }
}

// ── Array ─────────────────────────────────────────────────────────────────────

pub struct Array<'p> {
    ref_:      Ref,
    header:    NodeHeader,
    lbound:    i64,
    ubound:    i64,
    ownership: Ownership,
    parent:    Option<ParentLink<'p>>,
}

impl fmt::Debug for Array<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("ref", &self.ref_)
            .field("header", &self.header)
            .field("ownership", &self.ownership)
            .field("ndx_in_parent", &self.parent.as_ref().map(|p| p.ndx))
            .finish()
    }
}

impl Default for Array<'_> {
    fn default() -> Self { Self::new() }
}

impl<'p> Array<'p> {
    /// 未挂载的访问器
    pub fn new() -> Self {
        Self {
            ref_:      0,
            header:    NodeHeader::leaf(false),
            lbound:    0,
            ubound:    0,
            ownership: Ownership::Borrowed,
            parent:    None,
        }
    }

    /// 分配一个空节点并挂载，访问器拥有该节点直到 `release_ownership`
    pub fn create(alloc: &mut dyn Allocator, kind: NodeKind) -> Result<Self> {
        Self::create_with_capacity(alloc, kind, INITIAL_CAPACITY)
    }

    pub fn create_with_capacity(alloc: &mut dyn Allocator, kind: NodeKind, capacity: usize) -> Result<Self> {
        let capacity = round_up_8(capacity.max(HEADER_SIZE)).min(MAX_CAPACITY);
        let r        = alloc.alloc(capacity)?;
        let (is_leaf, has_refs) = kind.flags();
        let h = NodeHeader {
            is_leaf,
            has_refs,
            is_index_node: false,
            width_type:    WidthType::Bits,
            width:         0,
            size:          0,
            capacity,
        };
        header::write(alloc.translate_mut(r), &h);

        let mut array = Self::new();
        array.attach(r, h);
        array.ownership = Ownership::Owned;
        Ok(array)
    }

    pub fn from_ref(alloc: &dyn Allocator, r: Ref) -> Self {
        let mut array = Self::new();
        array.init_from_ref(alloc, r);
        array
    }

    pub fn with_parent(alloc: &dyn Allocator, r: Ref, parent: &'p mut dyn ArrayParent, ndx: usize) -> Self {
        let mut array = Self::from_ref(alloc, r);
        array.parent  = Some(ParentLink { parent, ndx });
        array
    }

    /// 挂载到 parent 第 ndx 个元素所引用的子节点
    pub fn child_of(alloc: &dyn Allocator, parent: &'p mut Array<'_>, ndx: usize) -> Self {
        let r = parent.get_as_ref(alloc, ndx);
        Self::with_parent(alloc, r, parent, ndx)
    }

    pub fn init_from_ref(&mut self, alloc: &dyn Allocator, r: Ref) {
        debug_assert!(r != 0 && r % 8 == 0, "bad ref {r}");
        self.attach(r, header::decode(alloc.translate(r)));
    }

    fn attach(&mut self, r: Ref, h: NodeHeader) {
        self.ref_   = r;
        self.header = h;
        self.lbound = packed::lbound(h.width);
        self.ubound = packed::ubound(h.width);
    }

    /// 解除挂载，不释放内存
    pub fn detach(&mut self) {
        self.ref_      = 0;
        self.ownership = Ownership::Borrowed;
    }

    pub fn set_parent(&mut self, parent: Option<&'p mut dyn ArrayParent>, ndx: usize) {
        self.parent = parent.map(|parent| ParentLink { parent, ndx });
    }

    pub fn has_parent(&self) -> bool { self.parent.is_some() }

    pub fn ndx_in_parent(&self) -> Option<usize> { self.parent.as_ref().map(|p| p.ndx) }

    pub fn set_ndx_in_parent(&mut self, ndx: usize) {
        if let Some(link) = self.parent.as_mut() {
            link.ndx = ndx;
        }
    }

    // ── 所有权 ────────────────────────────────────────────────────────────────

    pub fn ownership(&self) -> Ownership { self.ownership }
    pub fn is_owned(&self)  -> bool      { self.ownership == Ownership::Owned }

    pub fn take_ownership(&mut self) {
        debug_assert!(self.is_attached());
        self.ownership = Ownership::Owned;
    }

    /// 交出所有权（通常在挂到父节点之前），返回节点 ref
    pub fn release_ownership(&mut self) -> Ref {
        self.ownership = Ownership::Borrowed;
        self.ref_
    }

    // ── 只读属性 ──────────────────────────────────────────────────────────────

    pub fn is_attached(&self)   -> bool     { self.ref_ != 0 }
    pub fn get_ref(&self)       -> Ref      { self.ref_ }
    pub fn size(&self)          -> usize    { self.header.size }
    pub fn is_empty(&self)      -> bool     { self.header.size == 0 }
    pub fn width(&self)         -> usize    { self.header.width }
    pub fn capacity(&self)      -> usize    { self.header.capacity }
    pub fn is_leaf(&self)       -> bool     { self.header.is_leaf }
    pub fn has_refs(&self)      -> bool     { self.header.has_refs }
    pub fn is_index_node(&self) -> bool     { self.header.is_index_node }
    pub fn kind(&self)          -> NodeKind { NodeKind::of(&self.header) }
    pub fn lbound(&self)        -> i64      { self.lbound }
    pub fn ubound(&self)        -> i64      { self.ubound }
    pub fn byte_size(&self)     -> usize    { self.header.byte_size() }

    pub fn mem<'a>(&self, alloc: &'a dyn Allocator) -> MemRef<'a> {
        debug_assert!(self.is_attached(), "unattached accessor");
        MemRef::new(alloc, self.ref_)
    }

    fn payload<'a>(&self, alloc: &'a dyn Allocator) -> &'a [u8] {
        debug_assert!(self.is_attached(), "unattached accessor");
        &alloc.translate(self.ref_)[HEADER_SIZE..]
    }

    fn payload_mut<'a>(&self, alloc: &'a mut dyn Allocator) -> &'a mut [u8] {
        debug_assert!(self.is_attached(), "unattached accessor");
        &mut alloc.translate_mut(self.ref_)[HEADER_SIZE..]
    }

    fn sync_header(&self, alloc: &mut dyn Allocator) {
        header::write(alloc.translate_mut(self.ref_), &self.header);
    }

    // ── 读取 ──────────────────────────────────────────────────────────────────

    #[inline]
    pub fn get(&self, alloc: &dyn Allocator, ndx: usize) -> i64 {
        debug_assert!(ndx < self.header.size, "index {ndx} out of range {}", self.header.size);
        packed::get(self.header.width, self.payload(alloc), ndx)
    }

    pub fn get_as_ref(&self, alloc: &dyn Allocator, ndx: usize) -> Ref {
        let v = self.get(alloc, ndx);
        debug_assert!(v >= 0 && v % 2 == 0, "element {ndx} is not a ref: {v}");
        v as Ref
    }

    pub fn front(&self, alloc: &dyn Allocator) -> i64 { self.get(alloc, 0) }
    pub fn back(&self, alloc: &dyn Allocator)  -> i64 { self.get(alloc, self.header.size - 1) }

    pub fn to_vec(&self, alloc: &dyn Allocator) -> Vec<i64> {
        let data = self.payload(alloc);
        (0..self.header.size).map(|i| packed::get(self.header.width, data, i)).collect()
    }

    // ── 内存管理 ──────────────────────────────────────────────────────────────

    fn update_parent(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        let r = self.ref_;
        match self.parent.as_mut() {
            Some(link) => link.parent.update_child_ref(alloc, link.ndx, r),
            None => Ok(()),
        }
    }

    /// 把节点搬到一块新分配的 new_cap 字节内存，回写父节点后释放旧块。
    /// 父节点回写失败时撤销本次搬迁，树保持原状。
    fn relocate(&mut self, alloc: &mut dyn Allocator, new_cap: usize) -> Result<()> {
        let old_ref = self.ref_;
        let old_cap = self.header.capacity;
        let used    = self.header.byte_size();

        let bytes   = alloc.translate(old_ref)[..used].to_vec();
        let new_ref = alloc.alloc(new_cap)?;
        alloc.translate_mut(new_ref)[..used].copy_from_slice(&bytes);

        self.ref_            = new_ref;
        self.header.capacity = new_cap;
        self.sync_header(alloc);

        if let Err(e) = self.update_parent(alloc) {
            alloc.free(new_ref);
            self.ref_            = old_ref;
            self.header.capacity = old_cap;
            return Err(e);
        }
        alloc.free(old_ref);
        Ok(())
    }

    /// 节点位于只读内存时复制出可写副本
    pub fn copy_on_write(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        debug_assert!(self.is_attached(), "unattached accessor");
        if !alloc.is_read_only(self.ref_) {
            return Ok(());
        }
        let old_ref = self.ref_;
        let new_cap = round_up_8(self.header.byte_size() + COW_SLACK).min(MAX_CAPACITY);
        self.relocate(alloc, new_cap)?;
        trace!(old_ref, new_ref = self.ref_, capacity = new_cap, "copy-on-write");
        Ok(())
    }

    /// 预先取得可写副本，并预留再插入一个 width 位元素的容量（不低于当前位宽）。
    /// 之后只要元素不超过 width 位，插入、设值都不会再搬迁节点。
    pub fn reserve_insert(&mut self, alloc: &mut dyn Allocator, width: usize) -> Result<()> {
        self.copy_on_write(alloc)?;
        let size  = self.header.size;
        let width = width.max(self.header.width);
        self.reserve(alloc, size + 1, width)
    }

    /// 确保容量足以容纳 count 个 width 位的元素；不改写 size/width
    fn reserve(&mut self, alloc: &mut dyn Allocator, count: usize, width: usize) -> Result<()> {
        if count > MAX_NODE_BYTES {
            return Err(ArrayError::SizeOverflow(count));
        }
        let needed = header::calc_byte_size(self.header.width_type, count, width);
        if needed <= self.header.capacity {
            return Ok(());
        }
        if needed > MAX_CAPACITY {
            return Err(ArrayError::CapacityOverflow(needed));
        }
        let old_cap = self.header.capacity;
        let new_cap = round_up_8(needed.max(old_cap * 2)).min(MAX_CAPACITY);
        let old_ref = self.ref_;
        self.relocate(alloc, new_cap)?;
        trace!(old_ref, new_ref = self.ref_, old_cap, new_cap, "node grown");
        Ok(())
    }

    fn set_width(&mut self, width: usize) {
        if width != self.header.width {
            trace!(node = self.ref_, from = self.header.width, to = width, "width upgrade");
        }
        self.header.width = width;
        self.lbound       = packed::lbound(width);
        self.ubound       = packed::ubound(width);
    }

    /// 从后往前按新位宽重新打包前 size 个元素；gap 及之后的元素整体后移一位
    fn repack(&self, alloc: &mut dyn Allocator, old_width: usize, new_width: usize, size: usize, gap: usize) {
        let data = self.payload_mut(alloc);
        for i in (0..size).rev() {
            let v   = packed::get(old_width, data, i);
            let dst = if i >= gap { i + 1 } else { i };
            packed::set(new_width, data, dst, v);
        }
    }

    /// 位宽增长：找到能同时容纳现有元素与 value 的最小位宽，重新打包全部元素
    pub fn ensure_minimum_width(&mut self, alloc: &mut dyn Allocator, value: i64) -> Result<()> {
        if value >= self.lbound && value <= self.ubound {
            return Ok(());
        }
        self.copy_on_write(alloc)?;
        let old_width = self.header.width;
        let new_width = packed::bit_width(value).max(old_width);
        let size      = self.header.size;
        self.reserve(alloc, size, new_width)?;
        self.repack(alloc, old_width, new_width, size, size);
        self.set_width(new_width);
        self.sync_header(alloc);
        Ok(())
    }

    // ── 修改 ──────────────────────────────────────────────────────────────────

    pub fn set(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: i64) -> Result<()> {
        debug_assert!(ndx < self.header.size, "index {ndx} out of range {}", self.header.size);
        self.copy_on_write(alloc)?;
        self.ensure_minimum_width(alloc, value)?;
        let width = self.header.width;
        packed::set(width, self.payload_mut(alloc), ndx, value);
        Ok(())
    }

    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: i64) -> Result<()> {
        let size = self.header.size;
        debug_assert!(ndx <= size, "insert position {ndx} beyond size {size}");
        self.copy_on_write(alloc)?;

        let old_width = self.header.width;
        let new_width = if value < self.lbound || value > self.ubound {
            packed::bit_width(value).max(old_width)
        } else {
            old_width
        };
        self.reserve(alloc, size + 1, new_width)?;

        if new_width != old_width {
            self.repack(alloc, old_width, new_width, size, ndx);
            self.set_width(new_width);
        } else if ndx < size {
            move_backward_raw(self.payload_mut(alloc), old_width, ndx, size, size + 1);
        }
        self.header.size = size + 1;
        self.sync_header(alloc);
        packed::set(new_width, self.payload_mut(alloc), ndx, value);
        Ok(())
    }

    pub fn add(&mut self, alloc: &mut dyn Allocator, value: i64) -> Result<()> {
        let size = self.header.size;
        self.insert(alloc, size, value)
    }

    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        self.erase_range(alloc, ndx, ndx + 1)
    }

    /// 删除 [begin, end)，后续元素前移。即使 has_refs 也不释放被删的子节点。
    pub fn erase_range(&mut self, alloc: &mut dyn Allocator, begin: usize, end: usize) -> Result<()> {
        let size = self.header.size;
        debug_assert!(begin <= end && end <= size, "bad range [{begin}, {end}) of {size}");
        if begin == end {
            return Ok(());
        }
        self.copy_on_write(alloc)?;
        let width = self.header.width;
        move_raw(self.payload_mut(alloc), width, end, size, begin);
        self.header.size = size - (end - begin);
        self.sync_header(alloc);
        Ok(())
    }

    /// 把 [begin, end) 向前搬到 dest（dest <= begin）
    pub fn move_range(&mut self, alloc: &mut dyn Allocator, begin: usize, end: usize, dest: usize) -> Result<()> {
        debug_assert!(begin <= end && end <= self.header.size && dest <= begin);
        self.copy_on_write(alloc)?;
        let width = self.header.width;
        move_raw(self.payload_mut(alloc), width, begin, end, dest);
        Ok(())
    }

    /// 把 [begin, end) 向后搬，使其结束于 dest_end（dest_end >= end）
    pub fn move_backward(&mut self, alloc: &mut dyn Allocator, begin: usize, end: usize, dest_end: usize) -> Result<()> {
        debug_assert!(begin <= end && end <= dest_end && dest_end <= self.header.size);
        self.copy_on_write(alloc)?;
        let width = self.header.width;
        move_backward_raw(self.payload_mut(alloc), width, begin, end, dest_end);
        Ok(())
    }

    /// 截断到 count 个元素，保留容量与位宽，不释放子节点
    pub fn truncate(&mut self, alloc: &mut dyn Allocator, count: usize) -> Result<()> {
        debug_assert!(count <= self.header.size);
        self.copy_on_write(alloc)?;
        self.header.size = count;
        self.sync_header(alloc);
        Ok(())
    }

    /// 递归释放所有子节点（has_refs 时），然后把节点清空，保留容量
    pub fn clear(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        self.copy_on_write(alloc)?;
        if self.header.has_refs {
            self.destroy_children(alloc);
        }
        self.header.size = 0;
        self.set_width(0);
        self.sync_header(alloc);
        Ok(())
    }

    /// 把所有元素置 0：位宽直接降为 0
    pub fn set_all_to_zero(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        self.copy_on_write(alloc)?;
        self.set_width(0);
        self.sync_header(alloc);
        Ok(())
    }

    pub fn set_type(&mut self, alloc: &mut dyn Allocator, kind: NodeKind) -> Result<()> {
        self.copy_on_write(alloc)?;
        let (is_leaf, has_refs) = kind.flags();
        self.header.is_leaf  = is_leaf;
        self.header.has_refs = has_refs;
        self.sync_header(alloc);
        Ok(())
    }

    pub fn set_is_index_node(&mut self, alloc: &mut dyn Allocator, flag: bool) -> Result<()> {
        self.copy_on_write(alloc)?;
        self.header.is_index_node = flag;
        self.sync_header(alloc);
        Ok(())
    }

    pub fn adjust(&mut self, alloc: &mut dyn Allocator, ndx: usize, diff: i64) -> Result<()> {
        let v = self.get(alloc, ndx);
        self.set(alloc, ndx, v.wrapping_add(diff))
    }

    pub fn adjust_range(&mut self, alloc: &mut dyn Allocator, begin: usize, end: usize, diff: i64) -> Result<()> {
        for i in begin..end {
            self.adjust(alloc, i, diff)?;
        }
        Ok(())
    }

    /// 所有 >= limit 的元素加上 diff
    pub fn adjust_ge(&mut self, alloc: &mut dyn Allocator, limit: i64, diff: i64) -> Result<()> {
        for i in 0..self.header.size {
            let v = self.get(alloc, i);
            if v >= limit {
                self.set(alloc, i, v.wrapping_add(diff))?;
            }
        }
        Ok(())
    }

    // ── 销毁 ──────────────────────────────────────────────────────────────────

    fn destroy_children(&self, alloc: &mut dyn Allocator) {
        let children: Vec<Ref> = {
            let mem = self.mem(alloc);
            (0..mem.size()).map(|i| mem.get(i)).filter(|&v| is_ref(v)).map(|v| v as Ref).collect()
        };
        for child in children {
            Self::destroy_ref(alloc, child);
        }
    }

    /// 递归释放节点及（has_refs 时）其全部子节点，并解除挂载
    pub fn destroy(&mut self, alloc: &mut dyn Allocator) {
        if !self.is_attached() {
            return;
        }
        Self::destroy_ref(alloc, self.ref_);
        self.detach();
    }

    pub fn destroy_ref(alloc: &mut dyn Allocator, r: Ref) {
        let children: Vec<Ref> = {
            let mem = MemRef::new(alloc, r);
            if mem.has_refs() {
                (0..mem.size()).map(|i| mem.get(i)).filter(|&v| is_ref(v)).map(|v| v as Ref).collect()
            } else {
                Vec::new()
            }
        };
        for child in children {
            Self::destroy_ref(alloc, child);
        }
        alloc.free(r);
    }

    // ── 有序数组查找 ──────────────────────────────────────────────────────────

    /// 第一个 >= value 的下标（元素须升序）
    pub fn lower_bound_int(&self, alloc: &dyn Allocator, value: i64) -> usize {
        let mem = self.mem(alloc);
        partition_point(mem.size(), |i| mem.get(i) < value)
    }

    /// 第一个 > value 的下标（元素须升序）
    pub fn upper_bound_int(&self, alloc: &dyn Allocator, value: i64) -> usize {
        let mem = self.mem(alloc);
        partition_point(mem.size(), |i| mem.get(i) <= value)
    }

    /// 从 start 起第一个 >= target 的下标，没有则返回 NPOS（元素须升序）
    pub fn find_gte(&self, alloc: &dyn Allocator, target: i64, start: usize) -> usize {
        let mem  = self.mem(alloc);
        let size = mem.size();
        if start >= size {
            return NPOS;
        }
        let pos = start + partition_point(size - start, |i| mem.get(start + i) < target);
        if pos < size { pos } else { NPOS }
    }

    // ── 聚合 ──────────────────────────────────────────────────────────────────

    pub fn sum(&self, alloc: &dyn Allocator, start: usize, end: usize) -> i64 {
        let end = if end == NPOS { self.header.size } else { end };
        if self.header.width == 0 {
            return 0;
        }
        let mem = self.mem(alloc);
        (start..end).fold(0i64, |acc, i| acc.wrapping_add(mem.get(i)))
    }

    pub fn maximum(&self, alloc: &dyn Allocator, start: usize, end: usize) -> Option<i64> {
        let end = if end == NPOS { self.header.size } else { end };
        let mem = self.mem(alloc);
        (start..end).map(|i| mem.get(i)).max()
    }

    pub fn minimum(&self, alloc: &dyn Allocator, start: usize, end: usize) -> Option<i64> {
        let end = if end == NPOS { self.header.size } else { end };
        let mem = self.mem(alloc);
        (start..end).map(|i| mem.get(i)).min()
    }

    /// [from, to) 的 (min, max)；区间为空或 max - min 超过 maxdiff 时返回 None
    pub fn minmax(&self, alloc: &dyn Allocator, from: usize, to: usize, maxdiff: u64) -> Option<(i64, i64)> {
        if from >= to {
            return None;
        }
        let mem = self.mem(alloc);
        let mut max = mem.get(from);
        let mut min = max;
        for i in from + 1..to {
            let v = mem.get(i);
            if v < min {
                min = v;
            } else if v > max {
                max = v;
            } else {
                continue;
            }
            if max.wrapping_sub(min) as u64 > maxdiff {
                return None;
            }
        }
        Some((min, max))
    }

    /// 两个节点逐元素相等（位宽可以不同）
    pub fn compare_int(&self, alloc: &dyn Allocator, other: &Array<'_>) -> bool {
        let (a, b) = (self.mem(alloc), other.mem(alloc));
        a.size() == b.size() && (0..a.size()).all(|i| a.get(i) == b.get(i))
    }

    // ── 克隆 ──────────────────────────────────────────────────────────────────

    /// 在同一分配器内深拷贝，返回新节点 ref
    pub fn clone_deep(&self, alloc: &mut dyn Allocator) -> Result<Ref> {
        clone_node(None, alloc, self.ref_)
    }

    /// 深拷贝到另一个分配器
    pub fn clone_into(&self, src: &dyn Allocator, dst: &mut dyn Allocator) -> Result<Ref> {
        clone_node(Some(src), dst, self.ref_)
    }

    // ── 序列化 ────────────────────────────────────────────────────────────────

    /// 写出节点（recurse 时先写子节点），返回节点在输出中的偏移。
    /// persist 时跳过分配器报告为只读的子树，直接沿用其原 ref。
    pub fn write(&self, alloc: &dyn Allocator, out: &mut dyn ArrayWriter, recurse: bool, persist: bool) -> Result<usize> {
        debug_assert!(self.is_attached(), "unattached accessor");
        write_node(alloc, self.ref_, out, recurse, persist)
    }

    /// 递归统计本节点及子树的内存占用
    pub fn stats(&self, alloc: &dyn Allocator) -> MemStats {
        node_stats(alloc, self.ref_)
    }
}

impl ArrayParent for Array<'_> {
    fn update_child_ref(&mut self, alloc: &mut dyn Allocator, child_ndx: usize, new_ref: Ref) -> Result<()> {
        self.set(alloc, child_ndx, new_ref as i64)
    }

    fn get_child_ref(&self, alloc: &dyn Allocator, child_ndx: usize) -> Ref {
        self.get_as_ref(alloc, child_ndx)
    }
}

// ── 内部工具 ──────────────────────────────────────────────────────────────────

pub(crate) fn partition_point(len: usize, mut pred: impl FnMut(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0usize, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) { lo = mid + 1; } else { hi = mid; }
    }
    lo
}

fn move_raw(data: &mut [u8], width: usize, begin: usize, end: usize, dest: usize) {
    if width >= 8 {
        let b = width / 8;
        data.copy_within(begin * b..end * b, dest * b);
    } else {
        for i in begin..end {
            let v = packed::get(width, data, i);
            packed::set(width, data, dest + (i - begin), v);
        }
    }
}

fn move_backward_raw(data: &mut [u8], width: usize, begin: usize, end: usize, dest_end: usize) {
    if width >= 8 {
        let b = width / 8;
        data.copy_within(begin * b..end * b, (dest_end - (end - begin)) * b);
    } else {
        for i in (begin..end).rev() {
            let v = packed::get(width, data, i);
            packed::set(width, data, dest_end - (end - i), v);
        }
    }
}

/// 按模板头的标志位，以刚好容纳 values 的最小位宽构造独立节点字节
pub(crate) fn build_node_bytes(template: &NodeHeader, values: &[i64]) -> Vec<u8> {
    let width = values.iter().map(|&v| packed::bit_width(v)).max().unwrap_or(0);
    let mut h = NodeHeader {
        width_type: WidthType::Bits,
        width,
        size: values.len(),
        ..*template
    };
    h.capacity = h.byte_size();
    let mut bytes = vec![0u8; h.capacity];
    header::write(&mut bytes, &h);
    for (i, &v) in values.iter().enumerate() {
        packed::set(width, &mut bytes[HEADER_SIZE..], i, v);
    }
    bytes
}

fn clone_node(src: Option<&dyn Allocator>, dst: &mut dyn Allocator, r: Ref) -> Result<Ref> {
    let (h, mut bytes) = {
        let mem = match src {
            Some(s) => MemRef::new(s, r),
            None    => MemRef::new(dst, r),
        };
        (*mem.header(), mem.bytes().to_vec())
    };

    if h.has_refs {
        let mut values: Vec<i64> = (0..h.size).map(|i| packed::get(h.width, &bytes[HEADER_SIZE..], i)).collect();
        let mut cloned = Vec::new();
        for v in values.iter_mut().filter(|v| is_ref(**v)) {
            match clone_node(src, dst, *v as Ref) {
                Ok(child) => {
                    cloned.push(child);
                    *v = child as i64;
                }
                Err(e) => {
                    for child in cloned {
                        Array::destroy_ref(dst, child);
                    }
                    return Err(e);
                }
            }
        }
        bytes = build_node_bytes(&h, &values);
    } else {
        let mut h2 = h;
        h2.capacity = bytes.len();
        header::write(&mut bytes, &h2);
    }

    let new_ref = dst.alloc(bytes.len())?;
    dst.translate_mut(new_ref)[..bytes.len()].copy_from_slice(&bytes);
    Ok(new_ref)
}

fn write_node(alloc: &dyn Allocator, r: Ref, out: &mut dyn ArrayWriter, recurse: bool, persist: bool) -> Result<usize> {
    if persist && alloc.is_read_only(r) {
        return Ok(r);
    }
    let mem = MemRef::new(alloc, r);
    if recurse && mem.has_refs() {
        let mut values = Vec::with_capacity(mem.size());
        for i in 0..mem.size() {
            let v = mem.get(i);
            values.push(if is_ref(v) { write_node(alloc, v as Ref, out, recurse, persist)? as i64 } else { v });
        }
        return out.write_array(&build_node_bytes(mem.header(), &values));
    }
    let mut bytes = mem.bytes().to_vec();
    let mut h     = *mem.header();
    h.capacity    = bytes.len();
    header::write(&mut bytes, &h);
    out.write_array(&bytes)
}

fn node_stats(alloc: &dyn Allocator, r: Ref) -> MemStats {
    let mem = MemRef::new(alloc, r);
    let mut stats = MemStats {
        allocated:   mem.header().capacity,
        used:        mem.header().byte_size(),
        array_count: 1,
    };
    if mem.has_refs() {
        for i in 0..mem.size() {
            let v = mem.get(i);
            if is_ref(v) {
                stats.add(&node_stats(alloc, v as Ref));
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SlabAlloc;
    use crate::writer::MemoryOutputStream;

    fn filled(alloc: &mut SlabAlloc, values: &[i64]) -> Array<'static> {
        let mut a = Array::create(alloc, NodeKind::Normal).unwrap();
        for &v in values {
            a.add(alloc, v).unwrap();
        }
        a
    }

    #[test]
    fn width_grows_and_values_survive() {
        let mut alloc = SlabAlloc::new();
        let mut a = Array::create(&mut alloc, NodeKind::Normal).unwrap();
        let values = [0i64, 1, 3, 15, 100, -5, 40_000, -3_000_000_000, i64::MAX];
        let expected_widths = [0usize, 1, 2, 4, 8, 8, 32, 64, 64];
        for (i, (&v, &w)) in values.iter().zip(expected_widths.iter()).enumerate() {
            a.add(&mut alloc, v).unwrap();
            assert_eq!(a.width(), w, "after adding {v}");
            for j in 0..=i {
                assert_eq!(a.get(&alloc, j), values[j]);
            }
        }
    }

    #[test]
    fn insert_in_the_middle_with_upgrade() {
        let mut alloc = SlabAlloc::new();
        let mut a = filled(&mut alloc, &[1, 2, 3, 1, 2, 3, 1, 2, 3]);
        assert_eq!(a.width(), 2);
        a.insert(&mut alloc, 4, 1000).unwrap();
        assert_eq!(a.width(), 16);
        assert_eq!(a.to_vec(&alloc), vec![1, 2, 3, 1, 1000, 2, 3, 1, 2, 3]);
        a.insert(&mut alloc, 0, 7).unwrap();
        assert_eq!(a.to_vec(&alloc), vec![7, 1, 2, 3, 1, 1000, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn erase_shifts_and_keeps_width() {
        let mut alloc = SlabAlloc::new();
        let mut a = filled(&mut alloc, &[5, 6, 300, 7, 8]);
        a.erase(&mut alloc, 2).unwrap();
        assert_eq!(a.to_vec(&alloc), vec![5, 6, 7, 8]);
        assert_eq!(a.width(), 16);
        a.erase_range(&mut alloc, 0, 2).unwrap();
        assert_eq!(a.to_vec(&alloc), vec![7, 8]);
    }

    #[test]
    fn growth_relocates_and_keeps_capacity_aligned() {
        let mut alloc = SlabAlloc::new();
        let mut a = Array::create(&mut alloc, NodeKind::Normal).unwrap();
        for i in 0..500 {
            a.add(&mut alloc, i * 1000).unwrap();
        }
        assert_eq!(a.capacity() % 8, 0);
        assert!(a.byte_size() <= a.capacity());
        assert_eq!(alloc.live_blocks(), 1);
        assert_eq!(a.get(&alloc, 499), 499_000);
    }

    #[test]
    fn sorted_bounds_scenario() {
        let mut alloc = SlabAlloc::new();
        let a = filled(&mut alloc, &[3, 3, 3, 4, 4, 4, 5, 6, 7, 9, 9, 9]);
        assert_eq!(a.width(), 4);
        assert_eq!(a.lower_bound_int(&alloc, 4), 3);
        assert_eq!(a.upper_bound_int(&alloc, 4), 6);
        assert_eq!(a.lower_bound_int(&alloc, 1), 0);
        assert_eq!(a.lower_bound_int(&alloc, 15), 12);
        assert_eq!(a.find_gte(&alloc, 8, 4), 9);
        assert_eq!(a.find_gte(&alloc, 10, 0), NPOS);
    }

    #[test]
    fn aggregates() {
        let mut alloc = SlabAlloc::new();
        let a = filled(&mut alloc, &[4, -2, 9, 0, 7]);
        assert_eq!(a.sum(&alloc, 0, NPOS), 18);
        assert_eq!(a.maximum(&alloc, 0, 5), Some(9));
        assert_eq!(a.minimum(&alloc, 1, 4), Some(-2));
        assert_eq!(a.minimum(&alloc, 2, 2), None);
        assert_eq!(a.minmax(&alloc, 0, 5, 20), Some((-2, 9)));
        assert_eq!(a.minmax(&alloc, 0, 5, 10), None);
    }

    #[test]
    fn adjust_variants() {
        let mut alloc = SlabAlloc::new();
        let mut a = filled(&mut alloc, &[1, 5, 10, 20]);
        a.adjust(&mut alloc, 0, 2).unwrap();
        a.adjust_range(&mut alloc, 1, 3, -1).unwrap();
        a.adjust_ge(&mut alloc, 9, 100).unwrap();
        assert_eq!(a.to_vec(&alloc), vec![3, 4, 109, 120]);
    }

    #[test]
    fn set_all_to_zero_drops_width() {
        let mut alloc = SlabAlloc::new();
        let mut a = filled(&mut alloc, &[1, 2, 3]);
        a.set_all_to_zero(&mut alloc).unwrap();
        assert_eq!(a.width(), 0);
        assert_eq!(a.to_vec(&alloc), vec![0, 0, 0]);
    }

    #[test]
    fn erase_does_not_free_children_but_clear_does() {
        let mut alloc = SlabAlloc::new();
        let mut parent = Array::create(&mut alloc, NodeKind::HasRefs).unwrap();
        for _ in 0..3 {
            let mut child = Array::create(&mut alloc, NodeKind::Normal).unwrap();
            child.add(&mut alloc, 42).unwrap();
            let r = child.release_ownership();
            parent.add(&mut alloc, r as i64).unwrap();
        }
        assert_eq!(alloc.live_blocks(), 4);

        let leaked = parent.get_as_ref(&alloc, 0);
        parent.erase(&mut alloc, 0).unwrap();
        assert_eq!(alloc.live_blocks(), 4);

        parent.clear(&mut alloc).unwrap();
        assert_eq!(alloc.live_blocks(), 2);
        Array::destroy_ref(&mut alloc, leaked);
        parent.destroy(&mut alloc);
        assert_eq!(alloc.live_blocks(), 0);
        assert!(!parent.is_attached());
    }

    #[test]
    fn child_relocation_updates_parent() {
        let mut alloc = SlabAlloc::new();
        let mut parent = Array::create(&mut alloc, NodeKind::HasRefs).unwrap();
        let child = Array::create_with_capacity(&mut alloc, NodeKind::Normal, 16).unwrap();
        parent.add(&mut alloc, child.get_ref() as i64).unwrap();

        let new_ref = {
            let mut child = Array::child_of(&alloc, &mut parent, 0);
            for i in 0..100 {
                child.add(&mut alloc, i).unwrap();
            }
            child.get_ref()
        };
        assert_eq!(parent.get_as_ref(&alloc, 0), new_ref);
        assert_eq!(Array::from_ref(&alloc, new_ref).size(), 100);
    }

    #[test]
    fn copy_on_write_from_image() {
        let mut alloc = SlabAlloc::new();
        let mut parent = Array::create(&mut alloc, NodeKind::HasRefs).unwrap();
        let child = filled(&mut alloc, &[1, 2, 3]);
        parent.add(&mut alloc, child.get_ref() as i64).unwrap();
        parent.add(&mut alloc, 7).unwrap();

        let mut out = MemoryOutputStream::new();
        let top = parent.write(&alloc, &mut out, true, false).unwrap();

        let mut image = SlabAlloc::from_image(out.into_bytes());
        let mut root = Array::from_ref(&image, top);
        let old_child = root.get_as_ref(&image, 0);
        {
            let mut child = Array::child_of(&image, &mut root, 0);
            child.set(&mut image, 1, 20).unwrap();
        }
        assert!(!image.is_read_only(root.get_ref()));
        let new_child = root.get_as_ref(&image, 0);
        assert_ne!(new_child, old_child);
        assert_eq!(Array::from_ref(&image, new_child).to_vec(&image), vec![1, 20, 3]);
        assert_eq!(Array::from_ref(&image, old_child).to_vec(&image), vec![1, 2, 3]);
        assert_eq!(image.stats().read_only_frees, 2);
    }

    #[test]
    fn clone_is_deep() {
        let mut alloc = SlabAlloc::new();
        let mut parent = Array::create(&mut alloc, NodeKind::HasRefs).unwrap();
        let child = filled(&mut alloc, &[9, 8]);
        parent.add(&mut alloc, child.get_ref() as i64).unwrap();
        let copy = parent.clone_deep(&mut alloc).unwrap();
        assert_eq!(alloc.live_blocks(), 4);
        let copy = Array::from_ref(&alloc, copy);
        let copied_child = copy.get_as_ref(&alloc, 0);
        assert_ne!(copied_child, child.get_ref());
        assert_eq!(Array::from_ref(&alloc, copied_child).to_vec(&alloc), vec![9, 8]);

        let mut other = SlabAlloc::new();
        let moved = parent.clone_into(&alloc, &mut other).unwrap();
        assert_eq!(Array::from_ref(&other, moved).stats(&other).array_count, 2);
    }

    #[test]
    fn out_of_memory_leaves_node_intact() {
        let mut alloc = SlabAlloc::new().with_memory_limit(128);
        let mut a = Array::create(&mut alloc, NodeKind::Normal).unwrap();
        for i in 0..15 {
            a.add(&mut alloc, (1 << 40) + i).unwrap();
        }
        let err = a.add(&mut alloc, 7).unwrap_err();
        assert!(matches!(err, ArrayError::OutOfMemory { .. }));
        assert_eq!(a.size(), 15);
        assert_eq!(a.get(&alloc, 14), (1 << 40) + 14);
    }

    #[test]
    fn reserved_insert_needs_no_allocation() {
        let mut alloc = SlabAlloc::new();
        let mut a = filled(&mut alloc, &(0..15).collect::<Vec<_>>());
        a.reserve_insert(&mut alloc, 64).unwrap();
        let r = a.get_ref();

        alloc.set_memory_limit(Some(0));
        a.insert(&mut alloc, 3, i64::MIN).unwrap();
        assert_eq!(a.get_ref(), r);
        assert_eq!(a.width(), 64);
        assert_eq!(a.get(&alloc, 3), i64::MIN);
        assert_eq!(a.get(&alloc, 15), 14);
    }

    #[test]
    fn compare_across_widths() {
        let mut alloc = SlabAlloc::new();
        let a = filled(&mut alloc, &[1, 2, 3]);
        let mut b = filled(&mut alloc, &[1, 2, 3]);
        b.ensure_minimum_width(&mut alloc, 1 << 20).unwrap();
        assert_eq!(b.width(), 32);
        assert!(a.compare_int(&alloc, &b));
        b.set(&mut alloc, 2, 4).unwrap();
        assert!(!a.compare_int(&alloc, &b));
    }
}
