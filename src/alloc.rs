//! 分配器协作接口与内存 slab 实现
//!
//! 节点之间只通过 [`Ref`] 互相引用，真正的内存地址只能经由分配器 `translate` 得到。
//! 分配器同时区分两类内存：
//! - **只读**：已持久化、本事务未修改过的镜像区，修改前必须 copy-on-write
//! - **可写**：本事务内新分配的块
//!
//! `SlabAlloc` 用一段只读镜像（`[0, baseline)`）加上一组按需分配的可写块实现该接口。

use std::collections::HashMap;

use tracing::warn;

use crate::common::{round_up_8, ArrayError, Ref, Result, HEADER_SIZE};
use crate::config::ArrayConfig;

// ── Allocator ─────────────────────────────────────────────────────────────────

pub trait Allocator {
    /// 分配 size 字节（向上取整到 8）的可写块，内容清零
    fn alloc(&mut self, size: usize) -> Result<Ref>;

    /// 释放块；对只读块调用表示该镜像块在下次提交后可回收
    fn free(&mut self, r: Ref);

    /// 从 r 开始的内存（至少覆盖整个节点）
    fn translate(&self, r: Ref) -> &[u8];

    fn translate_mut(&mut self, r: Ref) -> &mut [u8];

    fn is_read_only(&self, r: Ref) -> bool;
}

// ── SlabAlloc ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    pub allocs:          usize,
    pub frees:           usize,
    /// 对只读镜像块的 free 次数
    pub read_only_frees: usize,
}

#[derive(Debug)]
pub struct SlabAlloc {
    image:     Vec<u8>,
    baseline:  usize,
    next_ref:  Ref,
    blocks:    HashMap<Ref, Vec<u8>>,
    allocated: usize,
    limit:     Option<usize>,
    stats:     AllocStats,
}

impl Default for SlabAlloc {
    fn default() -> Self { Self::new() }
}

impl SlabAlloc {
    /// 空分配器；ref 0 保留为空引用，第一个块从 8 开始
    pub fn new() -> Self {
        Self {
            image:     Vec::new(),
            baseline:  HEADER_SIZE,
            next_ref:  HEADER_SIZE,
            blocks:    HashMap::new(),
            allocated: 0,
            limit:     None,
            stats:     AllocStats::default(),
        }
    }

    pub fn with_config(config: &ArrayConfig) -> Self {
        let mut a = Self::new();
        a.limit = config.memory_limit;
        a
    }

    /// 挂载一份已写出的镜像：镜像内的 ref 即字节偏移，全部视为只读
    pub fn from_image(image: Vec<u8>) -> Self {
        let baseline = round_up_8(image.len().max(HEADER_SIZE));
        Self {
            image,
            baseline,
            next_ref: baseline,
            ..Self::new()
        }
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.limit = Some(bytes);
        self
    }

    pub fn set_memory_limit(&mut self, limit: Option<usize>) { self.limit = limit; }

    /// 当前存活的可写块数量
    pub fn live_blocks(&self)     -> usize      { self.blocks.len() }
    pub fn allocated_bytes(&self) -> usize      { self.allocated }
    pub fn stats(&self)           -> AllocStats { self.stats }
    pub fn baseline(&self)        -> usize      { self.baseline }
}

impl Allocator for SlabAlloc {
    fn alloc(&mut self, size: usize) -> Result<Ref> {
        let size = round_up_8(size.max(HEADER_SIZE));
        if let Some(limit) = self.limit {
            if self.allocated + size > limit {
                warn!(requested = size, allocated = self.allocated, limit, "allocation refused");
                return Err(ArrayError::OutOfMemory { requested: size, limit });
            }
        }
        let r = self.next_ref;
        self.next_ref += size;
        self.blocks.insert(r, vec![0u8; size]);
        self.allocated += size;
        self.stats.allocs += 1;
        Ok(r)
    }

    fn free(&mut self, r: Ref) {
        if r < self.baseline {
            self.stats.read_only_frees += 1;
            return;
        }
        match self.blocks.remove(&r) {
            Some(block) => {
                self.allocated -= block.len();
                self.stats.frees += 1;
            }
            None => debug_assert!(false, "double free of ref {r}"),
        }
    }

    fn translate(&self, r: Ref) -> &[u8] {
        if r < self.baseline {
            return &self.image[r..];
        }
        match self.blocks.get(&r) {
            Some(block) => block.as_slice(),
            None => dangling(r),
        }
    }

    fn translate_mut(&mut self, r: Ref) -> &mut [u8] {
        debug_assert!(r >= self.baseline, "write to read-only ref {r}");
        match self.blocks.get_mut(&r) {
            Some(block) => block.as_mut_slice(),
            None => dangling(r),
        }
    }

    fn is_read_only(&self, r: Ref) -> bool { r < self.baseline }
}

/// 访问已释放或从未分配的 ref 属于调用方的逻辑错误
#[cold]
#[track_caller]
fn dangling(r: Ref) -> ! {
    panic!("ref {r} is not a live block")
}
