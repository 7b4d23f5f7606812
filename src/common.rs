//! 全局基础类型与错误定义

use thiserror::Error;

// ── 类型别名 ──────────────────────────────────────────────────────────────────

/// 节点引用：分配器内的稳定偏移（恒为偶数，0 表示空引用）
pub type Ref = usize;

/// "未找到" 哨兵值，等于最大可表示下标
pub const NPOS: usize = usize::MAX;

/// 节点头长度（字节）
pub const HEADER_SIZE: usize = 8;

/// 元素个数与容量的上限（24 bit）
pub const MAX_NODE_BYTES: usize = (1 << 24) - 1;

/// 把字节数向上取整到 8 的倍数
pub fn round_up_8(n: usize) -> usize { (n + 7) & !7 }

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArrayError {
    #[error("out of memory: requested {requested} bytes (limit {limit})")]
    OutOfMemory { requested: usize, limit: usize },
    #[error("node capacity overflow: {0} bytes")]
    CapacityOverflow(usize),
    #[error("node size overflow: {0} elements")]
    SizeOverflow(usize),
    #[error("serialization error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, ArrayError>;
