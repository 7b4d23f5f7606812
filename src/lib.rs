//! # olap-array-node
//!
//! 列式存储引擎的节点层：自适应位宽的打包整数数组，同时作为列数据的叶子
//! 和大列 B+ 树的结构节点，并附带按位宽特化、可向量化的查询引擎。
//!
//! ## 整体架构
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        BpTree                            │
//! │   insert / append / erase / update / find_*              │
//! │   ┌──────────────────────┐   ┌──────────────────────┐   │
//! │   │  内部节点 (InnerNode) │   │  EraseHandler /      │   │
//! │   │  [offsets|compact,    │   │  UpdateHandler       │   │
//! │   │   child refs...,      │   └──────────────────────┘   │
//! │   │   1 + 2 * total]      │                              │
//! │   └──────────┬───────────┘                              │
//! │              │                                           │
//! │   Array 访问器 (copy-on-write, 位宽升级, ArrayParent)     │
//! │   ┌──────────┴─────────────────────────────────────┐     │
//! │   │  header  (8 字节头：容量/标志/位宽/元素数)       │     │
//! │   │  packed  (0/1/2/4/8/16/32/64 bit 打包负载)       │     │
//! │   └────────────────────────────────────────────────┘     │
//! │              │                                           │
//! │   query: Cond × 位宽 单态化扫描                           │
//! │   ┌────────────────────────────────────────────────┐     │
//! │   │  scan     (字级位运算)                          │     │
//! │   │  simd     (SSE4.2 16 字节块，运行时检测)         │     │
//! │   │  compare  (两节点逐行比较)                       │     │
//! │   │  state    (ReturnFirst/Sum/Max/Min/Count/...)   │     │
//! │   └────────────────────────────────────────────────┘     │
//! │                                                          │
//! │   Allocator (ref ↔ 内存，只读镜像 / 可写块)  ArrayWriter  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod common;
pub mod config;

// ── 节点编码 ──────────────────────────────────────────────────────────────────
pub mod header;
pub mod packed;

// ── 节点访问与树操作 ──────────────────────────────────────────────────────────
pub mod alloc;
pub mod array;
pub mod bptree;
pub mod writer;

// ── 查询 ──────────────────────────────────────────────────────────────────────
pub mod query;

pub use alloc::{Allocator, SlabAlloc};
pub use array::{Array, ArrayParent, MemRef, NodeKind, Ownership};
pub use bptree::{BpTree, EraseHandler, IntEraseHandler, RootReplacement, UpdateHandler};
pub use common::{ArrayError, Ref, Result, NPOS};
pub use config::{ArrayConfig, SimdMode};
pub use query::{Action, Cond, QueryState};
pub use writer::{ArrayWriter, MemoryOutputStream};
