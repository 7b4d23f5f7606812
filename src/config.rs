//! 节点引擎配置
//!
//! 所有字段都有默认值，可由上层用 serde 从 JSON/TOML 反序列化得到，
//! 也可以用 `with_*` 构建器逐项覆盖。

use serde::{Deserialize, Serialize};

/// 向量化路径开关
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimdMode {
    /// 运行时探测 CPU 能力，可用则启用
    Auto,
    /// 强制只走标量路径
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayConfig {
    /// B+ 树叶子最大元素数，同时也是内部节点最大扇出
    pub max_node_size:    usize,
    /// 新建节点的初始容量（字节，含 8 字节头）
    pub initial_capacity: usize,
    /// SlabAlloc 的字节预算，None 表示不限
    pub memory_limit:     Option<usize>,
    pub simd:             SimdMode,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            max_node_size:    1000,
            initial_capacity: 128,
            memory_limit:     None,
            simd:             SimdMode::Auto,
        }
    }
}

impl ArrayConfig {
    pub fn with_max_node_size(mut self, n: usize) -> Self {
        self.max_node_size = n.max(2);
        self
    }

    pub fn with_initial_capacity(mut self, bytes: usize) -> Self {
        self.initial_capacity = crate::common::round_up_8(bytes.max(crate::common::HEADER_SIZE));
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_simd(mut self, simd: SimdMode) -> Self {
        self.simd = simd;
        self
    }
}
