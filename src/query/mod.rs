//! 查询引擎
//!
//! `find` 在一个节点的 `[start, end)` 区间上按条件搜索，把匹配交给 [`QueryState`]。
//! 每次调用按位宽选择以下路径之一：
//!
//! ```text
//!   can_match == false ──► 直接返回
//!   will_match == true ──► 闭式聚合（Count 直接加区间长度，Sum/Max/Min 整段聚合）
//!   width 0 / 值超界   ──► 逐元素扫描
//!   其余               ──► 头部逐元素 → [SIMD 16 字节块] → 64 bit 字级位运算 → 尾部逐元素
//! ```
//!
//! 位宽、条件在编译期单态化：`scan::find_width::<C, W>`，每个 (C, W) 组合都是独立实现。

pub mod compare;
pub mod scan;
pub mod simd;
pub mod state;

pub use compare::compare_leafs;
pub use state::{Action, Callback, FloatQueryState, QueryState};

use crate::alloc::Allocator;
use crate::array::{Array, MemRef};
use crate::common::NPOS;

// ── 条件 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl Cond {
    /// `element <cond> value`
    #[inline]
    pub fn test(self, element: i64, value: i64) -> bool {
        match self {
            Cond::Equal    => element == value,
            Cond::NotEqual => element != value,
            Cond::Greater  => element > value,
            Cond::Less     => element < value,
        }
    }

    /// 值域 [lb, ub] 内是否可能有元素满足条件
    pub fn can_match(self, value: i64, lb: i64, ub: i64) -> bool {
        match self {
            Cond::Equal    => value >= lb && value <= ub,
            Cond::NotEqual => !(value == 0 && lb == 0 && ub == 0),
            Cond::Greater  => ub > value,
            Cond::Less     => lb < value,
        }
    }

    /// 值域 [lb, ub] 内是否所有元素都满足条件
    pub fn will_match(self, value: i64, lb: i64, ub: i64) -> bool {
        match self {
            Cond::Equal    => value == 0 && lb == 0 && ub == 0,
            Cond::NotEqual => value < lb || value > ub,
            Cond::Greater  => lb > value,
            Cond::Less     => ub < value,
        }
    }
}

/// 编译期条件。`word_matches` 对一个 64 bit 字中的全部 lane 同时求值，
/// 返回每条匹配 lane 最低位置 1 的掩码；调用方保证 value 落在该位宽的值域内。
pub trait Condition {
    const KIND: Cond;

    #[inline]
    fn test(element: i64, value: i64) -> bool { Self::KIND.test(element, value) }

    fn word_matches<const W: usize>(chunk: u64, value: i64) -> u64;
}

pub struct Equal;
pub struct NotEqual;
pub struct Greater;
pub struct Less;

impl Condition for Equal {
    const KIND: Cond = Cond::Equal;

    #[inline]
    fn word_matches<const W: usize>(chunk: u64, value: i64) -> u64 {
        scan::zero_lanes::<W>(chunk ^ scan::splat_word::<W>(value))
    }
}

impl Condition for NotEqual {
    const KIND: Cond = Cond::NotEqual;

    #[inline]
    fn word_matches<const W: usize>(chunk: u64, value: i64) -> u64 {
        scan::zero_lanes::<W>(chunk ^ scan::splat_word::<W>(value)) ^ scan::lane_ones(W)
    }
}

impl Condition for Greater {
    const KIND: Cond = Cond::Greater;

    #[inline]
    fn word_matches<const W: usize>(chunk: u64, value: i64) -> u64 {
        scan::greater_lanes::<W>(chunk, value)
    }
}

impl Condition for Less {
    const KIND: Cond = Cond::Less;

    #[inline]
    fn word_matches<const W: usize>(chunk: u64, value: i64) -> u64 {
        scan::less_lanes::<W>(chunk, value)
    }
}

// ── 分发 ──────────────────────────────────────────────────────────────────────

/// 在节点 `[start, end)` 上搜索（end 为 NPOS 表示到末尾），匹配下标加上 base_index 后交给 state。
/// 返回 false 表示 state 要求停止。
pub fn find(mem: &MemRef<'_>, cond: Cond, value: i64, start: usize, end: usize, base_index: usize, state: &mut QueryState<'_>) -> bool {
    find_with(mem, cond, value, start, end, base_index, state, simd::enabled())
}

/// 与 [`find`] 相同，但显式指定是否走向量路径
#[allow(clippy::too_many_arguments)]
pub fn find_with(mem: &MemRef<'_>, cond: Cond, value: i64, start: usize, end: usize, base_index: usize, state: &mut QueryState<'_>, use_simd: bool) -> bool {
    let end = if end == NPOS { mem.size() } else { end };
    debug_assert!(start <= end && end <= mem.size(), "range {start}..{end} out of {}", mem.size());
    let data = mem.payload();
    match cond {
        Cond::Equal    => find_cond::<Equal>(mem.width(), data, value, start, end, base_index, state, use_simd),
        Cond::NotEqual => find_cond::<NotEqual>(mem.width(), data, value, start, end, base_index, state, use_simd),
        Cond::Greater  => find_cond::<Greater>(mem.width(), data, value, start, end, base_index, state, use_simd),
        Cond::Less     => find_cond::<Less>(mem.width(), data, value, start, end, base_index, state, use_simd),
    }
}

#[allow(clippy::too_many_arguments)]
fn find_cond<C: Condition>(width: usize, data: &[u8], value: i64, start: usize, end: usize, base: usize, state: &mut QueryState<'_>, use_simd: bool) -> bool {
    use scan::find_width;
    match width {
        0  => find_width::<C, 0>(data, value, start, end, base, state, use_simd),
        1  => find_width::<C, 1>(data, value, start, end, base, state, use_simd),
        2  => find_width::<C, 2>(data, value, start, end, base, state, use_simd),
        4  => find_width::<C, 4>(data, value, start, end, base, state, use_simd),
        8  => find_width::<C, 8>(data, value, start, end, base, state, use_simd),
        16 => find_width::<C, 16>(data, value, start, end, base, state, use_simd),
        32 => find_width::<C, 32>(data, value, start, end, base, state, use_simd),
        64 => find_width::<C, 64>(data, value, start, end, base, state, use_simd),
        _  => unreachable!("illegal width {width}"),
    }
}

// ── Array 上的便捷入口 ─────────────────────────────────────────────────────────

impl Array<'_> {
    #[allow(clippy::too_many_arguments)]
    pub fn find(&self, alloc: &dyn Allocator, cond: Cond, value: i64, start: usize, end: usize, base_index: usize, state: &mut QueryState<'_>) -> bool {
        find(&self.mem(alloc), cond, value, start, end, base_index, state)
    }

    /// 首个满足条件的下标，没有时返回 NPOS
    pub fn find_first(&self, alloc: &dyn Allocator, cond: Cond, value: i64, start: usize, end: usize) -> usize {
        let mut state = QueryState::new(Action::ReturnFirst, NPOS);
        self.find(alloc, cond, value, start, end, 0, &mut state);
        state.first_index()
    }

    /// 等于 value 的全部下标（加上 base_index）追加到 out
    pub fn find_all(&self, alloc: &dyn Allocator, value: i64, start: usize, end: usize, base_index: usize, out: &mut Vec<usize>) {
        let mut state = QueryState::find_all(out, NPOS);
        self.find(alloc, Cond::Equal, value, start, end, base_index, &mut state);
    }

    pub fn count(&self, alloc: &dyn Allocator, value: i64) -> usize {
        let mut state = QueryState::new(Action::Count, NPOS);
        self.find(alloc, Cond::Equal, value, 0, NPOS, 0, &mut state);
        state.state as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SlabAlloc;
    use crate::array::NodeKind;

    fn node(alloc: &mut SlabAlloc, values: &[i64]) -> Array<'static> {
        let mut a = Array::create(alloc, NodeKind::Normal).unwrap();
        for &v in values {
            a.add(alloc, v).unwrap();
        }
        a
    }

    #[test]
    fn bounds_predicates() {
        assert!(!Cond::Equal.can_match(5, 0, 3));
        assert!(Cond::Equal.will_match(0, 0, 0));
        assert!(!Cond::NotEqual.can_match(0, 0, 0));
        assert!(Cond::NotEqual.will_match(-1, 0, 15));
        assert!(!Cond::Greater.can_match(15, 0, 15));
        assert!(Cond::Greater.will_match(-1, 0, 15));
        assert!(!Cond::Less.can_match(0, 0, 15));
        assert!(Cond::Less.will_match(16, 0, 15));
    }

    #[test]
    fn find_first_and_all() {
        let mut alloc = SlabAlloc::new();
        let values: Vec<i64> = (0..300).map(|i| i % 7).collect();
        let a = node(&mut alloc, &values);
        assert_eq!(a.width(), 4);
        assert_eq!(a.find_first(&alloc, Cond::Equal, 6, 0, NPOS), 6);
        assert_eq!(a.find_first(&alloc, Cond::Equal, 6, 7, NPOS), 13);
        assert_eq!(a.find_first(&alloc, Cond::Greater, 6, 0, NPOS), NPOS);
        assert_eq!(a.find_first(&alloc, Cond::Less, 1, 1, NPOS), 7);

        let mut out = Vec::new();
        a.find_all(&alloc, 3, 0, 30, 100, &mut out);
        assert_eq!(out, vec![103, 110, 117, 124]);
        assert_eq!(a.count(&alloc, 0), 43);
    }

    #[test]
    fn width_zero_is_branch_correct() {
        let mut alloc = SlabAlloc::new();
        let a = node(&mut alloc, &[0; 100]);
        assert_eq!(a.width(), 0);
        assert_eq!(a.count(&alloc, 0), 100);
        assert_eq!(a.count(&alloc, 1), 0);
        assert_eq!(a.find_first(&alloc, Cond::NotEqual, 0, 0, NPOS), NPOS);
        assert_eq!(a.find_first(&alloc, Cond::NotEqual, 3, 10, NPOS), 10);
        assert_eq!(a.find_first(&alloc, Cond::Less, 1, 0, NPOS), 0);

        let mut max = QueryState::new(Action::Max, NPOS);
        assert!(a.find(&alloc, Cond::Equal, 0, 0, 0, 0, &mut max));
        assert_eq!(max.state, i64::MIN);
    }

    #[test]
    fn closed_form_respects_limit() {
        let mut alloc = SlabAlloc::new();
        let a = node(&mut alloc, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut sum = QueryState::new(Action::Sum, 3);
        assert!(!a.find(&alloc, Cond::Greater, -1, 0, NPOS, 0, &mut sum));
        assert_eq!(sum.state, 6);
        assert_eq!(sum.match_count, 3);

        let mut sum = QueryState::new(Action::Sum, NPOS);
        assert!(a.find(&alloc, Cond::Greater, -1, 0, NPOS, 0, &mut sum));
        assert_eq!(sum.state, 36);
        assert_eq!(sum.match_count, 8);
    }

    #[test]
    fn callback_stops_scan() {
        let mut alloc = SlabAlloc::new();
        let a = node(&mut alloc, &[5, 1, 5, 2, 5, 3]);
        let mut seen = Vec::new();
        let mut f = |i: usize| {
            seen.push(i);
            seen.len() < 2
        };
        let mut st = QueryState::with_callback(Callback::Index(&mut f), NPOS);
        assert!(!a.find(&alloc, Cond::Equal, 5, 0, NPOS, 0, &mut st));
        drop(st);
        assert_eq!(seen, vec![0, 2]);
    }
}
