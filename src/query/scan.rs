//! 按位宽特化的扫描内核
//!
//! 一个 64 bit 字装 64/W 个元素（lane）。字级位运算对所有 lane 并行求值，
//! 结果是“每条匹配 lane 的最低位置 1”的掩码，再按位展开成下标。

use super::simd;
use super::state::{Action, QueryState};
use super::Condition;
use crate::packed::{self, get_w, lane_value, read_word};

// ── 位运算工具 ────────────────────────────────────────────────────────────────

/// 每条 lane 最低位为 1 的常量（W = 64 时为 1）
#[inline]
pub const fn lane_ones(width: usize) -> u64 {
    match width {
        0       => 0,
        64..    => 1,
        _       => u64::MAX / ((1u64 << width) - 1),
    }
}

/// 每条 lane 最高位为 1 的常量
#[inline]
pub const fn lane_highs(width: usize) -> u64 {
    if width == 0 { 0 } else { lane_ones(width) << (width - 1) }
}

/// 把 value 复制到字的每条 lane
#[inline]
pub fn splat_word<const W: usize>(value: i64) -> u64 {
    if W == 64 {
        value as u64
    } else {
        (value as u64 & ((1u64 << W) - 1)).wrapping_mul(lane_ones(W))
    }
}

/// 每条全零 lane 的最低位置 1
#[inline]
pub fn zero_lanes<const W: usize>(v: u64) -> u64 {
    if W == 64 {
        return (v == 0) as u64;
    }
    let high = lane_highs(W);
    let lo   = v & !high;
    // lo 每条 lane 加上 2^(W-1)-1：lane 非零时最高位被进位置 1，且不会溢出到相邻 lane
    let t = lo.wrapping_add(!high) | v;
    (!t & high) >> (W - 1)
}

fn lanes_by_test<C: Condition, const W: usize>(chunk: u64, value: i64) -> u64 {
    (0..64 / W.max(1)).fold(0, |m, lane| {
        if C::test(lane_value(chunk, lane, W), value) { m | 1 << (lane * W) } else { m }
    })
}

/// 字级的魔数比较只在所有 lane 都可视为 [0, 2^(W-1)) 内的无符号数、
/// 且 value 落在 [0, 2^(W-1)-1] 时成立，其余情况逐 lane 比较
#[inline]
fn magic_applies<const W: usize>(chunk: u64, value: i64) -> bool {
    let max = (1i64 << (W - 1)) - 1;
    value >= 0 && value <= max && (W < 8 || chunk & lane_highs(W) == 0)
}

pub fn greater_lanes<const W: usize>(chunk: u64, value: i64) -> u64 {
    if W == 64 {
        return ((chunk as i64) > value) as u64;
    }
    if !magic_applies::<W>(chunk, value) {
        return lanes_by_test::<super::Greater, W>(chunk, value);
    }
    let high = lane_highs(W);
    let max  = (1u64 << (W - 1)) - 1;
    let lo   = chunk & !high;
    let sum  = lo.wrapping_add(lane_ones(W).wrapping_mul(max - value as u64));
    ((sum | chunk) & high) >> (W - 1)
}

pub fn less_lanes<const W: usize>(chunk: u64, value: i64) -> u64 {
    if W == 64 {
        return ((chunk as i64) < value) as u64;
    }
    if !magic_applies::<W>(chunk, value) {
        return lanes_by_test::<super::Less, W>(chunk, value);
    }
    let high = lane_highs(W);
    let lo   = chunk & !high;
    let sum  = (lo ^ !high).wrapping_add(lane_ones(W).wrapping_mul(value as u64));
    (sum & !chunk & high) >> (W - 1)
}

// ── 投递 ──────────────────────────────────────────────────────────────────────

/// 逐元素扫描 [start, end)
#[inline]
fn linear<C: Condition, const W: usize>(data: &[u8], value: i64, start: usize, end: usize, base: usize, state: &mut QueryState<'_>) -> bool {
    for i in start..end {
        let v = get_w::<W>(data, i);
        if C::test(v, value) && !state.match_one(base + i, v) {
            return false;
        }
    }
    true
}

/// 一个字的匹配掩码：先整体交给 state，被拒绝再逐条投递
#[inline]
fn deliver_word<const W: usize>(word: u64, mask: u64, first: usize, base: usize, state: &mut QueryState<'_>) -> bool {
    if state.match_pattern(base + first, mask) {
        return true;
    }
    let mut m = mask;
    while m != 0 {
        let lane = m.trailing_zeros() as usize / W.max(1);
        if !state.match_one(base + first + lane, lane_value(word, lane, W)) {
            return false;
        }
        m &= m - 1;
    }
    true
}

/// SIMD 块的结果是每 lane 一位
#[inline]
fn deliver_block<const W: usize>(data: &[u8], bits: u32, first: usize, base: usize, state: &mut QueryState<'_>) -> bool {
    if state.match_pattern(base + first, bits as u64) {
        return true;
    }
    let mut m = bits;
    while m != 0 {
        let lane = m.trailing_zeros() as usize;
        if !state.match_one(base + first + lane, get_w::<W>(data, first + lane)) {
            return false;
        }
        m &= m - 1;
    }
    true
}

/// 整段都满足条件时的闭式处理；只在剩余 limit 足以容纳整段时调用
fn closed_form<const W: usize>(data: &[u8], start: usize, end: usize, base: usize, state: &mut QueryState<'_>) -> bool {
    let n      = end - start;
    let values = (start..end).map(|i| get_w::<W>(data, i));
    match state.action() {
        Action::Count => {
            state.state      += n as i64;
            state.match_count = state.state as usize;
        }
        Action::Sum => {
            state.state        = values.fold(state.state, i64::wrapping_add);
            state.match_count += n;
        }
        Action::Max => {
            state.state        = values.fold(state.state, i64::max);
            state.match_count += n;
        }
        Action::Min => {
            state.state        = values.fold(state.state, i64::min);
            state.match_count += n;
        }
        _ => {
            for (i, v) in (start..end).zip(values) {
                if !state.match_one(base + i, v) {
                    return false;
                }
            }
            return true;
        }
    }
    state.limit > state.match_count
}

// ── 主循环 ────────────────────────────────────────────────────────────────────

pub(crate) fn find_width<C: Condition, const W: usize>(
    data: &[u8],
    value: i64,
    start: usize,
    end: usize,
    base: usize,
    state: &mut QueryState<'_>,
    use_simd: bool,
) -> bool {
    let (lb, ub) = (packed::lbound(W), packed::ubound(W));
    if !C::KIND.can_match(value, lb, ub) {
        return true;
    }
    if C::KIND.will_match(value, lb, ub) && end - start <= state.limit.saturating_sub(state.match_count) {
        return closed_form::<W>(data, start, end, base, state);
    }
    if W == 0 || value < lb || value > ub {
        return linear::<C, W>(data, value, start, end, base, state);
    }

    let per_word = 64 / W.max(1);
    let head_end = end.min(start.div_ceil(per_word) * per_word);
    if !linear::<C, W>(data, value, start, head_end, base, state) {
        return false;
    }
    let mut i = head_end;

    if use_simd && W >= 8 {
        let per_block = 128 / W;
        if i % per_block != 0 && i + per_word <= end {
            let word = read_word(data, i / per_word);
            let mask = C::word_matches::<W>(word, value);
            if mask != 0 && !deliver_word::<W>(word, mask, i, base, state) {
                return false;
            }
            i += per_word;
        }
        let needle = simd::splat(W, value);
        while i + per_block <= end {
            let offset = i * W / 8;
            let bits   = simd::block_bits(C::KIND, W, &data[offset..offset + 16], &needle);
            if bits != 0 && !deliver_block::<W>(data, bits, i, base, state) {
                return false;
            }
            i += per_block;
        }
    }

    while i + per_word <= end {
        let word = read_word(data, i / per_word);
        let mask = C::word_matches::<W>(word, value);
        if mask != 0 && !deliver_word::<W>(word, mask, i, base, state) {
            return false;
        }
        i += per_word;
    }

    linear::<C, W>(data, value, i, end, base, state)
}
