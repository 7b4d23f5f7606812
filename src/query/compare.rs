//! 两个节点之间逐行比较

use super::simd;
use super::state::QueryState;
use super::Cond;
use crate::array::MemRef;

/// 对 `[start, end)` 中每个 i，若 `a[i] <cond> b[i]` 则投递 `(base + i, a[i])`。
/// 两侧位宽相同且为 8/16/32 时走向量路径，否则逐元素解码比较。
pub fn compare_leafs(a: &MemRef<'_>, b: &MemRef<'_>, cond: Cond, start: usize, end: usize, base: usize, state: &mut QueryState<'_>) -> bool {
    compare_leafs_with(a, b, cond, start, end, base, state, simd::enabled())
}

#[allow(clippy::too_many_arguments)]
pub fn compare_leafs_with(
    a: &MemRef<'_>,
    b: &MemRef<'_>,
    cond: Cond,
    start: usize,
    end: usize,
    base: usize,
    state: &mut QueryState<'_>,
    use_simd: bool,
) -> bool {
    debug_assert!(start <= end && end <= a.size() && end <= b.size());
    let width = a.width();
    let mut i = start;

    if use_simd && width == b.width() && matches!(width, 8 | 16 | 32) {
        let per_block  = 128 / width;
        let lane_bytes = width / 8;
        let (pa, pb)   = (a.payload(), b.payload());
        while i + per_block <= end {
            let offset = i * lane_bytes;
            let bits   = simd::block_bits(cond, width, &pa[offset..offset + 16], &pb[offset..offset + 16]);
            if bits != 0 && !state.match_pattern(base + i, bits as u64) {
                let mut m = bits;
                while m != 0 {
                    let lane = m.trailing_zeros() as usize;
                    if !state.match_one(base + i + lane, a.get(i + lane)) {
                        return false;
                    }
                    m &= m - 1;
                }
            }
            i += per_block;
        }
    }

    for j in i..end {
        let v = a.get(j);
        if cond.test(v, b.get(j)) && !state.match_one(base + j, v) {
            return false;
        }
    }
    true
}
