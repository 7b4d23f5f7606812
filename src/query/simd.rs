//! 向量化比较
//!
//! x86_64 上运行时检测 SSE4.2（结果缓存），一次比较 16 字节里的全部 lane；
//! 其它平台或被配置关闭时退回逐 lane 的标量实现。两条路径结果必须完全一致。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tracing::debug;

use super::Cond;
use crate::config::{ArrayConfig, SimdMode};
use crate::packed;

static DETECTED: OnceLock<bool> = OnceLock::new();
static ENABLED: AtomicBool = AtomicBool::new(true);

/// CPU 是否支持向量路径
pub fn is_available() -> bool {
    *DETECTED.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        let found = is_x86_feature_detected!("sse4.2");
        #[cfg(not(target_arch = "x86_64"))]
        let found = false;
        debug!(sse42 = found, "simd capability detected");
        found
    })
}

pub fn set_enabled(on: bool) { ENABLED.store(on, Ordering::Relaxed); }

pub fn enabled() -> bool { ENABLED.load(Ordering::Relaxed) && is_available() }

pub fn apply_config(config: &ArrayConfig) {
    set_enabled(config.simd == SimdMode::Auto);
}

/// 16 字节中每条 lane 都是 value
pub fn splat(width: usize, value: i64) -> [u8; 16] {
    let mut out = [0u8; 16];
    for lane in 0..128 / width {
        packed::set(width, &mut out, lane, value);
    }
    out
}

/// a、b 各 16 字节，按 width（8/16/32/64）逐 lane 求 `a[i] <cond> b[i]`，返回每 lane 一位的位图
pub fn block_bits(cond: Cond, width: usize, a: &[u8], b: &[u8]) -> u32 {
    debug_assert!(matches!(width, 8 | 16 | 32 | 64));
    debug_assert!(a.len() >= 16 && b.len() >= 16);
    #[cfg(target_arch = "x86_64")]
    {
        if is_available() {
            // SAFETY: 已检测到 sse4.2，且两个切片都至少 16 字节
            return unsafe { sse::block_bits(cond, width, a, b) };
        }
    }
    scalar_block_bits(cond, width, a, b)
}

pub fn scalar_block_bits(cond: Cond, width: usize, a: &[u8], b: &[u8]) -> u32 {
    (0..128 / width).fold(0, |bits, lane| {
        if cond.test(packed::get(width, a, lane), packed::get(width, b, lane)) {
            bits | 1 << lane
        } else {
            bits
        }
    })
}

/// `_mm_movemask_epi8` 的逐字节位图 → 逐 lane 位图
fn lanes_from_bytes(bytes: u32, lane_bytes: usize) -> u32 {
    (0..16 / lane_bytes).fold(0, |bits, lane| {
        if (bytes >> (lane * lane_bytes)) & 1 != 0 { bits | 1 << lane } else { bits }
    })
}

#[cfg(target_arch = "x86_64")]
mod sse {
    use std::arch::x86_64::*;

    use super::{lanes_from_bytes, Cond};

    #[target_feature(enable = "sse4.2")]
    unsafe fn cmpeq(width: usize, x: __m128i, y: __m128i) -> __m128i {
        match width {
            8  => _mm_cmpeq_epi8(x, y),
            16 => _mm_cmpeq_epi16(x, y),
            32 => _mm_cmpeq_epi32(x, y),
            _  => _mm_cmpeq_epi64(x, y),
        }
    }

    #[target_feature(enable = "sse4.2")]
    unsafe fn cmpgt(width: usize, x: __m128i, y: __m128i) -> __m128i {
        match width {
            8  => _mm_cmpgt_epi8(x, y),
            16 => _mm_cmpgt_epi16(x, y),
            32 => _mm_cmpgt_epi32(x, y),
            _  => _mm_cmpgt_epi64(x, y),
        }
    }

    #[target_feature(enable = "sse4.2")]
    pub(super) unsafe fn block_bits(cond: Cond, width: usize, a: &[u8], b: &[u8]) -> u32 {
        let va = _mm_loadu_si128(a.as_ptr() as *const __m128i);
        let vb = _mm_loadu_si128(b.as_ptr() as *const __m128i);
        let mask = match cond {
            Cond::Equal | Cond::NotEqual => cmpeq(width, va, vb),
            Cond::Greater                => cmpgt(width, va, vb),
            Cond::Less                   => cmpgt(width, vb, va),
        };
        let mut bytes = _mm_movemask_epi8(mask) as u32;
        if cond == Cond::NotEqual {
            bytes = !bytes & 0xFFFF;
        }
        lanes_from_bytes(bytes, width / 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(width: usize, values: &[i64]) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, &v) in values.iter().enumerate() {
            packed::set(width, &mut out, i, v);
        }
        out
    }

    #[test]
    fn lanes_from_byte_mask() {
        assert_eq!(lanes_from_bytes(0x00F0, 4), 0b10);
        assert_eq!(lanes_from_bytes(0xFFFF, 8), 0b11);
        assert_eq!(lanes_from_bytes(0b0101, 1), 0b0101);
    }

    #[test]
    fn block_matches_scalar() {
        let conds = [Cond::Equal, Cond::NotEqual, Cond::Greater, Cond::Less];
        let cases: [(usize, Vec<i64>); 4] = [
            (8, vec![-128, -1, 0, 1, 5, 127, 5, 5, -5, 0, 1, 2, 3, 4, 5, 6]),
            (16, vec![-300, 300, 5, 5, i16::MAX as i64, i16::MIN as i64, 0, 4]),
            (32, vec![i32::MIN as i64, 5, 6, -7]),
            (64, vec![i64::MIN, 5]),
        ];
        for (width, values) in cases {
            let a = block(width, &values);
            let b = splat(width, 5);
            for cond in conds {
                assert_eq!(block_bits(cond, width, &a, &b), scalar_block_bits(cond, width, &a, &b), "{cond:?} w{width}");
            }
        }
    }

    #[test]
    fn scalar_bits() {
        let a = block(32, &[1, 5, 9, 5]);
        let b = splat(32, 5);
        assert_eq!(scalar_block_bits(Cond::Equal, 32, &a, &b), 0b1010);
        assert_eq!(scalar_block_bits(Cond::Greater, 32, &a, &b), 0b0100);
        assert_eq!(scalar_block_bits(Cond::Less, 32, &a, &b), 0b0001);
    }
}
