//! 按位宽特化的元素编解码
//!
//! 负载按元素下标顺序、低位优先打包：第 i 个元素位于负载的 bit `i * width` 处。
//! - width 1/2/4：无符号，取值 `[0, 2^w - 1]`
//! - width 8/16/32/64：小端补码，有符号
//! - width 0：所有元素恒为 0，不占负载

use byteorder::{ByteOrder, LittleEndian};

/// 全部合法位宽，从小到大
pub const WIDTHS: [usize; 8] = [0, 1, 2, 4, 8, 16, 32, 64];

// ── 位宽边界 ──────────────────────────────────────────────────────────────────

/// width 下可表示的最小值
pub fn lbound(width: usize) -> i64 {
    match width {
        0 | 1 | 2 | 4 => 0,
        8  => i8::MIN as i64,
        16 => i16::MIN as i64,
        32 => i32::MIN as i64,
        64 => i64::MIN,
        _  => unreachable!("illegal width {width}"),
    }
}

/// width 下可表示的最大值
pub fn ubound(width: usize) -> i64 {
    match width {
        0  => 0,
        1  => 1,
        2  => 3,
        4  => 15,
        8  => i8::MAX as i64,
        16 => i16::MAX as i64,
        32 => i32::MAX as i64,
        64 => i64::MAX,
        _  => unreachable!("illegal width {width}"),
    }
}

/// 能容纳 v 的最小合法位宽
pub fn bit_width(v: i64) -> usize {
    const SMALL: [usize; 16] = [0, 1, 2, 2, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4];
    if (v as u64) >> 4 == 0 {
        return SMALL[v as usize];
    }
    let v = if v < 0 { !v } else { v };
    if v >> 7 == 0 {
        8
    } else if v >> 15 == 0 {
        16
    } else if v >> 31 == 0 {
        32
    } else {
        64
    }
}

// ── 单元素读写 ────────────────────────────────────────────────────────────────

#[inline]
pub fn get_w<const W: usize>(data: &[u8], ndx: usize) -> i64 {
    match W {
        0 => 0,
        1 | 2 | 4 => {
            let bit = ndx * W;
            ((data[bit >> 3] >> (bit & 7)) & ((1u8 << W) - 1)) as i64
        }
        8  => data[ndx] as i8 as i64,
        16 => LittleEndian::read_i16(&data[ndx * 2..]) as i64,
        32 => LittleEndian::read_i32(&data[ndx * 4..]) as i64,
        _  => LittleEndian::read_i64(&data[ndx * 8..]),
    }
}

#[inline]
pub fn set_w<const W: usize>(data: &mut [u8], ndx: usize, v: i64) {
    match W {
        0 => {}
        1 | 2 | 4 => {
            let bit   = ndx * W;
            let shift = bit & 7;
            let mask  = ((1u8 << W) - 1) << shift;
            let byte  = &mut data[bit >> 3];
            *byte = (*byte & !mask) | (((v as u8) << shift) & mask);
        }
        8  => data[ndx] = v as i8 as u8,
        16 => LittleEndian::write_i16(&mut data[ndx * 2..], v as i16),
        32 => LittleEndian::write_i32(&mut data[ndx * 4..], v as i32),
        _  => LittleEndian::write_i64(&mut data[ndx * 8..], v),
    }
}

/// 位宽运行时已知时的读取入口
pub fn get(width: usize, data: &[u8], ndx: usize) -> i64 {
    match width {
        0  => get_w::<0>(data, ndx),
        1  => get_w::<1>(data, ndx),
        2  => get_w::<2>(data, ndx),
        4  => get_w::<4>(data, ndx),
        8  => get_w::<8>(data, ndx),
        16 => get_w::<16>(data, ndx),
        32 => get_w::<32>(data, ndx),
        64 => get_w::<64>(data, ndx),
        _  => unreachable!("illegal width {width}"),
    }
}

pub fn set(width: usize, data: &mut [u8], ndx: usize, v: i64) {
    match width {
        0  => set_w::<0>(data, ndx, v),
        1  => set_w::<1>(data, ndx, v),
        2  => set_w::<2>(data, ndx, v),
        4  => set_w::<4>(data, ndx, v),
        8  => set_w::<8>(data, ndx, v),
        16 => set_w::<16>(data, ndx, v),
        32 => set_w::<32>(data, ndx, v),
        64 => set_w::<64>(data, ndx, v),
        _  => unreachable!("illegal width {width}"),
    }
}

// ── 字级访问 ──────────────────────────────────────────────────────────────────

/// 读取负载中第 word_ndx 个 64 bit 字（小端）
#[inline]
pub fn read_word(data: &[u8], word_ndx: usize) -> u64 {
    LittleEndian::read_u64(&data[word_ndx * 8..])
}

/// 把一个字中的某条 lane 还原成元素值
#[inline]
pub fn lane_value(word: u64, lane: usize, width: usize) -> i64 {
    match width {
        0  => 0,
        64 => word as i64,
        w if w < 8 => ((word >> (lane * w)) & ((1u64 << w) - 1)) as i64,
        w => {
            let raw = (word >> (lane * w)) << (64 - w);
            (raw as i64) >> (64 - w)
        }
    }
}
