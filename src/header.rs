//! 节点头编解码
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ byte 0..2  capacity (u24 BE，含头部，8 字节对齐)              │
//! │ byte 3     保留                                               │
//! │ byte 4     control：                                          │
//! │              bit7   = !is_leaf                                │
//! │              bit6   = has_refs                                │
//! │              bit5   = is_index_node                           │
//! │              bit4-3 = width_type                              │
//! │              bit2-0 = log2(width)+1（0 ⇒ width 0）             │
//! │ byte 5..7  size (u24 BE，元素个数)                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! 节点头只能通过本模块的 `encode` / `decode` 读写，其余模块不直接操作这 8 个字节。

use byteorder::{BigEndian, ByteOrder};

use crate::common::{round_up_8, HEADER_SIZE, MAX_NODE_BYTES};

// ── WidthType ─────────────────────────────────────────────────────────────────

/// 由元素个数与位宽推导负载字节数的方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WidthType {
    /// 按位紧密打包：ceil(size * width / 8)
    Bits,
    /// 每元素 width 字节：size * width
    Multiply,
    /// 每元素一字节，忽略 width：size
    Ignore,
}

impl WidthType {
    fn to_bits(self) -> u8 {
        match self {
            WidthType::Bits     => 0,
            WidthType::Multiply => 1,
            WidthType::Ignore   => 2,
        }
    }

    fn from_bits(b: u8) -> Self {
        match b {
            0 => WidthType::Bits,
            1 => WidthType::Multiply,
            _ => WidthType::Ignore,
        }
    }
}

// ── NodeHeader ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHeader {
    pub is_leaf:       bool,
    pub has_refs:      bool,
    pub is_index_node: bool,
    pub width_type:    WidthType,
    /// 0/1/2/4/8/16/32/64 之一
    pub width:         usize,
    pub size:          usize,
    pub capacity:      usize,
}

impl NodeHeader {
    pub fn leaf(has_refs: bool) -> Self {
        Self {
            is_leaf:       true,
            has_refs,
            is_index_node: false,
            width_type:    WidthType::Bits,
            width:         0,
            size:          0,
            capacity:      0,
        }
    }

    /// 当前 size/width 下节点实际占用的字节数（含头部）
    pub fn byte_size(&self) -> usize {
        calc_byte_size(self.width_type, self.size, self.width)
    }
}

/// 把 width 编码为 3 bit：log2(width)+1，width 0 编码为 0
pub fn encode_width(width: usize) -> u8 {
    debug_assert!(matches!(width, 0 | 1 | 2 | 4 | 8 | 16 | 32 | 64), "illegal width {width}");
    if width == 0 { 0 } else { width.trailing_zeros() as u8 + 1 }
}

pub fn decode_width(bits: u8) -> usize {
    (1usize << (bits & 7)) >> 1
}

pub fn encode(h: &NodeHeader) -> [u8; HEADER_SIZE] {
    debug_assert!(h.capacity <= MAX_NODE_BYTES);
    debug_assert!(h.size <= MAX_NODE_BYTES);

    let mut buf = [0u8; HEADER_SIZE];
    BigEndian::write_u24(&mut buf[0..3], h.capacity as u32);
    let mut control = encode_width(h.width);
    control |= h.width_type.to_bits() << 3;
    if !h.is_leaf       { control |= 0x80; }
    if h.has_refs       { control |= 0x40; }
    if h.is_index_node  { control |= 0x20; }
    buf[4] = control;
    BigEndian::write_u24(&mut buf[5..8], h.size as u32);
    buf
}

pub fn decode(buf: &[u8]) -> NodeHeader {
    let control = buf[4];
    NodeHeader {
        is_leaf:       control & 0x80 == 0,
        has_refs:      control & 0x40 != 0,
        is_index_node: control & 0x20 != 0,
        width_type:    WidthType::from_bits((control >> 3) & 3),
        width:         decode_width(control),
        size:          BigEndian::read_u24(&buf[5..8]) as usize,
        capacity:      BigEndian::read_u24(&buf[0..3]) as usize,
    }
}

/// 写入节点头（整块覆盖前 8 字节）
pub fn write(buf: &mut [u8], h: &NodeHeader) {
    buf[..HEADER_SIZE].copy_from_slice(&encode(h));
}

/// 只读取 size 字段，定位叶子时避免整头解码
pub fn read_size(buf: &[u8]) -> usize {
    BigEndian::read_u24(&buf[5..8]) as usize
}

pub fn read_is_leaf(buf: &[u8]) -> bool {
    buf[4] & 0x80 == 0
}

/// 节点占用字节数：负载按 8 字节对齐后再加 8 字节头
pub fn calc_byte_size(width_type: WidthType, size: usize, width: usize) -> usize {
    let payload = match width_type {
        WidthType::Bits     => (size * width + 7) / 8,
        WidthType::Multiply => size * width,
        WidthType::Ignore   => size,
    };
    round_up_8(payload) + HEADER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_codes() {
        let widths = [0usize, 1, 2, 4, 8, 16, 32, 64];
        for (code, w) in widths.iter().enumerate() {
            assert_eq!(encode_width(*w), code as u8);
            assert_eq!(decode_width(code as u8), *w);
        }
    }

    #[test]
    fn bit_layout() {
        let h = NodeHeader {
            is_leaf:       false,
            has_refs:      true,
            is_index_node: false,
            width_type:    WidthType::Multiply,
            width:         16,
            size:          0x01_0203,
            capacity:      0x0A_0B10,
        };
        let buf = encode(&h);
        assert_eq!(buf, [0x0A, 0x0B, 0x10, 0x00, 0x80 | 0x40 | (1 << 3) | 5, 0x01, 0x02, 0x03]);
        assert_eq!(decode(&buf), h);
        assert_eq!(read_size(&buf), 0x01_0203);
        assert!(!read_is_leaf(&buf));
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(calc_byte_size(WidthType::Bits, 0, 64), 8);
        assert_eq!(calc_byte_size(WidthType::Bits, 10, 0), 8);
        assert_eq!(calc_byte_size(WidthType::Bits, 3, 4), 16);
        assert_eq!(calc_byte_size(WidthType::Bits, 17, 4), 24);
        assert_eq!(calc_byte_size(WidthType::Multiply, 3, 4), 24);
        assert_eq!(calc_byte_size(WidthType::Ignore, 9, 64), 24);
    }
}
