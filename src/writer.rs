//! 节点序列化输出
//!
//! `Array::write` 先写子节点再写父节点，每个节点以 8 字节对齐的偏移落盘，
//! 该偏移即镜像被重新挂载（`SlabAlloc::from_image`）后的 ref。

use std::io::Write;

use crate::common::{round_up_8, ArrayError, Result, HEADER_SIZE};

pub trait ArrayWriter {
    /// 写出一个完整节点，返回其起始偏移（8 字节对齐）
    fn write_array(&mut self, data: &[u8]) -> Result<usize>;
}

// ── MemoryOutputStream ────────────────────────────────────────────────────────

/// 内存镜像输出流，附带运行中的 CRC32
pub struct MemoryOutputStream {
    buf:    Vec<u8>,
    hasher: crc32fast::Hasher,
}

impl Default for MemoryOutputStream {
    fn default() -> Self { Self::new() }
}

impl MemoryOutputStream {
    /// 开头预留 8 字节，保证偏移 0 永远不是合法 ref
    pub fn new() -> Self {
        Self::from_image(vec![0u8; HEADER_SIZE])
    }

    /// 在已有镜像之后追加（增量提交）
    pub fn from_image(mut image: Vec<u8>) -> Self {
        image.resize(round_up_8(image.len().max(HEADER_SIZE)), 0);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&image);
        Self { buf: image, hasher }
    }

    pub fn len(&self)      -> usize  { self.buf.len() }
    pub fn is_empty(&self) -> bool   { self.buf.len() <= HEADER_SIZE }
    pub fn as_bytes(&self) -> &[u8]  { &self.buf }
    pub fn into_bytes(self) -> Vec<u8> { self.buf }
    pub fn checksum(&self) -> u32    { self.hasher.clone().finalize() }
}

impl ArrayWriter for MemoryOutputStream {
    fn write_array(&mut self, data: &[u8]) -> Result<usize> {
        let pos    = self.buf.len();
        let padded = round_up_8(data.len());
        self.buf.extend_from_slice(data);
        self.buf.resize(pos + padded, 0);
        self.hasher.update(&self.buf[pos..]);
        Ok(pos)
    }
}

// ── StreamWriter ──────────────────────────────────────────────────────────────

/// 任意 `io::Write` 之上的输出，自己维护偏移
pub struct StreamWriter<W: Write> {
    inner: W,
    pos:   usize,
}

impl<W: Write> StreamWriter<W> {
    /// `start` 为流当前已写入的字节数（须 8 字节对齐且非 0）
    pub fn new(inner: W, start: usize) -> Self {
        debug_assert!(start % 8 == 0 && start > 0);
        Self { inner, pos: start }
    }

    pub fn position(&self) -> usize { self.pos }
    pub fn into_inner(self) -> W    { self.inner }
}

impl<W: Write> ArrayWriter for StreamWriter<W> {
    fn write_array(&mut self, data: &[u8]) -> Result<usize> {
        let pos = self.pos;
        let pad = round_up_8(data.len()) - data.len();
        self.inner.write_all(data).map_err(|e| ArrayError::Io(e.to_string()))?;
        self.inner.write_all(&[0u8; 8][..pad]).map_err(|e| ArrayError::Io(e.to_string()))?;
        self.pos += data.len() + pad;
        Ok(pos)
    }
}
