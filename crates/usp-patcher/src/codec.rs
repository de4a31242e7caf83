//! Primitive integer codec and byte cursors
//!
//! Containers are written in the byte order of the machine that produced them.
//! The reader picks one of two codecs from the header tag and every integer in
//! that container goes through it; the writer reuses the same codec so a
//! container round-trips byte for byte.

use usp_core::error::{ContainerError, Result, UspError};

/// Fixed-width integer conversion for one byte order
pub trait PrimitiveCodec: Sync {
    fn get_u16(&self, bytes: [u8; 2]) -> u16;
    fn get_u32(&self, bytes: [u8; 4]) -> u32;
    fn put_u16(&self, value: u16) -> [u8; 2];
    fn put_u32(&self, value: u32) -> [u8; 4];
}

/// Host byte order
pub struct NativeCodec;

/// Reversed host byte order
pub struct SwappedCodec;

impl PrimitiveCodec for NativeCodec {
    #[inline]
    fn get_u16(&self, bytes: [u8; 2]) -> u16 {
        u16::from_ne_bytes(bytes)
    }

    #[inline]
    fn get_u32(&self, bytes: [u8; 4]) -> u32 {
        u32::from_ne_bytes(bytes)
    }

    #[inline]
    fn put_u16(&self, value: u16) -> [u8; 2] {
        value.to_ne_bytes()
    }

    #[inline]
    fn put_u32(&self, value: u32) -> [u8; 4] {
        value.to_ne_bytes()
    }
}

impl PrimitiveCodec for SwappedCodec {
    #[inline]
    fn get_u16(&self, bytes: [u8; 2]) -> u16 {
        u16::from_ne_bytes(bytes).swap_bytes()
    }

    #[inline]
    fn get_u32(&self, bytes: [u8; 4]) -> u32 {
        u32::from_ne_bytes(bytes).swap_bytes()
    }

    #[inline]
    fn put_u16(&self, value: u16) -> [u8; 2] {
        value.swap_bytes().to_ne_bytes()
    }

    #[inline]
    fn put_u32(&self, value: u32) -> [u8; 4] {
        value.swap_bytes().to_ne_bytes()
    }
}

static NATIVE: NativeCodec = NativeCodec;
static SWAPPED: SwappedCodec = SwappedCodec;

/// Byte order of a container relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Native,
    Swapped,
}

impl ByteOrder {
    /// Codec implementing this byte order
    pub fn codec(self) -> &'static dyn PrimitiveCodec {
        match self {
            Self::Native => &NATIVE,
            Self::Swapped => &SWAPPED,
        }
    }

    /// Identify the byte order from the first four bytes of a container
    pub fn detect(tag: [u8; 4], expected: u32) -> Option<Self> {
        let native = NATIVE.get_u32(tag);
        if native == expected {
            Some(Self::Native)
        } else if SWAPPED.get_u32(tag) == expected {
            Some(Self::Swapped)
        } else {
            None
        }
    }
}

/// Bounds-checked read cursor over container bytes
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    /// Offset of `data[0]` within the whole container, for error reports
    base: usize,
    codec: &'static dyn PrimitiveCodec,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], order: ByteOrder) -> Self {
        Self::with_base(data, order, 0)
    }

    pub fn with_base(data: &'a [u8], order: ByteOrder, base: usize) -> Self {
        Self {
            data,
            pos: 0,
            base,
            codec: order.codec(),
        }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Position within the whole container
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Take the next `len` bytes
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(ContainerError::Truncated {
                offset: self.offset(),
                needed: len - self.remaining(),
            }
            .into());
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Split off a cursor over the next `len` bytes, sharing this byte order
    pub fn sub_reader(&mut self, len: usize) -> Result<ByteReader<'a>> {
        let base = self.offset();
        let data = self.take(len)?;
        Ok(ByteReader {
            data,
            pos: 0,
            base,
            codec: self.codec,
        })
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take_array::<2>()?;
        Ok(self.codec.get_u16(bytes))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take_array::<4>()?;
        Ok(self.codec.get_u32(bytes))
    }

    /// Reserve storage for `count` list elements of at least `elem_size` bytes each.
    ///
    /// The count is checked against the bytes left in the cursor before anything
    /// is allocated, so a corrupt count fails as truncation rather than as a huge
    /// allocation.
    pub fn alloc_list<T>(&self, count: usize, elem_size: usize) -> Result<Vec<T>> {
        let needed = count.saturating_mul(elem_size);
        if needed > self.remaining() {
            return Err(ContainerError::Truncated {
                offset: self.offset(),
                needed: needed - self.remaining(),
            }
            .into());
        }
        let mut list = Vec::new();
        list.try_reserve_exact(count)
            .map_err(|_| UspError::OutOfMemory(count))?;
        Ok(list)
    }
}

/// Write interface shared by the measuring and the emitting pass
pub trait Sink {
    fn put_u8(&mut self, value: u8);
    fn put_u16(&mut self, value: u16);
    fn put_u32(&mut self, value: u32);
    /// Bytes accepted so far
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sink that only counts bytes
#[derive(Debug, Default)]
pub struct SizeCounter {
    bytes: usize,
}

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sink for SizeCounter {
    fn put_u8(&mut self, _value: u8) {
        self.bytes += 1;
    }

    fn put_u16(&mut self, _value: u16) {
        self.bytes += 2;
    }

    fn put_u32(&mut self, _value: u32) {
        self.bytes += 4;
    }

    fn len(&self) -> usize {
        self.bytes
    }
}

/// Sink that emits bytes in a chosen byte order
pub struct ByteWriter {
    buf: Vec<u8>,
    codec: &'static dyn PrimitiveCodec,
}

impl ByteWriter {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            buf: Vec::new(),
            codec: order.codec(),
        }
    }

    /// Overwrite a previously written `u32` (used to back-patch lengths)
    pub fn patch_u32(&mut self, at: usize, value: u32) {
        let bytes = self.codec.put_u32(value);
        self.buf[at..at + 4].copy_from_slice(&bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Sink for ByteWriter {
    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&self.codec.put_u16(value));
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&self.codec.put_u32(value));
    }

    fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Emit a `u32` size prefix followed by the bytes `body` writes.
///
/// `body` runs twice: once against a [`SizeCounter`] to compute the prefix and
/// once against `out`. Both runs must produce the same number of bytes.
pub fn write_sized<F>(out: &mut ByteWriter, mut body: F) -> Result<()>
where
    F: FnMut(&mut dyn Sink) -> Result<()>,
{
    let mut counter = SizeCounter::new();
    body(&mut counter)?;
    let measured = counter.len();
    let prefix = u32::try_from(measured).map_err(|_| ContainerError::TooLarge(measured))?;
    out.put_u32(prefix);

    let start = out.len();
    body(&mut *out)?;
    let written = out.len() - start;
    if written != measured {
        tracing::error!(measured, written, "sized block writer disagreed with its size pass");
        return Err(ContainerError::DescriptorSize { measured, written }.into());
    }
    Ok(())
}
