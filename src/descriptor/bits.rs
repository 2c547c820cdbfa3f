//! Bit packing for hardware descriptors
//!
//! Descriptor fields are little-endian bitfields allocated LSB-first inside
//! 32-bit storage units, with every unit fully covered (reserved bits are
//! explicit). Under those rules the whole layout is one LSB-first bit
//! stream, which is what `BitPacker` writes.

#[derive(Debug, Clone)]
pub struct BitPacker {
    bytes: Vec<u8>,
    bit_pos: usize,
}

impl BitPacker {
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bytes),
            bit_pos: 0,
        }
    }

    /// Current position in bytes. Only meaningful on a byte boundary.
    pub fn byte_pos(&self) -> usize {
        assert!(self.bit_pos % 8 == 0, "not on a byte boundary");
        self.bit_pos / 8
    }

    /// Append the `width` low bits of `value`
    pub fn field(&mut self, value: u64, width: u32) -> &mut Self {
        assert!(width > 0 && width <= 64, "invalid field width {}", width);
        assert!(
            width == 64 || value >> width == 0,
            "value {:#x} does not fit in {} bits",
            value,
            width
        );
        for bit in 0..width {
            let byte = self.bit_pos / 8;
            if byte == self.bytes.len() {
                self.bytes.push(0);
            }
            if (value >> bit) & 1 == 1 {
                self.bytes[byte] |= 1 << (self.bit_pos % 8);
            }
            self.bit_pos += 1;
        }
        self
    }

    pub fn flag(&mut self, value: bool) -> &mut Self {
        self.field(value as u64, 1)
    }

    pub fn reserved(&mut self, width: u32) -> &mut Self {
        self.field(0, width)
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.field(value as u64, 8)
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.field(value as u64, 16)
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.field(value as u64, 32)
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.field(value as u32 as u64, 32)
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.field(value, 64)
    }

    pub fn u32s(&mut self, values: &[u32]) -> &mut Self {
        for &v in values {
            self.u32(v);
        }
        self
    }

    pub fn i32s(&mut self, values: &[i32]) -> &mut Self {
        for &v in values {
            self.i32(v);
        }
        self
    }

    /// The packed bytes. Panics unless the stream ends on a 32-bit unit.
    pub fn finish(self) -> Vec<u8> {
        assert!(self.bit_pos % 32 == 0, "descriptor ends mid storage unit ({} bits)", self.bit_pos);
        self.bytes
    }
}

/// Read a little-endian u32 at a byte offset
pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsb_first_packing() {
        let mut p = BitPacker::with_capacity(4);
        p.field(0b101, 3).field(0x1f, 5).u8(0xab).u16(0x1234);
        let bytes = p.finish();
        assert_eq!(bytes, vec![0b1111_1101, 0xab, 0x34, 0x12]);
    }

    #[test]
    fn test_signed_fields() {
        let mut p = BitPacker::with_capacity(4);
        p.i32(-2);
        assert_eq!(read_u32(&p.finish(), 0), 0xffff_fffe);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_overflow_panics() {
        BitPacker::with_capacity(1).field(8, 3);
    }

    #[test]
    #[should_panic(expected = "mid storage unit")]
    fn test_partial_unit_panics() {
        let mut p = BitPacker::with_capacity(1);
        p.u8(1);
        p.finish();
    }
}
