// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MSB-first bit and byte readers for RBSP syntax.
//!
//! [`BitReader`] never fails mid-parse: reading past the end yields zero bits
//! and latches [`BitReader::overran`], which parsers check at syntax
//! boundaries.

/// Maximum number of leading zero bits accepted in an Exp-Golomb code.
const MAX_EXP_GOLOMB_ZEROS: u32 = 31;

/// MSB-first bit reader over a byte slice.
#[derive(Clone, Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],

    /// Position in bits from the start of `data`.
    pos: usize,
    overran: bool,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            overran: false,
        }
    }

    /// Reads one bit, returning 0 past the end.
    #[inline]
    pub fn read_bit(&mut self) -> u32 {
        let byte = self.pos / 8;
        if byte >= self.data.len() {
            self.overran = true;
            return 0;
        }
        let bit = (self.data[byte] >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        u32::from(bit)
    }

    #[inline]
    pub fn read_flag(&mut self) -> bool {
        self.read_bit() == 1
    }

    /// Reads `n` bits (at most 64) as an unsigned big-endian value.
    pub fn read_bits(&mut self, n: u32) -> u64 {
        debug_assert!(n <= 64);
        let mut v = 0u64;
        for _ in 0..n.min(64) {
            v = (v << 1) | u64::from(self.read_bit());
        }
        v
    }

    /// Reads `n` bits (at most 32) as a `u32`.
    #[inline]
    pub fn read_u32(&mut self, n: u32) -> u32 {
        debug_assert!(n <= 32);
        self.read_bits(n.min(32)) as u32
    }

    /// Reads an unsigned Exp-Golomb code, `ue(v)`.
    ///
    /// Codes with more than 31 leading zeros (which can't represent a `u32`)
    /// and codes running past the end yield 0 and latch the overrun flag.
    pub fn read_ue(&mut self) -> u32 {
        let mut zeros = 0;
        while self.read_bit() == 0 {
            if self.overran || zeros == MAX_EXP_GOLOMB_ZEROS {
                self.overran = true;
                return 0;
            }
            zeros += 1;
        }
        let suffix = self.read_bits(zeros);
        if self.overran {
            return 0;
        }
        ((1u64 << zeros) - 1 + suffix) as u32
    }

    /// Reads a signed Exp-Golomb code, `se(v)`: k maps to (-1)^(k+1) * ceil(k/2).
    pub fn read_se(&mut self) -> i32 {
        let k = i64::from(self.read_ue());
        let magnitude = (k + 1) / 2;
        (if k % 2 == 1 { magnitude } else { -magnitude }) as i32
    }

    pub fn skip_bits(&mut self, n: usize) {
        let end = self.pos.saturating_add(n);
        if end > self.data.len() * 8 {
            self.overran = true;
            self.pos = self.data.len() * 8;
        } else {
            self.pos = end;
        }
    }

    /// Advances to the next byte boundary.
    pub fn byte_align(&mut self) {
        let rem = self.pos % 8;
        if rem != 0 {
            self.skip_bits(8 - rem);
        }
    }

    #[inline]
    pub fn is_byte_aligned(&self) -> bool {
        self.pos % 8 == 0
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining_bits(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos)
    }

    /// Returns true if any read went past the end of the data.
    #[inline]
    pub fn overran(&self) -> bool {
        self.overran
    }

    /// Returns true if there is data before the RBSP stop bit.
    pub fn more_rbsp_data(&self) -> bool {
        let Some(last) = self.data.iter().rposition(|&b| b != 0) else {
            return false;
        };
        let stop_bit = last * 8 + 7 - self.data[last].trailing_zeros() as usize;
        self.pos < stop_bit
    }

    /// Returns `Err` naming `what` if the data ran out.
    pub fn check(&self, what: &str) -> Result<(), String> {
        if self.overran {
            return Err(format!("{what} truncated at bit {}", self.pos));
        }
        Ok(())
    }
}

/// Big-endian byte reader.
#[derive(Clone, Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    pub fn read_u16_be(&mut self) -> Option<u16> {
        let b = self.read_bytes(2)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32_be(&mut self) -> Option<u32> {
        let b = self.read_bytes(4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let b = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(b)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Removes emulation prevention bytes: each `00 00 03` becomes `00 00`.
///
/// Returns the input unchanged (borrowed) when there are none.
pub fn unescape_rbsp(data: &[u8]) -> std::borrow::Cow<'_, [u8]> {
    let needs_copy = data.windows(3).any(|w| w == [0, 0, 3]);
    if !needs_copy {
        return std::borrow::Cow::Borrowed(data);
    }
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    std::borrow::Cow::Owned(out)
}

/// MSB-first bit writer, used to build bitstreams in tests and benchmarks.
#[derive(Default, Debug)]
pub struct BitWriter {
    out: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bit(&mut self, bit: bool) {
        if self.bits % 8 == 0 {
            self.out.push(0);
        }
        if bit {
            let last = self.out.len() - 1;
            self.out[last] |= 0x80 >> (self.bits % 8);
        }
        self.bits += 1;
    }

    pub fn write_bits(&mut self, n: u32, v: u64) {
        for i in (0..n).rev() {
            self.write_bit((v >> i) & 1 == 1);
        }
    }

    pub fn write_ue(&mut self, v: u32) {
        let v = u64::from(v) + 1;
        let len = 64 - v.leading_zeros();
        self.write_bits(len - 1, 0);
        self.write_bits(len, v);
    }

    pub fn write_se(&mut self, v: i32) {
        let k = if v > 0 {
            2 * i64::from(v) - 1
        } else {
            -2 * i64::from(v)
        };
        self.write_ue(k as u32);
    }

    /// Writes the stop bit and zero-pads to a byte boundary.
    pub fn write_rbsp_trailing_bits(&mut self) {
        self.write_bit(true);
        while self.bits % 8 != 0 {
            self.write_bit(false);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }
}

/// Inserts emulation prevention bytes, the inverse of [`unescape_rbsp`].
pub fn escape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64);
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b <= 3 {
            out.push(3);
            zeros = 0;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}
