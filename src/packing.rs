//! Bit-level helpers shared by the codec and the native format.
//!
//! Four 4-bit codes share one `u16` word. The code for column `4w + i` lives in
//! bits `4i..4i + 4` of word `w`, least significant nibble first. The GPU
//! kernels use the same order, widening each word to a `u32`.

use half::f16;

/// Number of 4-bit codes packed into one storage word.
pub const CODES_PER_WORD: usize = 4;

/// Largest bin index representable in 4 bits.
pub const MAX_BIN: u8 = 15;

/// Pack four bin indices into one word. Indices above 15 are masked.
#[inline]
#[must_use]
pub fn pack_word(codes: [u8; CODES_PER_WORD]) -> u16 {
    u16::from(codes[0] & 0x0F)
        | (u16::from(codes[1] & 0x0F) << 4)
        | (u16::from(codes[2] & 0x0F) << 8)
        | (u16::from(codes[3] & 0x0F) << 12)
}

/// Unpack a word into its four bin indices, in column order.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn unpack_word(word: u16) -> [u8; CODES_PER_WORD] {
    [
        (word & 0x0F) as u8,
        ((word >> 4) & 0x0F) as u8,
        ((word >> 8) & 0x0F) as u8,
        ((word >> 12) & 0x0F) as u8,
    ]
}

/// Largest f16 that is `<= value`.
///
/// Returns `None` if `value` is not finite or falls below `-f16::MAX`.
#[must_use]
pub fn f16_floor(value: f32) -> Option<f16> {
    if !value.is_finite() {
        return None;
    }
    let mut h = f16::from_f32(value);
    if h.to_f32() > value {
        h = next_down(h);
    }
    h.is_finite().then_some(h)
}

/// Smallest f16 that is `>= value`.
///
/// Returns `None` if `value` is not finite or exceeds `f16::MAX`.
#[must_use]
pub fn f16_ceil(value: f32) -> Option<f16> {
    if !value.is_finite() {
        return None;
    }
    let mut h = f16::from_f32(value);
    if h.to_f32() < value {
        h = next_up(h);
    }
    h.is_finite().then_some(h)
}

fn next_up(h: f16) -> f16 {
    let bits = h.to_bits();
    if bits & 0x7FFF == 0 {
        // +0 or -0: smallest positive subnormal
        f16::from_bits(0x0001)
    } else if bits & 0x8000 == 0 {
        f16::from_bits(bits + 1)
    } else {
        f16::from_bits(bits - 1)
    }
}

fn next_down(h: f16) -> f16 {
    let bits = h.to_bits();
    if bits & 0x7FFF == 0 {
        f16::from_bits(0x8001)
    } else if bits & 0x8000 == 0 {
        f16::from_bits(bits - 1)
    } else {
        f16::from_bits(bits + 1)
    }
}
