//! OCP FP8 E4M3 (`float8_e4m3fn`) byte codec.
//!
//! E4M3: 1 sign bit, 4 exponent bits (bias 7), 3 mantissa bits. No
//! infinities; `S.1111.111` is NaN, so the largest finite magnitude is
//! `1.75 * 2^8 = 448`.

/// Largest finite E4M3 magnitude.
pub const FP8_E4M3_MAX: f32 = 448.0;

const NAN_BITS: u8 = 0x7F;
const MAX_FINITE_BITS: u8 = 0x7E;
/// Smallest positive subnormal, 2^-9.
const SUBNORMAL_STEP: f32 = 1.0 / 512.0;
/// Smallest positive normal, 2^-6.
const MIN_NORMAL: f32 = 1.0 / 64.0;

/// Encode an `f32` to E4M3 with round-to-nearest-even. Values beyond the
/// finite range saturate to +-448.
#[inline]
pub fn fp8_e4m3_encode(val: f32) -> u8 {
    if val.is_nan() {
        return NAN_BITS;
    }
    let sign = if val.is_sign_negative() { 0x80u8 } else { 0u8 };
    let abs_val = val.abs();
    if abs_val >= FP8_E4M3_MAX {
        return sign | MAX_FINITE_BITS;
    }

    if abs_val < MIN_NORMAL {
        // Subnormal grid: m * 2^-9, m in 0..=8; m == 8 is the smallest normal
        // and its bit pattern (exp=1, mant=0) is exactly 8.
        let m = (abs_val / SUBNORMAL_STEP).round_ties_even() as u8;
        return sign | m;
    }

    let bits = abs_val.to_bits();
    let mut exp = ((bits >> 23) & 0xFF) as i32 - 127;
    let frac = f32::from_bits((bits & 0x007F_FFFF) | 0x3F80_0000) - 1.0;
    let mut mant = (frac * 8.0).round_ties_even() as u8;
    if mant == 8 {
        mant = 0;
        exp += 1;
    }
    if exp > 8 || (exp == 8 && mant > 6) {
        return sign | MAX_FINITE_BITS;
    }
    sign | (((exp + 7) as u8) << 3) | mant
}

/// Decode an E4M3 byte to `f32`.
#[inline]
pub fn fp8_e4m3_decode(byte: u8) -> f32 {
    let sign = if byte & 0x80 != 0 { -1.0f32 } else { 1.0 };
    let exp = ((byte >> 3) & 0x0F) as i32;
    let mant = (byte & 0x07) as f32;
    if exp == 0x0F && byte & 0x07 == 0x07 {
        return f32::NAN;
    }
    if exp == 0 {
        return sign * mant * SUBNORMAL_STEP;
    }
    sign * (1.0 + mant / 8.0) * 2f32.powi(exp - 7)
}
