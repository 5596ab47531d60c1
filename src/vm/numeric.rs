//! Scalar numeric semantics: two's-complement integer arithmetic with
//! defined wrap-around, IEEE-754 float ops with canonical-NaN `min`/`max`,
//! trapping vs. saturating truncation, and the pack/unpack conversions for
//! `i8`/`i16` packed storage.

use crate::ast::instr::Sign;
use crate::ast::types::{StorageType, ValType};
use crate::error::Trap;
use crate::runtime::Value;

pub const F32_CANONICAL_NAN: u32 = 0x7FC0_0000;
pub const F64_CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

// ===== numeric predicates =====

pub fn is_int(ty: &ValType) -> bool {
    matches!(ty, ValType::I32 | ValType::I64)
}

pub fn is_float(ty: &ValType) -> bool {
    matches!(ty, ValType::F32 | ValType::F64)
}

/// Built-in number types: the four scalars (vectors and refs excluded).
pub fn is_native_num(ty: &ValType) -> bool {
    is_int(ty) || is_float(ty)
}

// ===== integer division =====

pub fn div_s32(a: i32, b: i32) -> Result<i32, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    if a == i32::MIN && b == -1 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(a.wrapping_div(b))
}

pub fn div_u32(a: u32, b: u32) -> Result<u32, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(a / b)
}

pub fn rem_s32(a: i32, b: i32) -> Result<i32, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(a.wrapping_rem(b))
}

pub fn rem_u32(a: u32, b: u32) -> Result<u32, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(a % b)
}

pub fn div_s64(a: i64, b: i64) -> Result<i64, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    if a == i64::MIN && b == -1 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(a.wrapping_div(b))
}

pub fn div_u64(a: u64, b: u64) -> Result<u64, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(a / b)
}

pub fn rem_s64(a: i64, b: i64) -> Result<i64, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(a.wrapping_rem(b))
}

pub fn rem_u64(a: u64, b: u64) -> Result<u64, Trap> {
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(a % b)
}

// ===== float min/max/nearest =====

/// `min` with Wasm semantics: canonical NaN if either input is NaN, and
/// `-0 < +0`.
pub fn fmin32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::from_bits(F32_CANONICAL_NAN)
    } else if a < b {
        a
    } else if b < a {
        b
    } else if a.is_sign_negative() {
        a
    } else {
        b
    }
}

pub fn fmax32(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::from_bits(F32_CANONICAL_NAN)
    } else if a > b {
        a
    } else if b > a {
        b
    } else if a.is_sign_positive() {
        a
    } else {
        b
    }
}

pub fn fmin64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::from_bits(F64_CANONICAL_NAN)
    } else if a < b {
        a
    } else if b < a {
        b
    } else if a.is_sign_negative() {
        a
    } else {
        b
    }
}

pub fn fmax64(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::from_bits(F64_CANONICAL_NAN)
    } else if a > b {
        a
    } else if b > a {
        b
    } else if a.is_sign_positive() {
        a
    } else {
        b
    }
}

/// Round-to-nearest, ties to even.
pub fn fnearest32(x: f32) -> f32 {
    x.round_ties_even()
}

pub fn fnearest64(x: f64) -> f64 {
    x.round_ties_even()
}

// ===== trapping truncation =====

macro_rules! trunc_checked {
    ($name:ident, $F:ty, $I:ty, $lo:expr, $hi_excl:expr) => {
        /// Trapping float-to-int truncation.
        pub fn $name(x: $F) -> Result<$I, Trap> {
            if x.is_nan() {
                return Err(Trap::InvalidConversionToInteger);
            }
            let t = (x as f64).trunc();
            if t >= $lo && t < $hi_excl {
                Ok(t as $I)
            } else {
                Err(Trap::IntegerOverflow)
            }
        }
    };
}

trunc_checked!(trunc_f32_to_i32, f32, i32, -2147483648.0, 2147483648.0);
trunc_checked!(trunc_f32_to_u32, f32, u32, 0.0, 4294967296.0);
trunc_checked!(trunc_f64_to_i32, f64, i32, -2147483648.0, 2147483648.0);
trunc_checked!(trunc_f64_to_u32, f64, u32, 0.0, 4294967296.0);
trunc_checked!(trunc_f32_to_i64, f32, i64, -9223372036854775808.0, 9223372036854775808.0);
trunc_checked!(trunc_f32_to_u64, f32, u64, 0.0, 18446744073709551616.0);
trunc_checked!(trunc_f64_to_i64, f64, i64, -9223372036854775808.0, 9223372036854775808.0);
trunc_checked!(trunc_f64_to_u64, f64, u64, 0.0, 18446744073709551616.0);

// Saturating truncation is Rust's `as` cast: clamps and maps NaN to zero.

// ===== packed storage =====

/// Pack a stack value into its storage form. For `i8`/`i16` the unused high
/// bits are cleared; everything else passes through.
pub fn pack_val(st: &StorageType, v: Value) -> Value {
    match (st, &v) {
        (StorageType::I8, Value::I32(x)) => Value::I32(x & 0xFF),
        (StorageType::I16, Value::I32(x)) => Value::I32(x & 0xFFFF),
        _ => v,
    }
}

/// Unpack a stored value for observation. `sign` selects sign- vs.
/// zero-extension for packed fields; `None` means the field is unpacked.
pub fn unpack_val(st: &StorageType, v: Value, sign: Option<Sign>) -> Value {
    match (st, &v) {
        (StorageType::I8, Value::I32(x)) => match sign {
            Some(Sign::S) => Value::I32((*x as u32 as u8 as i8) as i32),
            _ => Value::I32(x & 0xFF),
        },
        (StorageType::I16, Value::I32(x)) => match sign {
            Some(Sign::S) => Value::I32((*x as u32 as u16 as i16) as i32),
            _ => Value::I32(x & 0xFFFF),
        },
        _ => v,
    }
}

/// Clear unused high bits of a narrower scalar before typed observation.
/// Values produced by this engine are already exact; this guards values that
/// crossed the compiled-code boundary as raw slots.
pub fn clean_numeric(v: Value, ty: &ValType) -> Value {
    match (ty, &v) {
        (ValType::I32, Value::I64(x)) => Value::I32(*x as i32),
        (ValType::F32, Value::F64(b)) => Value::F32(*b as u32),
        _ => v,
    }
}

// ===== sign-extension ops =====

pub fn extend8_s32(x: i32) -> i32 {
    x as i8 as i32
}

pub fn extend16_s32(x: i32) -> i32 {
    x as i16 as i32
}

pub fn extend8_s64(x: i64) -> i64 {
    x as i8 as i64
}

pub fn extend16_s64(x: i64) -> i64 {
    x as i16 as i64
}

pub fn extend32_s64(x: i64) -> i64 {
    x as i32 as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn div_traps() {
        assert!(matches!(div_s32(i32::MIN, -1), Err(Trap::IntegerOverflow)));
        assert!(matches!(div_u32(1, 0), Err(Trap::IntegerDivideByZero)));
        assert_eq!(rem_s32(i32::MIN, -1).unwrap(), 0);
        assert_eq!(div_s32(-7, 2).unwrap(), -3);
    }

    #[test]
    fn trunc_bounds() {
        assert_eq!(trunc_f32_to_i32(-2147483648.0).unwrap(), i32::MIN);
        assert!(matches!(trunc_f32_to_i32(2147483648.0), Err(Trap::IntegerOverflow)));
        assert!(matches!(trunc_f32_to_i32(f32::NAN), Err(Trap::InvalidConversionToInteger)));
        assert_eq!(trunc_f64_to_u32(4294967295.9).unwrap(), u32::MAX);
        assert!(matches!(trunc_f64_to_u32(-1.0), Err(Trap::IntegerOverflow)));
        assert_eq!(trunc_f64_to_u32(-0.9).unwrap(), 0);
        assert!(matches!(trunc_f64_to_i64(9.3e18), Err(Trap::IntegerOverflow)));
    }

    #[test]
    fn sat_trunc_is_the_as_cast() {
        assert_eq!(f32::NAN as i32, 0);
        assert_eq!(3.4e38f32 as i32, i32::MAX);
        assert_eq!((-3.4e38f32) as u32, 0);
    }

    #[test]
    fn min_max_nan_and_zero() {
        assert_eq!(fmin32(f32::NAN, 1.0).to_bits(), F32_CANONICAL_NAN);
        assert_eq!(fmax64(1.0, f64::NAN).to_bits(), F64_CANONICAL_NAN);
        assert!(fmin32(0.0, -0.0).is_sign_negative());
        assert!(fmax32(0.0, -0.0).is_sign_positive());
        assert_eq!(fmin64(1.0, 2.0), 1.0);
    }

    #[test]
    fn nearest_ties_to_even() {
        assert_eq!(fnearest32(2.5), 2.0);
        assert_eq!(fnearest32(3.5), 4.0);
        assert_eq!(fnearest64(-0.5), -0.0);
    }

    #[test]
    fn pack_unpack() {
        let packed = pack_val(&StorageType::I8, Value::I32(255));
        assert_eq!(packed, Value::I32(255));
        assert_eq!(unpack_val(&StorageType::I8, packed.clone(), Some(Sign::U)), Value::I32(255));
        assert_eq!(unpack_val(&StorageType::I8, packed, Some(Sign::S)), Value::I32(-1));
        let packed = pack_val(&StorageType::I16, Value::I32(-1));
        assert_eq!(packed, Value::I32(0xFFFF));
        assert_eq!(unpack_val(&StorageType::I16, packed, Some(Sign::S)), Value::I32(-1));
    }
}
