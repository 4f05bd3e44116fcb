// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Delegation to the (out-of-scope, per spec §1) exact-arithmetic
//! bignum library. `num-bigint` stands in for that library; this
//! module's only job is translating its failure modes into the VM's
//! stable panic taxonomy (spec §4.E).

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{Signed, ToPrimitive, Zero};

use crate::error::{PanicKind, VmError, VmResult};
use crate::layout::Width;
use crate::module::BinOp;

/// The bignum library never grows a value past this many 64-bit limbs
/// (an arbitrary, documented ceiling standing in for whatever limit
/// the real kernel enforces).
const MAX_LIMBS: usize = 256;

fn check_limbs(v: &BigInt) -> VmResult<()> {
    let (_, bytes) = v.to_bytes_le();
    if bytes.len() > MAX_LIMBS * 8 {
        return Err(VmError::new(PanicKind::NumericSizeLimitExceeded, "bignum exceeded the maximum limb count"));
    }
    Ok(())
}

pub fn limbs_to_bigint(limbs: &[u64], sign: Sign) -> BigInt {
    let mut bytes = Vec::with_capacity(limbs.len() * 8);
    for limb in limbs {
        bytes.extend_from_slice(&limb.to_le_bytes());
    }
    BigInt::from_bytes_le(sign, &bytes)
}

pub fn bigint_to_limbs(v: &BigInt) -> (Vec<u64>, Sign) {
    let (sign, bytes) = v.to_bytes_le();
    let mut limbs = Vec::with_capacity(bytes.len().div_ceil(8));
    for chunk in bytes.chunks(8) {
        let mut buf = [0u8; 8];
        buf[..chunk.len()].copy_from_slice(chunk);
        limbs.push(u64::from_le_bytes(buf));
    }
    (limbs, sign)
}

pub fn bigint_binop(op: BinOp, l: &BigInt, r: &BigInt) -> VmResult<BigInt> {
    let result = match op {
        BinOp::Add => l + r,
        BinOp::Sub => l - r,
        BinOp::Mul => l * r,
        BinOp::Div => {
            if r.is_zero() {
                return Err(VmError::new(PanicKind::DivisionByZero, "bigint division by zero"));
            }
            l / r
        }
        BinOp::Rem => {
            if r.is_zero() {
                return Err(VmError::new(PanicKind::DivisionByZero, "bigint remainder by zero"));
            }
            l % r
        }
        BinOp::BitAnd => l & r,
        BinOp::BitOr => l | r,
        BinOp::BitXor => l ^ r,
        _ => return Err(VmError::new(PanicKind::NumericOpTypeMismatch, "unsupported bigint op")),
    };
    check_limbs(&result)?;
    Ok(result)
}

pub fn biguint_binop(op: BinOp, l: &BigUint, r: &BigUint) -> VmResult<BigUint> {
    let result = match op {
        BinOp::Add => l + r,
        BinOp::Sub => {
            if l < r {
                return Err(VmError::new(PanicKind::InvalidNumericConversion, "biguint subtraction underflow"));
            }
            l - r
        }
        BinOp::Mul => l * r,
        BinOp::Div => {
            if r.is_zero() {
                return Err(VmError::new(PanicKind::DivisionByZero, "biguint division by zero"));
            }
            l / r
        }
        BinOp::Rem => {
            if r.is_zero() {
                return Err(VmError::new(PanicKind::DivisionByZero, "biguint remainder by zero"));
            }
            l % r
        }
        BinOp::BitAnd => l & r,
        BinOp::BitOr => l | r,
        BinOp::BitXor => l ^ r,
        _ => return Err(VmError::new(PanicKind::NumericOpTypeMismatch, "unsupported biguint op")),
    };
    let signed = BigInt::from(result.clone());
    check_limbs(&signed)?;
    Ok(result)
}

/// Parses a decimal string into a `BigInt`, mapping parse failure to
/// `TypeMismatch` (spec §4.E "Parsing failures on string sources
/// panic `TypeMismatch`").
pub fn parse_bigint(s: &str) -> VmResult<BigInt> {
    s.trim()
        .parse::<BigInt>()
        .map_err(|e| VmError::new(PanicKind::TypeMismatch, format!("cannot parse `{}` as integer: {}", s, e)))
}

pub fn parse_biguint(s: &str) -> VmResult<BigUint> {
    s.trim()
        .parse::<BigUint>()
        .map_err(|e| VmError::new(PanicKind::TypeMismatch, format!("cannot parse `{}` as unsigned integer: {}", s, e)))
}

/// `checkFloatWidth`: enforces the declared width of the destination
/// by round-tripping through the narrower IEEE representation.
pub fn check_float_width(v: f64, width: Width) -> VmResult<f64> {
    match width {
        Width::W32 => {
            let narrowed = v as f32;
            if narrowed.is_infinite() && v.is_finite() {
                return Err(VmError::new(PanicKind::InvalidNumericConversion, "float exceeds 32-bit range"));
            }
            Ok(narrowed as f64)
        }
        Width::W64 | Width::Any => Ok(v),
        Width::W8 | Width::W16 => Err(VmError::new(PanicKind::FloatUnsupported, "no 8/16-bit float representation")),
    }
}

/// Bignum-to-machine-integer narrowing for a fixed destination width
/// (spec "to int/uint of WidthAny: uses bignum representation").
pub fn bigint_to_i64_checked(v: &BigInt) -> VmResult<i64> {
    v.to_i64()
        .ok_or_else(|| VmError::new(PanicKind::InvalidNumericConversion, "bigint does not fit in i64"))
}

pub fn bigint_to_f64(v: &BigInt) -> f64 {
    v.to_f64().unwrap_or(if v.is_negative() { f64::NEG_INFINITY } else { f64::INFINITY })
}

/// Canonical decimal form, used for map keys that don't fit a machine
/// word (spec §4.G) and for `__to string` on bignums (spec §4.E).
pub fn bigint_to_decimal(v: &BigInt) -> String {
    v.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn division_by_zero_is_stable_code() {
        let l = BigInt::from(10);
        let r = BigInt::from(0);
        let err = bigint_binop(BinOp::Div, &l, &r).unwrap_err();
        assert_eq!(err.kind, PanicKind::DivisionByZero);
    }

    #[test]
    fn biguint_subtraction_underflow_is_invalid_conversion() {
        let l = BigUint::from(1u32);
        let r = BigUint::from(2u32);
        let err = biguint_binop(BinOp::Sub, &l, &r).unwrap_err();
        assert_eq!(err.kind, PanicKind::InvalidNumericConversion);
    }

    #[test]
    fn parse_failure_is_type_mismatch() {
        let err = parse_bigint("not-a-number").unwrap_err();
        assert_eq!(err.kind, PanicKind::TypeMismatch);
    }

    #[test]
    fn decimal_round_trip() {
        let v = BigInt::from(123456789i64);
        assert_eq!(bigint_to_decimal(&v), "123456789");
    }
}
