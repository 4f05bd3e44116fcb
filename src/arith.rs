// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Width-checked integer arithmetic, bignum delegation and explicit
//! `__to` conversions (spec §4.E).

use crate::error::{PanicKind, VmError, VmResult};
use crate::layout::{TypeKind, Width};
use crate::module::BinOp;

/// Sign-extends / masks a raw `i64` payload to the declared width and
/// signedness, so stored bit patterns always round-trip through
/// `Value::Int`.
pub fn mask_signed(v: i64, width: Width) -> i64 {
    if width.bits() == 64 {
        return v;
    }
    let bits = width.bits();
    let mask = (1i64 << bits) - 1;
    let truncated = v & mask;
    let sign_bit = 1i64 << (bits - 1);
    if truncated & sign_bit != 0 {
        truncated - (1i64 << bits)
    } else {
        truncated
    }
}

pub fn mask_unsigned(v: u64, width: Width) -> u64 {
    v & width.mask()
}

fn signed_bounds(width: Width) -> (i64, i64) {
    match width {
        Width::W8 => (i8::MIN as i64, i8::MAX as i64),
        Width::W16 => (i16::MIN as i64, i16::MAX as i64),
        Width::W32 => (i32::MIN as i64, i32::MAX as i64),
        Width::W64 | Width::Any => (i64::MIN, i64::MAX),
    }
}

fn unsigned_bounds(width: Width) -> (u64, u64) {
    match width {
        Width::W8 => (0, u8::MAX as u64),
        Width::W16 => (0, u16::MAX as u64),
        Width::W32 => (0, u32::MAX as u64),
        Width::W64 | Width::Any => (0, u64::MAX),
    }
}

/// Checked signed integer arithmetic at a declared width. `MIN / -1`
/// is the one case `checked_div` already rejects as overflow.
pub fn signed_binop(op: BinOp, l: i64, r: i64, width: Width) -> VmResult<i64> {
    let (lo, hi) = signed_bounds(width);
    let overflow = || VmError::new(PanicKind::IntOverflow, format!("signed {:?} overflow at width {:?}", op, width));
    let checked = match op {
        BinOp::Add => l.checked_add(r),
        BinOp::Sub => l.checked_sub(r),
        BinOp::Mul => l.checked_mul(r),
        BinOp::Div => {
            if r == 0 {
                return Err(VmError::new(PanicKind::DivisionByZero, "integer division by zero"));
            }
            l.checked_div(r)
        }
        BinOp::Rem => {
            if r == 0 {
                return Err(VmError::new(PanicKind::DivisionByZero, "integer remainder by zero"));
            }
            l.checked_rem(r)
        }
        BinOp::BitAnd => Some(l & r),
        BinOp::BitOr => Some(l | r),
        BinOp::BitXor => Some(l ^ r),
        BinOp::Shl => return shift(op, l, r, width, true),
        BinOp::Shr => return shift(op, l, r, width, true),
        _ => return Err(VmError::new(PanicKind::NumericOpTypeMismatch, "not an arithmetic op")),
    };
    let v = checked.ok_or_else(overflow)?;
    if v < lo || v > hi {
        return Err(overflow());
    }
    Ok(v)
}

/// Checked unsigned integer arithmetic: subtraction underflow panics,
/// multiplication with nonzero high bits panics, right shift is
/// logical (spec §4.E).
pub fn unsigned_binop(op: BinOp, l: u64, r: u64, width: Width) -> VmResult<u64> {
    let (_, hi) = unsigned_bounds(width);
    let overflow =
        || VmError::new(PanicKind::IntOverflow, format!("unsigned {:?} overflow at width {:?}", op, width));
    let v = match op {
        BinOp::Add => l.checked_add(r).ok_or_else(overflow)?,
        BinOp::Sub => l.checked_sub(r).ok_or_else(overflow)?,
        BinOp::Mul => {
            let wide = (l as u128) * (r as u128);
            if wide > hi as u128 {
                return Err(overflow());
            }
            wide as u64
        }
        BinOp::Div => {
            if r == 0 {
                return Err(VmError::new(PanicKind::DivisionByZero, "integer division by zero"));
            }
            l / r
        }
        BinOp::Rem => {
            if r == 0 {
                return Err(VmError::new(PanicKind::DivisionByZero, "integer remainder by zero"));
            }
            l % r
        }
        BinOp::BitAnd => l & r,
        BinOp::BitOr => l | r,
        BinOp::BitXor => l ^ r,
        BinOp::Shl => return shift_unsigned(op, l, r, width),
        BinOp::Shr => return shift_unsigned(op, l, r, width),
        _ => return Err(VmError::new(PanicKind::NumericOpTypeMismatch, "not an arithmetic op")),
    };
    if v > hi {
        return Err(overflow());
    }
    Ok(v)
}

/// Shift count out of `[0, width)` panics `IntOverflow` (spec §8
/// universal invariant).
fn shift(op: BinOp, l: i64, r: i64, width: Width, _signed: bool) -> VmResult<i64> {
    let bits = width.bits() as i64;
    if r < 0 || r >= bits {
        return Err(VmError::new(PanicKind::IntOverflow, format!("shift count {} out of [0, {})", r, bits)));
    }
    match op {
        BinOp::Shl => {
            let (lo, hi) = signed_bounds(width);
            let v = l.checked_shl(r as u32).ok_or_else(|| {
                VmError::new(PanicKind::IntOverflow, "left shift overflow")
            })?;
            if v < lo || v > hi {
                return Err(VmError::new(PanicKind::IntOverflow, "left shift overflow"));
            }
            Ok(v)
        }
        BinOp::Shr => Ok(l >> r),
        _ => unreachable!(),
    }
}

fn shift_unsigned(op: BinOp, l: u64, r: u64, width: Width) -> VmResult<u64> {
    let bits = width.bits() as u64;
    if r >= bits {
        return Err(VmError::new(PanicKind::IntOverflow, format!("shift count {} out of [0, {})", r, bits)));
    }
    match op {
        BinOp::Shl => {
            let (_, hi) = unsigned_bounds(width);
            let v = l << r;
            if v > hi {
                return Err(VmError::new(PanicKind::IntOverflow, "left shift overflow"));
            }
            Ok(v)
        }
        BinOp::Shr => Ok(l >> r),
        _ => unreachable!(),
    }
}

/// Range-checks an `i64` as the source for a narrower destination
/// width/signedness (used by `__to` int/uint conversions).
pub fn range_check_to_signed(v: i64, width: Width) -> VmResult<i64> {
    let (lo, hi) = signed_bounds(width);
    if v < lo || v > hi {
        return Err(VmError::new(PanicKind::InvalidNumericConversion, format!("{} out of range for width {:?}", v, width)));
    }
    Ok(v)
}

pub fn range_check_to_unsigned(v: i64, width: Width) -> VmResult<u64> {
    if v < 0 {
        return Err(VmError::new(PanicKind::InvalidNumericConversion, "negative value cannot convert to unsigned"));
    }
    let (_, hi) = unsigned_bounds(width);
    let v = v as u64;
    if v > hi {
        return Err(VmError::new(PanicKind::InvalidNumericConversion, format!("{} out of range for width {:?}", v, width)));
    }
    Ok(v)
}

pub fn width_of(kind: &TypeKind) -> Option<Width> {
    match kind {
        TypeKind::Int(w) | TypeKind::Uint(w) | TypeKind::Float(w) => Some(*w),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_min_div_neg_one_overflows() {
        let err = signed_binop(BinOp::Div, i64::MIN, -1, Width::W64).unwrap_err();
        assert_eq!(err.kind, PanicKind::IntOverflow);
    }

    #[test]
    fn signed_add_overflow_at_width8() {
        let err = signed_binop(BinOp::Add, 127, 1, Width::W8).unwrap_err();
        assert_eq!(err.kind, PanicKind::IntOverflow);
    }

    #[test]
    fn unsigned_sub_underflow_panics() {
        let err = unsigned_binop(BinOp::Sub, 0, 1, Width::W32).unwrap_err();
        assert_eq!(err.kind, PanicKind::IntOverflow);
    }

    #[test]
    fn unsigned_mul_high_bits_nonzero_panics() {
        let err = unsigned_binop(BinOp::Mul, 200, 200, Width::W8).unwrap_err();
        assert_eq!(err.kind, PanicKind::IntOverflow);
    }

    #[test]
    fn division_by_zero_panics() {
        let err = signed_binop(BinOp::Div, 1, 0, Width::W64).unwrap_err();
        assert_eq!(err.kind, PanicKind::DivisionByZero);
    }

    #[test]
    fn shift_count_out_of_range_panics() {
        let err = signed_binop(BinOp::Shl, 1, 64, Width::W64).unwrap_err();
        assert_eq!(err.kind, PanicKind::IntOverflow);
        let err = signed_binop(BinOp::Shl, 1, -1, Width::W64).unwrap_err();
        assert_eq!(err.kind, PanicKind::IntOverflow);
    }

    #[test]
    fn shr_is_logical_for_unsigned() {
        let v = unsigned_binop(BinOp::Shr, u64::MAX, 4, Width::W64).unwrap();
        assert_eq!(v, u64::MAX >> 4);
    }
}
