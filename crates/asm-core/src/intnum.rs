//! Arbitrary-precision integers and the algebraic operator kernel.
//!
//! [`IntNum`] transparently switches between an inline machine word and a
//! heap-allocated big integer: results that fit in an `i64` always use the
//! inline representation (canonical form), so equality and ordering never
//! depend on how a value was produced.
//!
//! Unsigned operators (`Div`, `Mod`, `Shr` on non-negative values)
//! interpret an inline word as its 64-bit two's-complement reinterpretation;
//! a heap-allocated negative has no fixed width and is rejected in unsigned
//! contexts.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{ToPrimitive, Zero};

use crate::error::AsmError;
use crate::op::Op;

/// Largest accepted shift count; anything bigger is a value error rather
/// than an allocation of absurd size.
const MAX_SHIFT: u64 = 0x10_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
enum Repr {
    Small(i64),
    Big(Box<BigInt>),
}

/// An arbitrary-precision integer value.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IntNum(Repr);

/// Interpretation used by [`IntNum::ok_size`] range checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RangeType {
    /// Value must fit as an unsigned integer of the given width.
    Unsigned,
    /// Value must fit as a signed integer of the given width.
    Signed,
    /// Value must fit under either interpretation.
    Either,
}

impl IntNum {
    /// Create from a machine word.
    pub fn new(v: i64) -> Self {
        IntNum(Repr::Small(v))
    }

    /// Create from a big integer, demoting to the inline representation
    /// when the value fits.
    pub fn from_bigint(b: BigInt) -> Self {
        match b.to_i64() {
            Some(v) => IntNum(Repr::Small(v)),
            None => IntNum(Repr::Big(Box::new(b))),
        }
    }

    fn from_i128(v: i128) -> Self {
        match i64::try_from(v) {
            Ok(s) => IntNum(Repr::Small(s)),
            Err(_) => IntNum(Repr::Big(Box::new(BigInt::from(v)))),
        }
    }

    /// The value as a big integer (cloning the magnitude).
    pub fn to_bigint(&self) -> BigInt {
        match &self.0 {
            Repr::Small(v) => BigInt::from(*v),
            Repr::Big(b) => (**b).clone(),
        }
    }

    fn small(&self) -> Option<i64> {
        match &self.0 {
            Repr::Small(v) => Some(*v),
            Repr::Big(_) => None,
        }
    }

    /// The unsigned interpretation: inline words reinterpret as `u64`,
    /// big integers must be non-negative.
    fn unsigned_view(&self) -> Result<BigUint, AsmError> {
        match &self.0 {
            Repr::Small(v) => Ok(BigUint::from(*v as u64)),
            Repr::Big(b) => match b.sign() {
                Sign::Minus => Err(AsmError::Value {
                    msg: "cannot interpret wide negative value as unsigned".into(),
                    line: 0,
                }),
                _ => Ok(b.magnitude().clone()),
            },
        }
    }

    /// True if the value is zero.
    pub fn is_zero(&self) -> bool {
        matches!(&self.0, Repr::Small(0))
    }

    /// True if the value is +1.
    pub fn is_pos1(&self) -> bool {
        matches!(&self.0, Repr::Small(1))
    }

    /// True if the value is -1.
    pub fn is_neg1(&self) -> bool {
        matches!(&self.0, Repr::Small(-1))
    }

    /// Sign of the value: -1, 0, or +1.
    pub fn sign(&self) -> i32 {
        match &self.0 {
            Repr::Small(v) => match v.cmp(&0) {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            },
            Repr::Big(b) => match b.sign() {
                Sign::Minus => -1,
                Sign::NoSign => 0,
                Sign::Plus => 1,
            },
        }
    }

    /// The value as an `i64`, if it fits.
    pub fn to_i64(&self) -> Option<i64> {
        self.small()
    }

    /// The value as a `u64`, if it fits.
    pub fn to_u64(&self) -> Option<u64> {
        match &self.0 {
            Repr::Small(v) => u64::try_from(*v).ok(),
            Repr::Big(b) => b.to_u64(),
        }
    }

    fn cmp_value(&self, other: &IntNum) -> Ordering {
        match (&self.0, &other.0) {
            (Repr::Small(a), Repr::Small(b)) => a.cmp(b),
            // Canonical form: Big is always outside the i64 range.
            (Repr::Small(_), Repr::Big(b)) => match b.sign() {
                Sign::Minus => Ordering::Greater,
                _ => Ordering::Less,
            },
            (Repr::Big(a), Repr::Small(_)) => match a.sign() {
                Sign::Minus => Ordering::Less,
                _ => Ordering::Greater,
            },
            (Repr::Big(a), Repr::Big(b)) => a.cmp(b),
        }
    }

    /// In-place calculation: `self = self <op> rhs`.
    ///
    /// Unary operators ignore `rhs`; binary operators require it.
    /// Division and modulo by zero report an error instead of panicking.
    pub fn calc(&mut self, op: Op, rhs: Option<&IntNum>) -> Result<(), AsmError> {
        // Unary operators first; they never need a right-hand side.
        match op {
            Op::Ident => return Ok(()),
            Op::Neg => {
                *self = match self.small() {
                    Some(v) => match v.checked_neg() {
                        Some(n) => IntNum::new(n),
                        None => IntNum::from_bigint(-self.to_bigint()),
                    },
                    None => IntNum::from_bigint(-self.to_bigint()),
                };
                return Ok(());
            }
            Op::Not => {
                *self = match self.small() {
                    Some(v) => IntNum::new(!v),
                    None => IntNum::from_bigint(-(self.to_bigint() + 1i32)),
                };
                return Ok(());
            }
            Op::Lnot => {
                *self = IntNum::new(i64::from(self.is_zero()));
                return Ok(());
            }
            _ => {}
        }

        let rhs = rhs.ok_or_else(|| AsmError::Internal {
            msg: format!("operator '{}' requires two operands", op),
            line: 0,
        })?;

        let small_pair = match (self.small(), rhs.small()) {
            (Some(a), Some(b)) => Some((a, b)),
            _ => None,
        };

        let result = match op {
            Op::Add => match small_pair {
                Some((a, b)) => IntNum::from_i128(a as i128 + b as i128),
                None => IntNum::from_bigint(self.to_bigint() + rhs.to_bigint()),
            },
            Op::Sub => match small_pair {
                Some((a, b)) => IntNum::from_i128(a as i128 - b as i128),
                None => IntNum::from_bigint(self.to_bigint() - rhs.to_bigint()),
            },
            Op::Mul => match small_pair {
                Some((a, b)) => IntNum::from_i128(a as i128 * b as i128),
                None => IntNum::from_bigint(self.to_bigint() * rhs.to_bigint()),
            },
            Op::Div => {
                if rhs.is_zero() {
                    return Err(AsmError::DivideByZero { line: 0 });
                }
                match small_pair {
                    Some((a, b)) => {
                        IntNum::from_bigint(BigInt::from((a as u64) / (b as u64)))
                    }
                    None => IntNum::from_bigint(BigInt::from(
                        self.unsigned_view()? / rhs.unsigned_view()?,
                    )),
                }
            }
            Op::Mod => {
                if rhs.is_zero() {
                    return Err(AsmError::DivideByZero { line: 0 });
                }
                match small_pair {
                    Some((a, b)) => {
                        IntNum::from_bigint(BigInt::from((a as u64) % (b as u64)))
                    }
                    None => IntNum::from_bigint(BigInt::from(
                        self.unsigned_view()? % rhs.unsigned_view()?,
                    )),
                }
            }
            Op::SignDiv => {
                if rhs.is_zero() {
                    return Err(AsmError::DivideByZero { line: 0 });
                }
                match small_pair {
                    Some((a, b)) => IntNum::from_i128(a as i128 / b as i128),
                    None => IntNum::from_bigint(self.to_bigint() / rhs.to_bigint()),
                }
            }
            Op::SignMod => {
                if rhs.is_zero() {
                    return Err(AsmError::DivideByZero { line: 0 });
                }
                match small_pair {
                    Some((a, b)) => IntNum::from_i128(a as i128 % b as i128),
                    None => IntNum::from_bigint(self.to_bigint() % rhs.to_bigint()),
                }
            }
            Op::And => match small_pair {
                Some((a, b)) => IntNum::new(a & b),
                None => IntNum::from_bigint(self.to_bigint() & rhs.to_bigint()),
            },
            Op::Or => match small_pair {
                Some((a, b)) => IntNum::new(a | b),
                None => IntNum::from_bigint(self.to_bigint() | rhs.to_bigint()),
            },
            Op::Xor => match small_pair {
                Some((a, b)) => IntNum::new(a ^ b),
                None => IntNum::from_bigint(self.to_bigint() ^ rhs.to_bigint()),
            },
            Op::Xnor => match small_pair {
                Some((a, b)) => IntNum::new(!(a ^ b)),
                None => {
                    IntNum::from_bigint(-((self.to_bigint() ^ rhs.to_bigint()) + 1i32))
                }
            },
            Op::Nor => match small_pair {
                Some((a, b)) => IntNum::new(!(a | b)),
                None => {
                    IntNum::from_bigint(-((self.to_bigint() | rhs.to_bigint()) + 1i32))
                }
            },
            Op::Shl => {
                let count = self.shift_count(rhs)?;
                match self.small() {
                    // Inline only when the result provably fits an i64.
                    Some(v) if v == 0 => IntNum::new(0),
                    Some(v)
                        if count < 63
                            && (64 - v.unsigned_abs().leading_zeros() as u64) + count
                                <= 62 =>
                    {
                        IntNum::new(v << count)
                    }
                    _ => IntNum::from_bigint(self.to_bigint() << count),
                }
            }
            Op::Shr => {
                let count = self.shift_count(rhs)?;
                match self.small() {
                    Some(v) => {
                        if count >= 64 {
                            IntNum::new(if v < 0 { -1 } else { 0 })
                        } else {
                            IntNum::new(v >> count)
                        }
                    }
                    // BigInt >> rounds toward negative infinity: an
                    // arithmetic shift for negative values.
                    None => IntNum::from_bigint(self.to_bigint() >> count),
                }
            }
            Op::Lor => IntNum::new(i64::from(!self.is_zero() || !rhs.is_zero())),
            Op::Land => IntNum::new(i64::from(!self.is_zero() && !rhs.is_zero())),
            Op::Lxor => IntNum::new(i64::from(!self.is_zero() != !rhs.is_zero())),
            Op::Lxnor => IntNum::new(i64::from(!self.is_zero() == !rhs.is_zero())),
            Op::Lnor => IntNum::new(i64::from(self.is_zero() && rhs.is_zero())),
            Op::Lt => IntNum::new(i64::from(self.cmp_value(rhs) == Ordering::Less)),
            Op::Gt => IntNum::new(i64::from(self.cmp_value(rhs) == Ordering::Greater)),
            Op::Le => IntNum::new(i64::from(self.cmp_value(rhs) != Ordering::Greater)),
            Op::Ge => IntNum::new(i64::from(self.cmp_value(rhs) != Ordering::Less)),
            Op::Ne => IntNum::new(i64::from(self != rhs)),
            Op::Eq => IntNum::new(i64::from(self == rhs)),
            Op::Seg | Op::Wrt | Op::SegOff => {
                return Err(AsmError::Value {
                    msg: format!("invalid use of '{}' on an integer", op),
                    line: 0,
                })
            }
            Op::Cond => {
                return Err(AsmError::Value {
                    msg: "conditional requires three terms".into(),
                    line: 0,
                })
            }
            // Unary operators were handled above.
            Op::Neg | Op::Not | Op::Lnot | Op::Ident => unreachable!(),
        };
        *self = result;
        Ok(())
    }

    fn shift_count(&self, rhs: &IntNum) -> Result<u64, AsmError> {
        match rhs.to_u64() {
            Some(c) if c <= MAX_SHIFT => Ok(c),
            _ => Err(AsmError::Value {
                msg: format!("invalid shift count {}", rhs),
                line: 0,
            }),
        }
    }

    /// Check whether the value, arithmetically shifted right by `rshift`,
    /// fits in `size` bits under the requested interpretation.
    pub fn ok_size(&self, size: u32, rshift: u32, range: RangeType) -> bool {
        if size == 0 {
            return self.is_zero();
        }
        let shifted = match &self.0 {
            Repr::Small(v) => IntNum::new(*v >> rshift.min(63)),
            Repr::Big(b) => IntNum::from_bigint((**b).clone() >> rshift),
        };
        match &shifted.0 {
            Repr::Small(v) => {
                let v = *v as i128;
                let fits_unsigned = v >= 0 && (size >= 64 || v < (1i128 << size));
                let fits_signed = size >= 65 || {
                    let half = 1i128 << (size - 1);
                    v >= -half && v < half
                };
                match range {
                    RangeType::Unsigned => fits_unsigned,
                    RangeType::Signed => fits_signed,
                    RangeType::Either => fits_unsigned || fits_signed,
                }
            }
            Repr::Big(b) => {
                let one = BigInt::from(1);
                let fits_unsigned =
                    b.sign() != Sign::Minus && **b < (one.clone() << size);
                let half = one << (size - 1);
                let fits_signed = **b >= -half.clone() && **b < half;
                match range {
                    RangeType::Unsigned => fits_unsigned,
                    RangeType::Signed => fits_signed,
                    RangeType::Either => fits_unsigned || fits_signed,
                }
            }
        }
    }

    /// Write the value little-endian into `buf`, two's-complement
    /// truncated or sign-extended to `buf.len()` bytes.
    pub fn write_le(&self, buf: &mut [u8]) {
        match &self.0 {
            Repr::Small(v) => {
                let bytes = v.to_le_bytes();
                let ext = if *v < 0 { 0xFF } else { 0x00 };
                for (i, out) in buf.iter_mut().enumerate() {
                    *out = if i < 8 { bytes[i] } else { ext };
                }
            }
            Repr::Big(b) => {
                let bytes = b.to_signed_bytes_le();
                let ext = if b.sign() == Sign::Minus { 0xFF } else { 0x00 };
                for (i, out) in buf.iter_mut().enumerate() {
                    *out = bytes.get(i).copied().unwrap_or(ext);
                }
            }
        }
    }

    /// Size in bytes of the LEB128 encoding.  Unsigned encoding of a
    /// negative value uses the magnitude (callers reject that case).
    pub fn size_leb128(&self, sign: bool) -> u64 {
        let bits = if sign {
            match &self.0 {
                Repr::Small(v) => {
                    let m = if *v < 0 { !*v } else { *v };
                    u64::from(64 - m.leading_zeros()) + 1
                }
                Repr::Big(b) => {
                    if b.sign() == Sign::Minus {
                        (-(**b).clone() - 1i32).bits() + 1
                    } else {
                        b.bits() + 1
                    }
                }
            }
        } else {
            match &self.0 {
                Repr::Small(v) => u64::from(64 - v.unsigned_abs().leading_zeros()).max(1),
                Repr::Big(b) => b.magnitude().bits().max(1),
            }
        };
        (bits + 6) / 7
    }

    /// Append the LEB128 encoding to `out`; returns the number of bytes
    /// written.
    pub fn write_leb128(&self, out: &mut Vec<u8>, sign: bool) -> u64 {
        let start = out.len();
        if sign {
            match &self.0 {
                Repr::Small(v) => {
                    let mut v = *v;
                    loop {
                        let byte = (v & 0x7F) as u8;
                        v >>= 7;
                        let done = (v == 0 && byte & 0x40 == 0)
                            || (v == -1 && byte & 0x40 != 0);
                        out.push(if done { byte } else { byte | 0x80 });
                        if done {
                            break;
                        }
                    }
                }
                Repr::Big(b) => {
                    let mut v = (**b).clone();
                    let mask = BigInt::from(0x7F);
                    let neg1 = BigInt::from(-1);
                    loop {
                        let byte = (&v & &mask).to_u8().unwrap_or(0);
                        v >>= 7u32;
                        let done = (v.is_zero() && byte & 0x40 == 0)
                            || (v == neg1 && byte & 0x40 != 0);
                        out.push(if done { byte } else { byte | 0x80 });
                        if done {
                            break;
                        }
                    }
                }
            }
        } else {
            match &self.0 {
                Repr::Small(v) => {
                    let mut v = v.unsigned_abs();
                    loop {
                        let byte = (v & 0x7F) as u8;
                        v >>= 7;
                        if v == 0 {
                            out.push(byte);
                            break;
                        }
                        out.push(byte | 0x80);
                    }
                }
                Repr::Big(b) => {
                    let mut v = b.magnitude().clone();
                    let mask = BigUint::from(0x7Fu8);
                    loop {
                        let byte = (&v & &mask).to_u8().unwrap_or(0);
                        v >>= 7u32;
                        if v.is_zero() {
                            out.push(byte);
                            break;
                        }
                        out.push(byte | 0x80);
                    }
                }
            }
        }
        (out.len() - start) as u64
    }
}

impl From<i64> for IntNum {
    fn from(v: i64) -> Self {
        IntNum::new(v)
    }
}

impl From<i32> for IntNum {
    fn from(v: i32) -> Self {
        IntNum::new(i64::from(v))
    }
}

impl From<u64> for IntNum {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(s) => IntNum::new(s),
            Err(_) => IntNum(Repr::Big(Box::new(BigInt::from(v)))),
        }
    }
}

impl From<u32> for IntNum {
    fn from(v: u32) -> Self {
        IntNum::new(i64::from(v))
    }
}

impl From<i128> for IntNum {
    fn from(v: i128) -> Self {
        IntNum::from_i128(v)
    }
}

impl PartialOrd for IntNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IntNum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_value(other)
    }
}

impl fmt::Display for IntNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Small(v) => write!(f, "{}", v),
            Repr::Big(b) => write!(f, "{}", b),
        }
    }
}
