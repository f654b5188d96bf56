//! Arbitrary-precision binary floating point.
//!
//! [`FloatNum`] stores a sign, a binary exponent, and a big-integer
//! mantissa, so parsing and negation lose nothing; precision is only
//! surrendered when rendering to an IEEE 754 format.  Supported output
//! formats are single (32-bit), double (64-bit), and x87 extended
//! (80-bit, explicit integer bit).
//!
//! Rounding is round-to-nearest, ties-to-even.  Overflow renders
//! infinity and underflow renders zero, each with a warning returned to
//! the caller; subnormal outputs are not generated.

use alloc::format;
use alloc::string::String;
use core::fmt;

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};

use crate::error::AsmError;
use crate::op::Op;

/// Working precision (bits) for decimal conversion; comfortably more
/// than the 64-bit mantissa of the widest output format.
const PREC: u64 = 80;

/// IEEE 754 output format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FloatFormat {
    /// 32-bit single precision.
    Single,
    /// 64-bit double precision.
    Double,
    /// 80-bit x87 extended precision (explicit integer bit).
    Extended,
}

impl FloatFormat {
    /// Output size in bytes.
    pub fn size(self) -> usize {
        match self {
            FloatFormat::Single => 4,
            FloatFormat::Double => 8,
            FloatFormat::Extended => 10,
        }
    }

    /// (exponent bits, mantissa bits incl. integer bit, bias, explicit
    /// integer bit).
    fn params(self) -> (u32, u64, i64, bool) {
        match self {
            FloatFormat::Single => (8, 24, 127, false),
            FloatFormat::Double => (11, 53, 1023, false),
            FloatFormat::Extended => (15, 64, 16383, true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
enum Class {
    Zero,
    Normal,
    Infinity,
    Nan,
}

/// An arbitrary-precision binary float: `(-1)^sign × mant × 2^exp`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FloatNum {
    sign: bool,
    exp: i64,
    mant: BigUint,
    class: Class,
}

impl FloatNum {
    fn special(class: Class, sign: bool) -> Self {
        FloatNum {
            sign,
            exp: 0,
            mant: BigUint::zero(),
            class,
        }
    }

    /// Positive zero.
    pub fn zero() -> Self {
        Self::special(Class::Zero, false)
    }

    /// Construct from raw components; trailing zero mantissa bits are
    /// normalized away so structural equality matches value equality.
    pub fn from_parts(sign: bool, mant: BigUint, exp: i64) -> Self {
        if mant.is_zero() {
            return Self::special(Class::Zero, sign);
        }
        let mut f = FloatNum {
            sign,
            exp,
            mant,
            class: Class::Normal,
        };
        f.normalize();
        f
    }

    fn normalize(&mut self) {
        let drop = self.mant.trailing_zeros().unwrap_or(0);
        if drop > 0 {
            self.mant >>= drop;
            self.exp += drop as i64;
        }
    }

    /// Construct from an `f64`, exactly.
    pub fn from_f64(v: f64) -> Self {
        let bits = v.to_bits();
        let sign = bits >> 63 != 0;
        let e = ((bits >> 52) & 0x7FF) as i64;
        let frac = bits & 0x000F_FFFF_FFFF_FFFF;
        match e {
            0 => Self::from_parts(sign, BigUint::from(frac), -1074),
            0x7FF if frac == 0 => Self::special(Class::Infinity, sign),
            0x7FF => Self::special(Class::Nan, sign),
            _ => Self::from_parts(
                sign,
                BigUint::from(frac | (1u64 << 52)),
                e - 1075,
            ),
        }
    }

    /// Parse a decimal floating constant: `[+-]digits[.digits][eE[+-]digits]`.
    pub fn from_decimal_str(s: &str) -> Result<Self, AsmError> {
        let err = || AsmError::Value {
            msg: format!("invalid floating point constant '{}'", s),
            line: 0,
        };
        let mut chars = s.as_bytes();
        let mut sign = false;
        if let Some(&c) = chars.first() {
            if c == b'+' || c == b'-' {
                sign = c == b'-';
                chars = &chars[1..];
            }
        }
        let mut digits = String::new();
        let mut frac_digits: i64 = 0;
        let mut dec_exp: i64 = 0;
        let mut i = 0;
        while i < chars.len() && chars[i].is_ascii_digit() {
            digits.push(chars[i] as char);
            i += 1;
        }
        if i < chars.len() && chars[i] == b'.' {
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                digits.push(chars[i] as char);
                frac_digits += 1;
                i += 1;
            }
        }
        if digits.is_empty() {
            return Err(err());
        }
        if i < chars.len() && (chars[i] == b'e' || chars[i] == b'E') {
            i += 1;
            let mut exp_sign = 1i64;
            if i < chars.len() && (chars[i] == b'+' || chars[i] == b'-') {
                exp_sign = if chars[i] == b'-' { -1 } else { 1 };
                i += 1;
            }
            let start = i;
            let mut e: i64 = 0;
            while i < chars.len() && chars[i].is_ascii_digit() {
                e = e.saturating_mul(10).saturating_add(i64::from(chars[i] - b'0'));
                i += 1;
            }
            if i == start {
                return Err(err());
            }
            dec_exp = exp_sign * e;
        }
        if i != chars.len() {
            return Err(err());
        }

        let d = digits
            .parse::<BigUint>()
            .map_err(|_| err())?;
        if d.is_zero() {
            return Ok(Self::special(Class::Zero, sign));
        }
        let power = dec_exp - frac_digits;
        if power >= 0 {
            let n = d * BigUint::from(10u8).pow(power as u32);
            Ok(Self::from_parts(sign, n, 0))
        } else {
            // Scaled division with a sticky low bit: enough extra
            // precision that the final per-format rounding is exact.
            let den = BigUint::from(10u8).pow((-power) as u32);
            let shift = PREC + 2 + den.bits().saturating_sub(d.bits());
            let num = d << shift;
            let q = &num / &den;
            let r = num - &q * &den;
            let q = if r.is_zero() { q } else { q | BigUint::one() };
            Ok(Self::from_parts(sign, q, -(shift as i64)))
        }
    }

    /// True for (positive or negative) zero.
    pub fn is_zero(&self) -> bool {
        self.class == Class::Zero
    }

    /// In-place calculation.  Only negation is defined on floats; any
    /// other operator is a value error.
    pub fn calc(&mut self, op: Op) -> Result<(), AsmError> {
        match op {
            Op::Ident => Ok(()),
            Op::Neg => {
                self.sign = !self.sign;
                Ok(())
            }
            _ => Err(AsmError::Value {
                msg: format!("invalid floating point operation '{}'", op),
                line: 0,
            }),
        }
    }

    /// Render into `buf` (little-endian, exactly `format.size()` bytes).
    /// Returns a warning message on overflow/underflow.
    pub fn to_bytes(
        &self,
        buf: &mut [u8],
        format: FloatFormat,
    ) -> Result<Option<&'static str>, AsmError> {
        let size = format.size();
        if buf.len() != size {
            return Err(AsmError::Internal {
                msg: format!(
                    "float destination is {} bytes, format needs {}",
                    buf.len(),
                    size
                ),
                line: 0,
            });
        }
        let (ebits, mbits, bias, explicit_int) = format.params();
        let frac_bits = if explicit_int { mbits } else { mbits - 1 };
        let exp_max = (1i64 << ebits) - 1;

        let assemble = |buf: &mut [u8], frac: BigUint, biased: i64, sign: bool| {
            let mut word = frac;
            word |= BigUint::from(biased as u64) << frac_bits;
            if sign {
                word |= BigUint::one() << (frac_bits + u64::from(ebits));
            }
            let bytes = word.to_bytes_le();
            for (i, out) in buf.iter_mut().enumerate() {
                *out = bytes.get(i).copied().unwrap_or(0);
            }
        };

        match self.class {
            Class::Zero => {
                assemble(buf, BigUint::zero(), 0, self.sign);
                return Ok(None);
            }
            Class::Infinity | Class::Nan => {
                let mut frac = if explicit_int {
                    BigUint::one() << (mbits - 1)
                } else {
                    BigUint::zero()
                };
                if self.class == Class::Nan {
                    let quiet = if explicit_int { frac_bits - 2 } else { frac_bits - 1 };
                    frac |= BigUint::one() << quiet;
                }
                assemble(buf, frac, exp_max, self.sign);
                return Ok(None);
            }
            Class::Normal => {}
        }

        let nbits = self.mant.bits();
        let mut e = self.exp + nbits as i64 - 1;
        let mut m;
        if nbits > mbits {
            let shift = nbits - mbits;
            m = &self.mant >> shift;
            let rem = &self.mant - (&m << shift);
            let half = BigUint::one() << (shift - 1);
            if rem > half || (rem == half && m.bit(0)) {
                m += BigUint::one();
                if m.bits() > mbits {
                    m >>= 1u32;
                    e += 1;
                }
            }
        } else {
            m = &self.mant << (mbits - nbits);
        }

        let biased = e + bias;
        if biased >= exp_max {
            // Overflow: render infinity.
            let frac = if explicit_int {
                BigUint::one() << (mbits - 1)
            } else {
                BigUint::zero()
            };
            assemble(buf, frac, exp_max, self.sign);
            return Ok(Some("floating point overflow"));
        }
        if biased <= 0 {
            assemble(buf, BigUint::zero(), 0, self.sign);
            return Ok(Some("floating point underflow"));
        }

        let frac = if explicit_int {
            m
        } else {
            m - (BigUint::one() << (mbits - 1))
        };
        assemble(buf, frac, biased, self.sign);
        Ok(None)
    }

    /// Lossy conversion back to `f64` (for diagnostics).
    pub fn to_f64(&self) -> f64 {
        let v = match self.class {
            Class::Zero => 0.0,
            Class::Infinity => f64::INFINITY,
            Class::Nan => f64::NAN,
            Class::Normal => {
                let m = self.mant.to_f64().unwrap_or(f64::INFINITY);
                m * libm_exp2(self.exp)
            }
        };
        if self.sign {
            -v
        } else {
            v
        }
    }
}

/// Minimal 2^n for i64 exponents without pulling in libm.
fn libm_exp2(n: i64) -> f64 {
    if n >= 1024 {
        f64::INFINITY
    } else if n <= -1075 {
        0.0
    } else if n >= -1022 {
        f64::from_bits(((n + 1023) as u64) << 52)
    } else {
        // Subnormal range.
        f64::from_bits(1u64 << (n + 1074))
    }
}

impl From<f64> for FloatNum {
    fn from(v: f64) -> Self {
        FloatNum::from_f64(v)
    }
}

impl fmt::Display for FloatNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            Class::Zero => write!(f, "{}0.0", if self.sign { "-" } else { "" }),
            Class::Infinity => write!(f, "{}inf", if self.sign { "-" } else { "" }),
            Class::Nan => write!(f, "nan"),
            Class::Normal => write!(f, "{}", self.to_f64()),
        }
    }
}
