//! The algebraic operator set shared by expressions and the numeric kernel.

use core::fmt;

/// Expression operator.
///
/// Unary operators carry exactly one term, non-associative binary
/// operators exactly two; associative operators may carry two or more
/// terms after leveling.  `Ident` marks a single-term identity wrapper,
/// `Cond` a three-term conditional (selector, if-true, if-false).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Op {
    /// Addition.
    Add,
    /// Subtraction (normalized away into `Add` + `Mul(-1, …)`).
    Sub,
    /// Multiplication.
    Mul,
    /// Unsigned division.
    Div,
    /// Signed division.
    SignDiv,
    /// Unsigned modulo.
    Mod,
    /// Signed modulo.
    SignMod,
    /// Arithmetic negation (normalized away into `Mul(-1, …)`).
    Neg,
    /// Bitwise NOT.
    Not,
    /// Bitwise OR.
    Or,
    /// Bitwise AND.
    And,
    /// Bitwise XOR.
    Xor,
    /// Bitwise XNOR.
    Xnor,
    /// Bitwise NOR.
    Nor,
    /// Shift left.
    Shl,
    /// Shift right (arithmetic when the value is negative).
    Shr,
    /// Logical OR (yields 0 or 1).
    Lor,
    /// Logical AND (yields 0 or 1).
    Land,
    /// Logical NOT (yields 0 or 1).
    Lnot,
    /// Logical XOR (yields 0 or 1).
    Lxor,
    /// Logical XNOR (yields 0 or 1).
    Lxnor,
    /// Logical NOR (yields 0 or 1).
    Lnor,
    /// Less than (yields 0 or 1).
    Lt,
    /// Greater than (yields 0 or 1).
    Gt,
    /// Less than or equal (yields 0 or 1).
    Le,
    /// Greater than or equal (yields 0 or 1).
    Ge,
    /// Not equal (yields 0 or 1).
    Ne,
    /// Equal (yields 0 or 1).
    Eq,
    /// Segment of an address (`SEG x`).
    Seg,
    /// Relocation base override (`x WRT sym`).
    Wrt,
    /// Segment:offset pair (`seg:off`).
    SegOff,
    /// Identity: a single-term wrapper.
    Ident,
    /// Three-term conditional: selector, if-true, if-false.
    Cond,
}

impl Op {
    /// Operators that carry exactly one term.
    pub fn is_unary(self) -> bool {
        matches!(self, Op::Neg | Op::Not | Op::Lnot | Op::Seg)
    }

    /// Operators that may carry more than two terms after leveling.
    pub fn is_associative(self) -> bool {
        matches!(
            self,
            Op::Add | Op::Mul | Op::And | Op::Or | Op::Xor | Op::Land | Op::Lor
        )
    }

    /// Operators whose term order does not affect the result; only these
    /// are canonicalized by a stable term sort.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Mul
                | Op::And
                | Op::Or
                | Op::Xor
                | Op::Xnor
                | Op::Nor
                | Op::Land
                | Op::Lor
                | Op::Lxor
                | Op::Lxnor
                | Op::Lnor
                | Op::Eq
                | Op::Ne
        )
    }

    /// Operators over integer values.  Non-numeric operators (`Seg`,
    /// `Wrt`, `SegOff`, `Ident`, `Cond`) are never constant-folded across.
    pub fn is_numeric(self) -> bool {
        !matches!(self, Op::Seg | Op::Wrt | Op::SegOff | Op::Ident | Op::Cond)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
            Op::SignDiv => "//",
            Op::Mod => "%",
            Op::SignMod => "%%",
            Op::Neg => "-",
            Op::Not => "~",
            Op::Or => "|",
            Op::And => "&",
            Op::Xor => "^",
            Op::Xnor => "XNOR",
            Op::Nor => "NOR",
            Op::Shl => "<<",
            Op::Shr => ">>",
            Op::Lor => "||",
            Op::Land => "&&",
            Op::Lnot => "!",
            Op::Lxor => "^^",
            Op::Lxnor => "LXNOR",
            Op::Lnor => "LNOR",
            Op::Lt => "<",
            Op::Gt => ">",
            Op::Le => "<=",
            Op::Ge => ">=",
            Op::Ne => "!=",
            Op::Eq => "==",
            Op::Seg => "SEG",
            Op::Wrt => "WRT",
            Op::SegOff => ":",
            Op::Ident => "",
            Op::Cond => "?",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unary_set() {
        assert!(Op::Neg.is_unary());
        assert!(Op::Not.is_unary());
        assert!(Op::Lnot.is_unary());
        assert!(Op::Seg.is_unary());
        assert!(!Op::Add.is_unary());
        assert!(!Op::Wrt.is_unary());
    }

    #[test]
    fn associative_set() {
        for op in [Op::Add, Op::Mul, Op::And, Op::Or, Op::Xor, Op::Land, Op::Lor] {
            assert!(op.is_associative(), "{op:?}");
            assert!(op.is_commutative(), "{op:?}");
        }
        assert!(!Op::Sub.is_associative());
        assert!(!Op::Shl.is_associative());
        assert!(!Op::SegOff.is_associative());
    }

    #[test]
    fn numeric_set() {
        assert!(Op::Add.is_numeric());
        assert!(Op::Shr.is_numeric());
        assert!(!Op::Seg.is_numeric());
        assert!(!Op::SegOff.is_numeric());
        assert!(!Op::Ident.is_numeric());
        assert!(!Op::Cond.is_numeric());
    }
}
