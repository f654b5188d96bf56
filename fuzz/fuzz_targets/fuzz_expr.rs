//! Fuzz expression normalization: build a tree from the input bytes,
//! normalize it twice, and check idempotence.

#![no_main]

use asm_core::intnum::IntNum;
use asm_core::{Expr, ExprTerm, Op};
use libfuzzer_sys::fuzz_target;

const OPS: &[Op] = &[
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::SignDiv,
    Op::SignMod,
    Op::And,
    Op::Or,
    Op::Xor,
    Op::Xnor,
    Op::Nor,
    Op::Shl,
    Op::Shr,
    Op::Land,
    Op::Lor,
    Op::Lt,
    Op::Gt,
    Op::Le,
    Op::Ge,
    Op::Ne,
    Op::Eq,
];

/// Decode a bounded expression tree from the fuzz input.
fn decode(data: &mut &[u8], depth: u8) -> Expr {
    let Some((&b, rest)) = data.split_first() else {
        return Expr::int(IntNum::new(1));
    };
    *data = rest;
    if depth == 0 || b < 0x40 {
        return Expr::int(IntNum::new(i64::from(b as i8)));
    }
    let op = OPS[usize::from(b) % OPS.len()];
    if b & 1 == 0 {
        Expr::unary(Op::Neg, decode(data, depth - 1))
    } else {
        let lhs = decode(data, depth - 1);
        let rhs = decode(data, depth - 1);
        Expr::binary(lhs, op, rhs)
    }
}

fuzz_target!(|data: &[u8]| {
    let mut input = data;
    let mut e = decode(&mut input, 6);
    // Division by zero and oversized shifts are legitimate errors, not
    // panics; everything else must normalize and stay normalized.
    if e.simplify(true).is_ok() {
        let once = e.clone();
        e.simplify(true).expect("renormalization failed");
        assert_eq!(once, e, "normalization is not idempotent");
    }
});
