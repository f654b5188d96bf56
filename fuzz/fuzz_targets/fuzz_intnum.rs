//! Fuzz the integer kernel: random operator chains over random words
//! must never panic, and representation promotion must stay canonical.

#![no_main]

use asm_core::intnum::IntNum;
use asm_core::Op;
use libfuzzer_sys::fuzz_target;

const OPS: &[Op] = &[
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::Div,
    Op::SignDiv,
    Op::Mod,
    Op::SignMod,
    Op::Neg,
    Op::Not,
    Op::And,
    Op::Or,
    Op::Xor,
    Op::Xnor,
    Op::Nor,
    Op::Shl,
    Op::Shr,
    Op::Lor,
    Op::Land,
    Op::Lnot,
    Op::Lxor,
    Op::Lxnor,
    Op::Lnor,
    Op::Lt,
    Op::Gt,
    Op::Le,
    Op::Ge,
    Op::Ne,
    Op::Eq,
];

fuzz_target!(|data: &[u8]| {
    let mut chunks = data.chunks_exact(9);
    let mut acc = IntNum::new(0);
    for chunk in &mut chunks {
        let op = OPS[usize::from(chunk[0]) % OPS.len()];
        let rhs = i64::from_le_bytes(chunk[1..9].try_into().unwrap());
        // Shift counts are clamped by the kernel; division by zero is an
        // error, never a panic.
        let _ = acc.calc(op, Some(&IntNum::new(rhs)));
        // Canonical form: anything that fits a word is stored as one.
        if let Some(v) = acc.to_i64() {
            assert_eq!(acc, IntNum::new(v));
        }
    }
});
