//! Integration tests for the span-resolution engine: jump relaxation,
//! alignment and org fixpoints, LEB128 growth, and emission.

mod common;

use asm_core::intnum::IntNum;
use asm_core::{
    output_section, AsmError, BasicOutput, Bytecode, Contents, Errwarns, Expr, Object,
    Op, Value,
};
use common::*;

// ============================================================================
// Jump relaxation
// ============================================================================

#[test]
fn forward_jump_in_range_stays_short() {
    let (mut obj, text) = text_object();
    let target = obj.symtab_mut().get_or_new("l");
    push(
        &mut obj,
        text,
        Contents::insn(Box::new(JmpInsn::new(target))),
        1,
    );
    push_data(&mut obj, text, 100, 2);
    label_here(&mut obj, text, "l", 3);
    optimize_ok(&mut obj);

    let bcs = obj.section(text).bytecodes();
    assert_eq!(bcs[0].len(), JMP_SHORT_LEN);
    assert_eq!(obj.symbol_offset(target), Some(102));

    let bytes = emit_ok(&obj, text);
    // disp8 = 102 - 2 = 100
    assert_eq!(&bytes[..2], &[0xEB, 100]);
    assert_eq!(bytes.len(), 102);
}

#[test]
fn backward_jump_in_range_stays_short() {
    let (mut obj, text) = text_object();
    let target = label_here(&mut obj, text, "top", 1);
    push_data(&mut obj, text, 10, 2);
    push(
        &mut obj,
        text,
        Contents::insn(Box::new(JmpInsn::new(target))),
        3,
    );
    optimize_ok(&mut obj);

    let bytes = emit_ok(&obj, text);
    // Jump sits at offset 10; disp8 = 0 - 10 - 2 = -12.
    assert_eq!(&bytes[10..], &[0xEB, (-12i8) as u8]);
}

#[test]
fn short_jump_promotes_to_near() {
    let (mut obj, text) = text_object();
    let target = obj.symtab_mut().get_or_new("far");
    push(
        &mut obj,
        text,
        Contents::insn(Box::new(JmpInsn::new(target))),
        1,
    );
    push_data(&mut obj, text, 150, 2);
    label_here(&mut obj, text, "far", 3);
    optimize_ok(&mut obj);

    let bcs = obj.section(text).bytecodes();
    assert_eq!(bcs[0].len(), JMP_NEAR_LEN);
    // The +3 growth shifted everything after the jump.
    assert_eq!(bcs[1].offset(), 5);
    assert_eq!(obj.symbol_offset(target), Some(155));
    assert_eq!(obj.section(text).length(), 155);

    let bytes = emit_ok(&obj, text);
    // disp32 = 155 - 5 = 150
    assert_eq!(&bytes[..5], &[0xE9, 150, 0, 0, 0]);
}

#[test]
fn promotion_cascades_between_jumps() {
    // Growing the first jump pushes the second one out of range.
    let (mut obj, text) = text_object();
    let target = obj.symtab_mut().get_or_new("l");
    push(
        &mut obj,
        text,
        Contents::insn(Box::new(JmpInsn::new(target))),
        1,
    );
    push(
        &mut obj,
        text,
        Contents::insn(Box::new(JmpInsn::new(target))),
        2,
    );
    push_data(&mut obj, text, 129, 3);
    label_here(&mut obj, text, "l", 4);
    optimize_ok(&mut obj);

    let bcs = obj.section(text).bytecodes();
    assert_eq!(bcs[0].len(), JMP_NEAR_LEN);
    assert_eq!(bcs[1].len(), JMP_NEAR_LEN);
    assert_eq!(obj.symbol_offset(target), Some(139));

    let bytes = emit_ok(&obj, text);
    assert_eq!(&bytes[..5], &[0xE9, 134, 0, 0, 0]);
    assert_eq!(&bytes[5..10], &[0xE9, 129, 0, 0, 0]);
}

#[test]
fn jump_to_undefined_symbol_reports_span_error() {
    let (mut obj, text) = text_object();
    let missing = obj.symtab_mut().get_or_new("nowhere");
    push(
        &mut obj,
        text,
        Contents::insn(Box::new(JmpInsn::new(missing))),
        9,
    );
    let mut ew = Errwarns::new();
    obj.optimize(&mut ew);
    assert!(ew.has_errors());
    assert!(matches!(
        ew.errors()[0],
        AsmError::UndefinedSymbol { line: 9, .. }
    ));
    // Recovery: the errant bytecode keeps its minimum length.
    assert_eq!(obj.section(text).bytecodes()[0].len(), JMP_SHORT_LEN);
}

// ============================================================================
// Alignment
// ============================================================================

#[test]
fn align_fixpoint_pads_to_boundary() {
    // db 1,2,3; align 8; db 4  →  offsets 0..3, pad 5, then 4 at offset 8.
    let (mut obj, text) = text_object();
    push(&mut obj, text, Contents::data_raw(vec![1, 2, 3], 1), 1);
    push(
        &mut obj,
        text,
        Contents::align(Expr::int(IntNum::new(8)), None, None, false),
        2,
    );
    push(&mut obj, text, Contents::data_raw(vec![4], 1), 3);
    optimize_ok(&mut obj);

    let bcs = obj.section(text).bytecodes();
    assert_eq!(bcs[1].offset(), 3);
    assert_eq!(bcs[1].len(), 5);
    assert_eq!(bcs[2].offset(), 8);
    assert_eq!(obj.section(text).length(), 9);

    let bytes = emit_ok(&obj, text);
    assert_eq!(bytes, [1, 2, 3, 0, 0, 0, 0, 0, 4]);
}

#[test]
fn align_repads_after_jump_promotion() {
    let (mut obj, text) = text_object();
    let target = obj.symtab_mut().get_or_new("l");
    push(
        &mut obj,
        text,
        Contents::insn(Box::new(JmpInsn::new(target))),
        1,
    );
    push_data(&mut obj, text, 127, 2);
    push(
        &mut obj,
        text,
        Contents::align(Expr::int(IntNum::new(4)), None, None, false),
        3,
    );
    label_here(&mut obj, text, "l", 4);
    push_data(&mut obj, text, 1, 4);
    optimize_ok(&mut obj);

    let bcs = obj.section(text).bytecodes();
    // Short form would put the label at 132 (> 129): promoted.  After
    // promotion the data ends at 132, already aligned, so the pad that
    // was 3 bytes shrinks to none.
    assert_eq!(bcs[0].len(), JMP_NEAR_LEN);
    assert_eq!(bcs[2].len(), 0);
    assert_eq!(obj.symbol_offset(target), Some(132));
    assert_eq!(obj.section(text).length(), 133);
}

#[test]
fn align_with_explicit_fill_byte() {
    let (mut obj, text) = text_object();
    push(&mut obj, text, Contents::data_raw(vec![0x11], 1), 1);
    push(
        &mut obj,
        text,
        Contents::align(
            Expr::int(IntNum::new(4)),
            Some(Expr::int(IntNum::new(0x90))),
            None,
            false,
        ),
        2,
    );
    push(&mut obj, text, Contents::data_raw(vec![0x22], 1), 3);
    optimize_ok(&mut obj);
    assert_eq!(emit_ok(&obj, text), [0x11, 0x90, 0x90, 0x90, 0x22]);
}

#[test]
fn align_beyond_maxskip_is_reported_once() {
    let (mut obj, text) = text_object();
    push(&mut obj, text, Contents::data_raw(vec![0x11], 1), 1);
    push(
        &mut obj,
        text,
        Contents::align(
            Expr::int(IntNum::new(16)),
            None,
            Some(Expr::int(IntNum::new(4))),
            false,
        ),
        2,
    );
    push(&mut obj, text, Contents::data_raw(vec![0x22], 1), 3);
    let mut ew = Errwarns::new();
    obj.optimize(&mut ew);
    assert_eq!(ew.num_errors(), 1);
    assert!(matches!(
        ew.errors()[0],
        AsmError::AlignOverflow {
            pad: 15,
            maxskip: 4,
            line: 2
        }
    ));
    // The align contributes nothing; the next byte follows directly.
    assert_eq!(obj.section(text).bytecodes()[2].offset(), 1);
}

// ============================================================================
// Org
// ============================================================================

#[test]
fn org_forces_the_next_offset() {
    let (mut obj, text) = text_object();
    push(&mut obj, text, Contents::data_raw(vec![1, 2, 3], 1), 1);
    push(&mut obj, text, Contents::org(0x10, 0xAA), 2);
    push(&mut obj, text, Contents::data_raw(vec![4], 1), 3);
    optimize_ok(&mut obj);

    let bcs = obj.section(text).bytecodes();
    assert_eq!(bcs[1].len(), 13);
    assert_eq!(bcs[2].offset(), 0x10);
    assert_eq!(obj.section(text).length(), 0x11);

    let bytes = emit_ok(&obj, text);
    assert_eq!(bytes.len(), 0x11);
    assert_eq!(&bytes[..3], &[1, 2, 3]);
    assert!(bytes[3..0x10].iter().all(|&b| b == 0xAA));
    assert_eq!(bytes[0x10], 4);
}

#[test]
fn org_behind_current_offset_errors() {
    let (mut obj, text) = text_object();
    push(&mut obj, text, Contents::data_raw(vec![0; 8], 1), 1);
    push(&mut obj, text, Contents::org(4, 0), 2);
    let mut ew = Errwarns::new();
    obj.optimize(&mut ew);
    assert_eq!(ew.num_errors(), 1);
    assert!(matches!(
        ew.errors()[0],
        AsmError::OrgOverflow {
            target: 4,
            offset: 8,
            line: 2
        }
    ));
    let _ = text;
}

// ============================================================================
// LEB128
// ============================================================================

fn push_uleb_of(obj: &mut Object, text: asm_core::SectionId, name: &str, line: u32) {
    let sym = obj.symtab_mut().get_or_new(name);
    let mut v = Value::from_sym(sym, 0);
    v.finalize().unwrap();
    push(obj, text, Contents::leb128(vec![v], false), line);
}

#[test]
fn uleb_of_small_label_stays_one_byte() {
    let (mut obj, text) = text_object();
    push_uleb_of(&mut obj, text, "l", 1);
    push_data(&mut obj, text, 126, 2);
    label_here(&mut obj, text, "l", 3);
    optimize_ok(&mut obj);

    let bcs = obj.section(text).bytecodes();
    assert_eq!(bcs[0].len(), 1);
    assert_eq!(obj.symbol_offset(obj.symtab().find("l").unwrap()), Some(127));
    let bytes = emit_ok(&obj, text);
    assert_eq!(bytes[0], 0x7F);
}

#[test]
fn uleb_growth_propagates_length_delta() {
    // The label sits at 128 under the 1-byte assumption; encoding 128
    // takes 2 bytes, which moves the label to 129.
    let (mut obj, text) = text_object();
    push_uleb_of(&mut obj, text, "l", 1);
    push_data(&mut obj, text, 127, 2);
    label_here(&mut obj, text, "l", 3);
    optimize_ok(&mut obj);

    let bcs = obj.section(text).bytecodes();
    assert_eq!(bcs[0].len(), 2);
    assert_eq!(obj.symbol_offset(obj.symtab().find("l").unwrap()), Some(129));
    let bytes = emit_ok(&obj, text);
    assert_eq!(&bytes[..2], &[0x81, 0x01]);
}

#[test]
fn uleb_of_constant_needs_no_span() {
    let (mut obj, text) = text_object();
    let mut v = Value::from_expr(Expr::int(IntNum::new(624_485)), 0);
    v.finalize().unwrap();
    push(&mut obj, text, Contents::leb128(vec![v], false), 1);
    optimize_ok(&mut obj);
    assert_eq!(emit_ok(&obj, text), [0xE5, 0x8E, 0x26]);
}

#[test]
fn sleb_encodes_negative_constants() {
    let (mut obj, text) = text_object();
    let mut v = Value::from_expr(Expr::int(IntNum::new(-2)), 0);
    v.finalize().unwrap();
    push(&mut obj, text, Contents::leb128(vec![v], true), 1);
    optimize_ok(&mut obj);
    assert_eq!(emit_ok(&obj, text), [0x7E]);
}

// ============================================================================
// Symbols and values after freeze
// ============================================================================

#[test]
fn label_minus_label_is_zero() {
    let (mut obj, text) = text_object();
    push_data(&mut obj, text, 7, 1);
    let l = label_here(&mut obj, text, "l", 2);
    push_data(&mut obj, text, 9, 3);
    optimize_ok(&mut obj);

    let e = Expr::binary(Expr::sym(l), Op::Sub, Expr::sym(l));
    let mut v = Value::from_expr(e, 32);
    v.finalize().unwrap();
    let got = v.get_intnum(&obj, None).unwrap();
    assert_eq!(got, Some(IntNum::new(0)));
}

#[test]
fn label_distances_resolve_after_freeze() {
    let (mut obj, text) = text_object();
    let a = label_here(&mut obj, text, "a", 1);
    push_data(&mut obj, text, 7, 1);
    push(
        &mut obj,
        text,
        Contents::reserve(Expr::int(IntNum::new(5)), 1),
        2,
    );
    let b = label_here(&mut obj, text, "b", 3);
    optimize_ok(&mut obj);

    let e = Expr::binary(Expr::sym(b), Op::Sub, Expr::sym(a));
    let mut v = Value::from_expr(e, 32);
    v.finalize().unwrap();
    assert_eq!(v.get_intnum(&obj, None).unwrap(), Some(IntNum::new(12)));
}

#[test]
fn equ_symbols_feed_spans_and_sizes() {
    let (mut obj, text) = text_object();
    let n = obj.symtab_mut().get_or_new("count");
    obj.symtab_mut()
        .define_equ(n, Expr::int(IntNum::new(3)), 1)
        .unwrap();
    let mut bc = Bytecode::new(Contents::data_raw(vec![0xEE], 1), 2);
    bc.set_multiple(Expr::sym(n));
    obj.section_mut(text).append_bytecode(bc);
    optimize_ok(&mut obj);
    assert_eq!(emit_ok(&obj, text), [0xEE, 0xEE, 0xEE]);
}

// ============================================================================
// Incbin and whole-image determinism
// ============================================================================

#[test]
fn incbin_emits_verbatim() {
    let (mut obj, text) = text_object();
    push(
        &mut obj,
        text,
        Contents::incbin("blob.bin".into(), vec![9, 8, 7, 6]),
        1,
    );
    optimize_ok(&mut obj);
    assert_eq!(emit_ok(&obj, text), [9, 8, 7, 6]);
}

fn build_mixed_image() -> Vec<u8> {
    let (mut obj, text) = text_object();
    let target = obj.symtab_mut().get_or_new("end");
    push(
        &mut obj,
        text,
        Contents::insn(Box::new(JmpInsn::new(target))),
        1,
    );
    push_data(&mut obj, text, 140, 2);
    push(
        &mut obj,
        text,
        Contents::align(Expr::int(IntNum::new(8)), None, None, false),
        3,
    );
    push_uleb_of(&mut obj, text, "end", 4);
    push_data(&mut obj, text, 2, 5);
    label_here(&mut obj, text, "end", 6);
    optimize_ok(&mut obj);
    emit_ok(&obj, text)
}

#[test]
fn identical_input_produces_identical_output() {
    let a = build_mixed_image();
    let b = build_mixed_image();
    assert_eq!(a, b);
}

#[test]
fn offsets_remain_consistent_after_fixpoint() {
    let (mut obj, text) = text_object();
    let target = obj.symtab_mut().get_or_new("end");
    for line in 0..4 {
        push(
            &mut obj,
            text,
            Contents::insn(Box::new(JmpInsn::new(target))),
            line,
        );
        push_data(&mut obj, text, 40, line);
    }
    push_data(&mut obj, text, 120, 9);
    label_here(&mut obj, text, "end", 10);
    optimize_ok(&mut obj);

    let bcs = obj.section(text).bytecodes();
    for w in bcs.windows(2) {
        assert_eq!(w[1].offset(), w[0].offset() + w[0].total_len());
    }
    // Jump lengths only ever settle at one of the two encodings.
    for bc in bcs {
        if bc.get_special() == asm_core::Special::Insn {
            assert!(bc.len() == JMP_SHORT_LEN || bc.len() == JMP_NEAR_LEN);
        }
    }
}

// ============================================================================
// BSS-style sections
// ============================================================================

#[test]
fn bss_sections_emit_gaps_only() {
    let (mut obj, _text) = text_object();
    let bss = obj.append_section("bss", false);
    obj.section_mut(bss).set_bss(true);
    push(
        &mut obj,
        bss,
        Contents::reserve(Expr::int(IntNum::new(16)), 4),
        1,
    );
    optimize_ok(&mut obj);
    assert_eq!(obj.section(bss).length(), 64);

    let mut out = BasicOutput::new(&obj);
    let mut ew = Errwarns::new();
    output_section(&obj, bss, &mut out, &mut ew).unwrap();
    assert!(!ew.has_errors());
    assert_eq!(out.bytes().len(), 64);
    assert!(out.bytes().iter().all(|&b| b == 0));
}
