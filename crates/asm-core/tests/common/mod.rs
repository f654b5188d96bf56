//! Shared test helpers: a toy architecture jump with short (rel8) and
//! near (rel32) forms, plus object-building conveniences.
#![allow(dead_code)]

use asm_core::{
    output_section, AsmError, BasicOutput, BcInfo, Bytecode, Contents, Errwarns,
    EvalContext, Expansion, Expr, InsnContents, Location, Object, Op, SectionId,
    SpanRequest, SymbolId, Value,
};
use asm_core::arch::Generic;
use asm_core::intnum::IntNum;
use asm_core::output::Output;

pub const JMP_SHORT_LEN: u64 = 2;
pub const JMP_NEAR_LEN: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JmpForm {
    Short,
    Near,
}

/// A PC-relative jump: opcode + rel8, promoted to opcode + rel32 when
/// the displacement leaves the signed 8-bit range.
#[derive(Debug)]
pub struct JmpInsn {
    target: Value,
    form: JmpForm,
}

impl JmpInsn {
    pub fn new(target: SymbolId) -> Self {
        let mut v = Value::from_sym(target, 8);
        v.curpos_rel = true;
        v.sign = true;
        JmpInsn {
            target: v,
            form: JmpForm::Short,
        }
    }

    /// Displacement value adjusted for the encoded instruction length
    /// (displacements count from the end of the instruction).
    fn disp_value(&self, len: u64, size: u16) -> Value {
        let mut v = self.target.clone();
        v.size = size;
        let adj = Expr::int(IntNum::new(-(len as i64)));
        v.abs = Some(Box::new(match v.abs.take() {
            Some(e) => Expr::binary(*e, Op::Add, adj),
            None => adj,
        }));
        v
    }
}

impl InsnContents for JmpInsn {
    fn finalize(&mut self, _info: &BcInfo) -> Result<(), AsmError> {
        self.target.finalize()
    }

    fn calc_len(
        &mut self,
        _info: &BcInfo,
        _ctx: &dyn EvalContext,
        add_span: &mut dyn FnMut(SpanRequest),
    ) -> Result<u64, AsmError> {
        // Span value is target minus instruction start; the short form
        // reaches [-128, 127] from the instruction end.
        add_span(SpanRequest {
            id: 1,
            value: self.target.clone(),
            neg_thres: -128 + JMP_SHORT_LEN as i64,
            pos_thres: 127 + JMP_SHORT_LEN as i64,
        });
        Ok(JMP_SHORT_LEN)
    }

    fn expand(
        &mut self,
        _info: &BcInfo,
        len: &mut u64,
        _span: i32,
        _old_val: i64,
        _new_val: i64,
    ) -> Result<Expansion, AsmError> {
        self.form = JmpForm::Near;
        *len = JMP_NEAR_LEN;
        Ok(Expansion::Done)
    }

    fn to_bytes(
        &self,
        info: &BcInfo,
        len: u64,
        buf: &mut Vec<u8>,
        out: &mut dyn Output,
    ) -> Result<(), AsmError> {
        match self.form {
            JmpForm::Short => {
                buf.push(0xEB);
                buf.push(0);
                let v = self.disp_value(len, 8);
                let loc = Location::new(info.sect, info.bc, 1);
                out.value(&v, &mut buf[1..2], loc, -1)?;
            }
            JmpForm::Near => {
                buf.push(0xE9);
                buf.extend_from_slice(&[0; 4]);
                let v = self.disp_value(len, 32);
                let loc = Location::new(info.sect, info.bc, 1);
                out.value(&v, &mut buf[1..5], loc, -1)?;
            }
        }
        Ok(())
    }
}

/// A fresh object with a generic 64-bit architecture and one code
/// section.
pub fn text_object() -> (Object, SectionId) {
    let mut obj = Object::new(Box::new(Generic::new(64)));
    let text = obj.append_section("text", true);
    (obj, text)
}

/// Append a bytecode to a section; returns its in-section index.
pub fn push(obj: &mut Object, sect: SectionId, contents: Contents, line: u32) -> u32 {
    obj.section_mut(sect).append_bytecode(Bytecode::new(contents, line))
}

/// Append `n` raw filler bytes as one data bytecode.
pub fn push_data(obj: &mut Object, sect: SectionId, n: usize, line: u32) -> u32 {
    push(obj, sect, Contents::data_raw(vec![0xCC; n], 1), line)
}

/// Define `name` as a label at the current end of `sect`.
pub fn label_here(obj: &mut Object, sect: SectionId, name: &str, line: u32) -> SymbolId {
    let loc = obj.section(sect).next_loc(sect);
    let id = obj.symtab_mut().get_or_new(name);
    obj.symtab_mut().define_label(id, loc, line).unwrap();
    id
}

/// Optimize, asserting no errors were reported.
pub fn optimize_ok(obj: &mut Object) {
    let mut ew = Errwarns::new();
    obj.optimize(&mut ew);
    let errors: Vec<String> = ew.errors().iter().map(|e| e.to_string()).collect();
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
}

/// Emit a section through `BasicOutput`, asserting no errors.
pub fn emit_ok(obj: &Object, sect: SectionId) -> Vec<u8> {
    let mut out = BasicOutput::new(obj);
    let mut ew = Errwarns::new();
    output_section(obj, sect, &mut out, &mut ew).unwrap();
    let errors: Vec<String> = ew.errors().iter().map(|e| e.to_string()).collect();
    assert!(errors.is_empty(), "unexpected emission errors: {errors:?}");
    out.into_bytes()
}
