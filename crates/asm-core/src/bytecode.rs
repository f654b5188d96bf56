//! Bytecodes and their polymorphic contents.
//!
//! A [`Bytecode`] is the atomic unit of assembled output inside a
//! section.  Its [`Contents`] determine how long it is and what bytes it
//! emits; every variant implements the same contract:
//!
//! - `finalize` freezes values after parsing;
//! - `calc_len` returns the minimum length and registers spans for
//!   anything length-dependent;
//! - `expand` grows the bytecode when a registered span crosses its
//!   thresholds (lengths never shrink);
//! - `to_bytes` renders exactly `len` bytes.
//!
//! Alignment and org bytecodes are *offset* bytecodes: their length is
//! computed from where they sit (`update_offset`), not from their
//! content.  Instruction contents are supplied by the architecture
//! collaborator behind the [`InsnContents`] trait.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::arch::Arch;
use crate::error::AsmError;
use crate::expr::{EvalContext, Expr};
use crate::intnum::IntNum;
use crate::object::{Location, SectionId};
use crate::op::Op;
use crate::output::Output;
use crate::symbol::SymbolId;
use crate::value::Value;

/// Sentinel for "offset not yet computed".
const UNKNOWN_OFFSET: u64 = u64::MAX;

/// Special bytecode classifications that change engine handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Special {
    /// No special handling.
    None,
    /// Reserves space; contributes to offsets but emits no bytes.
    Reserve,
    /// Length computed from position (align, org).
    Offset,
    /// Machine instruction.
    Insn,
}

/// Read-only view of a bytecode's identity handed to contents callbacks.
#[derive(Debug, Clone, Copy)]
pub struct BcInfo {
    /// Containing section.
    pub sect: SectionId,
    /// Bytecode index within the section.
    pub bc: u32,
    /// Dense object-wide index assigned by the engine.
    pub index: u32,
    /// Current section-relative offset (may be provisional during
    /// length calculation).
    pub offset: u64,
    /// Source line.
    pub line: u32,
}

impl BcInfo {
    /// The location of this bytecode's first byte.
    pub fn start_loc(&self) -> Location {
        Location::new(self.sect, self.bc, 0)
    }
}

/// A span registration made by `calc_len`: the owning bytecode must grow
/// when `value` leaves `[neg_thres, pos_thres]`.  Negative ids request
/// notification on every change instead.
#[derive(Debug, Clone)]
pub struct SpanRequest {
    /// Contents-chosen span identifier (non-zero).
    pub id: i32,
    /// The length-dependent value.
    pub value: Value,
    /// Negative threshold.
    pub neg_thres: i64,
    /// Positive threshold.
    pub pos_thres: i64,
}

/// Result of [`Bytecode::expand`]: either the bytecode is done with this
/// span, or it may grow further under new thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    /// No longer dependent on this span.
    Done,
    /// Still dependent; watch the new thresholds.
    Growable {
        /// New negative threshold.
        neg_thres: i64,
        /// New positive threshold.
        pos_thres: i64,
    },
}

/// Architecture-provided instruction contents.
///
/// Implementations encode machine instructions, registering a span per
/// length-dependent operand (PC-relative displacements register the
/// operand value with `curpos_rel` and thresholds matching the short
/// form's signed range).
pub trait InsnContents: fmt::Debug {
    /// Freeze operand values after parsing.
    fn finalize(&mut self, info: &BcInfo) -> Result<(), AsmError>;

    /// Minimum length; register spans through `add_span`.
    fn calc_len(
        &mut self,
        info: &BcInfo,
        ctx: &dyn EvalContext,
        add_span: &mut dyn FnMut(SpanRequest),
    ) -> Result<u64, AsmError>;

    /// Grow for a span whose value moved outside its thresholds.  `len`
    /// may only increase.
    fn expand(
        &mut self,
        info: &BcInfo,
        len: &mut u64,
        span: i32,
        old_val: i64,
        new_val: i64,
    ) -> Result<Expansion, AsmError>;

    /// Render exactly `len` bytes into `buf`.
    fn to_bytes(
        &self,
        info: &BcInfo,
        len: u64,
        buf: &mut Vec<u8>,
        out: &mut dyn Output,
    ) -> Result<(), AsmError>;
}

/// Zero-length instruction contents.
#[derive(Debug, Clone, Copy)]
pub struct EmptyInsn;

impl InsnContents for EmptyInsn {
    fn finalize(&mut self, _info: &BcInfo) -> Result<(), AsmError> {
        Ok(())
    }
    fn calc_len(
        &mut self,
        _info: &BcInfo,
        _ctx: &dyn EvalContext,
        _add_span: &mut dyn FnMut(SpanRequest),
    ) -> Result<u64, AsmError> {
        Ok(0)
    }
    fn expand(
        &mut self,
        _info: &BcInfo,
        _len: &mut u64,
        _span: i32,
        _old_val: i64,
        _new_val: i64,
    ) -> Result<Expansion, AsmError> {
        Ok(Expansion::Done)
    }
    fn to_bytes(
        &self,
        _info: &BcInfo,
        _len: u64,
        _buf: &mut Vec<u8>,
        _out: &mut dyn Output,
    ) -> Result<(), AsmError> {
        Ok(())
    }
}

// ─── Data ──────────────────────────────────────────────────

/// One item of a data bytecode.
#[derive(Debug, Clone)]
pub enum Dataval {
    /// A computed value emitted at the declared element size.
    Value(Value),
    /// Raw bytes emitted verbatim (strings, pre-encoded data).
    Raw(Vec<u8>),
}

/// Fixed-size data values (`db`/`dw`/`dd`/… and string data).
#[derive(Debug)]
pub struct DataContents {
    vals: Vec<Dataval>,
    elem_size: u16,
    append_zero: bool,
}

impl DataContents {
    fn len(&self) -> u64 {
        let mut len = 0u64;
        for v in &self.vals {
            len += match v {
                Dataval::Value(_) => u64::from(self.elem_size),
                Dataval::Raw(b) => b.len() as u64,
            };
            if self.append_zero {
                len += 1;
            }
        }
        len
    }
}

// ─── LEB128 ────────────────────────────────────────────────

/// LEB128-encoded values; each non-constant item registers a span so
/// symbol movement forces re-encoding.
#[derive(Debug)]
pub struct Leb128Contents {
    vals: Vec<Value>,
    sign: bool,
    sizes: Vec<u64>,
    cur: Vec<i64>,
}

impl Leb128Contents {
    /// Encode `value`, padding with redundant continuation bytes up to
    /// the reserved `size` (values may settle smaller than their peak).
    fn write_padded(&self, value: &IntNum, buf: &mut Vec<u8>, size: u64) {
        let start = buf.len();
        value.write_leb128(buf, self.sign);
        while ((buf.len() - start) as u64) < size {
            let last = buf.len() - 1;
            buf[last] |= 0x80;
            let fill = if self.sign && value.sign() < 0 { 0x7F } else { 0x00 };
            buf.push(fill);
        }
    }
}

// ─── Reserve ───────────────────────────────────────────────

/// Uninitialized space: `numitems × itemsize` bytes.
#[derive(Debug)]
pub struct ReserveContents {
    numitems: Expr,
    itemsize: u16,
    items: u64,
}

// ─── Align ─────────────────────────────────────────────────

/// Pad to a power-of-two boundary, optionally bounded by `maxskip` and
/// filled with a byte or architecture code-fill patterns.
#[derive(Debug)]
pub struct AlignContents {
    boundary: Expr,
    fill: Option<Expr>,
    maxskip: Option<Expr>,
    code_fill: bool,
    bound: u64,
    fill_byte: Option<u8>,
    max_skip: Option<u64>,
}

// ─── Org ───────────────────────────────────────────────────

/// Force the next offset to a literal target, filling the gap.
#[derive(Debug)]
pub struct OrgContents {
    target: u64,
    fill_byte: u8,
}

// ─── Incbin ────────────────────────────────────────────────

/// Binary file contents inserted verbatim.  The front-end performs the
/// file I/O; the path is kept for diagnostics only.
#[derive(Debug)]
pub struct IncbinContents {
    path: String,
    data: Vec<u8>,
}

// ─── Contents dispatch ─────────────────────────────────────

/// Implementation-specific bytecode contents.
#[derive(Debug)]
pub enum Contents {
    /// No contents (label anchors, placeholders).
    Empty,
    /// Fixed-size data values.
    Data(DataContents),
    /// LEB128-encoded values.
    Leb128(Leb128Contents),
    /// Uninitialized space.
    Reserve(ReserveContents),
    /// Alignment padding.
    Align(AlignContents),
    /// Absolute offset directive.
    Org(OrgContents),
    /// Verbatim file contents.
    Incbin(IncbinContents),
    /// Machine instruction (architecture-provided).
    Insn(Box<dyn InsnContents>),
}

impl Contents {
    /// Data bytecode from a list of items.
    pub fn data(vals: Vec<Dataval>, elem_size: u16, append_zero: bool) -> Contents {
        Contents::Data(DataContents {
            vals,
            elem_size,
            append_zero,
        })
    }

    /// Data bytecode holding one raw byte run.
    pub fn data_raw(bytes: Vec<u8>, elem_size: u16) -> Contents {
        Contents::Data(DataContents {
            vals: alloc::vec![Dataval::Raw(bytes)],
            elem_size,
            append_zero: false,
        })
    }

    /// LEB128 bytecode.
    pub fn leb128(vals: Vec<Value>, sign: bool) -> Contents {
        Contents::Leb128(Leb128Contents {
            vals,
            sign,
            sizes: Vec::new(),
            cur: Vec::new(),
        })
    }

    /// Reserve bytecode.
    pub fn reserve(numitems: Expr, itemsize: u16) -> Contents {
        Contents::Reserve(ReserveContents {
            numitems,
            itemsize,
            items: 0,
        })
    }

    /// Align bytecode.  `code_fill` selects architecture NOP patterns
    /// when no explicit fill is given.
    pub fn align(
        boundary: Expr,
        fill: Option<Expr>,
        maxskip: Option<Expr>,
        code_fill: bool,
    ) -> Contents {
        Contents::Align(AlignContents {
            boundary,
            fill,
            maxskip,
            code_fill,
            bound: 0,
            fill_byte: None,
            max_skip: None,
        })
    }

    /// Org bytecode.
    pub fn org(target: u64, fill: u8) -> Contents {
        Contents::Org(OrgContents {
            target,
            fill_byte: fill,
        })
    }

    /// Incbin bytecode over already-loaded file bytes.
    pub fn incbin(path: String, data: Vec<u8>) -> Contents {
        Contents::Incbin(IncbinContents { path, data })
    }

    /// Instruction bytecode.
    pub fn insn(contents: Box<dyn InsnContents>) -> Contents {
        Contents::Insn(contents)
    }

    fn special(&self) -> Special {
        match self {
            Contents::Empty | Contents::Data(_) | Contents::Leb128(_) | Contents::Incbin(_) => {
                Special::None
            }
            Contents::Reserve(_) => Special::Reserve,
            Contents::Align(_) | Contents::Org(_) => Special::Offset,
            Contents::Insn(_) => Special::Insn,
        }
    }

    fn finalize(&mut self, info: &BcInfo) -> Result<(), AsmError> {
        match self {
            Contents::Data(d) => {
                for v in &mut d.vals {
                    if let Dataval::Value(v) = v {
                        v.finalize()?;
                    }
                }
                Ok(())
            }
            Contents::Leb128(l) => {
                for v in &mut l.vals {
                    v.finalize()?;
                }
                Ok(())
            }
            Contents::Insn(i) => i.finalize(info),
            _ => Ok(()),
        }
    }

    fn calc_len(
        &mut self,
        info: &BcInfo,
        ctx: &dyn EvalContext,
        add_span: &mut dyn FnMut(SpanRequest),
    ) -> Result<u64, AsmError> {
        match self {
            Contents::Empty => Ok(0),
            Contents::Data(d) => Ok(d.len()),
            Contents::Leb128(l) => {
                l.sizes.clear();
                l.cur.clear();
                let mut len = 0u64;
                for (k, v) in l.vals.iter().enumerate() {
                    if let Some(i) = v.constant_intnum() {
                        if !l.sign && i.sign() < 0 {
                            return Err(AsmError::Value {
                                msg: "negative value in unsigned LEB128".into(),
                                line: info.line,
                            });
                        }
                        let sz = i.size_leb128(l.sign);
                        l.sizes.push(sz);
                        l.cur.push(i.to_i64().unwrap_or(0));
                        len += sz;
                    } else {
                        // Assume the single-byte form; the span notifies
                        // on every value change (negative id).
                        l.sizes.push(1);
                        l.cur.push(0);
                        len += 1;
                        add_span(SpanRequest {
                            id: -(k as i32) - 1,
                            value: v.clone(),
                            neg_thres: 0,
                            pos_thres: 0,
                        });
                    }
                }
                Ok(len)
            }
            Contents::Reserve(r) => {
                let items = r.numitems.evaluate(ctx)?;
                let items = items.to_u64().ok_or(AsmError::Value {
                    msg: "reserve count must be a non-negative constant".into(),
                    line: info.line,
                })?;
                r.items = items;
                Ok(items * u64::from(r.itemsize))
            }
            Contents::Align(a) => {
                let bound = a.boundary.evaluate(ctx)?.to_u64();
                let bound = match bound {
                    Some(b) if b.is_power_of_two() => b,
                    _ => {
                        return Err(AsmError::Value {
                            msg: "alignment must be a power of two".into(),
                            line: info.line,
                        })
                    }
                };
                a.bound = bound;
                if let Some(f) = &a.fill {
                    let v = f.evaluate(ctx)?;
                    let mut byte = [0u8];
                    v.write_le(&mut byte);
                    a.fill_byte = Some(byte[0]);
                }
                if let Some(ms) = &a.maxskip {
                    a.max_skip = Some(ms.evaluate(ctx)?.to_u64().ok_or(AsmError::Value {
                        msg: "maxskip must be a non-negative constant".into(),
                        line: info.line,
                    })?);
                }
                Ok(0)
            }
            Contents::Org(_) => Ok(0),
            Contents::Incbin(i) => Ok(i.data.len() as u64),
            Contents::Insn(i) => i.calc_len(info, ctx, add_span),
        }
    }

    /// Recompute the length of an OFFSET bytecode from the offset it
    /// sits at.
    fn update_offset(&mut self, info: &BcInfo, offset: u64) -> Result<u64, AsmError> {
        match self {
            Contents::Align(a) => {
                if a.bound <= 1 {
                    return Ok(0);
                }
                let pad = (a.bound - (offset % a.bound)) % a.bound;
                if let Some(ms) = a.max_skip {
                    if pad > ms {
                        return Err(AsmError::AlignOverflow {
                            pad,
                            maxskip: ms,
                            line: info.line,
                        });
                    }
                }
                Ok(pad)
            }
            Contents::Org(o) => {
                if o.target < offset {
                    Err(AsmError::OrgOverflow {
                        target: o.target,
                        offset,
                        line: info.line,
                    })
                } else {
                    Ok(o.target - offset)
                }
            }
            _ => Err(AsmError::Internal {
                msg: "update_offset on a non-offset bytecode".into(),
                line: info.line,
            }),
        }
    }

    fn expand(
        &mut self,
        info: &BcInfo,
        len: &mut u64,
        span: i32,
        old_val: i64,
        new_val: i64,
    ) -> Result<Expansion, AsmError> {
        match self {
            Contents::Leb128(l) => {
                let k = usize::try_from(-i64::from(span) - 1).map_err(|_| {
                    AsmError::Internal {
                        msg: "bad LEB128 span id".into(),
                        line: info.line,
                    }
                })?;
                if k >= l.sizes.len() {
                    return Err(AsmError::Internal {
                        msg: "bad LEB128 span id".into(),
                        line: info.line,
                    });
                }
                if !l.sign && new_val < 0 {
                    return Err(AsmError::Value {
                        msg: "negative value in unsigned LEB128".into(),
                        line: info.line,
                    });
                }
                l.cur[k] = new_val;
                let sz = IntNum::new(new_val).size_leb128(l.sign);
                if sz > l.sizes[k] {
                    *len += sz - l.sizes[k];
                    l.sizes[k] = sz;
                }
                Ok(Expansion::Growable {
                    neg_thres: 0,
                    pos_thres: 0,
                })
            }
            Contents::Insn(i) => i.expand(info, len, span, old_val, new_val),
            _ => Err(AsmError::Internal {
                msg: "expand on a bytecode without spans".into(),
                line: info.line,
            }),
        }
    }

    fn to_bytes(
        &self,
        info: &BcInfo,
        len: u64,
        arch: &dyn Arch,
        buf: &mut Vec<u8>,
        out: &mut dyn Output,
    ) -> Result<(), AsmError> {
        match self {
            Contents::Empty | Contents::Reserve(_) => Ok(()),
            Contents::Data(d) => {
                for v in &d.vals {
                    match v {
                        Dataval::Raw(b) => buf.extend_from_slice(b),
                        Dataval::Value(v) => {
                            let pos = buf.len();
                            let elem = usize::from(d.elem_size);
                            buf.resize(pos + elem, 0);
                            let loc = Location::new(info.sect, info.bc, pos as u64);
                            let warn = if v.sign { -1 } else { 1 };
                            out.value(v, &mut buf[pos..pos + elem], loc, warn)?;
                        }
                    }
                    if d.append_zero {
                        buf.push(0);
                    }
                }
                Ok(())
            }
            Contents::Leb128(l) => {
                for (k, v) in l.vals.iter().enumerate() {
                    let size = l.sizes.get(k).copied().unwrap_or(0);
                    match v.constant_intnum() {
                        Some(i) => l.write_padded(i, buf, size),
                        None => {
                            let cur = l.cur.get(k).copied().unwrap_or(0);
                            l.write_padded(&IntNum::new(cur), buf, size);
                        }
                    }
                }
                Ok(())
            }
            Contents::Align(a) => {
                let pad = len as usize;
                if pad == 0 {
                    return Ok(());
                }
                match a.fill_byte {
                    Some(b) => buf.extend(core::iter::repeat(b).take(pad)),
                    None => {
                        let pattern = if a.code_fill {
                            arch.get_fill(len)
                        } else {
                            None
                        };
                        match pattern {
                            Some(p) if p.len() == pad => buf.extend_from_slice(&p),
                            _ => buf.extend(core::iter::repeat(0u8).take(pad)),
                        }
                    }
                }
                Ok(())
            }
            Contents::Org(o) => {
                buf.extend(core::iter::repeat(o.fill_byte).take(len as usize));
                Ok(())
            }
            Contents::Incbin(i) => {
                let _ = &i.path;
                buf.extend_from_slice(&i.data);
                Ok(())
            }
            Contents::Insn(i) => i.to_bytes(info, len, buf, out),
        }
    }
}

// ─── Bytecode ──────────────────────────────────────────────

/// One atomic unit of assembled output.
#[derive(Debug)]
pub struct Bytecode {
    contents: Contents,
    multiple: Option<Expr>,
    len: u64,
    mult_int: i64,
    offset: u64,
    index: u32,
    line: u32,
    labels: Vec<SymbolId>,
}

impl Bytecode {
    /// Create a bytecode with the given contents and source line.
    pub fn new(contents: Contents, line: u32) -> Self {
        Bytecode {
            contents,
            multiple: None,
            len: 0,
            mult_int: 1,
            offset: UNKNOWN_OFFSET,
            index: 0,
            line,
            labels: Vec::new(),
        }
    }

    /// The contents.
    pub fn contents(&self) -> &Contents {
        &self.contents
    }

    /// Set the repeat-count expression (`TIMES n`).
    pub fn set_multiple(&mut self, e: Expr) {
        self.multiple = Some(e);
    }

    /// Multiply into the current repeat-count expression.
    pub fn multiply_multiple(&mut self, e: Expr) {
        self.multiple = Some(match self.multiple.take() {
            Some(m) => Expr::binary(m, Op::Mul, e),
            None => e,
        });
    }

    /// The repeat-count expression, if any.
    pub fn multiple(&self) -> Option<&Expr> {
        self.multiple.as_ref()
    }

    /// Single-copy length in bytes.  Only valid after optimization.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Resolved repeat count.  Only valid after optimization.
    pub fn mult_int(&self) -> i64 {
        self.mult_int
    }

    /// Total length including repeats.  Only valid after optimization.
    pub fn total_len(&self) -> u64 {
        self.len * self.mult_int.max(0) as u64
    }

    /// Section-relative offset.  Only valid after optimization.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The offset, if it has been computed.
    pub fn known_offset(&self) -> Option<u64> {
        if self.offset == UNKNOWN_OFFSET {
            None
        } else {
            Some(self.offset)
        }
    }

    /// Offset of the next bytecode (which need not exist).
    pub fn next_offset(&self) -> u64 {
        self.offset + self.total_len()
    }

    /// Dense object-wide index assigned by the engine.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Source line.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Record a symbol label pointing at this bytecode.
    pub fn add_label(&mut self, sym: SymbolId) {
        self.labels.push(sym);
    }

    /// Symbols labelling this bytecode.
    pub fn labels(&self) -> &[SymbolId] {
        &self.labels
    }

    /// Special classification of the contents.
    pub fn get_special(&self) -> Special {
        self.contents.special()
    }

    pub(crate) fn set_index(&mut self, index: u32) {
        self.index = index;
    }

    pub(crate) fn set_mult_int(&mut self, mult: i64) {
        self.mult_int = mult;
    }

    pub(crate) fn finalize(&mut self, info: &BcInfo) -> Result<(), AsmError> {
        self.contents.finalize(info)
    }

    pub(crate) fn calc_len(
        &mut self,
        info: &BcInfo,
        ctx: &dyn EvalContext,
        add_span: &mut dyn FnMut(SpanRequest),
    ) -> Result<u64, AsmError> {
        let len = self.contents.calc_len(info, ctx, add_span)?;
        self.len = len;
        Ok(len)
    }

    /// Grow for a span change; the length never decreases.
    pub(crate) fn expand(
        &mut self,
        info: &BcInfo,
        span: i32,
        old_val: i64,
        new_val: i64,
    ) -> Result<Expansion, AsmError> {
        let mut len = self.len;
        let result = self
            .contents
            .expand(info, &mut len, span, old_val, new_val)?;
        if len < self.len {
            return Err(AsmError::Internal {
                msg: "bytecode shrank during expansion".into(),
                line: self.line,
            });
        }
        self.len = len;
        Ok(result)
    }

    /// Place this bytecode at `offset`; OFFSET bytecodes recompute their
    /// length here.  Returns the next bytecode's offset; on error the
    /// length is left at zero (the errant bytecode is skipped).
    pub(crate) fn update_offset(&mut self, offset: u64) -> Result<u64, AsmError> {
        self.offset = offset;
        if self.get_special() == Special::Offset {
            let info = self.info_at(offset);
            match self.contents.update_offset(&info, offset) {
                Ok(len) => self.len = len,
                Err(e) => {
                    self.len = 0;
                    return Err(e);
                }
            }
        }
        Ok(self.next_offset())
    }

    pub(crate) fn info_at(&self, offset: u64) -> BcInfo {
        BcInfo {
            sect: SectionId::new(0),
            bc: 0,
            index: self.index,
            offset,
            line: self.line,
        }
    }

    /// Render one copy of this bytecode into `buf` (exactly `len`
    /// bytes), emitting values through `out`.
    pub fn to_bytes(
        &self,
        info: &BcInfo,
        arch: &dyn Arch,
        buf: &mut Vec<u8>,
        out: &mut dyn Output,
    ) -> Result<(), AsmError> {
        self.contents.to_bytes(info, self.len, arch, buf, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Generic;
    use crate::object::Object;

    fn ctx() -> Object {
        Object::new(Box::new(Generic::new(64)))
    }

    fn info() -> BcInfo {
        BcInfo {
            sect: SectionId::new(0),
            bc: 0,
            index: 0,
            offset: 0,
            line: 1,
        }
    }

    fn no_spans() -> impl FnMut(SpanRequest) {
        |_| {}
    }

    #[test]
    fn data_length_counts_elements_and_strings() {
        let vals = alloc::vec![
            Dataval::Value(Value::from_expr(Expr::int(IntNum::new(7)), 32)),
            Dataval::Raw(alloc::vec![b'h', b'i']),
        ];
        let mut bc = Bytecode::new(Contents::data(vals, 4, false), 1);
        let len = bc.calc_len(&info(), &ctx(), &mut no_spans()).unwrap();
        assert_eq!(len, 6);

        // With a trailing zero per item (.asciz style).
        let vals = alloc::vec![Dataval::Raw(alloc::vec![b'o', b'k'])];
        let mut bc = Bytecode::new(Contents::data(vals, 1, true), 1);
        assert_eq!(bc.calc_len(&info(), &ctx(), &mut no_spans()).unwrap(), 3);
    }

    #[test]
    fn align_pad_is_computed_from_offset() {
        let mut bc = Bytecode::new(
            Contents::align(Expr::int(IntNum::new(8)), None, None, false),
            2,
        );
        bc.calc_len(&info(), &ctx(), &mut no_spans()).unwrap();
        assert_eq!(bc.get_special(), Special::Offset);
        assert_eq!(bc.update_offset(3).unwrap(), 8);
        assert_eq!(bc.len(), 5);
        assert_eq!(bc.update_offset(8).unwrap(), 8);
        assert_eq!(bc.len(), 0);
    }

    #[test]
    fn align_rejects_non_power_of_two() {
        let mut bc = Bytecode::new(
            Contents::align(Expr::int(IntNum::new(6)), None, None, false),
            2,
        );
        assert!(matches!(
            bc.calc_len(&info(), &ctx(), &mut no_spans()),
            Err(AsmError::Value { .. })
        ));
    }

    #[test]
    fn align_respects_maxskip() {
        let mut bc = Bytecode::new(
            Contents::align(
                Expr::int(IntNum::new(16)),
                None,
                Some(Expr::int(IntNum::new(3))),
                false,
            ),
            2,
        );
        bc.calc_len(&info(), &ctx(), &mut no_spans()).unwrap();
        // Pad of 2 is within maxskip.
        assert_eq!(bc.update_offset(14).unwrap(), 16);
        // Pad of 15 exceeds maxskip: error, length zero.
        let err = bc.update_offset(1).unwrap_err();
        assert!(matches!(err, AsmError::AlignOverflow { pad: 15, maxskip: 3, .. }));
        assert_eq!(bc.len(), 0);
    }

    #[test]
    fn org_sets_offset_or_errors_backward() {
        let mut bc = Bytecode::new(Contents::org(0x20, 0x90), 3);
        bc.calc_len(&info(), &ctx(), &mut no_spans()).unwrap();
        assert_eq!(bc.update_offset(0x08).unwrap(), 0x20);
        assert_eq!(bc.len(), 0x18);
        let err = bc.update_offset(0x30).unwrap_err();
        assert!(matches!(
            err,
            AsmError::OrgOverflow {
                target: 0x20,
                offset: 0x30,
                ..
            }
        ));
    }

    #[test]
    fn reserve_contributes_offset_without_bytes() {
        let mut bc = Bytecode::new(
            Contents::reserve(Expr::int(IntNum::new(4)), 2),
            1,
        );
        assert_eq!(bc.calc_len(&info(), &ctx(), &mut no_spans()).unwrap(), 8);
        assert_eq!(bc.get_special(), Special::Reserve);
    }

    #[test]
    fn leb128_registers_span_and_grows_monotonically() {
        let mut tab_obj = ctx();
        let sym = tab_obj.symtab_mut().get_or_new("n");
        let mut v = Value::from_sym(sym, 0);
        v.finalize().unwrap();
        let mut bc = Bytecode::new(Contents::leb128(alloc::vec![v], false), 1);
        let mut spans = alloc::vec::Vec::new();
        let len = bc
            .calc_len(&info(), &tab_obj, &mut |s| spans.push(s))
            .unwrap();
        assert_eq!(len, 1);
        assert_eq!(spans.len(), 1);
        assert!(spans[0].id < 0);

        // 127 still fits one byte; 128 grows to two.
        let exp = bc.expand(&info(), spans[0].id, 0, 127).unwrap();
        assert!(matches!(exp, Expansion::Growable { .. }));
        assert_eq!(bc.len(), 1);
        bc.expand(&info(), spans[0].id, 127, 128).unwrap();
        assert_eq!(bc.len(), 2);
        // Shrinking the value keeps the grown length.
        bc.expand(&info(), spans[0].id, 128, 1).unwrap();
        assert_eq!(bc.len(), 2);
    }

    #[test]
    fn multiple_composes_by_multiplication() {
        let mut bc = Bytecode::new(Contents::data_raw(alloc::vec![0xAA], 1), 1);
        bc.multiply_multiple(Expr::int(IntNum::new(3)));
        bc.multiply_multiple(Expr::int(IntNum::new(2)));
        let mut e = bc.multiple().unwrap().clone();
        e.simplify(true).unwrap();
        assert_eq!(e.get_intnum(), Some(&IntNum::new(6)));
    }
}
