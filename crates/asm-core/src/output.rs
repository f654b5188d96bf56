//! Emission driver: final byte output through caller-supplied sinks.
//!
//! Once offsets are frozen, [`output_section`] walks a section's
//! bytecodes in order and renders each through an [`Output`]
//! implementation.  Object-format writers implement `Output` to evaluate
//! values against final offsets and record relocations; [`BasicOutput`]
//! is the provided baseline for raw/in-memory output, which accepts only
//! fully-resolved values.
//!
//! Errant bytecodes emit zero bytes of their settled length, so one bad
//! value never shifts the rest of the image.

use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

use crate::bytecode::{BcInfo, Special};
use crate::error::{AsmError, Errwarns};
use crate::intnum::RangeType;
use crate::object::{Location, Object, SectionId};
use crate::symbol::SymbolId;
use crate::value::Value;

/// Sink for section emission.
///
/// `value` converts a [`Value`] into bytes in `buf` (already sized to
/// the destination field); `warn` selects overflow checking: 0 none,
/// positive unsigned, negative signed.  `reloc` records a relocation
/// against `sym` at `loc`.
pub trait Output {
    /// Emit finished bytes.
    fn bytes(&mut self, data: &[u8]) -> Result<(), AsmError>;

    /// Emit a gap (reserved space with no bytes).
    fn gap(&mut self, len: u64) -> Result<(), AsmError>;

    /// Render a value into `buf`, emitting a relocation if needed.
    fn value(
        &mut self,
        value: &Value,
        buf: &mut [u8],
        loc: Location,
        warn: i32,
    ) -> Result<(), AsmError>;

    /// Record a relocation against `sym` for a `valsize`-bit field at
    /// `loc`.
    fn reloc(&mut self, sym: SymbolId, loc: Location, valsize: u16)
        -> Result<(), AsmError>;
}

/// Walk a section and emit every bytecode through `out`.
///
/// Per-bytecode errors accumulate in `errwarns` (the bytecode emits
/// zeros of its settled length); sink errors abort.
pub fn output_section(
    object: &Object,
    id: SectionId,
    out: &mut dyn Output,
    errwarns: &mut Errwarns,
) -> Result<(), AsmError> {
    let sect = object.section(id);
    for (bi, bc) in sect.bytecodes().iter().enumerate() {
        if bc.get_special() == Special::Reserve || sect.is_bss() {
            out.gap(bc.total_len())?;
            continue;
        }
        let len = bc.len();
        let offset = bc.known_offset().ok_or(AsmError::Internal {
            msg: "section emitted before optimization".into(),
            line: bc.line(),
        })?;
        for copy in 0..bc.mult_int().max(0) as u64 {
            let info = BcInfo {
                sect: id,
                bc: bi as u32,
                index: bc.index(),
                offset: offset + copy * len,
                line: bc.line(),
            };
            let mut buf: Vec<u8> = Vec::with_capacity(len as usize);
            match bc.to_bytes(&info, object.arch(), &mut buf, out) {
                Ok(()) if buf.len() as u64 == len => out.bytes(&buf)?,
                Ok(()) => {
                    errwarns.error(AsmError::Internal {
                        msg: format!(
                            "bytecode rendered {} bytes, expected {}",
                            buf.len(),
                            len
                        ),
                        line: bc.line(),
                    });
                    buf.resize(len as usize, 0);
                    out.bytes(&buf)?;
                }
                Err(e) => {
                    errwarns.error(e.with_line(bc.line()));
                    out.bytes(&vec![0u8; len as usize])?;
                }
            }
        }
    }
    Ok(())
}

/// In-memory raw output: values must reduce to integers, gaps become
/// zero bytes, and relocations are rejected.  Out-of-range values are
/// collected as warnings keyed by location.
#[derive(Debug)]
pub struct BasicOutput<'a> {
    object: &'a Object,
    buf: Vec<u8>,
    warnings: Vec<(Location, alloc::string::String)>,
}

impl<'a> BasicOutput<'a> {
    /// Create a raw output sink over a frozen object.
    pub fn new(object: &'a Object) -> Self {
        BasicOutput {
            object,
            buf: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// The bytes emitted so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the sink and return the emitted bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Overflow warnings collected during emission.
    pub fn warnings(&self) -> &[(Location, alloc::string::String)] {
        &self.warnings
    }
}

impl Output for BasicOutput<'_> {
    fn bytes(&mut self, data: &[u8]) -> Result<(), AsmError> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn gap(&mut self, len: u64) -> Result<(), AsmError> {
        self.buf.extend(core::iter::repeat(0u8).take(len as usize));
        Ok(())
    }

    fn value(
        &mut self,
        value: &Value,
        buf: &mut [u8],
        loc: Location,
        warn: i32,
    ) -> Result<(), AsmError> {
        // PC-relative values are anchored at the start of their
        // bytecode.
        let origin = Location::new(loc.sect, loc.bc, 0);
        match value.get_intnum(self.object, Some(origin))? {
            Some(v) => {
                if warn != 0 {
                    let bits = if value.size > 0 {
                        u32::from(value.size)
                    } else {
                        buf.len() as u32 * 8
                    };
                    let range = if warn < 0 {
                        RangeType::Signed
                    } else {
                        RangeType::Unsigned
                    };
                    if !v.ok_size(bits, 0, range) {
                        self.warnings.push((
                            loc,
                            format!("value {} does not fit in {} bits", v, bits),
                        ));
                    }
                }
                v.write_le(buf);
                Ok(())
            }
            None => Err(AsmError::Value {
                msg: "value requires a relocation, which raw output cannot represent"
                    .into(),
                line: 0,
            }),
        }
    }

    fn reloc(
        &mut self,
        _sym: SymbolId,
        _loc: Location,
        _valsize: u16,
    ) -> Result<(), AsmError> {
        Err(AsmError::Value {
            msg: "relocation in raw output".into(),
            line: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Generic;
    use crate::bytecode::{Bytecode, Contents, Dataval};
    use crate::expr::Expr;
    use crate::intnum::IntNum;
    use crate::value::Value;
    use alloc::boxed::Box;

    fn emit(obj: &Object, id: SectionId) -> (Vec<u8>, Errwarns) {
        let mut out = BasicOutput::new(obj);
        let mut ew = Errwarns::new();
        output_section(obj, id, &mut out, &mut ew).unwrap();
        (out.into_bytes(), ew)
    }

    #[test]
    fn data_and_reserve_emission() {
        let mut obj = Object::new(Box::new(Generic::new(64)));
        let text = obj.append_section("text", true);
        let sect = obj.section_mut(text);
        sect.append_bytecode(Bytecode::new(Contents::data_raw(vec![0xDE, 0xAD], 1), 1));
        sect.append_bytecode(Bytecode::new(
            Contents::reserve(Expr::int(IntNum::new(3)), 1),
            2,
        ));
        sect.append_bytecode(Bytecode::new(
            Contents::data(
                vec![Dataval::Value(Value::from_expr(
                    Expr::int(IntNum::new(0x0102_0304)),
                    32,
                ))],
                4,
                false,
            ),
            3,
        ));
        let mut ew = Errwarns::new();
        obj.optimize(&mut ew);
        assert!(!ew.has_errors());

        let (bytes, ew) = emit(&obj, text);
        assert!(!ew.has_errors());
        assert_eq!(bytes, [0xDE, 0xAD, 0, 0, 0, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn repeated_bytecode_emits_copies() {
        let mut obj = Object::new(Box::new(Generic::new(64)));
        let text = obj.append_section("text", true);
        let mut bc = Bytecode::new(Contents::data_raw(vec![0x90], 1), 1);
        bc.set_multiple(Expr::int(IntNum::new(4)));
        obj.section_mut(text).append_bytecode(bc);
        let mut ew = Errwarns::new();
        obj.optimize(&mut ew);
        let (bytes, _) = emit(&obj, text);
        assert_eq!(bytes, [0x90; 4]);
    }

    #[test]
    fn value_overflow_is_a_warning_not_an_error() {
        let mut obj = Object::new(Box::new(Generic::new(64)));
        let text = obj.append_section("text", true);
        obj.section_mut(text).append_bytecode(Bytecode::new(
            Contents::data(
                vec![Dataval::Value(Value::from_expr(
                    Expr::int(IntNum::new(0x1FF)),
                    8,
                ))],
                1,
                false,
            ),
            1,
        ));
        let mut ew = Errwarns::new();
        obj.optimize(&mut ew);
        let mut out = BasicOutput::new(&obj);
        let mut emit_errs = Errwarns::new();
        output_section(&obj, text, &mut out, &mut emit_errs).unwrap();
        assert!(!emit_errs.has_errors());
        assert_eq!(out.warnings().len(), 1);
        assert_eq!(out.bytes(), [0xFF]);
    }

    #[test]
    fn external_value_is_per_bytecode_error_with_zero_fill() {
        let mut obj = Object::new(Box::new(Generic::new(64)));
        let ext = obj.symtab_mut().get_or_new("puts");
        obj.symtab_mut()
            .declare(ext, crate::symbol::Visibility::EXTERN, 1)
            .unwrap();
        let text = obj.append_section("text", true);
        obj.section_mut(text).append_bytecode(Bytecode::new(
            Contents::data(
                vec![Dataval::Value(Value::from_sym(ext, 32))],
                4,
                false,
            ),
            1,
        ));
        obj.section_mut(text)
            .append_bytecode(Bytecode::new(Contents::data_raw(vec![0xCC], 1), 2));
        let mut ew = Errwarns::new();
        obj.optimize(&mut ew);
        assert!(!ew.has_errors());
        let (bytes, emit_errs) = emit(&obj, text);
        // The unresolvable field emits zeros; the rest is untouched.
        assert_eq!(bytes, [0, 0, 0, 0, 0xCC]);
        assert!(emit_errs.has_errors());
    }
}
