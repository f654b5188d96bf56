//! Values: an expression plus output size and relocation metadata.
//!
//! A [`Value`] is what a bytecode ultimately emits into a field of
//! `size` bits.  [`Value::finalize`] freezes it after parsing: the
//! expression is normalized, `SEG`/`WRT` wrappers are split off, and a
//! single top-level symbol term is pulled out into `rel` — the
//! relocation-detection step.  What remains in `abs` must reduce to an
//! integer by emission time.

use alloc::boxed::Box;
use alloc::format;

use crate::error::AsmError;
use crate::expr::{EvalContext, Expr, ExprTerm, SymResolve, MAX_EQU_DEPTH};
use crate::intnum::IntNum;
use crate::object::Location;
use crate::op::Op;
use crate::symbol::SymbolId;

/// A value to be emitted into the assembled output.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    /// The absolute portion of the value.
    pub abs: Option<Box<Expr>>,
    /// Relocation target symbol, if any.
    pub rel: Option<SymbolId>,
    /// `WRT` override symbol, if any.
    pub wrt: Option<SymbolId>,
    /// True if the segment of `rel` is requested rather than its offset.
    pub seg_of: bool,
    /// Right shift applied to the relocated value (split relocations).
    pub rshift: u8,
    /// True if the value is relative to the current assembly position
    /// (PC-relative).
    pub curpos_rel: bool,
    /// True if the relative portion follows instruction-pointer
    /// semantics (x86 next-instruction addressing).
    pub ip_rel: bool,
    /// Signed output (affects overflow checking).
    pub sign: bool,
    /// Output field size in bits.
    pub size: u16,
}

impl Value {
    /// An empty (zero) value of the given bit size.
    pub fn new(size: u16) -> Self {
        Value {
            abs: None,
            rel: None,
            wrt: None,
            seg_of: false,
            rshift: 0,
            curpos_rel: false,
            ip_rel: false,
            sign: false,
            size,
        }
    }

    /// A value computed from an expression.
    pub fn from_expr(e: Expr, size: u16) -> Self {
        let mut v = Value::new(size);
        v.abs = Some(Box::new(e));
        v
    }

    /// A value that is a bare symbol reference.
    pub fn from_sym(id: SymbolId, size: u16) -> Self {
        let mut v = Value::new(size);
        v.rel = Some(id);
        v
    }

    /// Freeze the value after parsing: normalize, split `SEG`/`WRT`,
    /// and extract a single top-level symbol into `rel`.
    pub fn finalize(&mut self) -> Result<(), AsmError> {
        let Some(mut abs) = self.abs.take() else {
            return Ok(());
        };
        abs.level_tree(true, true, true, None)?;

        if abs.op == Op::Wrt {
            let target = abs.extract_wrt().ok_or(AsmError::Internal {
                msg: "malformed WRT expression".into(),
                line: 0,
            })?;
            match target.get_symbol() {
                Some(id) if self.wrt.is_none() => self.wrt = Some(id),
                _ => {
                    return Err(AsmError::Value {
                        msg: "WRT target must be a single symbol".into(),
                        line: 0,
                    })
                }
            }
            abs.level_tree(true, true, true, None)?;
        }

        if abs.op == Op::Seg {
            self.seg_of = true;
            match abs.terms.pop() {
                Some(ExprTerm::Expr(e)) => *abs = *e,
                Some(t) => *abs = Expr::ident(t),
                None => {
                    return Err(AsmError::Internal {
                        msg: "SEG with no operand".into(),
                        line: 0,
                    })
                }
            }
            abs.level_tree(true, true, true, None)?;
        }

        // Relocation detection: a single symbol at the top level moves
        // into `rel`; everything else stays in `abs`.
        if self.rel.is_none() {
            match abs.op {
                Op::Ident => {
                    if let Some(id) = abs.get_symbol() {
                        self.rel = Some(id);
                        return Ok(());
                    }
                }
                Op::Add => {
                    let mut sym_terms = abs
                        .terms
                        .iter()
                        .enumerate()
                        .filter(|(_, t)| matches!(t, ExprTerm::Sym(_)));
                    let first = sym_terms.next().map(|(i, _)| i);
                    let second = sym_terms.next();
                    if let (Some(idx), None) = (first, second) {
                        if let ExprTerm::Sym(id) = abs.terms.remove(idx) {
                            self.rel = Some(id);
                        }
                        if abs.terms.is_empty() {
                            return Ok(());
                        }
                        abs.level_tree(true, true, true, None)?;
                    }
                }
                _ => {}
            }
        }

        self.abs = Some(abs);
        Ok(())
    }

    /// The constant integer value, if the value needs no context at all.
    pub fn constant_intnum(&self) -> Option<&IntNum> {
        if self.rel.is_some() || self.wrt.is_some() || self.seg_of || self.curpos_rel {
            return None;
        }
        self.abs.as_ref()?.get_intnum()
    }

    /// Reduce the value to an integer under the given context.
    ///
    /// Returns `Ok(None)` when the value can only be represented through
    /// a relocation (external/common `rel`, `WRT`, `SEG`, split shifts).
    /// `origin` anchors PC-relative values: the start of the owning
    /// bytecode.
    pub fn get_intnum(
        &self,
        ctx: &dyn EvalContext,
        origin: Option<Location>,
    ) -> Result<Option<IntNum>, AsmError> {
        if self.seg_of || self.rshift > 0 || self.wrt.is_some() {
            return Ok(None);
        }

        let mut val = match &self.abs {
            Some(abs) => {
                let mut e = (**abs).clone();
                e.expand_syms(ctx, MAX_EQU_DEPTH)?;
                let dist = |from: Location, to: Location| -> Option<IntNum> {
                    if from.sect != to.sect {
                        return None;
                    }
                    let f = ctx.loc_offset(from)?;
                    let t = ctx.loc_offset(to)?;
                    Some(IntNum::new(t as i64 - f as i64))
                };
                e.level_tree(
                    true,
                    true,
                    true,
                    Some(&mut |n: &mut Expr| n.xform_dist(&dist)),
                )?;
                match e.get_intnum() {
                    Some(i) => i.clone(),
                    None => e.evaluate(ctx)?,
                }
            }
            None => IntNum::new(0),
        };

        if let Some(rel) = self.rel {
            match ctx.resolve_sym(rel) {
                SymResolve::Loc(l) => {
                    // A PC-relative reference into another section has no
                    // integer form; it needs a relocation.
                    if self.curpos_rel {
                        if let Some(origin) = origin {
                            if l.sect != origin.sect {
                                return Ok(None);
                            }
                        }
                    }
                    let off = ctx.loc_offset(l).ok_or(AsmError::Value {
                        msg: "unresolved location in expression".into(),
                        line: 0,
                    })?;
                    val.calc(Op::Add, Some(&IntNum::from(off)))?;
                }
                SymResolve::Equ(e) => {
                    let v = e.evaluate(ctx)?;
                    val.calc(Op::Add, Some(&v))?;
                }
                SymResolve::External(_) => return Ok(None),
                SymResolve::Unknown(name) => {
                    return Err(AsmError::UndefinedSymbol {
                        name: format!("{}", name),
                        line: 0,
                    })
                }
            }
        }

        if self.curpos_rel {
            let origin = origin.ok_or(AsmError::Internal {
                msg: "PC-relative value without an origin".into(),
                line: 0,
            })?;
            let off = ctx.loc_offset(origin).ok_or(AsmError::Value {
                msg: "unresolved location in expression".into(),
                line: 0,
            })?;
            val.calc(Op::Sub, Some(&IntNum::from(off)))?;
        }

        Ok(Some(val))
    }
}
