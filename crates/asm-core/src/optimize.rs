//! The span-resolution engine.
//!
//! A monotone fixpoint computation over the whole object:
//!
//! - **Phase 0 — finalize.**  Every bytecode freezes its values.
//! - **Phase 1 — index & initial length.**  Dense indices are assigned,
//!   `calc_len` collects span registrations, and section offsets are
//!   swept forward once.
//! - **Phase 2 — span evaluation.**  Every span's expression is reduced
//!   under the current offsets; spans that cannot be reduced are
//!   reported and dropped.
//! - **Phase 3 — iteration.**  A FIFO queue of triggered spans drives
//!   `expand` calls.  Growth shifts offsets in the owning section, every
//!   active span is re-examined in ascending span order, and newly
//!   triggered spans are appended.  Lengths only grow, so the fixpoint
//!   terminates; a pass guard converts pathological cycles into an
//!   error.
//! - **Phase 4 — freeze.**  A final reporting sweep writes offsets and
//!   surfaces org/align errors exactly once.
//!
//! Identical input produces identical output: the queue is FIFO over
//! span registration order, and re-examination walks spans in ascending
//! index order.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::bytecode::{BcInfo, Expansion, Special, SpanRequest};
use crate::error::{AsmError, Errwarns};
use crate::expr::{EvalContext, SymResolve};
use crate::object::{Location, Object, Section, SectionId};
use crate::symbol::{SymbolDef, SymbolId, SymbolTable};
use crate::value::Value;

/// Queue-pop guard: passes allowed per registered span before the
/// engine declares a cycle.
const MAX_SPAN_PASSES: usize = 100;

/// Engine-owned span storage: one record per `add_span` registration.
#[derive(Debug)]
struct Span {
    sect: usize,
    bc: usize,
    id: i32,
    value: Value,
    cur_val: i64,
    neg_thres: i64,
    pos_thres: i64,
    active: bool,
    queued: bool,
}

impl Span {
    fn origin(&self) -> Location {
        Location::new(SectionId::new(self.sect as u32), self.bc as u32, 0)
    }

    fn triggered_by(&self, new_val: i64) -> bool {
        if self.id < 0 {
            new_val != self.cur_val
        } else {
            new_val < self.neg_thres || new_val > self.pos_thres
        }
    }
}

/// Evaluation context over the engine's current state.  During phase 1
/// no offsets are known yet (`sections: None`); later phases resolve
/// locations against the in-progress offsets.
struct OptCtx<'a> {
    sections: Option<&'a [Section]>,
    symtab: &'a SymbolTable,
}

impl EvalContext for OptCtx<'_> {
    fn loc_offset(&self, loc: Location) -> Option<u64> {
        let sect = self.sections?.get(loc.sect.index())?;
        sect.offset_of(loc.bc as usize, loc.off)
    }

    fn resolve_sym(&self, id: SymbolId) -> SymResolve<'_> {
        let sym = self.symtab.get(id);
        match sym.def() {
            SymbolDef::Equ(e) => SymResolve::Equ(e),
            SymbolDef::Label(loc) => SymResolve::Loc(*loc),
            SymbolDef::Extern | SymbolDef::Common { .. } | SymbolDef::Special(_) => {
                SymResolve::External(sym.name())
            }
            SymbolDef::Undefined => SymResolve::Unknown(sym.name()),
        }
    }
}

/// Sweep a section's offsets forward.  Errors from OFFSET bytecodes are
/// reported only when `report` is given (the freeze sweep); iteration
/// sweeps stay silent so each error surfaces once.
fn sweep_section(sect: &mut Section, mut report: Option<&mut Errwarns>) {
    let mut off = 0u64;
    for bc in &mut sect.bytecodes {
        match bc.update_offset(off) {
            Ok(next) => off = next,
            Err(e) => {
                if let Some(ew) = report.as_deref_mut() {
                    ew.error(e);
                }
                off = bc.next_offset();
            }
        }
    }
}

/// Evaluate a span's value to an `i64` under the given context.
fn span_value(span: &Span, ctx: &OptCtx<'_>) -> Result<i64, AsmError> {
    match span.value.get_intnum(ctx, Some(span.origin()))? {
        Some(v) => v.to_i64().ok_or(AsmError::Value {
            msg: "span value out of range".into(),
            line: 0,
        }),
        None => Err(AsmError::SpanUnresolved { line: 0 }),
    }
}

/// Run phases 0-4 over the object.  Errors accumulate in `errwarns`;
/// offsets and lengths are final on return unless a fatal error was
/// recorded.
pub fn optimize(object: &mut Object, errwarns: &mut Errwarns) {
    // ── Phase 0: finalize ──────────────────────────────────
    for (s, sect) in object.sections.iter_mut().enumerate() {
        for (i, bc) in sect.bytecodes.iter_mut().enumerate() {
            let info = BcInfo {
                sect: SectionId::new(s as u32),
                bc: i as u32,
                index: 0,
                offset: 0,
                line: bc.line(),
            };
            if let Err(e) = bc.finalize(&info) {
                errwarns.error(e.with_line(bc.line()));
            }
        }
    }
    if errwarns.has_errors() {
        return;
    }

    // ── Phase 1: index, minimum lengths, initial offsets ───
    let mut spans: Vec<Span> = Vec::new();
    let mut next_index = 0u32;
    {
        let sections = &mut object.sections;
        let symtab = &object.symtab;
        for s in 0..sections.len() {
            for i in 0..sections[s].bytecodes.len() {
                let line = sections[s].bytecodes[i].line();
                let special = sections[s].bytecodes[i].get_special();

                let mult = match sections[s].bytecodes[i].multiple() {
                    None => 1,
                    Some(_) if special == Special::Offset => {
                        errwarns.error(AsmError::Value {
                            msg: "cannot repeat an offset bytecode".into(),
                            line,
                        });
                        1
                    }
                    Some(m) => {
                        let ctx = OptCtx {
                            sections: None,
                            symtab,
                        };
                        match m.evaluate(&ctx).map(|v| v.to_i64()) {
                            Ok(Some(v)) if v >= 0 => v,
                            Ok(_) => {
                                errwarns.error(AsmError::Value {
                                    msg: "multiple must be a non-negative integer"
                                        .into(),
                                    line,
                                });
                                1
                            }
                            Err(e) => {
                                errwarns.error(e.with_line(line));
                                1
                            }
                        }
                    }
                };
                sections[s].bytecodes[i].set_mult_int(mult);
                sections[s].bytecodes[i].set_index(next_index);

                let info = BcInfo {
                    sect: SectionId::new(s as u32),
                    bc: i as u32,
                    index: next_index,
                    offset: 0,
                    line,
                };
                next_index += 1;

                let ctx = OptCtx {
                    sections: None,
                    symtab,
                };
                let result = sections[s].bytecodes[i].calc_len(&info, &ctx, &mut |req: SpanRequest| {
                    spans.push(Span {
                        sect: s,
                        bc: i,
                        id: req.id,
                        value: req.value,
                        cur_val: 0,
                        neg_thres: req.neg_thres,
                        pos_thres: req.pos_thres,
                        active: true,
                        queued: false,
                    });
                });
                if let Err(e) = result {
                    errwarns.error(e.with_line(line));
                }
            }
            sweep_section(&mut sections[s], None);
        }
    }

    // ── Phase 2: initial span evaluation ───────────────────
    let mut queue: VecDeque<usize> = VecDeque::new();
    {
        let ctx = OptCtx {
            sections: Some(&object.sections),
            symtab: &object.symtab,
        };
        for (k, span) in spans.iter_mut().enumerate() {
            match span_value(span, &ctx) {
                Ok(n) => {
                    if span.triggered_by(n) {
                        span.queued = true;
                        queue.push_back(k);
                    }
                }
                Err(e) => {
                    let line = ctx.sections.map_or(0, |secs| {
                        secs[span.sect].bytecodes[span.bc].line()
                    });
                    errwarns.error(e.with_line(line));
                    span.active = false;
                }
            }
        }
    }

    // ── Phase 3: iteration to fixpoint ─────────────────────
    let pop_limit = MAX_SPAN_PASSES * spans.len().max(1);
    let mut pops = 0usize;
    while let Some(k) = queue.pop_front() {
        pops += 1;
        if pops > pop_limit {
            errwarns.error(AsmError::SpanLimit {
                max: MAX_SPAN_PASSES,
            });
            return;
        }
        spans[k].queued = false;
        if !spans[k].active {
            continue;
        }

        // Re-evaluate under the offsets as they stand now.
        let evaluated = {
            let ctx = OptCtx {
                sections: Some(&object.sections),
                symtab: &object.symtab,
            };
            span_value(&spans[k], &ctx)
        };
        let line = object.sections[spans[k].sect].bytecodes[spans[k].bc].line();
        let new_val = match evaluated {
            Ok(n) => n,
            Err(e) => {
                errwarns.error(e.with_line(line));
                spans[k].active = false;
                continue;
            }
        };
        let old_val = spans[k].cur_val;
        spans[k].cur_val = new_val;
        let triggered = if spans[k].id < 0 {
            new_val != old_val
        } else {
            new_val < spans[k].neg_thres || new_val > spans[k].pos_thres
        };
        if !triggered {
            continue;
        }

        let (s, b, id) = (spans[k].sect, spans[k].bc, spans[k].id);
        let old_len = object.sections[s].bytecodes[b].len();
        let info = BcInfo {
            sect: SectionId::new(s as u32),
            bc: b as u32,
            index: object.sections[s].bytecodes[b].index(),
            offset: object.sections[s].bytecodes[b].offset(),
            line,
        };
        match object.sections[s].bytecodes[b].expand(&info, id, old_val, new_val) {
            Err(e) => {
                errwarns.error(e.with_line(line));
                spans[k].active = false;
                continue;
            }
            Ok(Expansion::Done) => spans[k].active = false,
            Ok(Expansion::Growable {
                neg_thres,
                pos_thres,
            }) => {
                spans[k].neg_thres = neg_thres;
                spans[k].pos_thres = pos_thres;
            }
        }

        if object.sections[s].bytecodes[b].len() != old_len {
            // The growth shifts every later offset in this section.
            sweep_section(&mut object.sections[s], None);
            // Re-examine every active span, ascending, and enqueue those
            // whose value now crosses their thresholds.
            let ctx = OptCtx {
                sections: Some(&object.sections),
                symtab: &object.symtab,
            };
            for j in 0..spans.len() {
                if !spans[j].active || spans[j].queued {
                    continue;
                }
                let requeue = match span_value(&spans[j], &ctx) {
                    Ok(n) => spans[j].triggered_by(n),
                    // Surface the error through the normal dequeue path.
                    Err(_) => true,
                };
                if requeue {
                    spans[j].queued = true;
                    queue.push_back(j);
                }
            }
        }
    }

    // ── Phase 4: freeze ────────────────────────────────────
    for sect in &mut object.sections {
        sweep_section(sect, Some(errwarns));
    }
}
