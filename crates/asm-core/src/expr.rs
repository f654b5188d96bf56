//! Expression trees.
//!
//! An [`Expr`] is an operator plus an ordered list of terms; associative
//! operators become n-ary after leveling.  Normalization is three
//! transforms applied post-order, in order:
//!
//! 1. **Negative normalization** — `-x` becomes `-1*x`, `a-b` becomes
//!    `a+(-1*b)`, with distribution over nested additions so negations
//!    sink to leaves.
//! 2. **Leveling** — children sharing an associative parent's operator are
//!    absorbed into the parent's term list; integer terms fold to at most
//!    one per level.
//! 3. **Identity simplification** — `0*x`, `1*x`, `0+x`, `-1&x`, `x<<0`
//!    and friends collapse, using the unique integer term of the level.
//!
//! The `1*register` product is deliberately kept when the caller is
//! building an effective address (`simplify_reg_mul = false`), so index
//! registers stay distinguishable.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;

use crate::arch::Register;
use crate::error::AsmError;
use crate::floatnum::FloatNum;
use crate::intnum::IntNum;
use crate::object::Location;
use crate::op::Op;
use crate::symbol::SymbolId;

/// Maximum EQU-chain depth during symbol expansion and evaluation.
pub(crate) const MAX_EQU_DEPTH: u32 = 64;

/// Leaf/term kind selector for [`Expr::contains`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TermKind {
    /// Tombstone.
    None,
    /// Register leaf.
    Reg,
    /// Integer leaf.
    Int,
    /// Substitution hole.
    Subst,
    /// Float leaf.
    Float,
    /// Symbol reference.
    Sym,
    /// Location reference.
    Loc,
    /// Sub-expression.
    Expr,
}

/// A single expression term.
///
/// `None` is a tombstone used during in-place mutation: a term is
/// `take()`n out, transformed, and written back without intermediate
/// clones.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExprTerm {
    /// Tombstone (removed before any transform returns).
    None,
    /// A register.
    Reg(Register),
    /// An integer.
    Int(IntNum),
    /// A substitution hole with its index.
    Subst(usize),
    /// A float.
    Float(Box<FloatNum>),
    /// A symbol reference.
    Sym(SymbolId),
    /// A location reference into the assembled stream.
    Loc(Location),
    /// A nested sub-expression.
    Expr(Box<Expr>),
}

impl ExprTerm {
    /// The kind of this term.
    pub fn kind(&self) -> TermKind {
        match self {
            ExprTerm::None => TermKind::None,
            ExprTerm::Reg(_) => TermKind::Reg,
            ExprTerm::Int(_) => TermKind::Int,
            ExprTerm::Subst(_) => TermKind::Subst,
            ExprTerm::Float(_) => TermKind::Float,
            ExprTerm::Sym(_) => TermKind::Sym,
            ExprTerm::Loc(_) => TermKind::Loc,
            ExprTerm::Expr(_) => TermKind::Expr,
        }
    }

    /// Replace with the tombstone, returning the previous term.
    pub fn take(&mut self) -> ExprTerm {
        core::mem::replace(self, ExprTerm::None)
    }

    /// The integer payload, if this is an integer term.
    pub fn get_int(&self) -> Option<&IntNum> {
        match self {
            ExprTerm::Int(i) => Some(i),
            _ => None,
        }
    }

    /// The sub-expression payload, if this is an expression term.
    pub fn get_expr(&self) -> Option<&Expr> {
        match self {
            ExprTerm::Expr(e) => Some(e),
            _ => None,
        }
    }
}

/// An expression: an operator over an ordered term list.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Expr {
    pub(crate) op: Op,
    pub(crate) terms: Vec<ExprTerm>,
}

/// Resolution of a symbol reference during evaluation.
#[derive(Debug)]
pub enum SymResolve<'a> {
    /// Symbol is an EQU bound to an expression.
    Equ(&'a Expr),
    /// Symbol is a label at a location.
    Loc(Location),
    /// Symbol is defined in another object (needs a relocation).
    External(&'a str),
    /// Symbol is not defined.
    Unknown(&'a str),
}

/// Resolution source for expression evaluation: location offsets and
/// symbol bindings.
pub trait EvalContext {
    /// Section-relative offset of a location, once known.
    fn loc_offset(&self, loc: Location) -> Option<u64>;
    /// Resolve a symbol reference.
    fn resolve_sym(&self, id: SymbolId) -> SymResolve<'_>;
}

// ─── Identity tables ───────────────────────────────────────

/// Identities that make the entire result constant: `0*x`, `0&x`,
/// `0&&x`, `-1|x`.
fn is_constant(op: Op, intn: &IntNum) -> bool {
    let zero = intn.is_zero();
    (zero && op == Op::Mul)
        || (zero && op == Op::And)
        || (zero && op == Op::Land)
        || (intn.is_neg1() && op == Op::Or)
}

/// "Left" identities that delete the integer: `1*x`, `0+x`, `-1&x`,
/// `nonzero&&x`, `0|x`, `0||x`.
fn can_destroy_int_left(op: Op, intn: &IntNum) -> bool {
    let zero = intn.is_zero();
    (intn.is_pos1() && op == Op::Mul)
        || (zero && op == Op::Add)
        || (intn.is_neg1() && op == Op::And)
        || (!zero && op == Op::Land)
        || (zero && op == Op::Or)
        || (zero && op == Op::Lor)
}

/// "Right" identities that delete the integer: `x*1`, `x/1`, `x+0`,
/// `x-0`, `x&-1`, `x&&nonzero`, `x|0`, `x||0`, `x<<0`, `x>>0`.
fn can_destroy_int_right(op: Op, intn: &IntNum) -> bool {
    let zero = intn.is_zero();
    let pos1 = intn.is_pos1();
    (pos1 && op == Op::Mul)
        || (pos1 && op == Op::Div)
        || (zero && op == Op::Add)
        || (zero && op == Op::Sub)
        || (intn.is_neg1() && op == Op::And)
        || (!zero && op == Op::Land)
        || (zero && op == Op::Or)
        || (zero && op == Op::Lor)
        || (zero && op == Op::Shl)
        || (zero && op == Op::Shr)
}

/// Unwrap chains of single-term IDENT wrappers in place.
fn unwrap_ident_chain(term: &mut ExprTerm) {
    loop {
        let inner = match term {
            ExprTerm::Expr(e) if e.op == Op::Ident && e.terms.len() == 1 => {
                e.terms.pop()
            }
            _ => return,
        };
        match inner {
            Some(t) => *term = t,
            None => return,
        }
    }
}

/// Negate a single term by wrapping it in a `-1 * term` product.
fn neg_term(term: &mut ExprTerm) {
    let inner = term.take();
    *term = ExprTerm::Expr(Box::new(Expr {
        op: Op::Mul,
        terms: vec![ExprTerm::Int(IntNum::new(-1)), inner],
    }));
}

fn push_leveled(
    op: Op,
    fold_const: bool,
    terms: &mut Vec<ExprTerm>,
    int_pos: &mut Option<usize>,
    t: ExprTerm,
) -> Result<(), AsmError> {
    if fold_const {
        if let ExprTerm::Int(rhs) = &t {
            if let Some(j) = *int_pos {
                if let ExprTerm::Int(acc) = &mut terms[j] {
                    acc.calc(op, Some(rhs))?;
                    return Ok(());
                }
            }
            *int_pos = Some(terms.len());
        }
    }
    terms.push(t);
    Ok(())
}

impl Expr {
    // ── construction ───────────────────────────────────────

    /// Build an expression, validating arity: unary operators take one
    /// term, `Cond` takes three, other non-associative operators take
    /// two, associative operators take two or more.
    pub fn new(op: Op, terms: Vec<ExprTerm>) -> Result<Expr, AsmError> {
        let arity_ok = match terms.len() {
            0 => false,
            1 => op.is_unary() || op == Op::Ident,
            2 => op != Op::Cond,
            3 => op == Op::Cond || op.is_associative(),
            _ => op.is_associative(),
        };
        if !arity_ok {
            return Err(AsmError::Value {
                msg: format!("operator '{}' cannot take {} terms", op, terms.len()),
                line: 0,
            });
        }
        let mut e = Expr {
            op,
            terms: Vec::with_capacity(terms.len()),
        };
        for t in terms {
            e.add_term(t);
        }
        Ok(e)
    }

    /// Identity expression over a single term.
    pub fn ident(term: ExprTerm) -> Expr {
        let mut e = Expr {
            op: Op::Ident,
            terms: Vec::with_capacity(1),
        };
        e.add_term(term);
        e
    }

    /// Integer leaf expression.
    pub fn int(i: IntNum) -> Expr {
        Expr::ident(ExprTerm::Int(i))
    }

    /// Symbol-reference leaf expression.
    pub fn sym(id: SymbolId) -> Expr {
        Expr::ident(ExprTerm::Sym(id))
    }

    /// Location-reference leaf expression.
    pub fn loc(l: Location) -> Expr {
        Expr::ident(ExprTerm::Loc(l))
    }

    /// Register leaf expression.
    pub fn reg(r: Register) -> Expr {
        Expr::ident(ExprTerm::Reg(r))
    }

    /// Float leaf expression.
    pub fn float(f: FloatNum) -> Expr {
        Expr::ident(ExprTerm::Float(Box::new(f)))
    }

    /// Unary expression.  `op` must be a unary operator.
    pub fn unary(op: Op, e: Expr) -> Expr {
        debug_assert!(op.is_unary());
        let mut r = Expr {
            op,
            terms: Vec::with_capacity(1),
        };
        r.add_term(ExprTerm::Expr(Box::new(e)));
        r
    }

    /// Binary expression.
    pub fn binary(a: Expr, op: Op, b: Expr) -> Expr {
        let mut r = Expr {
            op,
            terms: Vec::with_capacity(2),
        };
        r.add_term(ExprTerm::Expr(Box::new(a)));
        r.add_term(ExprTerm::Expr(Box::new(b)));
        r
    }

    /// Three-term conditional.
    pub fn cond(sel: Expr, if_true: Expr, if_false: Expr) -> Expr {
        let mut r = Expr {
            op: Op::Cond,
            terms: Vec::with_capacity(3),
        };
        r.add_term(ExprTerm::Expr(Box::new(sel)));
        r.add_term(ExprTerm::Expr(Box::new(if_true)));
        r.add_term(ExprTerm::Expr(Box::new(if_false)));
        r
    }

    /// Append a term, splicing out single-term IDENT wrapper chains so
    /// trivial nesting never accumulates.
    pub fn add_term(&mut self, mut term: ExprTerm) {
        unwrap_ident_chain(&mut term);
        self.terms.push(term);
    }

    /// The operator.
    pub fn op(&self) -> Op {
        self.op
    }

    /// The terms, in order.
    pub fn terms(&self) -> &[ExprTerm] {
        &self.terms
    }

    // ── leaf accessors (identity form) ─────────────────────

    /// The integer value, if this expression is an integer in identity
    /// form.
    pub fn get_intnum(&self) -> Option<&IntNum> {
        match (self.op, self.terms.first()) {
            (Op::Ident, Some(ExprTerm::Int(i))) => Some(i),
            _ => None,
        }
    }

    /// The symbol, if this expression is a symbol reference in identity
    /// form.
    pub fn get_symbol(&self) -> Option<SymbolId> {
        match (self.op, self.terms.first()) {
            (Op::Ident, Some(ExprTerm::Sym(id))) => Some(*id),
            _ => None,
        }
    }

    /// The register, if this expression is a register in identity form.
    pub fn get_reg(&self) -> Option<Register> {
        match (self.op, self.terms.first()) {
            (Op::Ident, Some(ExprTerm::Reg(r))) => Some(*r),
            _ => None,
        }
    }

    /// The float, if this expression is a float in identity form.
    pub fn get_float(&self) -> Option<&FloatNum> {
        match (self.op, self.terms.first()) {
            (Op::Ident, Some(ExprTerm::Float(f))) => Some(f),
            _ => None,
        }
    }

    // ── normalization ──────────────────────────────────────

    /// Full normalization with constant folding and identity
    /// simplification.
    pub fn simplify(&mut self, simplify_reg_mul: bool) -> Result<(), AsmError> {
        self.level_tree(true, true, simplify_reg_mul, None)
    }

    /// Recursively normalize the tree: negative normalization, leveling,
    /// and (optionally) constant folding and identity simplification.
    ///
    /// `xform_extra` runs at every node after leveling; a cleanup
    /// re-level pass (without the callback) follows so its rewrites are
    /// folded in.  The span engine uses this to turn location-reference
    /// differences into integer distances once both endpoints are known.
    pub fn level_tree(
        &mut self,
        fold_const: bool,
        simplify_ident: bool,
        simplify_reg_mul: bool,
        mut xform_extra: Option<&mut dyn FnMut(&mut Expr)>,
    ) -> Result<(), AsmError> {
        self.xform_neg();

        for t in &mut self.terms {
            if let ExprTerm::Expr(e) = t {
                let extra: Option<&mut dyn FnMut(&mut Expr)> = match &mut xform_extra {
                    Some(f) => Some(&mut **f),
                    None => None,
                };
                e.level_tree(fold_const, simplify_ident, simplify_reg_mul, extra)?;
            }
        }

        // SEG of SEG:OFF simplifies to just the segment.
        if self.op == Op::Seg {
            if let Some(ExprTerm::Expr(e)) = self.terms.first_mut() {
                if e.op == Op::SegOff && e.terms.len() == 2 {
                    self.op = Op::Ident;
                    e.op = Op::Ident;
                    e.terms.pop();
                }
            }
        }

        self.level_op(fold_const, simplify_ident, simplify_reg_mul)?;

        // A constant selector picks a conditional branch.
        if self.op == Op::Cond && self.terms.len() == 3 {
            let pick = match &self.terms[0] {
                ExprTerm::Int(sel) => Some(if sel.is_zero() { 2 } else { 1 }),
                _ => None,
            };
            if let Some(pick) = pick {
                let chosen = self.terms[pick].take();
                self.op = Op::Ident;
                self.terms.clear();
                self.add_term(chosen);
                self.splice_single_expr();
            }
        }

        if let Some(f) = xform_extra {
            f(self);
            // Cleanup pass; no callback, so this cannot recurse forever.
            self.level_tree(fold_const, simplify_ident, simplify_reg_mul, None)?;
        }
        Ok(())
    }

    /// Rewrite negations into `-1 *` products: `-x` → `-1*x`, `a-b` →
    /// `a+(-1*b)`, distributing over additions.
    fn xform_neg(&mut self) {
        match self.op {
            Op::Neg => {
                self.op = Op::Ident;
                self.xform_neg_helper();
            }
            Op::Sub => {
                self.op = Op::Add;
                if let Some(rhs) = self.terms.get_mut(1) {
                    if let ExprTerm::Expr(e) = rhs {
                        e.xform_neg_helper();
                    } else {
                        neg_term(rhs);
                    }
                }
            }
            _ => {}
        }
    }

    /// Negate this expression by multiplying by -1, distributing over
    /// lower-precedence operators and collapsing double negation.
    fn xform_neg_helper(&mut self) {
        match self.op {
            Op::Add => {
                for t in &mut self.terms {
                    if let ExprTerm::Expr(e) = t {
                        e.xform_neg_helper();
                    } else {
                        neg_term(t);
                    }
                }
            }
            Op::Sub => {
                // -(a-b) = (-a)+b
                self.op = Op::Add;
                if let Some(first) = self.terms.first_mut() {
                    if let ExprTerm::Expr(e) = first {
                        e.xform_neg_helper();
                    } else {
                        neg_term(first);
                    }
                }
            }
            Op::Neg => {
                // Negating a negation: identity.
                self.op = Op::Ident;
            }
            Op::Ident => {
                let Some(first) = self.terms.first_mut() else {
                    return;
                };
                match first {
                    ExprTerm::Float(f) => {
                        let _ = f.calc(Op::Neg);
                    }
                    ExprTerm::Int(i) => {
                        let _ = i.calc(Op::Neg, None);
                    }
                    ExprTerm::Expr(e) if e.contains(TermKind::Float) => {
                        e.xform_neg_helper();
                    }
                    _ => {
                        self.op = Op::Mul;
                        self.terms.push(ExprTerm::Int(IntNum::new(-1)));
                    }
                }
            }
            _ => {
                // Everything else: replace with -1 * (self); the product
                // combines when leveled.
                let inner = Expr {
                    op: self.op,
                    terms: core::mem::take(&mut self.terms),
                };
                self.op = Op::Mul;
                self.terms.push(ExprTerm::Int(IntNum::new(-1)));
                self.terms.push(ExprTerm::Expr(Box::new(inner)));
            }
        }
    }

    /// One level of leveling: bring up IDENT values, flatten children
    /// sharing this node's associative operator, fold integer constants,
    /// and simplify identities.
    fn level_op(
        &mut self,
        fold_const: bool,
        simplify_ident: bool,
        simplify_reg_mul: bool,
    ) -> Result<(), AsmError> {
        let fold_const = fold_const && self.op.is_numeric();
        let op = self.op;
        let mut do_level = false;
        let mut int_idx: Option<usize> = None;
        let mut folded = false;

        for i in 0..self.terms.len() {
            unwrap_ident_chain(&mut self.terms[i]);
            if let ExprTerm::Expr(e) = &self.terms[i] {
                if e.op == op {
                    do_level = true;
                }
            }
            if fold_const && matches!(self.terms[i], ExprTerm::Int(_)) {
                match int_idx {
                    None => int_idx = Some(i),
                    Some(j) => {
                        let rhs = self.terms[i].take();
                        if let (ExprTerm::Int(acc), ExprTerm::Int(rhs)) =
                            (&mut self.terms[j], &rhs)
                        {
                            acc.calc(op, Some(rhs))?;
                            folded = true;
                        }
                    }
                }
            }
        }
        if folded {
            self.terms.retain(|t| !matches!(t, ExprTerm::None));
        }

        let flattened = do_level && op.is_associative();
        if flattened {
            let old = core::mem::take(&mut self.terms);
            let mut terms: Vec<ExprTerm> = Vec::with_capacity(old.len());
            let mut int_pos: Option<usize> = None;
            for t in old {
                match t {
                    ExprTerm::Expr(e) if e.op == op => {
                        let e = *e;
                        for sub in e.terms {
                            push_leveled(op, fold_const, &mut terms, &mut int_pos, sub)?;
                        }
                    }
                    other => {
                        push_leveled(op, fold_const, &mut terms, &mut int_pos, other)?;
                    }
                }
            }
            self.terms = terms;
        }

        // Identity simplification uses the unique folded integer of the
        // level.  A node only collapses to IDENT without one when it is
        // a flattened associative level (unary operators keep their
        // single term).
        let has_int = fold_const
            && self
                .terms
                .iter()
                .any(|t| matches!(t, ExprTerm::Int(_)));
        if simplify_ident && has_int {
            self.simplify_identity(simplify_reg_mul);
        } else if self.terms.len() == 1 && (has_int || flattened) {
            self.op = Op::Ident;
        }

        self.splice_single_expr();
        Ok(())
    }

    /// If this is an IDENT over a lone sub-expression, bring the
    /// sub-expression up to this level.
    fn splice_single_expr(&mut self) {
        if self.op == Op::Ident && self.terms.len() == 1 {
            if matches!(self.terms[0], ExprTerm::Expr(_)) {
                if let Some(ExprTerm::Expr(e)) = self.terms.pop() {
                    let e = *e;
                    self.op = e.op;
                    self.terms = e.terms;
                }
            }
        }
    }

    /// Apply algebraic identities using the unique integer term of this
    /// level; becomes IDENT when a single term remains.
    fn simplify_identity(&mut self, simplify_reg_mul: bool) {
        let op = self.op;
        let Some(idx) = self
            .terms
            .iter()
            .position(|t| matches!(t, ExprTerm::Int(_)))
        else {
            return;
        };
        let is_first = idx == 0;

        if self.terms.len() > 1 {
            let (destroy, becomes_const) = match &self.terms[idx] {
                ExprTerm::Int(intn) => {
                    // `1 * register` is kept when the caller is forming an
                    // effective address.
                    let suppressed = !simplify_reg_mul
                        && op == Op::Mul
                        && intn.is_pos1()
                        && self.contains(TermKind::Reg);
                    let destroy = !suppressed
                        && if is_first {
                            can_destroy_int_left(op, intn)
                        } else {
                            can_destroy_int_right(op, intn)
                        };
                    (destroy, is_constant(op, intn))
                }
                _ => (false, false),
            };
            if destroy {
                self.terms.remove(idx);
            } else if becomes_const {
                let t = self.terms.swap_remove(idx);
                self.terms.clear();
                self.terms.push(t);
            }
        }

        // NOT, NEG, and LNOT of a single integer compute immediately.
        if self.terms.len() == 1 && matches!(op, Op::Not | Op::Neg | Op::Lnot) {
            if let Some(ExprTerm::Int(i)) = self.terms.first_mut() {
                let _ = i.calc(op, None);
            }
        }

        if self.terms.len() == 1 {
            self.op = Op::Ident;
        }
    }

    /// Canonicalize term order on commutative operators with a stable
    /// sort, so structurally equivalent expressions compare equal.
    pub fn order_terms(&mut self) {
        if self.terms.len() < 2 || !self.op.is_commutative() {
            return;
        }
        self.terms.sort_by(term_cmp);
    }

    // ── queries and structural edits ───────────────────────

    /// Left-to-right leaf scan for a term kind.
    pub fn contains(&self, kind: TermKind) -> bool {
        self.terms.iter().any(|t| match t {
            ExprTerm::Expr(e) => e.contains(kind),
            t => t.kind() == kind,
        })
    }

    /// Replace every `Subst(i)` leaf with a deep clone of `subst[i]`.
    pub fn substitute(&mut self, subst: &[ExprTerm]) -> Result<(), AsmError> {
        for t in &mut self.terms {
            match t {
                ExprTerm::Expr(e) => e.substitute(subst)?,
                ExprTerm::Subst(i) => {
                    let rep = subst.get(*i).ok_or(AsmError::SubstOutOfRange {
                        index: *i,
                        line: 0,
                    })?;
                    *t = rep.clone();
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// If this expression is exactly `SEGOFF(a, b)`, become `b` and
    /// return ownership of `a`.
    pub fn extract_segoff(&mut self) -> Option<Expr> {
        if self.op != Op::SegOff || self.terms.len() != 2 {
            return None;
        }
        let left = self.terms.remove(0);
        self.op = Op::Ident;
        Some(match left {
            ExprTerm::Expr(e) => *e,
            t => Expr {
                op: Op::Ident,
                terms: vec![t],
            },
        })
    }

    /// If this expression is exactly `WRT(a, b)`, become `a` and return
    /// ownership of `b`.
    pub fn extract_wrt(&mut self) -> Option<Expr> {
        if self.op != Op::Wrt || self.terms.len() != 2 {
            return None;
        }
        let right = self.terms.pop();
        self.op = Op::Ident;
        right.map(|t| match t {
            ExprTerm::Expr(e) => *e,
            t => Expr {
                op: Op::Ident,
                terms: vec![t],
            },
        })
    }

    /// Fold `loc_b + (-1 * loc_a)` pairs inside addition levels into
    /// integer distances, using `dist(from, to)`.  Used as the
    /// `xform_extra` of [`Expr::level_tree`] once offsets are known.
    pub fn xform_dist(&mut self, dist: &dyn Fn(Location, Location) -> Option<IntNum>) {
        for t in &mut self.terms {
            if let ExprTerm::Expr(e) = t {
                e.xform_dist(dist);
            }
        }
        if self.op != Op::Add {
            return;
        }
        let mut changed = false;
        for i in 0..self.terms.len() {
            let from = match &self.terms[i] {
                ExprTerm::Expr(e) => mul_neg1_loc(e),
                _ => None,
            };
            let Some(from) = from else { continue };
            for j in 0..self.terms.len() {
                if i == j {
                    continue;
                }
                let to = match &self.terms[j] {
                    ExprTerm::Loc(l) => *l,
                    _ => continue,
                };
                if let Some(d) = dist(from, to) {
                    self.terms[j] = ExprTerm::Int(d);
                    self.terms[i] = ExprTerm::None;
                    changed = true;
                    break;
                }
            }
        }
        if changed {
            self.terms.retain(|t| !matches!(t, ExprTerm::None));
            if self.terms.len() == 1 {
                self.op = Op::Ident;
            }
        }
    }

    /// Replace symbol references with their bindings: EQU expressions
    /// are cloned in (recursively, with a depth bound), labels become
    /// location references.
    pub(crate) fn expand_syms(
        &mut self,
        ctx: &dyn EvalContext,
        depth: u32,
    ) -> Result<(), AsmError> {
        for t in &mut self.terms {
            match t {
                ExprTerm::Expr(e) => e.expand_syms(ctx, depth)?,
                ExprTerm::Sym(id) => match ctx.resolve_sym(*id) {
                    SymResolve::Equ(e) => {
                        if depth == 0 {
                            return Err(AsmError::Value {
                                msg: "circular EQU reference".into(),
                                line: 0,
                            });
                        }
                        let mut c = e.clone();
                        c.expand_syms(ctx, depth - 1)?;
                        *t = ExprTerm::Expr(Box::new(c));
                    }
                    SymResolve::Loc(l) => *t = ExprTerm::Loc(l),
                    SymResolve::External(name) => {
                        return Err(AsmError::Value {
                            msg: format!(
                                "external symbol '{}' in computed expression",
                                name
                            ),
                            line: 0,
                        })
                    }
                    SymResolve::Unknown(name) => {
                        return Err(AsmError::UndefinedSymbol {
                            name: name.into(),
                            line: 0,
                        })
                    }
                },
                _ => {}
            }
        }
        Ok(())
    }

    /// Reduce to an integer under the given context.  Registers,
    /// floats, substitution holes, and segment operators in an integer
    /// context are value errors; unresolved symbols and locations report
    /// as such.
    pub fn evaluate(&self, ctx: &dyn EvalContext) -> Result<IntNum, AsmError> {
        self.eval_inner(ctx, MAX_EQU_DEPTH)
    }

    fn eval_inner(&self, ctx: &dyn EvalContext, depth: u32) -> Result<IntNum, AsmError> {
        match self.op {
            Op::Seg | Op::Wrt | Op::SegOff => Err(AsmError::Value {
                msg: format!("invalid use of '{}' in a computed expression", self.op),
                line: 0,
            }),
            Op::Cond => {
                if self.terms.len() != 3 {
                    return Err(AsmError::Internal {
                        msg: "conditional without three terms".into(),
                        line: 0,
                    });
                }
                let sel = term_value(&self.terms[0], ctx, depth)?;
                let pick = if sel.is_zero() { 2 } else { 1 };
                term_value(&self.terms[pick], ctx, depth)
            }
            op => {
                let mut iter = self.terms.iter();
                let first = iter.next().ok_or(AsmError::Internal {
                    msg: "expression with no terms".into(),
                    line: 0,
                })?;
                let mut acc = term_value(first, ctx, depth)?;
                if op == Op::Ident {
                    return Ok(acc);
                }
                if op.is_unary() {
                    acc.calc(op, None)?;
                    return Ok(acc);
                }
                for t in iter {
                    let rhs = term_value(t, ctx, depth)?;
                    acc.calc(op, Some(&rhs))?;
                }
                Ok(acc)
            }
        }
    }
}

fn term_value(
    t: &ExprTerm,
    ctx: &dyn EvalContext,
    depth: u32,
) -> Result<IntNum, AsmError> {
    match t {
        ExprTerm::Int(i) => Ok(i.clone()),
        ExprTerm::Expr(e) => e.eval_inner(ctx, depth),
        ExprTerm::Loc(l) => ctx.loc_offset(*l).map(IntNum::from).ok_or(AsmError::Value {
            msg: "unresolved location in expression".into(),
            line: 0,
        }),
        ExprTerm::Sym(id) => match ctx.resolve_sym(*id) {
            SymResolve::Equ(e) => {
                if depth == 0 {
                    return Err(AsmError::Value {
                        msg: "circular EQU reference".into(),
                        line: 0,
                    });
                }
                e.eval_inner(ctx, depth - 1)
            }
            SymResolve::Loc(l) => {
                ctx.loc_offset(l).map(IntNum::from).ok_or(AsmError::Value {
                    msg: "unresolved location in expression".into(),
                    line: 0,
                })
            }
            SymResolve::External(name) => Err(AsmError::Value {
                msg: format!("external symbol '{}' in computed expression", name),
                line: 0,
            }),
            SymResolve::Unknown(name) => Err(AsmError::UndefinedSymbol {
                name: name.into(),
                line: 0,
            }),
        },
        ExprTerm::Float(_) => Err(AsmError::Value {
            msg: "floating point value in integer expression".into(),
            line: 0,
        }),
        ExprTerm::Reg(_) => Err(AsmError::Value {
            msg: "register in a computed expression".into(),
            line: 0,
        }),
        ExprTerm::Subst(i) => Err(AsmError::SubstOutOfRange { index: *i, line: 0 }),
        ExprTerm::None => Err(AsmError::Internal {
            msg: "tombstone term in expression".into(),
            line: 0,
        }),
    }
}

fn mul_neg1_loc(e: &Expr) -> Option<Location> {
    if e.op != Op::Mul || e.terms.len() != 2 {
        return None;
    }
    match (&e.terms[0], &e.terms[1]) {
        (ExprTerm::Int(i), ExprTerm::Loc(l)) | (ExprTerm::Loc(l), ExprTerm::Int(i))
            if i.is_neg1() =>
        {
            Some(*l)
        }
        _ => None,
    }
}

fn term_cmp(a: &ExprTerm, b: &ExprTerm) -> Ordering {
    fn rank(t: &ExprTerm) -> u8 {
        match t {
            ExprTerm::None => 0,
            ExprTerm::Reg(_) => 1,
            ExprTerm::Int(_) => 2,
            ExprTerm::Subst(_) => 3,
            ExprTerm::Float(_) => 4,
            ExprTerm::Sym(_) => 5,
            ExprTerm::Loc(_) => 6,
            ExprTerm::Expr(_) => 7,
        }
    }
    match (a, b) {
        (ExprTerm::Int(x), ExprTerm::Int(y)) => x.cmp(y),
        (ExprTerm::Reg(x), ExprTerm::Reg(y)) => x.cmp(y),
        (ExprTerm::Subst(x), ExprTerm::Subst(y)) => x.cmp(y),
        (ExprTerm::Sym(x), ExprTerm::Sym(y)) => x.cmp(y),
        (ExprTerm::Loc(x), ExprTerm::Loc(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

impl fmt::Display for ExprTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprTerm::None => f.write_str("NONE"),
            ExprTerm::Reg(r) => write!(f, "{}", r),
            ExprTerm::Int(i) => write!(f, "{}", i),
            ExprTerm::Subst(i) => write!(f, "[{}]", i),
            ExprTerm::Float(flt) => write!(f, "{}", flt),
            ExprTerm::Sym(id) => write!(f, "sym#{}", id.index()),
            ExprTerm::Loc(l) => write!(f, "{}", l),
            ExprTerm::Expr(e) => write!(f, "({})", e),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Op::Neg | Op::Not | Op::Lnot => {
                write!(f, "{}", self.op)?;
                for t in &self.terms {
                    write!(f, "{}", t)?;
                }
                Ok(())
            }
            Op::Seg => {
                write!(f, "SEG ")?;
                for t in &self.terms {
                    write!(f, "{}", t)?;
                }
                Ok(())
            }
            Op::Cond => {
                let mut it = self.terms.iter();
                if let (Some(c), Some(t), Some(e)) = (it.next(), it.next(), it.next())
                {
                    write!(f, "{}?{}:{}", c, t, e)
                } else {
                    Ok(())
                }
            }
            op => {
                for (i, t) in self.terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{}", op)?;
                    }
                    write!(f, "{}", t)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{SymbolDef, SymbolTable};

    fn int(v: i64) -> Expr {
        Expr::int(IntNum::new(v))
    }

    fn normalized(mut e: Expr) -> Expr {
        e.simplify(true).unwrap();
        e
    }

    /// Evaluation context over a bare symbol table; locations resolve to
    /// their stored intra-bytecode offset.
    struct TableCtx(SymbolTable);

    impl EvalContext for TableCtx {
        fn loc_offset(&self, loc: Location) -> Option<u64> {
            Some(loc.off)
        }
        fn resolve_sym(&self, id: SymbolId) -> SymResolve<'_> {
            let sym = self.0.get(id);
            match sym.def() {
                SymbolDef::Equ(e) => SymResolve::Equ(e),
                SymbolDef::Label(l) => SymResolve::Loc(*l),
                SymbolDef::Extern => SymResolve::External(sym.name()),
                _ => SymResolve::Unknown(sym.name()),
            }
        }
    }

    #[test]
    fn mul_identity_collapses_to_int() {
        let e = normalized(Expr::binary(int(1), Op::Mul, int(5)));
        assert_eq!(e.get_intnum(), Some(&IntNum::new(5)));
    }

    #[test]
    fn nested_add_folds_to_single_int() {
        let e = normalized(Expr::binary(
            int(1),
            Op::Add,
            Expr::binary(int(2), Op::Add, Expr::binary(int(3), Op::Add, int(4))),
        ));
        assert_eq!(e.get_intnum(), Some(&IntNum::new(10)));
    }

    #[test]
    fn sub_becomes_add_of_negated() {
        let mut tab = SymbolTable::new();
        let x = tab.get_or_new("x");
        let y = tab.get_or_new("y");
        let e = normalized(Expr::binary(Expr::sym(x), Op::Sub, Expr::sym(y)));
        assert_eq!(e.op(), Op::Add);
        assert_eq!(e.terms().len(), 2);
        assert_eq!(e.terms()[0], ExprTerm::Sym(x));
        match &e.terms()[1] {
            ExprTerm::Expr(m) => {
                assert_eq!(m.op(), Op::Mul);
                assert!(m.terms().contains(&ExprTerm::Int(IntNum::new(-1))));
                assert!(m.terms().contains(&ExprTerm::Sym(y)));
            }
            t => panic!("expected product term, got {t:?}"),
        }
    }

    #[test]
    fn double_negation_cancels() {
        let mut tab = SymbolTable::new();
        let x = tab.get_or_new("x");
        let e = normalized(Expr::unary(Op::Neg, Expr::unary(Op::Neg, Expr::sym(x))));
        assert_eq!(e.get_symbol(), Some(x));
    }

    #[test]
    fn one_times_reg_kept_for_effective_address() {
        let r = Register::new(3, 64);
        let mut e = Expr::binary(int(1), Op::Mul, Expr::reg(r));
        e.level_tree(true, true, false, None).unwrap();
        assert_eq!(e.op(), Op::Mul);
        assert_eq!(e.terms().len(), 2);

        let e = normalized(Expr::binary(int(1), Op::Mul, Expr::reg(r)));
        assert_eq!(e.get_reg(), Some(r));
    }

    #[test]
    fn zero_and_one_identities() {
        let mut tab = SymbolTable::new();
        let x = tab.get_or_new("x");
        // 0 * x is constant 0.
        let e = normalized(Expr::binary(int(0), Op::Mul, Expr::sym(x)));
        assert_eq!(e.get_intnum(), Some(&IntNum::new(0)));
        // 0 + x is x.
        let e = normalized(Expr::binary(int(0), Op::Add, Expr::sym(x)));
        assert_eq!(e.get_symbol(), Some(x));
        // -1 | x is constant -1.
        let e = normalized(Expr::binary(int(-1), Op::Or, Expr::sym(x)));
        assert_eq!(e.get_intnum(), Some(&IntNum::new(-1)));
        // x >> 0 is x.
        let e = normalized(Expr::binary(Expr::sym(x), Op::Shr, int(0)));
        assert_eq!(e.get_symbol(), Some(x));
        // x / 1 is x.
        let e = normalized(Expr::binary(Expr::sym(x), Op::Div, int(1)));
        assert_eq!(e.get_symbol(), Some(x));
    }

    #[test]
    fn seg_of_segoff_is_the_segment() {
        let mut tab = SymbolTable::new();
        let s = tab.get_or_new("segpart");
        let o = tab.get_or_new("offpart");
        let e = normalized(Expr::unary(
            Op::Seg,
            Expr::binary(Expr::sym(s), Op::SegOff, Expr::sym(o)),
        ));
        assert_eq!(e.get_symbol(), Some(s));
    }

    #[test]
    fn cond_folds_on_constant_selector() {
        let e = normalized(Expr::cond(int(1), int(7), int(9)));
        assert_eq!(e.get_intnum(), Some(&IntNum::new(7)));
        let e = normalized(Expr::cond(int(0), int(7), int(9)));
        assert_eq!(e.get_intnum(), Some(&IntNum::new(9)));
    }

    #[test]
    fn substitute_replaces_holes() {
        let mut e =
            Expr::new(Op::Add, vec![ExprTerm::Subst(0), ExprTerm::Subst(1)]).unwrap();
        e.substitute(&[ExprTerm::Int(IntNum::new(2)), ExprTerm::Int(IntNum::new(3))])
            .unwrap();
        assert_eq!(normalized(e).get_intnum(), Some(&IntNum::new(5)));
    }

    #[test]
    fn substitute_missing_index_errors() {
        let mut e = Expr::ident(ExprTerm::Subst(4));
        assert!(matches!(
            e.substitute(&[ExprTerm::Int(IntNum::new(1))]),
            Err(AsmError::SubstOutOfRange { index: 4, .. })
        ));
    }

    #[test]
    fn extract_segoff_splits() {
        let mut tab = SymbolTable::new();
        let s = tab.get_or_new("s");
        let o = tab.get_or_new("o");
        let mut e = Expr::binary(Expr::sym(s), Op::SegOff, Expr::sym(o));
        let seg = e.extract_segoff().unwrap();
        assert_eq!(seg.get_symbol(), Some(s));
        assert_eq!(normalized(e).get_symbol(), Some(o));
    }

    #[test]
    fn extract_wrt_splits() {
        let mut tab = SymbolTable::new();
        let a = tab.get_or_new("a");
        let b = tab.get_or_new("b");
        let mut e = Expr::binary(Expr::sym(a), Op::Wrt, Expr::sym(b));
        let wrt = e.extract_wrt().unwrap();
        assert_eq!(wrt.get_symbol(), Some(b));
        assert_eq!(normalized(e).get_symbol(), Some(a));
        // Non-WRT expressions refuse.
        let mut e = Expr::binary(int(1), Op::Add, int(2));
        assert!(e.extract_wrt().is_none());
    }

    #[test]
    fn contains_scans_leaves() {
        let mut tab = SymbolTable::new();
        let x = tab.get_or_new("x");
        let e = Expr::binary(
            int(1),
            Op::Add,
            Expr::binary(Expr::sym(x), Op::Mul, int(2)),
        );
        assert!(e.contains(TermKind::Sym));
        assert!(e.contains(TermKind::Int));
        assert!(!e.contains(TermKind::Float));
        assert!(!e.contains(TermKind::Reg));
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut tab = SymbolTable::new();
        let x = tab.get_or_new("x");
        let e = Expr::binary(
            Expr::binary(int(3), Op::Mul, Expr::binary(int(1), Op::Add, Expr::sym(x))),
            Op::Sub,
            Expr::binary(int(4), Op::Mul, Expr::binary(Expr::sym(x), Op::Sub, int(2))),
        );
        let once = normalized(e);
        let twice = normalized(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn order_terms_canonicalizes_commutative() {
        let mut tab = SymbolTable::new();
        let a = tab.get_or_new("a");
        let b = tab.get_or_new("b");
        let mut e1 = normalized(Expr::binary(
            Expr::sym(b),
            Op::Add,
            Expr::binary(Expr::sym(a), Op::Add, int(4)),
        ));
        let mut e2 = normalized(Expr::binary(
            int(4),
            Op::Add,
            Expr::binary(Expr::sym(b), Op::Add, Expr::sym(a)),
        ));
        e1.order_terms();
        e2.order_terms();
        assert_eq!(e1, e2);

        // Non-commutative operators keep their order.
        let mut e = Expr::binary(Expr::sym(b), Op::Shl, int(2));
        e.order_terms();
        assert_eq!(e.terms()[0], ExprTerm::Sym(b));
    }

    #[test]
    fn evaluate_follows_equ_chains() {
        let mut tab = SymbolTable::new();
        let inner = tab.get_or_new("inner");
        let outer = tab.get_or_new("outer");
        tab.define_equ(inner, int(5), 1).unwrap();
        tab.define_equ(outer, Expr::binary(Expr::sym(inner), Op::Mul, int(3)), 2)
            .unwrap();
        let ctx = TableCtx(tab);
        let e = Expr::binary(Expr::sym(outer), Op::Add, int(1));
        assert_eq!(e.evaluate(&ctx).unwrap(), IntNum::new(16));
    }

    #[test]
    fn evaluate_rejects_circular_equ() {
        let mut tab = SymbolTable::new();
        let a = tab.get_or_new("a");
        let b = tab.get_or_new("b");
        tab.define_equ(a, Expr::sym(b), 1).unwrap();
        tab.define_equ(b, Expr::sym(a), 2).unwrap();
        let ctx = TableCtx(tab);
        assert!(Expr::sym(a).evaluate(&ctx).is_err());
    }

    #[test]
    fn evaluate_rejects_registers_and_undefined() {
        let mut tab = SymbolTable::new();
        let u = tab.get_or_new("undef");
        let ctx = TableCtx(tab);
        assert!(matches!(
            Expr::sym(u).evaluate(&ctx),
            Err(AsmError::UndefinedSymbol { .. })
        ));
        let e = Expr::reg(Register::new(0, 32));
        assert!(matches!(e.evaluate(&ctx), Err(AsmError::Value { .. })));
    }

    #[test]
    fn xform_dist_folds_location_differences() {
        let s = crate::object::SectionId::new(0);
        let l1 = Location::new(s, 0, 2);
        let l2 = Location::new(s, 0, 10);
        // l2 - l1
        let mut e = Expr::binary(Expr::loc(l2), Op::Sub, Expr::loc(l1));
        let dist = |from: Location, to: Location| -> Option<IntNum> {
            if from.sect == to.sect {
                Some(IntNum::new(to.off as i64 - from.off as i64))
            } else {
                None
            }
        };
        e.level_tree(true, true, true, Some(&mut |node: &mut Expr| {
            node.xform_dist(&dist);
        }))
        .unwrap();
        assert_eq!(e.get_intnum(), Some(&IntNum::new(8)));
    }
}

