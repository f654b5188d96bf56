//! # asm-core — Assembler Core IR and Span-Resolution Engine
//!
//! `asm-core` is the middle of an assembler toolchain: parser front-ends
//! construct an [`Object`] (sections, bytecodes, symbols, expressions),
//! the span-resolution engine settles every variable-length bytecode to a
//! fixed offset and size, and object-format writers consume the frozen IR.
//!
//! ## Quick Start
//!
//! ```rust
//! use asm_core::{optimize, Bytecode, Contents, Errwarns, Object};
//! use asm_core::arch::Generic;
//!
//! let mut object = Object::new(Box::new(Generic::new(64)));
//! let text = object.append_section("text", true);
//! object
//!     .section_mut(text)
//!     .append_bytecode(Bytecode::new(Contents::data_raw(vec![0x90, 0x90], 1), 1));
//!
//! let mut errwarns = Errwarns::new();
//! optimize(&mut object, &mut errwarns);
//! assert!(!errwarns.has_errors());
//! ```
//!
//! ## Features
//!
//! - **Pure Rust** — no C/C++ FFI, no system assembler.
//! - **`no_std` + `alloc`** — embeddable; the core does no I/O and never
//!   blocks. Bytes go to a caller-supplied sink.
//! - **Monotone fixpoint relaxation** — short/near jumps, alignment pads,
//!   org directives, and LEB128 values settle deterministically with
//!   guaranteed convergence.
//! - **Arbitrary precision** — integers transparently promote to big
//!   integers; floats carry a big mantissa and render to IEEE 754
//!   single/double/extended.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// An assembler core intentionally performs many narrowing / sign-changing
// casts between integer widths (u64→i64, i128→u8) when moving between
// offsets, displacements, and emitted bytes.  The lints below are expected
// and acceptable in this context.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::match_same_arms,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::single_match_else,
    clippy::uninlined_format_args,
    clippy::doc_markdown
)]

extern crate alloc;

/// Architecture collaborator interface and opaque register handles.
pub mod arch;
/// Bytecodes and their polymorphic contents (data, LEB128, align, org, …).
pub mod bytecode;
/// Error types and the error/warning collector.
pub mod error;
/// Expression trees: leveling, simplification, substitution, evaluation.
pub mod expr;
/// Arbitrary-precision binary floating point with IEEE 754 output.
pub mod floatnum;
/// Arbitrary-precision integers and the algebraic operator kernel.
pub mod intnum;
/// Root container: object, sections, locations, relocations.
pub mod object;
/// The algebraic operator set.
pub mod op;
/// The span-resolution (relaxation) engine.
pub mod optimize;
/// Emission driver: final byte output through caller-supplied sinks.
pub mod output;
/// Symbol table with stable identities.
pub mod symbol;
/// Values: expressions plus size and relocation metadata.
pub mod value;

// Re-exports
pub use arch::{Arch, Register, SegmentRegister, TargetModifier};
pub use bytecode::{
    BcInfo, Bytecode, Contents, Dataval, Expansion, InsnContents, Special, SpanRequest,
};
pub use error::{AsmError, Errwarns};
pub use expr::{EvalContext, Expr, ExprTerm, SymResolve, TermKind};
pub use floatnum::{FloatFormat, FloatNum};
pub use intnum::IntNum;
pub use object::{Location, Object, Reloc, Section, SectionId};
pub use op::Op;
pub use optimize::optimize;
pub use output::{output_section, BasicOutput, Output};
pub use symbol::{Symbol, SymbolDef, SymbolId, SymbolTable, Visibility};
pub use value::Value;
