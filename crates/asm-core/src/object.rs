//! Root container: object, sections, locations, relocations.
//!
//! A [`Location`] identifies a point in the assembled stream by section,
//! bytecode index, and intra-bytecode offset — indices, never pointers,
//! so a growing bytecode list never invalidates outstanding references.
//! Bytecodes are never removed or reordered once inserted; only their
//! `len` and `offset` fields change during optimization.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::arch::Arch;
use crate::bytecode::Bytecode;
use crate::expr::{EvalContext, Expr, SymResolve};
use crate::symbol::{SymbolDef, SymbolId, SymbolTable};

/// Stable handle to a section in an [`Object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SectionId(u32);

impl SectionId {
    /// Create a handle from a raw index.
    pub fn new(idx: u32) -> Self {
        SectionId(idx)
    }

    /// Arena index of this section.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A point in the assembled stream: bytecode identity plus an offset
/// into the bytecode's fixed portion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Location {
    /// Containing section.
    pub sect: SectionId,
    /// Bytecode index within the section.
    pub bc: u32,
    /// Byte offset within the bytecode.
    pub off: u64,
}

impl Location {
    /// Create a location.
    pub fn new(sect: SectionId, bc: u32, off: u64) -> Self {
        Location { sect, bc, off }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:{}+{}}}", self.sect.0, self.bc, self.off)
    }
}

/// A relocation record emitted against a section.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reloc {
    /// Section-relative offset of the relocated field.
    pub offset: u64,
    /// Target symbol.
    pub sym: SymbolId,
    /// Size of the relocated field in bytes.
    pub size: u8,
}

/// An ordered sequence of bytecodes plus section attributes.
#[derive(Debug)]
pub struct Section {
    name: String,
    code: bool,
    bss: bool,
    align: u64,
    start: Option<Expr>,
    pub(crate) bytecodes: Vec<Bytecode>,
    relocs: Vec<Reloc>,
}

impl Section {
    fn new(name: &str, code: bool) -> Self {
        Section {
            name: name.to_string(),
            code,
            bss: false,
            align: 1,
            start: None,
            bytecodes: Vec::new(),
            relocs: Vec::new(),
        }
    }

    /// Section name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is a code section (uses architecture fill patterns).
    pub fn is_code(&self) -> bool {
        self.code
    }

    /// Whether this section reserves space without emitting bytes.
    pub fn is_bss(&self) -> bool {
        self.bss
    }

    /// Mark the section as BSS-style (no emitted bytes).
    pub fn set_bss(&mut self, bss: bool) {
        self.bss = bss;
    }

    /// Section alignment in bytes.
    pub fn align(&self) -> u64 {
        self.align
    }

    /// Set the section alignment in bytes.
    pub fn set_align(&mut self, align: u64) {
        self.align = align.max(1);
    }

    /// Whether the section is absolute-positioned (virtual).
    pub fn is_absolute(&self) -> bool {
        self.start.is_some()
    }

    /// The absolute-start expression, if any.  Bytecode offsets stay
    /// section-relative; this expression is additive on top of them.
    pub fn start(&self) -> Option<&Expr> {
        self.start.as_ref()
    }

    /// Append a bytecode; returns its index within the section.
    pub fn append_bytecode(&mut self, bc: Bytecode) -> u32 {
        let idx = self.bytecodes.len() as u32;
        self.bytecodes.push(bc);
        idx
    }

    /// Bytecodes in insertion order.
    pub fn bytecodes(&self) -> &[Bytecode] {
        &self.bytecodes
    }

    /// The location immediately after the last bytecode: where the next
    /// appended bytecode will start.
    pub fn next_loc(&self, id: SectionId) -> Location {
        Location::new(id, self.bytecodes.len() as u32, 0)
    }

    /// Total section length in bytes.  Only valid after optimization.
    pub fn length(&self) -> u64 {
        self.bytecodes.last().map_or(0, Bytecode::next_offset)
    }

    /// Section-relative offset of a location in this section.  A
    /// bytecode index one past the end addresses the end of the section
    /// (labels defined after the last bytecode).
    pub(crate) fn offset_of(&self, bc_idx: usize, off: u64) -> Option<u64> {
        if bc_idx == self.bytecodes.len() {
            return match self.bytecodes.last() {
                Some(b) => {
                    b.known_offset()?;
                    b.next_offset().checked_add(off)
                }
                None => Some(off),
            };
        }
        let b = self.bytecodes.get(bc_idx)?;
        b.known_offset()?.checked_add(off)
    }

    /// Record a relocation against this section.
    pub fn add_reloc(&mut self, reloc: Reloc) {
        self.relocs.push(reloc);
    }

    /// Recorded relocations in emission order.
    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }
}

/// The root IR container handed from parser to optimizer to writer.
#[derive(Debug)]
pub struct Object {
    arch: Box<dyn Arch>,
    pub(crate) sections: Vec<Section>,
    pub(crate) symtab: SymbolTable,
    cur_sect: Option<SectionId>,
}

impl Object {
    /// Create an empty object for the given architecture.
    pub fn new(arch: Box<dyn Arch>) -> Self {
        Object {
            arch,
            sections: Vec::new(),
            symtab: SymbolTable::new(),
            cur_sect: None,
        }
    }

    /// The architecture collaborator.
    pub fn arch(&self) -> &dyn Arch {
        &*self.arch
    }

    /// Append a new (empty) section and make it current.
    pub fn append_section(&mut self, name: &str, code: bool) -> SectionId {
        let id = SectionId(self.sections.len() as u32);
        self.sections.push(Section::new(name, code));
        self.cur_sect = Some(id);
        id
    }

    /// Append an absolute-positioned (virtual) section with a start
    /// expression and make it current.
    pub fn append_absolute_section(&mut self, name: &str, start: Expr) -> SectionId {
        let id = self.append_section(name, false);
        self.sections[id.index()].start = Some(start);
        self.sections[id.index()].bss = true;
        id
    }

    /// Find a section by name.
    pub fn find_section(&self, name: &str) -> Option<SectionId> {
        self.sections
            .iter()
            .position(|s| s.name == name)
            .map(|i| SectionId(i as u32))
    }

    /// Section by handle.
    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.index()]
    }

    /// Mutable section by handle.
    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.index()]
    }

    /// Sections in declaration order.
    pub fn sections(&self) -> impl Iterator<Item = (SectionId, &Section)> {
        self.sections
            .iter()
            .enumerate()
            .map(|(i, s)| (SectionId(i as u32), s))
    }

    /// The current-section cursor used by parser front-ends.
    pub fn cur_section(&self) -> Option<SectionId> {
        self.cur_sect
    }

    /// Move the current-section cursor.
    pub fn set_cur_section(&mut self, id: SectionId) {
        self.cur_sect = Some(id);
    }

    /// The symbol table.
    pub fn symtab(&self) -> &SymbolTable {
        &self.symtab
    }

    /// The symbol table, mutably.
    pub fn symtab_mut(&mut self) -> &mut SymbolTable {
        &mut self.symtab
    }

    /// Resolve a location to its section-relative offset.  Only valid
    /// after optimization.
    pub fn loc_offset(&self, loc: Location) -> Option<u64> {
        let sect = self.sections.get(loc.sect.index())?;
        sect.offset_of(loc.bc as usize, loc.off)
    }

    /// Section-relative offset of a label symbol.  Only valid after
    /// optimization.
    pub fn symbol_offset(&self, id: SymbolId) -> Option<u64> {
        match self.symtab.get(id).def() {
            SymbolDef::Label(loc) => self.loc_offset(*loc),
            _ => None,
        }
    }

    /// Run the span-resolution engine over this object (phases 0-4).
    pub fn optimize(&mut self, errwarns: &mut crate::error::Errwarns) {
        crate::optimize::optimize(self, errwarns);
    }
}

impl EvalContext for Object {
    fn loc_offset(&self, loc: Location) -> Option<u64> {
        Object::loc_offset(self, loc)
    }

    fn resolve_sym(&self, id: SymbolId) -> SymResolve<'_> {
        let sym = self.symtab.get(id);
        match sym.def() {
            SymbolDef::Equ(e) => SymResolve::Equ(e),
            SymbolDef::Label(loc) => SymResolve::Loc(*loc),
            // Common and special symbols carry no value here; like
            // externs, they can only be referenced through relocations.
            SymbolDef::Extern
            | SymbolDef::Common { .. }
            | SymbolDef::Special(_) => SymResolve::External(sym.name()),
            SymbolDef::Undefined => SymResolve::Unknown(sym.name()),
        }
    }
}
