//! Symbol table with stable identities.
//!
//! Symbols live in an arena owned by the table; [`SymbolId`] handles are
//! plain indices, so expression leaves can hold them without reference
//! counting and they stay valid for the table's lifetime.  Enumeration
//! order is creation order, which gives object-format writers a
//! definition-stable symbol sequence.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use core::fmt;
use core::ops::BitOr;

use crate::error::AsmError;
use crate::expr::Expr;
use crate::object::Location;

/// Stable handle to a symbol in a [`SymbolTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SymbolId(u32);

impl SymbolId {
    /// Arena index of this symbol.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Symbol visibility flags (bitwise-combinable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Visibility(u8);

impl Visibility {
    /// Default: visible only within the object.
    pub const LOCAL: Visibility = Visibility(0);
    /// Visible to other objects.
    pub const GLOBAL: Visibility = Visibility(1);
    /// Common storage, merged by the linker.
    pub const COMMON: Visibility = Visibility(2);
    /// Defined elsewhere.
    pub const EXTERN: Visibility = Visibility(4);
    /// Local to the defining module (debugger-local).
    pub const DLOCAL: Visibility = Visibility(8);

    /// Whether every flag in `other` is set in `self`.
    pub fn contains(self, other: Visibility) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Visibility {
    type Output = Visibility;
    fn bitor(self, rhs: Visibility) -> Visibility {
        Visibility(self.0 | rhs.0)
    }
}

/// What a symbol is bound to.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SymbolDef {
    /// Referenced but not yet defined.
    Undefined,
    /// Defined by an expression (`EQU`).
    Equ(Expr),
    /// Defined as a label at a location in the assembled stream.
    Label(Location),
    /// Common storage: size expression plus alignment.
    Common {
        /// Size of the common block.
        size: Expr,
        /// Required alignment in bytes.
        align: u64,
    },
    /// Defined in another object.
    Extern,
    /// Architecture-provided special symbol carrying an opaque token.
    Special(u32),
}

impl SymbolDef {
    fn kind_name(&self) -> &'static str {
        match self {
            SymbolDef::Undefined => "undefined",
            SymbolDef::Equ(_) => "EQU",
            SymbolDef::Label(_) => "label",
            SymbolDef::Common { .. } => "common",
            SymbolDef::Extern => "extern",
            SymbolDef::Special(_) => "special",
        }
    }
}

/// A named symbol.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Symbol {
    name: String,
    def: SymbolDef,
    vis: Visibility,
    def_line: u32,
    use_line: u32,
    used: bool,
}

impl Symbol {
    /// Symbol name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current definition.
    pub fn def(&self) -> &SymbolDef {
        &self.def
    }

    /// Visibility flags.
    pub fn visibility(&self) -> Visibility {
        self.vis
    }

    /// True once the symbol has a definition of any kind.
    pub fn is_defined(&self) -> bool {
        !matches!(self.def, SymbolDef::Undefined)
    }

    /// Line of the definition (0 if undefined).
    pub fn def_line(&self) -> u32 {
        self.def_line
    }

    /// Line of the first recorded use (0 if never used).
    pub fn use_line(&self) -> u32 {
        self.use_line
    }

    /// Whether a use has been recorded.
    pub fn is_used(&self) -> bool {
        self.used
    }

    /// The label location, if this symbol is a label.
    pub fn label(&self) -> Option<Location> {
        match &self.def {
            SymbolDef::Label(loc) => Some(*loc),
            _ => None,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.def.kind_name())
    }
}

/// Case-sensitive symbol table; creation order is enumeration order.
#[derive(Debug, Default)]
pub struct SymbolTable {
    syms: alloc::vec::Vec<Symbol>,
    names: BTreeMap<String, SymbolId>,
    specials: BTreeMap<String, SymbolId>,
}

impl SymbolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a symbol by name.
    pub fn find(&self, name: &str) -> Option<SymbolId> {
        self.names.get(name).copied()
    }

    /// Look up or create an (undefined) symbol by name.
    pub fn get_or_new(&mut self, name: &str) -> SymbolId {
        if let Some(id) = self.names.get(name) {
            return *id;
        }
        let id = SymbolId(self.syms.len() as u32);
        self.syms.push(Symbol {
            name: name.to_string(),
            def: SymbolDef::Undefined,
            vis: Visibility::LOCAL,
            def_line: 0,
            use_line: 0,
            used: false,
        });
        self.names.insert(name.to_string(), id);
        id
    }

    /// Record a use of a symbol at `line` (first use wins).
    pub fn record_use(&mut self, id: SymbolId, line: u32) {
        let sym = &mut self.syms[id.index()];
        if !sym.used {
            sym.used = true;
            sym.use_line = line;
        }
    }

    /// Define a symbol as a label at a location.
    pub fn define_label(
        &mut self,
        id: SymbolId,
        loc: Location,
        line: u32,
    ) -> Result<(), AsmError> {
        let sym = &mut self.syms[id.index()];
        match &sym.def {
            SymbolDef::Undefined => {
                sym.def = SymbolDef::Label(loc);
                sym.def_line = line;
                Ok(())
            }
            _ => Err(AsmError::RedefinedSymbol {
                name: sym.name.clone(),
                line,
                orig_line: sym.def_line,
            }),
        }
    }

    /// Define a symbol by an expression.  Re-equating to a structurally
    /// identical expression is permitted; anything else is an error.
    pub fn define_equ(
        &mut self,
        id: SymbolId,
        expr: Expr,
        line: u32,
    ) -> Result<(), AsmError> {
        let sym = &mut self.syms[id.index()];
        match &sym.def {
            SymbolDef::Undefined => {
                sym.def = SymbolDef::Equ(expr);
                sym.def_line = line;
                Ok(())
            }
            SymbolDef::Equ(prev) if *prev == expr => Ok(()),
            _ => Err(AsmError::RedefinedSymbol {
                name: sym.name.clone(),
                line,
                orig_line: sym.def_line,
            }),
        }
    }

    /// Define a symbol as common storage.
    pub fn define_common(
        &mut self,
        id: SymbolId,
        size: Expr,
        align: u64,
        line: u32,
    ) -> Result<(), AsmError> {
        let sym = &mut self.syms[id.index()];
        match &sym.def {
            SymbolDef::Undefined => {
                sym.def = SymbolDef::Common { size, align };
                sym.vis = sym.vis | Visibility::COMMON;
                sym.def_line = line;
                Ok(())
            }
            _ => Err(AsmError::RedefinedSymbol {
                name: sym.name.clone(),
                line,
                orig_line: sym.def_line,
            }),
        }
    }

    /// Declare visibility flags; `EXTERN` also binds an undefined symbol.
    pub fn declare(
        &mut self,
        id: SymbolId,
        vis: Visibility,
        line: u32,
    ) -> Result<(), AsmError> {
        let sym = &mut self.syms[id.index()];
        if vis.contains(Visibility::EXTERN) {
            match &sym.def {
                SymbolDef::Undefined => {
                    sym.def = SymbolDef::Extern;
                    sym.def_line = line;
                }
                SymbolDef::Extern => {}
                _ => {
                    return Err(AsmError::Value {
                        msg: format!(
                            "cannot declare defined symbol '{}' extern",
                            sym.name
                        ),
                        line,
                    })
                }
            }
        }
        sym.vis = sym.vis | vis;
        Ok(())
    }

    /// Register an architecture-provided special symbol.
    pub fn define_special(&mut self, name: &str, token: u32) -> SymbolId {
        let id = self.get_or_new(name);
        self.syms[id.index()].def = SymbolDef::Special(token);
        self.specials.insert(name.to_string(), id);
        id
    }

    /// Consult the pre-populated special-symbol map.
    pub fn find_special(&self, name: &str) -> Option<SymbolId> {
        self.specials.get(name).copied()
    }

    /// Symbol by handle.
    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.syms[id.index()]
    }

    /// Number of symbols.
    pub fn len(&self) -> usize {
        self.syms.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Symbols in creation (definition-stable) order.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.syms
            .iter()
            .enumerate()
            .map(|(i, s)| (SymbolId(i as u32), s))
    }
}

/// Resolve a front-end symbol name against the most recent non-local
/// label: names beginning `.` get the base prefixed, `..`-names are
/// special and untouched, and a `..@` prefix marks a non-local name.
pub fn mangle_name(name: &str, base: Option<&str>) -> Result<String, AsmError> {
    // "..start" style specials and "..@"-prefixed non-locals keep their
    // spelling.
    if name.starts_with("..") {
        return Ok(name.to_string());
    }
    if name.starts_with('.') {
        let base = base.ok_or_else(|| AsmError::Value {
            msg: format!("no preceding non-local label for '{}'", name),
            line: 0,
        })?;
        return Ok(format!("{}{}", base, name));
    }
    Ok(name.to_string())
}
