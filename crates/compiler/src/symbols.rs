//! Front-end symbol table
//!
//! Maps every resolved identifier to its type and attributes, and every
//! structure tag to its computed layout. Written during semantic analysis,
//! read-only afterward. Symbols are keyed by interner handle in a
//! `BTreeMap`, so iteration (used to harvest static variables and to build
//! the backend table) is deterministic.

use crate::intern::Ident;
use crate::types::Type;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// One entry of a compile-time-evaluated initializer.
#[derive(Debug, Clone, PartialEq)]
pub enum StaticInit {
    Char(i8),
    Int(i32),
    Long(i64),
    UChar(u8),
    UInt(u32),
    ULong(u64),
    /// A double, stored as its 64-bit binary pattern (also the
    /// deduplication key for `.rodata` constants).
    Double { bits: u64 },
    /// A run of zero bytes.
    Zero { bytes: i64 },
    /// String literal bytes; `.asciz` when null-terminated, `.ascii`
    /// when the literal exactly fills its array.
    String {
        bytes: Vec<u8>,
        null_terminated: bool,
    },
    /// Address of another symbol (string constants behind `char *`).
    Pointer { label: Ident },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitialValue {
    Tentative,
    Initial(Vec<StaticInit>),
    NoInitializer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdentAttrs {
    Fun {
        defined: bool,
        global: bool,
    },
    Static {
        init: InitialValue,
        global: bool,
    },
    /// Anonymous constants (string literals, and doubles later in the
    /// backend); always static, never written.
    Constant(StaticInit),
    Local,
}

#[derive(Debug)]
pub struct Symbol {
    pub ty: Rc<Type>,
    pub attrs: IdentAttrs,
}

#[derive(Debug)]
pub struct StructMember {
    pub offset: i64,
    pub ty: Rc<Type>,
}

/// Layout of a fully declared struct or union tag.
#[derive(Debug)]
pub struct StructLayout {
    pub alignment: i32,
    pub size: i64,
    /// Declaration order; `members` is keyed by name.
    pub member_names: Vec<Ident>,
    pub members: HashMap<Ident, StructMember>,
}

impl StructLayout {
    pub fn member(&self, name: Ident) -> Option<&StructMember> {
        self.members.get(&name)
    }

    /// Members in declaration order.
    pub fn ordered_members(&self) -> impl Iterator<Item = &StructMember> {
        self.member_names.iter().map(|name| &self.members[name])
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    pub symbols: BTreeMap<Ident, Symbol>,
    pub structs: HashMap<Ident, StructLayout>,
    /// String-literal constants already allocated, keyed by content.
    strings: HashMap<Vec<u8>, Ident>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn get(&self, name: Ident) -> Option<&Symbol> {
        self.symbols.get(&name)
    }

    /// Lookup that panics on a missing entry; resolution guarantees every
    /// name the later passes see is in the table.
    pub fn expect(&self, name: Ident) -> &Symbol {
        self.symbols
            .get(&name)
            .expect("identifier missing from symbol table")
    }

    pub fn insert(&mut self, name: Ident, symbol: Symbol) {
        self.symbols.insert(name, symbol);
    }

    /// Allocate (or reuse) the anonymous constant holding a string
    /// literal, returning its label. The constant is a null-terminated
    /// char array with `ConstantAttr` attributes.
    pub fn string_constant(&mut self, interner: &mut crate::intern::Interner, bytes: &[u8]) -> Ident {
        if let Some(&label) = self.strings.get(bytes) {
            return label;
        }
        let label = interner.make_label("string");
        let len = bytes.len() as i64;
        self.insert(
            label,
            Symbol {
                ty: Rc::new(Type::Array {
                    elem: Rc::new(Type::Char),
                    size: len + 1,
                }),
                attrs: IdentAttrs::Constant(StaticInit::String {
                    bytes: bytes.to_vec(),
                    null_terminated: true,
                }),
            },
        );
        self.strings.insert(bytes.to_vec(), label);
        label
    }

    /// Whether a type's size is known.
    pub fn is_complete(&self, ty: &Type) -> bool {
        match ty {
            Type::Void => false,
            Type::Structure { tag, .. } => self.structs.contains_key(tag),
            Type::Array { elem, .. } => self.is_complete(elem),
            _ => true,
        }
    }

    /// Size of a complete type in bytes.
    pub fn type_size(&self, ty: &Type) -> i64 {
        match ty {
            Type::Array { elem, size } => self.type_size(elem) * size,
            Type::Structure { tag, .. } => {
                self.structs
                    .get(tag)
                    .expect("size of incomplete structure")
                    .size
            }
            Type::Void | Type::Fun(_) => unreachable!("size of non-object type"),
            scalar => scalar.scalar_size() as i64,
        }
    }

    /// Front-end alignment of a complete type.
    pub fn type_alignment(&self, ty: &Type) -> i32 {
        match ty {
            Type::Array { elem, .. } => self.type_alignment(elem),
            Type::Structure { tag, .. } => {
                self.structs
                    .get(tag)
                    .expect("alignment of incomplete structure")
                    .alignment
            }
            Type::Void | Type::Fun(_) => unreachable!("alignment of non-object type"),
            scalar => scalar.scalar_size(),
        }
    }
}
