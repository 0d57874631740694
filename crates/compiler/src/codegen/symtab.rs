//! Backend symbol table
//!
//! Conversion of the front-end symbol table into the form the backend
//! passes key on: every object gets an assembly type plus static/const
//! flags, every function a defined flag and (eventually) the set of
//! callee-saved registers it touches. Runs before instruction selection;
//! selection adds entries for the double constants it mints.

use crate::codegen::asm::{AsmType, Register};
use crate::intern::Ident;
use crate::symbols::{IdentAttrs, SymbolTable};
use crate::types::{REG_MASK_UNSET, Type};
use std::collections::HashMap;

#[derive(Debug)]
pub enum BackendSymbol {
    Obj {
        is_static: bool,
        is_const: bool,
        ty: AsmType,
    },
    Fun {
        is_defined: bool,
        callee_saved: Vec<Register>,
    },
}

#[derive(Debug, Default)]
pub struct BackendTable {
    pub symbols: HashMap<Ident, BackendSymbol>,
}

impl BackendTable {
    pub fn expect(&self, name: Ident) -> &BackendSymbol {
        self.symbols
            .get(&name)
            .expect("identifier missing from backend symbol table")
    }

    pub fn expect_obj(&self, name: Ident) -> (&AsmType, bool, bool) {
        match self.expect(name) {
            BackendSymbol::Obj {
                ty,
                is_static,
                is_const,
            } => (ty, *is_static, *is_const),
            BackendSymbol::Fun { .. } => unreachable!("object lookup found a function"),
        }
    }
}

/// The assembly type of a front-end type: scalars map directly, arrays
/// and structures become byte blobs with their size and alignment. An
/// array spanning 16 bytes or more is aligned to 16.
pub fn asm_type_of(table: &SymbolTable, ty: &Type) -> AsmType {
    match ty {
        Type::Char | Type::SChar | Type::UChar => AsmType::Byte,
        Type::Int | Type::UInt => AsmType::LongWord,
        Type::Long | Type::ULong | Type::Pointer(_) => AsmType::QuadWord,
        Type::Double => AsmType::Double,
        Type::Array { .. } => {
            let size = table.type_size(ty);
            let mut alignment = table.type_alignment(ty);
            if size >= 16 {
                alignment = 16;
            }
            AsmType::ByteArray { size, alignment }
        }
        Type::Structure { tag, .. } => {
            let layout = &table.structs[tag];
            AsmType::ByteArray {
                size: layout.size,
                alignment: layout.alignment,
            }
        }
        Type::Void | Type::Fun(_) => unreachable!("assembly type of a non-object type"),
    }
}

pub fn convert_symbol_table(table: &SymbolTable) -> BackendTable {
    let mut backend = BackendTable::default();
    for (&name, symbol) in &table.symbols {
        let converted = match &symbol.attrs {
            IdentAttrs::Fun { defined, .. } => {
                let Type::Fun(fun_type) = &*symbol.ty else {
                    unreachable!("function attributes on a non-function type");
                };
                // Register masks stop being "unset" once the backend has
                // seen the signature.
                if fun_type.param_reg_mask.get() == REG_MASK_UNSET {
                    fun_type.param_reg_mask.set(0);
                }
                if fun_type.ret_reg_mask.get() == REG_MASK_UNSET {
                    fun_type.ret_reg_mask.set(0);
                }
                BackendSymbol::Fun {
                    is_defined: *defined,
                    callee_saved: Vec::new(),
                }
            }
            IdentAttrs::Constant(_) => BackendSymbol::Obj {
                is_static: true,
                is_const: true,
                ty: asm_type_of(table, &symbol.ty),
            },
            IdentAttrs::Static { .. } => BackendSymbol::Obj {
                is_static: true,
                is_const: false,
                ty: asm_type_of(table, &symbol.ty),
            },
            IdentAttrs::Local => BackendSymbol::Obj {
                is_static: false,
                is_const: false,
                ty: asm_type_of(table, &symbol.ty),
            },
        };
        backend.symbols.insert(name, converted);
    }
    backend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interner;
    use std::rc::Rc;

    #[test]
    fn scalar_assembly_types() {
        let table = SymbolTable::new();
        assert_eq!(asm_type_of(&table, &Type::Char), AsmType::Byte);
        assert_eq!(asm_type_of(&table, &Type::UInt), AsmType::LongWord);
        assert_eq!(
            asm_type_of(&table, &Type::Pointer(Rc::new(Type::Void))),
            AsmType::QuadWord
        );
        assert_eq!(asm_type_of(&table, &Type::Double), AsmType::Double);
    }

    #[test]
    fn large_arrays_align_to_sixteen() {
        let table = SymbolTable::new();
        let small = Type::Array {
            elem: Rc::new(Type::Int),
            size: 3,
        };
        assert_eq!(
            asm_type_of(&table, &small),
            AsmType::ByteArray {
                size: 12,
                alignment: 4
            }
        );
        let large = Type::Array {
            elem: Rc::new(Type::Int),
            size: 4,
        };
        assert_eq!(
            asm_type_of(&table, &large),
            AsmType::ByteArray {
                size: 16,
                alignment: 16
            }
        );
    }

    #[test]
    fn conversion_clears_register_masks() {
        use crate::symbols::Symbol;
        use crate::types::FunType;
        let mut interner = Interner::new();
        let mut table = SymbolTable::new();
        let name = interner.intern("f");
        let fun_type = Rc::new(FunType::new(vec![], Rc::new(Type::Int)));
        table.insert(
            name,
            Symbol {
                ty: Rc::new(Type::Fun(Rc::clone(&fun_type))),
                attrs: IdentAttrs::Fun {
                    defined: true,
                    global: true,
                },
            },
        );
        assert_eq!(fun_type.param_reg_mask.get(), REG_MASK_UNSET);
        let backend = convert_symbol_table(&table);
        assert_eq!(fun_type.param_reg_mask.get(), 0);
        assert!(matches!(
            backend.expect(name),
            BackendSymbol::Fun {
                is_defined: true,
                ..
            }
        ));
    }
}
