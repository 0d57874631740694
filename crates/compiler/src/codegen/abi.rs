//! System-V AMD64 classification of aggregates
//!
//! Each struct or union is split into eightbytes and every eightbyte
//! classified INTEGER, SSE, or MEMORY. Anything larger than 16 bytes is
//! passed in memory outright; up to 16 bytes, an eightbyte is SSE only
//! when every scalar it overlaps is a double. Unions take the most
//! conservative classification across their members.
//!
//! Classification depends only on the type, so results are memoized per
//! structure tag.

use crate::intern::Ident;
use crate::symbols::SymbolTable;
use crate::types::Type;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EightbyteClass {
    Integer,
    Sse,
    Memory,
}

#[derive(Debug, Default)]
pub struct ClassCache {
    map: HashMap<Ident, Vec<EightbyteClass>>,
}

impl ClassCache {
    pub fn new() -> Self {
        ClassCache::default()
    }

    /// Classes of a structure's eightbytes, computed on first use.
    pub fn classify(&mut self, table: &SymbolTable, tag: Ident, is_union: bool) -> &[EightbyteClass] {
        if !self.map.contains_key(&tag) {
            let classes = self.compute(table, tag, is_union);
            self.map.insert(tag, classes);
        }
        &self.map[&tag]
    }

    fn compute(&mut self, table: &SymbolTable, tag: Ident, is_union: bool) -> Vec<EightbyteClass> {
        let size = table.structs[&tag].size;
        if size > 16 {
            let mut classes = Vec::new();
            let mut remaining = size;
            while remaining > 0 {
                classes.push(EightbyteClass::Memory);
                remaining -= 8;
            }
            classes
        } else if size > 8 {
            self.two_eightbytes(table, tag, is_union)
        } else {
            self.one_eightbyte(table, tag, is_union)
        }
    }

    /// Size at most 8: a single eightbyte, SSE only if every member
    /// scalar (looking through arrays and nested structs) is a double.
    /// For a struct that small, only the first member can matter.
    fn one_eightbyte(&mut self, table: &SymbolTable, tag: Ident, is_union: bool) -> Vec<EightbyteClass> {
        let mut class = EightbyteClass::Sse;
        let member_count = if is_union {
            table.structs[&tag].member_names.len()
        } else {
            1
        };
        for i in 0..member_count {
            if class == EightbyteClass::Integer {
                break;
            }
            let member_ty = member_type_at(table, tag, i);
            let member_ty = strip_arrays(&member_ty);
            if let Type::Structure {
                tag: inner_tag,
                is_union: inner_union,
            } = member_ty
            {
                if self.classify(table, inner_tag, inner_union)[0] == EightbyteClass::Integer {
                    class = EightbyteClass::Integer;
                }
            } else if !matches!(member_ty, Type::Double) {
                class = EightbyteClass::Integer;
            }
        }
        vec![class]
    }

    /// Size 9..=16: two eightbytes classified independently; a member
    /// spanning both taints both.
    fn two_eightbytes(&mut self, table: &SymbolTable, tag: Ident, is_union: bool) -> Vec<EightbyteClass> {
        let mut classes = [EightbyteClass::Sse, EightbyteClass::Sse];
        let member_count = if is_union {
            table.structs[&tag].member_names.len()
        } else {
            1
        };
        for i in 0..member_count {
            if classes[0] == EightbyteClass::Integer && classes[1] == EightbyteClass::Integer {
                break;
            }
            let declared = member_type_at(table, tag, i);
            let (member_ty, array_len) = strip_arrays_counting(&declared);
            let member_size = match &member_ty {
                Type::Structure { tag: inner, .. } => array_len * table.structs[inner].size,
                scalar => array_len * scalar.scalar_size() as i64,
            };
            if member_size > 8 {
                if let Type::Structure {
                    tag: inner_tag,
                    is_union: inner_union,
                } = member_ty
                {
                    let inner = self.classify(table, inner_tag, inner_union).to_vec();
                    if inner.len() > 1 {
                        if inner[0] == EightbyteClass::Integer {
                            classes[0] = EightbyteClass::Integer;
                        }
                        if inner[1] == EightbyteClass::Integer {
                            classes[1] = EightbyteClass::Integer;
                        }
                    } else if inner[0] == EightbyteClass::Integer {
                        classes = [EightbyteClass::Integer, EightbyteClass::Integer];
                    }
                } else if !matches!(member_ty, Type::Double) {
                    classes = [EightbyteClass::Integer, EightbyteClass::Integer];
                }
            } else {
                if let Type::Structure {
                    tag: inner_tag,
                    is_union: inner_union,
                } = member_ty
                {
                    if self.classify(table, inner_tag, inner_union)[0] == EightbyteClass::Integer {
                        classes[0] = EightbyteClass::Integer;
                    }
                } else if !matches!(member_ty, Type::Double) {
                    classes[0] = EightbyteClass::Integer;
                }
                if !is_union {
                    // The second eightbyte of a two-eightbyte struct is
                    // governed by its last member.
                    let last = table.structs[&tag].member_names.len() - 1;
                    let last_ty = member_type_at(table, tag, last);
                    let last_ty = strip_arrays(&last_ty);
                    if let Type::Structure {
                        tag: inner_tag,
                        is_union: inner_union,
                    } = last_ty
                    {
                        if self.classify(table, inner_tag, inner_union)[0]
                            == EightbyteClass::Integer
                        {
                            classes[1] = EightbyteClass::Integer;
                        }
                    } else if !matches!(last_ty, Type::Double) {
                        classes[1] = EightbyteClass::Integer;
                    }
                }
            }
        }
        classes.to_vec()
    }
}

fn member_type_at(table: &SymbolTable, tag: Ident, index: usize) -> Type {
    let layout = &table.structs[&tag];
    let name = layout.member_names[index];
    clone_shallow(&layout.members[&name].ty)
}

/// A cheap structural copy that is enough for classification decisions.
fn clone_shallow(ty: &Type) -> Type {
    match ty {
        Type::Pointer(r) => Type::Pointer(std::rc::Rc::clone(r)),
        Type::Array { elem, size } => Type::Array {
            elem: std::rc::Rc::clone(elem),
            size: *size,
        },
        Type::Structure { tag, is_union } => Type::Structure {
            tag: *tag,
            is_union: *is_union,
        },
        Type::Char => Type::Char,
        Type::SChar => Type::SChar,
        Type::UChar => Type::UChar,
        Type::Int => Type::Int,
        Type::Long => Type::Long,
        Type::UInt => Type::UInt,
        Type::ULong => Type::ULong,
        Type::Double => Type::Double,
        Type::Void => Type::Void,
        Type::Fun(f) => Type::Fun(std::rc::Rc::clone(f)),
    }
}

fn strip_arrays(ty: &Type) -> Type {
    let mut current = clone_shallow(ty);
    while let Type::Array { elem, .. } = current {
        current = clone_shallow(&elem);
    }
    current
}

fn strip_arrays_counting(ty: &Type) -> (Type, i64) {
    let mut count = 1i64;
    let mut current = clone_shallow(ty);
    while let Type::Array { elem, size } = current {
        count *= size;
        current = clone_shallow(&elem);
    }
    (current, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interner;
    use crate::symbols::{StructLayout, StructMember};
    use std::collections::HashMap as Map;
    use std::rc::Rc;

    fn layout(
        table: &mut SymbolTable,
        interner: &mut Interner,
        tag: &str,
        members: &[(&str, Type, i64)],
        size: i64,
        alignment: i32,
    ) -> Ident {
        let tag = interner.intern(tag);
        let mut member_names = Vec::new();
        let mut map = Map::new();
        for (name, ty, offset) in members {
            let name = interner.intern(name);
            member_names.push(name);
            map.insert(
                name,
                StructMember {
                    offset: *offset,
                    ty: Rc::new(clone_shallow(ty)),
                },
            );
        }
        table.structs.insert(
            tag,
            StructLayout {
                alignment,
                size,
                member_names,
                members: map,
            },
        );
        tag
    }

    #[test]
    fn small_integer_struct_is_integer() {
        let mut interner = Interner::new();
        let mut table = SymbolTable::new();
        let tag = layout(
            &mut table,
            &mut interner,
            "pair.0",
            &[("a", Type::Int, 0), ("b", Type::Int, 4)],
            8,
            4,
        );
        let mut cache = ClassCache::new();
        assert_eq!(
            cache.classify(&table, tag, false),
            &[EightbyteClass::Integer]
        );
    }

    #[test]
    fn two_doubles_are_two_sse_eightbytes() {
        let mut interner = Interner::new();
        let mut table = SymbolTable::new();
        let tag = layout(
            &mut table,
            &mut interner,
            "vec2.0",
            &[("x", Type::Double, 0), ("y", Type::Double, 8)],
            16,
            8,
        );
        let mut cache = ClassCache::new();
        assert_eq!(
            cache.classify(&table, tag, false),
            &[EightbyteClass::Sse, EightbyteClass::Sse]
        );
    }

    #[test]
    fn double_then_long_mixes_classes() {
        let mut interner = Interner::new();
        let mut table = SymbolTable::new();
        let tag = layout(
            &mut table,
            &mut interner,
            "mix.0",
            &[("d", Type::Double, 0), ("l", Type::Long, 8)],
            16,
            8,
        );
        let mut cache = ClassCache::new();
        assert_eq!(
            cache.classify(&table, tag, false),
            &[EightbyteClass::Sse, EightbyteClass::Integer]
        );
    }

    #[test]
    fn oversized_struct_is_all_memory() {
        let mut interner = Interner::new();
        let mut table = SymbolTable::new();
        let tag = layout(
            &mut table,
            &mut interner,
            "big.0",
            &[(
                "a",
                Type::Array {
                    elem: Rc::new(Type::Int),
                    size: 6,
                },
                0,
            )],
            24,
            4,
        );
        let mut cache = ClassCache::new();
        assert_eq!(
            cache.classify(&table, tag, false),
            &[
                EightbyteClass::Memory,
                EightbyteClass::Memory,
                EightbyteClass::Memory
            ]
        );
    }

    #[test]
    fn union_takes_the_conservative_class() {
        let mut interner = Interner::new();
        let mut table = SymbolTable::new();
        // A union of a double and a long: the integer member wins.
        let tag = layout(
            &mut table,
            &mut interner,
            "u.0",
            &[("d", Type::Double, 0), ("l", Type::Long, 0)],
            8,
            8,
        );
        let mut cache = ClassCache::new();
        assert_eq!(
            cache.classify(&table, tag, true),
            &[EightbyteClass::Integer]
        );
    }

    #[test]
    fn classification_is_cached_and_stable() {
        let mut interner = Interner::new();
        let mut table = SymbolTable::new();
        let tag = layout(
            &mut table,
            &mut interner,
            "pair.1",
            &[("a", Type::Long, 0), ("b", Type::Double, 8)],
            16,
            8,
        );
        let mut cache = ClassCache::new();
        let first = cache.classify(&table, tag, false).to_vec();
        let second = cache.classify(&table, tag, false).to_vec();
        assert_eq!(first, second);
        assert_eq!(first, vec![EightbyteClass::Integer, EightbyteClass::Sse]);
    }
}
