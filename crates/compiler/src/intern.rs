//! Identifier interning
//!
//! Every distinct source string (identifiers, labels, string-literal keys)
//! is mapped to a compact [`Ident`] handle exactly once. The table is
//! append-only: once a string is interned its handle never changes, so
//! handles can be compared and ordered cheaply everywhere downstream.
//!
//! The interner also owns the counters used to mint unique names:
//! alpha-renamed variables and compiler-introduced temporaries get
//! `name.N` forms, labels `kind.N`, struct tags `tag.N`. A single shared
//! counter per category keeps generated names stable across runs for the
//! same input.

use std::collections::HashMap;

/// Opaque handle to an interned string.
///
/// Ordering follows interning order (first-seen order), which makes
/// `BTreeMap<Ident, _>` iteration deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ident(u32);

#[derive(Debug, Default)]
pub struct Interner {
    map: HashMap<String, Ident>,
    names: Vec<String>,
    label_count: u32,
    var_count: u32,
    struct_count: u32,
}

impl Interner {
    pub fn new() -> Self {
        Interner::default()
    }

    /// Intern a string, returning its stable handle.
    pub fn intern(&mut self, name: &str) -> Ident {
        if let Some(&id) = self.map.get(name) {
            return id;
        }
        let id = Ident(self.names.len() as u32);
        self.names.push(name.to_string());
        self.map.insert(name.to_string(), id);
        id
    }

    /// Resolve a handle back to its string.
    pub fn lookup(&self, id: Ident) -> &str {
        &self.names[id.0 as usize]
    }

    /// Mint a unique label name of the form `name.N`.
    pub fn make_label(&mut self, name: &str) -> Ident {
        let unique = format!("{}.{}", name, self.label_count);
        self.label_count += 1;
        self.intern(&unique)
    }

    /// Mint a unique variable name of the form `name.N`.
    ///
    /// Used both for alpha-renaming block-scope declarations and for
    /// compiler temporaries.
    pub fn make_var(&mut self, name: &str) -> Ident {
        let unique = format!("{}.{}", name, self.var_count);
        self.var_count += 1;
        self.intern(&unique)
    }

    /// Mint a unique structure tag of the form `tag.N`.
    pub fn make_struct_tag(&mut self, tag: &str) -> Ident {
        let unique = format!("{}.{}", tag, self.struct_count);
        self.struct_count += 1;
        self.intern(&unique)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_injective_and_stable() {
        let mut interner = Interner::new();
        let a = interner.intern("main");
        let b = interner.intern("x");
        let a2 = interner.intern("main");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(interner.lookup(a), "main");
        assert_eq!(interner.lookup(b), "x");
    }

    #[test]
    fn minted_names_are_unique() {
        let mut interner = Interner::new();
        let l1 = interner.make_label("and_false");
        let l2 = interner.make_label("and_false");
        assert_ne!(l1, l2);
        assert_eq!(interner.lookup(l1), "and_false.0");
        assert_eq!(interner.lookup(l2), "and_false.1");
        let v = interner.make_var("x");
        assert_eq!(interner.lookup(v), "x.0");
        let t = interner.make_struct_tag("point");
        assert_eq!(interner.lookup(t), "point.0");
    }
}
