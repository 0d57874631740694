//! Identifier, tag, label, and loop resolution
//!
//! A single recursive walk over the AST that
//!
//! - resolves variable and function names against a stack of scope maps,
//!   alpha-renaming block-scope variables to `name.N` (identifiers with
//!   linkage keep their source name),
//! - resolves structure tags against a parallel stack of tag maps,
//!   renaming each declared tag to a unique `tag.N`,
//! - assigns every loop and switch a unique target label and binds
//!   `break`/`continue`/`case`/`default` to the nearest enclosing
//!   construct,
//! - renames goto labels per function and checks every `goto` has a
//!   matching label.
//!
//! Type checking happens afterwards, on the resolved tree.

use crate::ast::*;
use crate::errors::{CompileError, SemanticErrorKind};
use crate::intern::{Ident, Interner};
use crate::types::{FunType, Type};
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Copy)]
struct VarEntry {
    unique: Ident,
    has_linkage: bool,
}

#[derive(Default)]
struct Scope {
    vars: HashMap<Ident, VarEntry>,
    tags: HashMap<Ident, Ident>,
}

struct SwitchFrame {
    label: Ident,
    case_count: usize,
}

pub struct Resolver<'a> {
    interner: &'a mut Interner,
    scopes: Vec<Scope>,
    break_stack: Vec<Ident>,
    continue_stack: Vec<Ident>,
    switch_stack: Vec<SwitchFrame>,
    /// Goto labels of the function being walked: source name -> unique.
    labels: HashMap<Ident, Ident>,
}

impl<'a> Resolver<'a> {
    pub fn new(interner: &'a mut Interner) -> Self {
        Resolver {
            interner,
            scopes: vec![Scope::default()],
            break_stack: Vec::new(),
            continue_stack: Vec::new(),
            switch_stack: Vec::new(),
            labels: HashMap::new(),
        }
    }

    pub fn resolve(mut self, program: &mut Program) -> Result<(), CompileError> {
        for decl in &mut program.decls {
            match decl {
                Declaration::Var(var) => self.resolve_file_var_decl(var)?,
                Declaration::Fun(fun) => self.resolve_fun_decl(fun)?,
                Declaration::Struct(decl) => self.resolve_struct_decl(decl)?,
            }
        }
        Ok(())
    }

    fn err(kind: SemanticErrorKind, line: usize, message: String) -> CompileError {
        CompileError::semantic(kind, line, message)
    }

    fn name(&self, id: Ident) -> &str {
        self.interner.lookup(id)
    }

    // ------------------------------------------------------------------
    // Scopes

    fn current_scope(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("scope stack is never empty")
    }

    fn at_file_scope(&self) -> bool {
        self.scopes.len() == 1
    }

    fn lookup_var(&self, name: Ident) -> Option<VarEntry> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.vars.get(&name).copied())
    }

    fn lookup_tag(&self, tag: Ident) -> Option<Ident> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.tags.get(&tag).copied())
    }

    // ------------------------------------------------------------------
    // Declarations

    fn resolve_struct_decl(&mut self, decl: &mut StructDecl) -> Result<(), CompileError> {
        let unique = match self.current_scope().tags.get(&decl.tag) {
            Some(&unique) => unique,
            None => {
                let base = self.name(decl.tag).to_string();
                let unique = self.interner.make_struct_tag(&base);
                self.current_scope().tags.insert(decl.tag, unique);
                unique
            }
        };
        decl.tag = unique;
        for member in &mut decl.members {
            member.member_type = self.resolve_type(&member.member_type, member.line)?;
        }
        Ok(())
    }

    /// Rebuild a type with every structure tag replaced by its resolved
    /// unique tag.
    fn resolve_type(&mut self, ty: &Rc<Type>, line: usize) -> Result<Rc<Type>, CompileError> {
        let resolved = match &**ty {
            Type::Pointer(referent) => Type::Pointer(self.resolve_type(referent, line)?),
            Type::Array { elem, size } => Type::Array {
                elem: self.resolve_type(elem, line)?,
                size: *size,
            },
            Type::Fun(fun_type) => {
                let mut params = Vec::with_capacity(fun_type.params.len());
                for param in &fun_type.params {
                    params.push(self.resolve_type(param, line)?);
                }
                let ret = self.resolve_type(&fun_type.ret, line)?;
                Type::Fun(Rc::new(FunType::new(params, ret)))
            }
            Type::Structure { tag, is_union } => {
                let Some(unique) = self.lookup_tag(*tag) else {
                    return Err(Self::err(
                        SemanticErrorKind::UndeclaredTag,
                        line,
                        format!(
                            "use of undeclared {} '{}'",
                            if *is_union { "union" } else { "struct" },
                            self.name(*tag)
                        ),
                    ));
                };
                Type::Structure {
                    tag: unique,
                    is_union: *is_union,
                }
            }
            _ => return Ok(Rc::clone(ty)),
        };
        Ok(Rc::new(resolved))
    }

    fn resolve_file_var_decl(&mut self, decl: &mut VarDecl) -> Result<(), CompileError> {
        decl.var_type = self.resolve_type(&decl.var_type, decl.line)?;
        self.current_scope().vars.insert(
            decl.name,
            VarEntry {
                unique: decl.name,
                has_linkage: true,
            },
        );
        if let Some(init) = &mut decl.init {
            self.resolve_initializer(init)?;
        }
        Ok(())
    }

    fn resolve_block_var_decl(&mut self, decl: &mut VarDecl) -> Result<(), CompileError> {
        decl.var_type = self.resolve_type(&decl.var_type, decl.line)?;
        let is_extern = decl.storage == Some(StorageClass::Extern);
        if let Some(prev) = self.current_scope().vars.get(&decl.name)
            && !(prev.has_linkage && is_extern)
        {
            return Err(Self::err(
                SemanticErrorKind::RedeclConflict,
                decl.line,
                format!("'{}' redeclared in the same scope", self.name(decl.name)),
            ));
        }
        let unique = if is_extern {
            decl.name
        } else {
            let base = self.name(decl.name).to_string();
            self.interner.make_var(&base)
        };
        self.current_scope().vars.insert(
            decl.name,
            VarEntry {
                unique,
                has_linkage: is_extern,
            },
        );
        decl.name = unique;
        if let Some(init) = &mut decl.init {
            self.resolve_initializer(init)?;
        }
        Ok(())
    }

    fn resolve_fun_decl(&mut self, decl: &mut FunDecl) -> Result<(), CompileError> {
        if !self.at_file_scope() {
            if decl.body.is_some() {
                return Err(Self::err(
                    SemanticErrorKind::RedeclConflict,
                    decl.line,
                    format!("nested definition of function '{}'", self.name(decl.name)),
                ));
            }
            if decl.storage == Some(StorageClass::Static) {
                return Err(Self::err(
                    SemanticErrorKind::RedeclConflict,
                    decl.line,
                    format!(
                        "block-scope function '{}' declared static",
                        self.name(decl.name)
                    ),
                ));
            }
            if let Some(prev) = self.current_scope().vars.get(&decl.name)
                && !prev.has_linkage
            {
                return Err(Self::err(
                    SemanticErrorKind::RedeclConflict,
                    decl.line,
                    format!("'{}' redeclared in the same scope", self.name(decl.name)),
                ));
            }
        }
        decl.fun_type = self.resolve_type(&decl.fun_type, decl.line)?;
        self.current_scope().vars.insert(
            decl.name,
            VarEntry {
                unique: decl.name,
                has_linkage: true,
            },
        );
        if let Some(body) = &mut decl.body {
            // Collect and rename goto labels before walking the body.
            self.labels.clear();
            Self::collect_labels(body, &mut |name, line| {
                if self.labels.contains_key(&name) {
                    return Err(Self::err(
                        SemanticErrorKind::RedefLabel,
                        line,
                        format!("label '{}' defined twice", self.interner.lookup(name)),
                    ));
                }
                let base = self.interner.lookup(name).to_string();
                let unique = self.interner.make_label(&base);
                self.labels.insert(name, unique);
                Ok(())
            })?;

            self.scopes.push(Scope::default());
            for param in &mut decl.params {
                let base = self.name(*param).to_string();
                let unique = self.interner.make_var(&base);
                if self
                    .current_scope()
                    .vars
                    .insert(
                        *param,
                        VarEntry {
                            unique,
                            has_linkage: false,
                        },
                    )
                    .is_some()
                {
                    return Err(Self::err(
                        SemanticErrorKind::RedeclConflict,
                        decl.line,
                        format!("duplicate parameter '{}'", self.name(*param)),
                    ));
                }
                *param = unique;
            }
            // The body's items live in the parameter scope.
            for item in &mut body.items {
                self.resolve_block_item(item)?;
            }
            self.scopes.pop();
        }
        Ok(())
    }

    /// Pre-scan a function body for declared goto labels.
    fn collect_labels(
        block: &Block,
        declare: &mut impl FnMut(Ident, usize) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        fn walk_stmt(
            stmt: &Statement,
            declare: &mut impl FnMut(Ident, usize) -> Result<(), CompileError>,
        ) -> Result<(), CompileError> {
            match stmt {
                Statement::Label { name, stmt, line } => {
                    declare(*name, *line)?;
                    walk_stmt(stmt, declare)
                }
                Statement::If {
                    then_stmt,
                    else_stmt,
                    ..
                } => {
                    walk_stmt(then_stmt, declare)?;
                    if let Some(else_stmt) = else_stmt {
                        walk_stmt(else_stmt, declare)?;
                    }
                    Ok(())
                }
                Statement::Compound(block) => Resolver::collect_labels(block, declare),
                Statement::While { body, .. }
                | Statement::DoWhile { body, .. }
                | Statement::For { body, .. } => walk_stmt(body, declare),
                Statement::Switch { body, .. } => walk_stmt(body, declare),
                Statement::Case { stmt, .. } | Statement::Default { stmt, .. } => {
                    walk_stmt(stmt, declare)
                }
                _ => Ok(()),
            }
        }
        for item in &block.items {
            if let BlockItem::Stmt(stmt) = item {
                walk_stmt(stmt, declare)?;
            }
        }
        Ok(())
    }

    fn resolve_block_item(&mut self, item: &mut BlockItem) -> Result<(), CompileError> {
        match item {
            BlockItem::Decl(Declaration::Var(decl)) => self.resolve_block_var_decl(decl),
            BlockItem::Decl(Declaration::Fun(decl)) => self.resolve_fun_decl(decl),
            BlockItem::Decl(Declaration::Struct(decl)) => self.resolve_struct_decl(decl),
            BlockItem::Stmt(stmt) => self.resolve_statement(stmt),
        }
    }

    // ------------------------------------------------------------------
    // Statements

    fn resolve_statement(&mut self, stmt: &mut Statement) -> Result<(), CompileError> {
        match stmt {
            Statement::Return { exp, .. } => {
                if let Some(exp) = exp {
                    self.resolve_exp(exp)?;
                }
                Ok(())
            }
            Statement::Expression(exp) => self.resolve_exp(exp),
            Statement::If {
                cond,
                then_stmt,
                else_stmt,
            } => {
                self.resolve_exp(cond)?;
                self.resolve_statement(then_stmt)?;
                if let Some(else_stmt) = else_stmt {
                    self.resolve_statement(else_stmt)?;
                }
                Ok(())
            }
            Statement::Compound(block) => {
                self.scopes.push(Scope::default());
                for item in &mut block.items {
                    self.resolve_block_item(item)?;
                }
                self.scopes.pop();
                Ok(())
            }
            Statement::While { label, cond, body } => {
                self.resolve_exp(cond)?;
                let target = self.interner.make_label("while");
                *label = Some(target);
                self.break_stack.push(target);
                self.continue_stack.push(target);
                self.resolve_statement(body)?;
                self.break_stack.pop();
                self.continue_stack.pop();
                Ok(())
            }
            Statement::DoWhile { label, body, cond } => {
                let target = self.interner.make_label("do_while");
                *label = Some(target);
                self.break_stack.push(target);
                self.continue_stack.push(target);
                self.resolve_statement(body)?;
                self.break_stack.pop();
                self.continue_stack.pop();
                self.resolve_exp(cond)
            }
            Statement::For {
                label,
                init,
                cond,
                post,
                body,
            } => {
                // The init declaration lives in its own scope.
                self.scopes.push(Scope::default());
                match init {
                    ForInit::Decl(decl) => self.resolve_block_var_decl(decl)?,
                    ForInit::Exp(Some(exp)) => self.resolve_exp(exp)?,
                    ForInit::Exp(None) => {}
                }
                if let Some(cond) = cond {
                    self.resolve_exp(cond)?;
                }
                if let Some(post) = post {
                    self.resolve_exp(post)?;
                }
                let target = self.interner.make_label("for");
                *label = Some(target);
                self.break_stack.push(target);
                self.continue_stack.push(target);
                self.resolve_statement(body)?;
                self.break_stack.pop();
                self.continue_stack.pop();
                self.scopes.pop();
                Ok(())
            }
            Statement::Switch {
                label, cond, body, ..
            } => {
                self.resolve_exp(cond)?;
                let target = self.interner.make_label("switch");
                *label = Some(target);
                self.break_stack.push(target);
                self.switch_stack.push(SwitchFrame {
                    label: target,
                    case_count: 0,
                });
                self.resolve_statement(body)?;
                self.switch_stack.pop();
                self.break_stack.pop();
                Ok(())
            }
            Statement::Case {
                value,
                stmt,
                label,
                line,
            } => {
                self.resolve_exp(value)?;
                let Some(frame) = self.switch_stack.last_mut() else {
                    return Err(Self::err(
                        SemanticErrorKind::OutOfSwitch,
                        *line,
                        "case label outside of switch".to_string(),
                    ));
                };
                let index = frame.case_count;
                frame.case_count += 1;
                let switch_label = frame.label;
                let name = format!("case_{}_{}", index, self.name(switch_label));
                *label = Some(self.interner.intern(&name));
                self.resolve_statement(stmt)
            }
            Statement::Default { stmt, label, line } => {
                let Some(frame) = self.switch_stack.last() else {
                    return Err(Self::err(
                        SemanticErrorKind::OutOfSwitch,
                        *line,
                        "default label outside of switch".to_string(),
                    ));
                };
                let name = format!("default_{}", self.name(frame.label));
                *label = Some(self.interner.intern(&name));
                self.resolve_statement(stmt)
            }
            Statement::Break { label, line } => {
                let Some(&target) = self.break_stack.last() else {
                    return Err(Self::err(
                        SemanticErrorKind::OutOfLoop,
                        *line,
                        "break outside of loop or switch".to_string(),
                    ));
                };
                *label = Some(target);
                Ok(())
            }
            Statement::Continue { label, line } => {
                let Some(&target) = self.continue_stack.last() else {
                    return Err(Self::err(
                        SemanticErrorKind::OutOfLoop,
                        *line,
                        "continue outside of loop".to_string(),
                    ));
                };
                *label = Some(target);
                Ok(())
            }
            Statement::Goto { target, line } => {
                let Some(&unique) = self.labels.get(target) else {
                    return Err(Self::err(
                        SemanticErrorKind::UndefGotoTarget,
                        *line,
                        format!("goto to undefined label '{}'", self.name(*target)),
                    ));
                };
                *target = unique;
                Ok(())
            }
            Statement::Label { name, stmt, .. } => {
                // Declared during the pre-scan; just rewrite.
                *name = self.labels[&*name];
                self.resolve_statement(stmt)
            }
            Statement::Null => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Expressions

    fn resolve_initializer(&mut self, init: &mut Initializer) -> Result<(), CompileError> {
        match init {
            Initializer::Single { exp, .. } => self.resolve_exp(exp),
            Initializer::Compound { inits, .. } => {
                for init in inits {
                    self.resolve_initializer(init)?;
                }
                Ok(())
            }
        }
    }

    fn resolve_exp(&mut self, exp: &mut Exp) -> Result<(), CompileError> {
        match &mut exp.kind {
            ExpKind::Constant(_) | ExpKind::String(_) => Ok(()),
            ExpKind::Var(name) => {
                let Some(entry) = self.lookup_var(*name) else {
                    return Err(Self::err(
                        SemanticErrorKind::UndeclaredIdent,
                        exp.line,
                        format!("use of undeclared identifier '{}'", self.name(*name)),
                    ));
                };
                *name = entry.unique;
                Ok(())
            }
            ExpKind::Cast { target, exp } => {
                *target = self.resolve_type(target, exp.line)?;
                self.resolve_exp(exp)
            }
            ExpKind::Unary { exp, .. } => self.resolve_exp(exp),
            ExpKind::Binary { lhs, rhs, .. } => {
                self.resolve_exp(lhs)?;
                self.resolve_exp(rhs)
            }
            ExpKind::Assignment { lhs, rhs } => {
                self.resolve_exp(lhs)?;
                self.resolve_exp(rhs)
            }
            ExpKind::CompoundAssignment { lhs, rhs, .. } => {
                self.resolve_exp(lhs)?;
                self.resolve_exp(rhs)
            }
            ExpKind::Postfix { exp, .. } => self.resolve_exp(exp),
            ExpKind::Conditional {
                cond,
                then_exp,
                else_exp,
            } => {
                self.resolve_exp(cond)?;
                self.resolve_exp(then_exp)?;
                self.resolve_exp(else_exp)
            }
            ExpKind::Call { name, args } => {
                let line = exp.line;
                let Some(entry) = self.lookup_var(*name) else {
                    return Err(Self::err(
                        SemanticErrorKind::UndeclaredIdent,
                        line,
                        format!("call to undeclared function '{}'", self.name(*name)),
                    ));
                };
                *name = entry.unique;
                for arg in args {
                    self.resolve_exp(arg)?;
                }
                Ok(())
            }
            ExpKind::Dereference(inner) => self.resolve_exp(inner),
            ExpKind::AddrOf(inner) => self.resolve_exp(inner),
            ExpKind::Subscript { base, index } => {
                self.resolve_exp(base)?;
                self.resolve_exp(index)
            }
            ExpKind::SizeOf(inner) => self.resolve_exp(inner),
            ExpKind::SizeOfT(target) => {
                *target = self.resolve_type(target, exp.line)?;
                Ok(())
            }
            ExpKind::Dot { structure, .. } => self.resolve_exp(structure),
            ExpKind::Arrow { pointer, .. } => self.resolve_exp(pointer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn resolve(source: &str) -> Result<(Program, Interner), CompileError> {
        let mut interner = Interner::new();
        let tokens = Lexer::new(&mut interner, &[]).tokenize(source, None).unwrap();
        let mut program = Parser::new(tokens, &mut interner).parse().unwrap();
        Resolver::new(&mut interner).resolve(&mut program)?;
        Ok((program, interner))
    }

    #[test]
    fn block_scope_variables_are_renamed() {
        let (program, interner) =
            resolve("int main(void) { int a = 1; { int a = 2; } return a; }").unwrap();
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let items = &fun.body.as_ref().unwrap().items;
        let BlockItem::Decl(Declaration::Var(outer)) = &items[0] else {
            panic!()
        };
        let BlockItem::Stmt(Statement::Compound(block)) = &items[1] else {
            panic!()
        };
        let BlockItem::Decl(Declaration::Var(inner)) = &block.items[0] else {
            panic!()
        };
        assert_ne!(outer.name, inner.name);
        assert!(interner.lookup(outer.name).starts_with("a."));
        assert!(interner.lookup(inner.name).starts_with("a."));
    }

    #[test]
    fn shadowing_resolves_to_nearest() {
        // `return a;` after the inner block refers to the outer `a`.
        let (program, _) =
            resolve("int main(void) { int a = 1; { int a = 2; } return a; }").unwrap();
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let items = &fun.body.as_ref().unwrap().items;
        let BlockItem::Decl(Declaration::Var(outer)) = &items[0] else {
            panic!()
        };
        let BlockItem::Stmt(Statement::Return { exp: Some(exp), .. }) = &items[2] else {
            panic!()
        };
        let ExpKind::Var(name) = exp.kind else { panic!() };
        assert_eq!(name, outer.name);
    }

    #[test]
    fn duplicate_declaration_is_rejected() {
        let err = resolve("int main(void) { int a = 1; int a = 2; return a; }").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic {
                kind: SemanticErrorKind::RedeclConflict,
                ..
            }
        ));
    }

    #[test]
    fn undeclared_identifier_is_rejected() {
        let err = resolve("int main(void) { return x; }").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic {
                kind: SemanticErrorKind::UndeclaredIdent,
                ..
            }
        ));
    }

    #[test]
    fn break_binds_to_innermost_construct() {
        let (program, _) = resolve(
            "int main(void) { int i; for (i = 0; i < 3; i = i + 1) { \
             switch (i) { case 0: break; } break; } return i; }",
        )
        .unwrap();
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Stmt(Statement::For { label, body, .. }) =
            &fun.body.as_ref().unwrap().items[1]
        else {
            panic!()
        };
        let for_label = label.unwrap();
        let Statement::Compound(block) = &**body else { panic!() };
        let BlockItem::Stmt(Statement::Switch {
            label: switch_label,
            body: switch_body,
            ..
        }) = &block.items[0]
        else {
            panic!()
        };
        // break inside the switch binds to the switch
        let Statement::Case { stmt, .. } = &**switch_body else {
            panic!()
        };
        let Statement::Break { label: b1, .. } = &**stmt else {
            panic!()
        };
        assert_eq!(*b1, *switch_label);
        // break after the switch binds to the for
        let BlockItem::Stmt(Statement::Break { label: b2, .. }) = &block.items[1] else {
            panic!()
        };
        assert_eq!(b2.unwrap(), for_label);
    }

    #[test]
    fn continue_skips_switches() {
        let (program, _) = resolve(
            "int main(void) { int i = 0; while (i < 3) { switch (i) { default: continue; } } return 0; }",
        )
        .unwrap();
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Stmt(Statement::While { label, body, .. }) =
            &fun.body.as_ref().unwrap().items[1]
        else {
            panic!()
        };
        let Statement::Compound(block) = &**body else { panic!() };
        let BlockItem::Stmt(Statement::Switch { body: sbody, .. }) = &block.items[0] else {
            panic!()
        };
        let Statement::Default { stmt, .. } = &**sbody else {
            panic!()
        };
        let Statement::Continue { label: clabel, .. } = &**stmt else {
            panic!()
        };
        assert_eq!(*clabel, *label);
    }

    #[test]
    fn case_outside_switch_is_rejected() {
        let err = resolve("int main(void) { case 1: return 0; }").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic {
                kind: SemanticErrorKind::OutOfSwitch,
                ..
            }
        ));
    }

    #[test]
    fn goto_to_missing_label_is_rejected() {
        let err = resolve("int main(void) { goto done; return 1; }").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic {
                kind: SemanticErrorKind::UndefGotoTarget,
                ..
            }
        ));
    }

    #[test]
    fn goto_forward_reference_resolves() {
        resolve("int main(void) { goto done; done: return 0; }").unwrap();
    }

    #[test]
    fn undeclared_struct_tag_is_rejected() {
        let err = resolve("int main(void) { struct missing *p = 0; return 0; }").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic {
                kind: SemanticErrorKind::UndeclaredTag,
                ..
            }
        ));
    }

    #[test]
    fn extern_in_inner_scope_keeps_the_name() {
        let (program, interner) =
            resolve("int x; int main(void) { extern int x; return x; }").unwrap();
        let Declaration::Fun(fun) = &program.decls[1] else {
            unreachable!()
        };
        let BlockItem::Decl(Declaration::Var(decl)) = &fun.body.as_ref().unwrap().items[0] else {
            panic!()
        };
        assert_eq!(interner.lookup(decl.name), "x");
    }
}
