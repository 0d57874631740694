//! Type checking and symbol table construction
//!
//! Walks the resolved AST and
//!
//! - gives every expression a type, inserting implicit `Cast` nodes for
//!   the usual arithmetic conversions, assignment-like contexts, and
//!   array-to-pointer decay,
//! - populates the symbol table (functions, file-scope and block-scope
//!   variables, anonymous string constants) and merges redeclarations,
//! - computes struct and union layouts,
//! - elaborates compile-time initializers into static-init lists and pads
//!   automatic compound initializers with explicit zeros,
//! - collects and checks switch cases against the promoted controlling
//!   type.
//!
//! Everything downstream (lowering, instruction selection) trusts the
//! types recorded here and never re-derives conversions.

use crate::ast::*;
use crate::errors::{CompileError, SemanticErrorKind};
use crate::intern::{Ident, Interner};
use crate::symbols::{
    IdentAttrs, InitialValue, StaticInit, StructLayout, StructMember, Symbol, SymbolTable,
};
use crate::types::{FunType, Type};
use std::collections::HashMap;
use std::rc::Rc;

struct SwitchFrame {
    /// Promoted controlling type; case values are converted to it.
    ty: Rc<Type>,
    /// Converted case values, as raw 64-bit buckets, for duplicate checks.
    seen: Vec<u64>,
    cases: Vec<(Const, Ident)>,
    has_default: bool,
}

pub struct TypeChecker<'a> {
    interner: &'a mut Interner,
    table: &'a mut SymbolTable,
    current_ret: Option<Rc<Type>>,
    switch_stack: Vec<SwitchFrame>,
}

impl<'a> TypeChecker<'a> {
    pub fn new(interner: &'a mut Interner, table: &'a mut SymbolTable) -> Self {
        TypeChecker {
            interner,
            table,
            current_ret: None,
            switch_stack: Vec::new(),
        }
    }

    pub fn check_program(&mut self, program: &mut Program) -> Result<(), CompileError> {
        for decl in &mut program.decls {
            match decl {
                Declaration::Fun(fun) => self.check_fun_decl(fun, true)?,
                Declaration::Var(var) => self.check_file_var_decl(var)?,
                Declaration::Struct(decl) => self.check_struct_decl(decl)?,
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
    // Struct layout

    fn check_struct_decl(&mut self, decl: &mut StructDecl) -> Result<(), CompileError> {
        if decl.members.is_empty() {
            // Forward declaration.
            return Ok(());
        }
        if self.table.structs.contains_key(&decl.tag) {
            return Err(Self::err(
                SemanticErrorKind::RedeclConflict,
                decl.line,
                format!(
                    "{} '{}' declared twice in the same scope",
                    if decl.is_union { "union" } else { "struct" },
                    self.name(decl.tag)
                ),
            ));
        }
        for (i, member) in decl.members.iter().enumerate() {
            for later in &decl.members[i + 1..] {
                if member.name == later.name {
                    return Err(Self::err(
                        SemanticErrorKind::RedeclConflict,
                        later.line,
                        format!("duplicate member '{}'", self.name(member.name)),
                    ));
                }
            }
            self.require_valid_object_type(&member.member_type, member.line)?;
            if !self.table.is_complete(&member.member_type) {
                return Err(Self::err(
                    SemanticErrorKind::IncompleteType,
                    member.line,
                    format!("member '{}' has incomplete type", self.name(member.name)),
                ));
            }
        }
        let mut alignment = 0i32;
        let mut size = 0i64;
        let mut member_names = Vec::with_capacity(decl.members.len());
        let mut members = HashMap::with_capacity(decl.members.len());
        for member in &decl.members {
            let member_alignment = self.table.type_alignment(&member.member_type);
            let member_size = self.table.type_size(&member.member_type);
            let offset = if decl.is_union {
                size = size.max(member_size);
                0
            } else {
                size = round_up(size, member_alignment as i64);
                let offset = size;
                size += member_size;
                offset
            };
            member_names.push(member.name);
            members.insert(
                member.name,
                StructMember {
                    offset,
                    ty: Rc::clone(&member.member_type),
                },
            );
            alignment = alignment.max(member_alignment);
        }
        size = round_up(size, alignment as i64);
        self.table.structs.insert(
            decl.tag,
            StructLayout {
                alignment,
                size,
                member_names,
                members,
            },
        );
        Ok(())
    }

    /// Reject types no object can have: void anywhere below an object
    /// declarator, arrays of incomplete element type, function types.
    fn require_valid_object_type(&self, ty: &Type, line: usize) -> Result<(), CompileError> {
        match ty {
            Type::Array { elem, .. } => {
                if !self.table.is_complete(elem) {
                    return Err(Self::err(
                        SemanticErrorKind::IncompleteType,
                        line,
                        "array of incomplete element type".to_string(),
                    ));
                }
                self.require_valid_object_type(elem, line)
            }
            Type::Pointer(referent) => self.require_valid_object_type_shallow(referent, line),
            Type::Void => Err(Self::err(
                SemanticErrorKind::InvalidType,
                line,
                "void is not an object type".to_string(),
            )),
            Type::Fun(_) => Err(Self::err(
                SemanticErrorKind::InvalidType,
                line,
                "function type where an object type is required".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Pointer referents may be incomplete, but arrays below them still
    /// need complete elements.
    fn require_valid_object_type_shallow(&self, ty: &Type, line: usize) -> Result<(), CompileError> {
        match ty {
            Type::Array { elem, .. } => {
                if !self.table.is_complete(elem) {
                    return Err(Self::err(
                        SemanticErrorKind::IncompleteType,
                        line,
                        "array of incomplete element type".to_string(),
                    ));
                }
                self.require_valid_object_type_shallow(elem, line)
            }
            Type::Pointer(referent) => self.require_valid_object_type_shallow(referent, line),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Declarations

    fn check_fun_decl(&mut self, decl: &mut FunDecl, file_scope: bool) -> Result<(), CompileError> {
        let Type::Fun(fun_type) = &*decl.fun_type else {
            unreachable!("function declaration without function type");
        };
        if let Type::Array { .. } = &*fun_type.ret {
            return Err(Self::err(
                SemanticErrorKind::InvalidType,
                decl.line,
                format!("function '{}' returns an array", self.name(decl.name)),
            ));
        }
        // Adjust parameters: arrays decay to pointers in prototypes.
        let mut params = Vec::with_capacity(fun_type.params.len());
        for param in &fun_type.params {
            let adjusted = match &**param {
                Type::Array { elem, .. } => Rc::new(Type::Pointer(Rc::clone(elem))),
                _ => Rc::clone(param),
            };
            params.push(adjusted);
        }
        let adjusted = Rc::new(Type::Fun(Rc::new(FunType::new(
            params,
            Rc::clone(&fun_type.ret),
        ))));
        decl.fun_type = adjusted;

        let has_body = decl.body.is_some();
        let mut global = decl.storage != Some(StorageClass::Static);
        let mut defined = has_body;
        if let Some(existing) = self.table.get(decl.name) {
            if *existing.ty != *decl.fun_type {
                return Err(Self::err(
                    SemanticErrorKind::RedeclConflict,
                    decl.line,
                    format!(
                        "incompatible redeclaration of '{}'",
                        self.name(decl.name)
                    ),
                ));
            }
            let IdentAttrs::Fun {
                defined: was_defined,
                global: was_global,
            } = existing.attrs
            else {
                unreachable!("function symbol with non-function attributes");
            };
            if was_defined && has_body {
                return Err(Self::err(
                    SemanticErrorKind::RedeclConflict,
                    decl.line,
                    format!("function '{}' defined twice", self.name(decl.name)),
                ));
            }
            if was_global && decl.storage == Some(StorageClass::Static) {
                return Err(Self::err(
                    SemanticErrorKind::RedeclConflict,
                    decl.line,
                    format!(
                        "static declaration of '{}' follows non-static",
                        self.name(decl.name)
                    ),
                ));
            }
            global = was_global;
            defined = was_defined || has_body;
        }
        self.table.insert(
            decl.name,
            Symbol {
                ty: Rc::clone(&decl.fun_type),
                attrs: IdentAttrs::Fun { defined, global },
            },
        );

        if let Some(body) = decl.body.take() {
            if !file_scope {
                unreachable!("nested function bodies are rejected during resolution");
            }
            let Type::Fun(fun_type) = &*decl.fun_type else {
                unreachable!()
            };
            let fun_type = Rc::clone(fun_type);
            if !matches!(&*fun_type.ret, Type::Void)
                && !self.table.is_complete(&fun_type.ret)
            {
                return Err(Self::err(
                    SemanticErrorKind::IncompleteType,
                    decl.line,
                    format!(
                        "function '{}' returns an incomplete type",
                        self.name(decl.name)
                    ),
                ));
            }
            for (name, ty) in decl.params.iter().zip(&fun_type.params) {
                self.require_valid_object_type(ty, decl.line)?;
                if !self.table.is_complete(ty) {
                    return Err(Self::err(
                        SemanticErrorKind::IncompleteType,
                        decl.line,
                        format!("parameter '{}' has incomplete type", self.name(*name)),
                    ));
                }
                self.table.insert(
                    *name,
                    Symbol {
                        ty: Rc::clone(ty),
                        attrs: IdentAttrs::Local,
                    },
                );
            }
            self.current_ret = Some(Rc::clone(&fun_type.ret));
            let mut body = body;
            self.check_block(&mut body)?;
            self.current_ret = None;
            decl.body = Some(body);
        }
        Ok(())
    }

    fn check_file_var_decl(&mut self, decl: &mut VarDecl) -> Result<(), CompileError> {
        self.require_valid_object_type(&decl.var_type, decl.line)?;
        let is_extern = decl.storage == Some(StorageClass::Extern);
        if !self.table.is_complete(&decl.var_type) && !(is_extern && decl.init.is_none()) {
            return Err(Self::err(
                SemanticErrorKind::IncompleteType,
                decl.line,
                format!("variable '{}' has incomplete type", self.name(decl.name)),
            ));
        }
        let mut init = match &decl.init {
            Some(initializer) => {
                InitialValue::Initial(self.static_initializer(initializer, &decl.var_type)?)
            }
            None if is_extern => InitialValue::NoInitializer,
            None => InitialValue::Tentative,
        };
        let mut global = decl.storage != Some(StorageClass::Static);
        if let Some(existing) = self.table.get(decl.name) {
            if *existing.ty != *decl.var_type {
                return Err(Self::err(
                    SemanticErrorKind::RedeclConflict,
                    decl.line,
                    format!(
                        "incompatible redeclaration of '{}'",
                        self.name(decl.name)
                    ),
                ));
            }
            let IdentAttrs::Static {
                init: old_init,
                global: was_global,
            } = &existing.attrs
            else {
                unreachable!("file-scope variable with non-static attributes");
            };
            if is_extern {
                global = *was_global;
            } else if *was_global != global {
                return Err(Self::err(
                    SemanticErrorKind::RedeclConflict,
                    decl.line,
                    format!("conflicting linkage for '{}'", self.name(decl.name)),
                ));
            }
            if matches!(old_init, InitialValue::Initial(_)) {
                if matches!(init, InitialValue::Initial(_)) {
                    return Err(Self::err(
                        SemanticErrorKind::RedeclConflict,
                        decl.line,
                        format!("'{}' initialized twice", self.name(decl.name)),
                    ));
                }
                init = old_init.clone();
            } else if matches!(old_init, InitialValue::Tentative)
                && matches!(init, InitialValue::NoInitializer)
            {
                init = InitialValue::Tentative;
            }
        }
        self.table.insert(
            decl.name,
            Symbol {
                ty: Rc::clone(&decl.var_type),
                attrs: IdentAttrs::Static { init, global },
            },
        );
        Ok(())
    }

    fn check_block_var_decl(&mut self, decl: &mut VarDecl) -> Result<(), CompileError> {
        self.require_valid_object_type(&decl.var_type, decl.line)?;
        match decl.storage {
            Some(StorageClass::Extern) => {
                if decl.init.is_some() {
                    return Err(Self::err(
                        SemanticErrorKind::IncompatibleInit,
                        decl.line,
                        format!(
                            "initializer on block-scope extern '{}'",
                            self.name(decl.name)
                        ),
                    ));
                }
                if let Some(existing) = self.table.get(decl.name) {
                    if *existing.ty != *decl.var_type {
                        return Err(Self::err(
                            SemanticErrorKind::RedeclConflict,
                            decl.line,
                            format!(
                                "incompatible redeclaration of '{}'",
                                self.name(decl.name)
                            ),
                        ));
                    }
                } else {
                    self.table.insert(
                        decl.name,
                        Symbol {
                            ty: Rc::clone(&decl.var_type),
                            attrs: IdentAttrs::Static {
                                init: InitialValue::NoInitializer,
                                global: true,
                            },
                        },
                    );
                }
                Ok(())
            }
            Some(StorageClass::Static) => {
                self.require_complete_var(decl)?;
                let init = match &decl.init {
                    Some(initializer) => {
                        InitialValue::Initial(self.static_initializer(initializer, &decl.var_type)?)
                    }
                    None => InitialValue::Initial(vec![StaticInit::Zero {
                        bytes: self.table.type_size(&decl.var_type),
                    }]),
                };
                self.table.insert(
                    decl.name,
                    Symbol {
                        ty: Rc::clone(&decl.var_type),
                        attrs: IdentAttrs::Static {
                            init,
                            global: false,
                        },
                    },
                );
                Ok(())
            }
            None => {
                self.require_complete_var(decl)?;
                self.table.insert(
                    decl.name,
                    Symbol {
                        ty: Rc::clone(&decl.var_type),
                        attrs: IdentAttrs::Local,
                    },
                );
                if let Some(init) = &mut decl.init {
                    let target = Rc::clone(&decl.var_type);
                    self.check_initializer(init, &target)?;
                }
                Ok(())
            }
        }
    }

    fn require_complete_var(&self, decl: &VarDecl) -> Result<(), CompileError> {
        if !self.table.is_complete(&decl.var_type) {
            return Err(Self::err(
                SemanticErrorKind::IncompleteType,
                decl.line,
                format!("variable '{}' has incomplete type", self.name(decl.name)),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Static initializers

    fn static_initializer(
        &mut self,
        init: &Initializer,
        ty: &Rc<Type>,
    ) -> Result<Vec<StaticInit>, CompileError> {
        let mut out = Vec::new();
        self.static_init_into(init, ty, &mut out)?;
        Ok(out)
    }

    fn static_init_into(
        &mut self,
        init: &Initializer,
        ty: &Rc<Type>,
        out: &mut Vec<StaticInit>,
    ) -> Result<(), CompileError> {
        match init {
            Initializer::Single { exp, .. } => self.static_single_init(exp, ty, out),
            Initializer::Compound { inits, line, .. } => match &**ty {
                Type::Array { elem, size } => {
                    if inits.len() as i64 > *size {
                        return Err(Self::err(
                            SemanticErrorKind::IncompatibleInit,
                            *line,
                            "too many initializers for array".to_string(),
                        ));
                    }
                    for init in inits {
                        self.static_init_into(init, elem, out)?;
                    }
                    let rest = (*size - inits.len() as i64) * self.table.type_size(elem);
                    push_zero(out, rest);
                    Ok(())
                }
                Type::Structure { tag, is_union } => {
                    let layout = &self.table.structs[tag];
                    if *is_union && inits.len() > 1 {
                        return Err(Self::err(
                            SemanticErrorKind::IncompatibleInit,
                            *line,
                            "too many initializers for union".to_string(),
                        ));
                    }
                    if inits.len() > layout.member_names.len() {
                        return Err(Self::err(
                            SemanticErrorKind::IncompatibleInit,
                            *line,
                            "too many initializers for struct".to_string(),
                        ));
                    }
                    let total = layout.size;
                    let members: Vec<(i64, Rc<Type>)> = layout
                        .ordered_members()
                        .map(|m| (m.offset, Rc::clone(&m.ty)))
                        .collect();
                    let mut current = 0i64;
                    for (init, (offset, member_ty)) in inits.iter().zip(&members) {
                        push_zero(out, offset - current);
                        self.static_init_into(init, member_ty, out)?;
                        current = offset + self.table.type_size(member_ty);
                    }
                    push_zero(out, total - current);
                    Ok(())
                }
                _ => Err(Self::err(
                    SemanticErrorKind::IncompatibleInit,
                    *line,
                    "compound initializer for a scalar".to_string(),
                )),
            },
        }
    }

    fn static_single_init(
        &mut self,
        exp: &Exp,
        ty: &Rc<Type>,
        out: &mut Vec<StaticInit>,
    ) -> Result<(), CompileError> {
        match (&exp.kind, &**ty) {
            (ExpKind::String(bytes), Type::Array { elem, size }) => {
                if !elem.is_character() {
                    return Err(Self::err(
                        SemanticErrorKind::IncompatibleInit,
                        exp.line,
                        "string initializer for a non-character array".to_string(),
                    ));
                }
                let len = bytes.len() as i64;
                if len > *size {
                    return Err(Self::err(
                        SemanticErrorKind::IncompatibleInit,
                        exp.line,
                        "string literal longer than array".to_string(),
                    ));
                }
                let null_terminated = len < *size;
                out.push(StaticInit::String {
                    bytes: bytes.clone(),
                    null_terminated,
                });
                if *size > len + 1 {
                    push_zero(out, *size - len - 1);
                }
                Ok(())
            }
            (ExpKind::String(bytes), Type::Pointer(referent)) => {
                if !matches!(&**referent, Type::Char) {
                    return Err(Self::err(
                        SemanticErrorKind::IncompatibleInit,
                        exp.line,
                        "string initializer for a non-char pointer".to_string(),
                    ));
                }
                let label = self.table.string_constant(self.interner, bytes);
                out.push(StaticInit::Pointer { label });
                Ok(())
            }
            (ExpKind::Constant(c), Type::Pointer(_)) => {
                if !c.is_zero_int() {
                    return Err(Self::err(
                        SemanticErrorKind::IncompatibleInit,
                        exp.line,
                        "static pointer initializer is not a null constant".to_string(),
                    ));
                }
                out.push(StaticInit::ULong(0));
                Ok(())
            }
            (ExpKind::Constant(c), _) if ty.is_arithmetic() => {
                out.push(const_to_static_init(const_convert(*c, ty)));
                Ok(())
            }
            _ => Err(Self::err(
                SemanticErrorKind::IncompatibleInit,
                exp.line,
                "static initializer is not a constant".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Automatic initializers

    fn check_initializer(
        &mut self,
        init: &mut Initializer,
        target: &Rc<Type>,
    ) -> Result<(), CompileError> {
        match init {
            Initializer::Single { exp, init_type } => {
                if let (ExpKind::String(bytes), Type::Array { elem, size }) =
                    (&exp.kind, &**target)
                {
                    if !elem.is_character() {
                        return Err(Self::err(
                            SemanticErrorKind::IncompatibleInit,
                            exp.line,
                            "string initializer for a non-character array".to_string(),
                        ));
                    }
                    if bytes.len() as i64 > *size {
                        return Err(Self::err(
                            SemanticErrorKind::IncompatibleInit,
                            exp.line,
                            "string literal longer than array".to_string(),
                        ));
                    }
                    exp.ty = Some(Rc::clone(target));
                    *init_type = Some(Rc::clone(target));
                    return Ok(());
                }
                self.check_and_convert(exp)?;
                self.cast_by_assignment(exp, target)?;
                *init_type = Some(Rc::clone(target));
                Ok(())
            }
            Initializer::Compound {
                inits,
                init_type,
                line,
            } => {
                match &**target {
                    Type::Array { elem, size } => {
                        if inits.len() as i64 > *size {
                            return Err(Self::err(
                                SemanticErrorKind::IncompatibleInit,
                                *line,
                                "too many initializers for array".to_string(),
                            ));
                        }
                        for init in inits.iter_mut() {
                            self.check_initializer(init, elem)?;
                        }
                        for _ in inits.len() as i64..*size {
                            inits.push(self.zero_initializer(elem));
                        }
                    }
                    Type::Structure { tag, is_union } => {
                        let layout = &self.table.structs[tag];
                        let member_types: Vec<Rc<Type>> =
                            layout.ordered_members().map(|m| Rc::clone(&m.ty)).collect();
                        let bound = if *is_union { 1 } else { member_types.len() };
                        if inits.len() > bound {
                            return Err(Self::err(
                                SemanticErrorKind::IncompatibleInit,
                                *line,
                                format!(
                                    "too many initializers for {}",
                                    if *is_union { "union" } else { "struct" }
                                ),
                            ));
                        }
                        for (init, member_ty) in inits.iter_mut().zip(&member_types) {
                            self.check_initializer(init, member_ty)?;
                        }
                        if !*is_union {
                            for member_ty in member_types.iter().skip(inits.len()) {
                                inits.push(self.zero_initializer(member_ty));
                            }
                        }
                    }
                    _ => {
                        return Err(Self::err(
                            SemanticErrorKind::IncompatibleInit,
                            *line,
                            "compound initializer for a scalar".to_string(),
                        ));
                    }
                }
                *init_type = Some(Rc::clone(target));
                Ok(())
            }
        }
    }

    /// Build an all-zero initializer for a type, used to pad short
    /// compound initializers.
    fn zero_initializer(&self, ty: &Rc<Type>) -> Initializer {
        match &**ty {
            Type::Array { elem, size } => {
                let inits = (0..*size).map(|_| self.zero_initializer(elem)).collect();
                Initializer::Compound {
                    inits,
                    init_type: Some(Rc::clone(ty)),
                    line: 0,
                }
            }
            Type::Structure { tag, is_union } => {
                let layout = &self.table.structs[tag];
                let inits = if *is_union {
                    layout
                        .ordered_members()
                        .take(1)
                        .map(|m| self.zero_initializer(&m.ty))
                        .collect()
                } else {
                    layout
                        .ordered_members()
                        .map(|m| self.zero_initializer(&m.ty))
                        .collect()
                };
                Initializer::Compound {
                    inits,
                    init_type: Some(Rc::clone(ty)),
                    line: 0,
                }
            }
            _ => {
                let constant = match &**ty {
                    Type::Char | Type::SChar => Const::Char(0),
                    Type::UChar => Const::UChar(0),
                    Type::Int => Const::Int(0),
                    Type::UInt => Const::UInt(0),
                    Type::Long => Const::Long(0),
                    Type::ULong | Type::Pointer(_) => Const::ULong(0),
                    Type::Double => Const::Double(0.0),
                    _ => unreachable!("zero initializer for non-object type"),
                };
                let mut exp = Exp::new(ExpKind::Constant(constant), 0);
                exp.ty = Some(Rc::clone(ty));
                Initializer::Single {
                    exp,
                    init_type: Some(Rc::clone(ty)),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements

    fn check_block(&mut self, block: &mut Block) -> Result<(), CompileError> {
        for item in &mut block.items {
            match item {
                BlockItem::Decl(Declaration::Var(decl)) => self.check_block_var_decl(decl)?,
                BlockItem::Decl(Declaration::Fun(decl)) => self.check_fun_decl(decl, false)?,
                BlockItem::Decl(Declaration::Struct(decl)) => self.check_struct_decl(decl)?,
                BlockItem::Stmt(stmt) => self.check_statement(stmt)?,
            }
        }
        Ok(())
    }

    fn check_statement(&mut self, stmt: &mut Statement) -> Result<(), CompileError> {
        match stmt {
            Statement::Return { exp, line } => {
                let ret = Rc::clone(self.current_ret.as_ref().expect("return outside function"));
                match (exp, &*ret) {
                    (None, Type::Void) => Ok(()),
                    (Some(_), Type::Void) => Err(Self::err(
                        SemanticErrorKind::ReturnMismatch,
                        *line,
                        "returning a value from a void function".to_string(),
                    )),
                    (None, _) => Err(Self::err(
                        SemanticErrorKind::ReturnMismatch,
                        *line,
                        "return without a value in a non-void function".to_string(),
                    )),
                    (Some(exp), _) => {
                        self.check_and_convert(exp)?;
                        self.cast_by_assignment(exp, &ret)
                    }
                }
            }
            Statement::Expression(exp) => self.check_and_convert(exp),
            Statement::If {
                cond,
                then_stmt,
                else_stmt,
            } => {
                self.check_scalar_cond(cond)?;
                self.check_statement(then_stmt)?;
                if let Some(else_stmt) = else_stmt {
                    self.check_statement(else_stmt)?;
                }
                Ok(())
            }
            Statement::Compound(block) => self.check_block(block),
            Statement::While { cond, body, .. } => {
                self.check_scalar_cond(cond)?;
                self.check_statement(body)
            }
            Statement::DoWhile { body, cond, .. } => {
                self.check_statement(body)?;
                self.check_scalar_cond(cond)
            }
            Statement::For {
                init,
                cond,
                post,
                body,
                ..
            } => {
                match init {
                    ForInit::Decl(decl) => self.check_block_var_decl(decl)?,
                    ForInit::Exp(Some(exp)) => self.check_and_convert(exp)?,
                    ForInit::Exp(None) => {}
                }
                if let Some(cond) = cond {
                    self.check_scalar_cond(cond)?;
                }
                if let Some(post) = post {
                    self.check_and_convert(post)?;
                }
                self.check_statement(body)
            }
            Statement::Switch {
                cond,
                body,
                cases,
                has_default,
                line,
                ..
            } => {
                self.check_and_convert(cond)?;
                if !cond.ty().is_integer() {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        *line,
                        "switch controlling expression is not an integer".to_string(),
                    ));
                }
                if cond.ty().is_character() {
                    self.cast_to(cond, &Rc::new(Type::Int));
                }
                self.switch_stack.push(SwitchFrame {
                    ty: Rc::clone(cond.ty()),
                    seen: Vec::new(),
                    cases: Vec::new(),
                    has_default: false,
                });
                self.check_statement(body)?;
                let frame = self.switch_stack.pop().unwrap();
                *cases = frame.cases;
                *has_default = frame.has_default;
                Ok(())
            }
            Statement::Case {
                value,
                stmt,
                label,
                line,
            } => {
                self.check_and_convert(value)?;
                let ExpKind::Constant(c) = &value.kind else {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        *line,
                        "case value is not an integer constant".to_string(),
                    ));
                };
                let c = *c;
                if matches!(c, Const::Double(_)) {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        *line,
                        "case value is not an integer constant".to_string(),
                    ));
                }
                let frame = self.switch_stack.last_mut().expect("case outside switch");
                let converted = const_convert(c, &frame.ty);
                let bucket = const_bucket(converted);
                if frame.seen.contains(&bucket) {
                    return Err(Self::err(
                        SemanticErrorKind::DuplicateCase,
                        *line,
                        "duplicate case value".to_string(),
                    ));
                }
                frame.seen.push(bucket);
                let case_label = (*label).expect("case label assigned during resolution");
                frame.cases.push((converted, case_label));
                self.check_statement(stmt)
            }
            Statement::Default { stmt, line, .. } => {
                let frame = self.switch_stack.last_mut().expect("default outside switch");
                if frame.has_default {
                    return Err(Self::err(
                        SemanticErrorKind::DuplicateDefault,
                        *line,
                        "multiple default labels in one switch".to_string(),
                    ));
                }
                frame.has_default = true;
                self.check_statement(stmt)
            }
            Statement::Break { .. } | Statement::Continue { .. } | Statement::Goto { .. } => Ok(()),
            Statement::Label { stmt, .. } => self.check_statement(stmt),
            Statement::Null => Ok(()),
        }
    }

    fn check_scalar_cond(&mut self, cond: &mut Exp) -> Result<(), CompileError> {
        self.check_and_convert(cond)?;
        if !cond.ty().is_scalar() {
            return Err(Self::err(
                SemanticErrorKind::InvalidOperand,
                cond.line,
                "controlling expression is not scalar".to_string(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions

    /// Type check an expression and apply the value conversions: arrays
    /// decay to pointers, and structure-typed values must be complete.
    fn check_and_convert(&mut self, exp: &mut Exp) -> Result<(), CompileError> {
        self.check_exp(exp)?;
        let ty = Rc::clone(exp.ty());
        match &*ty {
            Type::Array { elem, .. } => {
                let ptr = Rc::new(Type::Pointer(Rc::clone(elem)));
                let line = exp.line;
                let inner = std::mem::replace(exp, Exp::new(ExpKind::Constant(Const::Int(0)), line));
                *exp = Exp {
                    kind: ExpKind::AddrOf(Box::new(inner)),
                    line,
                    ty: Some(ptr),
                };
                Ok(())
            }
            Type::Structure { tag, .. } => {
                if !self.table.structs.contains_key(tag) {
                    return Err(Self::err(
                        SemanticErrorKind::IncompleteType,
                        exp.line,
                        "expression has incomplete structure type".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Wrap `exp` in an implicit cast to `target` unless it already has
    /// that type.
    fn cast_to(&mut self, exp: &mut Exp, target: &Rc<Type>) {
        if **exp.ty() == **target {
            return;
        }
        let line = exp.line;
        let inner = std::mem::replace(exp, Exp::new(ExpKind::Constant(Const::Int(0)), line));
        *exp = Exp {
            kind: ExpKind::Cast {
                target: Rc::clone(target),
                exp: Box::new(inner),
            },
            line,
            ty: Some(Rc::clone(target)),
        };
    }

    /// Implicit conversion in assignment-like contexts: plain assignment,
    /// arguments, returns, initializers, ternary branches.
    fn cast_by_assignment(&mut self, exp: &mut Exp, target: &Rc<Type>) -> Result<(), CompileError> {
        let ty = Rc::clone(exp.ty());
        if *ty == **target {
            return Ok(());
        }
        let ok = (ty.is_arithmetic() && target.is_arithmetic())
            || (is_null_pointer_constant(exp) && target.is_pointer())
            || pointer_converts(&ty, target);
        if !ok {
            return Err(Self::err(
                SemanticErrorKind::InvalidCast,
                exp.line,
                "cannot convert operand to the expected type".to_string(),
            ));
        }
        self.cast_to(exp, target);
        Ok(())
    }

    /// Common type of two arithmetic operands; character types promote to
    /// int first, double absorbs everything, ties break unsigned.
    fn common_type(a: &Rc<Type>, b: &Rc<Type>) -> Rc<Type> {
        let promote = |t: &Rc<Type>| -> Rc<Type> {
            if t.is_character() {
                Rc::new(Type::Int)
            } else {
                Rc::clone(t)
            }
        };
        let a = promote(a);
        let b = promote(b);
        if *a == *b {
            return a;
        }
        if matches!(*a, Type::Double) || matches!(*b, Type::Double) {
            return Rc::new(Type::Double);
        }
        let (sa, sb) = (a.scalar_size(), b.scalar_size());
        if sa == sb {
            if a.is_signed() { b } else { a }
        } else if sa > sb {
            a
        } else {
            b
        }
    }

    /// Common pointer type for equality and conditional operands.
    fn common_pointer_type(
        &self,
        lhs: &Exp,
        rhs: &Exp,
        line: usize,
    ) -> Result<Rc<Type>, CompileError> {
        let lt = lhs.ty();
        let rt = rhs.ty();
        if **lt == **rt {
            return Ok(Rc::clone(lt));
        }
        if is_null_pointer_constant(lhs) {
            return Ok(Rc::clone(rt));
        }
        if is_null_pointer_constant(rhs) || (is_void_pointer(lt) && rt.is_pointer()) {
            return Ok(Rc::clone(lt));
        }
        if is_void_pointer(rt) && lt.is_pointer() {
            return Ok(Rc::clone(rt));
        }
        Err(Self::err(
            SemanticErrorKind::InvalidOperand,
            line,
            "incompatible pointer operands".to_string(),
        ))
    }

    fn check_exp(&mut self, exp: &mut Exp) -> Result<(), CompileError> {
        let line = exp.line;
        match &mut exp.kind {
            ExpKind::Constant(c) => {
                let ty = match c {
                    Const::Char(_) => Type::Char,
                    Const::Int(_) => Type::Int,
                    Const::Long(_) => Type::Long,
                    Const::UChar(_) => Type::UChar,
                    Const::UInt(_) => Type::UInt,
                    Const::ULong(_) => Type::ULong,
                    Const::Double(_) => Type::Double,
                };
                exp.ty = Some(Rc::new(ty));
                Ok(())
            }
            ExpKind::String(bytes) => {
                exp.ty = Some(Rc::new(Type::Array {
                    elem: Rc::new(Type::Char),
                    size: bytes.len() as i64 + 1,
                }));
                Ok(())
            }
            ExpKind::Var(name) => {
                let symbol = self.table.expect(*name);
                if matches!(&*symbol.ty, Type::Fun(_)) {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        format!("function '{}' used as a variable", self.name(*name)),
                    ));
                }
                exp.ty = Some(Rc::clone(&symbol.ty));
                Ok(())
            }
            ExpKind::Cast { target, exp: inner } => {
                let target = Rc::clone(target);
                self.check_and_convert(inner)?;
                let from = Rc::clone(inner.ty());
                if matches!(&*target, Type::Void) {
                    exp.ty = Some(target);
                    return Ok(());
                }
                if !target.is_scalar() {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidCast,
                        line,
                        "cast target is not a scalar type".to_string(),
                    ));
                }
                if !from.is_scalar() {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidCast,
                        line,
                        "cast operand is not a scalar value".to_string(),
                    ));
                }
                if (matches!(&*target, Type::Double) && from.is_pointer())
                    || (target.is_pointer() && matches!(&*from, Type::Double))
                {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidCast,
                        line,
                        "cast between pointer and double".to_string(),
                    ));
                }
                exp.ty = Some(target);
                Ok(())
            }
            ExpKind::Unary { op, exp: inner } => {
                let op = *op;
                self.check_and_convert(inner)?;
                match op {
                    UnaryOp::Not => {
                        if !inner.ty().is_scalar() {
                            return Err(Self::err(
                                SemanticErrorKind::InvalidOperand,
                                line,
                                "operand of '!' is not scalar".to_string(),
                            ));
                        }
                        exp.ty = Some(Rc::new(Type::Int));
                    }
                    UnaryOp::Complement => {
                        if !inner.ty().is_integer() {
                            return Err(Self::err(
                                SemanticErrorKind::InvalidOperand,
                                line,
                                "operand of '~' is not an integer".to_string(),
                            ));
                        }
                        if inner.ty().is_character() {
                            self.cast_to(inner, &Rc::new(Type::Int));
                        }
                        exp.ty = Some(Rc::clone(inner.ty()));
                    }
                    UnaryOp::Negate => {
                        if !inner.ty().is_arithmetic() {
                            return Err(Self::err(
                                SemanticErrorKind::InvalidOperand,
                                line,
                                "operand of unary '-' is not arithmetic".to_string(),
                            ));
                        }
                        if inner.ty().is_character() {
                            self.cast_to(inner, &Rc::new(Type::Int));
                        }
                        exp.ty = Some(Rc::clone(inner.ty()));
                    }
                }
                Ok(())
            }
            ExpKind::Binary { op, lhs, rhs } => {
                let op = *op;
                self.check_and_convert(lhs)?;
                self.check_and_convert(rhs)?;
                let ty = self.check_binary(op, lhs, rhs, line)?;
                exp.ty = Some(ty);
                Ok(())
            }
            ExpKind::Assignment { lhs, rhs } => {
                self.check_and_convert(lhs)?;
                if !is_lvalue(lhs) {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidLvalue,
                        line,
                        "assignment target is not an lvalue".to_string(),
                    ));
                }
                self.check_and_convert(rhs)?;
                let target = Rc::clone(lhs.ty());
                self.cast_by_assignment(rhs, &target)?;
                exp.ty = Some(target);
                Ok(())
            }
            ExpKind::CompoundAssignment {
                op,
                lhs,
                rhs,
                common,
            } => {
                let op = *op;
                self.check_and_convert(lhs)?;
                if !is_lvalue(lhs) {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidLvalue,
                        line,
                        "assignment target is not an lvalue".to_string(),
                    ));
                }
                self.check_and_convert(rhs)?;
                let lhs_ty = Rc::clone(lhs.ty());
                let op_ty = if matches!(op, BinaryOp::ShiftLeft | BinaryOp::ShiftRight) {
                    if !lhs_ty.is_integer() || !rhs.ty().is_integer() {
                        return Err(Self::err(
                            SemanticErrorKind::InvalidOperand,
                            line,
                            "shift operands must be integers".to_string(),
                        ));
                    }
                    if rhs.ty().is_character() {
                        self.cast_to(rhs, &Rc::new(Type::Int));
                    }
                    if lhs_ty.is_character() {
                        Rc::new(Type::Int)
                    } else {
                        Rc::clone(&lhs_ty)
                    }
                } else if lhs_ty.is_pointer() {
                    if !matches!(op, BinaryOp::Add | BinaryOp::Subtract)
                        || !rhs.ty().is_integer()
                    {
                        return Err(Self::err(
                            SemanticErrorKind::InvalidOperand,
                            line,
                            "invalid pointer arithmetic".to_string(),
                        ));
                    }
                    self.require_complete_pointee(&lhs_ty, line)?;
                    self.cast_to(rhs, &Rc::new(Type::Long));
                    Rc::clone(&lhs_ty)
                } else {
                    let ty = self.check_arithmetic_pair(op, lhs, rhs, line)?;
                    self.cast_to(rhs, &ty);
                    ty
                };
                *common = Some(op_ty);
                exp.ty = Some(lhs_ty);
                Ok(())
            }
            ExpKind::Postfix {
                op,
                exp: inner,
                common,
            } => {
                let op = *op;
                self.check_and_convert(inner)?;
                if !is_lvalue(inner) {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidLvalue,
                        line,
                        format!(
                            "operand of postfix '{}' is not an lvalue",
                            if op == BinaryOp::Add { "++" } else { "--" }
                        ),
                    ));
                }
                let ty = Rc::clone(inner.ty());
                let op_ty = if ty.is_pointer() {
                    self.require_complete_pointee(&ty, line)?;
                    Rc::clone(&ty)
                } else if ty.is_arithmetic() {
                    Self::common_type(&ty, &Rc::new(Type::Int))
                } else {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "operand cannot be incremented".to_string(),
                    ));
                };
                *common = Some(op_ty);
                exp.ty = Some(ty);
                Ok(())
            }
            ExpKind::Conditional {
                cond,
                then_exp,
                else_exp,
            } => {
                self.check_and_convert(cond)?;
                if !cond.ty().is_scalar() {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "controlling expression is not scalar".to_string(),
                    ));
                }
                self.check_and_convert(then_exp)?;
                self.check_and_convert(else_exp)?;
                let tt = Rc::clone(then_exp.ty());
                let et = Rc::clone(else_exp.ty());
                let result = if matches!(&*tt, Type::Void) && matches!(&*et, Type::Void) {
                    Rc::new(Type::Void)
                } else if tt.is_arithmetic() && et.is_arithmetic() {
                    let common = Self::common_type(&tt, &et);
                    self.cast_to(then_exp, &common);
                    self.cast_to(else_exp, &common);
                    common
                } else if matches!(&*tt, Type::Structure { .. }) && *tt == *et {
                    tt
                } else if tt.is_pointer() || et.is_pointer() {
                    let common = self.common_pointer_type(then_exp, else_exp, line)?;
                    self.cast_to(then_exp, &common);
                    self.cast_to(else_exp, &common);
                    common
                } else {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "incompatible branch types in conditional".to_string(),
                    ));
                };
                exp.ty = Some(result);
                Ok(())
            }
            ExpKind::Call { name, args } => {
                let symbol = self.table.expect(*name);
                let Type::Fun(fun_type) = &*symbol.ty else {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        format!("'{}' is not a function", self.name(*name)),
                    ));
                };
                let fun_type = Rc::clone(fun_type);
                if args.len() != fun_type.params.len() {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        format!(
                            "'{}' called with {} arguments, expected {}",
                            self.name(*name),
                            args.len(),
                            fun_type.params.len()
                        ),
                    ));
                }
                for (arg, param_ty) in args.iter_mut().zip(&fun_type.params) {
                    self.check_and_convert(arg)?;
                    self.cast_by_assignment(arg, param_ty)?;
                }
                exp.ty = Some(Rc::clone(&fun_type.ret));
                Ok(())
            }
            ExpKind::Dereference(inner) => {
                self.check_and_convert(inner)?;
                let Type::Pointer(referent) = &**inner.ty() else {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "dereference of a non-pointer".to_string(),
                    ));
                };
                if matches!(&**referent, Type::Void) {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "dereference of a void pointer".to_string(),
                    ));
                }
                exp.ty = Some(Rc::clone(referent));
                Ok(())
            }
            ExpKind::AddrOf(inner) => {
                self.check_exp(inner)?;
                if !is_lvalue(inner) {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidLvalue,
                        line,
                        "cannot take the address of a non-lvalue".to_string(),
                    ));
                }
                exp.ty = Some(Rc::new(Type::Pointer(Rc::clone(inner.ty()))));
                Ok(())
            }
            ExpKind::Subscript { base, index } => {
                self.check_and_convert(base)?;
                self.check_and_convert(index)?;
                let (ptr_exp, idx_exp) = if base.ty().is_pointer() {
                    (&mut **base, &mut **index)
                } else if index.ty().is_pointer() {
                    (&mut **index, &mut **base)
                } else {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "subscripted value is not a pointer".to_string(),
                    ));
                };
                if !idx_exp.ty().is_integer() {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "array subscript is not an integer".to_string(),
                    ));
                }
                let ptr_ty = Rc::clone(ptr_exp.ty());
                self.require_complete_pointee(&ptr_ty, line)?;
                self.cast_to(idx_exp, &Rc::new(Type::Long));
                let Type::Pointer(referent) = &*ptr_ty else {
                    unreachable!()
                };
                exp.ty = Some(Rc::clone(referent));
                Ok(())
            }
            ExpKind::SizeOf(inner) => {
                self.check_exp(inner)?;
                if !self.table.is_complete(inner.ty()) {
                    return Err(Self::err(
                        SemanticErrorKind::IncompleteType,
                        line,
                        "sizeof applied to an incomplete type".to_string(),
                    ));
                }
                exp.ty = Some(Rc::new(Type::ULong));
                Ok(())
            }
            ExpKind::SizeOfT(target) => {
                let target = Rc::clone(target);
                self.require_valid_object_type(&target, line)?;
                if !self.table.is_complete(&target) {
                    return Err(Self::err(
                        SemanticErrorKind::IncompleteType,
                        line,
                        "sizeof applied to an incomplete type".to_string(),
                    ));
                }
                exp.ty = Some(Rc::new(Type::ULong));
                Ok(())
            }
            ExpKind::Dot { structure, member } => {
                let member = *member;
                self.check_and_convert(structure)?;
                let Type::Structure { tag, is_union } = &**structure.ty() else {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "member access on a non-structure".to_string(),
                    ));
                };
                let ty = self.member_type(*tag, *is_union, member, line)?;
                exp.ty = Some(ty);
                Ok(())
            }
            ExpKind::Arrow { pointer, member } => {
                let member = *member;
                self.check_and_convert(pointer)?;
                let Type::Pointer(referent) = &**pointer.ty() else {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "'->' applied to a non-pointer".to_string(),
                    ));
                };
                let Type::Structure { tag, is_union } = &**referent else {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "'->' applied to a pointer to a non-structure".to_string(),
                    ));
                };
                let ty = self.member_type(*tag, *is_union, member, line)?;
                exp.ty = Some(ty);
                Ok(())
            }
        }
    }

    fn member_type(
        &self,
        tag: Ident,
        is_union: bool,
        member: Ident,
        line: usize,
    ) -> Result<Rc<Type>, CompileError> {
        let Some(layout) = self.table.structs.get(&tag) else {
            return Err(Self::err(
                SemanticErrorKind::IncompleteType,
                line,
                format!(
                    "member access on incomplete {}",
                    if is_union { "union" } else { "struct" }
                ),
            ));
        };
        let Some(entry) = layout.member(member) else {
            return Err(Self::err(
                SemanticErrorKind::InvalidOperand,
                line,
                format!("no member named '{}'", self.name(member)),
            ));
        };
        Ok(Rc::clone(&entry.ty))
    }

    fn require_complete_pointee(&self, ptr: &Type, line: usize) -> Result<(), CompileError> {
        let Type::Pointer(referent) = ptr else {
            unreachable!("pointer arithmetic on non-pointer");
        };
        if !self.table.is_complete(referent) {
            return Err(Self::err(
                SemanticErrorKind::IncompleteType,
                line,
                "pointer arithmetic on an incomplete type".to_string(),
            ));
        }
        Ok(())
    }

    /// Arithmetic-only binary operands: find the common type and cast both
    /// sides; enforce per-operator domain rules.
    fn check_arithmetic_pair(
        &mut self,
        op: BinaryOp,
        lhs: &mut Exp,
        rhs: &mut Exp,
        line: usize,
    ) -> Result<Rc<Type>, CompileError> {
        let integer_only = matches!(
            op,
            BinaryOp::Remainder | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor
        );
        let lt = Rc::clone(lhs.ty());
        let rt = Rc::clone(rhs.ty());
        let ok = if integer_only {
            lt.is_integer() && rt.is_integer()
        } else {
            lt.is_arithmetic() && rt.is_arithmetic()
        };
        if !ok {
            return Err(Self::err(
                SemanticErrorKind::InvalidOperand,
                line,
                "invalid operand types".to_string(),
            ));
        }
        let common = Self::common_type(&lt, &rt);
        self.cast_to(lhs, &common);
        self.cast_to(rhs, &common);
        Ok(common)
    }

    fn check_binary(
        &mut self,
        op: BinaryOp,
        lhs: &mut Exp,
        rhs: &mut Exp,
        line: usize,
    ) -> Result<Rc<Type>, CompileError> {
        use BinaryOp::*;
        match op {
            And | Or => {
                if !lhs.ty().is_scalar() || !rhs.ty().is_scalar() {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "logical operands must be scalar".to_string(),
                    ));
                }
                Ok(Rc::new(Type::Int))
            }
            Add => {
                let lt = Rc::clone(lhs.ty());
                let rt = Rc::clone(rhs.ty());
                if lt.is_arithmetic() && rt.is_arithmetic() {
                    return self.check_arithmetic_pair(op, lhs, rhs, line);
                }
                if lt.is_pointer() && rt.is_integer() {
                    self.require_complete_pointee(&lt, line)?;
                    self.cast_to(rhs, &Rc::new(Type::Long));
                    return Ok(lt);
                }
                if lt.is_integer() && rt.is_pointer() {
                    self.require_complete_pointee(&rt, line)?;
                    self.cast_to(lhs, &Rc::new(Type::Long));
                    return Ok(rt);
                }
                Err(Self::err(
                    SemanticErrorKind::InvalidOperand,
                    line,
                    "invalid operands to '+'".to_string(),
                ))
            }
            Subtract => {
                let lt = Rc::clone(lhs.ty());
                let rt = Rc::clone(rhs.ty());
                if lt.is_arithmetic() && rt.is_arithmetic() {
                    return self.check_arithmetic_pair(op, lhs, rhs, line);
                }
                if lt.is_pointer() && rt.is_integer() {
                    self.require_complete_pointee(&lt, line)?;
                    self.cast_to(rhs, &Rc::new(Type::Long));
                    return Ok(lt);
                }
                if lt.is_pointer() && *lt == *rt {
                    self.require_complete_pointee(&lt, line)?;
                    return Ok(Rc::new(Type::Long));
                }
                Err(Self::err(
                    SemanticErrorKind::InvalidOperand,
                    line,
                    "invalid operands to '-'".to_string(),
                ))
            }
            Multiply | Divide | Remainder | BitAnd | BitOr | BitXor => {
                self.check_arithmetic_pair(op, lhs, rhs, line)
            }
            ShiftLeft | ShiftRight => {
                if !lhs.ty().is_integer() || !rhs.ty().is_integer() {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "shift operands must be integers".to_string(),
                    ));
                }
                if lhs.ty().is_character() {
                    self.cast_to(lhs, &Rc::new(Type::Int));
                }
                if rhs.ty().is_character() {
                    self.cast_to(rhs, &Rc::new(Type::Int));
                }
                Ok(Rc::clone(lhs.ty()))
            }
            Equal | NotEqual => {
                let lt = Rc::clone(lhs.ty());
                let rt = Rc::clone(rhs.ty());
                if lt.is_pointer() || rt.is_pointer() {
                    let common = self.common_pointer_type(lhs, rhs, line)?;
                    self.cast_to(lhs, &common);
                    self.cast_to(rhs, &common);
                } else if lt.is_arithmetic() && rt.is_arithmetic() {
                    let common = Self::common_type(&lt, &rt);
                    self.cast_to(lhs, &common);
                    self.cast_to(rhs, &common);
                } else {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "invalid equality operands".to_string(),
                    ));
                }
                Ok(Rc::new(Type::Int))
            }
            LessThan | LessOrEqual | GreaterThan | GreaterOrEqual => {
                let lt = Rc::clone(lhs.ty());
                let rt = Rc::clone(rhs.ty());
                if lt.is_arithmetic() && rt.is_arithmetic() {
                    let common = Self::common_type(&lt, &rt);
                    self.cast_to(lhs, &common);
                    self.cast_to(rhs, &common);
                } else if !(lt.is_pointer() && *lt == *rt) {
                    return Err(Self::err(
                        SemanticErrorKind::InvalidOperand,
                        line,
                        "invalid relational operands".to_string(),
                    ));
                }
                Ok(Rc::new(Type::Int))
            }
        }
    }
}

// ----------------------------------------------------------------------
// Free helpers

fn round_up(value: i64, alignment: i64) -> i64 {
    let rem = value % alignment;
    if rem == 0 { value } else { value + alignment - rem }
}

fn push_zero(out: &mut Vec<StaticInit>, bytes: i64) {
    if bytes <= 0 {
        return;
    }
    if let Some(StaticInit::Zero { bytes: last }) = out.last_mut() {
        *last += bytes;
    } else {
        out.push(StaticInit::Zero { bytes });
    }
}

fn is_lvalue(exp: &Exp) -> bool {
    match &exp.kind {
        ExpKind::String(_)
        | ExpKind::Var(_)
        | ExpKind::Dereference(_)
        | ExpKind::Subscript { .. }
        | ExpKind::Arrow { .. } => true,
        ExpKind::Dot { structure, .. } => is_lvalue(structure),
        _ => false,
    }
}

fn is_null_pointer_constant(exp: &Exp) -> bool {
    matches!(&exp.kind, ExpKind::Constant(c) if c.is_zero_int())
}

fn is_void_pointer(ty: &Type) -> bool {
    matches!(ty, Type::Pointer(referent) if matches!(&**referent, Type::Void))
}

fn pointer_converts(from: &Type, to: &Type) -> bool {
    (is_void_pointer(from) && to.is_pointer()) || (from.is_pointer() && is_void_pointer(to))
}

/// Compile-time numeric conversion of a constant to a target type.
pub fn const_convert(c: Const, ty: &Type) -> Const {
    if let Const::Double(d) = c {
        return match ty {
            Type::Char | Type::SChar => Const::Char(d as i8),
            Type::UChar => Const::UChar(d as u8),
            Type::Int => Const::Int(d as i32),
            Type::UInt => Const::UInt(d as u32),
            Type::Long => Const::Long(d as i64),
            Type::ULong | Type::Pointer(_) => Const::ULong(d as u64),
            Type::Double => c,
            _ => unreachable!("constant conversion to non-scalar"),
        };
    }
    let wide: i64 = match c {
        Const::Char(v) => v as i64,
        Const::Int(v) => v as i64,
        Const::Long(v) => v,
        Const::UChar(v) => v as i64,
        Const::UInt(v) => v as i64,
        Const::ULong(v) => v as i64,
        Const::Double(_) => unreachable!(),
    };
    match ty {
        Type::Char | Type::SChar => Const::Char(wide as i8),
        Type::UChar => Const::UChar(wide as u8),
        Type::Int => Const::Int(wide as i32),
        Type::UInt => Const::UInt(wide as u32),
        Type::Long => Const::Long(wide),
        Type::ULong | Type::Pointer(_) => Const::ULong(wide as u64),
        Type::Double => {
            // Unsigned sources must not pick up a sign through i64.
            match c {
                Const::ULong(v) => Const::Double(v as f64),
                _ => Const::Double(wide as f64),
            }
        }
        _ => unreachable!("constant conversion to non-scalar"),
    }
}

/// Raw 64-bit bucket of a converted case value, for duplicate detection.
fn const_bucket(c: Const) -> u64 {
    match c {
        Const::Char(v) => v as i64 as u64,
        Const::Int(v) => v as i64 as u64,
        Const::Long(v) => v as u64,
        Const::UChar(v) => v as u64,
        Const::UInt(v) => v as u64,
        Const::ULong(v) => v,
        Const::Double(_) => unreachable!("double case value"),
    }
}

fn const_to_static_init(c: Const) -> StaticInit {
    match c {
        Const::Char(v) => StaticInit::Char(v),
        Const::UChar(v) => StaticInit::UChar(v),
        Const::Int(v) => StaticInit::Int(v),
        Const::UInt(v) => StaticInit::UInt(v),
        Const::Long(v) => StaticInit::Long(v),
        Const::ULong(v) => StaticInit::ULong(v),
        Const::Double(d) => StaticInit::Double { bits: d.to_bits() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::resolver::Resolver;

    fn check(source: &str) -> Result<(Program, SymbolTable, Interner), CompileError> {
        let mut interner = Interner::new();
        let tokens = Lexer::new(&mut interner, &[]).tokenize(source, None).unwrap();
        let mut program = Parser::new(tokens, &mut interner).parse().unwrap();
        Resolver::new(&mut interner).resolve(&mut program)?;
        let mut table = SymbolTable::new();
        TypeChecker::new(&mut interner, &mut table).check_program(&mut program)?;
        Ok((program, table, interner))
    }

    fn check_err(source: &str) -> SemanticErrorKind {
        match check(source).unwrap_err() {
            CompileError::Semantic { kind, .. } => kind,
            other => panic!("expected a semantic error, got {:?}", other),
        }
    }

    #[test]
    fn arithmetic_promotes_to_common_type() {
        let (program, ..) = check("long f(int a, long b) { return a + b; }").unwrap();
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Stmt(Statement::Return { exp: Some(exp), .. }) =
            &fun.body.as_ref().unwrap().items[0]
        else {
            panic!()
        };
        assert_eq!(**exp.ty(), Type::Long);
        let ExpKind::Binary { lhs, .. } = &exp.kind else {
            panic!()
        };
        // The int operand was wrapped in a cast to long.
        assert!(matches!(lhs.kind, ExpKind::Cast { .. }));
    }

    #[test]
    fn ties_break_toward_unsigned() {
        let (program, ..) = check("unsigned int f(unsigned int a, int b) { return a + b; }").unwrap();
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Stmt(Statement::Return { exp: Some(exp), .. }) =
            &fun.body.as_ref().unwrap().items[0]
        else {
            panic!()
        };
        assert_eq!(**exp.ty(), Type::UInt);
    }

    #[test]
    fn double_absorbs_integers() {
        let (program, ..) = check("double f(double d, long l) { return d * l; }").unwrap();
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Stmt(Statement::Return { exp: Some(exp), .. }) =
            &fun.body.as_ref().unwrap().items[0]
        else {
            panic!()
        };
        assert_eq!(**exp.ty(), Type::Double);
    }

    #[test]
    fn arrays_decay_in_rvalue_position() {
        let (program, ..) = check("int f(void) { int a[3]; return *(a + 1); }").unwrap();
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Stmt(Statement::Return { exp: Some(exp), .. }) =
            &fun.body.as_ref().unwrap().items[1]
        else {
            panic!()
        };
        let ExpKind::Dereference(inner) = &exp.kind else {
            panic!()
        };
        let ExpKind::Binary { lhs, .. } = &inner.kind else {
            panic!()
        };
        assert!(matches!(lhs.kind, ExpKind::AddrOf(_)));
        assert!(lhs.ty().is_pointer());
    }

    #[test]
    fn struct_layout_and_padding() {
        let (_, table, interner) = check(
            "struct s { char c; int i; char d; }; struct s g; \
             int main(void) { return 0; }",
        )
        .unwrap();
        let layout = table
            .structs
            .values()
            .next()
            .expect("struct layout computed");
        assert_eq!(layout.alignment, 4);
        assert_eq!(layout.size, 12);
        let offsets: Vec<i64> = layout.ordered_members().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        let _ = interner;
    }

    #[test]
    fn union_members_share_offset_zero() {
        let (_, table, _) = check(
            "union u { char c; long l; int i; }; union u g; \
             int main(void) { return 0; }",
        )
        .unwrap();
        let layout = table.structs.values().next().unwrap();
        assert_eq!(layout.size, 8);
        assert_eq!(layout.alignment, 8);
        assert!(layout.ordered_members().all(|m| m.offset == 0));
    }

    #[test]
    fn incomplete_member_is_rejected() {
        assert_eq!(
            check_err("struct s; struct t { struct s inner; }; int main(void) { return 0; }"),
            SemanticErrorKind::IncompleteType
        );
    }

    #[test]
    fn self_reference_through_pointer_is_fine() {
        check("struct node { int value; struct node *next; }; int main(void) { return 0; }")
            .unwrap();
    }

    #[test]
    fn static_initializer_elaboration_merges_zeros() {
        let (_, table, interner) = check("int a[100] = {1};").unwrap();
        let name = {
            let mut interner = interner;
            interner.intern("a")
        };
        let Symbol { attrs, .. } = table.expect(name);
        let IdentAttrs::Static {
            init: InitialValue::Initial(inits),
            ..
        } = attrs
        else {
            panic!("expected a static initializer");
        };
        assert_eq!(
            inits,
            &vec![StaticInit::Int(1), StaticInit::Zero { bytes: 396 }]
        );
    }

    #[test]
    fn static_struct_initializer_pads_holes() {
        let (_, table, interner) = check("struct s { char c; int i; }; struct s g = {1, 2};").unwrap();
        let name = {
            let mut interner = interner;
            interner.intern("g")
        };
        let IdentAttrs::Static {
            init: InitialValue::Initial(inits),
            ..
        } = &table.expect(name).attrs
        else {
            panic!();
        };
        assert_eq!(
            inits,
            &vec![
                StaticInit::Char(1),
                StaticInit::Zero { bytes: 3 },
                StaticInit::Int(2)
            ]
        );
    }

    #[test]
    fn static_pointer_requires_null_constant() {
        assert_eq!(
            check_err("int *p = 1;"),
            SemanticErrorKind::IncompatibleInit
        );
        check("int *p = 0;").unwrap();
    }

    #[test]
    fn string_in_char_array_fits_or_fails() {
        check("char s[5] = \"hello\";").unwrap();
        assert_eq!(
            check_err("char s[4] = \"hello\";"),
            SemanticErrorKind::IncompatibleInit
        );
    }

    #[test]
    fn duplicate_case_is_rejected_after_conversion() {
        // 1 and 1L convert to the same bucket under an int switch.
        assert_eq!(
            check_err(
                "int main(void) { switch (1) { case 1: return 1; case 1l: return 2; } return 0; }"
            ),
            SemanticErrorKind::DuplicateCase
        );
    }

    #[test]
    fn case_values_convert_to_switch_type() {
        let (program, ..) = check(
            "int main(void) { unsigned int u = 4294967295u; \
             switch (u) { case -1: return 1; } return 0; }",
        )
        .unwrap();
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Stmt(Statement::Switch { cases, .. }) = &fun.body.as_ref().unwrap().items[1]
        else {
            panic!()
        };
        // -1 converted to the switch's unsigned int type.
        assert_eq!(cases[0].0, Const::UInt(4294967295));
    }

    #[test]
    fn illegal_cast_is_rejected() {
        assert_eq!(
            check_err("int main(void) { int *p; double d = 0.0; p = d; return 0; }"),
            SemanticErrorKind::InvalidCast
        );
    }

    #[test]
    fn void_pointer_converts_on_assignment() {
        check("int main(void) { int x = 1; void *v = &x; int *p = v; return *p; }").unwrap();
    }

    #[test]
    fn address_of_requires_lvalue() {
        assert_eq!(
            check_err("int main(void) { return (int)(long)&(1 + 2); }"),
            SemanticErrorKind::InvalidLvalue
        );
    }

    #[test]
    fn conflicting_function_redeclaration() {
        assert_eq!(
            check_err("int f(int a); long f(int a) { return 0; }"),
            SemanticErrorKind::RedeclConflict
        );
    }

    #[test]
    fn static_follows_non_static_is_rejected() {
        assert_eq!(
            check_err("int f(void); static int f(void) { return 0; }"),
            SemanticErrorKind::RedeclConflict
        );
    }

    #[test]
    fn sizeof_incomplete_is_rejected() {
        assert_eq!(
            check_err("struct s; int main(void) { return sizeof(struct s); }"),
            SemanticErrorKind::IncompleteType
        );
    }

    #[test]
    fn compound_assignment_records_common_type() {
        let (program, ..) = check("int main(void) { int a = 1; long b = 2; a += b; return a; }").unwrap();
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Stmt(Statement::Expression(exp)) = &fun.body.as_ref().unwrap().items[2]
        else {
            panic!()
        };
        let ExpKind::CompoundAssignment { common, .. } = &exp.kind else {
            panic!()
        };
        assert_eq!(**common.as_ref().unwrap(), Type::Long);
        assert_eq!(**exp.ty(), Type::Int);
    }
}
