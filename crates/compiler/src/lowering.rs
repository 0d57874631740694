//! AST to three-address-code lowering
//!
//! Flattens the typed AST into TAC, preserving evaluation order and
//! short-circuit semantics. Expression results are one of three shapes:
//! a plain operand, a dereferenced pointer, or a sub-object of a named
//! aggregate (base + constant offset). Reads and writes go through those
//! shapes, so member access and pointer stores lower to the dedicated
//! `CopyToOffset`/`CopyFromOffset`/`Load`/`Store` forms.
//!
//! After all function bodies are lowered, static variables and constants
//! are harvested from the symbol table in table order.

use crate::ast::*;
use crate::intern::{Ident, Interner};
use crate::symbols::{IdentAttrs, InitialValue, StaticInit, Symbol, SymbolTable};
use crate::tac::*;
use crate::typechecker::const_convert;
use crate::types::Type;
use std::rc::Rc;

/// Where an expression's value lives.
enum ExpResult {
    Plain(TacValue),
    Deref(TacValue),
    SubObject { base: Ident, offset: i64 },
}

pub fn lower(
    program: &Program,
    table: &mut SymbolTable,
    interner: &mut Interner,
) -> TacProgram {
    let mut lowerer = Lowerer {
        interner,
        table,
        instructions: Vec::new(),
    };
    let mut functions = Vec::new();
    for decl in &program.decls {
        if let Declaration::Fun(fun) = decl
            && fun.body.is_some()
        {
            functions.push(lowerer.lower_function(fun));
        }
    }

    // Statics and constants come out of the symbol table, in table order.
    let mut static_variables = Vec::new();
    let mut static_constants = Vec::new();
    for (&name, symbol) in &lowerer.table.symbols {
        match &symbol.attrs {
            IdentAttrs::Static { init, global } => {
                let inits = match init {
                    InitialValue::Initial(inits) => inits.clone(),
                    InitialValue::Tentative => vec![StaticInit::Zero {
                        bytes: lowerer.table.type_size(&symbol.ty),
                    }],
                    InitialValue::NoInitializer => continue,
                };
                static_variables.push(TacStaticVariable {
                    name,
                    is_global: *global,
                    ty: Rc::clone(&symbol.ty),
                    inits,
                });
            }
            IdentAttrs::Constant(init) => {
                static_constants.push(TacStaticConstant {
                    name,
                    ty: Rc::clone(&symbol.ty),
                    init: init.clone(),
                });
            }
            _ => {}
        }
    }

    TacProgram {
        static_constants,
        static_variables,
        functions,
    }
}

struct Lowerer<'a> {
    interner: &'a mut Interner,
    table: &'a mut SymbolTable,
    instructions: Vec<TacInstruction>,
}

impl<'a> Lowerer<'a> {
    fn emit(&mut self, instruction: TacInstruction) {
        self.instructions.push(instruction);
    }

    /// Fresh temporary of the given type, registered in the symbol table.
    fn make_temp(&mut self, ty: &Rc<Type>, prefix: &str) -> TacValue {
        let name = self.interner.make_var(prefix);
        self.table.insert(
            name,
            Symbol {
                ty: Rc::clone(ty),
                attrs: IdentAttrs::Local,
            },
        );
        TacValue::Var(name)
    }

    fn make_label(&mut self, prefix: &str) -> Ident {
        self.interner.make_label(prefix)
    }

    /// Derived label for break/continue/default/case targets: a fixed
    /// prefix glued to the construct's unique label.
    fn derived_label(&mut self, prefix: &str, target: Ident) -> Ident {
        let name = format!("{}{}", prefix, self.interner.lookup(target));
        self.interner.intern(&name)
    }

    fn var_type(&self, value: &TacValue) -> Rc<Type> {
        match value {
            TacValue::Var(name) => Rc::clone(&self.table.expect(*name).ty),
            TacValue::Constant(c) => Rc::new(match c {
                Const::Char(_) => Type::Char,
                Const::Int(_) => Type::Int,
                Const::Long(_) => Type::Long,
                Const::UChar(_) => Type::UChar,
                Const::UInt(_) => Type::UInt,
                Const::ULong(_) => Type::ULong,
                Const::Double(_) => Type::Double,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Functions and declarations

    fn lower_function(&mut self, decl: &FunDecl) -> TacFunction {
        let IdentAttrs::Fun { global, .. } = self.table.expect(decl.name).attrs else {
            unreachable!("function without function attributes");
        };
        let Type::Fun(fun_type) = &*self.table.expect(decl.name).ty else {
            unreachable!()
        };
        let returns_void = matches!(&*fun_type.ret, Type::Void);
        self.instructions = Vec::new();
        if let Some(body) = &decl.body {
            self.lower_block(body);
        }
        // A function that falls off the end returns zero (or nothing).
        if returns_void {
            self.emit(TacInstruction::Return(None));
        } else {
            self.emit(TacInstruction::Return(Some(TacValue::Constant(Const::Int(
                0,
            )))));
        }
        TacFunction {
            name: decl.name,
            is_global: global,
            params: decl.params.clone(),
            body: std::mem::take(&mut self.instructions),
        }
    }

    fn lower_block(&mut self, block: &Block) {
        for item in &block.items {
            match item {
                BlockItem::Stmt(stmt) => self.lower_statement(stmt),
                BlockItem::Decl(Declaration::Var(decl)) => self.lower_var_decl(decl),
                // Struct declarations and local function declarations
                // produce no code.
                BlockItem::Decl(_) => {}
            }
        }
    }

    fn lower_var_decl(&mut self, decl: &VarDecl) {
        if decl.storage.is_some() {
            // Static and extern locals are harvested from the symbol table.
            return;
        }
        if let Some(init) = &decl.init {
            self.lower_local_init(decl.name, init, 0);
        }
    }

    /// Lower an automatic initializer, writing into `name` at `offset`.
    fn lower_local_init(&mut self, name: Ident, init: &Initializer, offset: i64) {
        match init {
            Initializer::Single { exp, init_type } => {
                if let ExpKind::String(bytes) = &exp.kind {
                    let Some(target) = init_type else {
                        unreachable!("string initializer without a recorded type");
                    };
                    if let Type::Array { size, .. } = &**target {
                        self.lower_string_bytes_init(name, offset, bytes, *size);
                        return;
                    }
                }
                let value = self.lower_exp_value(exp);
                // A scalar variable is initialized whole; anything nested
                // writes through an offset into the aggregate.
                if offset == 0 && self.table.expect(name).ty.is_scalar() {
                    self.emit(TacInstruction::Copy {
                        src: value,
                        dst: TacValue::Var(name),
                    });
                } else {
                    self.emit(TacInstruction::CopyToOffset {
                        src: value,
                        dst_name: name,
                        offset,
                    });
                }
            }
            Initializer::Compound {
                inits, init_type, ..
            } => {
                let target = init_type.as_ref().expect("typed compound initializer");
                match &**target {
                    Type::Array { elem, .. } => {
                        let stride = self.table.type_size(elem);
                        for (i, init) in inits.iter().enumerate() {
                            self.lower_local_init(name, init, offset + stride * i as i64);
                        }
                    }
                    Type::Structure { tag, .. } => {
                        let member_offsets: Vec<i64> = self.table.structs[tag]
                            .ordered_members()
                            .map(|m| m.offset)
                            .collect();
                        for (init, member_offset) in inits.iter().zip(&member_offsets) {
                            self.lower_local_init(name, init, offset + member_offset);
                        }
                    }
                    _ => unreachable!("compound initializer for a scalar"),
                }
            }
        }
    }

    /// Copy string-literal bytes (plus zero fill up to `size`) into a char
    /// array, in 8/4/1-byte chunks.
    fn lower_string_bytes_init(&mut self, name: Ident, offset: i64, bytes: &[u8], size: i64) {
        let mut buffer = bytes.to_vec();
        buffer.resize(size as usize, 0);
        let mut at = 0usize;
        while at < buffer.len() {
            let remaining = buffer.len() - at;
            let (value, width) = if remaining >= 8 {
                let mut chunk = [0u8; 8];
                chunk.copy_from_slice(&buffer[at..at + 8]);
                (Const::ULong(u64::from_le_bytes(chunk)), 8)
            } else if remaining >= 4 {
                let mut chunk = [0u8; 4];
                chunk.copy_from_slice(&buffer[at..at + 4]);
                (Const::UInt(u32::from_le_bytes(chunk)), 4)
            } else {
                (Const::UChar(buffer[at]), 1)
            };
            self.emit(TacInstruction::CopyToOffset {
                src: TacValue::Constant(value),
                dst_name: name,
                offset: offset + at as i64,
            });
            at += width;
        }
    }

    // ------------------------------------------------------------------
    // Statements

    fn lower_statement(&mut self, stmt: &Statement) {
        match stmt {
            Statement::Return { exp, .. } => {
                let value = exp.as_ref().map(|exp| self.lower_exp_value(exp));
                self.emit(TacInstruction::Return(value));
            }
            Statement::Expression(exp) => {
                self.lower_exp_value(exp);
            }
            Statement::If {
                cond,
                then_stmt,
                else_stmt,
            } => {
                let c = self.lower_exp_value(cond);
                match else_stmt {
                    None => {
                        let end = self.make_label("if_false");
                        self.emit(TacInstruction::JumpIfZero {
                            condition: c,
                            target: end,
                        });
                        self.lower_statement(then_stmt);
                        self.emit(TacInstruction::Label(end));
                    }
                    Some(else_stmt) => {
                        let else_label = self.make_label("if_else");
                        let end = self.make_label("if_false");
                        self.emit(TacInstruction::JumpIfZero {
                            condition: c,
                            target: else_label,
                        });
                        self.lower_statement(then_stmt);
                        self.emit(TacInstruction::Jump(end));
                        self.emit(TacInstruction::Label(else_label));
                        self.lower_statement(else_stmt);
                        self.emit(TacInstruction::Label(end));
                    }
                }
            }
            Statement::Compound(block) => self.lower_block(block),
            Statement::While { label, cond, body } => {
                let label = label.expect("loop labeled during resolution");
                let continue_label = self.derived_label("continue_", label);
                let break_label = self.derived_label("break_", label);
                self.emit(TacInstruction::Label(continue_label));
                let c = self.lower_exp_value(cond);
                self.emit(TacInstruction::JumpIfZero {
                    condition: c,
                    target: break_label,
                });
                self.lower_statement(body);
                self.emit(TacInstruction::Jump(continue_label));
                self.emit(TacInstruction::Label(break_label));
            }
            Statement::DoWhile { label, body, cond } => {
                let label = label.expect("loop labeled during resolution");
                let start = self.make_label("do_while_start");
                let continue_label = self.derived_label("continue_", label);
                let break_label = self.derived_label("break_", label);
                self.emit(TacInstruction::Label(start));
                self.lower_statement(body);
                self.emit(TacInstruction::Label(continue_label));
                let c = self.lower_exp_value(cond);
                self.emit(TacInstruction::JumpIfNotZero {
                    condition: c,
                    target: start,
                });
                self.emit(TacInstruction::Label(break_label));
            }
            Statement::For {
                label,
                init,
                cond,
                post,
                body,
            } => {
                let label = label.expect("loop labeled during resolution");
                let start = self.make_label("for_start");
                let continue_label = self.derived_label("continue_", label);
                let break_label = self.derived_label("break_", label);
                match init {
                    ForInit::Decl(decl) => self.lower_var_decl(decl),
                    ForInit::Exp(Some(exp)) => {
                        self.lower_exp_value(exp);
                    }
                    ForInit::Exp(None) => {}
                }
                self.emit(TacInstruction::Label(start));
                if let Some(cond) = cond {
                    let c = self.lower_exp_value(cond);
                    self.emit(TacInstruction::JumpIfZero {
                        condition: c,
                        target: break_label,
                    });
                }
                self.lower_statement(body);
                self.emit(TacInstruction::Label(continue_label));
                if let Some(post) = post {
                    self.lower_exp_value(post);
                }
                self.emit(TacInstruction::Jump(start));
                self.emit(TacInstruction::Label(break_label));
            }
            Statement::Switch {
                label,
                cond,
                body,
                cases,
                has_default,
                ..
            } => {
                let label = label.expect("switch labeled during resolution");
                let break_label = self.derived_label("break_", label);
                let matched = self.lower_exp_value(cond);
                for (value, case_label) in cases {
                    let cmp = self.make_temp(&Rc::new(Type::Int), "switch");
                    self.emit(TacInstruction::Binary {
                        op: TacBinaryOp::Equal,
                        src1: matched.clone(),
                        src2: TacValue::Constant(*value),
                        dst: cmp.clone(),
                    });
                    self.emit(TacInstruction::JumpIfNotZero {
                        condition: cmp,
                        target: *case_label,
                    });
                }
                if *has_default {
                    let default_label = self.derived_label("default_", label);
                    self.emit(TacInstruction::Jump(default_label));
                } else {
                    self.emit(TacInstruction::Jump(break_label));
                }
                self.lower_statement(body);
                self.emit(TacInstruction::Label(break_label));
            }
            Statement::Case { stmt, label, .. } => {
                self.emit(TacInstruction::Label(
                    label.expect("case labeled during resolution"),
                ));
                self.lower_statement(stmt);
            }
            Statement::Default { stmt, label, .. } => {
                self.emit(TacInstruction::Label(
                    label.expect("default labeled during resolution"),
                ));
                self.lower_statement(stmt);
            }
            Statement::Break { label, .. } => {
                let target = self.derived_label("break_", label.expect("bound break"));
                self.emit(TacInstruction::Jump(target));
            }
            Statement::Continue { label, .. } => {
                let target = self.derived_label("continue_", label.expect("bound continue"));
                self.emit(TacInstruction::Jump(target));
            }
            Statement::Goto { target, .. } => {
                self.emit(TacInstruction::Jump(*target));
            }
            Statement::Label { name, stmt, .. } => {
                self.emit(TacInstruction::Label(*name));
                self.lower_statement(stmt);
            }
            Statement::Null => {}
        }
    }

    // ------------------------------------------------------------------
    // Expressions

    /// Lower an expression and convert the result to a plain value.
    fn lower_exp_value(&mut self, exp: &Exp) -> TacValue {
        let result = self.lower_exp(exp);
        self.read_result(result, exp.ty(), temp_prefix(&exp.kind))
    }

    fn read_result(&mut self, result: ExpResult, ty: &Rc<Type>, prefix: &str) -> TacValue {
        match result {
            ExpResult::Plain(value) => value,
            ExpResult::Deref(ptr) => {
                let dst = self.make_temp(ty, prefix);
                self.emit(TacInstruction::Load {
                    src_ptr: ptr,
                    dst: dst.clone(),
                });
                dst
            }
            ExpResult::SubObject { base, offset } => {
                let dst = self.make_temp(ty, prefix);
                self.emit(TacInstruction::CopyFromOffset {
                    src_name: base,
                    offset,
                    dst: dst.clone(),
                });
                dst
            }
        }
    }

    /// Store `value` into the location described by `result`.
    fn store_result(&mut self, result: &ExpResult, value: TacValue) {
        match result {
            ExpResult::Plain(dst) => {
                self.emit(TacInstruction::Copy {
                    src: value,
                    dst: dst.clone(),
                });
            }
            ExpResult::Deref(ptr) => {
                self.emit(TacInstruction::Store {
                    src: value,
                    dst_ptr: ptr.clone(),
                });
            }
            ExpResult::SubObject { base, offset } => {
                self.emit(TacInstruction::CopyToOffset {
                    src: value,
                    dst_name: *base,
                    offset: *offset,
                });
            }
        }
    }

    /// Emit the conversion of `value` from `from` to `to`, returning the
    /// converted value.
    fn gen_cast(&mut self, value: TacValue, from: &Rc<Type>, to: &Rc<Type>) -> TacValue {
        if **from == **to {
            return value;
        }
        let dst = self.make_temp(to, "cast");
        let instruction = match (&**from, &**to) {
            (_, Type::Double) => {
                if from.is_signed() {
                    TacInstruction::IntToDouble {
                        src: value,
                        dst: dst.clone(),
                    }
                } else {
                    TacInstruction::UIntToDouble {
                        src: value,
                        dst: dst.clone(),
                    }
                }
            }
            (Type::Double, _) => {
                if to.is_signed() {
                    TacInstruction::DoubleToInt {
                        src: value,
                        dst: dst.clone(),
                    }
                } else {
                    TacInstruction::DoubleToUInt {
                        src: value,
                        dst: dst.clone(),
                    }
                }
            }
            _ => {
                let from_size = from.scalar_size();
                let to_size = to.scalar_size();
                if from_size == to_size {
                    TacInstruction::Copy {
                        src: value,
                        dst: dst.clone(),
                    }
                } else if to_size < from_size {
                    TacInstruction::Truncate {
                        src: value,
                        dst: dst.clone(),
                    }
                } else if from.is_signed() {
                    TacInstruction::SignExtend {
                        src: value,
                        dst: dst.clone(),
                    }
                } else {
                    TacInstruction::ZeroExtend {
                        src: value,
                        dst: dst.clone(),
                    }
                }
            }
        };
        self.emit(instruction);
        dst
    }

    fn lower_exp(&mut self, exp: &Exp) -> ExpResult {
        match &exp.kind {
            ExpKind::Constant(c) => ExpResult::Plain(TacValue::Constant(*c)),
            ExpKind::String(bytes) => {
                let label = self.table.string_constant(self.interner, bytes);
                ExpResult::Plain(TacValue::Var(label))
            }
            ExpKind::Var(name) => ExpResult::Plain(TacValue::Var(*name)),
            ExpKind::Cast { target, exp: inner } => {
                if matches!(&**target, Type::Void) {
                    self.lower_exp_value(inner);
                    return ExpResult::Plain(TacValue::Constant(Const::Int(0)));
                }
                let value = self.lower_exp_value(inner);
                let converted = self.gen_cast(value, inner.ty(), target);
                ExpResult::Plain(converted)
            }
            ExpKind::Unary { op, exp: inner } => {
                let src = self.lower_exp_value(inner);
                let dst = self.make_temp(exp.ty(), "unop");
                let op = match op {
                    UnaryOp::Complement => TacUnaryOp::Complement,
                    UnaryOp::Negate => TacUnaryOp::Negate,
                    UnaryOp::Not => TacUnaryOp::Not,
                };
                self.emit(TacInstruction::Unary {
                    op,
                    src,
                    dst: dst.clone(),
                });
                ExpResult::Plain(dst)
            }
            ExpKind::Binary { op, lhs, rhs } => self.lower_binary(exp, *op, lhs, rhs),
            ExpKind::Assignment { lhs, rhs } => {
                let target = self.lower_exp(lhs);
                let value = self.lower_exp_value(rhs);
                self.store_result(&target, value.clone());
                match target {
                    ExpResult::Plain(dst) => ExpResult::Plain(dst),
                    _ => ExpResult::Plain(value),
                }
            }
            ExpKind::CompoundAssignment {
                op,
                lhs,
                rhs,
                common,
            } => {
                let common = common.as_ref().expect("typed compound assignment");
                let lhs_ty = Rc::clone(lhs.ty());
                let target = self.lower_exp(lhs);
                let current = self.read_result_for_update(&target, &lhs_ty);
                let new = if lhs_ty.is_pointer() {
                    // Pointer arithmetic: scale by the referent size.
                    let Type::Pointer(referent) = &*lhs_ty else {
                        unreachable!()
                    };
                    let scale = self.table.type_size(referent);
                    let mut index = self.lower_exp_value(rhs);
                    if *op == BinaryOp::Subtract {
                        let negated = self.make_temp(&Rc::new(Type::Long), "assign");
                        self.emit(TacInstruction::Unary {
                            op: TacUnaryOp::Negate,
                            src: index,
                            dst: negated.clone(),
                        });
                        index = negated;
                    }
                    let dst = self.make_temp(&lhs_ty, "assign");
                    self.emit(TacInstruction::AddPtr {
                        ptr: current,
                        index,
                        scale,
                        dst: dst.clone(),
                    });
                    dst
                } else {
                    let widened = self.gen_cast(current, &lhs_ty, common);
                    let rhs_value = self.lower_exp_value(rhs);
                    let result = self.make_temp(common, "assign");
                    self.emit(TacInstruction::Binary {
                        op: self.tac_binary_op(*op, common),
                        src1: widened,
                        src2: rhs_value,
                        dst: result.clone(),
                    });
                    self.gen_cast(result, common, &lhs_ty)
                };
                self.store_result(&target, new.clone());
                ExpResult::Plain(new)
            }
            ExpKind::Postfix {
                op,
                exp: inner,
                common,
            } => {
                let common = common.as_ref().expect("typed postfix expression");
                let ty = Rc::clone(inner.ty());
                let target = self.lower_exp(inner);
                let current = self.read_result_for_update(&target, &ty);
                let old = self.make_temp(&ty, "assign");
                self.emit(TacInstruction::Copy {
                    src: current,
                    dst: old.clone(),
                });
                let new = if ty.is_pointer() {
                    let Type::Pointer(referent) = &*ty else {
                        unreachable!()
                    };
                    let scale = self.table.type_size(referent);
                    let step = if *op == BinaryOp::Add { 1 } else { -1 };
                    let dst = self.make_temp(&ty, "assign");
                    self.emit(TacInstruction::AddPtr {
                        ptr: old.clone(),
                        index: TacValue::Constant(Const::Long(step)),
                        scale,
                        dst: dst.clone(),
                    });
                    dst
                } else {
                    let widened = self.gen_cast(old.clone(), &ty, common);
                    let one = TacValue::Constant(const_convert(Const::Int(1), common));
                    let result = self.make_temp(common, "assign");
                    self.emit(TacInstruction::Binary {
                        op: self.tac_binary_op(*op, common),
                        src1: widened,
                        src2: one,
                        dst: result.clone(),
                    });
                    self.gen_cast(result, common, &ty)
                };
                self.store_result(&target, new);
                ExpResult::Plain(old)
            }
            ExpKind::Conditional {
                cond,
                then_exp,
                else_exp,
            } => {
                let else_label = self.make_label("ternary_else");
                let end = self.make_label("ternary_false");
                let c = self.lower_exp_value(cond);
                self.emit(TacInstruction::JumpIfZero {
                    condition: c,
                    target: else_label,
                });
                if matches!(&**exp.ty(), Type::Void) {
                    self.lower_exp_value(then_exp);
                    self.emit(TacInstruction::Jump(end));
                    self.emit(TacInstruction::Label(else_label));
                    self.lower_exp_value(else_exp);
                    self.emit(TacInstruction::Label(end));
                    return ExpResult::Plain(TacValue::Constant(Const::Int(0)));
                }
                let dst = self.make_temp(exp.ty(), "ternop");
                let v1 = self.lower_exp_value(then_exp);
                self.emit(TacInstruction::Copy {
                    src: v1,
                    dst: dst.clone(),
                });
                self.emit(TacInstruction::Jump(end));
                self.emit(TacInstruction::Label(else_label));
                let v2 = self.lower_exp_value(else_exp);
                self.emit(TacInstruction::Copy {
                    src: v2,
                    dst: dst.clone(),
                });
                self.emit(TacInstruction::Label(end));
                ExpResult::Plain(dst)
            }
            ExpKind::Call { name, args } => {
                let arg_values: Vec<TacValue> =
                    args.iter().map(|arg| self.lower_exp_value(arg)).collect();
                let dst = if matches!(&**exp.ty(), Type::Void) {
                    None
                } else {
                    Some(self.make_temp(exp.ty(), "call"))
                };
                self.emit(TacInstruction::FunCall {
                    name: *name,
                    args: arg_values,
                    dst: dst.clone(),
                });
                ExpResult::Plain(dst.unwrap_or(TacValue::Constant(Const::Int(0))))
            }
            ExpKind::Dereference(inner) => {
                let ptr = self.lower_exp_value(inner);
                ExpResult::Deref(ptr)
            }
            ExpKind::AddrOf(inner) => {
                let result = self.lower_exp(inner);
                match result {
                    ExpResult::Plain(value) => {
                        let dst = self.make_temp(exp.ty(), "addr");
                        self.emit(TacInstruction::GetAddress {
                            src: value,
                            dst: dst.clone(),
                        });
                        ExpResult::Plain(dst)
                    }
                    ExpResult::Deref(ptr) => ExpResult::Plain(ptr),
                    ExpResult::SubObject { base, offset } => {
                        let dst = self.make_temp(exp.ty(), "addr");
                        self.emit(TacInstruction::GetAddress {
                            src: TacValue::Var(base),
                            dst: dst.clone(),
                        });
                        if offset == 0 {
                            ExpResult::Plain(dst)
                        } else {
                            let adjusted = self.make_temp(exp.ty(), "addr");
                            self.emit(TacInstruction::AddPtr {
                                ptr: dst,
                                index: TacValue::Constant(Const::Long(offset)),
                                scale: 1,
                                dst: adjusted.clone(),
                            });
                            ExpResult::Plain(adjusted)
                        }
                    }
                }
            }
            ExpKind::Subscript { base, index } => {
                let (ptr_exp, idx_exp) = if base.ty().is_pointer() {
                    (&**base, &**index)
                } else {
                    (&**index, &**base)
                };
                let ptr = self.lower_exp_value(ptr_exp);
                let idx = self.lower_exp_value(idx_exp);
                let Type::Pointer(referent) = &**ptr_exp.ty() else {
                    unreachable!("subscript without a pointer operand")
                };
                let scale = self.table.type_size(referent);
                let dst = self.make_temp(ptr_exp.ty(), "subscr");
                self.emit(TacInstruction::AddPtr {
                    ptr,
                    index: idx,
                    scale,
                    dst: dst.clone(),
                });
                ExpResult::Deref(dst)
            }
            ExpKind::SizeOf(inner) => {
                let size = self.table.type_size(inner.ty());
                ExpResult::Plain(TacValue::Constant(Const::ULong(size as u64)))
            }
            ExpKind::SizeOfT(target) => {
                let size = self.table.type_size(target);
                ExpResult::Plain(TacValue::Constant(Const::ULong(size as u64)))
            }
            ExpKind::Dot { structure, member } => {
                let Type::Structure { tag, .. } = &**structure.ty() else {
                    unreachable!("member access on a non-structure")
                };
                let member_offset = self.table.structs[tag].members[member].offset;
                match self.lower_exp(structure) {
                    ExpResult::Plain(TacValue::Var(base)) => ExpResult::SubObject {
                        base,
                        offset: member_offset,
                    },
                    ExpResult::SubObject { base, offset } => ExpResult::SubObject {
                        base,
                        offset: offset + member_offset,
                    },
                    ExpResult::Deref(ptr) => self.offset_pointer(ptr, member_offset, exp.ty(), "smem"),
                    ExpResult::Plain(_) => unreachable!("structure value without a location"),
                }
            }
            ExpKind::Arrow { pointer, member } => {
                let Type::Pointer(referent) = &**pointer.ty() else {
                    unreachable!()
                };
                let Type::Structure { tag, .. } = &**referent else {
                    unreachable!()
                };
                let member_offset = self.table.structs[tag].members[member].offset;
                let ptr = self.lower_exp_value(pointer);
                self.offset_pointer(ptr, member_offset, exp.ty(), "pmem")
            }
        }
    }

    /// `Deref(ptr + offset)`, skipping the add for offset zero.
    fn offset_pointer(
        &mut self,
        ptr: TacValue,
        offset: i64,
        member_ty: &Rc<Type>,
        prefix: &str,
    ) -> ExpResult {
        if offset == 0 {
            return ExpResult::Deref(ptr);
        }
        let ptr_ty = Rc::new(Type::Pointer(Rc::clone(member_ty)));
        let dst = self.make_temp(&ptr_ty, prefix);
        self.emit(TacInstruction::AddPtr {
            ptr,
            index: TacValue::Constant(Const::Long(offset)),
            scale: 1,
            dst: dst.clone(),
        });
        ExpResult::Deref(dst)
    }

    /// Read the current value of an lvalue without consuming the location
    /// (used by compound assignment and postfix, which write back later).
    fn read_result_for_update(&mut self, result: &ExpResult, ty: &Rc<Type>) -> TacValue {
        match result {
            ExpResult::Plain(value) => value.clone(),
            ExpResult::Deref(ptr) => {
                let dst = self.make_temp(ty, "assign");
                self.emit(TacInstruction::Load {
                    src_ptr: ptr.clone(),
                    dst: dst.clone(),
                });
                dst
            }
            ExpResult::SubObject { base, offset } => {
                let dst = self.make_temp(ty, "assign");
                self.emit(TacInstruction::CopyFromOffset {
                    src_name: *base,
                    offset: *offset,
                    dst: dst.clone(),
                });
                dst
            }
        }
    }

    fn lower_binary(&mut self, exp: &Exp, op: BinaryOp, lhs: &Exp, rhs: &Exp) -> ExpResult {
        match op {
            BinaryOp::And => {
                let false_label = self.make_label("and_false");
                let end = self.make_label("and_true");
                let v1 = self.lower_exp_value(lhs);
                self.emit(TacInstruction::JumpIfZero {
                    condition: v1,
                    target: false_label,
                });
                let v2 = self.lower_exp_value(rhs);
                self.emit(TacInstruction::JumpIfZero {
                    condition: v2,
                    target: false_label,
                });
                let dst = self.make_temp(exp.ty(), "binop");
                self.emit(TacInstruction::Copy {
                    src: TacValue::Constant(Const::Int(1)),
                    dst: dst.clone(),
                });
                self.emit(TacInstruction::Jump(end));
                self.emit(TacInstruction::Label(false_label));
                self.emit(TacInstruction::Copy {
                    src: TacValue::Constant(Const::Int(0)),
                    dst: dst.clone(),
                });
                self.emit(TacInstruction::Label(end));
                ExpResult::Plain(dst)
            }
            BinaryOp::Or => {
                let true_label = self.make_label("or_true");
                let end = self.make_label("or_false");
                let v1 = self.lower_exp_value(lhs);
                self.emit(TacInstruction::JumpIfNotZero {
                    condition: v1,
                    target: true_label,
                });
                let v2 = self.lower_exp_value(rhs);
                self.emit(TacInstruction::JumpIfNotZero {
                    condition: v2,
                    target: true_label,
                });
                let dst = self.make_temp(exp.ty(), "binop");
                self.emit(TacInstruction::Copy {
                    src: TacValue::Constant(Const::Int(0)),
                    dst: dst.clone(),
                });
                self.emit(TacInstruction::Jump(end));
                self.emit(TacInstruction::Label(true_label));
                self.emit(TacInstruction::Copy {
                    src: TacValue::Constant(Const::Int(1)),
                    dst: dst.clone(),
                });
                self.emit(TacInstruction::Label(end));
                ExpResult::Plain(dst)
            }
            BinaryOp::Add | BinaryOp::Subtract if exp.ty().is_pointer() => {
                // Pointer +/- integer.
                let (ptr_exp, idx_exp) = if lhs.ty().is_pointer() {
                    (lhs, rhs)
                } else {
                    (rhs, lhs)
                };
                let Type::Pointer(referent) = &**exp.ty() else {
                    unreachable!()
                };
                let scale = self.table.type_size(referent);
                let ptr = self.lower_exp_value(ptr_exp);
                let mut index = self.lower_exp_value(idx_exp);
                if op == BinaryOp::Subtract {
                    let negated = self.make_temp(&Rc::new(Type::Long), "binop");
                    self.emit(TacInstruction::Unary {
                        op: TacUnaryOp::Negate,
                        src: index,
                        dst: negated.clone(),
                    });
                    index = negated;
                }
                let dst = self.make_temp(exp.ty(), "binop");
                self.emit(TacInstruction::AddPtr {
                    ptr,
                    index,
                    scale,
                    dst: dst.clone(),
                });
                ExpResult::Plain(dst)
            }
            BinaryOp::Subtract if lhs.ty().is_pointer() => {
                // Pointer difference: byte difference divided by the scale.
                let Type::Pointer(referent) = &**lhs.ty() else {
                    unreachable!()
                };
                let scale = self.table.type_size(referent);
                let v1 = self.lower_exp_value(lhs);
                let v2 = self.lower_exp_value(rhs);
                let long_ty = Rc::new(Type::Long);
                let diff = self.make_temp(&long_ty, "binop");
                self.emit(TacInstruction::Binary {
                    op: TacBinaryOp::Subtract,
                    src1: v1,
                    src2: v2,
                    dst: diff.clone(),
                });
                let dst = self.make_temp(&long_ty, "binop");
                self.emit(TacInstruction::Binary {
                    op: TacBinaryOp::Divide,
                    src1: diff,
                    src2: TacValue::Constant(Const::Long(scale)),
                    dst: dst.clone(),
                });
                ExpResult::Plain(dst)
            }
            _ => {
                let v1 = self.lower_exp_value(lhs);
                let v2 = self.lower_exp_value(rhs);
                let dst = self.make_temp(exp.ty(), "binop");
                let op_ty = Rc::clone(lhs.ty());
                self.emit(TacInstruction::Binary {
                    op: self.tac_binary_op(op, &op_ty),
                    src1: v1,
                    src2: v2,
                    dst: dst.clone(),
                });
                ExpResult::Plain(dst)
            }
        }
    }

    /// Map an AST operator to its TAC form; right shifts pick the
    /// arithmetic variant when the (promoted) left operand is signed.
    fn tac_binary_op(&self, op: BinaryOp, operand_ty: &Rc<Type>) -> TacBinaryOp {
        match op {
            BinaryOp::Add => TacBinaryOp::Add,
            BinaryOp::Subtract => TacBinaryOp::Subtract,
            BinaryOp::Multiply => TacBinaryOp::Multiply,
            BinaryOp::Divide => TacBinaryOp::Divide,
            BinaryOp::Remainder => TacBinaryOp::Remainder,
            BinaryOp::BitAnd => TacBinaryOp::BitAnd,
            BinaryOp::BitOr => TacBinaryOp::BitOr,
            BinaryOp::BitXor => TacBinaryOp::BitXor,
            BinaryOp::ShiftLeft => TacBinaryOp::ShiftLeft,
            BinaryOp::ShiftRight => {
                if operand_ty.is_signed() {
                    TacBinaryOp::ShiftRightArithmetic
                } else {
                    TacBinaryOp::ShiftRight
                }
            }
            BinaryOp::Equal => TacBinaryOp::Equal,
            BinaryOp::NotEqual => TacBinaryOp::NotEqual,
            BinaryOp::LessThan => TacBinaryOp::LessThan,
            BinaryOp::LessOrEqual => TacBinaryOp::LessOrEqual,
            BinaryOp::GreaterThan => TacBinaryOp::GreaterThan,
            BinaryOp::GreaterOrEqual => TacBinaryOp::GreaterOrEqual,
            BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit handled separately"),
        }
    }
}

/// Temporary-name prefix describing the expression kind, so TAC dumps
/// read naturally.
fn temp_prefix(kind: &ExpKind) -> &'static str {
    match kind {
        ExpKind::Constant(_) => "const",
        ExpKind::String(_) => "string",
        ExpKind::Var(_) => "var",
        ExpKind::Cast { .. } => "cast",
        ExpKind::Unary { .. } => "unop",
        ExpKind::Binary { .. } => "binop",
        ExpKind::Assignment { .. } | ExpKind::CompoundAssignment { .. } | ExpKind::Postfix { .. } => {
            "assign"
        }
        ExpKind::Conditional { .. } => "ternop",
        ExpKind::Call { .. } => "call",
        ExpKind::Dereference(_) => "deref",
        ExpKind::AddrOf(_) => "addr",
        ExpKind::Subscript { .. } => "subscr",
        ExpKind::SizeOf(_) | ExpKind::SizeOfT(_) => "const",
        ExpKind::Dot { .. } => "smem",
        ExpKind::Arrow { .. } => "pmem",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::resolver::Resolver;
    use crate::typechecker::TypeChecker;

    fn lower_source(source: &str) -> (TacProgram, Interner) {
        let mut interner = Interner::new();
        let tokens = Lexer::new(&mut interner, &[]).tokenize(source, None).unwrap();
        let mut program = Parser::new(tokens, &mut interner).parse().unwrap();
        Resolver::new(&mut interner).resolve(&mut program).unwrap();
        let mut table = SymbolTable::new();
        TypeChecker::new(&mut interner, &mut table)
            .check_program(&mut program)
            .unwrap();
        let tac = lower(&program, &mut table, &mut interner);
        (tac, interner)
    }

    fn body_of<'t>(tac: &'t TacProgram, index: usize) -> &'t [TacInstruction] {
        &tac.functions[index].body
    }

    #[test]
    fn and_short_circuits_past_the_right_operand() {
        let (tac, interner) =
            lower_source("int f(void); int main(void) { return 0 && f(); }");
        let body = body_of(&tac, 0);
        // The call must come after a conditional jump on the left operand.
        let jump_at = body
            .iter()
            .position(|i| matches!(i, TacInstruction::JumpIfZero { .. }))
            .expect("left operand guarded by a jump");
        let call_at = body
            .iter()
            .position(|i| matches!(i, TacInstruction::FunCall { .. }))
            .expect("right operand lowered");
        assert!(jump_at < call_at);
        // Its labels follow the and_false/and_true shape.
        let labels: Vec<&str> = body
            .iter()
            .filter_map(|i| match i {
                TacInstruction::Label(l) => Some(interner.lookup(*l)),
                _ => None,
            })
            .collect();
        assert!(labels.iter().any(|l| l.starts_with("and_false.")));
        assert!(labels.iter().any(|l| l.starts_with("and_true.")));
    }

    #[test]
    fn switch_lowers_to_a_compare_chain() {
        let (tac, interner) = lower_source(
            "int main(void) { switch (2) { case 1: return 1; case 2: return 2; default: return 9; } }",
        );
        let body = body_of(&tac, 0);
        let equals = body
            .iter()
            .filter(|i| {
                matches!(
                    i,
                    TacInstruction::Binary {
                        op: TacBinaryOp::Equal,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(equals, 2);
        // Fallthrough goes to the default label before the body.
        let default_jump = body.iter().find_map(|i| match i {
            TacInstruction::Jump(target) if interner.lookup(*target).starts_with("default_") => {
                Some(*target)
            }
            _ => None,
        });
        assert!(default_jump.is_some());
    }

    #[test]
    fn postfix_yields_the_old_value() {
        let (tac, _) = lower_source("int main(void) { int a = 5; return a++; }");
        let body = body_of(&tac, 0);
        // a++ copies the old value aside before the add.
        let copy_at = body
            .iter()
            .position(
                |i| matches!(i, TacInstruction::Copy { src: TacValue::Var(_), .. }),
            )
            .expect("old value copied");
        let add_at = body
            .iter()
            .position(|i| {
                matches!(
                    i,
                    TacInstruction::Binary {
                        op: TacBinaryOp::Add,
                        ..
                    }
                )
            })
            .expect("increment lowered");
        assert!(copy_at < add_at);
        // The returned value is the copy, not the incremented variable.
        let TacInstruction::Copy { dst: old, .. } = &body[copy_at] else {
            unreachable!()
        };
        let ret = body
            .iter()
            .find_map(|i| match i {
                TacInstruction::Return(Some(v)) => Some(v),
                _ => None,
            })
            .unwrap();
        assert_eq!(ret, old);
    }

    #[test]
    fn subscript_scales_by_element_size() {
        let (tac, _) = lower_source("int main(void) { int a[3] = {1, 2, 3}; return a[2]; }");
        let body = body_of(&tac, 0);
        let scale = body
            .iter()
            .find_map(|i| match i {
                TacInstruction::AddPtr { scale, .. } => Some(*scale),
                _ => None,
            })
            .expect("subscript lowered to AddPtr");
        assert_eq!(scale, 4);
    }

    #[test]
    fn signed_shift_right_is_arithmetic() {
        let (tac, _) = lower_source(
            "int main(void) { int s = -8; unsigned int u = 8u; return (s >> 1) + (int)(u >> 1); }",
        );
        let body = body_of(&tac, 0);
        assert!(body.iter().any(|i| matches!(
            i,
            TacInstruction::Binary {
                op: TacBinaryOp::ShiftRightArithmetic,
                ..
            }
        )));
        assert!(body.iter().any(|i| matches!(
            i,
            TacInstruction::Binary {
                op: TacBinaryOp::ShiftRight,
                ..
            }
        )));
    }

    #[test]
    fn statics_are_harvested_in_table_order() {
        let (tac, _) = lower_source(
            "int a = 1; static long b = 2; int main(void) { static int hidden = 3; return 0; }",
        );
        assert_eq!(tac.static_variables.len(), 3);
        assert_eq!(tac.functions.len(), 1);
    }

    #[test]
    fn string_expression_becomes_a_constant() {
        let (tac, _) = lower_source("char *greeting(void) { return \"hi\"; }");
        assert_eq!(tac.static_constants.len(), 1);
        let init = &tac.static_constants[0].init;
        assert_eq!(
            *init,
            StaticInit::String {
                bytes: b"hi".to_vec(),
                null_terminated: true
            }
        );
        // The function takes its address.
        assert!(body_of(&tac, 0)
            .iter()
            .any(|i| matches!(i, TacInstruction::GetAddress { .. })));
    }

    #[test]
    fn void_functions_return_nothing() {
        let (tac, _) = lower_source("void f(void) { } int main(void) { f(); return 0; }");
        let f = &tac.functions[0];
        assert_eq!(f.body.len(), 1);
        assert!(matches!(f.body[0], TacInstruction::Return(None)));
        let main = &tac.functions[1];
        assert!(matches!(
            main.body.last(),
            Some(TacInstruction::Return(Some(_)))
        ));
    }

    #[test]
    fn struct_assignment_is_a_single_copy() {
        let (tac, _) = lower_source(
            "struct s { int a; int b; }; \
             int main(void) { struct s x = {1, 2}; struct s y; y = x; return y.b; }",
        );
        let body = body_of(&tac, 0);
        // y = x lowers to Copy between the two struct vars.
        assert!(body.iter().any(|i| matches!(
            i,
            TacInstruction::Copy {
                src: TacValue::Var(_),
                dst: TacValue::Var(_),
            }
        )));
        // y.b reads through CopyFromOffset at offset 4.
        assert!(body
            .iter()
            .any(|i| matches!(i, TacInstruction::CopyFromOffset { offset: 4, .. })));
    }
}
