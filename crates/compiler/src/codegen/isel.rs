//! Instruction selection
//!
//! Converts TAC into symbolic assembly. Operands stay abstract
//! (`Pseudo`/`PseudoMem`); the stack fix-up pass assigns locations later.
//! This pass owns the System-V calling convention: argument and return
//! registers, eightbyte classification of aggregates, the hidden return
//! pointer for MEMORY-class results, and 16-byte stack alignment at call
//! sites. It also owns the delicate scalar conversions (the 2^63 dance
//! for double<->unsigned long) and the NaN-aware comparison shapes.

use crate::ast::Const;
use crate::codegen::abi::{ClassCache, EightbyteClass};
use crate::codegen::asm::*;
use crate::codegen::symtab::{BackendSymbol, BackendTable, asm_type_of};
use crate::intern::{Ident, Interner};
use crate::symbols::{IdentAttrs, StaticInit, SymbolTable};
use crate::tac::*;
use crate::types::Type;

const ARG_REGISTERS: [Register; 6] = [
    Register::Di,
    Register::Si,
    Register::Dx,
    Register::Cx,
    Register::R8,
    Register::R9,
];

const SSE_REGISTERS: [Register; 8] = [
    Register::Xmm0,
    Register::Xmm1,
    Register::Xmm2,
    Register::Xmm3,
    Register::Xmm4,
    Register::Xmm5,
    Register::Xmm6,
    Register::Xmm7,
];

/// Binary pattern of 2^63 as a double.
const UPPER_BOUND_BITS: u64 = 4890909195324358656;
/// Binary pattern of -0.0 (the sign-bit mask).
const NEG_ZERO_BITS: u64 = 0x8000_0000_0000_0000;

pub fn select_program(
    tac: &TacProgram,
    table: &SymbolTable,
    backend: &mut BackendTable,
    interner: &mut Interner,
) -> AsmProgram {
    let mut selector = InstructionSelector {
        table,
        backend,
        interner,
        cache: ClassCache::new(),
        double_constants: std::collections::HashMap::new(),
        static_constants: Vec::new(),
        instructions: Vec::new(),
    };
    for constant in &tac.static_constants {
        let alignment = asm_type_of(table, &constant.ty).alignment();
        selector.static_constants.push(AsmStaticConstant {
            name: constant.name,
            alignment,
            init: constant.init.clone(),
        });
    }
    let static_variables = tac
        .static_variables
        .iter()
        .map(|var| AsmStaticVariable {
            name: var.name,
            is_global: var.is_global,
            alignment: asm_type_of(table, &var.ty).alignment(),
            inits: var.inits.clone(),
        })
        .collect();
    let functions = tac
        .functions
        .iter()
        .map(|f| selector.select_function(f))
        .collect();
    AsmProgram {
        static_constants: selector.static_constants,
        static_variables,
        functions,
    }
}

struct InstructionSelector<'a> {
    table: &'a SymbolTable,
    backend: &'a mut BackendTable,
    interner: &'a mut Interner,
    cache: ClassCache,
    /// Double constants already materialized, keyed by binary pattern.
    double_constants: std::collections::HashMap<u64, Ident>,
    static_constants: Vec<AsmStaticConstant>,
    instructions: Vec<AsmInstruction>,
}

impl<'a> InstructionSelector<'a> {
    fn emit(&mut self, instruction: AsmInstruction) {
        self.instructions.push(instruction);
    }

    // ------------------------------------------------------------------
    // Operands

    fn const_operand(&mut self, c: Const) -> AsmOperand {
        match c {
            Const::Char(v) => AsmOperand::imm(v as i64 as u64, true, false, v < 0),
            Const::UChar(v) => AsmOperand::imm(v as u64, true, false, false),
            Const::Int(v) => {
                AsmOperand::imm(v as i64 as u64, (-128..=127).contains(&v), false, v < 0)
            }
            Const::Long(v) => AsmOperand::imm(
                v as u64,
                (-128..=127).contains(&v),
                v > i32::MAX as i64 || v < i32::MIN as i64,
                v < 0,
            ),
            Const::UInt(v) => {
                AsmOperand::imm(v as u64, v <= 255, v > i32::MAX as u32, false)
            }
            Const::ULong(v) => {
                AsmOperand::imm(v, v <= 255, v > i32::MAX as u64, false)
            }
            Const::Double(d) => self.double_constant_operand(d.to_bits()),
        }
    }

    /// RIP-relative reference to a (deduplicated) double constant in
    /// read-only data. The sign-bit mask is 16-byte aligned so it can be
    /// used as an xorpd operand.
    fn double_constant_operand(&mut self, bits: u64) -> AsmOperand {
        if let Some(&label) = self.double_constants.get(&bits) {
            return AsmOperand::Data {
                name: label,
                offset: 0,
            };
        }
        let alignment = if bits == NEG_ZERO_BITS { 16 } else { 8 };
        let label = self.interner.make_label("double");
        self.double_constants.insert(bits, label);
        self.static_constants.push(AsmStaticConstant {
            name: label,
            alignment,
            init: StaticInit::Double { bits },
        });
        self.backend.symbols.insert(
            label,
            BackendSymbol::Obj {
                is_static: true,
                is_const: true,
                ty: AsmType::Double,
            },
        );
        AsmOperand::Data {
            name: label,
            offset: 0,
        }
    }

    fn operand(&mut self, value: &TacValue) -> AsmOperand {
        match value {
            TacValue::Constant(c) => self.const_operand(*c),
            TacValue::Var(name) => {
                let ty = &self.table.expect(*name).ty;
                match &**ty {
                    Type::Array { .. } | Type::Structure { .. } => AsmOperand::PseudoMem {
                        name: *name,
                        offset: 0,
                    },
                    _ => AsmOperand::Pseudo(*name),
                }
            }
        }
    }

    fn asm_type(&self, value: &TacValue) -> AsmType {
        match value {
            TacValue::Constant(c) => match c {
                Const::Char(_) | Const::UChar(_) => AsmType::Byte,
                Const::Int(_) | Const::UInt(_) => AsmType::LongWord,
                Const::Long(_) | Const::ULong(_) => AsmType::QuadWord,
                Const::Double(_) => AsmType::Double,
            },
            TacValue::Var(name) => asm_type_of(self.table, &self.table.expect(*name).ty),
        }
    }

    // ------------------------------------------------------------------
    // Value classification

    fn is_signed(&self, value: &TacValue) -> bool {
        match value {
            TacValue::Constant(c) => {
                matches!(c, Const::Char(_) | Const::Int(_) | Const::Long(_))
            }
            TacValue::Var(name) => {
                let ty = &self.table.expect(*name).ty;
                ty.is_signed() || matches!(&**ty, Type::Double)
            }
        }
    }

    fn is_1byte(&self, value: &TacValue) -> bool {
        match value {
            TacValue::Constant(c) => matches!(c, Const::Char(_) | Const::UChar(_)),
            TacValue::Var(name) => self.table.expect(*name).ty.is_character(),
        }
    }

    fn is_4byte(&self, value: &TacValue) -> bool {
        match value {
            TacValue::Constant(c) => matches!(c, Const::Int(_) | Const::UInt(_)),
            TacValue::Var(name) => {
                matches!(&*self.table.expect(*name).ty, Type::Int | Type::UInt)
            }
        }
    }

    fn is_double(&self, value: &TacValue) -> bool {
        match value {
            TacValue::Constant(c) => matches!(c, Const::Double(_)),
            TacValue::Var(name) => matches!(&*self.table.expect(*name).ty, Type::Double),
        }
    }

    fn is_struct(&self, value: &TacValue) -> bool {
        match value {
            TacValue::Constant(_) => false,
            TacValue::Var(name) => {
                matches!(&*self.table.expect(*name).ty, Type::Structure { .. })
            }
        }
    }

    fn struct_of(&self, value: &TacValue) -> (Ident, bool) {
        let TacValue::Var(name) = value else {
            unreachable!("structure operations take variables")
        };
        let Type::Structure { tag, is_union } = &*self.table.expect(*name).ty else {
            unreachable!("structure operand is not structure typed")
        };
        (*tag, *is_union)
    }

    fn var_name(value: &TacValue) -> Ident {
        let TacValue::Var(name) = value else {
            unreachable!("expected a variable operand")
        };
        *name
    }

    fn classes_of(&mut self, tag: Ident, is_union: bool) -> Vec<EightbyteClass> {
        self.cache.classify(self.table, tag, is_union).to_vec()
    }

    /// The assembly type of the eightbyte of `tag` starting at `offset`.
    fn eightbyte_type(&self, tag: Ident, offset: i64) -> AsmType {
        let size = self.table.structs[&tag].size - offset;
        if size >= 8 {
            AsmType::QuadWord
        } else {
            match size {
                1 => AsmType::Byte,
                4 => AsmType::LongWord,
                _ => AsmType::ByteArray { size, alignment: 8 },
            }
        }
    }

    // ------------------------------------------------------------------
    // Returns

    fn select_return(&mut self, value: &Option<TacValue>) {
        if let Some(value) = value {
            if self.is_double(value) {
                let src = self.operand(value);
                self.emit(AsmInstruction::Mov {
                    ty: AsmType::Double,
                    src,
                    dst: AsmOperand::Reg(Register::Xmm0),
                });
            } else if !self.is_struct(value) {
                let src = self.operand(value);
                let ty = self.asm_type(value);
                self.emit(AsmInstruction::Mov {
                    ty,
                    src,
                    dst: AsmOperand::Reg(Register::Ax),
                });
            } else {
                self.return_structure(value);
            }
        }
        self.emit(AsmInstruction::Ret);
    }

    fn return_structure(&mut self, value: &TacValue) {
        let name = Self::var_name(value);
        let (tag, is_union) = self.struct_of(value);
        let classes = self.classes_of(tag, is_union);
        if classes[0] == EightbyteClass::Memory {
            // Copy into the buffer the caller passed through the hidden
            // first argument, preserved at -8(%rbp).
            self.emit(AsmInstruction::Mov {
                ty: AsmType::QuadWord,
                src: AsmOperand::Memory {
                    base: Register::Bp,
                    offset: -8,
                },
                dst: AsmOperand::Reg(Register::Ax),
            });
            let size = self.table.structs[&tag].size;
            self.copy_chunks_to_memory(name, size, Register::Ax);
            return;
        }
        let mut integer_first = false;
        match classes[0] {
            EightbyteClass::Integer => {
                self.eightbyte_to_register(name, 0, Some(tag), Register::Ax);
                integer_first = true;
            }
            EightbyteClass::Sse => {
                self.eightbyte_to_register(name, 0, None, Register::Xmm0);
            }
            EightbyteClass::Memory => unreachable!(),
        }
        if classes.len() == 2 {
            match classes[1] {
                EightbyteClass::Integer => {
                    let reg = if integer_first {
                        Register::Dx
                    } else {
                        Register::Ax
                    };
                    self.eightbyte_to_register(name, 8, Some(tag), reg);
                }
                EightbyteClass::Sse => {
                    let reg = if integer_first {
                        Register::Xmm0
                    } else {
                        Register::Xmm1
                    };
                    self.eightbyte_to_register(name, 8, None, reg);
                }
                EightbyteClass::Memory => unreachable!(),
            }
        }
    }

    /// Pack one eightbyte of an aggregate into a register. Irregular tail
    /// sizes are assembled byte by byte through shifts.
    fn eightbyte_to_register(
        &mut self,
        name: Ident,
        offset: i64,
        struct_tag: Option<Ident>,
        reg: Register,
    ) {
        let ty = match struct_tag {
            Some(tag) => self.eightbyte_type(tag, offset),
            None => AsmType::Double,
        };
        if let AsmType::ByteArray { size, .. } = ty {
            for k in (0..size).rev() {
                self.emit(AsmInstruction::Mov {
                    ty: AsmType::Byte,
                    src: AsmOperand::PseudoMem {
                        name,
                        offset: offset + k,
                    },
                    dst: AsmOperand::Reg(reg),
                });
                if k > 0 {
                    self.emit(AsmInstruction::Binary {
                        op: AsmBinaryOp::Shl,
                        ty: AsmType::QuadWord,
                        src: AsmOperand::imm(8, true, false, false),
                        dst: AsmOperand::Reg(reg),
                    });
                }
            }
        } else {
            self.emit(AsmInstruction::Mov {
                ty,
                src: AsmOperand::PseudoMem { name, offset },
                dst: AsmOperand::Reg(reg),
            });
        }
    }

    /// Unpack a register into one eightbyte of an aggregate, the inverse
    /// of `eightbyte_to_register`.
    fn register_to_eightbyte(
        &mut self,
        name: Ident,
        offset: i64,
        struct_tag: Option<Ident>,
        reg: Register,
    ) {
        let ty = match struct_tag {
            Some(tag) => self.eightbyte_type(tag, offset),
            None => AsmType::Double,
        };
        if let AsmType::ByteArray { size, .. } = ty {
            for k in 0..size {
                self.emit(AsmInstruction::Mov {
                    ty: AsmType::Byte,
                    src: AsmOperand::Reg(reg),
                    dst: AsmOperand::PseudoMem {
                        name,
                        offset: offset + k,
                    },
                });
                if k < size - 1 {
                    self.emit(AsmInstruction::Binary {
                        op: AsmBinaryOp::Shr,
                        ty: AsmType::QuadWord,
                        src: AsmOperand::imm(8, true, false, false),
                        dst: AsmOperand::Reg(reg),
                    });
                }
            }
        } else {
            self.emit(AsmInstruction::Mov {
                ty,
                src: AsmOperand::Reg(reg),
                dst: AsmOperand::PseudoMem { name, offset },
            });
        }
    }

    /// Copy an aggregate from pseudo-memory into `(reg)+k`, in 8/4/1-byte
    /// chunks.
    fn copy_chunks_to_memory(&mut self, name: Ident, total: i64, base: Register) {
        let mut size = total;
        let mut offset = 0i64;
        while size > 0 {
            let ty = chunk_type(size);
            self.emit(AsmInstruction::Mov {
                ty,
                src: AsmOperand::PseudoMem { name, offset },
                dst: AsmOperand::Memory { base, offset },
            });
            offset += ty.size();
            size -= ty.size();
        }
    }

    // ------------------------------------------------------------------
    // Conversions

    fn select_sign_extend(&mut self, src: &TacValue, dst: &TacValue) {
        let instruction = AsmInstruction::MovSx {
            src_ty: self.asm_type(src),
            dst_ty: self.asm_type(dst),
            src: self.operand(src),
            dst: self.operand(dst),
        };
        self.emit(instruction);
    }

    fn select_zero_extend(&mut self, src: &TacValue, dst: &TacValue) {
        let instruction = AsmInstruction::MovZeroExtend {
            src_ty: self.asm_type(src),
            dst_ty: self.asm_type(dst),
            src: self.operand(src),
            dst: self.operand(dst),
        };
        self.emit(instruction);
    }

    fn select_truncate(&mut self, src: &TacValue, dst: &TacValue) {
        let to_byte = self.is_1byte(dst);
        let ty = if to_byte { AsmType::Byte } else { AsmType::LongWord };
        let mut src_op = self.operand(src);
        // Immediates are masked at compile time instead of emitting an
        // oversized immediate operand.
        if let AsmOperand::Imm {
            value,
            is_byte,
            is_quad,
            ..
        } = &mut src_op
        {
            if to_byte {
                if !*is_byte {
                    *value %= 256;
                }
            } else if *is_quad {
                *value = value.wrapping_sub(4294967296);
            }
        }
        let dst_op = self.operand(dst);
        self.emit(AsmInstruction::Mov {
            ty,
            src: src_op,
            dst: dst_op,
        });
    }

    fn select_double_to_int(&mut self, src: &TacValue, dst: &TacValue) {
        if self.is_1byte(dst) {
            let src_op = self.operand(src);
            self.emit(AsmInstruction::Cvttsd2si {
                ty: AsmType::LongWord,
                src: src_op,
                dst: AsmOperand::Reg(Register::Ax),
            });
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Mov {
                ty: AsmType::Byte,
                src: AsmOperand::Reg(Register::Ax),
                dst: dst_op,
            });
        } else {
            let ty = self.asm_type(dst);
            let src_op = self.operand(src);
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Cvttsd2si {
                ty,
                src: src_op,
                dst: dst_op,
            });
        }
    }

    fn select_double_to_uint(&mut self, src: &TacValue, dst: &TacValue) {
        if self.is_1byte(dst) {
            let src_op = self.operand(src);
            self.emit(AsmInstruction::Cvttsd2si {
                ty: AsmType::LongWord,
                src: src_op,
                dst: AsmOperand::Reg(Register::Ax),
            });
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Mov {
                ty: AsmType::Byte,
                src: AsmOperand::Reg(Register::Ax),
                dst: dst_op,
            });
        } else if self.is_4byte(dst) {
            let src_op = self.operand(src);
            self.emit(AsmInstruction::Cvttsd2si {
                ty: AsmType::QuadWord,
                src: src_op,
                dst: AsmOperand::Reg(Register::Ax),
            });
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Mov {
                ty: AsmType::LongWord,
                src: AsmOperand::Reg(Register::Ax),
                dst: dst_op,
            });
        } else {
            // Values of 2^63 and above do not fit cvttsd2si's signed
            // range: subtract 2^63 as a double, convert, add it back as
            // an integer.
            let out_of_range = self.interner.make_label("sd2si_out_of_range");
            let after = self.interner.make_label("sd2si_after");
            let upper_bound = self.double_constant_operand(UPPER_BOUND_BITS);
            let src_op = self.operand(src);
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Cmp {
                ty: AsmType::Double,
                src: upper_bound.clone(),
                dst: src_op.clone(),
            });
            self.emit(AsmInstruction::JmpCC {
                cc: CondCode::Ae,
                target: out_of_range,
            });
            self.emit(AsmInstruction::Cvttsd2si {
                ty: AsmType::QuadWord,
                src: src_op.clone(),
                dst: dst_op.clone(),
            });
            self.emit(AsmInstruction::Jmp(after));
            self.emit(AsmInstruction::Label(out_of_range));
            self.emit(AsmInstruction::Mov {
                ty: AsmType::Double,
                src: src_op,
                dst: AsmOperand::Reg(Register::Xmm1),
            });
            self.emit(AsmInstruction::Binary {
                op: AsmBinaryOp::Sub,
                ty: AsmType::Double,
                src: upper_bound,
                dst: AsmOperand::Reg(Register::Xmm1),
            });
            self.emit(AsmInstruction::Cvttsd2si {
                ty: AsmType::QuadWord,
                src: AsmOperand::Reg(Register::Xmm1),
                dst: dst_op.clone(),
            });
            self.emit(AsmInstruction::Mov {
                ty: AsmType::QuadWord,
                src: AsmOperand::imm(1u64 << 63, false, true, false),
                dst: AsmOperand::Reg(Register::Dx),
            });
            self.emit(AsmInstruction::Binary {
                op: AsmBinaryOp::Add,
                ty: AsmType::QuadWord,
                src: AsmOperand::Reg(Register::Dx),
                dst: dst_op,
            });
            self.emit(AsmInstruction::Label(after));
        }
    }

    fn select_int_to_double(&mut self, src: &TacValue, dst: &TacValue) {
        if self.is_1byte(src) {
            let src_op = self.operand(src);
            self.emit(AsmInstruction::MovSx {
                src_ty: AsmType::Byte,
                dst_ty: AsmType::LongWord,
                src: src_op,
                dst: AsmOperand::Reg(Register::Ax),
            });
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Cvtsi2sd {
                ty: AsmType::LongWord,
                src: AsmOperand::Reg(Register::Ax),
                dst: dst_op,
            });
        } else {
            let ty = self.asm_type(src);
            let src_op = self.operand(src);
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Cvtsi2sd {
                ty,
                src: src_op,
                dst: dst_op,
            });
        }
    }

    fn select_uint_to_double(&mut self, src: &TacValue, dst: &TacValue) {
        if self.is_1byte(src) {
            let src_op = self.operand(src);
            self.emit(AsmInstruction::MovZeroExtend {
                src_ty: AsmType::Byte,
                dst_ty: AsmType::LongWord,
                src: src_op,
                dst: AsmOperand::Reg(Register::Ax),
            });
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Cvtsi2sd {
                ty: AsmType::LongWord,
                src: AsmOperand::Reg(Register::Ax),
                dst: dst_op,
            });
        } else if self.is_4byte(src) {
            let src_op = self.operand(src);
            self.emit(AsmInstruction::MovZeroExtend {
                src_ty: AsmType::LongWord,
                dst_ty: AsmType::QuadWord,
                src: src_op,
                dst: AsmOperand::Reg(Register::Ax),
            });
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Cvtsi2sd {
                ty: AsmType::QuadWord,
                src: AsmOperand::Reg(Register::Ax),
                dst: dst_op,
            });
        } else {
            // A 64-bit value with the top bit set has no signed
            // equivalent: halve it (keeping the sticky low bit for
            // rounding), convert, and double the result.
            let out_of_range = self.interner.make_label("si2sd_out_of_range");
            let after = self.interner.make_label("si2sd_after");
            let src_op = self.operand(src);
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Cmp {
                ty: AsmType::QuadWord,
                src: AsmOperand::imm(0, true, false, false),
                dst: src_op.clone(),
            });
            self.emit(AsmInstruction::JmpCC {
                cc: CondCode::L,
                target: out_of_range,
            });
            self.emit(AsmInstruction::Cvtsi2sd {
                ty: AsmType::QuadWord,
                src: src_op.clone(),
                dst: dst_op.clone(),
            });
            self.emit(AsmInstruction::Jmp(after));
            self.emit(AsmInstruction::Label(out_of_range));
            self.emit(AsmInstruction::Mov {
                ty: AsmType::QuadWord,
                src: src_op,
                dst: AsmOperand::Reg(Register::Ax),
            });
            self.emit(AsmInstruction::Mov {
                ty: AsmType::QuadWord,
                src: AsmOperand::Reg(Register::Ax),
                dst: AsmOperand::Reg(Register::Dx),
            });
            self.emit(AsmInstruction::Unary {
                op: AsmUnaryOp::Shr,
                ty: AsmType::QuadWord,
                dst: AsmOperand::Reg(Register::Dx),
            });
            self.emit(AsmInstruction::Binary {
                op: AsmBinaryOp::And,
                ty: AsmType::QuadWord,
                src: AsmOperand::imm(1, true, false, false),
                dst: AsmOperand::Reg(Register::Ax),
            });
            self.emit(AsmInstruction::Binary {
                op: AsmBinaryOp::Or,
                ty: AsmType::QuadWord,
                src: AsmOperand::Reg(Register::Ax),
                dst: AsmOperand::Reg(Register::Dx),
            });
            self.emit(AsmInstruction::Cvtsi2sd {
                ty: AsmType::QuadWord,
                src: AsmOperand::Reg(Register::Dx),
                dst: dst_op.clone(),
            });
            self.emit(AsmInstruction::Binary {
                op: AsmBinaryOp::Add,
                ty: AsmType::Double,
                src: dst_op.clone(),
                dst: dst_op,
            });
            self.emit(AsmInstruction::Label(after));
        }
    }

    // ------------------------------------------------------------------
    // Calls

    fn select_fun_call(&mut self, name: Ident, args: &[TacValue], dst: &Option<TacValue>) {
        let mut is_return_memory = false;
        if let Some(dst) = dst
            && self.is_struct(dst)
        {
            let (tag, is_union) = self.struct_of(dst);
            if self.classes_of(tag, is_union)[0] == EightbyteClass::Memory {
                is_return_memory = true;
                let dst_op = self.operand(dst);
                self.emit(AsmInstruction::Lea {
                    src: dst_op,
                    dst: AsmOperand::Reg(Register::Di),
                });
            }
        }
        let stack_bytes = self.select_call_args(args, is_return_memory);
        self.emit(AsmInstruction::Call(name));
        if stack_bytes > 0 {
            self.emit(AsmInstruction::Binary {
                op: AsmBinaryOp::Add,
                ty: AsmType::QuadWord,
                src: AsmOperand::imm(
                    stack_bytes as u64,
                    (0..=127).contains(&stack_bytes),
                    false,
                    false,
                ),
                dst: AsmOperand::Reg(Register::Sp),
            });
        }

        let Some(dst) = dst else { return };
        if is_return_memory {
            return;
        }
        if self.is_double(dst) {
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Mov {
                ty: AsmType::Double,
                src: AsmOperand::Reg(Register::Xmm0),
                dst: dst_op,
            });
        } else if !self.is_struct(dst) {
            let ty = self.asm_type(dst);
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Mov {
                ty,
                src: AsmOperand::Reg(Register::Ax),
                dst: dst_op,
            });
        } else {
            let dst_name = Self::var_name(dst);
            let (tag, is_union) = self.struct_of(dst);
            let classes = self.classes_of(tag, is_union);
            let mut integer_first = false;
            match classes[0] {
                EightbyteClass::Integer => {
                    self.register_to_eightbyte(dst_name, 0, Some(tag), Register::Ax);
                    integer_first = true;
                }
                EightbyteClass::Sse => {
                    self.register_to_eightbyte(dst_name, 0, None, Register::Xmm0);
                }
                EightbyteClass::Memory => unreachable!(),
            }
            if classes.len() == 2 {
                match classes[1] {
                    EightbyteClass::Integer => {
                        let reg = if integer_first {
                            Register::Dx
                        } else {
                            Register::Ax
                        };
                        self.register_to_eightbyte(dst_name, 8, Some(tag), reg);
                    }
                    EightbyteClass::Sse => {
                        let reg = if integer_first {
                            Register::Xmm0
                        } else {
                            Register::Xmm1
                        };
                        self.register_to_eightbyte(dst_name, 8, None, reg);
                    }
                    EightbyteClass::Memory => unreachable!(),
                }
            }
        }
    }

    /// Stage call arguments into registers and onto the stack. Returns the
    /// number of stack bytes to release after the call.
    fn select_call_args(&mut self, args: &[TacValue], is_return_memory: bool) -> i64 {
        let mut int_used = if is_return_memory { 1 } else { 0 };
        let mut sse_used = 0usize;
        let mut stack_slots = 0i64;
        // Stack-bound instructions are buffered and replayed in reverse,
        // so the last argument lands deepest.
        let mut stack_buffer: Vec<AsmInstruction> = Vec::new();
        for arg in args {
            if self.is_double(arg) {
                if sse_used < 8 {
                    let src = self.operand(arg);
                    self.emit(AsmInstruction::Mov {
                        ty: AsmType::Double,
                        src,
                        dst: AsmOperand::Reg(SSE_REGISTERS[sse_used]),
                    });
                    sse_used += 1;
                } else {
                    self.buffered(&mut stack_buffer, |sel| sel.stack_arg(arg));
                    stack_slots += 1;
                }
            } else if !self.is_struct(arg) {
                if int_used < 6 {
                    let ty = self.asm_type(arg);
                    let src = self.operand(arg);
                    self.emit(AsmInstruction::Mov {
                        ty,
                        src,
                        dst: AsmOperand::Reg(ARG_REGISTERS[int_used]),
                    });
                    int_used += 1;
                } else {
                    self.buffered(&mut stack_buffer, |sel| sel.stack_arg(arg));
                    stack_slots += 1;
                }
            } else {
                let arg_name = Self::var_name(arg);
                let (tag, is_union) = self.struct_of(arg);
                let classes = self.classes_of(tag, is_union);
                let (mut need_int, mut need_sse) = (7usize, 9usize);
                if classes[0] != EightbyteClass::Memory {
                    need_int = 0;
                    need_sse = 0;
                    for class in &classes {
                        if *class == EightbyteClass::Sse {
                            need_sse += 1;
                        } else {
                            need_int += 1;
                        }
                    }
                }
                if need_int + int_used <= 6 && need_sse + sse_used <= 8 {
                    let mut offset = 0i64;
                    for class in &classes {
                        if *class == EightbyteClass::Sse {
                            self.eightbyte_to_register(
                                arg_name,
                                offset,
                                None,
                                SSE_REGISTERS[sse_used],
                            );
                            sse_used += 1;
                        } else {
                            self.eightbyte_to_register(
                                arg_name,
                                offset,
                                Some(tag),
                                ARG_REGISTERS[int_used],
                            );
                            int_used += 1;
                        }
                        offset += 8;
                    }
                } else {
                    let mut offset = 0i64;
                    for _ in &classes {
                        let at = offset;
                        self.buffered(&mut stack_buffer, |sel| {
                            sel.stack_eightbyte_arg(arg_name, at, tag)
                        });
                        offset += 8;
                        stack_slots += 1;
                    }
                }
            }
        }
        if stack_slots % 2 == 1 {
            // Keep %rsp 16-byte aligned at the call.
            self.emit(alloc_stack(8));
            stack_slots += 1;
        }
        for instruction in stack_buffer.into_iter().rev() {
            self.emit(instruction);
        }
        stack_slots * 8
    }

    /// Run `f` with emission redirected into `buffer`.
    fn buffered(&mut self, buffer: &mut Vec<AsmInstruction>, f: impl FnOnce(&mut Self)) {
        let saved = std::mem::take(&mut self.instructions);
        f(self);
        let produced = std::mem::replace(&mut self.instructions, saved);
        buffer.extend(produced);
    }

    /// One scalar argument pushed on the stack. Emitted into the buffer in
    /// reverse-replay order: a `push` first, preceded (after reversal) by
    /// any staging mov.
    fn stack_arg(&mut self, arg: &TacValue) {
        let src = self.operand(arg);
        let ty = self.asm_type(arg);
        if matches!(src, AsmOperand::Reg(_) | AsmOperand::Imm { .. })
            || matches!(ty, AsmType::QuadWord | AsmType::Double)
        {
            self.emit(AsmInstruction::Push(src));
        } else {
            // Push the whole of %rax; only the low bytes are meaningful.
            self.emit(AsmInstruction::Push(AsmOperand::Reg(Register::Ax)));
            self.emit(AsmInstruction::Mov {
                ty,
                src,
                dst: AsmOperand::Reg(Register::Ax),
            });
        }
    }

    /// One eightbyte of a stack-passed aggregate.
    fn stack_eightbyte_arg(&mut self, name: Ident, offset: i64, tag: Ident) {
        let ty = self.eightbyte_type(tag, offset);
        match ty {
            AsmType::QuadWord => {
                self.emit(AsmInstruction::Push(AsmOperand::PseudoMem { name, offset }));
            }
            AsmType::ByteArray { size, .. } => {
                // Reverse-replay order: the chunk moves first (reversed
                // again below), then the stack allocation.
                let mut moves = Vec::new();
                let mut remaining = size;
                let mut from = offset;
                let mut to = 0i64;
                while remaining > 0 {
                    let chunk = if remaining >= 4 {
                        AsmType::LongWord
                    } else {
                        AsmType::Byte
                    };
                    moves.push(AsmInstruction::Mov {
                        ty: chunk,
                        src: AsmOperand::PseudoMem { name, offset: from },
                        dst: AsmOperand::Memory {
                            base: Register::Sp,
                            offset: to,
                        },
                    });
                    from += chunk.size();
                    to += chunk.size();
                    remaining -= chunk.size();
                }
                for instruction in moves.into_iter().rev() {
                    self.emit(instruction);
                }
                self.emit(alloc_stack(8));
            }
            other => {
                self.emit(AsmInstruction::Push(AsmOperand::Reg(Register::Ax)));
                self.emit(AsmInstruction::Mov {
                    ty: other,
                    src: AsmOperand::PseudoMem { name, offset },
                    dst: AsmOperand::Reg(Register::Ax),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Unary and binary operations

    fn select_unary(&mut self, op: TacUnaryOp, src: &TacValue, dst: &TacValue) {
        match op {
            TacUnaryOp::Complement => self.unary_arithmetic(AsmUnaryOp::Not, src, dst),
            TacUnaryOp::Negate => {
                if self.is_double(src) {
                    let dst_op = self.operand(dst);
                    let src_op = self.operand(src);
                    self.emit(AsmInstruction::Mov {
                        ty: AsmType::Double,
                        src: src_op,
                        dst: dst_op.clone(),
                    });
                    let mask = self.double_constant_operand(NEG_ZERO_BITS);
                    self.emit(AsmInstruction::Binary {
                        op: AsmBinaryOp::Xor,
                        ty: AsmType::Double,
                        src: mask,
                        dst: dst_op,
                    });
                } else {
                    self.unary_arithmetic(AsmUnaryOp::Neg, src, dst);
                }
            }
            TacUnaryOp::Not => {
                if self.is_double(src) {
                    self.not_double(src, dst);
                } else {
                    self.not_integer(src, dst);
                }
            }
        }
    }

    fn unary_arithmetic(&mut self, op: AsmUnaryOp, src: &TacValue, dst: &TacValue) {
        let ty = self.asm_type(src);
        let src_op = self.operand(src);
        let dst_op = self.operand(dst);
        self.emit(AsmInstruction::Mov {
            ty,
            src: src_op,
            dst: dst_op.clone(),
        });
        self.emit(AsmInstruction::Unary {
            op,
            ty,
            dst: dst_op,
        });
    }

    fn not_integer(&mut self, src: &TacValue, dst: &TacValue) {
        let src_ty = self.asm_type(src);
        let dst_ty = self.asm_type(dst);
        let src_op = self.operand(src);
        let dst_op = self.operand(dst);
        self.emit(AsmInstruction::Cmp {
            ty: src_ty,
            src: AsmOperand::imm(0, true, false, false),
            dst: src_op,
        });
        self.emit(AsmInstruction::Mov {
            ty: dst_ty,
            src: AsmOperand::imm(0, true, false, false),
            dst: dst_op.clone(),
        });
        self.emit(AsmInstruction::SetCC {
            cc: CondCode::E,
            dst: dst_op,
        });
    }

    fn not_double(&mut self, src: &TacValue, dst: &TacValue) {
        // !x on a NaN is false: bypass the sete when the parity flag
        // reports an unordered comparison.
        let nan = self.interner.make_label("comisd_nan");
        let src_op = self.operand(src);
        let dst_op = self.operand(dst);
        self.zero_xmm0();
        self.emit(AsmInstruction::Cmp {
            ty: AsmType::Double,
            src: AsmOperand::Reg(Register::Xmm0),
            dst: src_op,
        });
        self.emit(AsmInstruction::Mov {
            ty: AsmType::LongWord,
            src: AsmOperand::imm(0, true, false, false),
            dst: dst_op.clone(),
        });
        self.emit(AsmInstruction::JmpCC {
            cc: CondCode::P,
            target: nan,
        });
        self.emit(AsmInstruction::SetCC {
            cc: CondCode::E,
            dst: dst_op,
        });
        self.emit(AsmInstruction::Label(nan));
    }

    fn zero_xmm0(&mut self) {
        self.emit(AsmInstruction::Binary {
            op: AsmBinaryOp::Xor,
            ty: AsmType::Double,
            src: AsmOperand::Reg(Register::Xmm0),
            dst: AsmOperand::Reg(Register::Xmm0),
        });
    }

    fn select_binary(&mut self, op: TacBinaryOp, src1: &TacValue, src2: &TacValue, dst: &TacValue) {
        use TacBinaryOp::*;
        match op {
            Add | Subtract | Multiply | BitAnd | BitOr | BitXor | ShiftLeft | ShiftRight
            | ShiftRightArithmetic => {
                self.binary_arithmetic(asm_binary_op(op), src1, src2, dst);
            }
            Divide => {
                if self.is_double(src1) {
                    self.binary_arithmetic(AsmBinaryOp::DivDouble, src1, src2, dst);
                } else if self.is_signed(src1) {
                    self.signed_division(src1, src2, dst, Register::Ax);
                } else {
                    self.unsigned_division(src1, src2, dst, Register::Ax);
                }
            }
            Remainder => {
                if self.is_signed(src1) {
                    self.signed_division(src1, src2, dst, Register::Dx);
                } else {
                    self.unsigned_division(src1, src2, dst, Register::Dx);
                }
            }
            Equal | NotEqual | LessThan | LessOrEqual | GreaterThan | GreaterOrEqual => {
                if self.is_double(src1) {
                    self.comparison_double(op, src1, src2, dst);
                } else {
                    self.comparison_integer(op, src1, src2, dst);
                }
            }
        }
    }

    fn binary_arithmetic(
        &mut self,
        op: AsmBinaryOp,
        src1: &TacValue,
        src2: &TacValue,
        dst: &TacValue,
    ) {
        let ty = self.asm_type(src1);
        let src1_op = self.operand(src1);
        let dst_op = self.operand(dst);
        self.emit(AsmInstruction::Mov {
            ty,
            src: src1_op,
            dst: dst_op.clone(),
        });
        let src2_op = self.operand(src2);
        self.emit(AsmInstruction::Binary {
            op,
            ty,
            src: src2_op,
            dst: dst_op,
        });
    }

    /// idiv: dividend sign-extended into DX:AX; quotient in AX, remainder
    /// in DX.
    fn signed_division(
        &mut self,
        src1: &TacValue,
        src2: &TacValue,
        dst: &TacValue,
        result_reg: Register,
    ) {
        let ty = self.asm_type(src1);
        let src1_op = self.operand(src1);
        self.emit(AsmInstruction::Mov {
            ty,
            src: src1_op,
            dst: AsmOperand::Reg(Register::Ax),
        });
        self.emit(AsmInstruction::Cdq { ty });
        let src2_op = self.operand(src2);
        self.emit(AsmInstruction::Idiv { ty, src: src2_op });
        let dst_op = self.operand(dst);
        self.emit(AsmInstruction::Mov {
            ty,
            src: AsmOperand::Reg(result_reg),
            dst: dst_op,
        });
    }

    /// div: DX zeroed instead of sign-extended.
    fn unsigned_division(
        &mut self,
        src1: &TacValue,
        src2: &TacValue,
        dst: &TacValue,
        result_reg: Register,
    ) {
        let ty = self.asm_type(src1);
        let src1_op = self.operand(src1);
        self.emit(AsmInstruction::Mov {
            ty,
            src: src1_op,
            dst: AsmOperand::Reg(Register::Ax),
        });
        self.emit(AsmInstruction::Mov {
            ty,
            src: AsmOperand::imm(0, true, false, false),
            dst: AsmOperand::Reg(Register::Dx),
        });
        let src2_op = self.operand(src2);
        self.emit(AsmInstruction::Div { ty, src: src2_op });
        let dst_op = self.operand(dst);
        self.emit(AsmInstruction::Mov {
            ty,
            src: AsmOperand::Reg(result_reg),
            dst: dst_op,
        });
    }

    fn comparison_integer(
        &mut self,
        op: TacBinaryOp,
        src1: &TacValue,
        src2: &TacValue,
        dst: &TacValue,
    ) {
        let ty = self.asm_type(src1);
        let src1_op = self.operand(src1);
        let src2_op = self.operand(src2);
        self.emit(AsmInstruction::Cmp {
            ty,
            src: src2_op,
            dst: src1_op,
        });
        let dst_ty = self.asm_type(dst);
        let dst_op = self.operand(dst);
        self.emit(AsmInstruction::Mov {
            ty: dst_ty,
            src: AsmOperand::imm(0, true, false, false),
            dst: dst_op.clone(),
        });
        let cc = if self.is_signed(src1) {
            signed_cond_code(op)
        } else {
            unsigned_cond_code(op)
        };
        self.emit(AsmInstruction::SetCC { cc, dst: dst_op });
    }

    fn comparison_double(
        &mut self,
        op: TacBinaryOp,
        src1: &TacValue,
        src2: &TacValue,
        dst: &TacValue,
    ) {
        let nan = self.interner.make_label("comisd_nan");
        let src1_op = self.operand(src1);
        let src2_op = self.operand(src2);
        let dst_op = self.operand(dst);
        self.emit(AsmInstruction::Cmp {
            ty: AsmType::Double,
            src: src2_op,
            dst: src1_op,
        });
        self.emit(AsmInstruction::Mov {
            ty: AsmType::LongWord,
            src: AsmOperand::imm(0, true, false, false),
            dst: dst_op.clone(),
        });
        self.emit(AsmInstruction::JmpCC {
            cc: CondCode::P,
            target: nan,
        });
        let cc = unsigned_cond_code(op);
        if cc == CondCode::Ne {
            // x != NaN must be true, so the NaN path sets the result with
            // sete instead of falling through as false.
            let nan_ne = self.interner.make_label("comisd_nan");
            self.emit(AsmInstruction::SetCC {
                cc,
                dst: dst_op.clone(),
            });
            self.emit(AsmInstruction::Jmp(nan_ne));
            self.emit(AsmInstruction::Label(nan));
            self.emit(AsmInstruction::SetCC {
                cc: CondCode::E,
                dst: dst_op,
            });
            self.emit(AsmInstruction::Label(nan_ne));
        } else {
            self.emit(AsmInstruction::SetCC { cc, dst: dst_op });
            self.emit(AsmInstruction::Label(nan));
        }
    }

    // ------------------------------------------------------------------
    // Copies, loads, stores

    fn select_copy(&mut self, src: &TacValue, dst: &TacValue) {
        if self.is_struct(src) {
            let src_name = Self::var_name(src);
            let dst_name = Self::var_name(dst);
            let (tag, _) = self.struct_of(src);
            let total = self.table.structs[&tag].size;
            let mut size = total;
            let mut offset = 0i64;
            while size > 0 {
                let ty = chunk_type(size);
                self.emit(AsmInstruction::Mov {
                    ty,
                    src: AsmOperand::PseudoMem {
                        name: src_name,
                        offset,
                    },
                    dst: AsmOperand::PseudoMem {
                        name: dst_name,
                        offset,
                    },
                });
                offset += ty.size();
                size -= ty.size();
            }
        } else {
            let ty = self.asm_type(src);
            let src_op = self.operand(src);
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Mov {
                ty,
                src: src_op,
                dst: dst_op,
            });
        }
    }

    fn select_get_address(&mut self, src: &TacValue, dst: &TacValue) {
        let src_op = match src {
            TacValue::Var(name)
                if matches!(
                    self.table.get(*name).map(|s| &s.attrs),
                    Some(IdentAttrs::Constant(_))
                ) =>
            {
                AsmOperand::Data {
                    name: *name,
                    offset: 0,
                }
            }
            _ => self.operand(src),
        };
        let dst_op = self.operand(dst);
        self.emit(AsmInstruction::Lea {
            src: src_op,
            dst: dst_op,
        });
    }

    fn select_load(&mut self, src_ptr: &TacValue, dst: &TacValue) {
        let ptr_op = self.operand(src_ptr);
        self.emit(AsmInstruction::Mov {
            ty: AsmType::QuadWord,
            src: ptr_op,
            dst: AsmOperand::Reg(Register::Ax),
        });
        if self.is_struct(dst) {
            let name = Self::var_name(dst);
            let (tag, _) = self.struct_of(dst);
            let total = self.table.structs[&tag].size;
            let mut size = total;
            let mut offset = 0i64;
            while size > 0 {
                let ty = chunk_type(size);
                self.emit(AsmInstruction::Mov {
                    ty,
                    src: AsmOperand::Memory {
                        base: Register::Ax,
                        offset,
                    },
                    dst: AsmOperand::PseudoMem { name, offset },
                });
                offset += ty.size();
                size -= ty.size();
            }
        } else {
            let ty = self.asm_type(dst);
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Mov {
                ty,
                src: AsmOperand::Memory {
                    base: Register::Ax,
                    offset: 0,
                },
                dst: dst_op,
            });
        }
    }

    fn select_store(&mut self, src: &TacValue, dst_ptr: &TacValue) {
        let ptr_op = self.operand(dst_ptr);
        self.emit(AsmInstruction::Mov {
            ty: AsmType::QuadWord,
            src: ptr_op,
            dst: AsmOperand::Reg(Register::Ax),
        });
        if self.is_struct(src) {
            let name = Self::var_name(src);
            let (tag, _) = self.struct_of(src);
            let total = self.table.structs[&tag].size;
            self.copy_chunks_to_memory(name, total, Register::Ax);
        } else {
            let ty = self.asm_type(src);
            let src_op = self.operand(src);
            self.emit(AsmInstruction::Mov {
                ty,
                src: src_op,
                dst: AsmOperand::Memory {
                    base: Register::Ax,
                    offset: 0,
                },
            });
        }
    }

    fn select_add_ptr(&mut self, ptr: &TacValue, index: &TacValue, scale: i64, dst: &TacValue) {
        match index {
            TacValue::Constant(c) => {
                let Const::Long(index) = *c else {
                    unreachable!("pointer index constants are long")
                };
                let ptr_op = self.operand(ptr);
                self.emit(AsmInstruction::Mov {
                    ty: AsmType::QuadWord,
                    src: ptr_op,
                    dst: AsmOperand::Reg(Register::Ax),
                });
                let dst_op = self.operand(dst);
                self.emit(AsmInstruction::Lea {
                    src: AsmOperand::Memory {
                        base: Register::Ax,
                        offset: index * scale,
                    },
                    dst: dst_op,
                });
            }
            TacValue::Var(_) => match scale {
                1 | 2 | 4 | 8 => {
                    let ptr_op = self.operand(ptr);
                    self.emit(AsmInstruction::Mov {
                        ty: AsmType::QuadWord,
                        src: ptr_op,
                        dst: AsmOperand::Reg(Register::Ax),
                    });
                    let index_op = self.operand(index);
                    self.emit(AsmInstruction::Mov {
                        ty: AsmType::QuadWord,
                        src: index_op,
                        dst: AsmOperand::Reg(Register::Dx),
                    });
                    let dst_op = self.operand(dst);
                    self.emit(AsmInstruction::Lea {
                        src: AsmOperand::Indexed {
                            base: Register::Ax,
                            index: Register::Dx,
                            scale,
                        },
                        dst: dst_op,
                    });
                }
                _ => {
                    // No addressing mode for this stride: fold the scale
                    // into the index first.
                    let ptr_op = self.operand(ptr);
                    self.emit(AsmInstruction::Mov {
                        ty: AsmType::QuadWord,
                        src: ptr_op,
                        dst: AsmOperand::Reg(Register::Ax),
                    });
                    let index_op = self.operand(index);
                    self.emit(AsmInstruction::Mov {
                        ty: AsmType::QuadWord,
                        src: index_op,
                        dst: AsmOperand::Reg(Register::Dx),
                    });
                    self.emit(AsmInstruction::Binary {
                        op: AsmBinaryOp::Mult,
                        ty: AsmType::QuadWord,
                        src: AsmOperand::imm(
                            scale as u64,
                            (-128..=127).contains(&scale),
                            scale > i32::MAX as i64 || scale < i32::MIN as i64,
                            scale < 0,
                        ),
                        dst: AsmOperand::Reg(Register::Dx),
                    });
                    let dst_op = self.operand(dst);
                    self.emit(AsmInstruction::Lea {
                        src: AsmOperand::Indexed {
                            base: Register::Ax,
                            index: Register::Dx,
                            scale: 1,
                        },
                        dst: dst_op,
                    });
                }
            },
        }
    }

    fn select_copy_to_offset(&mut self, src: &TacValue, dst_name: Ident, offset: i64) {
        if self.is_struct(src) {
            let src_name = Self::var_name(src);
            let (tag, _) = self.struct_of(src);
            let total = self.table.structs[&tag].size;
            let mut size = total;
            let mut at = 0i64;
            while size > 0 {
                let ty = chunk_type(size);
                self.emit(AsmInstruction::Mov {
                    ty,
                    src: AsmOperand::PseudoMem {
                        name: src_name,
                        offset: at,
                    },
                    dst: AsmOperand::PseudoMem {
                        name: dst_name,
                        offset: at + offset,
                    },
                });
                at += ty.size();
                size -= ty.size();
            }
        } else {
            let ty = self.asm_type(src);
            let src_op = self.operand(src);
            self.emit(AsmInstruction::Mov {
                ty,
                src: src_op,
                dst: AsmOperand::PseudoMem {
                    name: dst_name,
                    offset,
                },
            });
        }
    }

    fn select_copy_from_offset(&mut self, src_name: Ident, offset: i64, dst: &TacValue) {
        if self.is_struct(dst) {
            let dst_name = Self::var_name(dst);
            let (tag, _) = self.struct_of(dst);
            let total = self.table.structs[&tag].size;
            let mut size = total;
            let mut at = 0i64;
            while size > 0 {
                let ty = chunk_type(size);
                self.emit(AsmInstruction::Mov {
                    ty,
                    src: AsmOperand::PseudoMem {
                        name: src_name,
                        offset: at + offset,
                    },
                    dst: AsmOperand::PseudoMem {
                        name: dst_name,
                        offset: at,
                    },
                });
                at += ty.size();
                size -= ty.size();
            }
        } else {
            let ty = self.asm_type(dst);
            let dst_op = self.operand(dst);
            self.emit(AsmInstruction::Mov {
                ty,
                src: AsmOperand::PseudoMem {
                    name: src_name,
                    offset,
                },
                dst: dst_op,
            });
        }
    }

    // ------------------------------------------------------------------
    // Jumps

    fn select_jump_if_zero(&mut self, condition: &TacValue, target: Ident) {
        if self.is_double(condition) {
            let nan = self.interner.make_label("comisd_nan");
            self.zero_xmm0();
            let cond_op = self.operand(condition);
            self.emit(AsmInstruction::Cmp {
                ty: AsmType::Double,
                src: cond_op,
                dst: AsmOperand::Reg(Register::Xmm0),
            });
            self.emit(AsmInstruction::JmpCC {
                cc: CondCode::P,
                target: nan,
            });
            self.emit(AsmInstruction::JmpCC {
                cc: CondCode::E,
                target,
            });
            self.emit(AsmInstruction::Label(nan));
        } else {
            let ty = self.asm_type(condition);
            let cond_op = self.operand(condition);
            self.emit(AsmInstruction::Cmp {
                ty,
                src: AsmOperand::imm(0, true, false, false),
                dst: cond_op,
            });
            self.emit(AsmInstruction::JmpCC {
                cc: CondCode::E,
                target,
            });
        }
    }

    fn select_jump_if_not_zero(&mut self, condition: &TacValue, target: Ident) {
        if self.is_double(condition) {
            // NaN is non-zero: the unordered path also jumps (ZF is set
            // when comisd reports unordered, so je fires at the nan
            // label).
            let nan = self.interner.make_label("comisd_nan");
            let nan_ne = self.interner.make_label("comisd_nan");
            self.zero_xmm0();
            let cond_op = self.operand(condition);
            self.emit(AsmInstruction::Cmp {
                ty: AsmType::Double,
                src: cond_op,
                dst: AsmOperand::Reg(Register::Xmm0),
            });
            self.emit(AsmInstruction::JmpCC {
                cc: CondCode::P,
                target: nan,
            });
            self.emit(AsmInstruction::JmpCC {
                cc: CondCode::Ne,
                target,
            });
            self.emit(AsmInstruction::Jmp(nan_ne));
            self.emit(AsmInstruction::Label(nan));
            self.emit(AsmInstruction::JmpCC {
                cc: CondCode::E,
                target,
            });
            self.emit(AsmInstruction::Label(nan_ne));
        } else {
            let ty = self.asm_type(condition);
            let cond_op = self.operand(condition);
            self.emit(AsmInstruction::Cmp {
                ty,
                src: AsmOperand::imm(0, true, false, false),
                dst: cond_op,
            });
            self.emit(AsmInstruction::JmpCC {
                cc: CondCode::Ne,
                target,
            });
        }
    }

    // ------------------------------------------------------------------
    // Instruction dispatch

    fn select_instruction(&mut self, instruction: &TacInstruction) {
        match instruction {
            TacInstruction::Return(value) => self.select_return(value),
            TacInstruction::SignExtend { src, dst } => self.select_sign_extend(src, dst),
            TacInstruction::Truncate { src, dst } => self.select_truncate(src, dst),
            TacInstruction::ZeroExtend { src, dst } => self.select_zero_extend(src, dst),
            TacInstruction::DoubleToInt { src, dst } => self.select_double_to_int(src, dst),
            TacInstruction::DoubleToUInt { src, dst } => self.select_double_to_uint(src, dst),
            TacInstruction::IntToDouble { src, dst } => self.select_int_to_double(src, dst),
            TacInstruction::UIntToDouble { src, dst } => self.select_uint_to_double(src, dst),
            TacInstruction::FunCall { name, args, dst } => self.select_fun_call(*name, args, dst),
            TacInstruction::Unary { op, src, dst } => self.select_unary(*op, src, dst),
            TacInstruction::Binary {
                op,
                src1,
                src2,
                dst,
            } => self.select_binary(*op, src1, src2, dst),
            TacInstruction::Copy { src, dst } => self.select_copy(src, dst),
            TacInstruction::GetAddress { src, dst } => self.select_get_address(src, dst),
            TacInstruction::Load { src_ptr, dst } => self.select_load(src_ptr, dst),
            TacInstruction::Store { src, dst_ptr } => self.select_store(src, dst_ptr),
            TacInstruction::AddPtr {
                ptr,
                index,
                scale,
                dst,
            } => self.select_add_ptr(ptr, index, *scale, dst),
            TacInstruction::CopyToOffset {
                src,
                dst_name,
                offset,
            } => self.select_copy_to_offset(src, *dst_name, *offset),
            TacInstruction::CopyFromOffset {
                src_name,
                offset,
                dst,
            } => self.select_copy_from_offset(*src_name, *offset, dst),
            TacInstruction::Jump(target) => self.emit(AsmInstruction::Jmp(*target)),
            TacInstruction::JumpIfZero { condition, target } => {
                self.select_jump_if_zero(condition, *target)
            }
            TacInstruction::JumpIfNotZero { condition, target } => {
                self.select_jump_if_not_zero(condition, *target)
            }
            TacInstruction::Label(name) => self.emit(AsmInstruction::Label(*name)),
        }
    }

    // ------------------------------------------------------------------
    // Functions

    fn select_function(&mut self, f: &TacFunction) -> AsmFunction {
        self.instructions = Vec::new();
        let Type::Fun(fun_type) = &*self.table.expect(f.name).ty else {
            unreachable!("function top level without function type")
        };
        let mut is_return_memory = false;
        if let Type::Structure { tag, is_union } = &*fun_type.ret {
            if self.classes_of(*tag, *is_union)[0] == EightbyteClass::Memory {
                is_return_memory = true;
                self.emit(AsmInstruction::Mov {
                    ty: AsmType::QuadWord,
                    src: AsmOperand::Reg(Register::Di),
                    dst: AsmOperand::Memory {
                        base: Register::Bp,
                        offset: -8,
                    },
                });
            }
        }
        self.select_params(&f.params, is_return_memory);
        for instruction in &f.body {
            self.select_instruction(instruction);
        }
        AsmFunction {
            name: f.name,
            is_global: f.is_global,
            is_return_memory,
            instructions: std::mem::take(&mut self.instructions),
        }
    }

    /// Move incoming parameters out of registers (or off the caller's
    /// frame) into their pseudos.
    fn select_params(&mut self, params: &[Ident], is_return_memory: bool) {
        let mut int_used = if is_return_memory { 1 } else { 0 };
        let mut sse_used = 0usize;
        // Stack parameters start above the saved %rbp and return address.
        let mut stack_offset = 16i64;
        for &param in params {
            let ty = &self.table.expect(param).ty;
            match &**ty {
                Type::Double => {
                    if sse_used < 8 {
                        self.emit(AsmInstruction::Mov {
                            ty: AsmType::Double,
                            src: AsmOperand::Reg(SSE_REGISTERS[sse_used]),
                            dst: AsmOperand::Pseudo(param),
                        });
                        sse_used += 1;
                    } else {
                        self.emit(AsmInstruction::Mov {
                            ty: AsmType::Double,
                            src: AsmOperand::Memory {
                                base: Register::Bp,
                                offset: stack_offset,
                            },
                            dst: AsmOperand::Pseudo(param),
                        });
                        stack_offset += 8;
                    }
                }
                Type::Structure { tag, is_union } => {
                    let (tag, is_union) = (*tag, *is_union);
                    let classes = self.classes_of(tag, is_union);
                    let (mut need_int, mut need_sse) = (7usize, 9usize);
                    if classes[0] != EightbyteClass::Memory {
                        need_int = 0;
                        need_sse = 0;
                        for class in &classes {
                            if *class == EightbyteClass::Sse {
                                need_sse += 1;
                            } else {
                                need_int += 1;
                            }
                        }
                    }
                    if need_int + int_used <= 6 && need_sse + sse_used <= 8 {
                        let mut offset = 0i64;
                        for class in &classes {
                            if *class == EightbyteClass::Sse {
                                self.register_to_eightbyte(
                                    param,
                                    offset,
                                    None,
                                    SSE_REGISTERS[sse_used],
                                );
                                sse_used += 1;
                            } else {
                                self.register_to_eightbyte(
                                    param,
                                    offset,
                                    Some(tag),
                                    ARG_REGISTERS[int_used],
                                );
                                int_used += 1;
                            }
                            offset += 8;
                        }
                    } else {
                        let mut offset = 0i64;
                        for _ in &classes {
                            self.stack_param_eightbyte(param, stack_offset, offset, tag);
                            stack_offset += 8;
                            offset += 8;
                        }
                    }
                }
                _ => {
                    let asm_ty = asm_type_of(self.table, ty);
                    if int_used < 6 {
                        self.emit(AsmInstruction::Mov {
                            ty: asm_ty,
                            src: AsmOperand::Reg(ARG_REGISTERS[int_used]),
                            dst: AsmOperand::Pseudo(param),
                        });
                        int_used += 1;
                    } else {
                        self.emit(AsmInstruction::Mov {
                            ty: asm_ty,
                            src: AsmOperand::Memory {
                                base: Register::Bp,
                                offset: stack_offset,
                            },
                            dst: AsmOperand::Pseudo(param),
                        });
                        stack_offset += 8;
                    }
                }
            }
        }
    }

    /// One eightbyte of a stack-passed aggregate parameter, copied from
    /// the caller's frame into the parameter's pseudo-memory.
    fn stack_param_eightbyte(&mut self, name: Ident, stack_offset: i64, offset: i64, tag: Ident) {
        let ty = self.eightbyte_type(tag, offset);
        if let AsmType::ByteArray { size, .. } = ty {
            let mut remaining = size;
            let mut from = stack_offset;
            let mut to = offset;
            while remaining > 0 {
                let chunk = if remaining >= 4 {
                    AsmType::LongWord
                } else {
                    AsmType::Byte
                };
                self.emit(AsmInstruction::Mov {
                    ty: chunk,
                    src: AsmOperand::Memory {
                        base: Register::Bp,
                        offset: from,
                    },
                    dst: AsmOperand::PseudoMem { name, offset: to },
                });
                from += chunk.size();
                to += chunk.size();
                remaining -= chunk.size();
            }
        } else {
            self.emit(AsmInstruction::Mov {
                ty,
                src: AsmOperand::Memory {
                    base: Register::Bp,
                    offset: stack_offset,
                },
                dst: AsmOperand::PseudoMem { name, offset },
            });
        }
    }
}

// ----------------------------------------------------------------------
// Free helpers

/// Largest move width that fits the remaining byte count.
fn chunk_type(remaining: i64) -> AsmType {
    if remaining >= 8 {
        AsmType::QuadWord
    } else if remaining >= 4 {
        AsmType::LongWord
    } else {
        AsmType::Byte
    }
}

pub fn alloc_stack(bytes: i64) -> AsmInstruction {
    AsmInstruction::Binary {
        op: AsmBinaryOp::Sub,
        ty: AsmType::QuadWord,
        src: AsmOperand::imm(
            bytes as u64,
            (-128..=127).contains(&bytes),
            bytes > i32::MAX as i64 || bytes < i32::MIN as i64,
            bytes < 0,
        ),
        dst: AsmOperand::Reg(Register::Sp),
    }
}

fn asm_binary_op(op: TacBinaryOp) -> AsmBinaryOp {
    match op {
        TacBinaryOp::Add => AsmBinaryOp::Add,
        TacBinaryOp::Subtract => AsmBinaryOp::Sub,
        TacBinaryOp::Multiply => AsmBinaryOp::Mult,
        TacBinaryOp::BitAnd => AsmBinaryOp::And,
        TacBinaryOp::BitOr => AsmBinaryOp::Or,
        TacBinaryOp::BitXor => AsmBinaryOp::Xor,
        TacBinaryOp::ShiftLeft => AsmBinaryOp::Shl,
        TacBinaryOp::ShiftRight => AsmBinaryOp::Shr,
        TacBinaryOp::ShiftRightArithmetic => AsmBinaryOp::Sar,
        _ => unreachable!("not a plain arithmetic operator"),
    }
}

fn signed_cond_code(op: TacBinaryOp) -> CondCode {
    match op {
        TacBinaryOp::Equal => CondCode::E,
        TacBinaryOp::NotEqual => CondCode::Ne,
        TacBinaryOp::LessThan => CondCode::L,
        TacBinaryOp::LessOrEqual => CondCode::Le,
        TacBinaryOp::GreaterThan => CondCode::G,
        TacBinaryOp::GreaterOrEqual => CondCode::Ge,
        _ => unreachable!("not a comparison operator"),
    }
}

fn unsigned_cond_code(op: TacBinaryOp) -> CondCode {
    match op {
        TacBinaryOp::Equal => CondCode::E,
        TacBinaryOp::NotEqual => CondCode::Ne,
        TacBinaryOp::LessThan => CondCode::B,
        TacBinaryOp::LessOrEqual => CondCode::Be,
        TacBinaryOp::GreaterThan => CondCode::A,
        TacBinaryOp::GreaterOrEqual => CondCode::Ae,
        _ => unreachable!("not a comparison operator"),
    }
}
