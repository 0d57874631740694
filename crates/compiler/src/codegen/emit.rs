//! GNU assembler text emission
//!
//! A pure pretty printer over the fixed assembly IR: it never changes
//! semantics. AT&T syntax, source before destination, size-suffixed
//! mnemonics, `%`-prefixed registers rendered at the operand width.
//! Platform differences (symbol prefixes, local-label prefixes, read-only
//! sections, `@PLT`) come from the [`Target`].

use crate::codegen::asm::*;
use crate::codegen::error::CodegenError;
use crate::codegen::platform::Target;
use crate::codegen::symtab::{BackendSymbol, BackendTable};
use crate::intern::{Ident, Interner};
use crate::symbols::StaticInit;
use std::fmt::Write;

pub fn emit_program(
    program: &AsmProgram,
    backend: &BackendTable,
    interner: &Interner,
    target: Target,
) -> Result<String, CodegenError> {
    let mut emitter = Emitter {
        backend,
        interner,
        target,
        out: String::new(),
    };
    for constant in &program.static_constants {
        emitter.static_constant(constant)?;
    }
    for variable in &program.static_variables {
        emitter.static_variable(variable)?;
    }
    for function in &program.functions {
        emitter.function(function)?;
    }
    if target.is_elf() {
        writeln!(emitter.out, "        .section .note.GNU-stack,\"\",@progbits")?;
    }
    Ok(emitter.out)
}

struct Emitter<'a> {
    backend: &'a BackendTable,
    interner: &'a Interner,
    target: Target,
    out: String,
}

fn reg_1byte(reg: Register) -> &'static str {
    match reg {
        Register::Ax => "%al",
        Register::Bx => "%bl",
        Register::Cx => "%cl",
        Register::Dx => "%dl",
        Register::Di => "%dil",
        Register::Si => "%sil",
        Register::R8 => "%r8b",
        Register::R9 => "%r9b",
        Register::R10 => "%r10b",
        Register::R11 => "%r11b",
        Register::R12 => "%r12b",
        Register::R13 => "%r13b",
        Register::R14 => "%r14b",
        Register::R15 => "%r15b",
        other => reg_sse_or_frame(other),
    }
}

fn reg_4byte(reg: Register) -> &'static str {
    match reg {
        Register::Ax => "%eax",
        Register::Bx => "%ebx",
        Register::Cx => "%ecx",
        Register::Dx => "%edx",
        Register::Di => "%edi",
        Register::Si => "%esi",
        Register::R8 => "%r8d",
        Register::R9 => "%r9d",
        Register::R10 => "%r10d",
        Register::R11 => "%r11d",
        Register::R12 => "%r12d",
        Register::R13 => "%r13d",
        Register::R14 => "%r14d",
        Register::R15 => "%r15d",
        other => reg_sse_or_frame(other),
    }
}

fn reg_8byte(reg: Register) -> &'static str {
    match reg {
        Register::Ax => "%rax",
        Register::Bx => "%rbx",
        Register::Cx => "%rcx",
        Register::Dx => "%rdx",
        Register::Di => "%rdi",
        Register::Si => "%rsi",
        Register::R8 => "%r8",
        Register::R9 => "%r9",
        Register::R10 => "%r10",
        Register::R11 => "%r11",
        Register::R12 => "%r12",
        Register::R13 => "%r13",
        Register::R14 => "%r14",
        Register::R15 => "%r15",
        other => reg_sse_or_frame(other),
    }
}

fn reg_sse_or_frame(reg: Register) -> &'static str {
    match reg {
        Register::Sp => "%rsp",
        Register::Bp => "%rbp",
        Register::Xmm0 => "%xmm0",
        Register::Xmm1 => "%xmm1",
        Register::Xmm2 => "%xmm2",
        Register::Xmm3 => "%xmm3",
        Register::Xmm4 => "%xmm4",
        Register::Xmm5 => "%xmm5",
        Register::Xmm6 => "%xmm6",
        Register::Xmm7 => "%xmm7",
        Register::Xmm8 => "%xmm8",
        Register::Xmm9 => "%xmm9",
        Register::Xmm10 => "%xmm10",
        Register::Xmm11 => "%xmm11",
        Register::Xmm12 => "%xmm12",
        Register::Xmm13 => "%xmm13",
        Register::Xmm14 => "%xmm14",
        Register::Xmm15 => "%xmm15",
        _ => unreachable!("general-purpose register in SSE table"),
    }
}

fn cond_code(cc: CondCode) -> &'static str {
    match cc {
        CondCode::E => "e",
        CondCode::Ne => "ne",
        CondCode::L => "l",
        CondCode::Le => "le",
        CondCode::G => "g",
        CondCode::Ge => "ge",
        CondCode::B => "b",
        CondCode::Be => "be",
        CondCode::A => "a",
        CondCode::Ae => "ae",
        CondCode::P => "p",
    }
}

/// Operand width in bytes for register rendering.
fn type_bytes(ty: AsmType) -> i32 {
    match ty {
        AsmType::Byte => 1,
        AsmType::LongWord => 4,
        AsmType::QuadWord | AsmType::Double => 8,
        AsmType::ByteArray { .. } => unreachable!("byte array rendered as an operand"),
    }
}

/// Mnemonic size suffix. xorpd of two doubles is the packed form.
fn type_suffix(ty: AsmType, packed: bool) -> &'static str {
    match ty {
        AsmType::Byte => "b",
        AsmType::LongWord => "l",
        AsmType::QuadWord => "q",
        AsmType::Double => {
            if packed {
                "pd"
            } else {
                "sd"
            }
        }
        AsmType::ByteArray { .. } => unreachable!("byte array rendered as a mnemonic suffix"),
    }
}

fn unary_mnemonic(op: AsmUnaryOp) -> &'static str {
    match op {
        AsmUnaryOp::Neg => "neg",
        AsmUnaryOp::Not => "not",
        AsmUnaryOp::Shr => "shr",
    }
}

fn binary_mnemonic(op: AsmBinaryOp, is_double: bool) -> &'static str {
    match op {
        AsmBinaryOp::Add => "add",
        AsmBinaryOp::Sub => "sub",
        AsmBinaryOp::Mult => {
            if is_double {
                "mul"
            } else {
                "imul"
            }
        }
        AsmBinaryOp::DivDouble => "div",
        AsmBinaryOp::And => "and",
        AsmBinaryOp::Or => "or",
        AsmBinaryOp::Xor => "xor",
        AsmBinaryOp::Shl => "shl",
        AsmBinaryOp::Shr => "shr",
        AsmBinaryOp::Sar => "sar",
    }
}

impl<'a> Emitter<'a> {
    /// A C-visible symbol, platform prefix applied.
    fn symbol(&mut self, name: Ident) -> Result<(), CodegenError> {
        write!(
            self.out,
            "{}{}",
            self.target.symbol_prefix(),
            self.interner.lookup(name)
        )?;
        Ok(())
    }

    /// An assembler-local label.
    fn local_label(&mut self, name: Ident) -> Result<(), CodegenError> {
        write!(
            self.out,
            "{}{}{}",
            self.target.label_prefix(),
            self.target.symbol_prefix(),
            self.interner.lookup(name)
        )?;
        Ok(())
    }

    fn operand(&mut self, operand: &AsmOperand, bytes: i32) -> Result<(), CodegenError> {
        match operand {
            AsmOperand::Imm { value, is_neg, .. } => {
                if *is_neg {
                    write!(self.out, "${}", *value as i64)?;
                } else {
                    write!(self.out, "${}", value)?;
                }
            }
            AsmOperand::Reg(reg) => {
                let name = match bytes {
                    1 => reg_1byte(*reg),
                    4 => reg_4byte(*reg),
                    8 => reg_8byte(*reg),
                    _ => unreachable!("unsupported operand width"),
                };
                self.out.push_str(name);
            }
            AsmOperand::Memory { base, offset } => {
                if *offset != 0 {
                    write!(self.out, "{}", offset)?;
                }
                write!(self.out, "({})", reg_8byte(*base))?;
            }
            AsmOperand::Data { name, offset } => {
                let is_const = matches!(
                    self.backend.symbols.get(name),
                    Some(BackendSymbol::Obj { is_const: true, .. })
                );
                if is_const {
                    write!(self.out, "{}", self.target.label_prefix())?;
                }
                self.symbol(*name)?;
                if *offset != 0 {
                    write!(self.out, "+{}", offset)?;
                }
                write!(self.out, "(%rip)")?;
            }
            AsmOperand::Indexed { base, index, scale } => {
                write!(
                    self.out,
                    "({}, {}, {})",
                    reg_8byte(*base),
                    reg_8byte(*index),
                    scale
                )?;
            }
            AsmOperand::Pseudo(_) | AsmOperand::PseudoMem { .. } => {
                unreachable!("pseudo operand survived the fix-up pass")
            }
        }
        Ok(())
    }

    fn instruction(&mut self, instruction: &AsmInstruction) -> Result<(), CodegenError> {
        match instruction {
            AsmInstruction::Mov { ty, src, dst } => {
                write!(self.out, "        mov{} ", type_suffix(*ty, false))?;
                let bytes = type_bytes(*ty);
                self.operand(src, bytes)?;
                write!(self.out, ", ")?;
                self.operand(dst, bytes)?;
                writeln!(self.out)?;
            }
            AsmInstruction::MovSx {
                src_ty,
                dst_ty,
                src,
                dst,
            } => {
                write!(
                    self.out,
                    "        movs{}{} ",
                    type_suffix(*src_ty, false),
                    type_suffix(*dst_ty, false)
                )?;
                self.operand(src, type_bytes(*src_ty))?;
                write!(self.out, ", ")?;
                self.operand(dst, type_bytes(*dst_ty))?;
                writeln!(self.out)?;
            }
            AsmInstruction::MovZeroExtend {
                dst_ty, src, dst, ..
            } => {
                write!(self.out, "        movzb{} ", type_suffix(*dst_ty, false))?;
                self.operand(src, 1)?;
                write!(self.out, ", ")?;
                self.operand(dst, type_bytes(*dst_ty))?;
                writeln!(self.out)?;
            }
            AsmInstruction::Lea { src, dst } => {
                write!(self.out, "        leaq ")?;
                self.operand(src, 8)?;
                write!(self.out, ", ")?;
                self.operand(dst, 8)?;
                writeln!(self.out)?;
            }
            AsmInstruction::Cvttsd2si { ty, src, dst } => {
                write!(self.out, "        cvttsd2si{} ", type_suffix(*ty, false))?;
                let bytes = type_bytes(*ty);
                self.operand(src, bytes)?;
                write!(self.out, ", ")?;
                self.operand(dst, bytes)?;
                writeln!(self.out)?;
            }
            AsmInstruction::Cvtsi2sd { ty, src, dst } => {
                write!(self.out, "        cvtsi2sd{} ", type_suffix(*ty, false))?;
                let bytes = type_bytes(*ty);
                self.operand(src, bytes)?;
                write!(self.out, ", ")?;
                self.operand(dst, bytes)?;
                writeln!(self.out)?;
            }
            AsmInstruction::Unary { op, ty, dst } => {
                write!(
                    self.out,
                    "        {}{} ",
                    unary_mnemonic(*op),
                    type_suffix(*ty, false)
                )?;
                self.operand(dst, type_bytes(*ty))?;
                writeln!(self.out)?;
            }
            AsmInstruction::Binary { op, ty, src, dst } => {
                let is_double = *ty == AsmType::Double;
                let packed = is_double && *op == AsmBinaryOp::Xor;
                write!(
                    self.out,
                    "        {}{} ",
                    binary_mnemonic(*op, is_double),
                    type_suffix(*ty, packed)
                )?;
                let bytes = type_bytes(*ty);
                // Shift counts are a byte register or an immediate.
                let src_bytes = match op {
                    AsmBinaryOp::Shl | AsmBinaryOp::Shr | AsmBinaryOp::Sar => 1,
                    _ => bytes,
                };
                self.operand(src, src_bytes)?;
                write!(self.out, ", ")?;
                self.operand(dst, bytes)?;
                writeln!(self.out)?;
            }
            AsmInstruction::Cmp { ty, src, dst } => {
                if *ty == AsmType::Double {
                    write!(self.out, "        comisd ")?;
                } else {
                    write!(self.out, "        cmp{} ", type_suffix(*ty, false))?;
                }
                let bytes = type_bytes(*ty);
                self.operand(src, bytes)?;
                write!(self.out, ", ")?;
                self.operand(dst, bytes)?;
                writeln!(self.out)?;
            }
            AsmInstruction::Idiv { ty, src } => {
                write!(self.out, "        idiv{} ", type_suffix(*ty, false))?;
                self.operand(src, type_bytes(*ty))?;
                writeln!(self.out)?;
            }
            AsmInstruction::Div { ty, src } => {
                write!(self.out, "        div{} ", type_suffix(*ty, false))?;
                self.operand(src, type_bytes(*ty))?;
                writeln!(self.out)?;
            }
            AsmInstruction::Cdq { ty } => match ty {
                AsmType::LongWord => writeln!(self.out, "        cdq")?,
                AsmType::QuadWord => writeln!(self.out, "        cqo")?,
                _ => unreachable!("cdq of a non-integer width"),
            },
            AsmInstruction::Jmp(target) => {
                write!(self.out, "        jmp ")?;
                self.local_label(*target)?;
                writeln!(self.out)?;
            }
            AsmInstruction::JmpCC { cc, target } => {
                write!(self.out, "        j{} ", cond_code(*cc))?;
                self.local_label(*target)?;
                writeln!(self.out)?;
            }
            AsmInstruction::SetCC { cc, dst } => {
                write!(self.out, "        set{} ", cond_code(*cc))?;
                self.operand(dst, 1)?;
                writeln!(self.out)?;
            }
            AsmInstruction::Label(name) => {
                write!(self.out, "    ")?;
                self.local_label(*name)?;
                writeln!(self.out, ":")?;
            }
            AsmInstruction::Push(src) => {
                write!(self.out, "        pushq ")?;
                self.operand(src, 8)?;
                writeln!(self.out)?;
            }
            AsmInstruction::Pop(reg) => {
                writeln!(self.out, "        popq {}", reg_8byte(*reg))?;
            }
            AsmInstruction::Call(name) => {
                write!(self.out, "        call ")?;
                self.symbol(*name)?;
                if self.target.is_elf() {
                    let BackendSymbol::Fun { is_defined, .. } = self.backend.expect(*name) else {
                        unreachable!("call target is not a function")
                    };
                    if !is_defined {
                        write!(self.out, "@PLT")?;
                    }
                }
                writeln!(self.out)?;
            }
            AsmInstruction::Ret => {
                writeln!(self.out, "    movq %rbp, %rsp")?;
                writeln!(self.out, "    popq %rbp")?;
                writeln!(self.out, "    ret")?;
            }
        }
        Ok(())
    }

    fn global_directive(&mut self, name: Ident, is_global: bool) -> Result<(), CodegenError> {
        if is_global {
            write!(self.out, "    .globl ")?;
            self.symbol(name)?;
            writeln!(self.out)?;
        }
        Ok(())
    }

    fn function(&mut self, function: &AsmFunction) -> Result<(), CodegenError> {
        writeln!(self.out)?;
        self.global_directive(function.name, function.is_global)?;
        writeln!(self.out, "    .text")?;
        self.symbol(function.name)?;
        writeln!(self.out, ":")?;
        writeln!(self.out, "    pushq %rbp")?;
        writeln!(self.out, "    movq %rsp, %rbp")?;
        for instruction in &function.instructions {
            self.instruction(instruction)?;
        }
        Ok(())
    }

    fn alignment_directive(&mut self, alignment: i32) -> Result<(), CodegenError> {
        if alignment > 1 {
            writeln!(self.out, "    .balign {}", alignment)?;
        }
        Ok(())
    }

    fn static_init(&mut self, init: &StaticInit) -> Result<(), CodegenError> {
        match init {
            StaticInit::Char(v) => writeln!(self.out, "        .byte {}", v)?,
            StaticInit::UChar(v) => writeln!(self.out, "        .byte {}", v)?,
            StaticInit::Int(v) => writeln!(self.out, "        .long {}", v)?,
            StaticInit::UInt(v) => writeln!(self.out, "        .long {}", v)?,
            StaticInit::Long(v) => writeln!(self.out, "        .quad {}", v)?,
            StaticInit::ULong(v) => writeln!(self.out, "        .quad {}", v)?,
            StaticInit::Double { bits } => writeln!(self.out, "        .quad {}", bits)?,
            StaticInit::Zero { bytes } => writeln!(self.out, "        .zero {}", bytes)?,
            StaticInit::String {
                bytes,
                null_terminated,
            } => {
                let directive = if *null_terminated { ".asciz" } else { ".ascii" };
                write!(self.out, "        {} \"", directive)?;
                for &byte in bytes {
                    match byte {
                        b'"' => self.out.push_str("\\\""),
                        b'\\' => self.out.push_str("\\\\"),
                        b'\n' => self.out.push_str("\\n"),
                        b'\t' => self.out.push_str("\\t"),
                        b'\r' => self.out.push_str("\\r"),
                        0x20..=0x7e => self.out.push(byte as char),
                        other => write!(self.out, "\\{:03o}", other)?,
                    }
                }
                writeln!(self.out, "\"")?;
            }
            StaticInit::Pointer { label } => {
                write!(self.out, "        .quad {}", self.target.label_prefix())?;
                self.symbol(*label)?;
                writeln!(self.out)?;
            }
        }
        Ok(())
    }

    fn static_variable(&mut self, variable: &AsmStaticVariable) -> Result<(), CodegenError> {
        writeln!(self.out)?;
        self.global_directive(variable.name, variable.is_global)?;
        // All-zero data goes to .bss.
        if variable.inits.len() == 1 && matches!(variable.inits[0], StaticInit::Zero { .. }) {
            writeln!(self.out, "    .bss")?;
        } else {
            writeln!(self.out, "    .data")?;
        }
        self.alignment_directive(variable.alignment)?;
        self.symbol(variable.name)?;
        writeln!(self.out, ":")?;
        for init in &variable.inits {
            self.static_init(init)?;
        }
        Ok(())
    }

    fn static_constant(&mut self, constant: &AsmStaticConstant) -> Result<(), CodegenError> {
        writeln!(self.out)?;
        match self.target {
            Target::Linux => {
                writeln!(self.out, "    .section .rodata")?;
                self.alignment_directive(constant.alignment)?;
            }
            Target::Darwin => match &constant.init {
                StaticInit::Double { .. } => {
                    match constant.alignment {
                        8 => {
                            writeln!(self.out, "    .literal8")?;
                            writeln!(self.out, "    .balign 8")?;
                        }
                        16 => {
                            writeln!(self.out, "    .literal16")?;
                            writeln!(self.out, "    .balign 16")?;
                        }
                        other => {
                            return Err(CodegenError::Logic(format!(
                                "double constant with alignment {}",
                                other
                            )));
                        }
                    }
                }
                StaticInit::String { .. } => {
                    writeln!(self.out, "    .cstring")?;
                }
                _ => {
                    return Err(CodegenError::Logic(
                        "unexpected static constant initializer".to_string(),
                    ));
                }
            },
        }
        write!(self.out, "{}", self.target.label_prefix())?;
        self.symbol(constant.name)?;
        writeln!(self.out, ":")?;
        self.static_init(&constant.init)?;
        if self.target == Target::Darwin
            && matches!(constant.init, StaticInit::Double { .. })
            && constant.alignment == 16
        {
            writeln!(self.out, "        .quad 0")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit_one(instruction: AsmInstruction) -> String {
        let interner = Interner::new();
        let backend = BackendTable::default();
        let mut emitter = Emitter {
            backend: &backend,
            interner: &interner,
            target: Target::Linux,
            out: String::new(),
        };
        emitter.instruction(&instruction).unwrap();
        emitter.out
    }

    #[test]
    fn mov_renders_att_order_and_width() {
        let text = emit_one(AsmInstruction::Mov {
            ty: AsmType::LongWord,
            src: AsmOperand::imm(42, false, false, false),
            dst: AsmOperand::Reg(Register::Ax),
        });
        assert_eq!(text, "        movl $42, %eax\n");
    }

    #[test]
    fn negative_immediates_render_signed() {
        let text = emit_one(AsmInstruction::Mov {
            ty: AsmType::QuadWord,
            src: AsmOperand::imm((-5i64) as u64, true, false, true),
            dst: AsmOperand::Reg(Register::Ax),
        });
        assert_eq!(text, "        movq $-5, %rax\n");
    }

    #[test]
    fn registers_render_at_operand_width() {
        let text = emit_one(AsmInstruction::Mov {
            ty: AsmType::Byte,
            src: AsmOperand::Reg(Register::Di),
            dst: AsmOperand::Memory {
                base: Register::Bp,
                offset: -1,
            },
        });
        assert_eq!(text, "        movb %dil, -1(%rbp)\n");
    }

    #[test]
    fn indexed_operand_shape() {
        let text = emit_one(AsmInstruction::Lea {
            src: AsmOperand::Indexed {
                base: Register::Ax,
                index: Register::Dx,
                scale: 4,
            },
            dst: AsmOperand::Reg(Register::Ax),
        });
        assert_eq!(text, "        leaq (%rax, %rdx, 4), %rax\n");
    }

    #[test]
    fn comisd_replaces_cmp_for_doubles() {
        let text = emit_one(AsmInstruction::Cmp {
            ty: AsmType::Double,
            src: AsmOperand::Reg(Register::Xmm1),
            dst: AsmOperand::Reg(Register::Xmm0),
        });
        assert_eq!(text, "        comisd %xmm1, %xmm0\n");
    }

    #[test]
    fn packed_xor_for_double_negation() {
        let text = emit_one(AsmInstruction::Binary {
            op: AsmBinaryOp::Xor,
            ty: AsmType::Double,
            src: AsmOperand::Reg(Register::Xmm0),
            dst: AsmOperand::Reg(Register::Xmm0),
        });
        assert_eq!(text, "        xorpd %xmm0, %xmm0\n");
    }

    #[test]
    fn shift_count_renders_as_byte_register() {
        let text = emit_one(AsmInstruction::Binary {
            op: AsmBinaryOp::Shl,
            ty: AsmType::QuadWord,
            src: AsmOperand::Reg(Register::Cx),
            dst: AsmOperand::Reg(Register::Ax),
        });
        assert_eq!(text, "        shlq %cl, %rax\n");
    }

    #[test]
    fn cdq_and_cqo() {
        assert_eq!(
            emit_one(AsmInstruction::Cdq {
                ty: AsmType::LongWord
            }),
            "        cdq\n"
        );
        assert_eq!(
            emit_one(AsmInstruction::Cdq {
                ty: AsmType::QuadWord
            }),
            "        cqo\n"
        );
    }

    #[test]
    fn ret_expands_to_the_epilogue() {
        assert_eq!(
            emit_one(AsmInstruction::Ret),
            "    movq %rbp, %rsp\n    popq %rbp\n    ret\n"
        );
    }

    #[test]
    fn undefined_elf_calls_use_plt() {
        let mut interner = Interner::new();
        let callee = interner.intern("putchar");
        let mut backend = BackendTable::default();
        backend.symbols.insert(
            callee,
            BackendSymbol::Fun {
                is_defined: false,
                callee_saved: Vec::new(),
            },
        );
        let mut emitter = Emitter {
            backend: &backend,
            interner: &interner,
            target: Target::Linux,
            out: String::new(),
        };
        emitter.instruction(&AsmInstruction::Call(callee)).unwrap();
        assert_eq!(emitter.out, "        call putchar@PLT\n");
    }

    #[test]
    fn string_initializers_escape_bytes() {
        let interner = Interner::new();
        let backend = BackendTable::default();
        let mut emitter = Emitter {
            backend: &backend,
            interner: &interner,
            target: Target::Linux,
            out: String::new(),
        };
        emitter
            .static_init(&StaticInit::String {
                bytes: b"a\"b\\c\nd\x01".to_vec(),
                null_terminated: true,
            })
            .unwrap();
        assert_eq!(emitter.out, "        .asciz \"a\\\"b\\\\c\\nd\\001\"\n");
    }
}
