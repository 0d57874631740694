//! Stack fix-up and instruction legalization
//!
//! Two per-function phases, applied instruction by instruction:
//!
//! 1. **Pseudo replacement**: every `Pseudo`/`PseudoMem` either refers to
//!    a static object (rewritten as a `Data` reference) or gets a stack
//!    slot: a running byte cursor advances by the operand's size and is
//!    rounded up to its alignment, and the operand becomes
//!    `-cursor(%rbp)`.
//!
//! 2. **Legalization**: each x86-illegal operand combination is rewritten
//!    by staging through scratch registers: R10 for sources, R11 for
//!    destinations, CL for shift counts, XMM14/XMM15 for doubles. Quadword
//!    immediates survive only as `mov`s into registers; memory-to-memory
//!    moves, compares and ALU ops are split; `imul` never writes memory;
//!    `movzx` of a 4-byte source decays to a plain `mov` (the hardware
//!    zero-extends 32-bit writes).
//!
//! Afterwards the frame allocation is sized (`round16(locals + saved
//! registers) - saved registers`) and inserted at the top, with
//! callee-saved pushes after it and pops mirrored before each `ret`.

use crate::codegen::asm::*;
use crate::codegen::isel::alloc_stack;
use crate::codegen::symtab::{BackendSymbol, BackendTable};
use crate::intern::Ident;
use std::collections::HashMap;

pub fn fix_stack(program: &mut AsmProgram, backend: &mut BackendTable) {
    for function in &mut program.functions {
        fix_function(function, backend);
    }
}

struct StackFrame<'a> {
    backend: &'a BackendTable,
    stack_bytes: i64,
    slots: HashMap<Ident, i64>,
}

impl<'a> StackFrame<'a> {
    /// Advance the cursor by `size`, then round it up to `alignment`.
    fn allocate(&mut self, size: i64, alignment: i64) -> i64 {
        self.stack_bytes += size;
        let rem = self.stack_bytes % alignment;
        if rem != 0 {
            self.stack_bytes += alignment - rem;
        }
        self.stack_bytes
    }

    fn slot_for(&mut self, name: Ident, ty: &AsmType) -> i64 {
        if let Some(&slot) = self.slots.get(&name) {
            return slot;
        }
        let slot = match ty {
            AsmType::Byte => self.allocate(1, 1),
            AsmType::LongWord => self.allocate(4, 4),
            AsmType::QuadWord | AsmType::Double => self.allocate(8, 8),
            AsmType::ByteArray { size, alignment } => self.allocate(*size, *alignment as i64),
        };
        self.slots.insert(name, slot);
        slot
    }

    /// Concrete operand for a pseudo: a data reference for statics, a
    /// frame slot otherwise.
    fn replace(&mut self, operand: &mut AsmOperand) {
        match *operand {
            AsmOperand::Pseudo(name) => {
                let (ty, is_static, _) = self.backend.expect_obj(name);
                if is_static {
                    *operand = AsmOperand::Data { name, offset: 0 };
                } else {
                    let ty = *ty;
                    let slot = self.slot_for(name, &ty);
                    *operand = AsmOperand::Memory {
                        base: Register::Bp,
                        offset: -slot,
                    };
                }
            }
            AsmOperand::PseudoMem { name, offset } => {
                let (ty, is_static, _) = self.backend.expect_obj(name);
                if is_static {
                    *operand = AsmOperand::Data { name, offset };
                } else {
                    let ty = *ty;
                    let slot = self.slot_for(name, &ty);
                    *operand = AsmOperand::Memory {
                        base: Register::Bp,
                        offset: -(slot - offset),
                    };
                }
            }
            _ => {}
        }
    }

    fn replace_instruction(&mut self, instruction: &mut AsmInstruction) {
        match instruction {
            AsmInstruction::Mov { src, dst, .. }
            | AsmInstruction::MovSx { src, dst, .. }
            | AsmInstruction::MovZeroExtend { src, dst, .. }
            | AsmInstruction::Lea { src, dst }
            | AsmInstruction::Cvttsd2si { src, dst, .. }
            | AsmInstruction::Cvtsi2sd { src, dst, .. }
            | AsmInstruction::Binary { src, dst, .. }
            | AsmInstruction::Cmp { src, dst, .. } => {
                self.replace(src);
                self.replace(dst);
            }
            AsmInstruction::Unary { dst, .. } | AsmInstruction::SetCC { dst, .. } => {
                self.replace(dst);
            }
            AsmInstruction::Idiv { src, .. }
            | AsmInstruction::Div { src, .. }
            | AsmInstruction::Push(src) => {
                self.replace(src);
            }
            _ => {}
        }
    }
}

/// Registers named by the body that the function must preserve.
fn collect_callee_saved(instructions: &[AsmInstruction]) -> Vec<Register> {
    let mut saved = Vec::new();
    let mut note = |operand: &AsmOperand| {
        if let AsmOperand::Reg(reg) = operand
            && reg.is_callee_saved()
            && !saved.contains(reg)
        {
            saved.push(*reg);
        }
    };
    for instruction in instructions {
        match instruction {
            AsmInstruction::Mov { src, dst, .. }
            | AsmInstruction::MovSx { src, dst, .. }
            | AsmInstruction::MovZeroExtend { src, dst, .. }
            | AsmInstruction::Lea { src, dst }
            | AsmInstruction::Cvttsd2si { src, dst, .. }
            | AsmInstruction::Cvtsi2sd { src, dst, .. }
            | AsmInstruction::Binary { src, dst, .. }
            | AsmInstruction::Cmp { src, dst, .. } => {
                note(src);
                note(dst);
            }
            AsmInstruction::Unary { dst, .. } | AsmInstruction::SetCC { dst, .. } => note(dst),
            AsmInstruction::Idiv { src, .. }
            | AsmInstruction::Div { src, .. }
            | AsmInstruction::Push(src) => note(src),
            _ => {}
        }
    }
    saved
}

fn fix_function(function: &mut AsmFunction, backend: &mut BackendTable) {
    let callee_saved = collect_callee_saved(&function.instructions);
    if let Some(BackendSymbol::Fun {
        callee_saved: saved,
        ..
    }) = backend.symbols.get_mut(&function.name)
    {
        *saved = callee_saved.clone();
    }

    let mut frame = StackFrame {
        backend,
        stack_bytes: if function.is_return_memory { 8 } else { 0 },
        slots: HashMap::new(),
    };

    let mut fixed: Vec<AsmInstruction> = Vec::new();
    for reg in &callee_saved {
        fixed.push(AsmInstruction::Push(AsmOperand::Reg(*reg)));
    }
    let mut saw_ret = false;
    for mut instruction in function.instructions.drain(..) {
        if matches!(instruction, AsmInstruction::Ret) {
            for reg in callee_saved.iter().rev() {
                fixed.push(AsmInstruction::Pop(*reg));
            }
            saw_ret = true;
        }
        frame.replace_instruction(&mut instruction);
        legalize(instruction, &mut fixed);
    }
    if !saw_ret {
        for reg in callee_saved.iter().rev() {
            fixed.push(AsmInstruction::Pop(*reg));
        }
    }

    let callee_saved_bytes = callee_saved.len() as i64 * 8;
    let mut stack_bytes = frame.stack_bytes + callee_saved_bytes;
    if stack_bytes > 0 {
        let rem = stack_bytes % 16;
        if rem != 0 {
            stack_bytes += 16 - rem;
        }
        fixed.insert(0, alloc_stack(stack_bytes - callee_saved_bytes));
    }
    function.instructions = fixed;
}

// ----------------------------------------------------------------------
// Legalization

fn legalize(instruction: AsmInstruction, out: &mut Vec<AsmInstruction>) {
    match instruction {
        AsmInstruction::Mov { ty, src, dst } => legalize_mov(ty, src, dst, out),
        AsmInstruction::MovSx {
            src_ty,
            dst_ty,
            src,
            dst,
        } => legalize_mov_sx(src_ty, dst_ty, src, dst, out),
        AsmInstruction::MovZeroExtend {
            src_ty,
            dst_ty,
            src,
            dst,
        } => legalize_zero_extend(src_ty, dst_ty, src, dst, out),
        AsmInstruction::Lea { src, dst } => legalize_lea(src, dst, out),
        AsmInstruction::Cvttsd2si { ty, src, dst } => legalize_cvttsd2si(ty, src, dst, out),
        AsmInstruction::Cvtsi2sd { ty, src, dst } => legalize_cvtsi2sd(ty, src, dst, out),
        AsmInstruction::Binary { op, ty, src, dst } => legalize_binary(op, ty, src, dst, out),
        AsmInstruction::Cmp { ty, src, dst } => legalize_cmp(ty, src, dst, out),
        AsmInstruction::Idiv { ty, src } => legalize_idiv(ty, src, out),
        AsmInstruction::Div { ty, src } => legalize_div(ty, src, out),
        AsmInstruction::Push(src) => legalize_push(src, out),
        other => out.push(other),
    }
}

fn mov(ty: AsmType, src: AsmOperand, dst: AsmOperand) -> AsmInstruction {
    AsmInstruction::Mov { ty, src, dst }
}

fn legalize_mov(ty: AsmType, mut src: AsmOperand, dst: AsmOperand, out: &mut Vec<AsmInstruction>) {
    if ty == AsmType::Double {
        if src.is_addressable() && dst.is_addressable() {
            out.push(mov(ty, src, AsmOperand::Reg(Register::Xmm14)));
            out.push(mov(ty, AsmOperand::Reg(Register::Xmm14), dst));
            return;
        }
        out.push(mov(ty, src, dst));
        return;
    }
    let mut ty = ty;
    if src.is_quad_imm() {
        if matches!(dst, AsmOperand::Reg(_)) {
            // A 64-bit immediate is legal only as a mov into a register;
            // widen the mov if the type said otherwise.
            ty = AsmType::QuadWord;
        } else {
            out.push(mov(
                AsmType::QuadWord,
                src,
                AsmOperand::Reg(Register::R10),
            ));
            src = AsmOperand::Reg(Register::R10);
        }
    }
    if src.is_addressable() && dst.is_addressable() {
        out.push(mov(ty, src, AsmOperand::Reg(Register::R10)));
        out.push(mov(ty, AsmOperand::Reg(Register::R10), dst));
    } else {
        out.push(mov(ty, src, dst));
    }
}

fn legalize_mov_sx(
    src_ty: AsmType,
    dst_ty: AsmType,
    mut src: AsmOperand,
    dst: AsmOperand,
    out: &mut Vec<AsmInstruction>,
) {
    if matches!(src, AsmOperand::Imm { .. }) {
        out.push(mov(src_ty, src, AsmOperand::Reg(Register::R10)));
        src = AsmOperand::Reg(Register::R10);
    }
    if dst.is_addressable() {
        out.push(AsmInstruction::MovSx {
            src_ty,
            dst_ty,
            src,
            dst: AsmOperand::Reg(Register::R11),
        });
        out.push(mov(dst_ty, AsmOperand::Reg(Register::R11), dst));
    } else {
        out.push(AsmInstruction::MovSx {
            src_ty,
            dst_ty,
            src,
            dst,
        });
    }
}

fn legalize_zero_extend(
    src_ty: AsmType,
    dst_ty: AsmType,
    mut src: AsmOperand,
    dst: AsmOperand,
    out: &mut Vec<AsmInstruction>,
) {
    if src_ty == AsmType::Byte {
        if matches!(src, AsmOperand::Imm { .. }) {
            out.push(mov(AsmType::Byte, src, AsmOperand::Reg(Register::R10)));
            src = AsmOperand::Reg(Register::R10);
        }
        if dst.is_addressable() {
            out.push(AsmInstruction::MovZeroExtend {
                src_ty,
                dst_ty,
                src,
                dst: AsmOperand::Reg(Register::R11),
            });
            out.push(mov(dst_ty, AsmOperand::Reg(Register::R11), dst));
        } else {
            out.push(AsmInstruction::MovZeroExtend {
                src_ty,
                dst_ty,
                src,
                dst,
            });
        }
    } else {
        // A 4-byte mov zero-extends on its own.
        if dst.is_addressable() {
            out.push(mov(AsmType::LongWord, src, AsmOperand::Reg(Register::R11)));
            out.push(mov(AsmType::QuadWord, AsmOperand::Reg(Register::R11), dst));
        } else {
            out.push(mov(AsmType::LongWord, src, dst));
        }
    }
}

fn legalize_lea(src: AsmOperand, dst: AsmOperand, out: &mut Vec<AsmInstruction>) {
    if dst.is_addressable() {
        out.push(AsmInstruction::Lea {
            src,
            dst: AsmOperand::Reg(Register::R11),
        });
        out.push(mov(AsmType::QuadWord, AsmOperand::Reg(Register::R11), dst));
    } else {
        out.push(AsmInstruction::Lea { src, dst });
    }
}

fn legalize_cvttsd2si(
    ty: AsmType,
    src: AsmOperand,
    dst: AsmOperand,
    out: &mut Vec<AsmInstruction>,
) {
    if dst.is_addressable() {
        out.push(AsmInstruction::Cvttsd2si {
            ty,
            src,
            dst: AsmOperand::Reg(Register::R11),
        });
        out.push(mov(ty, AsmOperand::Reg(Register::R11), dst));
    } else {
        out.push(AsmInstruction::Cvttsd2si { ty, src, dst });
    }
}

fn legalize_cvtsi2sd(
    ty: AsmType,
    mut src: AsmOperand,
    dst: AsmOperand,
    out: &mut Vec<AsmInstruction>,
) {
    if matches!(src, AsmOperand::Imm { .. }) {
        out.push(mov(ty, src, AsmOperand::Reg(Register::R10)));
        src = AsmOperand::Reg(Register::R10);
    }
    if dst.is_addressable() {
        out.push(AsmInstruction::Cvtsi2sd {
            ty,
            src,
            dst: AsmOperand::Reg(Register::Xmm15),
        });
        out.push(mov(AsmType::Double, AsmOperand::Reg(Register::Xmm15), dst));
    } else {
        out.push(AsmInstruction::Cvtsi2sd { ty, src, dst });
    }
}

fn legalize_binary(
    op: AsmBinaryOp,
    ty: AsmType,
    mut src: AsmOperand,
    dst: AsmOperand,
    out: &mut Vec<AsmInstruction>,
) {
    if ty == AsmType::Double {
        // SSE arithmetic writes a register; stage memory destinations
        // through XMM15.
        if dst.is_addressable() {
            out.push(mov(ty, dst.clone(), AsmOperand::Reg(Register::Xmm15)));
            out.push(AsmInstruction::Binary {
                op,
                ty,
                src,
                dst: AsmOperand::Reg(Register::Xmm15),
            });
            out.push(mov(ty, AsmOperand::Reg(Register::Xmm15), dst));
        } else {
            out.push(AsmInstruction::Binary { op, ty, src, dst });
        }
        return;
    }
    match op {
        AsmBinaryOp::Add | AsmBinaryOp::Sub | AsmBinaryOp::And | AsmBinaryOp::Or | AsmBinaryOp::Xor => {
            if src.is_quad_imm() {
                out.push(mov(AsmType::QuadWord, src, AsmOperand::Reg(Register::R10)));
                src = AsmOperand::Reg(Register::R10);
            }
            if src.is_addressable() && dst.is_addressable() {
                out.push(mov(ty, src, AsmOperand::Reg(Register::R10)));
                src = AsmOperand::Reg(Register::R10);
            }
            out.push(AsmInstruction::Binary { op, ty, src, dst });
        }
        AsmBinaryOp::Mult => {
            if src.is_quad_imm() {
                out.push(mov(AsmType::QuadWord, src, AsmOperand::Reg(Register::R10)));
                src = AsmOperand::Reg(Register::R10);
            }
            if dst.is_addressable() {
                out.push(mov(ty, dst.clone(), AsmOperand::Reg(Register::R11)));
                out.push(AsmInstruction::Binary {
                    op,
                    ty,
                    src,
                    dst: AsmOperand::Reg(Register::R11),
                });
                out.push(mov(ty, AsmOperand::Reg(Register::R11), dst));
            } else {
                out.push(AsmInstruction::Binary { op, ty, src, dst });
            }
        }
        AsmBinaryOp::Shl | AsmBinaryOp::Shr | AsmBinaryOp::Sar => {
            if src.is_quad_imm() {
                out.push(mov(AsmType::QuadWord, src, AsmOperand::Reg(Register::R10)));
                src = AsmOperand::Reg(Register::R10);
            }
            // A variable shift count lives in %cl.
            if !matches!(src, AsmOperand::Imm { .. })
                && src != AsmOperand::Reg(Register::Cx)
            {
                out.push(mov(ty, src, AsmOperand::Reg(Register::Cx)));
                src = AsmOperand::Reg(Register::Cx);
            }
            out.push(AsmInstruction::Binary { op, ty, src, dst });
        }
        AsmBinaryOp::DivDouble => {
            out.push(AsmInstruction::Binary { op, ty, src, dst });
        }
    }
}

fn legalize_cmp(ty: AsmType, mut src: AsmOperand, dst: AsmOperand, out: &mut Vec<AsmInstruction>) {
    if ty == AsmType::Double {
        // comisd reads its second operand from a register.
        if dst.is_addressable() {
            out.push(mov(ty, dst, AsmOperand::Reg(Register::Xmm15)));
            out.push(AsmInstruction::Cmp {
                ty,
                src,
                dst: AsmOperand::Reg(Register::Xmm15),
            });
        } else {
            out.push(AsmInstruction::Cmp { ty, src, dst });
        }
        return;
    }
    if src.is_quad_imm() {
        out.push(mov(AsmType::QuadWord, src, AsmOperand::Reg(Register::R10)));
        src = AsmOperand::Reg(Register::R10);
    }
    if src.is_addressable() && dst.is_addressable() {
        out.push(mov(ty, src, AsmOperand::Reg(Register::R10)));
        out.push(AsmInstruction::Cmp {
            ty,
            src: AsmOperand::Reg(Register::R10),
            dst,
        });
    } else if matches!(dst, AsmOperand::Imm { .. }) {
        out.push(mov(ty, dst, AsmOperand::Reg(Register::R11)));
        out.push(AsmInstruction::Cmp {
            ty,
            src,
            dst: AsmOperand::Reg(Register::R11),
        });
    } else {
        out.push(AsmInstruction::Cmp { ty, src, dst });
    }
}

fn legalize_idiv(ty: AsmType, src: AsmOperand, out: &mut Vec<AsmInstruction>) {
    if matches!(src, AsmOperand::Imm { .. }) {
        out.push(mov(ty, src, AsmOperand::Reg(Register::R10)));
        out.push(AsmInstruction::Idiv {
            ty,
            src: AsmOperand::Reg(Register::R10),
        });
    } else {
        out.push(AsmInstruction::Idiv { ty, src });
    }
}

fn legalize_div(ty: AsmType, src: AsmOperand, out: &mut Vec<AsmInstruction>) {
    if matches!(src, AsmOperand::Imm { .. }) {
        out.push(mov(ty, src, AsmOperand::Reg(Register::R10)));
        out.push(AsmInstruction::Div {
            ty,
            src: AsmOperand::Reg(Register::R10),
        });
    } else {
        out.push(AsmInstruction::Div { ty, src });
    }
}

fn legalize_push(src: AsmOperand, out: &mut Vec<AsmInstruction>) {
    if let AsmOperand::Reg(reg) = src
        && reg.is_sse()
    {
        // pushq cannot take an XMM register: make room and store.
        out.push(alloc_stack(8));
        out.push(mov(
            AsmType::QuadWord,
            src,
            AsmOperand::Memory {
                base: Register::Sp,
                offset: 0,
            },
        ));
        return;
    }
    if src.is_quad_imm() {
        out.push(mov(AsmType::QuadWord, src, AsmOperand::Reg(Register::R10)));
        out.push(AsmInstruction::Push(AsmOperand::Reg(Register::R10)));
        return;
    }
    out.push(AsmInstruction::Push(src));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imm(v: u64) -> AsmOperand {
        AsmOperand::imm(v, v <= 127, v > i32::MAX as u64, false)
    }

    fn memory(offset: i64) -> AsmOperand {
        AsmOperand::Memory {
            base: Register::Bp,
            offset,
        }
    }

    fn no_illegal_combinations(instructions: &[AsmInstruction]) {
        for instruction in instructions {
            match instruction {
                AsmInstruction::Mov { src, dst, .. }
                | AsmInstruction::Cmp { src, dst, .. }
                | AsmInstruction::Binary {
                    op:
                        AsmBinaryOp::Add
                        | AsmBinaryOp::Sub
                        | AsmBinaryOp::And
                        | AsmBinaryOp::Or
                        | AsmBinaryOp::Xor,
                    src,
                    dst,
                    ..
                } => {
                    assert!(
                        !(src.is_addressable() && dst.is_addressable()),
                        "memory-to-memory survived: {:?}",
                        instruction
                    );
                }
                _ => {}
            }
            if let AsmInstruction::Cmp { dst, .. } = instruction {
                assert!(
                    !matches!(dst, AsmOperand::Imm { .. }),
                    "cmp with immediate destination survived"
                );
            }
            if let AsmInstruction::Binary {
                op: AsmBinaryOp::Mult,
                dst,
                ..
            } = instruction
            {
                assert!(!dst.is_addressable(), "imul into memory survived");
            }
        }
    }

    #[test]
    fn mov_memory_to_memory_goes_through_r10() {
        let mut out = Vec::new();
        legalize(
            AsmInstruction::Mov {
                ty: AsmType::LongWord,
                src: memory(-4),
                dst: memory(-8),
            },
            &mut out,
        );
        assert_eq!(out.len(), 2);
        assert!(matches!(
            &out[0],
            AsmInstruction::Mov {
                dst: AsmOperand::Reg(Register::R10),
                ..
            }
        ));
        no_illegal_combinations(&out);
    }

    #[test]
    fn quad_immediate_into_memory_is_staged() {
        let mut out = Vec::new();
        legalize(
            AsmInstruction::Mov {
                ty: AsmType::QuadWord,
                src: imm(1 << 40),
                dst: memory(-8),
            },
            &mut out,
        );
        assert_eq!(out.len(), 2);
        no_illegal_combinations(&out);
    }

    #[test]
    fn quad_immediate_into_register_widens_the_mov() {
        let mut out = Vec::new();
        legalize(
            AsmInstruction::Mov {
                ty: AsmType::LongWord,
                src: imm(1 << 40),
                dst: AsmOperand::Reg(Register::Ax),
            },
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            AsmInstruction::Mov {
                ty: AsmType::QuadWord,
                ..
            }
        ));
    }

    #[test]
    fn cmp_with_immediate_destination_is_staged() {
        let mut out = Vec::new();
        legalize(
            AsmInstruction::Cmp {
                ty: AsmType::LongWord,
                src: memory(-4),
                dst: imm(3),
            },
            &mut out,
        );
        no_illegal_combinations(&out);
    }

    #[test]
    fn imul_into_memory_is_staged_through_r11() {
        let mut out = Vec::new();
        legalize(
            AsmInstruction::Binary {
                op: AsmBinaryOp::Mult,
                ty: AsmType::LongWord,
                src: imm(3),
                dst: memory(-4),
            },
            &mut out,
        );
        assert_eq!(out.len(), 3);
        no_illegal_combinations(&out);
        assert!(matches!(
            &out[2],
            AsmInstruction::Mov {
                src: AsmOperand::Reg(Register::R11),
                ..
            }
        ));
    }

    #[test]
    fn variable_shift_count_moves_to_cl() {
        let mut out = Vec::new();
        legalize(
            AsmInstruction::Binary {
                op: AsmBinaryOp::Shl,
                ty: AsmType::LongWord,
                src: memory(-4),
                dst: memory(-8),
            },
            &mut out,
        );
        assert!(matches!(
            &out[0],
            AsmInstruction::Mov {
                dst: AsmOperand::Reg(Register::Cx),
                ..
            }
        ));
        assert!(matches!(
            &out[1],
            AsmInstruction::Binary {
                src: AsmOperand::Reg(Register::Cx),
                ..
            }
        ));
    }

    #[test]
    fn four_byte_zero_extend_decays_to_mov() {
        let mut out = Vec::new();
        legalize(
            AsmInstruction::MovZeroExtend {
                src_ty: AsmType::LongWord,
                dst_ty: AsmType::QuadWord,
                src: memory(-4),
                dst: AsmOperand::Reg(Register::Ax),
            },
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert!(matches!(
            &out[0],
            AsmInstruction::Mov {
                ty: AsmType::LongWord,
                ..
            }
        ));
    }

    #[test]
    fn xmm_push_becomes_sub_and_store() {
        let mut out = Vec::new();
        legalize_push(AsmOperand::Reg(Register::Xmm0), &mut out);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], AsmInstruction::Binary { .. }));
        assert!(matches!(
            &out[1],
            AsmInstruction::Mov {
                dst: AsmOperand::Memory {
                    base: Register::Sp,
                    offset: 0
                },
                ..
            }
        ));
    }

    #[test]
    fn frame_is_sixteen_byte_aligned() {
        // 12 bytes of locals round up to a 16-byte frame.
        let mut interner = crate::intern::Interner::new();
        let a = interner.intern("a.0");
        let b = interner.intern("b.1");
        let c = interner.intern("c.2");
        let mut backend = BackendTable::default();
        for name in [a, b, c] {
            backend.symbols.insert(
                name,
                BackendSymbol::Obj {
                    is_static: false,
                    is_const: false,
                    ty: AsmType::LongWord,
                },
            );
        }
        let fun_name = interner.intern("f");
        backend.symbols.insert(
            fun_name,
            BackendSymbol::Fun {
                is_defined: true,
                callee_saved: Vec::new(),
            },
        );
        let mut program = AsmProgram {
            static_constants: Vec::new(),
            static_variables: Vec::new(),
            functions: vec![AsmFunction {
                name: fun_name,
                is_global: true,
                is_return_memory: false,
                instructions: vec![
                    AsmInstruction::Mov {
                        ty: AsmType::LongWord,
                        src: AsmOperand::imm(1, true, false, false),
                        dst: AsmOperand::Pseudo(a),
                    },
                    AsmInstruction::Mov {
                        ty: AsmType::LongWord,
                        src: AsmOperand::imm(2, true, false, false),
                        dst: AsmOperand::Pseudo(b),
                    },
                    AsmInstruction::Mov {
                        ty: AsmType::LongWord,
                        src: AsmOperand::imm(3, true, false, false),
                        dst: AsmOperand::Pseudo(c),
                    },
                    AsmInstruction::Ret,
                ],
            }],
        };
        fix_stack(&mut program, &mut backend);
        let instructions = &program.functions[0].instructions;
        // First instruction allocates the rounded frame.
        let AsmInstruction::Binary {
            op: AsmBinaryOp::Sub,
            src: AsmOperand::Imm { value, .. },
            dst: AsmOperand::Reg(Register::Sp),
            ..
        } = &instructions[0]
        else {
            panic!("missing frame allocation: {:?}", instructions[0]);
        };
        assert_eq!(*value, 16);
        // Every pseudo was eliminated.
        for instruction in instructions {
            if let AsmInstruction::Mov { src, dst, .. } = instruction {
                assert!(!matches!(src, AsmOperand::Pseudo(_) | AsmOperand::PseudoMem { .. }));
                assert!(!matches!(dst, AsmOperand::Pseudo(_) | AsmOperand::PseudoMem { .. }));
            }
        }
    }
}
