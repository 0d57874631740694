//! x86-64 code generation
//!
//! Takes the TAC program to GNU assembler text in four steps:
//!
//! 1. `symtab`: convert the front-end symbol table into backend form
//!    (assembly types, static/const flags, defined flags).
//! 2. `isel`: instruction selection into a symbolic assembly IR with
//!    abstract `Pseudo`/`PseudoMem` operands, implementing the System-V
//!    AMD64 calling convention (`abi` holds the eightbyte classifier).
//! 3. `stack_fix`: assign every pseudo a `%rbp`-relative slot (or a data
//!    reference for statics), legalize operand combinations with scratch
//!    registers, and size the frame.
//! 4. `emit`: render the result as AT&T-syntax text for the selected
//!    [`Target`].
//!
//! # Module structure
//!
//! - `asm.rs`: the symbolic assembly IR (operands, instructions,
//!   registers, assembly types)
//! - `symtab.rs`: backend symbol table + front-to-back conversion
//! - `abi.rs`: eightbyte classification, memoized per struct tag
//! - `isel.rs`: TAC -> symbolic assembly
//! - `stack_fix.rs`: pseudo elimination, legalization, frames
//! - `emit.rs`: text emission
//! - `platform.rs`: Linux/Darwin differences as data
//! - `error.rs`: error type

pub mod abi;
pub mod asm;
mod emit;
mod error;
mod isel;
mod platform;
mod stack_fix;
mod symtab;

pub use error::CodegenError;
pub use platform::Target;
pub use symtab::{BackendSymbol, BackendTable};

use crate::intern::Interner;
use crate::symbols::SymbolTable;
use crate::tac::TacProgram;

/// Run the whole backend: symbol conversion, instruction selection,
/// stack fix-up, and emission.
pub fn generate(
    tac: &TacProgram,
    table: &SymbolTable,
    interner: &mut Interner,
    target: Target,
) -> Result<String, CodegenError> {
    let mut backend = symtab::convert_symbol_table(table);
    let mut program = isel::select_program(tac, table, &mut backend, interner);
    stack_fix::fix_stack(&mut program, &mut backend);
    emit::emit_program(&program, &backend, interner, target)
}

#[cfg(test)]
mod tests {
    use super::asm::{AsmInstruction, AsmOperand};
    use super::*;
    use crate::lexer::Lexer;
    use crate::lowering;
    use crate::parser::Parser;
    use crate::resolver::Resolver;
    use crate::typechecker::TypeChecker;

    fn compile(source: &str, target: Target) -> String {
        let mut interner = Interner::new();
        let tokens = Lexer::new(&mut interner, &[]).tokenize(source, None).unwrap();
        let mut program = Parser::new(tokens, &mut interner).parse().unwrap();
        Resolver::new(&mut interner).resolve(&mut program).unwrap();
        let mut table = SymbolTable::new();
        TypeChecker::new(&mut interner, &mut table)
            .check_program(&mut program)
            .unwrap();
        let tac = lowering::lower(&program, &mut table, &mut interner);
        generate(&tac, &table, &mut interner, target).unwrap()
    }

    /// Re-run the middle of the pipeline and hand back the fixed IR, for
    /// operand-legality assertions.
    fn fixed_ir(source: &str) -> Vec<AsmInstruction> {
        let mut interner = Interner::new();
        let tokens = Lexer::new(&mut interner, &[]).tokenize(source, None).unwrap();
        let mut program = Parser::new(tokens, &mut interner).parse().unwrap();
        Resolver::new(&mut interner).resolve(&mut program).unwrap();
        let mut table = SymbolTable::new();
        TypeChecker::new(&mut interner, &mut table)
            .check_program(&mut program)
            .unwrap();
        let tac = lowering::lower(&program, &mut table, &mut interner);
        let mut backend = symtab::convert_symbol_table(&table);
        let mut asm = isel::select_program(&tac, &table, &mut backend, &mut interner);
        stack_fix::fix_stack(&mut asm, &mut backend);
        asm.functions
            .into_iter()
            .flat_map(|f| f.instructions)
            .collect()
    }

    #[test]
    fn emits_a_complete_function() {
        let text = compile("int main(void) { return 2 + 3 * 4; }", Target::Linux);
        assert!(text.contains("    .globl main"));
        assert!(text.contains("    .text"));
        assert!(text.contains("main:"));
        assert!(text.contains("    pushq %rbp"));
        assert!(text.contains("    movq %rsp, %rbp"));
        assert!(text.contains("imull"));
        assert!(text.contains("    ret"));
        assert!(text.contains(".section .note.GNU-stack,\"\",@progbits"));
    }

    #[test]
    fn darwin_flavors_symbols_and_sections() {
        let text = compile(
            "double half(double x) { return x / 2.0; } int main(void) { return 0; }",
            Target::Darwin,
        );
        assert!(text.contains("_main:"));
        assert!(text.contains("    .literal8"));
        assert!(!text.contains("@PLT"));
        assert!(!text.contains(".note.GNU-stack"));
    }

    #[test]
    fn undefined_extern_gets_plt_on_linux() {
        let text = compile(
            "int putchar(int c); int main(void) { putchar(65); return 0; }",
            Target::Linux,
        );
        assert!(text.contains("call putchar@PLT"));
    }

    #[test]
    fn statics_are_sectioned_by_initializer() {
        let text = compile(
            "int zeroed; int filled = 7; int main(void) { return zeroed + filled; }",
            Target::Linux,
        );
        let bss_at = text.find("    .bss").expect("tentative data in .bss");
        let data_at = text.find("    .data").expect("initialized data in .data");
        assert!(text.contains("        .zero 4"));
        assert!(text.contains("        .long 7"));
        // Constants then variables then functions; both data sections
        // come before the first function.
        let text_at = text.find("    .text").unwrap();
        assert!(bss_at < text_at && data_at < text_at);
    }

    #[test]
    fn double_constants_are_deduplicated_in_rodata() {
        let text = compile(
            "double f(void) { return 1.5; } double g(void) { return 1.5 + 1.5; } \
             int main(void) { return 0; }",
            Target::Linux,
        );
        let occurrences = text.matches("        .quad 4609434218613702656").count();
        assert_eq!(occurrences, 1, "1.5 should appear once in .rodata");
        assert!(text.contains("    .section .rodata"));
    }

    #[test]
    fn negative_zero_mask_is_sixteen_byte_aligned() {
        let text = compile(
            "double negate(double x) { return -x; } int main(void) { return 0; }",
            Target::Linux,
        );
        let mask_at = text
            .find("        .quad 9223372036854775808")
            .expect("sign mask in rodata");
        let align_at = text[..mask_at]
            .rfind("    .balign 16")
            .expect("sign mask aligned to 16");
        assert!(align_at < mask_at);
        assert!(text.contains("xorpd"));
    }

    #[test]
    fn no_memory_to_memory_operations_survive_fixup() {
        let instructions = fixed_ir(
            "struct s { char c; int i; long l; double d; }; \
             long f(struct s v, long extra) { return v.l + extra; } \
             double g(double a, double b) { return a * b + 1.0; } \
             int main(void) { int a[4] = {1, 2, 3, 4}; int i = 2; \
             unsigned long u = 18446744073709551615ul; \
             return a[i] + (int)(u >> 60) + (int)g(1.0, 2.0); }",
        );
        use super::asm::AsmBinaryOp;
        for instruction in &instructions {
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
                        "memory-to-memory operation survived: {:?}",
                        instruction
                    );
                }
                _ => {}
            }
            if let AsmInstruction::Cmp { dst, .. } = instruction {
                assert!(!matches!(dst, AsmOperand::Imm { .. }));
            }
            // Every pseudo must be gone.
            let operands: Vec<&AsmOperand> = match instruction {
                AsmInstruction::Mov { src, dst, .. }
                | AsmInstruction::MovSx { src, dst, .. }
                | AsmInstruction::MovZeroExtend { src, dst, .. }
                | AsmInstruction::Lea { src, dst }
                | AsmInstruction::Cvttsd2si { src, dst, .. }
                | AsmInstruction::Cvtsi2sd { src, dst, .. }
                | AsmInstruction::Binary { src, dst, .. }
                | AsmInstruction::Cmp { src, dst, .. } => vec![src, dst],
                AsmInstruction::Unary { dst, .. } | AsmInstruction::SetCC { dst, .. } => {
                    vec![dst]
                }
                AsmInstruction::Idiv { src, .. }
                | AsmInstruction::Div { src, .. }
                | AsmInstruction::Push(src) => vec![src],
                _ => vec![],
            };
            for operand in operands {
                assert!(
                    !matches!(
                        operand,
                        AsmOperand::Pseudo(_) | AsmOperand::PseudoMem { .. }
                    ),
                    "pseudo operand survived: {:?}",
                    instruction
                );
            }
        }
    }

    #[test]
    fn struct_return_by_hidden_pointer() {
        let text = compile(
            "struct big { long a; long b; long c; }; \
             struct big make(long x) { struct big r = {x, x, x}; return r; } \
             int main(void) { struct big b = make(3); return (int)b.c; }",
        Target::Linux,
        );
        // The callee saves the hidden pointer at -8(%rbp) and returns it
        // in %rax.
        assert!(text.contains("movq %rdi, -8(%rbp)"));
        assert!(text.contains("movq -8(%rbp), %rax"));
    }

    #[test]
    fn small_struct_returns_in_registers() {
        let text = compile(
            "struct pair { int a; int b; }; \
             struct pair make(void) { struct pair p = {1, 2}; return p; } \
             int main(void) { return make().b; }",
            Target::Linux,
        );
        // No hidden pointer: the eight bytes come back in %rax.
        assert!(!text.contains("movq %rdi, -8(%rbp)"));
    }

    #[test]
    fn switch_compare_chain_in_assembly() {
        let text = compile(
            "int main(void) { int x = 2; switch (x) { case 1: return 1; case 2: return 2; } return 0; }",
            Target::Linux,
        );
        assert!(text.contains("jne ") || text.contains("je "));
        assert!(text.contains(".Lcase_0_switch."));
        assert!(text.contains(".Lbreak_switch."));
    }
}
