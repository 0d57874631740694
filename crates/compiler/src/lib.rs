//! Cinder Compiler Library
//!
//! Compiles a substantial subset of C to x86-64 assembly in AT&T/GAS
//! syntax, and optionally drives the system toolchain to produce an
//! executable.
//!
//! The pipeline is a fixed sequence of single-threaded passes:
//!
//! 1. [`lexer`]: token stream, with `#include` expansion
//! 2. [`parser`]: C AST
//! 3. [`resolver`]: name/tag resolution, loop labeling, goto checks
//! 4. [`typechecker`]: types, implicit casts, layouts, initializers
//! 5. [`lowering`]: three-address code
//! 6. [`codegen`]: symbolic assembly, stack fix-up, GAS text
//!
//! Each pass finishes before the next begins; the symbol table built
//! during semantic analysis outlives every IR and is read-only once
//! lowering starts.
//!
//! ```rust,ignore
//! use cinderc::{CompilerConfig, compile_to_asm};
//!
//! let asm = compile_to_asm("int main(void) { return 0; }", &CompilerConfig::new())?;
//! assert!(asm.contains("main:"));
//! ```

pub mod ast;
pub mod codegen;
pub mod config;
pub mod errors;
pub mod intern;
pub mod lexer;
pub mod lowering;
pub mod parser;
pub mod resolver;
pub mod symbols;
pub mod tac;
pub mod typechecker;
pub mod types;

pub use codegen::Target;
pub use config::CompilerConfig;
pub use errors::{CompileError, SemanticErrorKind};

use crate::intern::Interner;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::resolver::Resolver;
use crate::symbols::SymbolTable;
use crate::typechecker::TypeChecker;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use tracing::debug;

/// Cache for the assembler-driver availability check; it only runs once
/// per process.
static CC_CHECKED: OnceLock<Result<(), String>> = OnceLock::new();

fn check_system_cc() -> Result<(), String> {
    CC_CHECKED
        .get_or_init(|| {
            let output = Command::new("cc").arg("--version").output().map_err(|e| {
                format!(
                    "Failed to run cc: {}. A system C toolchain is required to assemble and link.",
                    e
                )
            })?;
            if !output.status.success() {
                return Err("cc --version failed; cannot assemble output".to_string());
            }
            Ok(())
        })
        .clone()
}

/// Compile source text to assembly. `origin` is the directory quoted
/// includes resolve against (the source file's directory, if any).
fn compile_source(
    source: &str,
    origin: Option<&Path>,
    config: &CompilerConfig,
) -> Result<String, CompileError> {
    let mut interner = Interner::new();
    let tokens = Lexer::new(&mut interner, &config.include_dirs).tokenize(source, origin)?;
    debug!(tokens = tokens.len(), "lexed");
    let mut program = Parser::new(tokens, &mut interner).parse()?;
    debug!(declarations = program.decls.len(), "parsed");
    Resolver::new(&mut interner).resolve(&mut program)?;
    let mut table = SymbolTable::new();
    TypeChecker::new(&mut interner, &mut table).check_program(&mut program)?;
    debug!(symbols = table.symbols.len(), "checked");
    let tac = lowering::lower(&program, &mut table, &mut interner);
    debug!(functions = tac.functions.len(), "lowered");
    drop(program);
    let asm = codegen::generate(&tac, &table, &mut interner, config.target)
        .map_err(|e| CompileError::io(e.to_string()))?;
    debug!(bytes = asm.len(), "emitted");
    Ok(asm)
}

/// Compile a source string to assembly text.
pub fn compile_to_asm(source: &str, config: &CompilerConfig) -> Result<String, CompileError> {
    compile_source(source, None, config)
}

/// Run the front end only: lex, parse, and semantic analysis.
pub fn check_source(source: &str, config: &CompilerConfig) -> Result<(), CompileError> {
    let mut interner = Interner::new();
    let tokens = Lexer::new(&mut interner, &config.include_dirs).tokenize(source, None)?;
    let mut program = Parser::new(tokens, &mut interner).parse()?;
    Resolver::new(&mut interner).resolve(&mut program)?;
    let mut table = SymbolTable::new();
    TypeChecker::new(&mut interner, &mut table).check_program(&mut program)
}

/// Run the front end over a file.
pub fn check_file(input: &Path, config: &CompilerConfig) -> Result<(), CompileError> {
    let source = std::fs::read_to_string(input)
        .map_err(|e| CompileError::io(format!("cannot read '{}': {}", input.display(), e)))?;
    let mut interner = Interner::new();
    let tokens = Lexer::new(&mut interner, &config.include_dirs)
        .tokenize(&source, input.parent())?;
    let mut program = Parser::new(tokens, &mut interner).parse()?;
    Resolver::new(&mut interner).resolve(&mut program)?;
    let mut table = SymbolTable::new();
    TypeChecker::new(&mut interner, &mut table).check_program(&mut program)
}

/// Compile a `.c` file to a `.s` file.
pub fn compile_file(input: &Path, output: &Path, config: &CompilerConfig) -> Result<(), CompileError> {
    let source = std::fs::read_to_string(input)
        .map_err(|e| CompileError::io(format!("cannot read '{}': {}", input.display(), e)))?;
    let asm = compile_source(&source, input.parent(), config)?;
    std::fs::write(output, asm)
        .map_err(|e| CompileError::io(format!("cannot write '{}': {}", output.display(), e)))?;
    Ok(())
}

/// Compile a `.c` file and drive the system toolchain to an executable.
pub fn build_executable(
    input: &Path,
    output: &Path,
    config: &CompilerConfig,
) -> Result<(), CompileError> {
    let asm_path = output.with_extension("s");
    compile_file(input, &asm_path, config)?;

    check_system_cc().map_err(CompileError::io)?;
    let status = Command::new("cc")
        .arg(&asm_path)
        .arg("-o")
        .arg(output)
        .output()
        .map_err(|e| CompileError::io(format!("failed to run cc: {}", e)))?;
    if !config.keep_asm {
        std::fs::remove_file(&asm_path).ok();
    }
    if !status.status.success() {
        let stderr = String::from_utf8_lossy(&status.stderr);
        return Err(CompileError::io(format!("assembly failed:\n{}", stderr)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm(source: &str) -> String {
        compile_to_asm(source, &CompilerConfig::new()).unwrap()
    }

    fn asm_linux(source: &str) -> String {
        let config = CompilerConfig {
            target: Target::Linux,
            ..CompilerConfig::new()
        };
        compile_to_asm(source, &config).unwrap()
    }

    #[test]
    fn arithmetic_program_compiles_end_to_end() {
        let text = asm("int main(void) { return 2 + 3 * 4; }");
        assert!(text.contains("main:"));
        assert!(text.contains("$3"));
        assert!(text.contains("imull"));
    }

    #[test]
    fn compound_assignment_compiles() {
        let text = asm("int main(void) { int a = 5; a += 3; return a; }");
        assert!(text.contains("addl"));
    }

    #[test]
    fn array_indexing_compiles() {
        let text = asm("int main(void) { int a[3] = {1, 2, 3}; return a[2]; }");
        assert!(text.contains("leaq"));
    }

    #[test]
    fn struct_sizeof_and_member_access_compile() {
        let text = asm(
            "struct s { char c; int i; }; \
             int main(void) { struct s v = {0, 7}; return sizeof(v) + v.i; }",
        );
        // sizeof folds to a constant 8.
        assert!(text.contains("$8"));
    }

    #[test]
    fn double_parameters_use_sse_registers() {
        let text = asm_linux(
            "double f(double x) { return x * 2.0; } int main(void) { return (int)f(3.5); }",
        );
        assert!(text.contains("%xmm0"));
        assert!(text.contains("mulsd"));
        assert!(text.contains("cvttsd2si"));
    }

    #[test]
    fn recursion_compiles() {
        let text = asm_linux(
            "int fact(int n) { if (n <= 1) return 1; return n * fact(n - 1); } \
             int main(void) { return fact(5); }",
        );
        // A defined function is called without @PLT.
        assert!(text.contains("call fact\n"));
    }

    #[test]
    fn double_to_unsigned_long_uses_the_range_check() {
        let text = asm_linux(
            "unsigned long g(double d) { return (unsigned long)d; } \
             int main(void) { return (int)(g(9223372036854775808.0) >> 60); }",
        );
        // The 2^63 bound as a double, and the integer add-back.
        assert!(text.contains(".quad 4890909195324358656"));
        assert!(text.contains("$9223372036854775808"));
        assert!(text.contains(".Lsd2si_out_of_range."));
    }

    #[test]
    fn goto_and_labels_compile() {
        let text = asm_linux(
            "int main(void) { int i = 0; again: i = i + 1; if (i < 3) goto again; return i; }",
        );
        assert!(text.contains(".Lagain."));
    }

    #[test]
    fn lex_errors_surface_with_their_line() {
        let err = compile_to_asm("int main(void) {\n return 1.2.3; \n}", &CompilerConfig::new())
            .unwrap_err();
        assert!(matches!(err, CompileError::Lex { line: 2, .. }));
    }

    #[test]
    fn parse_errors_surface() {
        let err = compile_to_asm("int main(void) { return 1 }", &CompilerConfig::new()).unwrap_err();
        assert!(matches!(err, CompileError::Parse { .. }));
    }

    #[test]
    fn semantic_errors_surface() {
        let err = compile_to_asm(
            "int main(void) { int x = 1; return y; }",
            &CompilerConfig::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic {
                kind: SemanticErrorKind::UndeclaredIdent,
                ..
            }
        ));
    }

    #[test]
    fn representative_programs_compile() {
        let programs = [
            "int main(void) { return 2 + 3 * 4; }",
            "int main(void) { int a = 5; a += 3; return a; }",
            "int main(void) { int a[3] = {1, 2, 3}; return a[2]; }",
            "struct s { char c; int i; }; \
             int main(void) { struct s v = {0, 7}; return sizeof(v) + v.i; }",
            "double f(double x) { return x * 2.0; } int main(void) { return (int)f(3.5); }",
            "int fact(int n) { if (n <= 1) return 1; return n * fact(n - 1); } \
             int main(void) { return fact(5); }",
            "unsigned long g(double d) { return (unsigned long)d; } \
             int main(void) { return (int)(g(9223372036854775808.0) >> 60); }",
        ];
        for program in programs {
            let text = asm(program);
            assert!(text.contains("main:"), "no main emitted for: {}", program);
        }
    }

    #[test]
    fn check_source_stops_before_code_generation() {
        check_source(
            "struct s; struct s *p; int main(void) { return 0; }",
            &CompilerConfig::new(),
        )
        .unwrap();
        let err = check_source("int main(void) { break; }", &CompilerConfig::new()).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic {
                kind: SemanticErrorKind::OutOfLoop,
                ..
            }
        ));
    }

    #[test]
    fn unsigned_comparisons_use_unsigned_condition_codes() {
        let text = asm_linux(
            "int main(void) { unsigned int a = 3000000000u; unsigned int b = 1; return a > b; }",
        );
        assert!(text.contains("seta"));
        let signed = asm_linux("int main(void) { int a = -1; int b = 1; return a > b; }");
        assert!(signed.contains("setg"));
    }

    #[test]
    fn while_loop_shape() {
        let text = asm_linux(
            "int main(void) { int i = 0; while (i < 10) { i = i + 1; } return i; }",
        );
        assert!(text.contains(".Lcontinue_while."));
        assert!(text.contains(".Lbreak_while."));
    }

    #[test]
    fn compile_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("ret42.c");
        let output = dir.path().join("ret42.s");
        std::fs::write(&input, "int main(void) { return 42; }").unwrap();
        compile_file(&input, &output, &CompilerConfig::new()).unwrap();
        let text = std::fs::read_to_string(&output).unwrap();
        assert!(text.contains("$42"));
    }

    #[test]
    fn quoted_includes_resolve_relative_to_the_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("answer.h"), "int answer(void);\n").unwrap();
        let input = dir.path().join("main.c");
        std::fs::write(
            &input,
            "#include \"answer.h\"\nint main(void) { return answer(); }\n",
        )
        .unwrap();
        let output = dir.path().join("main.s");
        let config = CompilerConfig {
            target: Target::Linux,
            ..CompilerConfig::new()
        };
        compile_file(&input, &output, &config).unwrap();
        let text = std::fs::read_to_string(&output).unwrap();
        assert!(text.contains("call answer@PLT"));
    }
}
