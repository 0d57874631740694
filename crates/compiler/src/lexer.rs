//! Lexer
//!
//! Produces the token stream consumed by the parser: `(kind, interned
//! text, line)` triples. Identifier/constant/string shapes are matched with
//! compiled regexes (built once per process); punctuation and operators are
//! matched longest-first from a fixed table.
//!
//! Comments are discarded. Preprocessor lines are discarded too, except
//! `#include`, which is resolved against the include search path and the
//! included file's tokens are spliced in at the directive site.

use crate::errors::CompileError;
use crate::intern::{Ident, Interner};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Punctuation
    OpenParen,
    CloseParen,
    OpenBrace,
    CloseBrace,
    OpenBracket,
    CloseBracket,
    Semicolon,
    Comma,
    Question,
    Colon,
    Dot,
    Arrow,
    // Operators
    Incr,
    Decr,
    Complement,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Ampersand,
    Pipe,
    Caret,
    ShiftLeft,
    ShiftRight,
    LogicalAnd,
    LogicalOr,
    EqualEqual,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShiftLeftAssign,
    ShiftRightAssign,
    // Keywords
    KwChar,
    KwInt,
    KwLong,
    KwDouble,
    KwSigned,
    KwUnsigned,
    KwVoid,
    KwStruct,
    KwUnion,
    KwSizeof,
    KwReturn,
    KwIf,
    KwElse,
    KwGoto,
    KwDo,
    KwWhile,
    KwFor,
    KwSwitch,
    KwCase,
    KwDefault,
    KwBreak,
    KwContinue,
    KwStatic,
    KwExtern,
    // Literals and names
    Identifier,
    StringLiteral,
    CharConstant,
    IntConstant,
    LongConstant,
    UIntConstant,
    ULongConstant,
    DoubleConstant,
}

#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub text: Ident,
    pub line: usize,
}

/// Operators and punctuation, longest first so that `<<=` wins over `<<`
/// which wins over `<`.
const PUNCTUATION: &[(&str, TokenKind)] = &[
    ("<<=", TokenKind::ShiftLeftAssign),
    (">>=", TokenKind::ShiftRightAssign),
    ("->", TokenKind::Arrow),
    ("++", TokenKind::Incr),
    ("--", TokenKind::Decr),
    ("<<", TokenKind::ShiftLeft),
    (">>", TokenKind::ShiftRight),
    ("&&", TokenKind::LogicalAnd),
    ("||", TokenKind::LogicalOr),
    ("==", TokenKind::EqualEqual),
    ("!=", TokenKind::NotEqual),
    ("<=", TokenKind::LessOrEqual),
    (">=", TokenKind::GreaterOrEqual),
    ("+=", TokenKind::PlusAssign),
    ("-=", TokenKind::MinusAssign),
    ("*=", TokenKind::StarAssign),
    ("/=", TokenKind::SlashAssign),
    ("%=", TokenKind::PercentAssign),
    ("&=", TokenKind::AmpAssign),
    ("|=", TokenKind::PipeAssign),
    ("^=", TokenKind::CaretAssign),
    ("(", TokenKind::OpenParen),
    (")", TokenKind::CloseParen),
    ("{", TokenKind::OpenBrace),
    ("}", TokenKind::CloseBrace),
    ("[", TokenKind::OpenBracket),
    ("]", TokenKind::CloseBracket),
    (";", TokenKind::Semicolon),
    (",", TokenKind::Comma),
    ("?", TokenKind::Question),
    (":", TokenKind::Colon),
    (".", TokenKind::Dot),
    ("~", TokenKind::Complement),
    ("!", TokenKind::Not),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Minus),
    ("*", TokenKind::Star),
    ("/", TokenKind::Slash),
    ("%", TokenKind::Percent),
    ("&", TokenKind::Ampersand),
    ("|", TokenKind::Pipe),
    ("^", TokenKind::Caret),
    ("<", TokenKind::LessThan),
    (">", TokenKind::GreaterThan),
    ("=", TokenKind::Assign),
];

fn keyword_kind(word: &str) -> Option<TokenKind> {
    let kind = match word {
        "char" => TokenKind::KwChar,
        "int" => TokenKind::KwInt,
        "long" => TokenKind::KwLong,
        "double" => TokenKind::KwDouble,
        "signed" => TokenKind::KwSigned,
        "unsigned" => TokenKind::KwUnsigned,
        "void" => TokenKind::KwVoid,
        "struct" => TokenKind::KwStruct,
        "union" => TokenKind::KwUnion,
        "sizeof" => TokenKind::KwSizeof,
        "return" => TokenKind::KwReturn,
        "if" => TokenKind::KwIf,
        "else" => TokenKind::KwElse,
        "goto" => TokenKind::KwGoto,
        "do" => TokenKind::KwDo,
        "while" => TokenKind::KwWhile,
        "for" => TokenKind::KwFor,
        "switch" => TokenKind::KwSwitch,
        "case" => TokenKind::KwCase,
        "default" => TokenKind::KwDefault,
        "break" => TokenKind::KwBreak,
        "continue" => TokenKind::KwContinue,
        "static" => TokenKind::KwStatic,
        "extern" => TokenKind::KwExtern,
        _ => return None,
    };
    Some(kind)
}

struct Patterns {
    identifier: Regex,
    double_constant: Regex,
    int_constant: Regex,
    char_constant: Regex,
    string_literal: Regex,
    include_directive: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        identifier: Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*").unwrap(),
        double_constant: Regex::new(r"^(\d+\.\d*|\.\d+)([eE][+-]?\d+)?|^\d+[eE][+-]?\d+").unwrap(),
        int_constant: Regex::new(r"^\d+([uU][lL]|[lL][uU]|[uU]|[lL])?").unwrap(),
        char_constant: Regex::new(r"^'([^'\\\n]|\\.)'").unwrap(),
        string_literal: Regex::new(r#"^"([^"\\\n]|\\.)*""#).unwrap(),
        include_directive: Regex::new(r#"^\s*#\s*include\s+(<([^>]+)>|"([^"]+)")"#).unwrap(),
    })
}

pub struct Lexer<'a> {
    interner: &'a mut Interner,
    include_dirs: &'a [PathBuf],
    tokens: Vec<Token>,
    include_depth: usize,
}

const MAX_INCLUDE_DEPTH: usize = 64;

impl<'a> Lexer<'a> {
    pub fn new(interner: &'a mut Interner, include_dirs: &'a [PathBuf]) -> Self {
        Lexer {
            interner,
            include_dirs,
            tokens: Vec::new(),
            include_depth: 0,
        }
    }

    /// Tokenize `source`; `origin` is the directory of the file being
    /// lexed, used to resolve quoted includes.
    pub fn tokenize(
        mut self,
        source: &str,
        origin: Option<&Path>,
    ) -> Result<Vec<Token>, CompileError> {
        self.lex_source(source, origin)?;
        Ok(self.tokens)
    }

    fn lex_source(&mut self, source: &str, origin: Option<&Path>) -> Result<(), CompileError> {
        let mut rest = source;
        let mut line = 1usize;
        let mut at_line_start = true;
        while !rest.is_empty() {
            let c = rest.as_bytes()[0];
            match c {
                b'\n' => {
                    line += 1;
                    at_line_start = true;
                    rest = &rest[1..];
                    continue;
                }
                b' ' | b'\t' | b'\r' => {
                    rest = &rest[1..];
                    continue;
                }
                _ => {}
            }
            if rest.starts_with("//") {
                let end = rest.find('\n').unwrap_or(rest.len());
                rest = &rest[end..];
                continue;
            }
            if rest.starts_with("/*") {
                let Some(end) = rest[2..].find("*/") else {
                    return Err(CompileError::lex(line, "unterminated comment"));
                };
                line += rest[..end + 4].matches('\n').count();
                rest = &rest[end + 4..];
                continue;
            }
            if c == b'#' && at_line_start {
                let end = rest.find('\n').unwrap_or(rest.len());
                let directive = &rest[..end];
                if let Some(caps) = patterns().include_directive.captures(directive) {
                    let (name, quoted) = match (caps.get(2), caps.get(3)) {
                        (Some(m), _) => (m.as_str(), false),
                        (_, Some(m)) => (m.as_str(), true),
                        _ => unreachable!(),
                    };
                    self.process_include(name, quoted, origin, line)?;
                }
                rest = &rest[end..];
                continue;
            }
            at_line_start = false;
            let len = self.lex_token(rest, line)?;
            rest = &rest[len..];
        }
        Ok(())
    }

    /// Match one token at the head of `rest`, push it, return its length.
    fn lex_token(&mut self, rest: &str, line: usize) -> Result<usize, CompileError> {
        let pats = patterns();
        if let Some(m) = pats.identifier.find(rest) {
            let word = m.as_str();
            let kind = keyword_kind(word).unwrap_or(TokenKind::Identifier);
            self.push(kind, word, line);
            return Ok(m.end());
        }
        if let Some(m) = pats.double_constant.find(rest) {
            self.check_constant_boundary(rest, m.end(), line)?;
            self.push(TokenKind::DoubleConstant, m.as_str(), line);
            return Ok(m.end());
        }
        if let Some(m) = pats.int_constant.find(rest) {
            self.check_constant_boundary(rest, m.end(), line)?;
            let text = m.as_str();
            let has_u = text.contains('u') || text.contains('U');
            let has_l = text.contains('l') || text.contains('L');
            let kind = match (has_u, has_l) {
                (true, true) => TokenKind::ULongConstant,
                (true, false) => TokenKind::UIntConstant,
                (false, true) => TokenKind::LongConstant,
                (false, false) => TokenKind::IntConstant,
            };
            self.push(kind, text, line);
            return Ok(m.end());
        }
        if let Some(m) = pats.char_constant.find(rest) {
            self.push(TokenKind::CharConstant, m.as_str(), line);
            return Ok(m.end());
        }
        if rest.starts_with('\'') {
            return Err(CompileError::lex(line, "unterminated character constant"));
        }
        if let Some(m) = pats.string_literal.find(rest) {
            self.push(TokenKind::StringLiteral, m.as_str(), line);
            return Ok(m.end());
        }
        if rest.starts_with('"') {
            return Err(CompileError::lex(line, "unterminated string literal"));
        }
        for (text, kind) in PUNCTUATION {
            if rest.starts_with(text) {
                self.push(*kind, text, line);
                return Ok(text.len());
            }
        }
        let bad = rest.chars().next().unwrap();
        Err(CompileError::lex(line, format!("invalid token '{}'", bad)))
    }

    /// A constant must not run straight into an identifier character or a
    /// second period (`123abc`, `1.2.3`).
    fn check_constant_boundary(
        &self,
        rest: &str,
        end: usize,
        line: usize,
    ) -> Result<(), CompileError> {
        if let Some(next) = rest[end..].chars().next() {
            if next.is_ascii_alphanumeric() || next == '_' || next == '.' {
                let upto = end + next.len_utf8();
                return Err(CompileError::lex(
                    line,
                    format!("invalid token '{}'", &rest[..upto]),
                ));
            }
        }
        Ok(())
    }

    fn push(&mut self, kind: TokenKind, text: &str, line: usize) {
        let text = self.interner.intern(text);
        self.tokens.push(Token { kind, text, line });
    }

    fn process_include(
        &mut self,
        name: &str,
        quoted: bool,
        origin: Option<&Path>,
        line: usize,
    ) -> Result<(), CompileError> {
        if self.include_depth >= MAX_INCLUDE_DEPTH {
            return Err(CompileError::lex(line, format!("include depth exceeded at '{}'", name)));
        }
        let mut candidates: Vec<PathBuf> = Vec::new();
        if quoted && let Some(dir) = origin {
            candidates.push(dir.join(name));
        }
        for dir in self.include_dirs {
            candidates.push(dir.join(name));
        }
        let Some(path) = candidates.iter().find(|p| p.is_file()) else {
            return Err(CompileError::lex(line, format!("header '{}' not found", name)));
        };
        let source = std::fs::read_to_string(path)
            .map_err(|e| CompileError::io(format!("cannot read '{}': {}", path.display(), e)))?;
        let parent = path.parent().map(Path::to_path_buf);
        self.include_depth += 1;
        self.lex_source(&source, parent.as_deref())?;
        self.include_depth -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> (Vec<Token>, Interner) {
        let mut interner = Interner::new();
        let tokens = Lexer::new(&mut interner, &[])
            .tokenize(source, None)
            .unwrap();
        (tokens, interner)
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).0.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("int main(void)"),
            vec![
                TokenKind::KwInt,
                TokenKind::Identifier,
                TokenKind::OpenParen,
                TokenKind::KwVoid,
                TokenKind::CloseParen
            ]
        );
    }

    #[test]
    fn constant_widths() {
        assert_eq!(
            kinds("1 2l 3u 4ul 5lu 6L 1.5 2. .5 1e3"),
            vec![
                TokenKind::IntConstant,
                TokenKind::LongConstant,
                TokenKind::UIntConstant,
                TokenKind::ULongConstant,
                TokenKind::ULongConstant,
                TokenKind::LongConstant,
                TokenKind::DoubleConstant,
                TokenKind::DoubleConstant,
                TokenKind::DoubleConstant,
                TokenKind::DoubleConstant,
            ]
        );
    }

    #[test]
    fn compound_operators_win_over_prefixes() {
        assert_eq!(
            kinds("a <<= b >> c >= d"),
            vec![
                TokenKind::Identifier,
                TokenKind::ShiftLeftAssign,
                TokenKind::Identifier,
                TokenKind::ShiftRight,
                TokenKind::Identifier,
                TokenKind::GreaterOrEqual,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn comments_and_lines() {
        let (tokens, _) = lex("int a; // one\n/* two\nthree */ int b;");
        assert_eq!(tokens.len(), 6);
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[3].line, 3);
    }

    #[test]
    fn rejects_malformed_constant() {
        let mut interner = Interner::new();
        let err = Lexer::new(&mut interner, &[])
            .tokenize("int x = 123abc;", None)
            .unwrap_err();
        assert!(matches!(err, CompileError::Lex { .. }));
    }

    #[test]
    fn string_and_char_literals() {
        let (tokens, interner) = lex(r#"char c = 'a'; char *s = "hi\n";"#);
        let c = tokens.iter().find(|t| t.kind == TokenKind::CharConstant).unwrap();
        assert_eq!(interner.lookup(c.text), "'a'");
        let s = tokens.iter().find(|t| t.kind == TokenKind::StringLiteral).unwrap();
        assert_eq!(interner.lookup(s.text), "\"hi\\n\"");
    }

    #[test]
    fn missing_header_is_a_lex_error() {
        let mut interner = Interner::new();
        let err = Lexer::new(&mut interner, &[])
            .tokenize("#include \"no_such_header.h\"\nint x;", None)
            .unwrap_err();
        assert!(matches!(err, CompileError::Lex { line: 1, .. }));
    }
}
