//! Recursive-descent parser
//!
//! Consumes the token stream and produces the C AST. Expressions are parsed
//! with precedence climbing; ternary and assignment associate right, all
//! other binary operators left. Declarations go through a small declarator
//! tree (`Declarator`/`AbstractDeclarator`) that is folded onto the base
//! type, mirroring the C declarator grammar.

use crate::ast::*;
use crate::errors::CompileError;
use crate::intern::{Ident, Interner};
use crate::lexer::{Token, TokenKind};
use crate::types::{FunType, Type};
use std::rc::Rc;

/// Binding power for the precedence-climbing loop.
fn precedence(kind: TokenKind) -> Option<i32> {
    use TokenKind::*;
    let prec = match kind {
        Star | Slash | Percent => 50,
        Plus | Minus => 45,
        ShiftLeft | ShiftRight => 40,
        LessThan | LessOrEqual | GreaterThan | GreaterOrEqual => 35,
        EqualEqual | NotEqual => 30,
        Ampersand => 25,
        Caret => 20,
        Pipe => 15,
        LogicalAnd => 10,
        LogicalOr => 5,
        Question => 3,
        Assign | PlusAssign | MinusAssign | StarAssign | SlashAssign | PercentAssign
        | AmpAssign | PipeAssign | CaretAssign | ShiftLeftAssign | ShiftRightAssign => 1,
        _ => return None,
    };
    Some(prec)
}

fn binary_op(kind: TokenKind) -> BinaryOp {
    use TokenKind::*;
    match kind {
        Star => BinaryOp::Multiply,
        Slash => BinaryOp::Divide,
        Percent => BinaryOp::Remainder,
        Plus => BinaryOp::Add,
        Minus => BinaryOp::Subtract,
        ShiftLeft => BinaryOp::ShiftLeft,
        ShiftRight => BinaryOp::ShiftRight,
        LessThan => BinaryOp::LessThan,
        LessOrEqual => BinaryOp::LessOrEqual,
        GreaterThan => BinaryOp::GreaterThan,
        GreaterOrEqual => BinaryOp::GreaterOrEqual,
        EqualEqual => BinaryOp::Equal,
        NotEqual => BinaryOp::NotEqual,
        Ampersand => BinaryOp::BitAnd,
        Caret => BinaryOp::BitXor,
        Pipe => BinaryOp::BitOr,
        LogicalAnd => BinaryOp::And,
        LogicalOr => BinaryOp::Or,
        _ => unreachable!("not a binary operator token"),
    }
}

fn compound_op(kind: TokenKind) -> Option<BinaryOp> {
    use TokenKind::*;
    let op = match kind {
        PlusAssign => BinaryOp::Add,
        MinusAssign => BinaryOp::Subtract,
        StarAssign => BinaryOp::Multiply,
        SlashAssign => BinaryOp::Divide,
        PercentAssign => BinaryOp::Remainder,
        AmpAssign => BinaryOp::BitAnd,
        PipeAssign => BinaryOp::BitOr,
        CaretAssign => BinaryOp::BitXor,
        ShiftLeftAssign => BinaryOp::ShiftLeft,
        ShiftRightAssign => BinaryOp::ShiftRight,
        _ => return None,
    };
    Some(op)
}

/// True for tokens that can begin a type in a declaration or cast.
fn starts_type(kind: TokenKind) -> bool {
    use TokenKind::*;
    matches!(
        kind,
        KwChar | KwInt | KwLong | KwDouble | KwSigned | KwUnsigned | KwVoid | KwStruct | KwUnion
    )
}

fn starts_declaration(kind: TokenKind) -> bool {
    starts_type(kind) || matches!(kind, TokenKind::KwStatic | TokenKind::KwExtern)
}

/// Parsed declarator shape, folded onto the base type afterwards.
#[derive(Debug)]
enum Declarator {
    Name(Ident, usize),
    Pointer(Box<Declarator>),
    Array(Box<Declarator>, i64),
    Fun(Vec<Param>, Box<Declarator>, usize),
}

#[derive(Debug)]
struct Param {
    name: Ident,
    param_type: Rc<Type>,
    line: usize,
}

#[derive(Debug)]
enum AbstractDeclarator {
    Pointer(Box<AbstractDeclarator>),
    Array(Box<AbstractDeclarator>, i64),
    Base,
}

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    interner: &'a mut Interner,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, interner: &'a mut Interner) -> Self {
        Parser {
            tokens,
            pos: 0,
            interner,
        }
    }

    pub fn parse(mut self) -> Result<Program, CompileError> {
        let mut decls = Vec::new();
        while self.pos < self.tokens.len() {
            decls.push(self.parse_declaration()?);
        }
        Ok(Program { decls })
    }

    // ------------------------------------------------------------------
    // Token plumbing

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn peek_kind_at(&self, offset: usize) -> Option<TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| t.kind)
    }

    fn current_line(&self) -> usize {
        self.peek()
            .map(|t| t.line)
            .or_else(|| self.tokens.last().map(|t| t.line))
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Result<Token, CompileError> {
        let token = self
            .tokens
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.eof_error())?;
        self.pos += 1;
        Ok(token)
    }

    fn eof_error(&self) -> CompileError {
        CompileError::parse(self.current_line(), "unexpected end of file")
    }

    fn token_text(&self, token: &Token) -> &str {
        self.interner.lookup(token.text)
    }

    fn unexpected(&self, token: &Token, expected: &str) -> CompileError {
        CompileError::parse(
            token.line,
            format!("expected {}, found '{}'", expected, self.token_text(token)),
        )
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token, CompileError> {
        let token = self.advance()?;
        if token.kind != kind {
            return Err(self.unexpected(&token, expected));
        }
        Ok(token)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_identifier(&mut self) -> Result<(Ident, usize), CompileError> {
        let token = self.advance()?;
        if token.kind != TokenKind::Identifier {
            return Err(self.unexpected(&token, "an identifier"));
        }
        Ok((token.text, token.line))
    }

    // ------------------------------------------------------------------
    // Declarations

    fn parse_declaration(&mut self) -> Result<Declaration, CompileError> {
        let line = self.current_line();
        let (base_type, storage, struct_decl) = self.parse_specifiers(true)?;
        if let Some(struct_decl) = struct_decl {
            // A bare `struct S { ... };` or `struct S;` declares only the
            // tag.
            if self.peek_kind() == Some(TokenKind::Semicolon) {
                self.advance()?;
                if storage.is_some() {
                    return Err(CompileError::parse(
                        line,
                        "storage class on a structure declaration",
                    ));
                }
                return Ok(Declaration::Struct(struct_decl));
            }
            // `struct S { ... } x;` would both declare the type and a
            // variable; keep one declaration per statement.
            if !struct_decl.members.is_empty() {
                return Err(CompileError::parse(
                    line,
                    "declarator after structure definition; declare the variable separately",
                ));
            }
        }
        let declarator = self.parse_declarator()?;
        let (name, derived, params, name_line) = self.process_declarator(&declarator, base_type)?;
        if let Type::Fun(_) = &*derived {
            let body = if self.eat(TokenKind::OpenBrace) {
                Some(self.parse_block()?)
            } else {
                self.expect(TokenKind::Semicolon, "';'")?;
                None
            };
            return Ok(Declaration::Fun(FunDecl {
                name,
                params,
                fun_type: derived,
                body,
                storage,
                line: name_line,
            }));
        }
        let init = if self.eat(TokenKind::Assign) {
            Some(self.parse_initializer()?)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(Declaration::Var(VarDecl {
            name,
            var_type: derived,
            init,
            storage,
            line: name_line,
        }))
    }

    /// Parse type specifiers plus (optionally) storage classes. Returns the
    /// base type, the storage class, and the struct declaration when the
    /// type was introduced with a member list or a lone tag.
    fn parse_specifiers(
        &mut self,
        allow_storage: bool,
    ) -> Result<(Rc<Type>, Option<StorageClass>, Option<StructDecl>), CompileError> {
        let line = self.current_line();
        let mut storage: Option<StorageClass> = None;
        let mut specifiers: Vec<TokenKind> = Vec::new();
        let mut struct_decl: Option<StructDecl> = None;
        loop {
            match self.peek_kind() {
                Some(TokenKind::KwStatic) | Some(TokenKind::KwExtern) => {
                    let token = self.advance()?;
                    if !allow_storage {
                        return Err(CompileError::parse(
                            token.line,
                            "storage class not permitted here",
                        ));
                    }
                    let class = if token.kind == TokenKind::KwStatic {
                        StorageClass::Static
                    } else {
                        StorageClass::Extern
                    };
                    if storage.is_some() {
                        return Err(CompileError::parse(token.line, "multiple storage classes"));
                    }
                    storage = Some(class);
                }
                Some(TokenKind::KwStruct) | Some(TokenKind::KwUnion) => {
                    if struct_decl.is_some() || !specifiers.is_empty() {
                        return Err(CompileError::parse(line, "invalid type specifier"));
                    }
                    struct_decl = Some(self.parse_struct_specifier()?);
                }
                Some(kind) if starts_type(kind) => {
                    self.advance()?;
                    specifiers.push(kind);
                }
                _ => break,
            }
        }
        if let Some(decl) = struct_decl {
            if !specifiers.is_empty() {
                return Err(CompileError::parse(line, "invalid type specifier"));
            }
            let base = Rc::new(Type::Structure {
                tag: decl.tag,
                is_union: decl.is_union,
            });
            return Ok((base, storage, Some(decl)));
        }
        let base = self.combine_specifiers(&specifiers, line)?;
        Ok((base, storage, None))
    }

    fn combine_specifiers(
        &self,
        specifiers: &[TokenKind],
        line: usize,
    ) -> Result<Rc<Type>, CompileError> {
        use TokenKind::*;
        let count = |kind: TokenKind| specifiers.iter().filter(|&&k| k == kind).count();
        let invalid = || CompileError::parse(line, "invalid type specifier");
        if specifiers.is_empty() {
            return Err(CompileError::parse(line, "expected a type specifier"));
        }
        for kind in [KwChar, KwInt, KwLong, KwDouble, KwSigned, KwUnsigned, KwVoid] {
            if count(kind) > 1 {
                return Err(invalid());
            }
        }
        let signed = count(KwSigned) > 0;
        let unsigned = count(KwUnsigned) > 0;
        if signed && unsigned {
            return Err(invalid());
        }
        if count(KwVoid) > 0 {
            if specifiers.len() > 1 {
                return Err(invalid());
            }
            return Ok(Rc::new(Type::Void));
        }
        if count(KwDouble) > 0 {
            if specifiers.len() > 1 {
                return Err(invalid());
            }
            return Ok(Rc::new(Type::Double));
        }
        if count(KwChar) > 0 {
            if count(KwInt) > 0 || count(KwLong) > 0 {
                return Err(invalid());
            }
            let ty = if signed {
                Type::SChar
            } else if unsigned {
                Type::UChar
            } else {
                Type::Char
            };
            return Ok(Rc::new(ty));
        }
        let ty = match (count(KwLong) > 0, unsigned) {
            (true, true) => Type::ULong,
            (true, false) => Type::Long,
            (false, true) => Type::UInt,
            (false, false) => Type::Int,
        };
        Ok(Rc::new(ty))
    }

    fn parse_struct_specifier(&mut self) -> Result<StructDecl, CompileError> {
        let keyword = self.advance()?;
        let is_union = keyword.kind == TokenKind::KwUnion;
        let (tag, line) = self.expect_identifier()?;
        let mut members = Vec::new();
        if self.eat(TokenKind::OpenBrace) {
            while self.peek_kind() != Some(TokenKind::CloseBrace) {
                members.push(self.parse_member_declaration()?);
            }
            self.expect(TokenKind::CloseBrace, "'}'")?;
            if members.is_empty() {
                return Err(CompileError::parse(
                    line,
                    "structure definition with no members",
                ));
            }
        }
        Ok(StructDecl {
            tag,
            is_union,
            members,
            line,
        })
    }

    fn parse_member_declaration(&mut self) -> Result<MemberDecl, CompileError> {
        let (base_type, _, struct_decl) = self.parse_specifiers(false)?;
        if let Some(decl) = &struct_decl
            && !decl.members.is_empty()
        {
            return Err(CompileError::parse(
                decl.line,
                "nested structure definition; define the member type separately",
            ));
        }
        let declarator = self.parse_declarator()?;
        let (name, member_type, _, line) = self.process_declarator(&declarator, base_type)?;
        if let Type::Fun(_) = &*member_type {
            return Err(CompileError::parse(line, "function member in structure"));
        }
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(MemberDecl {
            name,
            member_type,
            line,
        })
    }

    // ------------------------------------------------------------------
    // Declarators

    fn parse_declarator(&mut self) -> Result<Declarator, CompileError> {
        if self.eat(TokenKind::Star) {
            let inner = self.parse_declarator()?;
            return Ok(Declarator::Pointer(Box::new(inner)));
        }
        self.parse_direct_declarator()
    }

    fn parse_direct_declarator(&mut self) -> Result<Declarator, CompileError> {
        let token = self.advance()?;
        let mut declarator = match token.kind {
            TokenKind::Identifier => Declarator::Name(token.text, token.line),
            TokenKind::OpenParen => {
                let inner = self.parse_declarator()?;
                self.expect(TokenKind::CloseParen, "')'")?;
                inner
            }
            _ => return Err(self.unexpected(&token, "a declarator")),
        };
        loop {
            match self.peek_kind() {
                Some(TokenKind::OpenBracket) => {
                    self.advance()?;
                    let size = self.parse_array_size()?;
                    self.expect(TokenKind::CloseBracket, "']'")?;
                    declarator = Declarator::Array(Box::new(declarator), size);
                }
                Some(TokenKind::OpenParen) => {
                    let line = self.current_line();
                    self.advance()?;
                    let params = self.parse_param_list()?;
                    declarator = Declarator::Fun(params, Box::new(declarator), line);
                }
                _ => break,
            }
        }
        Ok(declarator)
    }

    fn parse_array_size(&mut self) -> Result<i64, CompileError> {
        let token = self.advance()?;
        let value = match token.kind {
            TokenKind::IntConstant | TokenKind::LongConstant => {
                match self.parse_int_const(&token)? {
                    Const::Int(v) => v as i64,
                    Const::Long(v) => v,
                    _ => unreachable!(),
                }
            }
            TokenKind::UIntConstant | TokenKind::ULongConstant => {
                match self.parse_int_const(&token)? {
                    Const::UInt(v) => v as i64,
                    Const::ULong(v) if v <= i64::MAX as u64 => v as i64,
                    _ => {
                        return Err(CompileError::parse(token.line, "array size out of range"));
                    }
                }
            }
            _ => return Err(self.unexpected(&token, "an array size")),
        };
        if value < 1 {
            return Err(CompileError::parse(token.line, "array size must be positive"));
        }
        Ok(value)
    }

    fn parse_param_list(&mut self) -> Result<Vec<Param>, CompileError> {
        if self.peek_kind() == Some(TokenKind::KwVoid)
            && self.peek_kind_at(1) == Some(TokenKind::CloseParen)
        {
            self.advance()?;
            self.advance()?;
            return Ok(Vec::new());
        }
        let mut params = Vec::new();
        loop {
            let line = self.current_line();
            let (base_type, _, struct_decl) = self.parse_specifiers(false)?;
            if let Some(decl) = &struct_decl
                && !decl.members.is_empty()
            {
                return Err(CompileError::parse(line, "structure definition in parameter"));
            }
            let declarator = self.parse_declarator()?;
            let (name, param_type, _, name_line) =
                self.process_declarator(&declarator, base_type)?;
            if matches!(&*param_type, Type::Void) {
                return Err(CompileError::parse(name_line, "parameter of void type"));
            }
            params.push(Param {
                name,
                param_type,
                line: name_line,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::CloseParen, "')'")?;
        Ok(params)
    }

    /// Fold a declarator onto a base type, producing the declared name, the
    /// derived type, and parameter names for function declarators.
    fn process_declarator(
        &mut self,
        declarator: &Declarator,
        base_type: Rc<Type>,
    ) -> Result<(Ident, Rc<Type>, Vec<Ident>, usize), CompileError> {
        match declarator {
            Declarator::Name(name, line) => Ok((*name, base_type, Vec::new(), *line)),
            Declarator::Pointer(inner) => {
                self.process_declarator(inner, Rc::new(Type::Pointer(base_type)))
            }
            Declarator::Array(inner, size) => self.process_declarator(
                inner,
                Rc::new(Type::Array {
                    elem: base_type,
                    size: *size,
                }),
            ),
            Declarator::Fun(params, inner, line) => {
                let Declarator::Name(name, name_line) = &**inner else {
                    return Err(CompileError::parse(
                        *line,
                        "cannot apply further derivations to a function declarator",
                    ));
                };
                let mut param_types = Vec::with_capacity(params.len());
                let mut param_names = Vec::with_capacity(params.len());
                for param in params {
                    param_types.push(Rc::clone(&param.param_type));
                    param_names.push(param.name);
                }
                let fun_type = Rc::new(Type::Fun(Rc::new(FunType::new(param_types, base_type))));
                Ok((*name, fun_type, param_names, *name_line))
            }
        }
    }

    fn parse_abstract_declarator(&mut self) -> Result<AbstractDeclarator, CompileError> {
        if self.eat(TokenKind::Star) {
            let inner = self.parse_abstract_declarator()?;
            return Ok(AbstractDeclarator::Pointer(Box::new(inner)));
        }
        self.parse_direct_abstract_declarator()
    }

    fn parse_direct_abstract_declarator(&mut self) -> Result<AbstractDeclarator, CompileError> {
        let mut declarator = if self.peek_kind() == Some(TokenKind::OpenParen) {
            self.advance()?;
            let inner = self.parse_abstract_declarator()?;
            self.expect(TokenKind::CloseParen, "')'")?;
            inner
        } else {
            AbstractDeclarator::Base
        };
        while self.peek_kind() == Some(TokenKind::OpenBracket) {
            self.advance()?;
            let size = self.parse_array_size()?;
            self.expect(TokenKind::CloseBracket, "']'")?;
            declarator = AbstractDeclarator::Array(Box::new(declarator), size);
        }
        Ok(declarator)
    }

    fn process_abstract_declarator(
        declarator: &AbstractDeclarator,
        base_type: Rc<Type>,
    ) -> Rc<Type> {
        match declarator {
            AbstractDeclarator::Base => base_type,
            AbstractDeclarator::Pointer(inner) => {
                Self::process_abstract_declarator(inner, Rc::new(Type::Pointer(base_type)))
            }
            AbstractDeclarator::Array(inner, size) => Self::process_abstract_declarator(
                inner,
                Rc::new(Type::Array {
                    elem: base_type,
                    size: *size,
                }),
            ),
        }
    }

    /// Parse a type name, as used in casts and `sizeof(T)`.
    fn parse_type_name(&mut self) -> Result<Rc<Type>, CompileError> {
        let line = self.current_line();
        let (base_type, _, struct_decl) = self.parse_specifiers(false)?;
        if let Some(decl) = &struct_decl
            && !decl.members.is_empty()
        {
            return Err(CompileError::parse(line, "structure definition in type name"));
        }
        let declarator = self.parse_abstract_declarator()?;
        Ok(Self::process_abstract_declarator(&declarator, base_type))
    }

    // ------------------------------------------------------------------
    // Initializers

    fn parse_initializer(&mut self) -> Result<Initializer, CompileError> {
        if self.peek_kind() != Some(TokenKind::OpenBrace) {
            let exp = self.parse_exp(0)?;
            return Ok(Initializer::Single {
                exp,
                init_type: None,
            });
        }
        let line = self.current_line();
        self.advance()?;
        if self.peek_kind() == Some(TokenKind::CloseBrace) {
            return Err(CompileError::parse(line, "empty compound initializer"));
        }
        let mut inits = Vec::new();
        loop {
            inits.push(self.parse_initializer()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
            // Trailing comma.
            if self.peek_kind() == Some(TokenKind::CloseBrace) {
                break;
            }
        }
        self.expect(TokenKind::CloseBrace, "'}'")?;
        Ok(Initializer::Compound {
            inits,
            init_type: None,
            line,
        })
    }

    // ------------------------------------------------------------------
    // Statements

    fn parse_block(&mut self) -> Result<Block, CompileError> {
        let mut items = Vec::new();
        while self.peek_kind() != Some(TokenKind::CloseBrace) {
            if self.peek().is_none() {
                return Err(self.eof_error());
            }
            items.push(self.parse_block_item()?);
        }
        self.expect(TokenKind::CloseBrace, "'}'")?;
        Ok(Block { items })
    }

    fn parse_block_item(&mut self) -> Result<BlockItem, CompileError> {
        if let Some(kind) = self.peek_kind()
            && starts_declaration(kind)
        {
            return Ok(BlockItem::Decl(self.parse_declaration()?));
        }
        Ok(BlockItem::Stmt(self.parse_statement()?))
    }

    fn parse_statement(&mut self) -> Result<Statement, CompileError> {
        let line = self.current_line();
        match self.peek_kind() {
            Some(TokenKind::Semicolon) => {
                self.advance()?;
                Ok(Statement::Null)
            }
            Some(TokenKind::OpenBrace) => {
                self.advance()?;
                Ok(Statement::Compound(self.parse_block()?))
            }
            Some(TokenKind::KwReturn) => {
                self.advance()?;
                let exp = if self.peek_kind() == Some(TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_exp(0)?)
                };
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Statement::Return { exp, line })
            }
            Some(TokenKind::KwIf) => {
                self.advance()?;
                self.expect(TokenKind::OpenParen, "'('")?;
                let cond = self.parse_exp(0)?;
                self.expect(TokenKind::CloseParen, "')'")?;
                let then_stmt = Box::new(self.parse_statement()?);
                let else_stmt = if self.eat(TokenKind::KwElse) {
                    Some(Box::new(self.parse_statement()?))
                } else {
                    None
                };
                Ok(Statement::If {
                    cond,
                    then_stmt,
                    else_stmt,
                })
            }
            Some(TokenKind::KwWhile) => {
                self.advance()?;
                self.expect(TokenKind::OpenParen, "'('")?;
                let cond = self.parse_exp(0)?;
                self.expect(TokenKind::CloseParen, "')'")?;
                let body = Box::new(self.parse_statement()?);
                Ok(Statement::While {
                    label: None,
                    cond,
                    body,
                })
            }
            Some(TokenKind::KwDo) => {
                self.advance()?;
                let body = Box::new(self.parse_statement()?);
                self.expect(TokenKind::KwWhile, "'while'")?;
                self.expect(TokenKind::OpenParen, "'('")?;
                let cond = self.parse_exp(0)?;
                self.expect(TokenKind::CloseParen, "')'")?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Statement::DoWhile {
                    label: None,
                    body,
                    cond,
                })
            }
            Some(TokenKind::KwFor) => {
                self.advance()?;
                self.expect(TokenKind::OpenParen, "'('")?;
                let init = self.parse_for_init()?;
                let cond = if self.peek_kind() == Some(TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_exp(0)?)
                };
                self.expect(TokenKind::Semicolon, "';'")?;
                let post = if self.peek_kind() == Some(TokenKind::CloseParen) {
                    None
                } else {
                    Some(self.parse_exp(0)?)
                };
                self.expect(TokenKind::CloseParen, "')'")?;
                let body = Box::new(self.parse_statement()?);
                Ok(Statement::For {
                    label: None,
                    init,
                    cond,
                    post,
                    body,
                })
            }
            Some(TokenKind::KwSwitch) => {
                self.advance()?;
                self.expect(TokenKind::OpenParen, "'('")?;
                let cond = self.parse_exp(0)?;
                self.expect(TokenKind::CloseParen, "')'")?;
                let body = Box::new(self.parse_statement()?);
                Ok(Statement::Switch {
                    label: None,
                    cond,
                    body,
                    cases: Vec::new(),
                    has_default: false,
                    line,
                })
            }
            Some(TokenKind::KwCase) => {
                self.advance()?;
                let value = self.parse_exp(0)?;
                self.expect(TokenKind::Colon, "':'")?;
                let stmt = Box::new(self.parse_statement()?);
                Ok(Statement::Case {
                    value,
                    stmt,
                    label: None,
                    line,
                })
            }
            Some(TokenKind::KwDefault) => {
                self.advance()?;
                self.expect(TokenKind::Colon, "':'")?;
                let stmt = Box::new(self.parse_statement()?);
                Ok(Statement::Default {
                    stmt,
                    label: None,
                    line,
                })
            }
            Some(TokenKind::KwBreak) => {
                self.advance()?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Statement::Break { label: None, line })
            }
            Some(TokenKind::KwContinue) => {
                self.advance()?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Statement::Continue { label: None, line })
            }
            Some(TokenKind::KwGoto) => {
                self.advance()?;
                let (target, _) = self.expect_identifier()?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Statement::Goto { target, line })
            }
            Some(TokenKind::Identifier)
                if self.peek_kind_at(1) == Some(TokenKind::Colon) =>
            {
                let (name, line) = self.expect_identifier()?;
                self.advance()?; // ':'
                let stmt = Box::new(self.parse_statement()?);
                Ok(Statement::Label { name, stmt, line })
            }
            Some(_) => {
                let exp = self.parse_exp(0)?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Statement::Expression(exp))
            }
            None => Err(self.eof_error()),
        }
    }

    fn parse_for_init(&mut self) -> Result<ForInit, CompileError> {
        if let Some(kind) = self.peek_kind()
            && starts_declaration(kind)
        {
            let line = self.current_line();
            let decl = self.parse_declaration()?;
            let Declaration::Var(var_decl) = decl else {
                return Err(CompileError::parse(
                    line,
                    "only a variable declaration may open a for loop",
                ));
            };
            if var_decl.storage.is_some() {
                return Err(CompileError::parse(
                    line,
                    "storage class in for loop initializer",
                ));
            }
            return Ok(ForInit::Decl(var_decl));
        }
        let exp = if self.peek_kind() == Some(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_exp(0)?)
        };
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(ForInit::Exp(exp))
    }

    // ------------------------------------------------------------------
    // Expressions

    fn parse_exp(&mut self, min_prec: i32) -> Result<Exp, CompileError> {
        let mut lhs = self.parse_unary_exp()?;
        while let Some(token) = self.peek() {
            let Some(prec) = precedence(token.kind) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            let op_token = self.advance()?;
            let line = op_token.line;
            if op_token.kind == TokenKind::Assign {
                let rhs = self.parse_exp(prec)?;
                lhs = Exp::new(
                    ExpKind::Assignment {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    line,
                );
            } else if let Some(op) = compound_op(op_token.kind) {
                let rhs = self.parse_exp(prec)?;
                lhs = Exp::new(
                    ExpKind::CompoundAssignment {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        common: None,
                    },
                    line,
                );
            } else if op_token.kind == TokenKind::Question {
                let then_exp = self.parse_exp(0)?;
                self.expect(TokenKind::Colon, "':'")?;
                let else_exp = self.parse_exp(prec)?;
                lhs = Exp::new(
                    ExpKind::Conditional {
                        cond: Box::new(lhs),
                        then_exp: Box::new(then_exp),
                        else_exp: Box::new(else_exp),
                    },
                    line,
                );
            } else {
                let rhs = self.parse_exp(prec + 1)?;
                lhs = Exp::new(
                    ExpKind::Binary {
                        op: binary_op(op_token.kind),
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    line,
                );
            }
        }
        Ok(lhs)
    }

    fn parse_unary_exp(&mut self) -> Result<Exp, CompileError> {
        let line = self.current_line();
        match self.peek_kind() {
            Some(TokenKind::Minus) => self.parse_prefix_unary(UnaryOp::Negate, line),
            Some(TokenKind::Complement) => self.parse_prefix_unary(UnaryOp::Complement, line),
            Some(TokenKind::Not) => self.parse_prefix_unary(UnaryOp::Not, line),
            Some(TokenKind::Star) => {
                self.advance()?;
                let exp = self.parse_unary_exp()?;
                Ok(Exp::new(ExpKind::Dereference(Box::new(exp)), line))
            }
            Some(TokenKind::Ampersand) => {
                self.advance()?;
                let exp = self.parse_unary_exp()?;
                Ok(Exp::new(ExpKind::AddrOf(Box::new(exp)), line))
            }
            Some(TokenKind::Incr) | Some(TokenKind::Decr) => {
                let token = self.advance()?;
                let op = if token.kind == TokenKind::Incr {
                    BinaryOp::Add
                } else {
                    BinaryOp::Subtract
                };
                let exp = self.parse_unary_exp()?;
                let one = Exp::new(ExpKind::Constant(Const::Int(1)), line);
                Ok(Exp::new(
                    ExpKind::CompoundAssignment {
                        op,
                        lhs: Box::new(exp),
                        rhs: Box::new(one),
                        common: None,
                    },
                    line,
                ))
            }
            Some(TokenKind::KwSizeof) => {
                self.advance()?;
                if self.peek_kind() == Some(TokenKind::OpenParen)
                    && self
                        .peek_kind_at(1)
                        .is_some_and(starts_type)
                {
                    self.advance()?;
                    let target = self.parse_type_name()?;
                    self.expect(TokenKind::CloseParen, "')'")?;
                    return Ok(Exp::new(ExpKind::SizeOfT(target), line));
                }
                let exp = self.parse_unary_exp()?;
                Ok(Exp::new(ExpKind::SizeOf(Box::new(exp)), line))
            }
            Some(TokenKind::OpenParen)
                if self.peek_kind_at(1).is_some_and(starts_type) =>
            {
                self.advance()?;
                let target = self.parse_type_name()?;
                self.expect(TokenKind::CloseParen, "')'")?;
                let exp = self.parse_unary_exp()?;
                Ok(Exp::new(
                    ExpKind::Cast {
                        target,
                        exp: Box::new(exp),
                    },
                    line,
                ))
            }
            _ => self.parse_postfix_exp(),
        }
    }

    fn parse_prefix_unary(&mut self, op: UnaryOp, line: usize) -> Result<Exp, CompileError> {
        self.advance()?;
        let exp = self.parse_unary_exp()?;
        Ok(Exp::new(
            ExpKind::Unary {
                op,
                exp: Box::new(exp),
            },
            line,
        ))
    }

    fn parse_postfix_exp(&mut self) -> Result<Exp, CompileError> {
        let mut exp = self.parse_primary_exp()?;
        loop {
            let line = self.current_line();
            match self.peek_kind() {
                Some(TokenKind::OpenBracket) => {
                    self.advance()?;
                    let index = self.parse_exp(0)?;
                    self.expect(TokenKind::CloseBracket, "']'")?;
                    exp = Exp::new(
                        ExpKind::Subscript {
                            base: Box::new(exp),
                            index: Box::new(index),
                        },
                        line,
                    );
                }
                Some(TokenKind::Dot) => {
                    self.advance()?;
                    let (member, _) = self.expect_identifier()?;
                    exp = Exp::new(
                        ExpKind::Dot {
                            structure: Box::new(exp),
                            member,
                        },
                        line,
                    );
                }
                Some(TokenKind::Arrow) => {
                    self.advance()?;
                    let (member, _) = self.expect_identifier()?;
                    exp = Exp::new(
                        ExpKind::Arrow {
                            pointer: Box::new(exp),
                            member,
                        },
                        line,
                    );
                }
                Some(TokenKind::Incr) | Some(TokenKind::Decr) => {
                    let token = self.advance()?;
                    let op = if token.kind == TokenKind::Incr {
                        BinaryOp::Add
                    } else {
                        BinaryOp::Subtract
                    };
                    exp = Exp::new(
                        ExpKind::Postfix {
                            op,
                            exp: Box::new(exp),
                            common: None,
                        },
                        line,
                    );
                }
                _ => break,
            }
        }
        Ok(exp)
    }

    fn parse_primary_exp(&mut self) -> Result<Exp, CompileError> {
        let token = self.advance()?;
        let line = token.line;
        match token.kind {
            TokenKind::IntConstant
            | TokenKind::LongConstant
            | TokenKind::UIntConstant
            | TokenKind::ULongConstant => {
                let value = self.parse_int_const(&token)?;
                Ok(Exp::new(ExpKind::Constant(value), line))
            }
            TokenKind::DoubleConstant => {
                let text = self.token_text(&token);
                let value: f64 = text.parse().map_err(|_| {
                    CompileError::parse(line, format!("invalid floating constant '{}'", text))
                })?;
                Ok(Exp::new(ExpKind::Constant(Const::Double(value)), line))
            }
            TokenKind::CharConstant => {
                let value = self.decode_char_constant(&token)?;
                // A character constant has type int.
                Ok(Exp::new(ExpKind::Constant(Const::Int(value)), line))
            }
            TokenKind::StringLiteral => {
                let mut bytes = self.decode_string_literal(&token)?;
                // Adjacent string literals concatenate.
                while self.peek_kind() == Some(TokenKind::StringLiteral) {
                    let next = self.advance()?;
                    bytes.extend(self.decode_string_literal(&next)?);
                }
                Ok(Exp::new(ExpKind::String(bytes), line))
            }
            TokenKind::Identifier => {
                if self.peek_kind() == Some(TokenKind::OpenParen) {
                    self.advance()?;
                    let mut args = Vec::new();
                    if self.peek_kind() != Some(TokenKind::CloseParen) {
                        loop {
                            args.push(self.parse_exp(0)?);
                            if !self.eat(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::CloseParen, "')'")?;
                    return Ok(Exp::new(
                        ExpKind::Call {
                            name: token.text,
                            args,
                        },
                        line,
                    ));
                }
                Ok(Exp::new(ExpKind::Var(token.text), line))
            }
            TokenKind::OpenParen => {
                let exp = self.parse_exp(0)?;
                self.expect(TokenKind::CloseParen, "')'")?;
                Ok(exp)
            }
            _ => Err(self.unexpected(&token, "an expression")),
        }
    }

    fn parse_int_const(&self, token: &Token) -> Result<Const, CompileError> {
        let text = self.token_text(token);
        let digits = text.trim_end_matches(['u', 'U', 'l', 'L']);
        let value: u128 = digits
            .parse()
            .map_err(|_| CompileError::parse(token.line, "constant out of range"))?;
        let out_of_range = || CompileError::parse(token.line, "constant out of range");
        let constant = match token.kind {
            TokenKind::IntConstant => {
                if value <= i32::MAX as u128 {
                    Const::Int(value as i32)
                } else if value <= i64::MAX as u128 {
                    Const::Long(value as i64)
                } else {
                    return Err(out_of_range());
                }
            }
            TokenKind::LongConstant => {
                if value <= i64::MAX as u128 {
                    Const::Long(value as i64)
                } else {
                    return Err(out_of_range());
                }
            }
            TokenKind::UIntConstant => {
                if value <= u32::MAX as u128 {
                    Const::UInt(value as u32)
                } else if value <= u64::MAX as u128 {
                    Const::ULong(value as u64)
                } else {
                    return Err(out_of_range());
                }
            }
            TokenKind::ULongConstant => {
                if value <= u64::MAX as u128 {
                    Const::ULong(value as u64)
                } else {
                    return Err(out_of_range());
                }
            }
            _ => unreachable!(),
        };
        Ok(constant)
    }

    fn decode_char_constant(&self, token: &Token) -> Result<i32, CompileError> {
        let text = self.token_text(token);
        let inner = &text[1..text.len() - 1];
        let mut chars = inner.chars();
        let first = chars.next().unwrap();
        let value = if first == '\\' {
            let escape = chars.next().unwrap();
            decode_escape(escape)
                .ok_or_else(|| {
                    CompileError::parse(token.line, format!("invalid escape '\\{}'", escape))
                })?
        } else {
            first as u8
        };
        Ok(value as i32)
    }

    fn decode_string_literal(&self, token: &Token) -> Result<Vec<u8>, CompileError> {
        let text = self.token_text(token).to_string();
        let inner = &text[1..text.len() - 1];
        let mut bytes = Vec::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                let escape = chars.next().unwrap();
                let value = decode_escape(escape).ok_or_else(|| {
                    CompileError::parse(token.line, format!("invalid escape '\\{}'", escape))
                })?;
                bytes.push(value);
            } else {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
        Ok(bytes)
    }
}

fn decode_escape(c: char) -> Option<u8> {
    let value = match c {
        '\'' => b'\'',
        '"' => b'"',
        '?' => b'?',
        '\\' => b'\\',
        'a' => 7,
        'b' => 8,
        'f' => 12,
        'n' => b'\n',
        'r' => b'\r',
        't' => b'\t',
        'v' => 11,
        '0' => 0,
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse_ok(source: &str) -> Program {
        let mut interner = Interner::new();
        let tokens = Lexer::new(&mut interner, &[]).tokenize(source, None).unwrap();
        Parser::new(tokens, &mut interner).parse().unwrap()
    }

    fn parse_err(source: &str) -> CompileError {
        let mut interner = Interner::new();
        let tokens = Lexer::new(&mut interner, &[]).tokenize(source, None).unwrap();
        Parser::new(tokens, &mut interner).parse().unwrap_err()
    }

    #[test]
    fn function_with_body() {
        let program = parse_ok("int main(void) { return 2 + 3 * 4; }");
        assert_eq!(program.decls.len(), 1);
        let Declaration::Fun(fun) = &program.decls[0] else {
            panic!("expected a function");
        };
        assert!(fun.body.is_some());
        let Type::Fun(fun_type) = &*fun.fun_type else {
            panic!("expected a function type");
        };
        assert!(fun_type.params.is_empty());
        assert_eq!(*fun_type.ret, Type::Int);
    }

    #[test]
    fn precedence_shapes_the_tree() {
        let program = parse_ok("int main(void) { return 2 + 3 * 4; }");
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Stmt(Statement::Return { exp: Some(exp), .. }) =
            &fun.body.as_ref().unwrap().items[0]
        else {
            panic!("expected return");
        };
        let ExpKind::Binary {
            op: BinaryOp::Add,
            rhs,
            ..
        } = &exp.kind
        else {
            panic!("expected + at the top");
        };
        assert!(matches!(
            rhs.kind,
            ExpKind::Binary {
                op: BinaryOp::Multiply,
                ..
            }
        ));
    }

    #[test]
    fn declarators_fold_onto_base_types() {
        let program = parse_ok("int (*p)[3];");
        let Declaration::Var(var) = &program.decls[0] else {
            unreachable!()
        };
        // pointer to array of 3 int
        let Type::Pointer(inner) = &*var.var_type else {
            panic!("expected pointer");
        };
        assert!(matches!(&**inner, Type::Array { size: 3, .. }));

        let program = parse_ok("int *a[3];");
        let Declaration::Var(var) = &program.decls[0] else {
            unreachable!()
        };
        // array of 3 pointer to int
        assert!(matches!(&*var.var_type, Type::Array { size: 3, .. }));
    }

    #[test]
    fn int_constant_widens_to_long() {
        let program = parse_ok("long x = 2147483648;");
        let Declaration::Var(var) = &program.decls[0] else {
            unreachable!()
        };
        let Some(Initializer::Single { exp, .. }) = &var.init else {
            panic!("expected initializer");
        };
        assert!(matches!(exp.kind, ExpKind::Constant(Const::Long(2147483648))));
    }

    #[test]
    fn overflowing_constant_is_rejected() {
        let err = parse_err("long x = 99999999999999999999;");
        assert!(matches!(err, CompileError::Parse { .. }));
    }

    #[test]
    fn empty_compound_initializer_is_rejected() {
        let err = parse_err("int a[3] = {};");
        assert!(matches!(err, CompileError::Parse { .. }));
    }

    #[test]
    fn prefix_increment_desugars_to_compound_assignment() {
        let program = parse_ok("int main(void) { int a = 0; ++a; a++; return a; }");
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let items = &fun.body.as_ref().unwrap().items;
        let BlockItem::Stmt(Statement::Expression(pre)) = &items[1] else {
            panic!()
        };
        assert!(matches!(
            pre.kind,
            ExpKind::CompoundAssignment {
                op: BinaryOp::Add,
                ..
            }
        ));
        let BlockItem::Stmt(Statement::Expression(post)) = &items[2] else {
            panic!()
        };
        assert!(matches!(
            post.kind,
            ExpKind::Postfix {
                op: BinaryOp::Add,
                ..
            }
        ));
    }

    #[test]
    fn struct_definition_and_member_access() {
        let program = parse_ok(
            "struct point { int x; int y; }; \
             int main(void) { struct point p; p.x = 1; return p.x; }",
        );
        let Declaration::Struct(decl) = &program.decls[0] else {
            panic!("expected struct declaration");
        };
        assert_eq!(decl.members.len(), 2);
        assert!(!decl.is_union);
    }

    #[test]
    fn sizeof_type_vs_expression() {
        let program = parse_ok("unsigned long a = sizeof(long); unsigned long b = sizeof a;");
        let Declaration::Var(a) = &program.decls[0] else {
            unreachable!()
        };
        let Some(Initializer::Single { exp, .. }) = &a.init else {
            panic!()
        };
        assert!(matches!(exp.kind, ExpKind::SizeOfT(_)));
    }

    #[test]
    fn cast_vs_parenthesized_expression() {
        let program = parse_ok("int main(void) { double d = 1.5; return (int) d + (2); }");
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Stmt(Statement::Return { exp: Some(exp), .. }) =
            &fun.body.as_ref().unwrap().items[1]
        else {
            panic!()
        };
        let ExpKind::Binary { lhs, .. } = &exp.kind else {
            panic!()
        };
        assert!(matches!(lhs.kind, ExpKind::Cast { .. }));
    }

    #[test]
    fn ternary_associates_right() {
        let program = parse_ok("int main(void) { int a = 1; return a ? 1 : a ? 2 : 3; }");
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Stmt(Statement::Return { exp: Some(exp), .. }) =
            &fun.body.as_ref().unwrap().items[1]
        else {
            panic!()
        };
        let ExpKind::Conditional { else_exp, .. } = &exp.kind else {
            panic!()
        };
        assert!(matches!(else_exp.kind, ExpKind::Conditional { .. }));
    }

    #[test]
    fn string_literals_concatenate() {
        let program = parse_ok(r#"int main(void) { char *s = "ab" "cd"; return 0; }"#);
        let Declaration::Fun(fun) = &program.decls[0] else {
            unreachable!()
        };
        let BlockItem::Decl(Declaration::Var(var)) = &fun.body.as_ref().unwrap().items[0] else {
            panic!()
        };
        let Some(Initializer::Single { exp, .. }) = &var.init else {
            panic!()
        };
        let ExpKind::String(bytes) = &exp.kind else {
            panic!()
        };
        assert_eq!(bytes, b"abcd");
    }
}
