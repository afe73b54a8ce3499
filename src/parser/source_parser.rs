use super::ast::*;
use crate::error::{Error, Result};
use crate::lexer::{IntSuffix, Token, TokenKind};
use crate::types::Type;

/// Recursive descent parser over the scanned token stream
///
/// Precedence, lowest first: comma, assignment, ternary, `||`, `&&`, `|`,
/// `^`, `&`, equality, relational, shifts, additive, multiplicative, unary,
/// postfix.
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
}

impl Parser {
    /// Creates a new parser from tokens
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, current: 0 }
    }

    /// Parses the complete token stream into a tree
    pub fn parse(&mut self) -> Result<Tree> {
        let mut statements = Vec::new();
        while !self.is_at_end() {
            if self.match_kind(&TokenKind::Semicolon) {
                continue;
            }
            statements.push(self.statement()?);
        }
        Ok(Tree { statements })
    }

    fn statement(&mut self) -> Result<Statement> {
        let start = self.peek().clone();
        let loc = Some(Location {
            line: start.line,
            col: start.column,
        });

        let kind = match &start.kind {
            TokenKind::LeftBrace => {
                self.advance();
                StatementKind::Block(self.block_rest()?)
            }
            TokenKind::If => {
                self.advance();
                self.consume(&TokenKind::LeftParen, "Expected '(' after 'if'")?;
                let condition = self.comma_expression()?;
                self.consume(&TokenKind::RightParen, "Expected ')' after if condition")?;
                let then_branch = self.body()?;
                let else_branch = if self.match_kind(&TokenKind::Else) {
                    self.body()?
                } else {
                    Vec::new()
                };
                StatementKind::If {
                    condition,
                    then_branch,
                    else_branch,
                }
            }
            TokenKind::For => {
                self.advance();
                self.for_loop()?
            }
            TokenKind::While => {
                self.advance();
                self.consume(&TokenKind::LeftParen, "Expected '(' after 'while'")?;
                let condition = self.comma_expression()?;
                self.consume(&TokenKind::RightParen, "Expected ')' after while condition")?;
                let body = self.body()?;
                StatementKind::Loop {
                    kind: LoopKind::While,
                    init: None,
                    condition: Some(condition),
                    iteration: None,
                    body,
                }
            }
            TokenKind::Do => {
                self.advance();
                let body = self.body()?;
                self.consume(&TokenKind::While, "Expected 'while' after do body")?;
                self.consume(&TokenKind::LeftParen, "Expected '(' after 'while'")?;
                let condition = self.comma_expression()?;
                self.consume(&TokenKind::RightParen, "Expected ')' after while condition")?;
                self.consume(&TokenKind::Semicolon, "Expected ';' after do-while")?;
                StatementKind::Loop {
                    kind: LoopKind::DoWhile,
                    init: None,
                    condition: Some(condition),
                    iteration: None,
                    body,
                }
            }
            TokenKind::Return => {
                self.advance();
                self.consume(&TokenKind::Semicolon, "Expected ';' after 'return'")?;
                StatementKind::Return
            }
            TokenKind::Break => {
                self.advance();
                self.consume(&TokenKind::Semicolon, "Expected ';' after 'break'")?;
                StatementKind::Break
            }
            TokenKind::Continue => {
                self.advance();
                self.consume(&TokenKind::Semicolon, "Expected ';' after 'continue'")?;
                StatementKind::Continue
            }
            _ if self.at_declaration() => {
                let decls = self.declaration()?;
                self.consume(&TokenKind::Semicolon, "Expected ';' after declaration")?;
                StatementKind::Declare(decls)
            }
            _ => {
                let expr = self.comma_expression()?;
                self.consume(&TokenKind::Semicolon, "Expected ';' after expression")?;
                StatementKind::Expression(expr)
            }
        };

        Ok(Statement { kind, loc })
    }

    /// Statements up to the closing `}` (the `{` is already consumed)
    fn block_rest(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            if self.is_at_end() {
                return Err(self.error("Expected '}' to close block"));
            }
            if self.match_kind(&TokenKind::Semicolon) {
                continue;
            }
            statements.push(self.statement()?);
        }
        self.advance();
        Ok(statements)
    }

    /// Body of a branch or loop: a block or a single statement
    fn body(&mut self) -> Result<Vec<Statement>> {
        if self.match_kind(&TokenKind::LeftBrace) {
            self.block_rest()
        } else if self.match_kind(&TokenKind::Semicolon) {
            Ok(Vec::new())
        } else {
            Ok(vec![self.statement()?])
        }
    }

    fn for_loop(&mut self) -> Result<StatementKind> {
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'for'")?;

        let init = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            let t = self.peek().clone();
            let loc = Some(Location {
                line: t.line,
                col: t.column,
            });
            let kind = if self.at_declaration() {
                StatementKind::Declare(self.declaration()?)
            } else {
                StatementKind::Expression(self.comma_expression()?)
            };
            Some(Box::new(Statement { kind, loc }))
        };
        self.consume(&TokenKind::Semicolon, "Expected ';' after for initialiser")?;

        let condition = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.comma_expression()?)
        };
        self.consume(&TokenKind::Semicolon, "Expected ';' after for condition")?;

        let iteration = if self.check(&TokenKind::RightParen) {
            None
        } else {
            Some(self.comma_expression()?)
        };
        self.consume(&TokenKind::RightParen, "Expected ')' after for clauses")?;

        let body = self.body()?;
        Ok(StatementKind::Loop {
            kind: LoopKind::For,
            init,
            condition,
            iteration,
            body,
        })
    }

    /// A type name followed by an identifier starts a declaration
    fn at_declaration(&self) -> bool {
        match (&self.peek().kind, self.peek_kind(1)) {
            (TokenKind::Identifier(name), Some(TokenKind::Identifier(_))) => {
                Type::parse(name).is_some()
            }
            _ => false,
        }
    }

    fn declaration(&mut self) -> Result<Vec<Declaration>> {
        let ty = match &self.advance().kind {
            TokenKind::Identifier(name) => Type::parse(name),
            _ => None,
        }
        .ok_or_else(|| self.error_previous("Expected a type name"))?;
        if ty.is_void() {
            return Err(self.error_previous("Cannot declare a local of type void"));
        }

        let mut decls = Vec::new();
        loop {
            let name = match &self.advance().kind {
                TokenKind::Identifier(n) => n.clone(),
                _ => return Err(self.error_previous("Expected variable name")),
            };
            let init = if self.match_kind(&TokenKind::Assign) {
                Some(self.assignment()?)
            } else {
                None
            };
            decls.push(Declaration { ty, name, init });
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        Ok(decls)
    }

    // ---------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------

    fn comma_expression(&mut self) -> Result<Expression> {
        let first = self.assignment()?;
        if !self.check(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.match_kind(&TokenKind::Comma) {
            items.push(self.assignment()?);
        }
        Ok(Expression::Comma(items))
    }

    fn assignment(&mut self) -> Result<Expression> {
        let target = self.ternary()?;

        let op = match &self.peek().kind {
            TokenKind::Assign => None,
            TokenKind::CompoundAssign(sym) => Some(
                BinaryOp::from_compound(sym)
                    .ok_or_else(|| self.error("Unknown compound assignment"))?,
            ),
            _ => return Ok(target),
        };
        self.advance();

        if !target.is_addressable() {
            return Err(self.error_previous("Left hand side of assignment is not assignable"));
        }
        let value = self.assignment()?;
        Ok(Expression::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    fn ternary(&mut self) -> Result<Expression> {
        let condition = self.logical_or()?;
        if !self.match_kind(&TokenKind::Question) {
            return Ok(condition);
        }
        let then_expr = if self.check(&TokenKind::Colon) {
            None
        } else {
            Some(Box::new(self.assignment()?))
        };
        self.consume(&TokenKind::Colon, "Expected ':' in ternary expression")?;
        let else_expr = self.assignment()?;
        Ok(Expression::Ternary {
            condition: Box::new(condition),
            then_expr,
            else_expr: Box::new(else_expr),
        })
    }

    fn logical_or(&mut self) -> Result<Expression> {
        self.binary_level(0)
    }

    /// Left-associative binary levels from `||` (0) down to `* / %`
    fn binary_level(&mut self, level: usize) -> Result<Expression> {
        if level == BINARY_LEVELS {
            return self.unary();
        }

        let mut left = self.binary_level(level + 1)?;
        while let Some(op) = binary_operator(level, &self.peek().kind) {
            self.advance();
            let right = self.binary_level(level + 1)?;
            left = Expression::binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expression> {
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Minus),
            TokenKind::Plus => Some(UnaryOp::Plus),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.unary()?;
            // fold the sign into numeric literals so `-2147483648` stays an int32
            if op == UnaryOp::Minus {
                if let Expression::Value(lit) = &operand {
                    if let Some(neg) = negate_literal(lit) {
                        return Ok(Expression::Value(neg));
                    }
                }
            }
            return Ok(Expression::Unary {
                op,
                operand: Box::new(operand),
            });
        }

        let crement = match self.peek().kind {
            TokenKind::PlusPlus => Some(CrementOp::Increment),
            TokenKind::MinusMinus => Some(CrementOp::Decrement),
            _ => None,
        };
        if let Some(op) = crement {
            self.advance();
            let target = self.unary()?;
            if !target.is_addressable() {
                return Err(self.error_previous("Operand of increment/decrement is not assignable"));
            }
            return Ok(Expression::Crement {
                op,
                post: false,
                target: Box::new(target),
            });
        }

        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expression> {
        let mut expr = self.primary()?;
        loop {
            if self.match_kind(&TokenKind::LeftBracket) {
                let index = self.assignment()?;
                let index2 = if self.match_kind(&TokenKind::Comma) {
                    Some(Box::new(self.assignment()?))
                } else {
                    None
                };
                self.consume(&TokenKind::RightBracket, "Expected ']' after index")?;
                expr = Expression::ArrayUnpack {
                    expr: Box::new(expr),
                    index: Box::new(index),
                    index2,
                };
            } else if self.match_kind(&TokenKind::Dot) {
                let component = match &self.advance().kind {
                    TokenKind::Identifier(c) => component_index(c),
                    _ => None,
                }
                .ok_or_else(|| self.error_previous("Expected component x, y, z, w, r, g or b"))?;
                expr = Expression::ArrayUnpack {
                    expr: Box::new(expr),
                    index: Box::new(Expression::int(component)),
                    index2: None,
                };
            } else if self.check(&TokenKind::PlusPlus) || self.check(&TokenKind::MinusMinus) {
                let op = if self.advance().kind == TokenKind::PlusPlus {
                    CrementOp::Increment
                } else {
                    CrementOp::Decrement
                };
                if !expr.is_addressable() {
                    return Err(self.error_previous("Operand of increment/decrement is not assignable"));
                }
                expr = Expression::Crement {
                    op,
                    post: true,
                    target: Box::new(expr),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expression> {
        let token = self.advance().clone();
        match token.kind {
            TokenKind::True => Ok(Expression::Value(Literal::Bool(true))),
            TokenKind::False => Ok(Expression::Value(Literal::Bool(false))),
            TokenKind::Integer(v, suffix) => integer_literal(v, suffix)
                .map(Expression::Value)
                .ok_or_else(|| self.error_previous(&format!("Integer literal {} is out of range", v))),
            TokenKind::Float(v, single) => Ok(Expression::Value(if single {
                Literal::Float(v as f32)
            } else {
                Literal::Double(v)
            })),
            TokenKind::String(s) => Ok(Expression::Value(Literal::String(s))),

            TokenKind::Attribute(ty, name) => {
                let (ty, inferred) = self.access_type(ty)?;
                Ok(Expression::Attribute { name, ty, inferred })
            }
            TokenKind::External(ty, name) => {
                let (ty, inferred) = self.access_type(ty)?;
                Ok(Expression::External { name, ty, inferred })
            }

            TokenKind::Identifier(name) => {
                if !self.match_kind(&TokenKind::LeftParen) {
                    return Ok(Expression::Local(name));
                }
                let args = self.arguments()?;
                match Type::parse(&name) {
                    Some(ty) if ty.is_scalar() => {
                        if args.len() != 1 {
                            return Err(self.error_previous(&format!(
                                "Cast to {} takes exactly one argument",
                                ty
                            )));
                        }
                        let expr = args.into_iter().next().map(Box::new);
                        match expr {
                            Some(expr) => Ok(Expression::Cast { ty, expr }),
                            None => Err(self.error_previous("Missing cast operand")),
                        }
                    }
                    _ => Ok(Expression::Call { name, args }),
                }
            }

            TokenKind::LeftParen => {
                let expr = self.comma_expression()?;
                self.consume(&TokenKind::RightParen, "Expected ')' after expression")?;
                Ok(expr)
            }

            TokenKind::LeftBrace => {
                let mut items = vec![self.assignment()?];
                while self.match_kind(&TokenKind::Comma) {
                    items.push(self.assignment()?);
                }
                self.consume(&TokenKind::RightBrace, "Expected '}' after array elements")?;
                Ok(Expression::ArrayPack(items))
            }

            _ => Err(Error::SyntaxError {
                line: token.line,
                col: token.column,
                message: format!("Unexpected token '{}'", token.lexeme),
            }),
        }
    }

    /// Arguments after `(` up to and including `)`
    fn arguments(&mut self) -> Result<Vec<Expression>> {
        let mut args = Vec::new();
        if self.match_kind(&TokenKind::RightParen) {
            return Ok(args);
        }
        loop {
            args.push(self.assignment()?);
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after arguments")?;
        Ok(args)
    }

    /// Resolve the type prefix of an access token; untyped accesses are
    /// marked inferred and carry a float placeholder
    fn access_type(&self, ty: Option<String>) -> Result<(Type, bool)> {
        match ty {
            None => Ok((Type::FLOAT, true)),
            Some(name) => match Type::parse(&name) {
                Some(t) if !t.is_void() => Ok((t, false)),
                _ => Err(self.error_previous(&format!("Unknown access type '{}'", name))),
            },
        }
    }

    // ---------------------------------------------------------------
    // Token helpers
    // ---------------------------------------------------------------

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        let idx = self.current.min(self.tokens.len().saturating_sub(1));
        &self.tokens[idx]
    }

    fn peek_kind(&self, ahead: usize) -> Option<&TokenKind> {
        self.tokens.get(self.current + ahead).map(|t| &t.kind)
    }

    fn previous(&self) -> &Token {
        let idx = self.current.saturating_sub(1).min(self.tokens.len().saturating_sub(1));
        &self.tokens[idx]
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn match_kind(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> Result<&Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(message))
        }
    }

    fn error(&self, message: &str) -> Error {
        let t = self.peek();
        Error::SyntaxError {
            line: t.line,
            col: t.column,
            message: format!("{} (found '{}')", message, t.lexeme),
        }
    }

    fn error_previous(&self, message: &str) -> Error {
        let t = self.previous();
        Error::SyntaxError {
            line: t.line,
            col: t.column,
            message: message.to_string(),
        }
    }
}

const BINARY_LEVELS: usize = 10;

/// Operator of a token at one precedence level, `None` if it belongs elsewhere
fn binary_operator(level: usize, kind: &TokenKind) -> Option<BinaryOp> {
    let op = match (level, kind) {
        (0, TokenKind::OrOr) => BinaryOp::Or,
        (1, TokenKind::AndAnd) => BinaryOp::And,
        (2, TokenKind::Pipe) => BinaryOp::BitOr,
        (3, TokenKind::Caret) => BinaryOp::BitXor,
        (4, TokenKind::Ampersand) => BinaryOp::BitAnd,
        (5, TokenKind::EqualEqual) => BinaryOp::Eq,
        (5, TokenKind::NotEqual) => BinaryOp::NotEq,
        (6, TokenKind::Less) => BinaryOp::Lt,
        (6, TokenKind::LessEqual) => BinaryOp::LtEq,
        (6, TokenKind::Greater) => BinaryOp::Gt,
        (6, TokenKind::GreaterEqual) => BinaryOp::GtEq,
        (7, TokenKind::ShiftLeft) => BinaryOp::Shl,
        (7, TokenKind::ShiftRight) => BinaryOp::Shr,
        (8, TokenKind::Plus) => BinaryOp::Add,
        (8, TokenKind::Minus) => BinaryOp::Sub,
        (9, TokenKind::Star) => BinaryOp::Mul,
        (9, TokenKind::Slash) => BinaryOp::Div,
        (9, TokenKind::Percent) => BinaryOp::Mod,
        _ => return None,
    };
    Some(op)
}

fn integer_literal(v: i64, suffix: IntSuffix) -> Option<Literal> {
    match suffix {
        IntSuffix::Short => i16::try_from(v).ok().map(Literal::Int16),
        IntSuffix::None => {
            // allow the magnitude of i32::MIN so the unary minus can fold it
            if v == i32::MAX as i64 + 1 {
                Some(Literal::Int64(v))
            } else {
                i32::try_from(v).ok().map(Literal::Int32)
            }
        }
        IntSuffix::Long => Some(Literal::Int64(v)),
    }
}

fn negate_literal(lit: &Literal) -> Option<Literal> {
    Some(match lit {
        Literal::Int16(v) => Literal::Int16(v.wrapping_neg()),
        Literal::Int32(v) => Literal::Int32(v.wrapping_neg()),
        Literal::Int64(v) if *v == i32::MAX as i64 + 1 => Literal::Int32(i32::MIN),
        Literal::Int64(v) => Literal::Int64(v.wrapping_neg()),
        Literal::Float(v) => Literal::Float(-v),
        Literal::Double(v) => Literal::Double(-v),
        _ => return None,
    })
}

fn component_index(name: &str) -> Option<i32> {
    match name {
        "x" | "r" => Some(0),
        "y" | "g" => Some(1),
        "z" | "b" => Some(2),
        "w" | "a" => Some(3),
        _ => None,
    }
}
