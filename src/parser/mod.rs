//! Parser Module
//!
//! Parses the C-like kernel language into the [`Tree`] sum type consumed by
//! the compiler. Trees may also be built by hand; nodes parsed from text
//! carry statement locations for diagnostics.

mod ast;
mod source_parser;

pub use ast::{
    walk_expression, walk_expressions, BinaryOp, CrementOp, Declaration, Expression, Literal,
    Location, LoopKind, Statement, StatementKind, Tree, UnaryOp,
};
pub use source_parser::Parser;

use crate::error::Result;
use crate::lexer::Scanner;

/// Scan and parse source text
pub fn parse(source: &str) -> Result<Tree> {
    let tokens = Scanner::new(source).scan_tokens()?;
    Parser::new(tokens).parse()
}
