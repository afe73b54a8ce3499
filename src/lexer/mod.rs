//! Lexical analysis for the expression language
//!
//! Converts source text into a stream of tokens. Attribute (`type@name`) and
//! external (`type$name`) accesses are recognised here as single tokens.

mod scanner;
mod token;

pub use scanner::Scanner;
pub use token::{IntSuffix, Token, TokenKind};
