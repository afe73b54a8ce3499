use super::token::{IntSuffix, Token, TokenKind};
use crate::error::{Error, Result};

/// Scanner for the expression language surface syntax
pub struct Scanner {
    /// Source code as character vector
    source: Vec<char>,
    /// Accumulated tokens
    tokens: Vec<Token>,
    /// Start position of current token
    start: usize,
    /// Current position in source
    current: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// Current column number (1-indexed)
    column: usize,
    /// Column at which the current token started
    start_column: usize,
}

impl Scanner {
    /// Creates a new scanner from source code
    pub fn new(source: &str) -> Self {
        Scanner {
            source: source.chars().collect(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            start_column: 1,
        }
    }

    /// Scans all tokens from source code and returns them as a vector
    pub fn scan_tokens(mut self) -> Result<Vec<Token>> {
        while !self.is_at_end() {
            self.start = self.current;
            self.start_column = self.column;
            self.scan_token()?;
        }

        self.tokens.push(Token::new(
            TokenKind::Eof,
            String::new(),
            self.line,
            self.column,
        ));

        Ok(self.tokens)
    }

    fn scan_token(&mut self) -> Result<()> {
        let c = self.advance();

        match c {
            ' ' | '\r' | '\t' => {}
            '\n' => self.newline(),

            '/' => {
                if self.match_char('/') {
                    self.skip_line_comment();
                } else if self.match_char('*') {
                    self.skip_block_comment()?;
                } else {
                    self.operator_or_compound("/", TokenKind::Slash);
                }
            }

            '(' => self.add_token(TokenKind::LeftParen),
            ')' => self.add_token(TokenKind::RightParen),
            '{' => self.add_token(TokenKind::LeftBrace),
            '}' => self.add_token(TokenKind::RightBrace),
            '[' => self.add_token(TokenKind::LeftBracket),
            ']' => self.add_token(TokenKind::RightBracket),
            ',' => self.add_token(TokenKind::Comma),
            ';' => self.add_token(TokenKind::Semicolon),
            '?' => self.add_token(TokenKind::Question),
            ':' => self.add_token(TokenKind::Colon),
            '~' => self.add_token(TokenKind::Tilde),

            '+' => {
                if self.match_char('+') {
                    self.add_token(TokenKind::PlusPlus);
                } else {
                    self.operator_or_compound("+", TokenKind::Plus);
                }
            }
            '-' => {
                if self.match_char('-') {
                    self.add_token(TokenKind::MinusMinus);
                } else {
                    self.operator_or_compound("-", TokenKind::Minus);
                }
            }
            '*' => self.operator_or_compound("*", TokenKind::Star),
            '%' => self.operator_or_compound("%", TokenKind::Percent),
            '^' => self.operator_or_compound("^", TokenKind::Caret),
            '&' => {
                if self.match_char('&') {
                    self.add_token(TokenKind::AndAnd);
                } else {
                    self.operator_or_compound("&", TokenKind::Ampersand);
                }
            }
            '|' => {
                if self.match_char('|') {
                    self.add_token(TokenKind::OrOr);
                } else {
                    self.operator_or_compound("|", TokenKind::Pipe);
                }
            }

            '=' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::EqualEqual);
                } else {
                    self.add_token(TokenKind::Assign);
                }
            }
            '!' => {
                if self.match_char('=') {
                    self.add_token(TokenKind::NotEqual);
                } else {
                    self.add_token(TokenKind::Bang);
                }
            }
            '<' => {
                if self.match_char('<') {
                    self.operator_or_compound("<<", TokenKind::ShiftLeft);
                } else if self.match_char('=') {
                    self.add_token(TokenKind::LessEqual);
                } else {
                    self.add_token(TokenKind::Less);
                }
            }
            '>' => {
                if self.match_char('>') {
                    self.operator_or_compound(">>", TokenKind::ShiftRight);
                } else if self.match_char('=') {
                    self.add_token(TokenKind::GreaterEqual);
                } else {
                    self.add_token(TokenKind::Greater);
                }
            }

            '.' => {
                if self.peek().is_ascii_digit() {
                    self.scan_number()?;
                } else {
                    self.add_token(TokenKind::Dot);
                }
            }

            '"' => self.scan_string()?,

            // inferred accesses: `@name`, `$name`
            '@' => {
                let name = self.scan_access_name()?;
                self.add_token(TokenKind::Attribute(None, name));
            }
            '$' => {
                let name = self.scan_access_name()?;
                self.add_token(TokenKind::External(None, name));
            }

            c if c.is_ascii_digit() => self.scan_number()?,

            c if c.is_alphabetic() || c == '_' => self.scan_identifier_or_keyword()?,

            _ => return Err(self.error(format!("Unexpected character '{}'", c))),
        }

        Ok(())
    }

    /// Emit `base=` as a compound assignment, otherwise the plain operator
    fn operator_or_compound(&mut self, op: &str, plain: TokenKind) {
        if self.match_char('=') {
            self.add_token(TokenKind::CompoundAssign(op.to_string()));
        } else {
            self.add_token(plain);
        }
    }

    fn skip_line_comment(&mut self) {
        while !self.is_at_end() && self.peek() != '\n' {
            self.advance();
        }
    }

    fn skip_block_comment(&mut self) -> Result<()> {
        loop {
            if self.is_at_end() {
                return Err(self.error("Unterminated block comment".to_string()));
            }
            let c = self.advance();
            if c == '\n' {
                self.newline();
            } else if c == '*' && self.match_char('/') {
                return Ok(());
            }
        }
    }

    fn scan_string(&mut self) -> Result<()> {
        let mut value = String::new();

        while !self.is_at_end() && self.peek() != '"' {
            if self.peek() == '\\' {
                self.advance();
                let escaped = self.advance();
                match escaped {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '0' => value.push('\0'),
                    '\\' => value.push('\\'),
                    '"' => value.push('"'),
                    _ => {
                        return Err(self.error(format!("Invalid escape sequence \\{}", escaped)));
                    }
                }
            } else {
                if self.peek() == '\n' {
                    self.advance();
                    self.newline();
                    value.push('\n');
                    continue;
                }
                value.push(self.advance());
            }
        }

        if self.is_at_end() {
            return Err(self.error("Unterminated string".to_string()));
        }

        self.advance(); // Closing "

        self.add_token(TokenKind::String(value));
        Ok(())
    }

    fn scan_number(&mut self) -> Result<()> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        let mut is_float = self.source[self.start] == '.';
        if self.peek() == '.' && !is_float {
            is_float = true;
            self.advance();
        }
        if is_float {
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        if matches!(self.peek(), 'e' | 'E')
            && (self.peek_next().is_ascii_digit() || matches!(self.peek_next(), '+' | '-'))
        {
            is_float = true;
            self.advance();
            if matches!(self.peek(), '+' | '-') {
                self.advance();
            }
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        let text: String = self.source[self.start..self.current].iter().collect();

        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.error(format!("Invalid float literal: {}", text)))?;
            let single = self.match_char('f');
            self.add_token(TokenKind::Float(value, single));
        } else if self.peek() == 'f' {
            // `1f` is a float literal
            self.advance();
            let value: f64 = text
                .parse()
                .map_err(|_| self.error(format!("Invalid float literal: {}", text)))?;
            self.add_token(TokenKind::Float(value, true));
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error(format!("Invalid integer literal: {}", text)))?;
            let suffix = if self.match_char('l') {
                IntSuffix::Long
            } else if self.match_char('s') {
                IntSuffix::Short
            } else {
                IntSuffix::None
            };
            self.add_token(TokenKind::Integer(value, suffix));
        }

        Ok(())
    }

    fn scan_identifier_or_keyword(&mut self) -> Result<()> {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }

        let text: String = self.source[self.start..self.current].iter().collect();

        // typed accesses: `float@name`, `v@P`, `int$seed`
        if self.peek() == '@' || self.peek() == '$' {
            let external = self.advance() == '$';
            let ty = expand_short_type(&text);
            let name = self.scan_access_name()?;
            let kind = if external {
                TokenKind::External(Some(ty), name)
            } else {
                TokenKind::Attribute(Some(ty), name)
            };
            self.add_token(kind);
            return Ok(());
        }

        let token_kind = TokenKind::keyword(&text).unwrap_or(TokenKind::Identifier(text));
        self.add_token(token_kind);
        Ok(())
    }

    fn scan_access_name(&mut self) -> Result<String> {
        let begin = self.current;
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }
        if begin == self.current {
            return Err(self.error("Expected a name after access token".to_string()));
        }
        Ok(self.source[begin..self.current].iter().collect())
    }

    fn newline(&mut self) {
        self.line += 1;
        self.column = 1;
    }

    fn error(&self, message: String) -> Error {
        Error::SyntaxError {
            line: self.line,
            col: self.start_column,
            message,
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current];
        self.current += 1;
        self.column += 1;
        c
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.source.len() {
            '\0'
        } else {
            self.source[self.current + 1]
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            false
        } else {
            self.current += 1;
            self.column += 1;
            true
        }
    }

    fn add_token(&mut self, kind: TokenKind) {
        let lexeme: String = self.source[self.start..self.current].iter().collect();
        self.tokens
            .push(Token::new(kind, lexeme, self.line, self.start_column));
    }
}

/// Expand the single-letter access prefixes
fn expand_short_type(prefix: &str) -> String {
    match prefix {
        "f" => "float",
        "i" => "int32",
        "v" => "vec3f",
        "s" => "string",
        other => other,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Scanner::new(source)
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_declaration() {
        assert_eq!(
            kinds("int a = 1 + 2;"),
            vec![
                TokenKind::Identifier("int".into()),
                TokenKind::Identifier("a".into()),
                TokenKind::Assign,
                TokenKind::Integer(1, IntSuffix::None),
                TokenKind::Plus,
                TokenKind::Integer(2, IntSuffix::None),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_access_tokens() {
        let k = kinds("v@P f@density @age vec3d@vel $scale int$seed");
        assert_eq!(k[0], TokenKind::Attribute(Some("vec3f".into()), "P".into()));
        assert_eq!(k[1], TokenKind::Attribute(Some("float".into()), "density".into()));
        assert_eq!(k[2], TokenKind::Attribute(None, "age".into()));
        assert_eq!(k[3], TokenKind::Attribute(Some("vec3d".into()), "vel".into()));
        assert_eq!(k[4], TokenKind::External(None, "scale".into()));
        assert_eq!(k[5], TokenKind::External(Some("int".into()), "seed".into()));
    }

    #[test]
    fn test_numeric_literals() {
        let k = kinds("1 2l 3s 1.5 1.5f 2f .5 1e3");
        assert_eq!(k[0], TokenKind::Integer(1, IntSuffix::None));
        assert_eq!(k[1], TokenKind::Integer(2, IntSuffix::Long));
        assert_eq!(k[2], TokenKind::Integer(3, IntSuffix::Short));
        assert_eq!(k[3], TokenKind::Float(1.5, false));
        assert_eq!(k[4], TokenKind::Float(1.5, true));
        assert_eq!(k[5], TokenKind::Float(2.0, true));
        assert_eq!(k[6], TokenKind::Float(0.5, false));
        assert_eq!(k[7], TokenKind::Float(1000.0, false));
    }

    #[test]
    fn test_compound_operators_and_comments() {
        let k = kinds("a += 1; // trailing\n b <<= 2; /* block\n comment */ c++;");
        assert_eq!(k[1], TokenKind::CompoundAssign("+".into()));
        assert_eq!(k[5], TokenKind::CompoundAssign("<<".into()));
        assert_eq!(k[9], TokenKind::PlusPlus);
    }

    #[test]
    fn test_unterminated_string_reports_position() {
        let err = Scanner::new("s@name = \"abc").scan_tokens().unwrap_err();
        match err {
            Error::SyntaxError { line, col, .. } => {
                assert_eq!(line, 1);
                assert_eq!(col, 10);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
