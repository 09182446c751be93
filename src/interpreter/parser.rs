use super::EngineError;
use super::ast::{Expr, Program};

/// Deepest list nesting the parser accepts.
pub const MAX_NESTING: usize = 256;

/// Parse script source text into a [`Program`].
pub fn parse_program(source: &str) -> Result<Program, EngineError> {
    let mut parser = Parser::new(source);
    let mut forms = Vec::new();
    loop {
        parser.skip_ws();
        if parser.eof() {
            break;
        }
        if parser.current() == Some(')') {
            return Err(parser.error("unexpected ')'"));
        }
        forms.push(parser.parse_expr()?);
    }
    Ok(Program::new(source, forms))
}

struct Parser<'a> {
    src: &'a str,
    index: usize,
    depth: usize,
}

type ParseResult<T> = std::result::Result<T, EngineError>;

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            index: 0,
            depth: 0,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.src.len()
    }

    fn current(&self) -> Option<char> {
        self.src[self.index..].chars().next()
    }

    fn peek_char(&self) -> Option<char> {
        let mut chars = self.src[self.index..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current() {
            self.index += ch.len_utf8();
        }
    }

    fn skip_ws(&mut self) {
        loop {
            while let Some(ch) = self.current() {
                if ch.is_whitespace() {
                    self.advance();
                } else {
                    break;
                }
            }
            if self.current() == Some(';') {
                while let Some(ch) = self.current() {
                    self.advance();
                    if ch == '\n' {
                        break;
                    }
                }
                continue;
            }
            break;
        }
    }

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.skip_ws();
        match self.current() {
            None => Err(self.error("unexpected end of input")),
            Some('(') => self.parse_list(),
            Some('"') => self.parse_string(),
            Some(':') => self.parse_keyword(),
            Some('-' | '+' | '0'..='9') => self.parse_number_or_symbol(),
            Some(_) => self.parse_symbol(),
        }
    }

    fn parse_list(&mut self) -> ParseResult<Expr> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(&format!("lists nested deeper than {MAX_NESTING}")));
        }
        self.depth += 1;
        let list = self.parse_list_items();
        self.depth -= 1;
        list
    }

    fn parse_list_items(&mut self) -> ParseResult<Expr> {
        let open = self.index;
        self.advance();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.current() {
                None => {
                    return Err(EngineError::Syntax(format!(
                        "unterminated list opened at byte {open}"
                    )));
                }
                Some(')') => {
                    self.advance();
                    break;
                }
                Some(_) => items.push(self.parse_expr()?),
            }
        }
        Ok(Expr::List(items))
    }

    fn parse_string(&mut self) -> ParseResult<Expr> {
        self.advance();
        let mut buf = String::new();
        while let Some(ch) = self.current() {
            self.advance();
            match ch {
                '"' => return Ok(Expr::String(buf)),
                '\\' => {
                    let escaped = self
                        .current()
                        .ok_or_else(|| self.error("incomplete escape"))?;
                    self.advance();
                    let value = match escaped {
                        '"' => '"',
                        '\\' => '\\',
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        other => {
                            return Err(self.error(&format!("unknown escape: \\{other}")));
                        }
                    };
                    buf.push(value);
                }
                _ => buf.push(ch),
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn parse_keyword(&mut self) -> ParseResult<Expr> {
        self.advance();
        let text = self.take_symbol_chars();
        if text.is_empty() {
            return Err(self.error("empty keyword"));
        }
        Ok(Expr::Keyword(text.to_string()))
    }

    fn parse_number_or_symbol(&mut self) -> ParseResult<Expr> {
        let start = self.index;
        if matches!(self.current(), Some('-' | '+')) {
            self.advance();
        }
        let mut has_digit = false;
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                has_digit = true;
                self.advance();
            } else {
                break;
            }
        }

        let mut is_float = false;
        if has_digit
            && self.current() == Some('.')
            && self.peek_char().is_some_and(|next| next.is_ascii_digit())
        {
            is_float = true;
            self.advance();
            while let Some(ch) = self.current() {
                if ch.is_ascii_digit() {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        // `-`, `+`, `1+` and friends are symbols.
        if !has_digit || self.current().is_some_and(is_symbol_char) {
            self.index = start;
            return self.parse_symbol();
        }

        let text = &self.src[start..self.index];
        if is_float {
            text.parse::<f64>()
                .map(Expr::Float)
                .map_err(|_| self.error("invalid float literal"))
        } else {
            text.parse::<i64>()
                .map(Expr::Integer)
                .map_err(|_| self.error("invalid integer literal"))
        }
    }

    fn parse_symbol(&mut self) -> ParseResult<Expr> {
        let text = self.take_symbol_chars();
        if text.is_empty() {
            return Err(self.error("unexpected character"));
        }
        Ok(match text {
            "true" => Expr::Boolean(true),
            "false" => Expr::Boolean(false),
            "nil" => Expr::Nil,
            _ => Expr::Symbol(text.to_string()),
        })
    }

    fn take_symbol_chars(&mut self) -> &'a str {
        let src = self.src;
        let start = self.index;
        while let Some(ch) = self.current() {
            if is_symbol_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        &src[start..self.index]
    }

    fn error(&self, message: &str) -> EngineError {
        EngineError::Syntax(format!("{message} at byte {}", self.index))
    }
}

fn is_symbol_char(ch: char) -> bool {
    !matches!(ch, '(' | ')' | '"' | ';') && !ch.is_whitespace()
}
