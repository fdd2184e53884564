use crate::token::{keyword, Token};
use crate::Error;
use arena::Arena;
use ast::{Comment, Quote};

/// A token plus the source position it began at.
#[derive(Debug, Copy, Clone)]
pub struct Spanned<'a> {
    pub tok: Token<'a>,
    pub line: u32,
    pub col: u32,
}

/// Lexer modes. Ordinary tokenization runs with an empty stack; a backtick
/// pushes `Interp`, and a `$(` hole pushes `Hole` so the closing paren can
/// be routed back to the string instead of the expression grammar.
enum Mode {
    Interp,
    Hole { parens: u32 },
}

pub struct Lexer<'a, 's> {
    src: &'s [u8],
    pos: usize,
    line: u32,
    line_start: usize,
    chunk: &'s str,
    arena: &'a Arena,
    modes: Vec<Mode>,
    include_comments: bool,
    pub comments: Vec<Comment<'a>>,
}

impl<'a, 's> Lexer<'a, 's> {
    pub fn new(source: &'s str, chunk: &'s str, arena: &'a Arena, include_comments: bool) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            line_start: 0,
            chunk,
            arena,
            modes: Vec::new(),
            include_comments,
            comments: Vec::new(),
        }
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn next_token(&mut self) -> Result<Spanned<'a>, Error> {
        if matches!(self.modes.last(), Some(Mode::Interp)) {
            return self.interp_part();
        }
        self.skip_space_and_comments()?;
        let (line, col) = (self.line, self.col());
        let tok = self.scan_token()?;
        Ok(Spanned { tok, line, col })
    }

    fn col(&self) -> u32 {
        (self.pos - self.line_start) as u32 + 1
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error {
            chunk: self.chunk.to_owned(),
            line: self.line,
            col: self.col(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.line_start = self.pos;
        }
        Some(b)
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_space_and_comments(&mut self) -> Result<(), Error> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.bump();
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    self.pos += 2;
                    self.comment()?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn comment(&mut self) -> Result<(), Error> {
        let line = self.line;
        // `--[[` (or a leveled bracket) opens a long comment.
        if self.peek() == Some(b'[') {
            let mut level = 0;
            while self.peek_at(1 + level) == Some(b'=') {
                level += 1;
            }
            if self.peek_at(1 + level) == Some(b'[') {
                self.pos += 2 + level;
                let text = self.long_bracket_body(level as u8)?;
                self.push_comment(line, self.line, true, text);
                return Ok(());
            }
        }
        let start = self.pos;
        while !matches!(self.peek(), None | Some(b'\n')) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).map_err(|_| {
            self.error("comment is not valid UTF-8")
        })?;
        self.push_comment(line, line, false, text);
        Ok(())
    }

    fn push_comment(&mut self, line: u32, endline: u32, islong: bool, text: &str) {
        if !self.include_comments {
            return;
        }
        let text = self.arena.alloc_str(text);
        self.comments.push(Comment {
            line,
            endline,
            islong,
            text,
        });
    }

    /// Scan the body of a long bracket (string or comment) given its `=`
    /// level, with the opener already consumed. Returns the body text.
    fn long_bracket_body(&mut self, level: u8) -> Result<&'s str, Error> {
        // A newline immediately after the opening bracket is not part of
        // the content.
        if self.peek() == Some(b'\r') {
            self.bump();
            self.eat(b'\n');
        } else if self.peek() == Some(b'\n') {
            self.bump();
        }
        let start = self.pos;
        loop {
            match self.peek() {
                None => return Err(self.error("unfinished long bracket")),
                Some(b']') => {
                    let mut close = 1;
                    while self.peek_at(close) == Some(b'=') {
                        close += 1;
                    }
                    if close == 1 + level as usize && self.peek_at(close) == Some(b']') {
                        let body = &self.src[start..self.pos];
                        self.pos += close + 1;
                        return std::str::from_utf8(body)
                            .map_err(|_| self.error("long bracket is not valid UTF-8"));
                    }
                    self.bump();
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    fn scan_token(&mut self) -> Result<Token<'a>, Error> {
        let Some(b) = self.peek() else {
            return Ok(Token::Eof);
        };
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => Ok(self.name()),
            b'0'..=b'9' => self.number(),
            b'"' | b'\'' => self.short_string(b),
            b'`' => {
                self.pos += 1;
                self.modes.push(Mode::Interp);
                Ok(Token::InterpStart)
            }
            b'[' => {
                let mut level = 0;
                while self.peek_at(1 + level) == Some(b'=') {
                    level += 1;
                }
                if self.peek_at(1 + level) == Some(b'[') {
                    self.pos += 2 + level;
                    let body = self.long_bracket_body(level as u8)?;
                    return Ok(Token::Str {
                        value: self.arena.alloc_str(body),
                        quote: Quote::Long(level as u8),
                    });
                }
                self.pos += 1;
                Ok(Token::LBracket)
            }
            b'?' => {
                self.pos += 1;
                if self.eat(b'.') {
                    Ok(Token::OptDot)
                } else {
                    Err(self.error("'?' is only valid as part of '?.'"))
                }
            }
            b')' => {
                if let Some(Mode::Hole { parens }) = self.modes.last_mut() {
                    if *parens == 0 {
                        self.pos += 1;
                        self.modes.pop();
                        return Ok(Token::InterpExprEnd);
                    }
                    *parens -= 1;
                }
                self.pos += 1;
                Ok(Token::RParen)
            }
            b'(' => {
                if let Some(Mode::Hole { parens }) = self.modes.last_mut() {
                    *parens += 1;
                }
                self.pos += 1;
                Ok(Token::LParen)
            }
            _ => self.symbol(),
        }
    }

    fn symbol(&mut self) -> Result<Token<'a>, Error> {
        use Token::*;
        let b = self.bump().expect("caller checked non-empty");
        Ok(match b {
            b'+' => Plus,
            b'-' => Minus,
            b'*' => Star,
            b'/' => {
                if self.eat(b'/') {
                    DSlash
                } else {
                    Slash
                }
            }
            b'%' => Percent,
            b'^' => Caret,
            b'#' => Hash,
            b'&' => Amp,
            b'~' => {
                if self.eat(b'=') {
                    Ne
                } else {
                    Tilde
                }
            }
            b'|' => Pipe,
            b'<' => {
                if self.eat(b'=') {
                    Le
                } else if self.eat(b'<') {
                    Shl
                } else {
                    Lt
                }
            }
            b'>' => {
                if self.eat(b'=') {
                    Ge
                } else if self.eat(b'>') {
                    Shr
                } else {
                    Gt
                }
            }
            b'=' => {
                if self.eat(b'=') {
                    Eq
                } else {
                    Assign
                }
            }
            b'{' => LBrace,
            b'}' => RBrace,
            b']' => RBracket,
            b';' => Semi,
            b':' => {
                if self.eat(b':') {
                    DColon
                } else {
                    Colon
                }
            }
            b',' => Comma,
            b'.' => {
                if self.eat(b'.') {
                    if self.eat(b'.') {
                        Ellipsis
                    } else {
                        Concat
                    }
                } else if matches!(self.peek(), Some(b'0'..=b'9')) {
                    self.pos -= 1;
                    return self.number();
                } else {
                    Dot
                }
            }
            other => {
                return Err(self.error(format!(
                    "unexpected character {:?}",
                    char::from(other)
                )))
            }
        })
    }

    fn name(&mut self) -> Token<'a> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_')
        ) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).expect("ASCII identifier");
        match keyword(text) {
            Some(tok) => tok,
            None => Token::Name(self.arena.alloc_str(text)),
        }
    }

    fn number(&mut self) -> Result<Token<'a>, Error> {
        let start = self.pos;
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X')) {
            self.pos += 2;
            let digits = self.pos;
            while matches!(self.peek(), Some(b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F')) {
                self.pos += 1;
            }
            if self.pos == digits {
                return Err(self.error("malformed hexadecimal number"));
            }
            let text = std::str::from_utf8(&self.src[digits..self.pos]).expect("hex digits");
            let value = i64::from_str_radix(text, 16)
                .or_else(|_| u64::from_str_radix(text, 16).map(|v| v as i64))
                .map_err(|_| self.error("hexadecimal number overflows"))?;
            return Ok(Token::Int(value));
        }

        let mut is_float = false;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && !matches!(self.peek_at(1), Some(b'.')) {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            if !matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self.error("malformed number exponent"));
            }
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).expect("number digits");
        if is_float {
            let value: f64 = text.parse().map_err(|_| self.error("malformed number"))?;
            Ok(Token::Float(value))
        } else {
            match text.parse::<i64>() {
                Ok(value) => Ok(Token::Int(value)),
                // Integer literals beyond i64 degrade to floats.
                Err(_) => {
                    let value: f64 = text.parse().map_err(|_| self.error("malformed number"))?;
                    Ok(Token::Float(value))
                }
            }
        }
    }

    fn short_string(&mut self, delim: u8) -> Result<Token<'a>, Error> {
        self.pos += 1;
        let mut value = Vec::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => return Err(self.error("unfinished string")),
                Some(b) if b == delim => break,
                Some(b'\\') => self.escape(&mut value)?,
                Some(b) => value.push(b),
            }
        }
        let value = String::from_utf8(value).map_err(|_| self.error("string is not valid UTF-8"))?;
        Ok(Token::Str {
            value: self.arena.alloc_str(&value),
            quote: if delim == b'"' {
                Quote::Double
            } else {
                Quote::Single
            },
        })
    }

    fn escape(&mut self, out: &mut Vec<u8>) -> Result<(), Error> {
        let Some(b) = self.bump() else {
            return Err(self.error("unfinished string"));
        };
        match b {
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0C),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0B),
            b'\\' => out.push(b'\\'),
            b'"' => out.push(b'"'),
            b'\'' => out.push(b'\''),
            b'\n' => out.push(b'\n'),
            b'x' => {
                let hi = self.hex_digit()?;
                let lo = self.hex_digit()?;
                out.push(hi * 16 + lo);
            }
            b'0'..=b'9' => {
                let mut n = (b - b'0') as u32;
                for _ in 0..2 {
                    match self.peek() {
                        Some(d @ b'0'..=b'9') => {
                            n = n * 10 + (d - b'0') as u32;
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                if n > 255 {
                    return Err(self.error("decimal escape out of range"));
                }
                out.push(n as u8);
            }
            other => {
                return Err(self.error(format!(
                    "invalid escape sequence '\\{}'",
                    char::from(other)
                )))
            }
        }
        Ok(())
    }

    fn hex_digit(&mut self) -> Result<u8, Error> {
        match self.bump() {
            Some(b @ b'0'..=b'9') => Ok(b - b'0'),
            Some(b @ b'a'..=b'f') => Ok(b - b'a' + 10),
            Some(b @ b'A'..=b'F') => Ok(b - b'A' + 10),
            _ => Err(self.error("hexadecimal digit expected")),
        }
    }

    /// Produce the next token while inside a backtick string, outside any
    /// hole: a literal segment, a hole opener, or the string's end.
    fn interp_part(&mut self) -> Result<Spanned<'a>, Error> {
        let (line, col) = (self.line, self.col());
        match self.peek() {
            None => Err(self.error("unfinished interpolated string")),
            Some(b'`') => {
                self.pos += 1;
                self.modes.pop();
                Ok(Spanned {
                    tok: Token::InterpEnd,
                    line,
                    col,
                })
            }
            Some(b'$') => {
                self.pos += 1;
                if self.eat(b'(') {
                    self.modes.push(Mode::Hole { parens: 0 });
                    return Ok(Spanned {
                        tok: Token::InterpExprStart,
                        line,
                        col,
                    });
                }
                if !matches!(self.peek(), Some(b'A'..=b'Z' | b'a'..=b'z' | b'_')) {
                    return Err(self.error("'$' must begin a '$name' or '$(expr)' hole"));
                }
                let Token::Name(name) = self.name() else {
                    return Err(self.error("keyword cannot be an interpolation hole"));
                };
                Ok(Spanned {
                    tok: Token::InterpHoleName(name),
                    line,
                    col,
                })
            }
            Some(_) => {
                let mut value = Vec::new();
                loop {
                    match self.peek() {
                        None => return Err(self.error("unfinished interpolated string")),
                        Some(b'`' | b'$') => break,
                        Some(b'\\') => {
                            self.bump();
                            match self.bump() {
                                Some(b'`') => value.push(b'`'),
                                Some(b'$') => value.push(b'$'),
                                Some(b'\\') => value.push(b'\\'),
                                Some(b'n') => value.push(b'\n'),
                                Some(b't') => value.push(b'\t'),
                                other => {
                                    return Err(self.error(format!(
                                        "invalid escape sequence '\\{}'",
                                        other.map(char::from).unwrap_or(' ')
                                    )))
                                }
                            }
                        }
                        Some(_) => {
                            let b = self.bump().expect("peeked non-empty");
                            value.push(b);
                        }
                    }
                }
                let value =
                    String::from_utf8(value).map_err(|_| self.error("string is not valid UTF-8"))?;
                Ok(Spanned {
                    tok: Token::InterpLit(self.arena.alloc_str(&value)),
                    line,
                    col,
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lex<'a>(source: &str, arena: &'a Arena) -> Vec<Token<'a>> {
        let mut lexer = Lexer::new(source, "test", arena, true);
        let mut out = Vec::new();
        loop {
            let t = lexer.next_token().unwrap();
            if t.tok == Token::Eof {
                break;
            }
            out.push(t.tok);
        }
        out
    }

    #[test]
    fn keywords_names_and_symbols() {
        use Token::*;
        let arena = Arena::new();
        assert_eq!(
            lex("local x = y ?. z .. 0.5 >> 2", &arena),
            vec![
                Local,
                Name("x"),
                Assign,
                Name("y"),
                OptDot,
                Name("z"),
                Concat,
                Float(0.5),
                Shr,
                Int(2),
            ]
        );
    }

    #[test]
    fn string_escapes_and_quotes() {
        use Token::*;
        let arena = Arena::new();
        assert_eq!(
            lex(r#"'a\n' "b\x41" [[raw]]"#, &arena),
            vec![
                Str {
                    value: "a\n",
                    quote: Quote::Single
                },
                Str {
                    value: "bA",
                    quote: Quote::Double
                },
                Str {
                    value: "raw",
                    quote: Quote::Long(0)
                },
            ]
        );
    }

    #[test]
    fn interpolated_strings_alternate_parts_and_holes() {
        use Token::*;
        let arena = Arena::new();
        assert_eq!(
            lex("`a $x b $(1 + (2)) c`", &arena),
            vec![
                InterpStart,
                InterpLit("a "),
                InterpHoleName("x"),
                InterpLit(" b "),
                InterpExprStart,
                Int(1),
                Plus,
                LParen,
                Int(2),
                RParen,
                InterpExprEnd,
                InterpLit(" c"),
                InterpEnd,
            ]
        );
    }

    #[test]
    fn comments_are_recorded_with_spans() {
        let arena = Arena::new();
        let source = "-- one\nlocal x --[[long\ncomment]] = 1\n";
        let mut lexer = Lexer::new(source, "test", &arena, true);
        while lexer.next_token().unwrap().tok != Token::Eof {}

        assert_eq!(lexer.comments.len(), 2);
        assert_eq!(lexer.comments[0].text, " one");
        assert!(!lexer.comments[0].islong);
        assert_eq!(lexer.comments[0].line, 1);
        assert_eq!(lexer.comments[1].text, "long\ncomment");
        assert!(lexer.comments[1].islong);
        assert_eq!(lexer.comments[1].line, 2);
        assert_eq!(lexer.comments[1].endline, 3);
    }

    #[test]
    fn number_forms() {
        use Token::*;
        let arena = Arena::new();
        assert_eq!(
            lex("0 42 0xFF 3.0 1e3 .25 9223372036854775807", &arena),
            vec![
                Int(0),
                Int(42),
                Int(255),
                Float(3.0),
                Float(1000.0),
                Float(0.25),
                Int(i64::MAX),
            ]
        );
    }

    #[test]
    fn lone_question_mark_is_an_error() {
        let arena = Arena::new();
        let mut lexer = Lexer::new("a ? b", "test", &arena, false);
        lexer.next_token().unwrap();
        let err = lexer.next_token().unwrap_err();
        assert!(err.message.contains("'?.'"), "{err}");
    }
}
