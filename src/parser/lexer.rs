//! Byte-level tokenizer for the C declaration surface syntax.
//!
//! Escape sequences inside string and character literals are left raw; the
//! constant-expression evaluator decodes character escapes itself and
//! treats escaped strings as opaque.

use ustr::Ustr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(Ustr),
    Number { base: u32, text: String },
    Float(String),
    StringLit(String),
    CharLit(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Colon,
    Star,
    Amp,
    Plus,
    Minus,
    Tilde,
    Bang,
    Slash,
    Percent,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    Caret,
    Pipe,
    AndAnd,
    OrOr,
    Question,
    Ellipsis,
    Assign,
    Eof,
}

#[derive(Clone)]
pub(crate) struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    pub(crate) line: u32,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn err(&self, msg: impl Into<String>) -> Error {
        Error::parse(self.line, msg)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.src.get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let start_line = self.line;
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                            None => {
                                return Err(Error::parse(start_line, "unterminated comment"));
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn lex_ident(&mut self) -> Tok {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        Tok::Ident(Ustr::from(text))
    }

    fn lex_number(&mut self) -> Result<Tok> {
        let start = self.pos;
        let mut is_float = false;
        let mut base = 10u32;

        if self.peek() == Some(b'0')
            && matches!(self.peek_at(1), Some(b'x') | Some(b'X'))
        {
            base = 16;
            self.pos += 2;
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        } else {
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
            if self.peek() == Some(b'.')
                && self.peek_at(1).is_some_and(|c| c.is_ascii_digit())
            {
                is_float = true;
                self.pos += 1;
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
            if matches!(self.peek(), Some(b'e') | Some(b'E'))
                && (self.peek_at(1).is_some_and(|c| c.is_ascii_digit())
                    || (matches!(self.peek_at(1), Some(b'+') | Some(b'-'))
                        && self.peek_at(2).is_some_and(|c| c.is_ascii_digit())))
            {
                is_float = true;
                self.pos += 1;
                if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                    self.pos += 1;
                }
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
            if self.src[start] == b'0' && !is_float && self.pos - start > 1 {
                base = 8;
            }
        }

        // Suffix letters travel with the text; the value model decodes them.
        while let Some(c) = self.peek() {
            if matches!(c, b'u' | b'U' | b'l' | b'L') && !is_float {
                self.pos += 1;
            } else if matches!(c, b'f' | b'F') && is_float {
                self.pos += 1;
            } else if matches!(c, b'l' | b'L') && is_float {
                self.pos += 1;
            } else {
                break;
            }
        }

        let raw = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        if is_float {
            Ok(Tok::Float(raw.to_string()))
        } else {
            let digits = match base {
                16 => &raw[2..],
                8 => &raw[1..],
                _ => raw,
            };
            // "0" with octal stripping leaves only suffixes behind.
            let digits = if digits.is_empty()
                || digits.chars().all(|c| matches!(c, 'u' | 'U' | 'l' | 'L'))
            {
                "0"
            } else {
                digits
            };
            Ok(Tok::Number {
                base,
                text: digits.to_string(),
            })
        }
    }

    fn lex_quoted(&mut self, quote: u8) -> Result<Tok> {
        let start = self.pos;
        self.bump();
        loop {
            match self.peek() {
                Some(b'\\') => {
                    self.bump();
                    self.bump();
                }
                Some(c) if c == quote => {
                    self.bump();
                    break;
                }
                Some(b'\n') | None => {
                    return Err(self.err("unterminated literal"));
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.err("invalid literal"))?
            .to_string();
        Ok(if quote == b'"' {
            Tok::StringLit(text)
        } else {
            Tok::CharLit(text)
        })
    }

    pub(crate) fn next_token(&mut self) -> Result<Tok> {
        self.skip_trivia()?;
        let Some(c) = self.peek() else {
            return Ok(Tok::Eof);
        };
        if c.is_ascii_alphabetic() || c == b'_' {
            return Ok(self.lex_ident());
        }
        if c.is_ascii_digit() {
            return self.lex_number();
        }
        if c == b'"' || c == b'\'' {
            return self.lex_quoted(c);
        }
        self.pos += 1;
        Ok(match c {
            b'(' => Tok::LParen,
            b')' => Tok::RParen,
            b'{' => Tok::LBrace,
            b'}' => Tok::RBrace,
            b'[' => Tok::LBracket,
            b']' => Tok::RBracket,
            b',' => Tok::Comma,
            b';' => Tok::Semicolon,
            b':' => Tok::Colon,
            b'*' => Tok::Star,
            b'+' => Tok::Plus,
            b'-' => Tok::Minus,
            b'~' => Tok::Tilde,
            b'^' => Tok::Caret,
            b'?' => Tok::Question,
            b'%' => Tok::Percent,
            b'/' => Tok::Slash,
            b'&' => {
                if self.peek() == Some(b'&') {
                    self.pos += 1;
                    Tok::AndAnd
                } else {
                    Tok::Amp
                }
            }
            b'|' => {
                if self.peek() == Some(b'|') {
                    self.pos += 1;
                    Tok::OrOr
                } else {
                    Tok::Pipe
                }
            }
            b'<' => match self.peek() {
                Some(b'<') => {
                    self.pos += 1;
                    Tok::Shl
                }
                Some(b'=') => {
                    self.pos += 1;
                    Tok::Le
                }
                _ => Tok::Lt,
            },
            b'>' => match self.peek() {
                Some(b'>') => {
                    self.pos += 1;
                    Tok::Shr
                }
                Some(b'=') => {
                    self.pos += 1;
                    Tok::Ge
                }
                _ => Tok::Gt,
            },
            b'=' => {
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    Tok::EqEq
                } else {
                    Tok::Assign
                }
            }
            b'!' => {
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    Tok::Ne
                } else {
                    Tok::Bang
                }
            }
            b'.' => {
                if self.peek() == Some(b'.') && self.peek_at(1) == Some(b'.') {
                    self.pos += 2;
                    Tok::Ellipsis
                } else {
                    return Err(self.err("unexpected character '.'"));
                }
            }
            other => {
                return Err(self.err(format!("unexpected character '{}'", other as char)));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(src: &str) -> Vec<Tok> {
        let mut lex = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let t = lex.next_token().unwrap();
            if t == Tok::Eof {
                break;
            }
            out.push(t);
        }
        out
    }

    #[test]
    fn punctuation_and_idents() {
        let toks = all("int *p[3];");
        assert_eq!(
            toks,
            vec![
                Tok::Ident(Ustr::from("int")),
                Tok::Star,
                Tok::Ident(Ustr::from("p")),
                Tok::LBracket,
                Tok::Number {
                    base: 10,
                    text: "3".into()
                },
                Tok::RBracket,
                Tok::Semicolon,
            ]
        );
    }

    #[test]
    fn radix_prefixes() {
        assert_eq!(
            all("0x10 010 10"),
            vec![
                Tok::Number {
                    base: 16,
                    text: "10".into()
                },
                Tok::Number {
                    base: 8,
                    text: "10".into()
                },
                Tok::Number {
                    base: 10,
                    text: "10".into()
                },
            ]
        );
    }

    #[test]
    fn comments_count_lines() {
        let mut lex = Lexer::new("/* a\nb */ x // tail\ny");
        assert_eq!(lex.next_token().unwrap(), Tok::Ident(Ustr::from("x")));
        assert_eq!(lex.line, 2);
        assert_eq!(lex.next_token().unwrap(), Tok::Ident(Ustr::from("y")));
        assert_eq!(lex.line, 3);
    }

    #[test]
    fn literals_stay_raw() {
        assert_eq!(
            all(r#""a\"b" '\n'"#),
            vec![
                Tok::StringLit(r#""a\"b""#.into()),
                Tok::CharLit(r"'\n'".into()),
            ]
        );
    }

    #[test]
    fn ellipsis_and_shifts() {
        assert_eq!(
            all("... << >> <= =="),
            vec![Tok::Ellipsis, Tok::Shl, Tok::Shr, Tok::Le, Tok::EqEq]
        );
    }
}
