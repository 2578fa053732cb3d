//! Tokenizer for the script language.
//!
//! Line-oriented scanning with `#` comments. Tokens carry the line they
//! started on so parse and runtime errors can point somewhere useful.

use crate::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    // keywords
    Let,
    Fn,
    If,
    Else,
    While,
    For,
    In,
    Return,
    True,
    False,
    Null,
    // punctuation
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Colon,
    Semi,
    Dot,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

pub fn lex(file: &str, src: &str) -> Result<Vec<Token>, ScriptError> {
    let mut out = Vec::new();
    let mut chars = src.chars().peekable();
    let mut line: u32 = 1;

    let err = |line: u32, message: String| ScriptError::Parse {
        file: file.to_string(),
        line,
        message,
    };

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '"' => {
                chars.next();
                let start = line;
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some('\\') => s.push('\\'),
                            Some('"') => s.push('"'),
                            other => {
                                return Err(err(
                                    start,
                                    format!("unknown escape {other:?} in string"),
                                ));
                            }
                        },
                        Some('\n') => return Err(err(start, "unterminated string".into())),
                        Some(c) => s.push(c),
                        None => return Err(err(start, "unterminated string".into())),
                    }
                }
                out.push(Token {
                    tok: Tok::Str(s),
                    line: start,
                });
            }
            c if c.is_ascii_digit() => {
                let start = line;
                let mut num = String::new();
                let mut is_float = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        num.push(c);
                        chars.next();
                    } else if c == '.' {
                        // Lookahead: `1.name` is field access, `1.5` a float.
                        let mut ahead = chars.clone();
                        ahead.next();
                        if ahead.peek().is_some_and(|d| d.is_ascii_digit()) && !is_float {
                            is_float = true;
                            num.push('.');
                            chars.next();
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                let tok = if is_float {
                    Tok::Float(
                        num.parse()
                            .map_err(|_| err(start, format!("bad number {num}")))?,
                    )
                } else {
                    Tok::Int(
                        num.parse()
                            .map_err(|_| err(start, format!("bad number {num}")))?,
                    )
                };
                out.push(Token { tok, line: start });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let tok = match name.as_str() {
                    "let" => Tok::Let,
                    "fn" => Tok::Fn,
                    "if" => Tok::If,
                    "else" => Tok::Else,
                    "while" => Tok::While,
                    "for" => Tok::For,
                    "in" => Tok::In,
                    "return" => Tok::Return,
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    _ => Tok::Ident(name),
                };
                out.push(Token { tok, line });
            }
            _ => {
                chars.next();
                let two = |chars: &mut std::iter::Peekable<std::str::Chars>, next: char| {
                    if chars.peek() == Some(&next) {
                        chars.next();
                        true
                    } else {
                        false
                    }
                };
                let tok = match c {
                    '{' => Tok::LBrace,
                    '}' => Tok::RBrace,
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    ',' => Tok::Comma,
                    ':' => Tok::Colon,
                    ';' => Tok::Semi,
                    '.' => Tok::Dot,
                    '+' => Tok::Plus,
                    '-' => Tok::Minus,
                    '*' => Tok::Star,
                    '/' => Tok::Slash,
                    '%' => Tok::Percent,
                    '=' => {
                        if two(&mut chars, '=') {
                            Tok::Eq
                        } else {
                            Tok::Assign
                        }
                    }
                    '!' => {
                        if two(&mut chars, '=') {
                            Tok::Ne
                        } else {
                            Tok::Bang
                        }
                    }
                    '<' => {
                        if two(&mut chars, '=') {
                            Tok::Le
                        } else {
                            Tok::Lt
                        }
                    }
                    '>' => {
                        if two(&mut chars, '=') {
                            Tok::Ge
                        } else {
                            Tok::Gt
                        }
                    }
                    '&' => {
                        if two(&mut chars, '&') {
                            Tok::AndAnd
                        } else {
                            return Err(err(line, "expected && (single & unsupported)".into()));
                        }
                    }
                    '|' => {
                        if two(&mut chars, '|') {
                            Tok::OrOr
                        } else {
                            return Err(err(line, "expected || (single | unsupported)".into()));
                        }
                    }
                    other => return Err(err(line, format!("unexpected character {other:?}"))),
                };
                out.push(Token { tok, line });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_statements_and_comments() {
        let toks = lex(
            "t",
            "let x = 1 # comment\nx.name = \"a\\nb\"\nif x >= 2 { }",
        )
        .unwrap();
        assert!(toks.iter().any(|t| t.tok == Tok::Let));
        assert!(toks.iter().any(|t| t.tok == Tok::Ge));
        assert!(
            toks.iter()
                .any(|t| matches!(&t.tok, Tok::Str(s) if s == "a\nb"))
        );
        // Comment swallowed up to newline.
        assert!(!toks.iter().any(|t| matches!(&t.tok, Tok::Ident(s) if s == "comment")));
    }

    #[test]
    fn float_vs_field_access() {
        let toks = lex("t", "1.5 x.y").unwrap();
        assert!(matches!(toks[0].tok, Tok::Float(f) if f == 1.5));
        assert!(toks.iter().any(|t| t.tok == Tok::Dot));
    }

    #[test]
    fn tracks_lines() {
        let toks = lex("t", "a\nb\nc").unwrap();
        assert_eq!(toks[2].line, 3);
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(lex("t", "\"oops").is_err());
    }
}
