// Condition Lexer
// Tokenizes job and step conditions: `branch == 'main' && !contains(pr.title, 'wip')`

use std::fmt;

/// Token types for condition expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    // Identifiers (may contain '-', job ids and matrix axes often do)
    Identifier(String),

    // Operators
    Eq,    // ==
    Ne,    // !=
    And,   // &&
    Or,    // ||
    Not,   // !
    Dot,   // .
    Comma, // ,

    // Delimiters
    LParen, // (
    RParen, // )

    // End of input
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Identifier(s) => write!(f, "{}", s),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// Lexer error
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lex error at position {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for LexError {}

/// Lexer for condition expressions
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }

        Ok(tokens)
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };

        self.position = pos;

        match ch {
            '.' => {
                self.advance();
                Ok(Token::Dot)
            }
            ',' => {
                self.advance();
                Ok(Token::Comma)
            }
            '(' => {
                self.advance();
                Ok(Token::LParen)
            }
            ')' => {
                self.advance();
                Ok(Token::RParen)
            }
            '=' => {
                self.advance();
                self.expect_char('=', Token::Eq, "expected '==' operator", pos)
            }
            '!' => {
                self.advance();
                if self.peek_char() == Some('=') {
                    self.advance();
                    Ok(Token::Ne)
                } else {
                    Ok(Token::Not)
                }
            }
            '&' => {
                self.advance();
                self.expect_char('&', Token::And, "expected '&&' operator", pos)
            }
            '|' => {
                self.advance();
                self.expect_char('|', Token::Or, "expected '||' operator", pos)
            }
            '\'' | '"' => self.read_string(ch),
            '0'..='9' => self.read_number(),
            'a'..='z' | 'A'..='Z' | '_' => Ok(self.read_identifier()),
            _ => Err(LexError {
                message: format!("unexpected character: '{}'", ch),
                position: pos,
            }),
        }
    }

    fn expect_char(
        &mut self,
        expected: char,
        token: Token,
        message: &str,
        start: usize,
    ) -> Result<Token, LexError> {
        if self.peek_char() == Some(expected) {
            self.advance();
            Ok(token)
        } else {
            Err(LexError {
                message: message.to_string(),
                position: start,
            })
        }
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        let start = self.position;
        self.advance(); // opening quote

        let mut value = String::new();

        loop {
            match self.chars.peek() {
                Some(&(_, ch)) if ch == quote => {
                    self.advance();
                    // A doubled quote is an escaped quote
                    if self.peek_char() == Some(quote) {
                        value.push(quote);
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some(&(_, ch)) => {
                    value.push(ch);
                    self.advance();
                }
                None => {
                    return Err(LexError {
                        message: "unterminated string".to_string(),
                        position: start,
                    });
                }
            }
        }

        Ok(Token::String(value))
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        let mut num_str = String::new();

        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_ascii_digit() || ch == '.' {
                num_str.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        num_str
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| LexError {
                message: format!("invalid number: {}", num_str),
                position: start,
            })
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();

        while let Some(&(_, ch)) = self.chars.peek() {
            if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match ident.to_lowercase().as_str() {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            _ => Token::Identifier(ident),
        }
    }
}

/// Strip an optional `${{ ... }}` wrapper around a condition
pub fn strip_expression_wrapper(input: &str) -> &str {
    let trimmed = input.trim();
    trimmed
        .strip_prefix("${{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}
