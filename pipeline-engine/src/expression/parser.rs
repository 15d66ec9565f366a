// Condition Parser
// Parses condition tokens into an untyped syntax tree

use crate::expression::lexer::{strip_expression_wrapper, LexError, Lexer, Token};

use std::fmt;

/// Syntax tree node for conditions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    String(String),

    /// Dotted path: `pr.title`, `needs.build.result`
    Reference(Vec<String>),

    /// Function call: `contains(pr.title, 'wip')`, `always()`
    Call { name: String, args: Vec<Expr> },

    /// Logical negation: `!expr`
    Not(Box<Expr>),

    /// Binary operation: `a == b`, `a && b`
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryOp::Eq => write!(f, "=="),
            BinaryOp::Ne => write!(f, "!="),
            BinaryOp::And => write!(f, "&&"),
            BinaryOp::Or => write!(f, "||"),
        }
    }
}

/// Parser error
#[derive(Debug, Clone)]
pub struct ParseExprError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parse error at token {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for ParseExprError {}

impl From<LexError> for ParseExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

/// Recursive descent parser for conditions
pub struct ExprParser {
    tokens: Vec<Token>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// Parse a condition string, accepting an optional `${{ }}` wrapper
    pub fn parse_str(input: &str) -> Result<Expr, ParseExprError> {
        let mut lexer = Lexer::new(strip_expression_wrapper(input));
        let tokens = lexer.tokenize()?;
        let mut parser = Self::new(tokens);
        parser.parse()
    }

    pub fn parse(&mut self) -> Result<Expr, ParseExprError> {
        if self.check(&Token::Eof) {
            return Err(self.error("empty condition"));
        }

        let expr = self.parse_or()?;

        if !self.check(&Token::Eof) {
            return Err(self.error(&format!("unexpected token: {}", self.peek())));
        }

        Ok(expr)
    }

    // Precedence (lowest to highest):
    // 1. Or: ||
    // 2. And: &&
    // 3. Equality: == !=
    // 4. Unary: !
    // 5. Primary: literals, references, calls, parentheses

    fn parse_or(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_and()?;

        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_equality()?;

        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => break,
            };

            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseExprError> {
        if self.check(&Token::Not) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(expr)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseExprError> {
        match self.peek().clone() {
            Token::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            Token::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr::String(s))
            }
            Token::Identifier(name) => {
                self.advance();

                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    return Ok(Expr::Call { name, args });
                }

                let mut path = vec![name];
                while self.check(&Token::Dot) {
                    self.advance();
                    let Token::Identifier(part) = self.advance().clone() else {
                        return Err(self.error("expected property name after '.'"));
                    };
                    path.push(part);
                }

                Ok(Expr::Reference(path))
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            token => Err(self.error(&format!("unexpected token: {}", token))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseExprError> {
        self.expect(&Token::LParen, "expected '('")?;

        let mut args = Vec::new();

        if !self.check(&Token::RParen) {
            args.push(self.parse_or()?);

            while self.check(&Token::Comma) {
                self.advance();
                args.push(self.parse_or()?);
            }
        }

        self.expect(&Token::RParen, "expected ')'")?;
        Ok(args)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> &Token {
        let token = self.tokens.get(self.position).unwrap_or(&Token::Eof);
        self.position += 1;
        token
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn expect(&mut self, token: &Token, msg: &str) -> Result<(), ParseExprError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    fn error(&self, message: &str) -> ParseExprError {
        ParseExprError {
            message: message.to_string(),
            position: self.position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let expr = ExprParser::parse_str("pr.title").unwrap();
        assert_eq!(
            expr,
            Expr::Reference(vec!["pr".to_string(), "title".to_string()])
        );
    }

    #[test]
    fn test_parse_function_call() {
        let expr = ExprParser::parse_str("contains(pr.title, '[deploy]')").unwrap();

        if let Expr::Call { name, args } = expr {
            assert_eq!(name, "contains");
            assert_eq!(args.len(), 2);
            assert_eq!(args[1], Expr::String("[deploy]".to_string()));
        } else {
            panic!("expected function call");
        }
    }

    #[test]
    fn test_parse_operator_precedence() {
        // && binds tighter than ||
        let expr = ExprParser::parse_str("a || b && c").unwrap();

        if let Expr::Binary {
            op: BinaryOp::Or,
            right,
            ..
        } = expr
        {
            assert!(matches!(
                *right,
                Expr::Binary {
                    op: BinaryOp::And,
                    ..
                }
            ));
        } else {
            panic!("expected or expression");
        }
    }

    #[test]
    fn test_parse_parentheses() {
        let expr = ExprParser::parse_str("(a || b) && c").unwrap();
        assert!(matches!(
            expr,
            Expr::Binary {
                op: BinaryOp::And,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_negation() {
        let expr = ExprParser::parse_str("!contains(branch, 'tmp')").unwrap();
        assert!(matches!(expr, Expr::Not(_)));
    }

    #[test]
    fn test_parse_wrapped() {
        let expr = ExprParser::parse_str("${{ event == 'push' }}").unwrap();
        assert!(matches!(
            expr,
            Expr::Binary {
                op: BinaryOp::Eq,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(ExprParser::parse_str("").is_err());
        assert!(ExprParser::parse_str("a ==").is_err());
        assert!(ExprParser::parse_str("(a").is_err());
        assert!(ExprParser::parse_str("a b").is_err());
    }
}
