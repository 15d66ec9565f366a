// Condition Language
// `if:` expressions for jobs and steps: lexing, parsing, typed compilation, evaluation

pub mod evaluator;
pub mod lexer;
pub mod parser;

pub use evaluator::{
    CompileError, CompileScope, CompiledCondition, Condition, EvalScope, Field, Literal, Operand,
    StatusCheck, TextTest,
};
pub use lexer::{strip_expression_wrapper, LexError, Lexer, Token};
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError};
