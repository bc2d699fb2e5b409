//! A small Python-flavoured statement language bound to a number-theory library
//!
//! Enough of the language for planner output: literals, arithmetic,
//! comparisons, comprehensions, assignment, `nt.`-qualified calls and `print`.
//! State persists across `run` calls until `reset`.

mod eval;
mod lexer;
pub mod library;
mod parser;
mod value;

pub use eval::{Execution, Interpreter};
pub use value::Value;

use thiserror::Error;

/// Errors raised while parsing or running a statement
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("name '{0}' is not defined")]
    Name(String),

    #[error("No module named '{0}'")]
    Import(String),

    #[error("{0}")]
    Type(String),

    #[error("{0}")]
    Value(String),

    #[error("{0}")]
    Index(String),

    #[error("division by zero")]
    ZeroDivision,

    #[error("integer overflow")]
    Overflow,
}
