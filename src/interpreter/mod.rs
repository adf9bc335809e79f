//! Reference evaluation engine.
//!
//! A small integer calculator that implements the runtime's
//! [`Engine`](crate::runtime::engine::Engine) capability set. It is what the
//! CLI and the integration tests drive, and it exercises every engine hook:
//! multi-step work, asynchronous completions, interrupts, programmatic save
//! requests and state export/import.
//!
//! ```text
//! let x = 20        assign (silent)
//! x * 2 + 2         evaluate; echoed when typed interactively
//! print x           always printed
//! count 5           print 1..=5, one number per step
//! after 100 x       print x once 100ms have passed
//! save | save off   request (or cancel) a save for this invocation
//! vars              list variables
//! log TEXT          diagnostic output
//! ```

/// Expression and command trees.
pub mod ast;
/// The engine itself.
pub mod calc;
/// Line and expression parser.
pub mod parser;

pub use ast::{BinOp, Command, Expr};
pub use calc::{CalcEngine, CalcFactory};
pub use parser::{parse_expr, parse_line};

use thiserror::Error;

/// Convenience result alias for calculator operations.
pub type Result<T> = std::result::Result<T, CalcError>;

/// Errors surfaced while parsing or evaluating a line.
#[derive(Debug, Error)]
pub enum CalcError {
    /// The line could not be parsed.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// An expression referenced an unassigned variable.
    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// The result does not fit in 64 bits.
    #[error("integer overflow")]
    Overflow,
}
