use std::collections::BTreeMap;

use super::{CalcError, Result};

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/` (truncating)
    Div,
    /// `%`
    Rem,
}

/// Integer expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Integer literal
    Int(i64),
    /// Variable reference
    Var(String),
    /// Unary minus
    Neg(Box<Expr>),
    /// Binary operation
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Evaluate against a variable table
    pub fn eval(&self, vars: &BTreeMap<String, i64>) -> Result<i64> {
        match self {
            Expr::Int(value) => Ok(*value),
            Expr::Var(name) => vars
                .get(name)
                .copied()
                .ok_or_else(|| CalcError::UnknownVariable(name.clone())),
            Expr::Neg(inner) => inner.eval(vars)?.checked_neg().ok_or(CalcError::Overflow),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = lhs.eval(vars)?;
                let rhs = rhs.eval(vars)?;
                let result = match op {
                    BinOp::Add => lhs.checked_add(rhs),
                    BinOp::Sub => lhs.checked_sub(rhs),
                    BinOp::Mul => lhs.checked_mul(rhs),
                    BinOp::Div | BinOp::Rem if rhs == 0 => {
                        return Err(CalcError::DivisionByZero);
                    }
                    BinOp::Div => lhs.checked_div(rhs),
                    BinOp::Rem => lhs.checked_rem(rhs),
                };
                result.ok_or(CalcError::Overflow)
            }
        }
    }
}

/// One input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Blank line or comment
    Nop,
    /// `let NAME = EXPR`
    Let(String, Expr),
    /// Bare expression; echoed when typed interactively
    Eval(Expr),
    /// `print EXPR`
    Print(Expr),
    /// `save` / `save off`
    Save(bool),
    /// `count EXPR`: print 1..=N, one number per step
    Count(Expr),
    /// `after MS EXPR`: print the value once MS milliseconds have passed
    After(u64, Expr),
    /// `vars`: list every variable
    Vars,
    /// `log TEXT`: diagnostic output
    Log(String),
}
