use super::ast::{BinOp, Command, Expr};
use super::{CalcError, Result};

/// Parse one input line into a [`Command`].
pub fn parse_line(line: &str) -> Result<Command> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(Command::Nop);
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word {
        "let" => {
            let (name, expr) = rest
                .split_once('=')
                .ok_or_else(|| CalcError::Syntax("expected `let NAME = EXPR`".to_string()))?;
            let name = name.trim();
            if !is_identifier(name) {
                return Err(CalcError::Syntax(format!("invalid variable name: {:?}", name)));
            }
            Ok(Command::Let(name.to_string(), parse_expr(expr)?))
        }
        "print" => Ok(Command::Print(parse_expr(rest)?)),
        "save" => match rest {
            "" | "on" => Ok(Command::Save(true)),
            "off" => Ok(Command::Save(false)),
            other => Err(CalcError::Syntax(format!("unknown save mode: {}", other))),
        },
        "count" => Ok(Command::Count(parse_expr(rest)?)),
        "after" => {
            let (delay, expr) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| CalcError::Syntax("expected `after MS EXPR`".to_string()))?;
            let delay = delay
                .parse::<u64>()
                .map_err(|_| CalcError::Syntax(format!("invalid delay: {}", delay)))?;
            Ok(Command::After(delay, parse_expr(expr)?))
        }
        "vars" if rest.is_empty() => Ok(Command::Vars),
        "log" => Ok(Command::Log(rest.to_string())),
        _ => Ok(Command::Eval(parse_expr(line)?)),
    }
}

/// Parse an arithmetic expression.
pub fn parse_expr(source: &str) -> Result<Expr> {
    let mut parser = Parser::new(source);
    let expr = parser.parse_sum()?;
    parser.skip_ws();
    if !parser.eof() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

/// Deepest expression tree the parser will build. Evaluation recurses once per
/// level, so this also bounds the evaluator's stack use.
const MAX_DEPTH: usize = 256;

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            index: 0,
            depth: 0,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn advance(&mut self) {
        if self.index < self.bytes.len() {
            self.index += 1;
        }
    }

    fn skip_ws(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_ascii_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Count one more level of nesting in the tree being built.
    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    // Operator chains build left-deep trees, so every operator counts as a level.
    fn parse_sum(&mut self) -> Result<Expr> {
        let base = self.depth;
        let mut lhs = self.parse_product()?;
        loop {
            self.skip_ws();
            let op = match self.current() {
                Some(b'+') => BinOp::Add,
                Some(b'-') => BinOp::Sub,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.advance();
            self.descend()?;
            let rhs = self.parse_product()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let base = self.depth;
        let mut lhs = self.parse_factor()?;
        loop {
            self.skip_ws();
            let op = match self.current() {
                Some(b'*') => BinOp::Mul,
                Some(b'/') => BinOp::Div,
                Some(b'%') => BinOp::Rem,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.advance();
            self.descend()?;
            let rhs = self.parse_factor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        self.skip_ws();
        match self.current() {
            None => Err(self.error("unexpected end of input")),
            Some(b'-') => {
                self.advance();
                self.descend()?;
                let inner = self.parse_factor()?;
                self.depth -= 1;
                Ok(Expr::Neg(Box::new(inner)))
            }
            Some(b'(') => {
                self.advance();
                self.descend()?;
                let inner = self.parse_sum()?;
                self.skip_ws();
                if self.current() != Some(b')') {
                    return Err(self.error("expected `)`"));
                }
                self.advance();
                self.depth -= 1;
                Ok(inner)
            }
            Some(b'0'..=b'9') => self.parse_number(),
            Some(ch) if ch.is_ascii_alphabetic() || ch == b'_' => Ok(self.parse_variable()),
            Some(_) => Err(self.error("unexpected character")),
        }
    }

    fn parse_number(&mut self) -> Result<Expr> {
        let start = self.index;
        while let Some(b'0'..=b'9') = self.current() {
            self.advance();
        }
        let text = &self.src[start..self.index];
        text.parse::<i64>()
            .map(Expr::Int)
            .map_err(|_| self.error("invalid integer literal"))
    }

    fn parse_variable(&mut self) -> Expr {
        let start = self.index;
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == b'_' {
                self.advance();
            } else {
                break;
            }
        }
        Expr::Var(self.src[start..self.index].to_string())
    }

    fn error(&self, message: &str) -> CalcError {
        CalcError::Syntax(format!("{} at byte {}", message, self.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn eval(src: &str) -> Result<i64> {
        parse_expr(src)?.eval(&BTreeMap::new())
    }

    #[test]
    fn parses_precedence_and_grouping() {
        assert_eq!(eval("1+2*3").unwrap(), 7);
        assert_eq!(eval("(1 + 2) * 3").unwrap(), 9);
        assert_eq!(eval("10 - 4 - 3").unwrap(), 3);
        assert_eq!(eval("-(2 + 3) % 4").unwrap(), -1);
    }

    #[test]
    fn reports_arithmetic_faults() {
        assert!(matches!(eval("1 / 0"), Err(CalcError::DivisionByZero)));
        assert!(matches!(eval("9223372036854775807 + 1"), Err(CalcError::Overflow)));
        assert!(matches!(eval("x + 1"), Err(CalcError::UnknownVariable(name)) if name == "x"));
        assert!(matches!(eval("1 +"), Err(CalcError::Syntax(_))));
        assert!(matches!(eval("(1"), Err(CalcError::Syntax(_))));
        assert!(matches!(eval("1 2"), Err(CalcError::Syntax(_))));
    }

    #[test]
    fn rejects_runaway_nesting() {
        let deep_minus = format!("{}1", "-".repeat(20_000));
        let deep_parens = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        let long_chain = vec!["1"; 10_000].join(" + ");

        for src in [&deep_minus, &deep_parens, &long_chain] {
            match parse_expr(src) {
                Err(CalcError::Syntax(message)) => {
                    assert!(message.starts_with("expression nested too deeply"))
                }
                other => panic!("expected a nesting error, got {:?}", other),
            }
        }
        assert!(parse_line(&format!("let x = {}", deep_minus)).is_err());

        // Moderate nesting is unaffected.
        let nested = format!("{}7{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(eval(&nested).unwrap(), 7);
        assert_eq!(eval(&format!("{}5", "-".repeat(100))).unwrap(), 5);
        assert!(matches!(eval(&vec!["2"; 100].join(" * ")), Err(CalcError::Overflow)));
        assert_eq!(eval(&vec!["1"; 200].join(" + ")).unwrap(), 200);
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_line("   ").unwrap(), Command::Nop);
        assert_eq!(parse_line("# note").unwrap(), Command::Nop);
        assert_eq!(
            parse_line("let x = 2").unwrap(),
            Command::Let("x".to_string(), Expr::Int(2))
        );
        assert_eq!(parse_line("save").unwrap(), Command::Save(true));
        assert_eq!(parse_line("save off").unwrap(), Command::Save(false));
        assert_eq!(parse_line("vars").unwrap(), Command::Vars);
        assert_eq!(
            parse_line("after 5 7").unwrap(),
            Command::After(5, Expr::Int(7))
        );
        assert_eq!(
            parse_line("log hello there").unwrap(),
            Command::Log("hello there".to_string())
        );
        assert!(matches!(parse_line("1+1").unwrap(), Command::Eval(_)));
        assert!(parse_line("let 1x = 2").is_err());
        assert!(parse_line("after soon 1").is_err());
    }
}
