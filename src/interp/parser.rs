//! Recursive-descent parser producing statements

use super::lexer::{tokenize, Token};
use super::value::Value;
use super::ExecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompClause {
    pub target: Target,
    pub iter: Expr,
    pub conds: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        other: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Slice {
        target: Box<Expr>,
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    /// List comprehension or generator expression (both materialise a list)
    ListComp {
        element: Box<Expr>,
        clauses: Vec<CompClause>,
    },
    DictComp {
        key: Box<Expr>,
        value: Box<Expr>,
        clauses: Vec<CompClause>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Tuple(Vec<Target>),
    Index(Expr, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    /// `a = b = value`
    Assign(Vec<Target>, Expr),
    AugAssign(Target, BinOp, Expr),
    /// `import numthy [as alias]`
    Import(String),
    /// `from numthy import ...`; library names are always global
    ImportFrom,
    Pass,
}

const KEYWORDS: [&str; 16] = [
    "True", "False", "None", "and", "or", "not", "in", "is", "if", "else", "for", "import", "from",
    "as", "pass", "lambda",
];

const LIBRARY_MODULES: [&str; 2] = ["numthy", "math"];

pub fn parse(src: &str) -> Result<Vec<Stmt>, ExecError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Token::Op(o) if *o == op)
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Token::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ExecError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{}'", op)))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), ExecError> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{}'", kw)))
        }
    }

    fn unexpected(&self, context: &str) -> ExecError {
        let found = match self.peek() {
            Token::Int(i) => i.to_string(),
            Token::Float(f) => f.to_string(),
            Token::Str(s) => format!("'{}'", s),
            Token::Name(n) => n.clone(),
            Token::Op(o) => o.to_string(),
            Token::Newline => "end of line".to_string(),
            Token::Eof => "end of input".to_string(),
        };
        ExecError::Syntax(format!("{}, found {}", context, found))
    }

    fn identifier(&mut self) -> Result<String, ExecError> {
        match self.peek().clone() {
            Token::Name(n) if !KEYWORDS.contains(&n.as_str()) => {
                self.pos += 1;
                Ok(n)
            }
            _ => Err(self.unexpected("expected a name")),
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>, ExecError> {
        let mut stmts = Vec::new();
        loop {
            while matches!(self.peek(), Token::Newline) || self.at_op(";") {
                self.pos += 1;
            }
            if matches!(self.peek(), Token::Eof) {
                break;
            }
            stmts.push(self.statement()?);
            if !(matches!(self.peek(), Token::Newline | Token::Eof) || self.at_op(";")) {
                return Err(self.unexpected("invalid syntax"));
            }
        }
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, ExecError> {
        if self.eat_kw("pass") {
            return Ok(Stmt::Pass);
        }
        if self.eat_kw("import") {
            return self.import();
        }
        if self.eat_kw("from") {
            let module = self.identifier()?;
            self.check_module(&module)?;
            self.expect_kw("import")?;
            if !self.eat_op("*") {
                self.identifier()?;
                while self.eat_op(",") {
                    self.identifier()?;
                }
            }
            return Ok(Stmt::ImportFrom);
        }

        let first = self.testlist()?;

        for (op, bin) in [("+=", BinOp::Add), ("-=", BinOp::Sub), ("*=", BinOp::Mul)] {
            if self.eat_op(op) {
                let target = to_target(first)?;
                let value = self.testlist()?;
                return Ok(Stmt::AugAssign(target, bin, value));
            }
        }

        if !self.at_op("=") {
            return Ok(Stmt::Expr(first));
        }

        let mut exprs = vec![first];
        while self.eat_op("=") {
            exprs.push(self.testlist()?);
        }
        let value = exprs.pop().ok_or_else(|| ExecError::Syntax("missing value".into()))?;
        let targets = exprs.into_iter().map(to_target).collect::<Result<_, _>>()?;
        Ok(Stmt::Assign(targets, value))
    }

    fn import(&mut self) -> Result<Stmt, ExecError> {
        let module = self.identifier()?;
        self.check_module(&module)?;
        let alias = if self.eat_kw("as") {
            self.identifier()?
        } else {
            module
        };
        Ok(Stmt::Import(alias))
    }

    fn check_module(&self, module: &str) -> Result<(), ExecError> {
        if LIBRARY_MODULES.contains(&module) {
            Ok(())
        } else {
            Err(ExecError::Import(module.to_string()))
        }
    }

    /// Comma-separated tests; more than one (or a trailing comma) is a tuple
    fn testlist(&mut self) -> Result<Expr, ExecError> {
        let first = self.test()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.ends_testlist() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn ends_testlist(&self) -> bool {
        matches!(self.peek(), Token::Newline | Token::Eof)
            || self.at_op("=")
            || self.at_op(")")
            || self.at_op(";")
    }

    fn test(&mut self) -> Result<Expr, ExecError> {
        if self.at_kw("lambda") {
            return Err(ExecError::Syntax("lambda is not supported".into()));
        }
        let body = self.or_test()?;
        if self.at_kw("if") && !self.comp_if_context() {
            self.pos += 1;
            let cond = self.or_test()?;
            self.expect_kw("else")?;
            let other = self.test()?;
            return Ok(Expr::IfElse {
                cond: Box::new(cond),
                then: Box::new(body),
                other: Box::new(other),
            });
        }
        Ok(body)
    }

    /// An `if` with no matching `else` before the closing bracket belongs to a comprehension
    fn comp_if_context(&self) -> bool {
        let mut depth = 0i32;
        let mut i = self.pos + 1;
        while let Some(tok) = self.tokens.get(i) {
            match tok {
                Token::Op("(") | Token::Op("[") | Token::Op("{") => depth += 1,
                Token::Op(")") | Token::Op("]") | Token::Op("}") => {
                    if depth == 0 {
                        return true;
                    }
                    depth -= 1;
                }
                Token::Name(n) if depth == 0 && n == "else" => return false,
                Token::Name(n) if depth == 0 && (n == "for" || n == "if") => return true,
                Token::Newline | Token::Eof => return true,
                _ => {}
            }
            i += 1;
        }
        true
    }

    fn or_test(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.and_test()?;
        while self.eat_kw("or") {
            let right = self.and_test()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_test(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.not_test()?;
        while self.eat_kw("and") {
            let right = self.not_test()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_test(&mut self) -> Result<Expr, ExecError> {
        if self.eat_kw("not") {
            let inner = self.not_test()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExecError> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Token::Op("==") => CmpOp::Eq,
                Token::Op("!=") => CmpOp::Ne,
                Token::Op("<") => CmpOp::Lt,
                Token::Op("<=") => CmpOp::Le,
                Token::Op(">") => CmpOp::Gt,
                Token::Op(">=") => CmpOp::Ge,
                Token::Name(n) if n == "in" => CmpOp::In,
                Token::Name(n) if n == "not" && matches!(self.peek_at(1), Token::Name(m) if m == "in") => {
                    self.pos += 1;
                    CmpOp::NotIn
                }
                Token::Name(n) if n == "is" => {
                    if matches!(self.peek_at(1), Token::Name(m) if m == "not") {
                        self.pos += 1;
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), rest))
        }
    }

    fn arith(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.factor()?;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("//") {
                BinOp::FloorDiv
            } else if self.eat_op("/") {
                BinOp::Div
            } else if self.eat_op("%") {
                BinOp::Mod
            } else {
                break;
            };
            let right = self.factor()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, ExecError> {
        if self.eat_op("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.factor()?)));
        }
        if self.eat_op("+") {
            return Ok(Expr::Unary(UnaryOp::Pos, Box::new(self.factor()?)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, ExecError> {
        let base = self.postfix()?;
        if self.eat_op("**") {
            // Right associative and binds tighter than a unary minus on its left
            let exp = self.factor()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, ExecError> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                expr = self.call(expr)?;
            } else if self.eat_op("[") {
                expr = self.subscript(expr)?;
            } else if self.eat_op(".") {
                let name = self.identifier()?;
                expr = Expr::Attr(Box::new(expr), name);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call(&mut self, func: Expr) -> Result<Expr, ExecError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        while !self.at_op(")") {
            let is_kwarg = matches!(self.peek(), Token::Name(_)) && matches!(self.peek_at(1), Token::Op("="));
            if is_kwarg {
                let name = self.identifier()?;
                self.expect_op("=")?;
                kwargs.push((name, self.test()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(ExecError::Syntax(
                        "positional argument follows keyword argument".into(),
                    ));
                }
                let arg = self.test()?;
                if self.at_kw("for") {
                    // Bare generator argument: f(x for x in xs)
                    let clauses = self.comp_clauses()?;
                    args.push(Expr::ListComp {
                        element: Box::new(arg),
                        clauses,
                    });
                } else {
                    args.push(arg);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;

        Ok(Expr::Call {
            func: Box::new(func),
            args,
            kwargs,
        })
    }

    fn subscript(&mut self, target: Expr) -> Result<Expr, ExecError> {
        let lower = if self.at_op(":") { None } else { Some(Box::new(self.test()?)) };
        if !self.eat_op(":") {
            self.expect_op("]")?;
            let index = lower.ok_or_else(|| ExecError::Syntax("empty subscript".into()))?;
            return Ok(Expr::Index(Box::new(target), index));
        }

        let upper = if self.at_op(":") || self.at_op("]") {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        let step = if self.eat_op(":") && !self.at_op("]") {
            Some(Box::new(self.test()?))
        } else {
            None
        };
        self.expect_op("]")?;
        Ok(Expr::Slice {
            target: Box::new(target),
            lower,
            upper,
            step,
        })
    }

    fn comp_clauses(&mut self) -> Result<Vec<CompClause>, ExecError> {
        let mut clauses = Vec::new();
        while self.eat_kw("for") {
            let mut targets = vec![self.postfix()?];
            while self.eat_op(",") {
                targets.push(self.postfix()?);
            }
            let target = if targets.len() == 1 {
                to_target(targets.remove(0))?
            } else {
                to_target(Expr::Tuple(targets))?
            };
            self.expect_kw("in")?;
            let iter = self.or_test()?;
            let mut conds = Vec::new();
            while self.eat_kw("if") {
                conds.push(self.or_test()?);
            }
            clauses.push(CompClause { target, iter, conds });
        }
        Ok(clauses)
    }

    fn atom(&mut self) -> Result<Expr, ExecError> {
        match self.advance() {
            Token::Int(i) => Ok(Expr::Const(Value::Int(i))),
            Token::Float(f) => Ok(Expr::Const(Value::Float(f))),
            Token::Str(mut s) => {
                // Adjacent literals concatenate
                while let Token::Str(next) = self.peek().clone() {
                    s.push_str(&next);
                    self.pos += 1;
                }
                Ok(Expr::Const(Value::Str(s)))
            }
            Token::Name(n) => match n.as_str() {
                "True" => Ok(Expr::Const(Value::Bool(true))),
                "False" => Ok(Expr::Const(Value::Bool(false))),
                "None" => Ok(Expr::Const(Value::None)),
                kw if KEYWORDS.contains(&kw) => {
                    self.pos -= 1;
                    Err(self.unexpected("invalid syntax"))
                }
                _ => Ok(Expr::Name(n)),
            },
            Token::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.test()?;
                if self.at_kw("for") {
                    let clauses = self.comp_clauses()?;
                    self.expect_op(")")?;
                    return Ok(Expr::ListComp {
                        element: Box::new(first),
                        clauses,
                    });
                }
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op(")") {
                        break;
                    }
                    items.push(self.test()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            Token::Op("[") => {
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.test()?;
                if self.at_kw("for") {
                    let clauses = self.comp_clauses()?;
                    self.expect_op("]")?;
                    return Ok(Expr::ListComp {
                        element: Box::new(first),
                        clauses,
                    });
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.at_op("]") {
                        break;
                    }
                    items.push(self.test()?);
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Token::Op("{") => {
                if self.eat_op("}") {
                    return Ok(Expr::Dict(Vec::new()));
                }
                let key = self.test()?;
                self.expect_op(":")?;
                let value = self.test()?;
                if self.at_kw("for") {
                    let clauses = self.comp_clauses()?;
                    self.expect_op("}")?;
                    return Ok(Expr::DictComp {
                        key: Box::new(key),
                        value: Box::new(value),
                        clauses,
                    });
                }
                let mut pairs = vec![(key, value)];
                while self.eat_op(",") {
                    if self.at_op("}") {
                        break;
                    }
                    let k = self.test()?;
                    self.expect_op(":")?;
                    pairs.push((k, self.test()?));
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(pairs))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("invalid syntax"))
            }
        }
    }
}

fn to_target(expr: Expr) -> Result<Target, ExecError> {
    match expr {
        Expr::Name(n) => Ok(Target::Name(n)),
        Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
            items.into_iter().map(to_target).collect::<Result<_, _>>()?,
        )),
        Expr::Index(target, index) => Ok(Target::Index(*target, *index)),
        _ => Err(ExecError::Syntax("cannot assign to expression".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_expr(src: &str) -> Expr {
        match parse(src).unwrap().remove(0) {
            Stmt::Expr(e) => e,
            other => panic!("expected expression, got {:?}", other),
        }
    }

    #[test]
    fn test_power_binds_tighter_than_negation() {
        let e = single_expr("-2 ** 2");
        assert!(matches!(e, Expr::Unary(UnaryOp::Neg, inner) if matches!(*inner, Expr::Binary(BinOp::Pow, _, _))));
    }

    #[test]
    fn test_assignment_forms() {
        assert!(matches!(&parse("a = b = 1").unwrap()[0], Stmt::Assign(t, _) if t.len() == 2));
        assert!(matches!(&parse("g, x, y = egcd(3, 7)").unwrap()[0], Stmt::Assign(t, _) if matches!(&t[0], Target::Tuple(v) if v.len() == 3)));
        assert!(matches!(&parse("n += 1").unwrap()[0], Stmt::AugAssign(_, BinOp::Add, _)));
        assert!(parse("f(x) = 1").is_err());
    }

    #[test]
    fn test_imports() {
        assert_eq!(parse("import numthy as nt").unwrap(), vec![Stmt::Import("nt".into())]);
        assert_eq!(parse("from numthy import *").unwrap(), vec![Stmt::ImportFrom]);
        assert!(matches!(parse("import numpy"), Err(ExecError::Import(_))));
    }

    #[test]
    fn test_comprehension_with_filter_and_ternary() {
        let e = single_expr("[p if p > 2 else 0 for p in primes(30) if p % 4 == 1]");
        let Expr::ListComp { element, clauses } = e else {
            panic!("expected comprehension");
        };
        assert!(matches!(*element, Expr::IfElse { .. }));
        assert_eq!(clauses[0].conds.len(), 1);
    }

    #[test]
    fn test_generator_argument_and_kwargs() {
        let e = single_expr("sorted(x * x for x in range(5))");
        assert!(matches!(e, Expr::Call { args, .. } if matches!(args[0], Expr::ListComp { .. })));
        let e = single_expr("sorted(xs, reverse=True)");
        assert!(matches!(e, Expr::Call { kwargs, .. } if kwargs[0].0 == "reverse"));
    }

    #[test]
    fn test_statement_sequence() {
        assert_eq!(parse("a = 1; b = 2\nprint(a)").unwrap().len(), 3);
        assert_eq!(parse("  \n# nothing\n").unwrap().len(), 0);
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse("1 +"), Err(ExecError::Syntax(_))));
        assert!(matches!(parse("x y"), Err(ExecError::Syntax(_))));
        assert!(matches!(parse("lambda x: x"), Err(ExecError::Syntax(_))));
    }
}
