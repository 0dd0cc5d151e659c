use std::collections::BTreeSet;

use chumsky::prelude::*;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Variable(String),
    Num(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("failed to parse '{expr}': {message}")]
pub struct ParseError {
    pub expr: String,
    pub message: String,
}

type Extra<'src> = extra::Err<Rich<'src, char>>;

pub fn parse_expr(str_expr: &str) -> Result<Expr, ParseError> {
    let parser = expr().then_ignore(end());

    parser.parse(str_expr).into_result().map_err(|errs| ParseError {
        expr: str_expr.to_string(),
        message: errs
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; "),
    })
}

impl Expr {
    /// Evaluates the expression, resolving variables through `lookup`.
    ///
    /// Division by zero and unresolved variables produce NaN instead of an
    /// error, so one bad interval never aborts a whole timeseries.
    pub fn eval<F>(&self, lookup: &F) -> f64
    where
        F: Fn(&str) -> Option<f64>,
    {
        match self {
            Expr::Num(num) => *num,
            Expr::Variable(name) => lookup(name).unwrap_or(f64::NAN),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = lhs.eval(lookup);
                let rhs = rhs.eval(lookup);
                match op {
                    BinOp::Add => lhs + rhs,
                    BinOp::Sub => lhs - rhs,
                    BinOp::Mul => lhs * rhs,
                    BinOp::Div => {
                        if rhs == 0.0 {
                            f64::NAN
                        } else {
                            lhs / rhs
                        }
                    }
                }
            }
        }
    }

    pub fn variables(&self) -> BTreeSet<&str> {
        let mut vars = BTreeSet::new();
        self.collect_variables(&mut vars);
        vars
    }

    fn collect_variables<'a>(&'a self, vars: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Variable(name) => {
                vars.insert(name.as_str());
            }
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(vars);
                rhs.collect_variables(vars);
            }
            Expr::Num(_) => {}
        }
    }
}

fn ident<'src>() -> impl Parser<'src, &'src str, String, Extra<'src>> {
    any()
        .filter(|c: &char| c.is_alphanumeric() || *c == '_' || *c == '.')
        .repeated()
        .at_least(1)
        .collect::<String>()
        .and_is(any().filter(|c: &char| c.is_alphabetic()))
}

fn variable<'src>() -> impl Parser<'src, &'src str, Expr, Extra<'src>> {
    ident().map(Expr::Variable)
}

fn num<'src>() -> impl Parser<'src, &'src str, Expr, Extra<'src>> {
    text::int(10)
        .then(just('.').then(text::digits(10)).or_not())
        .to_slice()
        .try_map(|s: &str, span| {
            s.parse::<f64>()
                .map_err(|e| Rich::custom(span, format!("invalid number '{s}': {e}")))
        })
        .map(Expr::Num)
}

fn expr<'src>() -> impl Parser<'src, &'src str, Expr, Extra<'src>> {
    recursive(|expr| {
        let atom = num()
            .or(variable())
            .or(expr.clone().delimited_by(just("("), just(")")))
            .padded()
            .boxed();

        let product_op = just("*")
            .padded()
            .to(BinOp::Mul)
            .or(just("/").padded().to(BinOp::Div));
        let product = atom
            .clone()
            .foldl(product_op.then(atom).repeated(), |lhs, (op, rhs)| {
                Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            });

        let sum_op = just("+")
            .padded()
            .to(BinOp::Add)
            .or(just("-").padded().to(BinOp::Sub));

        product
            .clone()
            .foldl(sum_op.then(product).repeated(), |lhs, (op, rhs)| {
                Expr::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            })
    })
}
