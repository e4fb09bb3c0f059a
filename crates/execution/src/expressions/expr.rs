use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

use crate::scalar::ScalarValue;

/// Serializable expression tree evaluated by filters, group keys and
/// partition key projections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Column resolved by name against the input schema.
    Column(String),
    /// Column resolved by position; `name` is kept for output naming.
    ColumnRef { name: String, index: usize },
    Literal(ScalarValue),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        to_type: DataType,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    ScalarUdf { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::NotEq | Self::Lt | Self::LtEq | Self::Gt | Self::GtEq
        )
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
        }
    }
}

impl Expr {
    /// Field name used when this expression becomes an output column.
    pub fn output_name(&self) -> String {
        match self {
            Self::Column(name) | Self::ColumnRef { name, .. } => name.clone(),
            Self::Literal(v) => format!("{v:?}"),
            Self::BinaryOp { left, op, right } => {
                format!("{} {} {}", left.output_name(), op.symbol(), right.output_name())
            }
            Self::Cast { expr, to_type } => format!("CAST({} AS {to_type})", expr.output_name()),
            Self::And(a, b) => format!("{} AND {}", a.output_name(), b.output_name()),
            Self::Or(a, b) => format!("{} OR {}", a.output_name(), b.output_name()),
            Self::Not(e) => format!("NOT {}", e.output_name()),
            Self::IsNull(e) => format!("{} IS NULL", e.output_name()),
            Self::ScalarUdf { name, args } => {
                let args: Vec<String> = args.iter().map(Expr::output_name).collect();
                format!("{name}({})", args.join(", "))
            }
        }
    }

    pub fn binary(self, op: BinaryOp, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self),
            op,
            right: Box::new(right),
        }
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }
}

pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

pub fn lit(value: impl Into<ScalarValue>) -> Expr {
    Expr::Literal(value.into())
}

pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
    Expr::ScalarUdf {
        name: name.into(),
        args,
    }
}
