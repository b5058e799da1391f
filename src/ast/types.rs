//! SQL AST types for synthesized queries.
//!
//! Only the read-only subset the synthesizer emits is modelled:
//! - a single SELECT over one root table
//! - one-hop joins
//! - a conjunctive filter, ORDER BY and LIMIT
//!
//! Anything richer (correlated aggregates, join conditions from the schema)
//! travels as a trusted [`Expression::Raw`] fragment.

/// A SELECT query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub projections: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub joins: Vec<Join>,
    /// Predicates joined with AND.
    pub filter: Vec<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<u64>,
}

/// A single item in the SELECT projection list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// An expression, optionally aliased: `expr AS alias`.
    Expression {
        expr: Expression,
        alias: Option<String>,
    },
}

/// Table reference in FROM or JOIN: `table AS alias`.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

/// JOIN clause representation.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableRef,
    pub condition: Option<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JoinType {
    Inner,
    Left,
}

/// Core expression type.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Column reference: `table.column` or just `column`.
    Column { table: Option<String>, name: String },
    /// Literal value.
    Literal(Literal),
    /// Binary operation: `left op right`.
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    /// Function call: `name(args)`.
    Function { name: String, args: Vec<Expression> },
    /// Wildcard `*` (used in COUNT(*)).
    Wildcard,
    /// Parameter placeholder `$n`. Parameters are always bound as text; a
    /// non-text `cast` is applied on the server side (`$1::text::uuid`).
    Parameter { index: usize, cast: Option<String> },
    /// expr IS NULL / IS NOT NULL.
    IsNull {
        expr: Box<Expression>,
        negated: bool,
    },
    /// Nested expression (parenthesized).
    Nested(Box<Expression>),
    /// Trusted SQL fragment from the schema or rule table, emitted verbatim.
    Raw(String),
}

/// Literal values in SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    String(String),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

/// ORDER BY expression.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: Expression,
    pub asc: Option<bool>,
}

impl Expression {
    pub fn column(table: &str, name: &str) -> Self {
        Expression::Column {
            table: Some(table.to_string()),
            name: name.to_string(),
        }
    }

    pub fn param(index: usize, cast: Option<&str>) -> Self {
        Expression::Parameter {
            index,
            cast: cast.map(str::to_string),
        }
    }

    pub fn binary(self, op: BinaryOperator, right: Expression) -> Self {
        Expression::BinaryOp {
            left: Box::new(self),
            op,
            right: Box::new(right),
        }
    }

    pub fn count_star() -> Self {
        Expression::Function {
            name: "COUNT".to_string(),
            args: vec![Expression::Wildcard],
        }
    }
}

impl TableRef {
    pub fn aliased(name: &str, alias: &str) -> Self {
        Self {
            name: name.to_string(),
            alias: Some(alias.to_string()),
        }
    }
}
