//! Minimal query model seen by extension processors.
//!
//! Processors only ever append `WHERE` conditions and toggle the final read,
//! so that is all this model carries. Conditions render in the store's SQL
//! dialect.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Column(String),
    Function { name: String, args: Vec<Expression> },
}

impl Expression {
    pub fn column(name: impl Into<String>) -> Self {
        Expression::Column(name.into())
    }

    pub fn function(name: impl Into<String>, args: Vec<Expression>) -> Self {
        Expression::Function {
            name: name.into(),
            args,
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Column(name) => f.write_str(name),
            Expression::Function { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    In,
    NotIn,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operator::Eq => "=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Int(u64),
    String(String),
    List(Vec<Literal>),
}

impl Literal {
    pub fn int_list<I: IntoIterator<Item = u64>>(values: I) -> Self {
        Literal::List(values.into_iter().map(Literal::Int).collect())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{}", v),
            Literal::String(s) => {
                write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
            }
            Literal::List(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub lhs: Expression,
    pub operator: Operator,
    pub rhs: Literal,
}

impl Condition {
    pub fn new(lhs: Expression, operator: Operator, rhs: Literal) -> Self {
        Self { lhs, operator, rhs }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.lhs, self.operator, self.rhs)
    }
}

/// The parts of a query processors may change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Vec<Condition>,
    use_final: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn add_condition(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    pub fn add_conditions(&mut self, conditions: impl IntoIterator<Item = Condition>) {
        self.conditions.extend(conditions);
    }

    /// Read from the fully merged view of the table.
    pub fn set_final(&mut self, use_final: bool) {
        self.use_final = use_final;
    }

    pub fn is_final(&self) -> bool {
        self.use_final
    }

    /// Conditions joined with `AND`, or `None` if there are none.
    pub fn where_clause(&self) -> Option<String> {
        if self.conditions.is_empty() {
            return None;
        }
        Some(
            self.conditions
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(" AND "),
        )
    }
}
