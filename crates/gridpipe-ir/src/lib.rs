//! Structured-query descriptors for the dual-backend pipeline client.
//!
//! Every table-to-table transform is a [`QueryOp`] value. Each backend owns
//! exactly one translation function per variant ([`remote::render`] for the
//! cluster dialect, [`local::plan`] for the embedded engine), so the text a
//! dry run returns is the text execution submits, by construction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub mod local;
pub mod remote;

/// One table row: field name to JSON value.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("union requires at least 2 input tables, got {0}")]
    UnionArity(usize),

    #[error("column projection is empty")]
    EmptyProjection,

    #[error("join key list is empty")]
    EmptyJoinKeys,

    #[error("join key lists differ in length: left {left}, right {right}")]
    JoinKeyMismatch { left: usize, right: usize },

    #[error("aggregation map is empty")]
    EmptyAggregations,

    #[error("sort key list is empty")]
    EmptySortKeys,

    #[error("unsupported literal in predicate: {0}")]
    UnsupportedLiteral(String),
}

/// Logical slash-delimited table path, e.g. `//home/pipelines/demo/users`.
///
/// The same path addresses a cluster table remotely and a JSON-lines file
/// under the simulation root locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TablePath(String);

impl TablePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component.
    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(self.0.as_str())
    }

    /// Child path under this one.
    pub fn join(&self, name: &str) -> TablePath {
        TablePath(format!("{}/{}", self.0.trim_end_matches('/'), name))
    }

    /// Identifier-safe name for the embedded engine: `t_` plus the path with
    /// every non-alphanumeric character folded to `_`.
    pub fn table_ident(&self) -> String {
        let mut ident = String::with_capacity(self.0.len() + 2);
        ident.push_str("t_");
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() {
                ident.push(c);
            } else {
                ident.push('_');
            }
        }
        ident
    }
}

impl fmt::Display for TablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TablePath {
    fn from(path: &str) -> Self {
        Self(path.to_string())
    }
}

impl From<String> for TablePath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// Structured-query descriptor. One variant per client operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum QueryOp {
    Join {
        left: TablePath,
        right: TablePath,
        output: TablePath,
        on: JoinOn,
        how: JoinType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        columns: Option<Vec<String>>,
    },
    Filter {
        input: TablePath,
        output: TablePath,
        condition: Expr,
        columns: Vec<String>,
    },
    Select {
        input: TablePath,
        output: TablePath,
        columns: Vec<String>,
    },
    GroupBy {
        input: TablePath,
        output: TablePath,
        keys: Vec<String>,
        /// Output column name paired with its aggregation, in declared order.
        aggregations: Vec<(String, Agg)>,
    },
    Union {
        inputs: Vec<TablePath>,
        output: TablePath,
        columns: Vec<String>,
    },
    Distinct {
        input: TablePath,
        output: TablePath,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        columns: Option<Vec<String>>,
    },
    Sort {
        input: TablePath,
        output: TablePath,
        by: Vec<String>,
        ascending: bool,
        columns: Vec<String>,
    },
    Limit {
        input: TablePath,
        output: TablePath,
        limit: u64,
        columns: Vec<String>,
    },
}

impl QueryOp {
    pub fn join(
        left: impl Into<TablePath>,
        right: impl Into<TablePath>,
        output: impl Into<TablePath>,
        on: impl Into<JoinOn>,
        how: JoinType,
        columns: Option<Vec<String>>,
    ) -> Self {
        QueryOp::Join {
            left: left.into(),
            right: right.into(),
            output: output.into(),
            on: on.into(),
            how,
            columns,
        }
    }

    pub fn filter(
        input: impl Into<TablePath>,
        output: impl Into<TablePath>,
        condition: Expr,
        columns: Vec<String>,
    ) -> Self {
        QueryOp::Filter {
            input: input.into(),
            output: output.into(),
            condition,
            columns,
        }
    }

    pub fn select(
        input: impl Into<TablePath>,
        output: impl Into<TablePath>,
        columns: Vec<String>,
    ) -> Self {
        QueryOp::Select {
            input: input.into(),
            output: output.into(),
            columns,
        }
    }

    pub fn group_by(
        input: impl Into<TablePath>,
        output: impl Into<TablePath>,
        keys: Vec<String>,
        aggregations: Vec<(String, Agg)>,
    ) -> Self {
        QueryOp::GroupBy {
            input: input.into(),
            output: output.into(),
            keys,
            aggregations,
        }
    }

    pub fn union_all(
        inputs: Vec<TablePath>,
        output: impl Into<TablePath>,
        columns: Vec<String>,
    ) -> Self {
        QueryOp::Union {
            inputs,
            output: output.into(),
            columns,
        }
    }

    pub fn distinct(
        input: impl Into<TablePath>,
        output: impl Into<TablePath>,
        columns: Option<Vec<String>>,
    ) -> Self {
        QueryOp::Distinct {
            input: input.into(),
            output: output.into(),
            columns,
        }
    }

    pub fn sort(
        input: impl Into<TablePath>,
        output: impl Into<TablePath>,
        by: Vec<String>,
        ascending: bool,
        columns: Vec<String>,
    ) -> Self {
        QueryOp::Sort {
            input: input.into(),
            output: output.into(),
            by,
            ascending,
            columns,
        }
    }

    pub fn limit(
        input: impl Into<TablePath>,
        output: impl Into<TablePath>,
        limit: u64,
        columns: Vec<String>,
    ) -> Self {
        QueryOp::Limit {
            input: input.into(),
            output: output.into(),
            limit,
            columns,
        }
    }

    /// Tables the operation reads.
    pub fn inputs(&self) -> Vec<&TablePath> {
        match self {
            QueryOp::Join { left, right, .. } => vec![left, right],
            QueryOp::Filter { input, .. }
            | QueryOp::Select { input, .. }
            | QueryOp::GroupBy { input, .. }
            | QueryOp::Distinct { input, .. }
            | QueryOp::Sort { input, .. }
            | QueryOp::Limit { input, .. } => vec![input],
            QueryOp::Union { inputs, .. } => inputs.iter().collect(),
        }
    }

    /// Table the operation replaces.
    pub fn output(&self) -> &TablePath {
        match self {
            QueryOp::Join { output, .. }
            | QueryOp::Filter { output, .. }
            | QueryOp::Select { output, .. }
            | QueryOp::GroupBy { output, .. }
            | QueryOp::Union { output, .. }
            | QueryOp::Distinct { output, .. }
            | QueryOp::Sort { output, .. }
            | QueryOp::Limit { output, .. } => output,
        }
    }

    /// Short operation name for logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryOp::Join { .. } => "join",
            QueryOp::Filter { .. } => "filter",
            QueryOp::Select { .. } => "select",
            QueryOp::GroupBy { .. } => "group_by",
            QueryOp::Union { .. } => "union",
            QueryOp::Distinct { .. } => "distinct",
            QueryOp::Sort { .. } => "sort",
            QueryOp::Limit { .. } => "limit",
        }
    }
}

/// Join key specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinOn {
    /// Single column, same name on both sides.
    Column(String),
    /// Multiple columns, same names on both sides.
    Columns(Vec<String>),
    /// Differently-named columns, matched positionally.
    Pairs { left: Vec<String>, right: Vec<String> },
}

impl JoinOn {
    /// Key columns when both sides use the same names.
    pub fn same_named(&self) -> Option<Vec<&str>> {
        match self {
            JoinOn::Column(c) => Some(vec![c.as_str()]),
            JoinOn::Columns(cols) => Some(cols.iter().map(String::as_str).collect()),
            JoinOn::Pairs { .. } => None,
        }
    }

    /// Normalized (left, right) column pairs.
    pub fn pairs(&self) -> Result<Vec<(&str, &str)>, TranslateError> {
        let pairs: Vec<(&str, &str)> = match self {
            JoinOn::Column(c) => vec![(c.as_str(), c.as_str())],
            JoinOn::Columns(cols) => cols.iter().map(|c| (c.as_str(), c.as_str())).collect(),
            JoinOn::Pairs { left, right } => {
                if left.len() != right.len() {
                    return Err(TranslateError::JoinKeyMismatch {
                        left: left.len(),
                        right: right.len(),
                    });
                }
                left.iter()
                    .zip(right.iter())
                    .map(|(l, r)| (l.as_str(), r.as_str()))
                    .collect()
            }
        };
        if pairs.is_empty() {
            return Err(TranslateError::EmptyJoinKeys);
        }
        Ok(pairs)
    }
}

impl From<&str> for JoinOn {
    fn from(column: &str) -> Self {
        JoinOn::Column(column.to_string())
    }
}

impl From<String> for JoinOn {
    fn from(column: String) -> Self {
        JoinOn::Column(column)
    }
}

impl From<Vec<String>> for JoinOn {
    fn from(columns: Vec<String>) -> Self {
        JoinOn::Columns(columns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    pub fn sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER",
            JoinType::Left => "LEFT",
            JoinType::Right => "RIGHT",
            JoinType::Full => "FULL OUTER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

impl AggFunc {
    pub fn sql(&self) -> &'static str {
        match self {
            AggFunc::Count => "COUNT",
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Max => "MAX",
            AggFunc::Min => "MIN",
        }
    }
}

/// Aggregation for one output column of a group-by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Agg {
    /// Bare function; the source column is inferred from the output column
    /// name by stripping a conventional prefix (`total_amount` sums `amount`).
    Func(AggFunc),
    /// Function over an explicit source column.
    On { func: AggFunc, column: String },
}

impl Agg {
    pub fn count() -> Self {
        Agg::Func(AggFunc::Count)
    }

    pub fn sum(column: impl Into<String>) -> Self {
        Agg::On {
            func: AggFunc::Sum,
            column: column.into(),
        }
    }

    pub fn avg(column: impl Into<String>) -> Self {
        Agg::On {
            func: AggFunc::Avg,
            column: column.into(),
        }
    }

    pub fn max(column: impl Into<String>) -> Self {
        Agg::On {
            func: AggFunc::Max,
            column: column.into(),
        }
    }

    pub fn min(column: impl Into<String>) -> Self {
        Agg::On {
            func: AggFunc::Min,
            column: column.into(),
        }
    }

    pub fn func(&self) -> AggFunc {
        match self {
            Agg::Func(func) => *func,
            Agg::On { func, .. } => *func,
        }
    }

    /// Source column this aggregation reads, given its output column name.
    /// Meaningless for `count`, which counts rows.
    pub fn source_column<'a>(&'a self, output: &'a str) -> &'a str {
        match self {
            Agg::On { column, .. } => column.as_str(),
            Agg::Func(_) => strip_agg_prefix(output),
        }
    }
}

fn strip_agg_prefix(name: &str) -> &str {
    for prefix in ["total_", "avg_", "min_", "max_", "count_"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            return rest;
        }
    }
    name
}

/// Scalar expression used in filter predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    Literal { value: Value },
    Column { name: String },
    BinaryOp { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    UnaryOp { op: UnOp, expr: Box<Expr> },
    IsNull { expr: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Not,
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Expr {
        Expr::Column { name: name.into() }
    }

    pub fn lit(value: impl Into<Value>) -> Expr {
        Expr::Literal { value: value.into() }
    }

    fn binary(self, op: BinOp, right: Expr) -> Expr {
        Expr::BinaryOp {
            op,
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    pub fn eq(self, right: Expr) -> Expr {
        self.binary(BinOp::Eq, right)
    }

    pub fn ne(self, right: Expr) -> Expr {
        self.binary(BinOp::Ne, right)
    }

    pub fn lt(self, right: Expr) -> Expr {
        self.binary(BinOp::Lt, right)
    }

    pub fn le(self, right: Expr) -> Expr {
        self.binary(BinOp::Le, right)
    }

    pub fn gt(self, right: Expr) -> Expr {
        self.binary(BinOp::Gt, right)
    }

    pub fn ge(self, right: Expr) -> Expr {
        self.binary(BinOp::Ge, right)
    }

    pub fn and(self, right: Expr) -> Expr {
        self.binary(BinOp::And, right)
    }

    pub fn or(self, right: Expr) -> Expr {
        self.binary(BinOp::Or, right)
    }

    pub fn not(expr: Expr) -> Expr {
        Expr::UnaryOp {
            op: UnOp::Not,
            expr: Box::new(expr),
        }
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull { expr: Box::new(self) }
    }

    /// Render as a SQL predicate. Identical for both dialects.
    pub fn to_sql(&self) -> Result<String, TranslateError> {
        match self {
            Expr::Literal { value } => literal_sql(value),
            Expr::Column { name } => Ok(ident_sql(name)),
            Expr::BinaryOp { op, left, right } => {
                let sym = match op {
                    BinOp::Eq => "=",
                    BinOp::Ne => "<>",
                    BinOp::Lt => "<",
                    BinOp::Le => "<=",
                    BinOp::Gt => ">",
                    BinOp::Ge => ">=",
                    BinOp::And => "AND",
                    BinOp::Or => "OR",
                };
                Ok(format!("({} {} {})", left.to_sql()?, sym, right.to_sql()?))
            }
            Expr::UnaryOp { op: UnOp::Not, expr } => Ok(format!("(NOT {})", expr.to_sql()?)),
            Expr::IsNull { expr } => Ok(format!("({} IS NULL)", expr.to_sql()?)),
        }
    }

    /// Evaluate against a row with SQL-style three-valued logic. Unknown
    /// columns and incomparable values evaluate to null.
    pub fn eval(&self, row: &Row) -> Value {
        match self {
            Expr::Literal { value } => value.clone(),
            Expr::Column { name } => row.get(name).cloned().unwrap_or(Value::Null),
            Expr::BinaryOp { op: BinOp::And, left, right } => {
                match (truth(&left.eval(row)), truth(&right.eval(row))) {
                    (Some(false), _) | (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                }
            }
            Expr::BinaryOp { op: BinOp::Or, left, right } => {
                match (truth(&left.eval(row)), truth(&right.eval(row))) {
                    (Some(true), _) | (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Null,
                }
            }
            Expr::BinaryOp { op, left, right } => {
                compare_values(&left.eval(row), &right.eval(row), *op)
            }
            Expr::UnaryOp { op: UnOp::Not, expr } => match truth(&expr.eval(row)) {
                Some(b) => Value::Bool(!b),
                None => Value::Null,
            },
            Expr::IsNull { expr } => Value::Bool(expr.eval(row).is_null()),
        }
    }

    /// True iff the predicate evaluates to true for the row.
    pub fn matches(&self, row: &Row) -> bool {
        self.eval(row) == Value::Bool(true)
    }
}

fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

fn compare_values(left: &Value, right: &Value, op: BinOp) -> Value {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(a), Value::Number(b)) => cmp_numbers(a, b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    let Some(ordering) = ordering else {
        return Value::Null;
    };

    let result = match op {
        BinOp::Eq => ordering == Ordering::Equal,
        BinOp::Ne => ordering != Ordering::Equal,
        BinOp::Lt => ordering == Ordering::Less,
        BinOp::Le => ordering != Ordering::Greater,
        BinOp::Gt => ordering == Ordering::Greater,
        BinOp::Ge => ordering != Ordering::Less,
        BinOp::And | BinOp::Or => return Value::Null,
    };
    Value::Bool(result)
}

fn cmp_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Some(x.cmp(&y));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => None,
    }
}

fn literal_sql(value: &Value) -> Result<String, TranslateError> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(true) => Ok("TRUE".to_string()),
        Value::Bool(false) => Ok("FALSE".to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
        other => Err(TranslateError::UnsupportedLiteral(other.to_string())),
    }
}

fn ident_sql(name: &str) -> String {
    let plain = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Comma-joined projection list in the shared multi-line layout.
pub(crate) fn column_list(columns: &[String]) -> Result<String, TranslateError> {
    if columns.is_empty() {
        return Err(TranslateError::EmptyProjection);
    }
    Ok(columns.join(",\n    "))
}

/// SELECT parts for a group-by: key columns first, then aggregations in
/// declared order. `count` renders as `COUNT(*)`.
pub(crate) fn aggregation_parts(
    keys: &[String],
    aggregations: &[(String, Agg)],
) -> Result<Vec<String>, TranslateError> {
    if aggregations.is_empty() {
        return Err(TranslateError::EmptyAggregations);
    }
    let mut parts: Vec<String> = keys.to_vec();
    for (output, agg) in aggregations {
        let part = match agg.func() {
            AggFunc::Count => format!("COUNT(*) AS {}", output),
            func => format!("{}({}) AS {}", func.sql(), agg.source_column(output), output),
        };
        parts.push(part);
    }
    Ok(parts)
}
