//! Cluster-dialect renderer. One function per descriptor variant; the text
//! returned here is submitted verbatim as a managed query job.
//!
//! Every statement replaces its output table (`INSERT ... WITH TRUNCATE`)
//! and opens with a schema-inference pragma for untyped inputs. Projections
//! are explicit wherever the remote engine would otherwise leak internal
//! columns; joins fall back to `ON` with `a.*, b.*` when no projection is
//! given, because `USING` with `SELECT *` conflicts with those columns.

use crate::{
    aggregation_parts, column_list, Agg, Expr, JoinOn, JoinType, QueryOp, TablePath,
    TranslateError,
};

/// Render a descriptor to the exact statement execution submits.
pub fn render(op: &QueryOp) -> Result<String, TranslateError> {
    match op {
        QueryOp::Join {
            left,
            right,
            output,
            on,
            how,
            columns,
        } => join(left, right, output, on, *how, columns.as_deref()),
        QueryOp::Filter {
            input,
            output,
            condition,
            columns,
        } => filter(input, output, condition, columns),
        QueryOp::Select {
            input,
            output,
            columns,
        } => select(input, output, columns),
        QueryOp::GroupBy {
            input,
            output,
            keys,
            aggregations,
        } => group_by(input, output, keys, aggregations),
        QueryOp::Union {
            inputs,
            output,
            columns,
        } => union(inputs, output, columns),
        QueryOp::Distinct {
            input,
            output,
            columns,
        } => distinct(input, output, columns.as_deref()),
        QueryOp::Sort {
            input,
            output,
            by,
            ascending,
            columns,
        } => sort(input, output, by, *ascending, columns),
        QueryOp::Limit {
            input,
            output,
            limit,
            columns,
        } => limit_op(input, output, *limit, columns),
    }
}

fn escape(table: &TablePath) -> String {
    format!("`{}`", table)
}

fn header(output: &TablePath) -> String {
    format!(
        "PRAGMA grid.InferSchema = '1';\nINSERT INTO {} WITH TRUNCATE\n",
        escape(output)
    )
}

fn join(
    left: &TablePath,
    right: &TablePath,
    output: &TablePath,
    on: &JoinOn,
    how: JoinType,
    columns: Option<&[String]>,
) -> Result<String, TranslateError> {
    let pairs = on.pairs()?;

    // USING only works cleanly with an explicit projection; without one the
    // engine's catch-all column collides, so alias both sides instead.
    if let (Some(keys), Some(columns)) = (on.same_named(), columns) {
        let select_clause = column_list(columns)?;
        let using_clause = format!("USING ({})", keys.join(", "));
        return Ok(format!(
            "{}SELECT\n    {}\nFROM {} AS a\n{} JOIN {} AS b\n{};",
            header(output),
            select_clause,
            escape(left),
            how.sql(),
            escape(right),
            using_clause
        ));
    }

    let select_clause = match columns {
        Some(columns) => column_list(columns)?,
        None => "a.*, b.*".to_string(),
    };
    let conditions: Vec<String> = pairs
        .iter()
        .map(|(l, r)| format!("a.{} = b.{}", l, r))
        .collect();
    Ok(format!(
        "{}SELECT\n    {}\nFROM {} AS a\n{} JOIN {} AS b\nON {};",
        header(output),
        select_clause,
        escape(left),
        how.sql(),
        escape(right),
        conditions.join(" AND ")
    ))
}

fn filter(
    input: &TablePath,
    output: &TablePath,
    condition: &Expr,
    columns: &[String],
) -> Result<String, TranslateError> {
    Ok(format!(
        "{}SELECT\n    {}\nFROM {}\nWHERE {};",
        header(output),
        column_list(columns)?,
        escape(input),
        condition.to_sql()?
    ))
}

fn select(
    input: &TablePath,
    output: &TablePath,
    columns: &[String],
) -> Result<String, TranslateError> {
    Ok(format!(
        "{}SELECT\n    {}\nFROM {};",
        header(output),
        column_list(columns)?,
        escape(input)
    ))
}

fn group_by(
    input: &TablePath,
    output: &TablePath,
    keys: &[String],
    aggregations: &[(String, Agg)],
) -> Result<String, TranslateError> {
    let parts = aggregation_parts(keys, aggregations)?;
    let select_clause = parts.join(",\n    ");

    // Empty key list aggregates the whole table into one row.
    if keys.is_empty() {
        Ok(format!(
            "{}SELECT\n    {}\nFROM {};",
            header(output),
            select_clause,
            escape(input)
        ))
    } else {
        Ok(format!(
            "{}SELECT\n    {}\nFROM {}\nGROUP BY {};",
            header(output),
            select_clause,
            escape(input),
            keys.join(", ")
        ))
    }
}

fn union(
    inputs: &[TablePath],
    output: &TablePath,
    columns: &[String],
) -> Result<String, TranslateError> {
    if inputs.len() < 2 {
        return Err(TranslateError::UnionArity(inputs.len()));
    }
    let select_clause = column_list(columns)?;
    let parts: Vec<String> = inputs
        .iter()
        .map(|table| format!("SELECT\n    {}\nFROM {}", select_clause, escape(table)))
        .collect();
    Ok(format!("{}{};", header(output), parts.join("\nUNION ALL\n")))
}

fn distinct(
    input: &TablePath,
    output: &TablePath,
    columns: Option<&[String]>,
) -> Result<String, TranslateError> {
    let select_clause = match columns {
        Some(columns) => column_list(columns)?,
        None => "*".to_string(),
    };
    Ok(format!(
        "{}SELECT DISTINCT\n    {}\nFROM {};",
        header(output),
        select_clause,
        escape(input)
    ))
}

fn sort(
    input: &TablePath,
    output: &TablePath,
    by: &[String],
    ascending: bool,
    columns: &[String],
) -> Result<String, TranslateError> {
    // Subquery keeps the engine's internal sort columns out of the output.
    Ok(format!(
        "{}SELECT\n    {}\nFROM (\n    SELECT *\n    FROM {}\n    ORDER BY {}\n);",
        header(output),
        column_list(columns)?,
        escape(input),
        order_clause(by, ascending)?
    ))
}

fn limit_op(
    input: &TablePath,
    output: &TablePath,
    limit: u64,
    columns: &[String],
) -> Result<String, TranslateError> {
    Ok(format!(
        "{}SELECT\n    {}\nFROM {}\nLIMIT {};",
        header(output),
        column_list(columns)?,
        escape(input),
        limit
    ))
}

pub(crate) fn order_clause(by: &[String], ascending: bool) -> Result<String, TranslateError> {
    if by.is_empty() {
        return Err(TranslateError::EmptySortKeys);
    }
    let direction = if ascending { "ASC" } else { "DESC" };
    let keys: Vec<String> = by.iter().map(|col| format!("{} {}", col, direction)).collect();
    Ok(keys.join(", "))
}
