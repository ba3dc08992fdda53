//! Embedded-engine planner. One function per descriptor variant; the SQL in
//! the returned plan is executed verbatim by the local backend, which loads
//! each input file under its binding name first and writes the result rows
//! back to the output path itself.
//!
//! Two deliberate departures from the cluster dialect: same-named join keys
//! always use `USING`, so unmatched outer rows keep the surviving side's key
//! values instead of a null from the other alias; and sort is a flat
//! `ORDER BY`, because the subquery form only exists to suppress a
//! remote-engine artifact.

use crate::{
    aggregation_parts, column_list, remote::order_clause, Agg, JoinOn, JoinType, QueryOp,
    TablePath, TranslateError,
};

/// Input table bound to its engine-side identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBinding {
    pub path: TablePath,
    pub table: String,
}

impl TableBinding {
    fn new(path: &TablePath) -> Self {
        Self {
            path: path.clone(),
            table: path.table_ident(),
        }
    }
}

/// Executable plan for the local backend.
#[derive(Debug, Clone)]
pub struct LocalPlan {
    /// SELECT statement over the bound table names.
    pub sql: String,
    /// Tables to load before running `sql`, deduplicated.
    pub inputs: Vec<TableBinding>,
    /// Table the result rows replace.
    pub output: TablePath,
}

/// Plan a descriptor for the embedded engine.
pub fn plan(op: &QueryOp) -> Result<LocalPlan, TranslateError> {
    let sql = match op {
        QueryOp::Join {
            left,
            right,
            on,
            how,
            columns,
            ..
        } => join(left, right, on, *how, columns.as_deref())?,
        QueryOp::Filter {
            input,
            condition,
            columns,
            ..
        } => format!(
            "SELECT\n    {}\nFROM {}\nWHERE {}",
            column_list(columns)?,
            input.table_ident(),
            condition.to_sql()?
        ),
        QueryOp::Select { input, columns, .. } => format!(
            "SELECT\n    {}\nFROM {}",
            column_list(columns)?,
            input.table_ident()
        ),
        QueryOp::GroupBy {
            input,
            keys,
            aggregations,
            ..
        } => group_by(input, keys, aggregations)?,
        QueryOp::Union {
            inputs, columns, ..
        } => union(inputs, columns)?,
        QueryOp::Distinct { input, columns, .. } => {
            let select_clause = match columns.as_deref() {
                Some(columns) => column_list(columns)?,
                None => "*".to_string(),
            };
            format!(
                "SELECT DISTINCT\n    {}\nFROM {}",
                select_clause,
                input.table_ident()
            )
        }
        QueryOp::Sort {
            input,
            by,
            ascending,
            columns,
            ..
        } => format!(
            "SELECT\n    {}\nFROM {}\nORDER BY {}",
            column_list(columns)?,
            input.table_ident(),
            order_clause(by, *ascending)?
        ),
        QueryOp::Limit {
            input,
            limit,
            columns,
            ..
        } => format!(
            "SELECT\n    {}\nFROM {}\nLIMIT {}",
            column_list(columns)?,
            input.table_ident(),
            limit
        ),
    };

    Ok(LocalPlan {
        sql,
        inputs: bindings(op),
        output: op.output().clone(),
    })
}

fn bindings(op: &QueryOp) -> Vec<TableBinding> {
    let mut out: Vec<TableBinding> = Vec::new();
    for path in op.inputs() {
        let binding = TableBinding::new(path);
        if !out.iter().any(|b| b.table == binding.table) {
            out.push(binding);
        }
    }
    out
}

fn join(
    left: &TablePath,
    right: &TablePath,
    on: &JoinOn,
    how: JoinType,
    columns: Option<&[String]>,
) -> Result<String, TranslateError> {
    let pairs = on.pairs()?;

    if let Some(keys) = on.same_named() {
        // USING coalesces the key columns, so a `SELECT *` projection keeps
        // the surviving side's keys on unmatched outer rows.
        let select_clause = match columns {
            Some(columns) => column_list(columns)?,
            None => "*".to_string(),
        };
        return Ok(format!(
            "SELECT\n    {}\nFROM {} AS a\n{} JOIN {} AS b\nUSING ({})",
            select_clause,
            left.table_ident(),
            how.sql(),
            right.table_ident(),
            keys.join(", ")
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
        "SELECT\n    {}\nFROM {} AS a\n{} JOIN {} AS b\nON {}",
        select_clause,
        left.table_ident(),
        how.sql(),
        right.table_ident(),
        conditions.join(" AND ")
    ))
}

fn group_by(
    input: &TablePath,
    keys: &[String],
    aggregations: &[(String, Agg)],
) -> Result<String, TranslateError> {
    let parts = aggregation_parts(keys, aggregations)?;
    let select_clause = parts.join(",\n    ");
    if keys.is_empty() {
        Ok(format!(
            "SELECT\n    {}\nFROM {}",
            select_clause,
            input.table_ident()
        ))
    } else {
        Ok(format!(
            "SELECT\n    {}\nFROM {}\nGROUP BY {}",
            select_clause,
            input.table_ident(),
            keys.join(", ")
        ))
    }
}

fn union(inputs: &[TablePath], columns: &[String]) -> Result<String, TranslateError> {
    if inputs.len() < 2 {
        return Err(TranslateError::UnionArity(inputs.len()));
    }
    let select_clause = column_list(columns)?;
    let parts: Vec<String> = inputs
        .iter()
        .map(|table| {
            format!(
                "SELECT\n    {}\nFROM {}",
                select_clause,
                table.table_ident()
            )
        })
        .collect();
    Ok(parts.join("\nUNION ALL\n"))
}
