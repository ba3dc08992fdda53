//! In-memory fake backend for tests.
//!
//! Tables, staged files, and job outcomes live in plain maps behind a
//! `RefCell`. Structured queries are interpreted directly over the stored
//! rows with the same observable semantics as the real backends, and map
//! operations honor the requested replica count, so partitioning and
//! failure-threshold behavior are testable without a cluster. Registered
//! transforms stand in for worker entry scripts, keyed by entry path.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use gridpipe_ir::{remote, Agg, AggFunc, JoinOn, JoinType, QueryOp, Row, TablePath};
use serde_json::Value;

use crate::client::{GridClient, RowStream};
use crate::error::ClientError;
use crate::jobs::{
    JobOutcome, JobState, MapJobSpec, OperationHandle, VanillaJobSpec,
};
use crate::partition::partition_rows;

/// Worker stand-in: maps one input row to zero or more output rows, or fails
/// the worker with a message.
pub type MapTransform = Rc<dyn Fn(&Row) -> Result<Vec<Row>, String>>;

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Row>>,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    upload_counts: BTreeMap<String, u64>,
    executed_queries: Vec<String>,
    outcomes: HashMap<String, JobOutcome>,
    last_map_spec: Option<MapJobSpec>,
    last_vanilla_spec: Option<VanillaJobSpec>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryClient {
    state: RefCell<MemoryState>,
    transforms: RefCell<HashMap<String, MapTransform>>,
    vanilla_results: RefCell<HashMap<String, Result<(), String>>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the transform standing in for a map entry script.
    pub fn register_transform(
        &self,
        entry: impl Into<String>,
        transform: impl Fn(&Row) -> Result<Vec<Row>, String> + 'static,
    ) {
        self.transforms
            .borrow_mut()
            .insert(entry.into(), Rc::new(transform));
    }

    /// Register the exit behavior standing in for a vanilla entry script.
    pub fn register_vanilla(&self, entry: impl Into<String>, result: Result<(), String>) {
        self.vanilla_results.borrow_mut().insert(entry.into(), result);
    }

    /// Number of times a file has been physically uploaded to this path.
    pub fn upload_count(&self, path: &TablePath) -> u64 {
        self.state
            .borrow()
            .upload_counts
            .get(path.as_str())
            .copied()
            .unwrap_or(0)
    }

    /// Query texts executed (dry runs excluded), in order.
    pub fn executed_queries(&self) -> Vec<String> {
        self.state.borrow().executed_queries.clone()
    }

    pub fn last_map_spec(&self) -> Option<MapJobSpec> {
        self.state.borrow().last_map_spec.clone()
    }

    pub fn last_vanilla_spec(&self) -> Option<VanillaJobSpec> {
        self.state.borrow().last_vanilla_spec.clone()
    }

    fn finish(&self, state: &mut MemoryState, outcome: JobOutcome) -> OperationHandle {
        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        state.outcomes.insert(id.clone(), outcome);
        OperationHandle { id }
    }
}

impl GridClient for MemoryClient {
    fn create_path(&self, path: &TablePath) -> Result<(), ClientError> {
        self.state
            .borrow_mut()
            .dirs
            .insert(path.as_str().to_string());
        Ok(())
    }

    fn exists(&self, path: &TablePath) -> Result<bool, ClientError> {
        let state = self.state.borrow();
        let key = path.as_str();
        Ok(state.tables.contains_key(key)
            || state.files.contains_key(key)
            || state.dirs.contains(key))
    }

    fn write_table(&self, path: &TablePath, rows: &[Row], append: bool) -> Result<(), ClientError> {
        let mut state = self.state.borrow_mut();
        let table = state.tables.entry(path.as_str().to_string()).or_default();
        if !append {
            table.clear();
        }
        table.extend(rows.iter().cloned());
        Ok(())
    }

    fn read_table(&self, path: &TablePath) -> Result<RowStream, ClientError> {
        let rows = self
            .state
            .borrow()
            .tables
            .get(path.as_str())
            .cloned()
            .ok_or_else(|| ClientError::Validation(format!("table not found: {}", path)))?;
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn row_count(&self, path: &TablePath) -> Result<u64, ClientError> {
        let state = self.state.borrow();
        let rows = state
            .tables
            .get(path.as_str())
            .ok_or_else(|| ClientError::Validation(format!("table not found: {}", path)))?;
        Ok(rows.len() as u64)
    }

    fn query(&self, op: &QueryOp, dry_run: bool) -> Result<Option<String>, ClientError> {
        // Render first so malformed descriptors fail the same way they would
        // against a real backend.
        let text = remote::render(op)?;
        if dry_run {
            return Ok(Some(text));
        }

        let mut state = self.state.borrow_mut();
        let result = interpret(&state.tables, op)?;
        state
            .tables
            .insert(op.output().as_str().to_string(), result);
        state.executed_queries.push(text);
        Ok(None)
    }

    fn submit_map(&self, spec: &MapJobSpec) -> Result<OperationHandle, ClientError> {
        let key = spec.entry.display().to_string();
        let transform = self
            .transforms
            .borrow()
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                ClientError::Validation(format!("no transform registered for entry: {}", key))
            })?;

        let mut state = self.state.borrow_mut();
        state.last_map_spec = Some(spec.clone());
        let input = state
            .tables
            .get(spec.input.as_str())
            .cloned()
            .ok_or_else(|| ClientError::Validation(format!("table not found: {}", spec.input)))?;

        let workers = spec.resources.job_count.max(1);
        let mut failed = 0u64;
        let mut first_error: Option<String> = None;
        let mut output = Vec::new();

        for partition in partition_rows(input, workers) {
            // A row error aborts the worker; its partial output is discarded.
            let mut worker_output = Vec::new();
            let mut worker_failed = false;
            for row in &partition {
                match transform(row) {
                    Ok(mut rows) => worker_output.append(&mut rows),
                    Err(message) => {
                        worker_failed = true;
                        if first_error.is_none() {
                            first_error = Some(message);
                        }
                        break;
                    }
                }
            }
            if worker_failed {
                failed += 1;
            } else {
                output.append(&mut worker_output);
            }
        }

        let outcome = if failed > spec.resources.max_failed_jobs {
            JobOutcome::failure(
                failed,
                format!(
                    "{} of {} workers failed: {}",
                    failed,
                    workers,
                    first_error.unwrap_or_default()
                ),
            )
        } else {
            state
                .tables
                .insert(spec.output.as_str().to_string(), output);
            JobOutcome {
                state: JobState::Succeeded,
                failed_jobs: failed,
                message: None,
            }
        };
        Ok(self.finish(&mut state, outcome))
    }

    fn submit_vanilla(&self, spec: &VanillaJobSpec) -> Result<OperationHandle, ClientError> {
        let key = spec.entry.display().to_string();
        let result = self
            .vanilla_results
            .borrow()
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                ClientError::Validation(format!("no result registered for entry: {}", key))
            })?;

        let mut state = self.state.borrow_mut();
        state.last_vanilla_spec = Some(spec.clone());
        let outcome = match result {
            Ok(()) => JobOutcome::success(),
            Err(message) => JobOutcome::failure(1, message),
        };
        Ok(self.finish(&mut state, outcome))
    }

    fn wait_operation(&self, handle: &OperationHandle) -> Result<JobOutcome, ClientError> {
        self.state
            .borrow_mut()
            .outcomes
            .remove(&handle.id)
            .ok_or_else(|| {
                ClientError::Validation(format!("unknown operation handle: {}", handle.id))
            })
    }

    fn upload_file(&self, local: &Path, remote: &TablePath) -> Result<(), ClientError> {
        if !local.is_file() {
            return Err(ClientError::Validation(format!(
                "upload source not found: {}",
                local.display()
            )));
        }
        let bytes = fs::read(local)?;
        let mut state = self.state.borrow_mut();
        state.files.insert(remote.as_str().to_string(), bytes);
        *state
            .upload_counts
            .entry(remote.as_str().to_string())
            .or_insert(0) += 1;
        Ok(())
    }
}

fn interpret(tables: &BTreeMap<String, Vec<Row>>, op: &QueryOp) -> Result<Vec<Row>, ClientError> {
    let input = |path: &TablePath| -> Result<&Vec<Row>, ClientError> {
        tables
            .get(path.as_str())
            .ok_or_else(|| ClientError::Validation(format!("table not found: {}", path)))
    };

    match op {
        QueryOp::Join {
            left,
            right,
            on,
            how,
            columns,
            ..
        } => join_rows(input(left)?, input(right)?, on, *how, columns.as_deref()),
        QueryOp::Filter {
            input: table,
            condition,
            columns,
            ..
        } => Ok(project_all(
            input(table)?.iter().filter(|row| condition.matches(row)),
            columns,
        )),
        QueryOp::Select {
            input: table,
            columns,
            ..
        } => Ok(project_all(input(table)?.iter(), columns)),
        QueryOp::GroupBy {
            input: table,
            keys,
            aggregations,
            ..
        } => group_rows(input(table)?, keys, aggregations),
        QueryOp::Union {
            inputs, columns, ..
        } => {
            let mut out = Vec::new();
            for table in inputs {
                out.extend(project_all(input(table)?.iter(), columns));
            }
            Ok(out)
        }
        QueryOp::Distinct {
            input: table,
            columns,
            ..
        } => {
            let rows: Vec<Row> = match columns {
                Some(columns) => project_all(input(table)?.iter(), columns),
                None => input(table)?.clone(),
            };
            let mut seen = BTreeSet::new();
            let mut out = Vec::new();
            for row in rows {
                let key = serde_json::to_string(&row)?;
                if seen.insert(key) {
                    out.push(row);
                }
            }
            Ok(out)
        }
        QueryOp::Sort {
            input: table,
            by,
            ascending,
            columns,
            ..
        } => {
            let mut rows: Vec<Row> = input(table)?.clone();
            rows.sort_by(|a, b| {
                let mut ordering = Ordering::Equal;
                for key in by {
                    ordering = cmp_cells(a.get(key), b.get(key));
                    if ordering != Ordering::Equal {
                        break;
                    }
                }
                if *ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
            Ok(project_all(rows.iter(), columns))
        }
        QueryOp::Limit {
            input: table,
            limit,
            columns,
            ..
        } => Ok(project_all(
            input(table)?.iter().take(*limit as usize),
            columns,
        )),
    }
}

/// Project rows onto bare column names; missing cells become nulls.
fn project_all<'a>(rows: impl Iterator<Item = &'a Row>, columns: &[String]) -> Vec<Row> {
    rows.map(|row| project(row, columns)).collect()
}

fn project(row: &Row, columns: &[String]) -> Row {
    columns
        .iter()
        .map(|col| {
            let name = unqualified(col);
            (
                name.to_string(),
                row.get(name).cloned().unwrap_or(Value::Null),
            )
        })
        .collect()
}

/// `a.id` and `b.id` address merged join columns by their bare name.
fn unqualified(column: &str) -> &str {
    column
        .strip_prefix("a.")
        .or_else(|| column.strip_prefix("b."))
        .unwrap_or(column)
}

fn join_rows(
    left: &[Row],
    right: &[Row],
    on: &JoinOn,
    how: JoinType,
    columns: Option<&[String]>,
) -> Result<Vec<Row>, ClientError> {
    let pairs = on.pairs()?;
    let coalesce = on.same_named().is_some();
    let left_keys: Vec<&str> = pairs.iter().map(|(l, _)| *l).collect();
    let right_keys: Vec<&str> = pairs.iter().map(|(_, r)| *r).collect();

    // Null keys never match, as in SQL equality.
    let key_of = |row: &Row, cols: &[&str]| -> Option<Vec<Value>> {
        cols.iter()
            .map(|col| match row.get(*col) {
                Some(Value::Null) | None => None,
                Some(value) => Some(value.clone()),
            })
            .collect()
    };

    let left_fields = field_union(left);
    let right_fields = field_union(right);

    let mut matched_right = vec![false; right.len()];
    let mut merged = Vec::new();

    for lrow in left {
        let lkey = key_of(lrow, &left_keys);
        let mut matched = false;
        if let Some(lkey) = &lkey {
            for (ri, rrow) in right.iter().enumerate() {
                if key_of(rrow, &right_keys).as_ref() == Some(lkey) {
                    matched = true;
                    matched_right[ri] = true;

                    let mut row = lrow.clone();
                    for (field, value) in rrow {
                        if coalesce && right_keys.contains(&field.as_str()) {
                            continue;
                        }
                        row.insert(field.clone(), value.clone());
                    }
                    merged.push(row);
                }
            }
        }
        if !matched && matches!(how, JoinType::Left | JoinType::Full) {
            let mut row = lrow.clone();
            for field in &right_fields {
                if coalesce && right_keys.contains(&field.as_str()) {
                    continue;
                }
                row.insert(field.clone(), Value::Null);
            }
            merged.push(row);
        }
    }

    if matches!(how, JoinType::Right | JoinType::Full) {
        for (ri, rrow) in right.iter().enumerate() {
            if !matched_right[ri] {
                let mut row = rrow.clone();
                for field in &left_fields {
                    if coalesce && left_keys.contains(&field.as_str()) {
                        continue;
                    }
                    row.entry(field.clone()).or_insert(Value::Null);
                }
                merged.push(row);
            }
        }
    }

    Ok(match columns {
        Some(columns) => merged.iter().map(|row| project(row, columns)).collect(),
        None => merged,
    })
}

fn field_union(rows: &[Row]) -> Vec<String> {
    let mut fields = BTreeSet::new();
    for row in rows {
        for field in row.keys() {
            fields.insert(field.clone());
        }
    }
    fields.into_iter().collect()
}

fn group_rows(
    rows: &[Row],
    keys: &[String],
    aggregations: &[(String, Agg)],
) -> Result<Vec<Row>, ClientError> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (Vec<Value>, Vec<&Row>)> = HashMap::new();

    if keys.is_empty() {
        // Keyless aggregation produces a single row even over no input.
        order.push(String::new());
        groups.insert(String::new(), (Vec::new(), rows.iter().collect()));
    } else {
        for row in rows {
            let key_values: Vec<Value> = keys
                .iter()
                .map(|key| row.get(key).cloned().unwrap_or(Value::Null))
                .collect();
            let key = serde_json::to_string(&key_values)?;
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_insert((key_values, Vec::new())).1.push(row);
        }
    }

    let mut out = Vec::new();
    for key in order {
        let (key_values, members) = &groups[&key];
        let mut row = Row::new();
        for (key_name, value) in keys.iter().zip(key_values) {
            row.insert(key_name.clone(), value.clone());
        }
        for (output, agg) in aggregations {
            row.insert(output.clone(), aggregate(members, agg, output));
        }
        out.push(row);
    }
    Ok(out)
}

fn aggregate(members: &[&Row], agg: &Agg, output: &str) -> Value {
    if agg.func() == AggFunc::Count {
        return Value::from(members.len() as i64);
    }

    let source = agg.source_column(output);
    let values: Vec<&Value> = members
        .iter()
        .filter_map(|row| row.get(source))
        .filter(|value| !value.is_null())
        .collect();
    if values.is_empty() {
        return Value::Null;
    }

    match agg.func() {
        AggFunc::Count => Value::from(members.len() as i64),
        AggFunc::Sum => {
            if let Some(ints) = all_i64(&values) {
                Value::from(ints.iter().sum::<i64>())
            } else {
                Value::from(values.iter().filter_map(|v| v.as_f64()).sum::<f64>())
            }
        }
        AggFunc::Avg => {
            let floats: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if floats.is_empty() {
                Value::Null
            } else {
                Value::from(floats.iter().sum::<f64>() / floats.len() as f64)
            }
        }
        AggFunc::Min => values
            .iter()
            .copied()
            .min_by(|a, b| cmp_cells(Some(a), Some(b)))
            .cloned()
            .unwrap_or(Value::Null),
        AggFunc::Max => values
            .iter()
            .copied()
            .max_by(|a, b| cmp_cells(Some(a), Some(b)))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

fn all_i64(values: &[&Value]) -> Option<Vec<i64>> {
    values.iter().map(|v| v.as_i64()).collect()
}

/// Total order over cells for sorting and min/max: nulls first, then
/// numbers, strings, everything else.
fn cmp_cells(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            _ => 3,
        }
    }

    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            }
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
