//! End-to-end tests for the local backend.
//!
//! Tables live as JSON-lines files under a temporary root, structured
//! queries run through the embedded engine, and map operations spawn real
//! bash workers wired to the table files through their standard streams.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use gridpipe_client::{
    GridClient, LocalClient, MapJobSpec, ResourceSpec, Row, SandboxFile, SandboxSource, TablePath,
    VanillaJobSpec,
};
use gridpipe_ir::{Agg, Expr, JoinType, QueryOp};
use serde_json::{json, Value};

fn client() -> (tempfile::TempDir, LocalClient) {
    let dir = tempfile::tempdir().unwrap();
    let client = LocalClient::new(dir.path()).unwrap();
    (dir, client)
}

fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn read(client: &LocalClient, path: &str) -> Vec<Row> {
    client
        .read_table(&TablePath::new(path))
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
}

/// Read and sort by serialized form; queries without an explicit sort give
/// no row-order guarantee.
fn read_sorted(client: &LocalClient, path: &str) -> Vec<Row> {
    let mut rows = read(client, path);
    rows.sort_by_key(|r| serde_json::to_string(r).unwrap());
    rows
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

fn map_spec(entry: PathBuf) -> MapJobSpec {
    MapJobSpec {
        title: "stage".to_string(),
        input: TablePath::new("//pipe/in"),
        output: TablePath::new("//pipe/out"),
        command: String::new(),
        entry,
        env: BTreeMap::new(),
        resources: ResourceSpec::default(),
        image: None,
        files: Vec::new(),
    }
}

#[test]
fn test_write_read_round_trip_preserves_order() {
    let (_dir, client) = client();
    let path = TablePath::new("//pipe/users");
    let rows = vec![
        row(&[("id", json!(3)), ("name", json!("c"))]),
        row(&[("id", json!(1)), ("name", json!("a"))]),
        row(&[("id", json!(2)), ("name", json!("b"))]),
    ];

    client.write_table(&path, &rows, false).unwrap();
    assert_eq!(read(&client, "//pipe/users"), rows);
    assert_eq!(client.row_count(&path).unwrap(), 3);

    client
        .write_table(&path, &[row(&[("id", json!(4)), ("name", json!("d"))])], true)
        .unwrap();
    assert_eq!(client.row_count(&path).unwrap(), 4);
}

#[test]
fn test_left_join_fills_unmatched_rows_with_nulls() {
    let (_dir, client) = client();
    client
        .write_table(
            &TablePath::new("//pipe/l"),
            &[
                row(&[("id", json!(1)), ("v", json!("a"))]),
                row(&[("id", json!(2)), ("v", json!("b"))]),
            ],
            false,
        )
        .unwrap();
    client
        .write_table(
            &TablePath::new("//pipe/r"),
            &[row(&[("id", json!(1)), ("w", json!("x"))])],
            false,
        )
        .unwrap();

    let op = QueryOp::join("//pipe/l", "//pipe/r", "//pipe/o", "id", JoinType::Left, None);
    assert!(client.query(&op, false).unwrap().is_none());

    assert_eq!(
        read_sorted(&client, "//pipe/o"),
        vec![
            row(&[("id", json!(1)), ("v", json!("a")), ("w", json!("x"))]),
            row(&[("id", json!(2)), ("v", json!("b")), ("w", Value::Null)]),
        ]
    );
}

#[test]
fn test_group_by_count_and_sum_stay_numeric() {
    let (_dir, client) = client();
    client
        .write_table(
            &TablePath::new("//pipe/t"),
            &[
                row(&[("k", json!("A")), ("n", json!(1))]),
                row(&[("k", json!("A")), ("n", json!(2))]),
                row(&[("k", json!("B")), ("n", json!(5))]),
                row(&[("k", json!("B")), ("n", json!(6))]),
            ],
            false,
        )
        .unwrap();

    let op = QueryOp::group_by(
        "//pipe/t",
        "//pipe/o",
        vec!["k".to_string()],
        vec![
            ("c".to_string(), Agg::count()),
            ("s".to_string(), Agg::sum("n")),
        ],
    );
    client.query(&op, false).unwrap();

    assert_eq!(
        read_sorted(&client, "//pipe/o"),
        vec![
            row(&[("k", json!("A")), ("c", json!(2)), ("s", json!(3))]),
            row(&[("k", json!("B")), ("c", json!(2)), ("s", json!(11))]),
        ]
    );
}

#[test]
fn test_filter_pushes_predicate_through_engine() {
    let (_dir, client) = client();
    client
        .write_table(
            &TablePath::new("//pipe/t"),
            &[
                row(&[("n", json!(5))]),
                row(&[("n", json!(15))]),
                row(&[("n", Value::Null)]),
            ],
            false,
        )
        .unwrap();

    let op = QueryOp::filter(
        "//pipe/t",
        "//pipe/o",
        Expr::col("n").ge(Expr::lit(10)),
        vec!["n".to_string()],
    );
    client.query(&op, false).unwrap();

    assert_eq!(read(&client, "//pipe/o"), vec![row(&[("n", json!(15))])]);
}

#[test]
fn test_dry_run_returns_plan_without_executing() {
    let (_dir, client) = client();
    client
        .write_table(&TablePath::new("//pipe/t"), &[row(&[("n", json!(1))])], false)
        .unwrap();

    let op = QueryOp::select("//pipe/t", "//pipe/o", vec!["n".to_string()]);
    let text = client.query(&op, true).unwrap();

    assert!(text.is_some_and(|t| t.starts_with("SELECT")));
    assert!(!client.exists(&TablePath::new("//pipe/o")).unwrap());

    client.query(&op, false).unwrap();
    assert_eq!(read(&client, "//pipe/o"), vec![row(&[("n", json!(1))])]);
}

#[test]
fn test_map_job_streams_table_through_worker() {
    let (dir, client) = client();
    let rows = vec![
        row(&[("id", json!(1))]),
        row(&[("id", json!(2))]),
        row(&[("id", json!(3))]),
    ];
    client
        .write_table(&TablePath::new("//pipe/in"), &rows, false)
        .unwrap();
    let entry = script(dir.path(), "passthrough.sh", "cat\n");

    let handle = client.submit_map(&map_spec(entry)).unwrap();
    let outcome = client.wait_operation(&handle).unwrap();

    assert!(outcome.succeeded(), "outcome: {:?}", outcome);
    assert_eq!(read(&client, "//pipe/out"), rows);
    assert!(dir.path().join("logs/out.log").is_file());
}

#[test]
fn test_map_worker_env_is_passed_through() {
    let (dir, client) = client();
    client
        .write_table(&TablePath::new("//pipe/in"), &[row(&[("id", json!(1))])], false)
        .unwrap();
    let entry = script(
        dir.path(),
        "env.sh",
        r#"printf '{"g":"%s"}\n' "$GREETING"
"#,
    );

    let mut spec = map_spec(entry);
    spec.env.insert("GREETING".to_string(), "hi".to_string());

    let handle = client.submit_map(&spec).unwrap();
    assert!(client.wait_operation(&handle).unwrap().succeeded());
    assert_eq!(read(&client, "//pipe/out"), vec![row(&[("g", json!("hi"))])]);
}

#[test]
fn test_failed_worker_reports_outcome_and_keeps_output_unwritten() {
    let (dir, client) = client();
    client
        .write_table(&TablePath::new("//pipe/in"), &[row(&[("id", json!(1))])], false)
        .unwrap();
    let entry = script(dir.path(), "fail.sh", "echo boom >&2\nexit 3\n");

    let handle = client.submit_map(&map_spec(entry)).unwrap();
    let outcome = client.wait_operation(&handle).unwrap();

    assert!(!outcome.succeeded());
    assert_eq!(outcome.failed_jobs, 1);
    let message = outcome.message.unwrap();
    assert!(message.contains("exit status 3"), "message: {}", message);
    assert!(!client.exists(&TablePath::new("//pipe/out")).unwrap());

    let log = fs::read_to_string(dir.path().join("logs/out.log")).unwrap();
    assert!(log.contains("boom"));
}

#[test]
fn test_vanilla_job_logs_stdout() {
    let (dir, client) = client();
    let entry = script(dir.path(), "warmup.sh", "echo ready\n");

    let spec = VanillaJobSpec {
        title: "warmup".to_string(),
        command: String::new(),
        entry,
        env: BTreeMap::new(),
        resources: ResourceSpec::default(),
        image: None,
        files: Vec::new(),
    };
    let handle = client.submit_vanilla(&spec).unwrap();
    assert!(client.wait_operation(&handle).unwrap().succeeded());

    let log = fs::read_to_string(dir.path().join("logs/warmup.log")).unwrap();
    assert!(log.contains("ready"));
}

#[test]
fn test_staged_file_lands_in_sandbox_with_env_var() {
    let (dir, client) = client();

    let weights = dir.path().join("weights.jsonl");
    fs::write(&weights, "{\"w\":1}\n").unwrap();
    let staged = TablePath::new("//deploy/weights.jsonl");
    client.upload_file(&weights, &staged).unwrap();

    client
        .write_table(
            &TablePath::new("//pipe/in"),
            &[row(&[("id", json!(1))]), row(&[("id", json!(2))])],
            false,
        )
        .unwrap();
    let entry = script(dir.path(), "with_weights.sh", "cat \"$WEIGHTS\"\ncat\n");

    let mut spec = map_spec(entry);
    spec.files.push(SandboxFile {
        name: "weights.jsonl".to_string(),
        source: SandboxSource::Staged(staged),
        env_var: Some("WEIGHTS".to_string()),
    });

    let handle = client.submit_map(&spec).unwrap();
    assert!(client.wait_operation(&handle).unwrap().succeeded());

    let out = read(&client, "//pipe/out");
    assert_eq!(out.len(), 3);
    assert_eq!(out[0], row(&[("w", json!(1))]));
}
