//! Dispatcher behavior over the in-memory backend.

use std::fs;
use std::path::Path;

use gridpipe_client::{GridClient, MemoryClient, SandboxSource};
use gridpipe_core::archive::{bootstrap_command, deploy_path, OpKind};
use gridpipe_core::dispatch::JOB_CONFIG_PATH_VAR;
use gridpipe_core::{
    CheckpointRequest, Dispatcher, MapRequest, Mode, PipelineConfig, PipelineError, Row,
    Secrets, TablePath, VanillaRequest,
};
use serde_json::json;
use tempfile::TempDir;

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn code_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "runtime/loader.py", "loader");
    write(root, "stages/embed/config.yaml", "threshold: 0.5\n");
    write(root, "stages/embed/src/map.sh", "cat\n");
    write(root, "stages/warm/src/vanilla.sh", "true\n");
    dir
}

fn config_for(root: &Path, mode: Mode) -> PipelineConfig {
    PipelineConfig {
        mode,
        code_root: Some(root.to_path_buf()),
        stages: vec!["embed".to_string(), "warm".to_string()],
        ..PipelineConfig::default()
    }
}

fn secrets() -> Secrets {
    let mut secrets = Secrets::default();
    secrets.insert("API_TOKEN", "s3cr3t");
    secrets
}

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn dispatcher(root: &Path, mode: Mode) -> Dispatcher {
    Dispatcher::new(&config_for(root, mode), &secrets(), root.to_path_buf())
}

fn register_double(client: &MemoryClient, root: &Path) {
    let entry = root.join("stages/embed/src/map.sh");
    client.register_transform(entry.display().to_string(), |row: &Row| {
        let n = row.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
        let mut out = row.clone();
        out.insert("n".to_string(), json!(n * 2));
        Ok(vec![out])
    });
}

#[test]
fn test_local_map_merges_env_and_attaches_stage_config() {
    let tree = code_tree();
    let client = MemoryClient::new();
    register_double(&client, tree.path());
    client
        .write_table(
            &TablePath::new("//data/in"),
            &[row(json!({"n": 1})), row(json!({"n": 2}))],
            false,
        )
        .unwrap();

    let mut dispatcher = dispatcher(tree.path(), Mode::Local);
    let request = MapRequest::new("embed", "//data/in", "//data/out").with_env("EXTRA", "1");
    let result = dispatcher.run_map(&client, &request).unwrap();

    assert!(result.success);
    assert_eq!(result.operation, "embed-map");

    let spec = client.last_map_spec().unwrap();
    assert_eq!(spec.env.get("API_TOKEN").map(String::as_str), Some("s3cr3t"));
    assert_eq!(spec.env.get("EXTRA").map(String::as_str), Some("1"));
    assert!(spec.command.starts_with("bash "));

    let config_file = spec
        .files
        .iter()
        .find(|f| f.env_var.as_deref() == Some(JOB_CONFIG_PATH_VAR))
        .unwrap();
    assert_eq!(config_file.name, "config.yaml");
    match &config_file.source {
        SandboxSource::Local(path) => assert!(path.ends_with("stages/embed/config.yaml")),
        other => panic!("expected local source, got {other:?}"),
    }

    let rows: Vec<Row> = client
        .read_table(&TablePath::new("//data/out"))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(rows, vec![row(json!({"n": 2})), row(json!({"n": 4}))]);
}

#[test]
fn test_missing_entry_script_is_validation() {
    let tree = code_tree();
    let client = MemoryClient::new();
    client
        .write_table(&TablePath::new("//data/in"), &[row(json!({"n": 1}))], false)
        .unwrap();

    let mut dispatcher = dispatcher(tree.path(), Mode::Local);
    let request = MapRequest::new("ghost", "//data/in", "//data/out");
    let err = dispatcher.run_map(&client, &request).unwrap_err();

    match err {
        PipelineError::Validation(message) => {
            assert!(message.contains("entry script"), "{message}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(client.last_map_spec().is_none());
}

#[test]
fn test_missing_input_table_is_validation() {
    let tree = code_tree();
    let client = MemoryClient::new();
    register_double(&client, tree.path());

    let mut dispatcher = dispatcher(tree.path(), Mode::Local);
    let request = MapRequest::new("embed", "//data/absent", "//data/out");
    let err = dispatcher.run_map(&client, &request).unwrap_err();

    match err {
        PipelineError::Validation(message) => {
            assert!(message.contains("input table"), "{message}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(client.last_map_spec().is_none());
}

#[test]
fn test_missing_checkpoint_blocks_submission() {
    let tree = code_tree();
    let client = MemoryClient::new();
    register_double(&client, tree.path());
    client
        .write_table(&TablePath::new("//data/in"), &[row(json!({"n": 1}))], false)
        .unwrap();

    let mut dispatcher = dispatcher(tree.path(), Mode::Local);
    let request = MapRequest::new("embed", "//data/in", "//data/out")
        .with_checkpoint(CheckpointRequest::new("//models", "weights.bin"));
    let err = dispatcher.run_map(&client, &request).unwrap_err();

    assert!(matches!(err, PipelineError::Validation(_)), "{err:?}");
    assert!(client.last_map_spec().is_none());
    assert!(!client.exists(&TablePath::new("//data/out")).unwrap());
}

#[test]
fn test_remote_builds_archive_once() {
    let tree = code_tree();
    let client = MemoryClient::new();
    register_double(&client, tree.path());
    client
        .write_table(&TablePath::new("//data/in"), &[row(json!({"n": 3}))], false)
        .unwrap();
    let vanilla_entry = tree.path().join("stages/warm/src/vanilla.sh");
    client.register_vanilla(vanilla_entry.display().to_string(), Ok(()));

    let mut dispatcher = dispatcher(tree.path(), Mode::Remote);
    let archive_path = deploy_path("//home/gridpipe");

    let request = MapRequest::new("embed", "//data/in", "//data/out");
    let first = dispatcher.run_map(&client, &request).unwrap();
    assert!(first.success);

    let spec = client.last_map_spec().unwrap();
    assert_eq!(spec.command, bootstrap_command("embed", OpKind::Map));
    assert!(spec.command.contains("tar -xzf code.tar.gz"));
    let attached = spec
        .files
        .iter()
        .find(|f| f.name == "code.tar.gz")
        .unwrap();
    match &attached.source {
        SandboxSource::Staged(path) => assert_eq!(path, &archive_path),
        other => panic!("expected staged archive, got {other:?}"),
    }

    // Second and third operations in the same run reuse the uploaded archive.
    let second = dispatcher
        .run_map(
            &client,
            &MapRequest::new("embed", "//data/in", "//data/out2"),
        )
        .unwrap();
    assert!(second.success);
    let warm = dispatcher
        .run_vanilla(&client, &VanillaRequest::new("warm"))
        .unwrap();
    assert!(warm.success);

    assert_eq!(client.upload_count(&archive_path), 1);

    let vanilla_spec = client.last_vanilla_spec().unwrap();
    assert_eq!(vanilla_spec.resources.job_count, 1);
    assert_eq!(
        vanilla_spec.command,
        bootstrap_command("warm", OpKind::Vanilla)
    );
}

#[test]
fn test_remote_rejects_nonconventional_entry() {
    let tree = code_tree();
    write(tree.path(), "stages/embed/src/other.sh", "cat\n");
    let client = MemoryClient::new();
    client
        .write_table(&TablePath::new("//data/in"), &[row(json!({"n": 1}))], false)
        .unwrap();

    let mut dispatcher = dispatcher(tree.path(), Mode::Remote);
    let request = MapRequest::new("embed", "//data/in", "//data/out")
        .with_entry("stages/embed/src/other.sh");
    let err = dispatcher.run_map(&client, &request).unwrap_err();

    assert!(matches!(err, PipelineError::Configuration(_)), "{err:?}");
}

#[test]
fn test_vanilla_failure_is_a_result_not_an_error() {
    let tree = code_tree();
    let client = MemoryClient::new();
    let entry = tree.path().join("stages/warm/src/vanilla.sh");
    client.register_vanilla(entry.display().to_string(), Err("exit status 3".to_string()));

    let mut dispatcher = dispatcher(tree.path(), Mode::Local);
    let result = dispatcher
        .run_vanilla(&client, &VanillaRequest::new("warm"))
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.failed_jobs, 1);
    assert_eq!(result.diagnostic.as_deref(), Some("exit status 3"));

    let err = result.require().unwrap_err();
    match err {
        PipelineError::OperationFailed {
            operation,
            diagnostic,
        } => {
            assert_eq!(operation, "warm-vanilla");
            assert_eq!(diagnostic, "exit status 3");
        }
        other => panic!("expected operation failure, got {other:?}"),
    }
}
