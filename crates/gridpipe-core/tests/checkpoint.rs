//! Checkpoint staging against the in-memory backend.

use std::fs;

use gridpipe_client::{GridClient, MemoryClient, SandboxSource};
use gridpipe_core::checkpoint::{self, CHECKPOINT_FILE_VAR};
use gridpipe_core::{CheckpointRequest, PipelineError, TablePath};
use tempfile::TempDir;

fn weights_file(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("weights.bin");
    fs::write(&path, b"\x00\x01\x02").unwrap();
    path
}

#[test]
fn test_repeat_ensure_uploads_once() {
    let dir = TempDir::new().unwrap();
    let source = weights_file(&dir);
    let client = MemoryClient::new();
    let request =
        CheckpointRequest::new("//models", "weights.bin").with_local_source(&source);

    let first = checkpoint::ensure(&client, &request).unwrap();
    let second = checkpoint::ensure(&client, &request).unwrap();

    let target = TablePath::new("//models/weights.bin");
    assert_eq!(client.upload_count(&target), 1);
    assert!(client.exists(&target).unwrap());

    for attachment in [first, second] {
        assert_eq!(attachment.name, "weights.bin");
        assert_eq!(attachment.env_var.as_deref(), Some(CHECKPOINT_FILE_VAR));
        match attachment.source {
            SandboxSource::Staged(path) => assert_eq!(path, target),
            other => panic!("expected staged source, got {other:?}"),
        }
    }
}

#[test]
fn test_existing_artifact_is_reused() {
    let dir = TempDir::new().unwrap();
    let source = weights_file(&dir);
    let client = MemoryClient::new();
    let target = TablePath::new("//models/weights.bin");
    client.upload_file(&source, &target).unwrap();

    // No local source configured; the staged artifact satisfies the request.
    let request = CheckpointRequest::new("//models", "weights.bin");
    let attachment = checkpoint::ensure(&client, &request).unwrap();

    assert_eq!(client.upload_count(&target), 1);
    assert_eq!(attachment.name, "weights.bin");
}

#[test]
fn test_missing_artifact_without_source_is_validation() {
    let client = MemoryClient::new();
    let request = CheckpointRequest::new("//models", "weights.bin");

    let err = checkpoint::ensure(&client, &request).unwrap_err();
    match err {
        PipelineError::Validation(message) => {
            assert!(message.contains("//models/weights.bin"), "{message}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn test_base_directory_is_created() {
    let dir = TempDir::new().unwrap();
    let source = weights_file(&dir);
    let client = MemoryClient::new();
    let request =
        CheckpointRequest::new("//models/llm", "weights.bin").with_local_source(&source);

    checkpoint::ensure(&client, &request).unwrap();

    assert!(client.exists(&TablePath::new("//models/llm")).unwrap());
}
