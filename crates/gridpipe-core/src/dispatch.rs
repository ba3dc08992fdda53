//! Operation dispatch: one state machine per submitted operation.
//!
//! Every operation goes PREPARE (validate the request, stage the archive and
//! checkpoint) → SUBMIT (build the backend job spec) → WAIT (block until
//! terminal). Job-level failure is a [`ExecutionResult`] with `success ==
//! false`, never an `Err`; errors are reserved for defects caught before
//! submission and for backend faults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use gridpipe_client::{
    GridClient, ImageSpec, JobOutcome, MapJobSpec, Mode, ResourceSpec, SandboxFile, SandboxSource,
    VanillaJobSpec,
};
use gridpipe_ir::TablePath;
use tracing::{info, info_span, warn};

use crate::archive::{self, BuiltArchive, CodePackager, OpKind, ARCHIVE_NAME};
use crate::checkpoint::{self, CheckpointRequest};
use crate::config::{self, PipelineConfig, UploadManifest};
use crate::error::PipelineError;
use crate::secrets::Secrets;

/// Environment variable pointing workers at their stage configuration.
pub const JOB_CONFIG_PATH_VAR: &str = "JOB_CONFIG_PATH";

/// Row-parallel operation request. The entry script defaults to the stage's
/// conventional `stages/<name>/src/map.sh`.
#[derive(Debug, Clone)]
pub struct MapRequest {
    pub stage: String,
    /// Entry script, relative to the code root.
    pub entry: PathBuf,
    pub input: TablePath,
    pub output: TablePath,
    /// Overrides the pipeline-wide resource defaults when set.
    pub resources: Option<ResourceSpec>,
    /// Extra worker environment on top of the secrets map.
    pub env: BTreeMap<String, String>,
    pub checkpoint: Option<CheckpointRequest>,
}

impl MapRequest {
    pub fn new(
        stage: impl Into<String>,
        input: impl Into<TablePath>,
        output: impl Into<TablePath>,
    ) -> Self {
        let stage = stage.into();
        let entry = archive::stage_entry(&stage, OpKind::Map);
        Self {
            stage,
            entry,
            input: input.into(),
            output: output.into(),
            resources: None,
            env: BTreeMap::new(),
            checkpoint: None,
        }
    }

    pub fn with_entry(mut self, entry: impl Into<PathBuf>) -> Self {
        self.entry = entry.into();
        self
    }

    pub fn with_resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointRequest) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }
}

/// Single-worker operation request with no table I/O.
#[derive(Debug, Clone)]
pub struct VanillaRequest {
    pub stage: String,
    pub entry: PathBuf,
    pub resources: Option<ResourceSpec>,
    pub env: BTreeMap<String, String>,
    pub checkpoint: Option<CheckpointRequest>,
}

impl VanillaRequest {
    pub fn new(stage: impl Into<String>) -> Self {
        let stage = stage.into();
        let entry = archive::stage_entry(&stage, OpKind::Vanilla);
        Self {
            stage,
            entry,
            resources: None,
            env: BTreeMap::new(),
            checkpoint: None,
        }
    }

    pub fn with_entry(mut self, entry: impl Into<PathBuf>) -> Self {
        self.entry = entry.into();
        self
    }

    pub fn with_resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointRequest) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }
}

/// Terminal observation of one operation. Stages escalate failures with
/// [`ExecutionResult::require`]; inspecting the fields instead is how a stage
/// tolerates a failed operation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Operation title, `<stage>-<kind>`.
    pub operation: String,
    pub success: bool,
    pub failed_jobs: u64,
    pub diagnostic: Option<String>,
}

impl ExecutionResult {
    pub fn require(self) -> Result<(), PipelineError> {
        if self.success {
            Ok(())
        } else {
            Err(PipelineError::OperationFailed {
                operation: self.operation,
                diagnostic: self
                    .diagnostic
                    .unwrap_or_else(|| "no diagnostic reported".to_string()),
            })
        }
    }
}

/// Runs operations against one backend for the duration of a pipeline run.
///
/// Owns the lazily-built archive: the first remote submission builds and
/// uploads it, every later one reuses it. A fresh run gets a fresh
/// dispatcher, so stale code never leaks across runs.
pub struct Dispatcher {
    mode: Mode,
    code_root: PathBuf,
    deploy_root: String,
    default_resources: ResourceSpec,
    env: BTreeMap<String, String>,
    image: Option<ImageSpec>,
    manifest: UploadManifest,
    stages: Vec<String>,
    archive: Option<BuiltArchive>,
}

impl Dispatcher {
    pub fn new(config: &PipelineConfig, secrets: &Secrets, code_root: PathBuf) -> Self {
        Self {
            mode: config.mode,
            code_root,
            deploy_root: config.deploy_root.clone(),
            default_resources: config.resources.clone(),
            env: secrets.to_env(),
            image: ImageSpec::from_parts(
                config.image.clone(),
                secrets.registry_user().map(str::to_string),
                secrets.registry_password().map(str::to_string),
            ),
            manifest: config.upload.clone(),
            stages: config.stages.clone(),
            archive: None,
        }
    }

    /// The archive built for this run, if any operation has needed it yet.
    pub fn archive(&self) -> Option<&BuiltArchive> {
        self.archive.as_ref()
    }

    pub fn run_map(
        &mut self,
        client: &dyn GridClient,
        request: &MapRequest,
    ) -> Result<ExecutionResult, PipelineError> {
        let title = format!("{}-map", request.stage);
        let span = info_span!("map_operation", stage = %request.stage);
        let _guard = span.enter();

        let resources = self.resolve_resources(request.resources.as_ref())?;
        let entry = self.check_entry(&request.entry)?;
        if !client.exists(&request.input)? {
            return Err(PipelineError::Validation(format!(
                "input table {} does not exist",
                request.input
            )));
        }
        let mut files = Vec::new();
        let command =
            self.prepare_backend(client, &request.stage, OpKind::Map, &request.entry, &entry, &mut files)?;
        if let Some(checkpoint) = &request.checkpoint {
            files.push(checkpoint::ensure(client, checkpoint)?);
        }

        let spec = MapJobSpec {
            title: title.clone(),
            input: request.input.clone(),
            output: request.output.clone(),
            command,
            entry,
            env: self.merge_env(&request.env),
            resources,
            image: self.image.clone(),
            files,
        };
        let handle = client.submit_map(&spec)?;
        info!(operation = %handle.id, title = %title, input = %request.input, output = %request.output, "map operation submitted");

        let outcome = client.wait_operation(&handle)?;
        Ok(finish(title, outcome))
    }

    pub fn run_vanilla(
        &mut self,
        client: &dyn GridClient,
        request: &VanillaRequest,
    ) -> Result<ExecutionResult, PipelineError> {
        let title = format!("{}-vanilla", request.stage);
        let span = info_span!("vanilla_operation", stage = %request.stage);
        let _guard = span.enter();

        let mut resources = self.resolve_resources(request.resources.as_ref())?;
        // A vanilla operation is exactly one worker.
        resources.job_count = 1;
        let entry = self.check_entry(&request.entry)?;
        let mut files = Vec::new();
        let command = self.prepare_backend(
            client,
            &request.stage,
            OpKind::Vanilla,
            &request.entry,
            &entry,
            &mut files,
        )?;
        if let Some(checkpoint) = &request.checkpoint {
            files.push(checkpoint::ensure(client, checkpoint)?);
        }

        let spec = VanillaJobSpec {
            title: title.clone(),
            command,
            entry,
            env: self.merge_env(&request.env),
            resources,
            image: self.image.clone(),
            files,
        };
        let handle = client.submit_vanilla(&spec)?;
        info!(operation = %handle.id, title = %title, "vanilla operation submitted");

        let outcome = client.wait_operation(&handle)?;
        Ok(finish(title, outcome))
    }

    fn resolve_resources(
        &self,
        requested: Option<&ResourceSpec>,
    ) -> Result<ResourceSpec, PipelineError> {
        let resources = requested
            .cloned()
            .unwrap_or_else(|| self.default_resources.clone());
        resources.validate()?;
        Ok(resources)
    }

    /// The entry script must exist under the code root before anything is
    /// submitted, on either backend.
    fn check_entry(&self, entry: &Path) -> Result<PathBuf, PipelineError> {
        let resolved = self.code_root.join(entry);
        if !resolved.is_file() {
            return Err(PipelineError::Validation(format!(
                "entry script {} does not exist",
                resolved.display()
            )));
        }
        Ok(resolved)
    }

    /// Backend-specific half of PREPARE: the sandbox command plus the files
    /// staged into it.
    fn prepare_backend(
        &mut self,
        client: &dyn GridClient,
        stage: &str,
        kind: OpKind,
        entry: &Path,
        resolved_entry: &Path,
        files: &mut Vec<SandboxFile>,
    ) -> Result<String, PipelineError> {
        match self.mode {
            Mode::Remote => {
                let conventional = archive::stage_entry(stage, kind);
                if entry != conventional {
                    return Err(PipelineError::Configuration(format!(
                        "remote {kind} operations run the packaged entry {}, not {}",
                        conventional.display(),
                        entry.display()
                    )));
                }
                self.ensure_archive(client)?;
                let packaged = match &self.archive {
                    Some(archive) => archive.stages.iter().any(|s| s == stage),
                    None => false,
                };
                if !packaged {
                    return Err(PipelineError::Configuration(format!(
                        "stage '{stage}' has no code directory to package"
                    )));
                }
                files.push(SandboxFile {
                    name: ARCHIVE_NAME.to_string(),
                    source: SandboxSource::Staged(archive::deploy_path(&self.deploy_root)),
                    env_var: None,
                });
                Ok(archive::bootstrap_command(stage, kind))
            }
            Mode::Local => {
                // No archive locally; the worker gets the stage config as a
                // sandbox file and runs the entry straight from the tree.
                let config_path = config::stage_config_path(&self.code_root, stage);
                if config_path.is_file() {
                    files.push(SandboxFile {
                        name: "config.yaml".to_string(),
                        source: SandboxSource::Local(config_path),
                        env_var: Some(JOB_CONFIG_PATH_VAR.to_string()),
                    });
                }
                Ok(format!("bash {}", resolved_entry.display()))
            }
        }
    }

    /// Build and upload the code archive the first time a remote operation
    /// needs it.
    fn ensure_archive(&mut self, client: &dyn GridClient) -> Result<(), PipelineError> {
        if self.archive.is_some() {
            return Ok(());
        }
        let built = CodePackager::new(&self.code_root, &self.manifest, &self.stages).build()?;
        let target = archive::deploy_path(&self.deploy_root);
        let staging = std::env::temp_dir().join(format!("gridpipe-{}.tar.gz", &built.sha256[..16]));
        fs::write(&staging, &built.bytes)?;
        let uploaded = client.upload_file(&staging, &target);
        let _ = fs::remove_file(&staging);
        uploaded?;
        info!(
            archive = %target,
            sha256 = %built.sha256,
            files = built.entries.len(),
            "code archive uploaded"
        );
        self.archive = Some(built);
        Ok(())
    }

    fn merge_env(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

fn finish(operation: String, outcome: JobOutcome) -> ExecutionResult {
    if outcome.succeeded() {
        info!(operation = %operation, "operation succeeded");
    } else {
        warn!(
            operation = %operation,
            failed_jobs = outcome.failed_jobs,
            diagnostic = outcome.message.as_deref().unwrap_or(""),
            "operation failed"
        );
    }
    ExecutionResult {
        operation,
        success: outcome.succeeded(),
        failed_jobs: outcome.failed_jobs,
        diagnostic: outcome.message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_request_defaults_to_conventional_entry() {
        let request = MapRequest::new("embed", "//data/in", "//data/out");
        assert_eq!(request.entry, PathBuf::from("stages/embed/src/map.sh"));
        assert!(request.resources.is_none());
        assert!(request.env.is_empty());

        let request = VanillaRequest::new("warmup");
        assert_eq!(request.entry, PathBuf::from("stages/warmup/src/vanilla.sh"));
    }

    #[test]
    fn test_require_maps_failure_to_operation_failed() {
        let ok = ExecutionResult {
            operation: "embed-map".to_string(),
            success: true,
            failed_jobs: 0,
            diagnostic: None,
        };
        assert!(ok.require().is_ok());

        let failed = ExecutionResult {
            operation: "embed-map".to_string(),
            success: false,
            failed_jobs: 2,
            diagnostic: Some("2 of 4 workers failed".to_string()),
        };
        match failed.require() {
            Err(PipelineError::OperationFailed {
                operation,
                diagnostic,
            }) => {
                assert_eq!(operation, "embed-map");
                assert!(diagnostic.contains("workers failed"));
            }
            other => panic!("expected operation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_require_fills_missing_diagnostic() {
        let failed = ExecutionResult {
            operation: "score-vanilla".to_string(),
            success: false,
            failed_jobs: 1,
            diagnostic: None,
        };
        let err = failed.require().unwrap_err();
        assert!(err.to_string().contains("no diagnostic reported"));
    }
}
