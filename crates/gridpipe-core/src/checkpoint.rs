//! Checkpoint staging for model weights and similar large artifacts.
//!
//! Artifacts live under a backend directory and are attached to job sandboxes
//! by name. Staging is exists-gated: an artifact already present on the
//! backend is never uploaded again, so repeated pipeline runs reuse it.

use std::path::PathBuf;

use gridpipe_client::{GridClient, SandboxFile, SandboxSource};
use gridpipe_ir::TablePath;
use tracing::{debug, info};

use crate::error::PipelineError;

/// Environment variable carrying the sandbox path of the checkpoint copy.
/// Set by the local backend; remote sandboxes address the file as `./<name>`.
pub const CHECKPOINT_FILE_VAR: &str = "CHECKPOINT_FILE";

/// One artifact a job wants in its sandbox.
#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    /// Backend directory the artifact is stored under.
    pub base: TablePath,
    /// Artifact file name, also its sandbox name.
    pub name: String,
    /// Local file to seed the artifact from when it is absent.
    pub local_source: Option<PathBuf>,
}

impl CheckpointRequest {
    pub fn new(base: impl Into<TablePath>, name: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            name: name.into(),
            local_source: None,
        }
    }

    pub fn with_local_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.local_source = Some(source.into());
        self
    }

    pub fn target(&self) -> TablePath {
        self.base.join(&self.name)
    }
}

/// Make the artifact available at `base/name` and return the sandbox
/// attachment for the job spec.
///
/// The base directory is created first. An absent artifact is uploaded from
/// the local source when one is configured; with no source it is a
/// [`PipelineError::Validation`], raised before any dependent job is
/// submitted.
pub fn ensure(
    client: &dyn GridClient,
    request: &CheckpointRequest,
) -> Result<SandboxFile, PipelineError> {
    let target = request.target();
    client.create_path(&request.base)?;

    if client.exists(&target)? {
        debug!(artifact = %target, "checkpoint already staged");
    } else if let Some(source) = &request.local_source {
        info!(artifact = %target, source = %source.display(), "uploading checkpoint");
        client.upload_file(source, &target)?;
    } else {
        return Err(PipelineError::Validation(format!(
            "checkpoint {target} does not exist and no local source is configured"
        )));
    }

    Ok(SandboxFile {
        name: request.name.clone(),
        source: SandboxSource::Staged(target),
        env_var: Some(CHECKPOINT_FILE_VAR.to_string()),
    })
}
