//! Job descriptors and outcomes shared by the dispatcher and the backends.

use std::collections::BTreeMap;
use std::path::PathBuf;

use gridpipe_ir::TablePath;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Scheduling resources for one operation. Defaults are backend-independent;
/// only their interpretation differs (the local backend forces `job_count`
/// to 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    pub pool: String,
    pub memory_gb: u64,
    pub cpu: u64,
    pub gpu: u64,
    pub job_count: u64,
    pub max_failed_jobs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_tree: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_slots: Option<u64>,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            pool: "default".to_string(),
            memory_gb: 4,
            cpu: 2,
            gpu: 0,
            job_count: 1,
            max_failed_jobs: 0,
            pool_tree: None,
            user_slots: None,
        }
    }
}

impl ResourceSpec {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.pool.trim().is_empty() {
            return Err(ClientError::Configuration(
                "resource pool must not be empty".to_string(),
            ));
        }
        if self.memory_gb == 0 {
            return Err(ClientError::Configuration(
                "memory_gb must be positive".to_string(),
            ));
        }
        if self.cpu == 0 {
            return Err(ClientError::Configuration(
                "cpu must be positive".to_string(),
            ));
        }
        if self.job_count == 0 {
            return Err(ClientError::Configuration(
                "job_count must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Memory limit in bytes, as the cluster API expects it.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_gb << 30
    }
}

#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub image: String,
    pub auth: Option<RegistryAuth>,
}

impl ImageSpec {
    /// Registry credentials are attached only when the image and both
    /// credential halves are present.
    pub fn from_parts(
        image: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Option<ImageSpec> {
        let image = image?;
        let auth = match (username, password) {
            (Some(username), Some(password)) => Some(RegistryAuth { username, password }),
            _ => None,
        };
        Some(ImageSpec { image, auth })
    }
}

/// File materialized into the job sandbox before the command runs.
#[derive(Debug, Clone)]
pub struct SandboxFile {
    /// Name the file takes inside the sandbox.
    pub name: String,
    pub source: SandboxSource,
    /// Environment variable that receives the sandbox-local path.
    pub env_var: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SandboxSource {
    /// Already staged on the backend, addressed by its table path.
    Staged(TablePath),
    /// Plain local file, copied in directly. Local backend only.
    Local(PathBuf),
}

/// Row-parallel job over an input table.
#[derive(Debug, Clone)]
pub struct MapJobSpec {
    pub title: String,
    pub input: TablePath,
    pub output: TablePath,
    /// Sandbox bootstrap command used by the cluster backend.
    pub command: String,
    /// Entry script run directly by the local backend.
    pub entry: PathBuf,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceSpec,
    pub image: Option<ImageSpec>,
    pub files: Vec<SandboxFile>,
}

/// Standalone job with no table I/O.
#[derive(Debug, Clone)]
pub struct VanillaJobSpec {
    pub title: String,
    pub command: String,
    pub entry: PathBuf,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceSpec,
    pub image: Option<ImageSpec>,
    pub files: Vec<SandboxFile>,
}

/// Opaque id of a submitted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Succeeded,
    Failed,
}

/// Terminal state of an operation. Job-level failure is reported here, never
/// as an error.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub state: JobState,
    pub failed_jobs: u64,
    pub message: Option<String>,
}

impl JobOutcome {
    pub fn success() -> Self {
        Self {
            state: JobState::Succeeded,
            failed_jobs: 0,
            message: None,
        }
    }

    pub fn failure(failed_jobs: u64, message: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            failed_jobs,
            message: Some(message.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded
    }
}
