//! Pipeline configuration.
//!
//! Loaded from a YAML file (`pipeline.yaml` by convention); every field has
//! a default so a minimal file only names its stages. Environment variables
//! `GRIDPIPE_MODE` and `GRIDPIPE_LOCAL_ROOT` override the file.

use std::path::{Path, PathBuf};

use gridpipe_client::{ClientOptions, Mode, ResourceSpec};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::secrets::Secrets;

/// Extra directory packaged into the code archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraPath {
    /// Source directory, resolved against the code root.
    pub source: String,
    /// Target directory name in the archive; defaults to the source's last
    /// path component.
    #[serde(default)]
    pub target: Option<String>,
}

/// What ships in the code archive besides the runtime directory and the
/// stages themselves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadManifest {
    /// Module names; dots fold to path separators under the code root.
    pub modules: Vec<String>,
    pub paths: Vec<ExtraPath>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: Mode,
    /// Deployment root on the cluster; the archive lands under
    /// `<deploy_root>/.build/`.
    pub deploy_root: String,
    /// Directory the pipeline code lives in; defaults to the process working
    /// directory.
    pub code_root: Option<PathBuf>,
    /// Storage root for the local backend.
    pub local_root: PathBuf,
    /// Stage names in execution order.
    pub stages: Vec<String>,
    pub resources: ResourceSpec,
    /// Container image for remote workers.
    pub image: Option<String>,
    pub upload: UploadManifest,
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Local,
            deploy_root: "//home/gridpipe".to_string(),
            code_root: None,
            local_root: PathBuf::from(".gridpipe"),
            stages: Vec::new(),
            resources: ResourceSpec::default(),
            image: None,
            upload: UploadManifest::default(),
            poll_interval_ms: 2_000,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file with environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: PipelineConfig = serde_yaml::from_str(&contents)?;

        if let Ok(mode) = std::env::var("GRIDPIPE_MODE") {
            if let Ok(mode) = mode.parse() {
                config.mode = mode;
            }
        }
        if let Ok(root) = std::env::var("GRIDPIPE_LOCAL_ROOT") {
            config.local_root = PathBuf::from(root);
        }

        Ok(config)
    }

    /// Directory stage code and the upload manifest resolve against.
    pub fn resolve_code_root(&self) -> Result<PathBuf, PipelineError> {
        match &self.code_root {
            Some(root) => Ok(root.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    /// Backend settings for `create_client`; cluster credentials come from
    /// the secrets map.
    pub fn client_options(&self, secrets: &Secrets) -> ClientOptions {
        ClientOptions {
            local_root: self.local_root.clone(),
            endpoint: secrets.cluster_endpoint().map(str::to_string),
            token: secrets.cluster_token().map(str::to_string),
            poll_interval_ms: self.poll_interval_ms,
        }
    }
}

/// Where a stage's own configuration lives under the code root.
pub fn stage_config_path(code_root: &Path, stage: &str) -> PathBuf {
    code_root.join("stages").join(stage).join("config.yaml")
}

/// Parse a stage's config; a stage without one gets a null value.
pub fn load_stage_config(
    code_root: &Path,
    stage: &str,
) -> Result<serde_yaml::Value, PipelineError> {
    let path = stage_config_path(code_root, stage);
    if !path.is_file() {
        return Ok(serde_yaml::Value::Null);
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.mode, Mode::Local);
        assert_eq!(config.deploy_root, "//home/gridpipe");
        assert_eq!(config.local_root, PathBuf::from(".gridpipe"));
        assert!(config.stages.is_empty());
        assert_eq!(config.resources.memory_gb, 4);
        assert_eq!(config.poll_interval_ms, 2_000);
    }

    #[test]
    fn test_minimal_yaml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pipeline.yaml");
        std::fs::write(
            &file,
            "stages:\n  - extract\n  - transform\nresources:\n  gpu: 1\n",
        )
        .unwrap();

        let config = PipelineConfig::load(&file).unwrap();
        assert_eq!(config.stages, vec!["extract", "transform"]);
        assert_eq!(config.resources.gpu, 1);
        assert_eq!(config.resources.cpu, 2);
        assert_eq!(config.mode, Mode::Local);
    }

    #[test]
    fn test_env_var_override() {
        std::env::set_var("GRIDPIPE_MODE", "remote");
        std::env::set_var("GRIDPIPE_LOCAL_ROOT", "/tmp/elsewhere");

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pipeline.yaml");
        std::fs::write(&file, "mode: local\n").unwrap();

        let config = PipelineConfig::load(&file).unwrap();
        assert_eq!(config.mode, Mode::Remote);
        assert_eq!(config.local_root, PathBuf::from("/tmp/elsewhere"));

        std::env::remove_var("GRIDPIPE_MODE");
        std::env::remove_var("GRIDPIPE_LOCAL_ROOT");
    }

    #[test]
    fn test_client_options_pull_credentials_from_secrets() {
        let mut secrets = Secrets::default();
        secrets.insert("CLUSTER_ENDPOINT", "https://grid.example.com");
        secrets.insert("CLUSTER_TOKEN", "tok");

        let config = PipelineConfig::default();
        let options = config.client_options(&secrets);
        assert_eq!(options.endpoint.as_deref(), Some("https://grid.example.com"));
        assert_eq!(options.token.as_deref(), Some("tok"));
        assert_eq!(options.local_root, config.local_root);
    }

    #[test]
    fn test_stage_config_auto_load() {
        let dir = tempfile::tempdir().unwrap();
        let stage_dir = dir.path().join("stages/etl");
        std::fs::create_dir_all(&stage_dir).unwrap();
        std::fs::write(stage_dir.join("config.yaml"), "batch_size: 64\n").unwrap();

        let value = load_stage_config(dir.path(), "etl").unwrap();
        assert_eq!(value["batch_size"], serde_yaml::Value::from(64));

        let absent = load_stage_config(dir.path(), "other").unwrap();
        assert!(absent.is_null());
    }
}
