//! Opaque secrets loaded from a dotenv-style file.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::PipelineError;

pub const CLUSTER_ENDPOINT: &str = "CLUSTER_ENDPOINT";
pub const CLUSTER_TOKEN: &str = "CLUSTER_TOKEN";
pub const REGISTRY_USER: &str = "REGISTRY_USER";
pub const REGISTRY_PASSWORD: &str = "REGISTRY_PASSWORD";
// Artifact-store credentials are not interpreted here; they ride along in
// the worker environment like every other secret.
pub const S3_ENDPOINT: &str = "S3_ENDPOINT";
pub const S3_ACCESS_KEY: &str = "S3_ACCESS_KEY";
pub const S3_SECRET_KEY: &str = "S3_SECRET_KEY";

/// Key-value pairs from `secrets.env`. The whole map is injected into worker
/// environments untouched; cluster and registry credentials are read by
/// well-known keys.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: BTreeMap<String, String>,
}

impl Secrets {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let iter = dotenvy::from_path_iter(path).map_err(|e| {
            PipelineError::Configuration(format!(
                "cannot read secrets file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut values = BTreeMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| {
                PipelineError::Configuration(format!(
                    "malformed secrets file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            values.insert(key, value);
        }
        Ok(Self { values })
    }

    /// A missing file is an empty map; local runs need no secrets.
    pub fn load_optional(path: &Path) -> Result<Self, PipelineError> {
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn cluster_endpoint(&self) -> Option<&str> {
        self.get(CLUSTER_ENDPOINT)
    }

    pub fn cluster_token(&self) -> Option<&str> {
        self.get(CLUSTER_TOKEN)
    }

    pub fn registry_user(&self) -> Option<&str> {
        self.get(REGISTRY_USER)
    }

    pub fn registry_password(&self) -> Option<&str> {
        self.get(REGISTRY_PASSWORD)
    }

    /// Full map as injected into worker environments.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        self.values.clone()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
