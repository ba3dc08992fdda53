//! Backend selection by execution mode.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::GridClient;
use crate::error::ClientError;
use crate::local::LocalClient;
use crate::remote::HttpRemoteClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Local,
    Remote,
}

impl FromStr for Mode {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Mode::Local),
            "remote" => Ok(Mode::Remote),
            other => Err(ClientError::Configuration(format!(
                "unknown execution mode: {} (expected local or remote)",
                other
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Local => write!(f, "local"),
            Mode::Remote => write!(f, "remote"),
        }
    }
}

/// Connection settings for either backend. Local mode only reads
/// `local_root`; remote mode requires `endpoint` and `token`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub local_root: PathBuf,
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub poll_interval_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from(".gridpipe"),
            endpoint: None,
            token: None,
            poll_interval_ms: 2_000,
        }
    }
}

pub fn create_client(
    mode: Mode,
    options: &ClientOptions,
) -> Result<Box<dyn GridClient>, ClientError> {
    match mode {
        Mode::Local => Ok(Box::new(LocalClient::new(&options.local_root)?)),
        Mode::Remote => {
            let endpoint = options.endpoint.as_deref().ok_or_else(|| {
                ClientError::Configuration("remote mode requires a cluster endpoint".to_string())
            })?;
            let token = options.token.as_deref().ok_or_else(|| {
                ClientError::Configuration("remote mode requires a cluster token".to_string())
            })?;
            let client = HttpRemoteClient::connect(
                endpoint,
                token,
                Duration::from_millis(options.poll_interval_ms),
            )?;
            Ok(Box::new(client))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parses_case_insensitively() {
        assert_eq!("local".parse::<Mode>().unwrap(), Mode::Local);
        assert_eq!("REMOTE".parse::<Mode>().unwrap(), Mode::Remote);
        assert!("cloud".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_round_trips_through_serde() {
        assert_eq!(serde_json::to_string(&Mode::Local).unwrap(), "\"local\"");
        assert_eq!(
            serde_json::from_str::<Mode>("\"remote\"").unwrap(),
            Mode::Remote
        );
    }

    #[test]
    fn test_remote_mode_requires_endpoint_and_token() {
        let options = ClientOptions::default();
        let err = create_client(Mode::Remote, &options).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
    }

    #[test]
    fn test_local_mode_creates_storage_tree() {
        let dir = tempfile::tempdir().unwrap();
        let options = ClientOptions {
            local_root: dir.path().join("run"),
            ..Default::default()
        };
        let client = create_client(Mode::Local, &options).unwrap();
        assert!(dir.path().join("run/store").is_dir());
        drop(client);
    }
}
