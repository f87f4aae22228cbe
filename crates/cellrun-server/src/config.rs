//! Environment-selected configuration profile.
//!
//! Modelled on `core/config/__init__.py` + `core/config/base.py`: a single
//! environment variable selects a profile, and a handful of other variables
//! fill in the deployment-specific details.

use std::path::PathBuf;

/// Deployment profile, selected by `CELLRUN_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Testing,
    Development,
    Production,
}

impl Profile {
    fn from_env_value(value: &str) -> Self {
        match value {
            "production" => Profile::Production,
            "testing" => Profile::Testing,
            _ => Profile::Development,
        }
    }
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub profile: Profile,
    pub host: String,
    pub port: u16,
    pub file_root_dir: PathBuf,
    /// Carried for parity with the original's recognised options; the
    /// endpoint-configuration subsystem itself is not implemented by this
    /// crate, so nothing here reads this path.
    pub endpoint_config_root_dir: PathBuf,
    /// Upstream socket-transport URL for `ForwardingSocketSink`. `None`
    /// selects the in-memory `TestSocketSink`.
    pub socket_uri: Option<String>,
    /// Interpreter binary for the interactive console runner.
    pub python: String,
}

impl Config {
    /// Reads configuration from the environment, applying profile-specific
    /// defaults where a variable is unset.
    pub fn from_env() -> Self {
        let profile = std::env::var("CELLRUN_ENV")
            .map(|v| Profile::from_env_value(&v))
            .unwrap_or(Profile::Development);

        let host = std::env::var("CELLRUN_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("CELLRUN_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(match profile {
                Profile::Testing => 0,
                _ => 8000,
            });

        let file_root_dir = std::env::var("CELLRUN_FILE_ROOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("cellrun-files"));

        let endpoint_config_root_dir = std::env::var("CELLRUN_ENDPOINT_CONFIG_ROOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("cellrun-endpoint-configs"));

        let socket_uri = std::env::var("CELLRUN_SOCKET_URI").ok().filter(|v| !v.is_empty());

        let python = std::env::var("CELLRUN_PYTHON").unwrap_or_else(|_| "python3".to_string());

        Self {
            profile,
            host,
            port,
            file_root_dir,
            endpoint_config_root_dir,
            socket_uri,
            python,
        }
    }

    /// A configuration suitable for tests: an in-memory sink, a throwaway
    /// file root, ephemeral port.
    pub fn for_testing(file_root_dir: PathBuf) -> Self {
        Self {
            profile: Profile::Testing,
            host: "127.0.0.1".to_string(),
            port: 0,
            file_root_dir,
            endpoint_config_root_dir: std::env::temp_dir().join("cellrun-endpoint-configs-test"),
            socket_uri: None,
            python: "python3".to_string(),
        }
    }
}
