// Copyright 2025 PromptOps Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// PromptOps server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub tests: TestRunConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpServerConfig {
    /// HTTP API listen address (e.g., "127.0.0.1:47300")
    #[serde(default = "default_http_addr")]
    pub listen_addr: String,

    /// Enable CORS
    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,
}

/// Knobs for the test-tracking registry. The defaults are the deployed
/// constants; override per deployment via TOML or environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestRunConfig {
    /// Runtime ceiling in seconds; a test running longer is force-failed.
    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: u64,

    /// Retention window in seconds; older records are swept regardless of
    /// status.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Period of the cleanup sweep loop, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Capacity of the status broadcast channel.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

// Default values
fn default_http_addr() -> String {
    "127.0.0.1:47300".to_string()
}

fn default_enable_cors() -> bool {
    true
}

fn default_max_runtime_secs() -> u64 {
    30 * 60
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

fn default_broadcast_capacity() -> usize {
    256
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_addr(),
            enable_cors: default_enable_cors(),
        }
    }
}

impl Default for TestRunConfig {
    fn default() -> Self {
        Self {
            max_runtime_secs: default_max_runtime_secs(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: HttpServerConfig::default(),
            tests: TestRunConfig::default(),
        }
    }
}

impl TestRunConfig {
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - PROMPTOPS_HTTP_ADDR: HTTP listen address (default: 127.0.0.1:47300)
    /// - PROMPTOPS_ENABLE_CORS: Enable CORS (default: true)
    /// - PROMPTOPS_MAX_RUNTIME_SECS: Test runtime ceiling (default: 1800)
    /// - PROMPTOPS_RETENTION_SECS: Record retention window (default: 86400)
    /// - PROMPTOPS_SWEEP_INTERVAL_SECS: Cleanup period (default: 3600)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PROMPTOPS_HTTP_ADDR") {
            config.server.listen_addr = addr;
        }

        if let Ok(cors) = std::env::var("PROMPTOPS_ENABLE_CORS") {
            config.server.enable_cors = cors.parse().unwrap_or(true);
        }

        if let Ok(secs) = std::env::var("PROMPTOPS_MAX_RUNTIME_SECS") {
            if let Ok(val) = secs.parse() {
                config.tests.max_runtime_secs = val;
            }
        }

        if let Ok(secs) = std::env::var("PROMPTOPS_RETENTION_SECS") {
            if let Ok(val) = secs.parse() {
                config.tests.retention_secs = val;
            }
        }

        if let Ok(secs) = std::env::var("PROMPTOPS_SWEEP_INTERVAL_SECS") {
            if let Ok(val) = secs.parse() {
                config.tests.sweep_interval_secs = val;
            }
        }

        config
    }

    /// Load configuration with priority: file > env > defaults.
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        config = Self::merge_with_env(config);
        Ok(config)
    }

    /// Merge config with environment variables (env takes priority).
    fn merge_with_env(mut config: Self) -> Self {
        let env_config = Self::from_env();

        if std::env::var("PROMPTOPS_HTTP_ADDR").is_ok() {
            config.server.listen_addr = env_config.server.listen_addr;
        }
        if std::env::var("PROMPTOPS_ENABLE_CORS").is_ok() {
            config.server.enable_cors = env_config.server.enable_cors;
        }
        if std::env::var("PROMPTOPS_MAX_RUNTIME_SECS").is_ok() {
            config.tests.max_runtime_secs = env_config.tests.max_runtime_secs;
        }
        if std::env::var("PROMPTOPS_RETENTION_SECS").is_ok() {
            config.tests.retention_secs = env_config.tests.retention_secs;
        }
        if std::env::var("PROMPTOPS_SWEEP_INTERVAL_SECS").is_ok() {
            config.tests.sweep_interval_secs = env_config.tests.sweep_interval_secs;
        }

        config
    }

    /// Parse listen address as SocketAddr.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.tests.max_runtime_secs == 0 {
            anyhow::bail!("tests.max_runtime_secs must be greater than zero");
        }
        if self.tests.retention_secs < self.tests.max_runtime_secs {
            anyhow::bail!("tests.retention_secs must be at least tests.max_runtime_secs");
        }
        if self.tests.broadcast_capacity == 0 {
            anyhow::bail!("tests.broadcast_capacity must be greater than zero");
        }

        Ok(())
    }
}
