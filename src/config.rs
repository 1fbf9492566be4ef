// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Engine configuration and JSON5 file loading.
//!
//! The values here seed each new link's protocol state; routers may later
//! override the robustness variable and query interval per link through
//! IGMPv3 queries.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default robustness variable (expected packet loss tolerance).
pub const DEFAULT_ROBUSTNESS_VARIABLE: u32 = 2;

/// Default query interval, in seconds.
pub const DEFAULT_QUERY_INTERVAL: u32 = 125;

/// Default maximum query response time, in tenths of a second.
pub const DEFAULT_MAX_RESPONSE_TIME: u32 = 100;

/// Default unsolicited report interval, in tenths of a second.
pub const DEFAULT_UNSOLICITED_REPORT_INTERVAL: u32 = 10;

/// Errors raised while loading or validating a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {1}", .0.display())]
    Io(PathBuf, String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("robustness_variable must be at least 1")]
    InvalidRobustness,

    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),
}

/// IGMP host engine configuration (JSON5 file format).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IgmpConfig {
    /// Number of times state-change reports and leaves are retransmitted.
    pub robustness_variable: u32,

    /// Seconds between the router's general queries, used to size the
    /// compatibility windows.
    pub query_interval: u32,

    /// Maximum report response delay, in tenths of a second.
    pub max_response_time: u32,

    /// Delay between unsolicited report retransmissions, in tenths of a
    /// second.
    pub unsolicited_report_interval: u32,
}

impl Default for IgmpConfig {
    fn default() -> Self {
        Self {
            robustness_variable: DEFAULT_ROBUSTNESS_VARIABLE,
            query_interval: DEFAULT_QUERY_INTERVAL,
            max_response_time: DEFAULT_MAX_RESPONSE_TIME,
            unsolicited_report_interval: DEFAULT_UNSOLICITED_REPORT_INTERVAL,
        }
    }
}

impl IgmpConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            json5::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.robustness_variable == 0 {
            return Err(ConfigError::InvalidRobustness);
        }

        if self.query_interval == 0 {
            return Err(ConfigError::ZeroInterval("query_interval"));
        }

        if self.max_response_time == 0 {
            return Err(ConfigError::ZeroInterval("max_response_time"));
        }

        if self.unsolicited_report_interval == 0 {
            return Err(ConfigError::ZeroInterval("unsolicited_report_interval"));
        }

        Ok(())
    }
}
