//! Parsing the attach request wire shapes.
//!
//! These arrive from outside the workspace (launchers, IDE adapters), so
//! field names follow the external camelCase convention and values are
//! validated into `tether-core` types before use.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use tether_core::{Address, AttachConfig, AttachMode, DomainResult, ProcessId};

/// Raw attach configuration:
/// `{mode, host, port, accessToken, logTo}`.
///
/// `mode` is kept as a string here; an unknown value is only rejected when
/// converting into [`AttachConfig`], which is where bootstrap treats it as
/// fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAttachConfig {
    pub mode: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub log_to: Option<PathBuf>,
}

impl RawAttachConfig {
    /// Validates and converts into the immutable domain config.
    pub fn into_config(self) -> DomainResult<AttachConfig> {
        let mode: AttachMode = self.mode.parse()?;
        let mut config = AttachConfig::new(mode, Address::new(self.host, self.port));
        if let Some(token) = self.access_token {
            config = config.with_access_token(token);
        }
        if let Some(path) = self.log_to {
            config = config.with_log_to(path);
        }
        Ok(config)
    }
}

impl From<&AttachConfig> for RawAttachConfig {
    fn from(config: &AttachConfig) -> Self {
        Self {
            mode: config.mode().as_str().to_string(),
            host: config.address().host.clone(),
            port: config.address().port,
            access_token: config.access_token().map(str::to_string),
            log_to: config.log_to().map(PathBuf::from),
        }
    }
}

/// Raw attach-by-pid request: `{processId, ...RawAttachConfig}`.
///
/// `processId` accepts either an integer or its decimal string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAttachRequest {
    pub process_id: ProcessId,
    #[serde(flatten)]
    pub config: RawAttachConfig,
}

impl RawAttachRequest {
    pub fn new(process_id: ProcessId, config: &AttachConfig) -> Self {
        Self {
            process_id,
            config: config.into(),
        }
    }
}
