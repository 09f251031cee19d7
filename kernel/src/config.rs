// VTMD Configuration
//
// Names and limits that are fixed for the lifetime of the process:
// where the catalog template lives, how catalog tables are named and
// how long metadata lock requests wait.

use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::VtmdError;
use crate::record::ObjectName;

static GLOBAL: OnceLock<VtmdConfig> = OnceLock::new();

/// Length of the `_YYYYMMDD_HHMMSS_ffffff` suffix of an archive name.
pub const ARCHIVE_SUFFIX_LEN: usize = 23;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("global config is already initialized")]
    AlreadyInitialized,
}

/// Configuration loaded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VtmdConfig {
    /// Schema holding the catalog template.
    pub system_schema: String,
    pub template_table: String,
    /// Appended to a logical table name to form its catalog table name.
    pub table_suffix: String,
    pub max_name_len: usize,
    pub lock_wait_timeout_ms: u64,
}

impl Default for VtmdConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl VtmdConfig {
    /// Default built-in config (used if no config is provided).
    pub fn default_config() -> Self {
        Self {
            system_schema: "mysql".into(),
            template_table: "vtmd_template".into(),
            table_suffix: "_vtmd".into(),
            max_name_len: 64,
            lock_wait_timeout_ms: 50_000,
        }
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system_schema.is_empty() || self.template_table.is_empty() {
            return Err(ConfigError::Invalid(
                "template schema and table must be set".into(),
            ));
        }
        if self.table_suffix.is_empty() {
            return Err(ConfigError::Invalid("table_suffix must not be empty".into()));
        }
        if self.table_suffix.len() >= self.max_name_len {
            return Err(ConfigError::Invalid(format!(
                "table_suffix `{}` leaves no room within max_name_len {}",
                self.table_suffix, self.max_name_len
            )));
        }
        Ok(())
    }

    /// Install the process-wide config. May only be called once.
    pub fn init_global(config: VtmdConfig) -> Result<&'static VtmdConfig, ConfigError> {
        config.validate()?;
        GLOBAL
            .set(config)
            .map_err(|_| ConfigError::AlreadyInitialized)?;
        Ok(Self::global())
    }

    /// Process-wide config, falling back to the built-in defaults.
    pub fn global() -> &'static VtmdConfig {
        GLOBAL.get_or_init(Self::default_config)
    }

    pub fn template(&self) -> ObjectName {
        ObjectName::new(&self.system_schema, &self.template_table)
    }

    /// Catalog table name for the logical table `about`.
    pub fn catalog_name_for(&self, about: &ObjectName) -> Result<ObjectName, VtmdError> {
        let table = format!("{}{}", about.table, self.table_suffix);
        if table.len() > self.max_name_len {
            return Err(VtmdError::NameTooLong {
                name: about.table.clone(),
                max: self.max_name_len - self.table_suffix.len(),
            });
        }
        Ok(ObjectName::new(&about.schema, table))
    }

    /// Longest archive name derived from a table name.
    pub fn max_archive_name_len(&self) -> usize {
        self.max_name_len + ARCHIVE_SUFFIX_LEN
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}
