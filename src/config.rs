use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub(crate) const DEFAULT_CONFIG_FILE: &str = "runledger.json";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_PREVIEW_ROWS: usize = 10;

/// How a new upload combines with what is already in the run store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub(crate) enum IngestionPolicy {
    /// Keep existing rows; new runs continue from the stored maximum.
    #[default]
    Append,
    /// Drop the stored table; new runs are numbered from 1.
    Replace,
}

impl IngestionPolicy {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Replace => "replace",
        }
    }
}

impl std::fmt::Display for IngestionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    pub(crate) upload_dir: PathBuf,
    pub(crate) db_path: PathBuf,
    pub(crate) max_upload_bytes: u64,
    pub(crate) allowed_extensions: Vec<String>,
    pub(crate) preview_row_count: usize,
    pub(crate) ingestion_policy: IngestionPolicy,
    pub(crate) bind: String,
    pub(crate) port: u16,
    pub(crate) workers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            db_path: PathBuf::from("data").join("runs.sqlite"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_extensions: vec!["csv".to_string()],
            preview_row_count: DEFAULT_PREVIEW_ROWS,
            ingestion_policy: IngestionPolicy::default(),
            bind: "127.0.0.1".to_string(),
            port: 5000,
            workers: 4,
        }
    }
}

impl AppConfig {
    pub(crate) fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            max_upload_bytes: self.max_upload_bytes,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid("max_upload_bytes must be positive".into()));
        }
        if self.allowed_extensions.iter().all(|ext| ext.trim().is_empty()) {
            return Err(ConfigError::Invalid("allowed_extensions is empty".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parse-time limits handed to the normalizer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UploadLimits {
    pub(crate) max_upload_bytes: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

/// Load a config file. A missing file yields the defaults; a malformed one is an error.
pub(crate) fn load_file_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(AppConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let config: AppConfig = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

pub(crate) fn save_file_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
