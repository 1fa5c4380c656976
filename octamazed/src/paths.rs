//! Cross-platform application paths

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathsError {
    #[error("Could not determine data directory")]
    NoDataDir,
    #[error("Failed to create data directory {path:?}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
    config_override: Option<PathBuf>,
}

impl AppPaths {
    pub fn new() -> Result<Self, PathsError> {
        let data_dir = Self::get_data_dir()?;

        // Ensure directory exists
        fs::create_dir_all(&data_dir).map_err(|source| PathsError::Create {
            path: data_dir.clone(),
            source,
        })?;

        let config_override = std::env::var_os("OCTAMAZE_CONFIG").map(PathBuf::from);
        Ok(Self {
            data_dir,
            config_override,
        })
    }

    fn get_data_dir() -> Result<PathBuf, PathsError> {
        let base = dirs::data_dir().ok_or(PathsError::NoDataDir)?;
        Ok(base.join("octamaze"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_override
            .clone()
            .unwrap_or_else(|| self.data_dir.join("config.json"))
    }
}
