use crate::{APP_AUTHOR, APP_NAME, APP_QUALIFIER};
use directories::ProjectDirs;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;

const HOME_ENV: &str = "CADENZA_HOME";

#[derive(Debug, Clone)]
pub struct AppDirs {
    config_dir: PathBuf,
    log_dir: PathBuf,
}

impl AppDirs {
    /// `CADENZA_HOME`, when set to a non-empty path, wins over the platform layout.
    pub fn discover() -> Result<Self, DirsError> {
        Self::resolve(std::env::var_os(HOME_ENV))
    }

    fn resolve(home: Option<OsString>) -> Result<Self, DirsError> {
        if let Some(home) = home.filter(|home| !home.is_empty()) {
            return Ok(Self::from_root(PathBuf::from(home)));
        }
        let project = ProjectDirs::from(APP_QUALIFIER, APP_AUTHOR, APP_NAME)
            .ok_or(DirsError::MissingProjectDirs)?;
        Ok(Self {
            config_dir: project.config_dir().to_path_buf(),
            log_dir: project.data_local_dir().join("logs"),
        })
    }

    pub fn from_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.join("config"),
            log_dir: root.join("logs"),
        }
    }

    pub fn ensure_exists(&self) -> Result<(), DirsError> {
        [&self.config_dir, &self.log_dir]
            .into_iter()
            .try_for_each(|dir| {
                std::fs::create_dir_all(dir).map_err(|source| DirsError::CreateDirectory {
                    path: dir.clone(),
                    source,
                })
            })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

#[derive(Debug, Error)]
pub enum DirsError {
    #[error("no home directory to place {APP_NAME} configuration under")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}
