//! Application data directory layout.

use std::io;
use std::path::PathBuf;

use directories::{ProjectDirs, UserDirs};

/// Resolved locations for everything the engine persists.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub db_path: PathBuf,
}

impl AppPaths {
    /// Resolves the per-OS application data directory and creates it.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be determined or created.
    pub fn resolve() -> io::Result<Self> {
        let data_dir = ProjectDirs::from("", "", "zdmr")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no application data directory")
            })?;
        Self::at(data_dir)
    }

    /// Lays the standard structure out under an explicit root. Used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error when a directory cannot be created.
    pub fn at(data_dir: PathBuf) -> io::Result<Self> {
        let logs_dir = data_dir.join("logs");
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&logs_dir)?;
        Ok(Self {
            db_path: data_dir.join("zdmr.sqlite3"),
            data_dir,
            logs_dir,
        })
    }

    /// The OS download directory, else a `downloads` folder in app data.
    #[must_use]
    pub fn default_download_dir(&self) -> PathBuf {
        UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(PathBuf::from))
            .unwrap_or_else(|| self.data_dir.join("downloads"))
    }
}
