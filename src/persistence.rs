//! Atomic, backup-guarded storage of the activity document.
//!
//! A save writes the new document to a temp file, copies the current file to
//! `<name>.bak`, renames the temp file over the real one and finally deletes
//! the backup. If any step fails the real file is restored from the backup,
//! so a reader never sees a half-written document. The whole sequence runs
//! under an exclusive `fs2` lock on `<name>.lock`.

use crate::common::get_data_dir;
use crate::config::Config;
use crate::error::{Result, TrackerError};
use crate::models::{DataFile, RawDataFile};
use crate::retry::{retry_with_backoff, RetryPolicy};
use chrono::Local;
use fs2::FileExt;
use log::{debug, error, info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Where the loaded state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// No usable file; starting empty
    Empty,
    /// The data file itself
    Primary,
    /// The data file was unusable and `.bak` was read instead
    Backup,
}

#[derive(Debug, Clone)]
pub struct Loaded {
    pub data: RawDataFile,
    pub source: LoadSource,
}

#[derive(Debug, Clone)]
pub struct PersistenceManager {
    path: PathBuf,
    lock_retry: RetryPolicy,
}

impl PersistenceManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PersistenceManager {
            path: path.into(),
            lock_retry: RetryPolicy::default(),
        }
    }

    /// Data file from configuration, relative paths resolved against the data directory
    pub fn from_config(config: &Config) -> Self {
        let configured = PathBuf::from(&config.persistence.data_file);
        let path = if configured.is_absolute() {
            configured
        } else {
            get_data_dir().join(configured)
        };
        PersistenceManager::new(path).with_lock_retry(RetryPolicy::from(&config.retry.file_ops))
    }

    pub fn with_lock_retry(mut self, policy: RetryPolicy) -> Self {
        self.lock_retry = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        self.sibling(".bak")
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    fn lock_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "activity.json".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    /// Read the document. Never fails: unusable data yields an empty state.
    /// A corrupt data file is copied aside before falling back.
    pub fn load(&self) -> Loaded {
        self.load_with(true)
    }

    /// Same fallback order as [`load`](Self::load) but leaves the disk untouched.
    pub fn peek(&self) -> Loaded {
        self.load_with(false)
    }

    fn load_with(&self, preserve_corrupt: bool) -> Loaded {
        match read_document(&self.path) {
            Ok(Some(data)) => {
                return Loaded {
                    data,
                    source: LoadSource::Primary,
                }
            }
            Ok(None) => debug!("No activity file at {}", self.path.display()),
            Err(e) => {
                warn!("Unusable activity file {}: {}", self.path.display(), e);
                if preserve_corrupt {
                    self.preserve_corrupt_file();
                }
            }
        }

        // A crash between the backup copy and the rename leaves a usable .bak
        let backup = self.backup_path();
        match read_document(&backup) {
            Ok(Some(data)) => {
                info!("Loaded activity data from backup {}", backup.display());
                Loaded {
                    data,
                    source: LoadSource::Backup,
                }
            }
            Ok(None) => Loaded {
                data: RawDataFile::default(),
                source: LoadSource::Empty,
            },
            Err(e) => {
                warn!("Backup {} is unusable too: {}", backup.display(), e);
                Loaded {
                    data: RawDataFile::default(),
                    source: LoadSource::Empty,
                }
            }
        }
    }

    /// Write the document now, atomically.
    pub fn save_immediate(&self, data: &DataFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(data)?;
        let _lock = self.acquire_lock()?;

        let result = self.write_sequence(json.as_bytes());
        if let Err(e) = &result {
            error!("Failed to save activity data to {}: {}", self.path.display(), e);
            let _ = fs::remove_file(self.temp_path());
            self.restore_from_backup();
        }
        result
        // Lock released when `_lock` is dropped
    }

    fn write_sequence(&self, contents: &[u8]) -> Result<()> {
        let temp = self.temp_path();
        let backup = self.backup_path();

        {
            let mut file = File::create(&temp)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }

        if self.path.exists() {
            fs::copy(&self.path, &backup)?;
        }

        fs::rename(&temp, &self.path)?;

        if backup.exists() {
            if let Err(e) = fs::remove_file(&backup) {
                // The new file is in place; a stale backup is harmless
                warn!("Could not remove backup {}: {}", backup.display(), e);
            }
        }
        Ok(())
    }

    fn restore_from_backup(&self) {
        let backup = self.backup_path();
        if !backup.exists() {
            debug!("No backup to restore; keeping in-memory state for the next save");
            return;
        }
        if let Ok(Some(_)) = read_document(&self.path) {
            // Failed before the rename; the primary is still the old document
            let _ = fs::remove_file(&backup);
            return;
        }
        match fs::rename(&backup, &self.path) {
            Ok(()) => info!("Restored {} from backup", self.path.display()),
            Err(e) => error!("Failed to restore {} from backup: {}", self.path.display(), e),
        }
    }

    fn acquire_lock(&self) -> Result<File> {
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;

        retry_with_backoff(&self.lock_retry, || {
            lock_file
                .try_lock_exclusive()
                .map_err(|e| TrackerError::lock(format!("{}: {}", self.lock_path().display(), e)))
        })?;
        Ok(lock_file)
    }

    fn preserve_corrupt_file(&self) {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let target = self.sibling(&format!(".corrupt-{}", timestamp));
        match fs::copy(&self.path, &target) {
            Ok(_) => warn!("Corrupted activity data preserved at {}", target.display()),
            Err(e) => error!("Failed to preserve corrupted activity data: {}", e),
        }
    }
}

/// `Ok(None)` when the file does not exist or is empty.
fn read_document(path: &Path) -> Result<Option<RawDataFile>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }

    let data: RawDataFile = serde_json::from_str(&contents)
        .map_err(|e| TrackerError::data_file(format!("{}: {}", path.display(), e)))?;
    Ok(Some(data))
}
