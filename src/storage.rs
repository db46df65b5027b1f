//! Managed storage directories.
//!
//! The base path holds three sibling folders:
//! - `invoices/`: documents classified as invoices
//! - `others/`: everything else, including unknowns
//! - `temp/`: transient downloads, one file per in-flight pipeline run
//!
//! Files in `invoices/` and `others/` are never overwritten; name collisions
//! get a numeric suffix before the extension (`a.pdf`, `a_1.pdf`, `a_2.pdf`).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::pipeline::types::DocumentType;
use crate::security::sanitize_filename;

/// File counts per managed directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub invoices: usize,
    pub others: usize,
    pub temp: usize,
    pub total_processed: usize,
}

/// Filesystem service owning the managed directories.
pub struct StorageService {
    config: StorageConfig,
    // Collision resolution and the move happen under the target dir's lock.
    invoices_lock: Mutex<()>,
    others_lock: Mutex<()>,
}

impl StorageService {
    /// Create the service and make sure every managed directory exists.
    pub async fn new(config: StorageConfig) -> Result<Self, StorageError> {
        let service = Self {
            config,
            invoices_lock: Mutex::new(()),
            others_lock: Mutex::new(()),
        };
        service.ensure_directories().await?;
        Ok(service)
    }

    pub fn base_path(&self) -> &Path {
        &self.config.base_path
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Create `invoices/`, `others/` and `temp/` if absent. Safe to call repeatedly.
    pub async fn ensure_directories(&self) -> Result<(), StorageError> {
        for dir in [
            self.config.invoices_path(),
            self.config.others_path(),
            self.config.temp_path(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|source| StorageError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
        }
        debug!(base = %self.config.base_path.display(), "Storage directories ready");
        Ok(())
    }

    /// Atomically create a fresh, empty file in `temp/` for `name`.
    ///
    /// The name is sanitized first. If a file of that name already exists
    /// the usual `_N` suffix is applied, so concurrent runs never share a
    /// temp file.
    pub async fn reserve_temp_file(&self, name: &str) -> Result<(fs::File, PathBuf), StorageError> {
        let temp_dir = self.config.temp_path();
        let filename = sanitize_filename(name);

        let mut counter = 0u32;
        loop {
            let candidate = if counter == 0 {
                temp_dir.join(&filename)
            } else {
                temp_dir.join(suffixed_name(&filename, counter))
            };

            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await
            {
                Ok(file) => return Ok((file, candidate)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => counter += 1,
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
    }

    /// Write `bytes` to a newly reserved temp file and return its path.
    pub async fn write_temp_file(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        let (mut file, path) = self.reserve_temp_file(name).await?;

        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            drop(file);
            if let Err(rm) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %rm, "Failed to remove partial temp file");
            }
            return Err(StorageError::Io(e));
        }

        debug!(path = %path.display(), size = bytes.len(), "Temp file written");
        Ok(path)
    }

    /// Move `source` into `invoices/` (for invoices) or `others/` (for
    /// everything else) without overwriting existing files.
    ///
    /// `filename` defaults to the source's own file name. Returns the final path.
    pub async fn move_to_destination(
        &self,
        source: &Path,
        document_type: DocumentType,
        filename: Option<&str>,
    ) -> Result<PathBuf, StorageError> {
        if !fs::try_exists(source).await.unwrap_or(false) {
            return Err(StorageError::SourceMissing(source.to_path_buf()));
        }

        let filename = match filename {
            Some(name) => sanitize_filename(name),
            None => source
                .file_name()
                .map(|n| sanitize_filename(&n.to_string_lossy()))
                .ok_or_else(|| StorageError::SourceMissing(source.to_path_buf()))?,
        };

        let (target_dir, lock) = match document_type {
            DocumentType::Invoice => (self.config.invoices_path(), &self.invoices_lock),
            DocumentType::NonInvoice | DocumentType::Unknown => {
                (self.config.others_path(), &self.others_lock)
            }
        };

        let _guard = lock.lock().await;

        let destination = free_destination(&target_dir, &filename).await?;
        move_file(source, &destination).await?;

        info!(
            from = %source.display(),
            to = %destination.display(),
            document_type = %document_type,
            "File moved to destination"
        );
        Ok(destination)
    }

    /// Remove regular files in `temp/` older than `max_age`.
    ///
    /// Files that disappear mid-sweep count as already cleaned. Other
    /// per-file errors are logged and skipped. Returns how many files
    /// this call removed.
    pub async fn cleanup_temp_files(&self, max_age: Duration) -> Result<usize, StorageError> {
        let temp_dir = self.config.temp_path();
        let mut entries = match fs::read_dir(&temp_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot stat temp file");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    debug!(path = %path.display(), age_secs = age.as_secs(), "Removed stale temp file");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
            }
        }

        if removed > 0 {
            info!(removed, "Temp directory swept");
        }
        Ok(removed)
    }

    /// Count stored files per managed directory.
    pub async fn stats(&self) -> Result<StorageStats, StorageError> {
        let invoices = count_files(&self.config.invoices_path()).await?;
        let others = count_files(&self.config.others_path()).await?;
        let temp = count_files(&self.config.temp_path()).await?;
        Ok(StorageStats {
            invoices,
            others,
            temp,
            total_processed: invoices + others,
        })
    }
}

/// `name.ext` -> `name_N.ext`; names without an extension just get `_N`.
fn suffixed_name(filename: &str, counter: u32) -> String {
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    match path.extension() {
        Some(ext) => format!("{stem}_{counter}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{counter}"),
    }
}

/// First path in `dir` for `filename` that does not exist yet.
async fn free_destination(dir: &Path, filename: &str) -> Result<PathBuf, StorageError> {
    let mut candidate = dir.join(filename);
    let mut counter = 1u32;
    while fs::try_exists(&candidate).await? {
        candidate = dir.join(suffixed_name(filename, counter));
        counter += 1;
    }
    Ok(candidate)
}

/// Rename, falling back to copy + delete (e.g. across filesystems).
async fn move_file(from: &Path, to: &Path) -> Result<(), StorageError> {
    let move_err = |source| StorageError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };

    if let Err(rename_err) = fs::rename(from, to).await {
        debug!(error = %rename_err, "Rename failed, falling back to copy");
        if let Err(copy_err) = fs::copy(from, to).await {
            // Never leave a truncated copy in a managed folder.
            match fs::remove_file(to).await {
                Ok(()) => debug!(path = %to.display(), "Removed partial copy"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %to.display(), error = %e, "Could not remove partial copy"),
            }
            return Err(move_err(copy_err));
        }
        if let Err(e) = fs::remove_file(from).await {
            warn!(path = %from.display(), error = %e, "Copied file but could not remove source");
        }
    }
    Ok(())
}

async fn count_files(dir: &Path) -> Result<usize, StorageError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StorageError::Io(e)),
    };

    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file && !hidden {
            count += 1;
        }
    }
    Ok(count)
}
