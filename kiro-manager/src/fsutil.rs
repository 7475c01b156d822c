use crate::error::ManagerError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn ensure_parent(path: &Path) -> Result<(), ManagerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| ManagerError::io(format!("create {}", parent.display()), err))?;
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "kiro-manager".to_string()),
        pid,
        ts
    ))
}

fn write_synced(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}

/// Writes `content` next to `path`, flushes it to disk and renames it over
/// the destination. An existing destination keeps its permission bits.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ManagerError> {
    ensure_parent(path)?;
    let tmp_path = temp_sibling(path);
    let written = write_synced(&tmp_path, content).and_then(|_| {
        #[cfg(unix)]
        if let Ok(meta) = fs::metadata(path) {
            fs::set_permissions(&tmp_path, meta.permissions())?;
        }
        fs::rename(&tmp_path, path)
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(ManagerError::io(format!("write {}", path.display()), err));
    }
    Ok(())
}

pub fn copy_atomic(src: &Path, dst: &Path) -> Result<(), ManagerError> {
    let content =
        fs::read(src).map_err(|err| ManagerError::io(format!("read {}", src.display()), err))?;
    write_atomic(dst, &content)
}

/// Removes a directory tree; a missing directory is not an error.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool, ManagerError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ManagerError::io(format!("remove {}", path.display()), err)),
    }
}

pub fn remove_file_if_exists(path: &Path) -> Result<bool, ManagerError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ManagerError::io(format!("remove {}", path.display()), err)),
    }
}

/// Deletes the provider's SSO session cache so the IDE re-authenticates.
pub fn clear_session_cache(cache_dir: &Path) -> Result<bool, ManagerError> {
    let removed = remove_dir_if_exists(cache_dir)?;
    if removed {
        tracing::info!(path = %cache_dir.display(), "cleared SSO session cache");
    } else {
        tracing::debug!(path = %cache_dir.display(), "SSO session cache already absent");
    }
    Ok(removed)
}

/// Exclusive advisory lock held until dropped.
#[derive(Debug)]
pub struct PathLock {
    file: File,
    path: PathBuf,
}

impl PathLock {
    pub fn acquire(path: &Path) -> Result<Self, ManagerError> {
        ensure_parent(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| ManagerError::io(format!("open lock {}", path.display()), err))?;
        file.lock_exclusive()
            .map_err(|err| ManagerError::io(format!("lock {}", path.display()), err))?;
        tracing::debug!(path = %path.display(), "acquired lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), "failed to release lock: {err}");
        }
    }
}
