use crate::config::AUTH_TOKEN_FILE_NAME;
use crate::error::ManagerError;
use crate::fsutil::{copy_atomic, remove_dir_if_exists, write_atomic, PathLock};
use crate::machineid::{raw_identifier, Platform};
use crate::token::AuthToken;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const MACHINE_ID_FILE_NAME: &str = "machine-id.json";
pub const ORIGINAL_BACKUP_NAME: &str = "original";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineIdBackup {
    #[serde(rename = "machineId")]
    pub machine_id: String,
    #[serde(rename = "backupTime")]
    pub backup_time: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub backup_time: Option<DateTime<Utc>>,
    pub has_token: bool,
    pub has_machine_id: bool,
}

/// Named snapshots of (machine id, auth token) under one root directory.
pub struct BackupRegistry<'a> {
    root: PathBuf,
    live_token: PathBuf,
    platform: &'a dyn Platform,
}

pub fn validate_backup_name(name: &str) -> Result<(), ManagerError> {
    let invalid = name.trim().is_empty()
        || name != name.trim()
        || name.starts_with('.')
        || name.contains(['/', '\\', ':'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(ManagerError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl<'a> BackupRegistry<'a> {
    pub fn new(root: PathBuf, live_token: PathBuf, platform: &'a dyn Platform) -> Self {
        Self {
            root,
            live_token,
            platform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn backup_path(&self, name: &str) -> Result<PathBuf, ManagerError> {
        validate_backup_name(name)?;
        Ok(self.root.join(name))
    }

    fn lock(&self, name: &str) -> Result<PathLock, ManagerError> {
        PathLock::acquire(&self.root.join(".locks").join(format!("{name}.lock")))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.backup_path(name)
            .map(|path| path.is_dir())
            .unwrap_or(false)
    }

    fn existing_path(&self, name: &str) -> Result<PathBuf, ManagerError> {
        let path = self.backup_path(name)?;
        if !path.is_dir() {
            return Err(ManagerError::BackupNotFound(name.to_string()));
        }
        Ok(path)
    }

    pub fn list(&self) -> Result<Vec<BackupInfo>, ManagerError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(ManagerError::io(
                    format!("list backups in {}", self.root.display()),
                    err,
                ))
            }
        };
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| ManagerError::io("read backup entry", err))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            backups.push(describe(&entry.path(), name));
        }
        backups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(backups)
    }

    pub fn info(&self, name: &str) -> Result<BackupInfo, ManagerError> {
        let path = self.existing_path(name)?;
        Ok(describe(&path, name.to_string()))
    }

    /// Full snapshot: copies the live token byte-for-byte and records the
    /// current machine id.
    pub fn create(&self, name: &str) -> Result<BackupInfo, ManagerError> {
        self.create_snapshot(name, true)
    }

    /// Machine-id-only snapshot, used for the reserved original backup.
    pub fn create_machine_id_only(&self, name: &str) -> Result<BackupInfo, ManagerError> {
        self.create_snapshot(name, false)
    }

    fn create_snapshot(&self, name: &str, with_token: bool) -> Result<BackupInfo, ManagerError> {
        let path = self.backup_path(name)?;
        let _guard = self.lock(name)?;
        if path.is_dir() {
            return Err(ManagerError::BackupExists(name.to_string()));
        }
        if path.exists() {
            return Err(ManagerError::BackupPathOccupied(path));
        }

        let staging = self
            .root
            .join(format!(".staging-{}-{}", name, std::process::id()));
        remove_dir_if_exists(&staging)?;
        fs::create_dir_all(&staging)
            .map_err(|err| ManagerError::io("create backup directory", err))?;

        if let Err(err) = self.fill_snapshot(&staging, with_token) {
            if let Err(cleanup) = remove_dir_if_exists(&staging) {
                tracing::warn!(path = %staging.display(), "failed to clean up partial backup: {cleanup}");
            }
            return Err(err);
        }
        if let Err(err) = fs::rename(&staging, &path) {
            let _ = remove_dir_if_exists(&staging);
            return Err(ManagerError::io(format!("finalize backup {name}"), err));
        }
        tracing::info!(name, with_token, "created backup");
        Ok(describe(&path, name.to_string()))
    }

    fn fill_snapshot(&self, dir: &Path, with_token: bool) -> Result<(), ManagerError> {
        if with_token {
            if !self.live_token.is_file() {
                return Err(ManagerError::NoTokenToBackup(self.live_token.clone()));
            }
            copy_atomic(&self.live_token, &dir.join(AUTH_TOKEN_FILE_NAME))?;
        }
        let machine_id = raw_identifier(self.platform)?;
        let record = MachineIdBackup {
            machine_id,
            backup_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        write_atomic(
            &dir.join(MACHINE_ID_FILE_NAME),
            &serde_json::to_vec_pretty(&record)?,
        )
    }

    /// Returns `true` when the original backup was created by this call.
    pub fn ensure_original(&self) -> Result<bool, ManagerError> {
        if self.exists(ORIGINAL_BACKUP_NAME) {
            return Ok(false);
        }
        match self.create_machine_id_only(ORIGINAL_BACKUP_NAME) {
            Ok(_) => Ok(true),
            // Lost a race with another invocation.
            Err(ManagerError::BackupExists(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Copies the backup's token over the live Kiro auth token.
    pub fn restore_token(&self, name: &str) -> Result<(), ManagerError> {
        let path = self.existing_path(name)?;
        let _guard = self.lock(name)?;
        let source = path.join(AUTH_TOKEN_FILE_NAME);
        if !source.is_file() {
            return Err(ManagerError::BackupPartMissing {
                name: name.to_string(),
                part: "auth token",
            });
        }
        copy_atomic(&source, &self.live_token)?;
        tracing::info!(name, target = %self.live_token.display(), "restored auth token");
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), ManagerError> {
        let path = self.existing_path(name)?;
        let _guard = self.lock(name)?;
        fs::remove_dir_all(&path)
            .map_err(|err| ManagerError::io(format!("delete backup {name}"), err))?;
        tracing::info!(name, "deleted backup");
        Ok(())
    }

    /// Merge-writes a refreshed access token into the backup; all other
    /// token fields, known or not, are written back unchanged.
    pub fn update_token(
        &self,
        name: &str,
        access_token: &str,
        expires_at: &str,
    ) -> Result<AuthToken, ManagerError> {
        let path = self.existing_path(name)?;
        let _guard = self.lock(name)?;
        let token_path = path.join(AUTH_TOKEN_FILE_NAME);
        let mut token = read_token_part(name, &token_path)?;
        token.refresh_access(access_token, expires_at);
        write_atomic(&token_path, &token.to_pretty_json()?)?;
        tracing::info!(name, expires_at, "updated backup token");
        Ok(token)
    }

    pub fn read_machine_id(&self, name: &str) -> Result<MachineIdBackup, ManagerError> {
        let path = self.existing_path(name)?.join(MACHINE_ID_FILE_NAME);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ManagerError::BackupPartMissing {
                    name: name.to_string(),
                    part: "machine id",
                })
            }
            Err(err) => return Err(ManagerError::io(format!("read {}", path.display()), err)),
        };
        serde_json::from_slice(&content).map_err(|source| ManagerError::Malformed {
            what: "machine id backup",
            path,
            source,
        })
    }

    pub fn read_token(&self, name: &str) -> Result<AuthToken, ManagerError> {
        let path = self.existing_path(name)?.join(AUTH_TOKEN_FILE_NAME);
        read_token_part(name, &path)
    }

    /// Finds a backup whose machine id matches `machine_id`, ignoring case.
    /// Unreadable backups are skipped.
    pub fn find_by_machine_id(&self, machine_id: &str) -> Result<Option<String>, ManagerError> {
        for info in self.list()? {
            match self.read_machine_id(&info.name) {
                Ok(record) if record.machine_id.eq_ignore_ascii_case(machine_id) => {
                    return Ok(Some(info.name))
                }
                Ok(_) => {}
                Err(err) => tracing::debug!(name = %info.name, "skipping backup: {err}"),
            }
        }
        Ok(None)
    }
}

fn read_token_part(name: &str, path: &Path) -> Result<AuthToken, ManagerError> {
    match fs::read(path) {
        Ok(content) => AuthToken::parse(&content, path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(ManagerError::BackupPartMissing {
            name: name.to_string(),
            part: "auth token",
        }),
        Err(err) => Err(ManagerError::io(format!("read {}", path.display()), err)),
    }
}

fn describe(path: &Path, name: String) -> BackupInfo {
    let has_token = path.join(AUTH_TOKEN_FILE_NAME).is_file();
    let machine_id_path = path.join(MACHINE_ID_FILE_NAME);
    let has_machine_id = machine_id_path.is_file();
    let backup_time = fs::read(&machine_id_path)
        .ok()
        .and_then(|content| serde_json::from_slice::<MachineIdBackup>(&content).ok())
        .and_then(|record| DateTime::parse_from_rfc3339(&record.backup_time).ok())
        .map(|dt| dt.with_timezone(&Utc));
    BackupInfo {
        name,
        path: path.to_path_buf(),
        backup_time,
        has_token,
        has_machine_id,
    }
}
