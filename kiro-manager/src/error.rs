use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("config error: {0}")]
    Config(String),
    #[error("failed to {op}: {source}")]
    IoAt {
        op: String,
        #[source]
        source: io::Error,
    },
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("invalid backup name: {0:?}")]
    InvalidName(String),
    #[error("backup not found: {0}")]
    BackupNotFound(String),
    #[error("backup already exists: {0}")]
    BackupExists(String),
    #[error("backup path {0} exists but is not a directory")]
    BackupPathOccupied(PathBuf),
    #[error("backup {name} has no {part}")]
    BackupPartMissing { name: String, part: &'static str },
    #[error("no kiro auth token to backup at {0}")]
    NoTokenToBackup(PathBuf),
    #[error("malformed {what} at {path}: {source}")]
    Malformed {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported platform: {0}")]
    Unsupported(String),
    #[error("machine id not found: {0}")]
    MachineIdNotFound(String),
    #[error("extension.js not found at {0}")]
    ExtensionNotFound(PathBuf),
    #[error("extension.js backup not found at {0}")]
    PatchBackupNotFound(PathBuf),
    #[error("machine ID replacement is only supported on Windows")]
    NotWindows,
    #[error("modifying machine ID requires administrator privileges")]
    RequiresAdmin,
    #[error("current machine ID {0} is not backed up; create a backup first")]
    BackupRequired(String),
}

impl ManagerError {
    pub fn io(op: impl Into<String>, source: io::Error) -> Self {
        Self::IoAt {
            op: op.into(),
            source,
        }
    }

    /// Stable identifier surfaced as `error_details.error_code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Yaml(_) => "config_invalid",
            Self::IoAt { .. } => "io_failed",
            Self::Prompt(_) => "prompt_failed",
            Self::Json(_) => "json_failed",
            Self::Process(_) => "process_command_failed",
            Self::InvalidName(_) => "invalid_name",
            Self::BackupNotFound(_) | Self::BackupPartMissing { .. } => "not_found",
            Self::BackupExists(_) => "already_exists",
            Self::NoTokenToBackup(_) => "no_token_to_backup",
            Self::Malformed { .. } | Self::BackupPathOccupied(_) => "malformed_state",
            Self::Unsupported(_) => "unsupported_platform",
            Self::MachineIdNotFound(_) => "machine_id_not_found",
            Self::ExtensionNotFound(_) => "extension_not_found",
            Self::PatchBackupNotFound(_) => "not_found",
            Self::NotWindows => "not_windows",
            Self::RequiresAdmin => "requires_admin",
            Self::BackupRequired(_) => "backup_required",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::RequiresAdmin => Some("Re-run kiro-manager from an elevated (Administrator) terminal."),
            Self::BackupRequired(_) => Some(
                "Run `kiro-manager backup create <name>` first, or pass --skip-backup-check at your own risk.",
            ),
            Self::NoTokenToBackup(_) => Some("Sign in to Kiro once so an auth token exists, then retry."),
            Self::ExtensionNotFound(_) => {
                Some("Set paths.install_dir or paths.extension_js in the kiro-manager config.")
            }
            _ => None,
        }
    }
}

/// Failure of a multi-step operation, carrying how far it got.
#[derive(Debug)]
pub struct Interrupted<T> {
    pub progress: T,
    pub error: ManagerError,
}

impl<T> Interrupted<T> {
    pub fn new(progress: T, error: impl Into<ManagerError>) -> Self {
        Self {
            progress,
            error: error.into(),
        }
    }
}
