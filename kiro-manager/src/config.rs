use crate::error::ManagerError;
use crate::machineid::Platform;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const BACKUP_DIR_NAME: &str = "backups";
pub const OVERRIDE_FILE_NAME: &str = "custom-machine-id";
pub const AUTH_TOKEN_FILE_NAME: &str = "kiro-auth-token.json";

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub paths: Paths,
    pub machine_id: MachineIdConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub backup_root: String,
    pub kiro_home: String,
    pub sso_cache: String,
    pub auth_token: String,
    pub install_dir: String,
    pub extension_js: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct MachineIdConfig {
    pub linux_paths: Vec<String>,
    pub command_timeout_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            paths: Paths::default(),
            machine_id: MachineIdConfig::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            backup_root: "".to_string(),
            kiro_home: "~/.kiro".to_string(),
            sso_cache: "~/.aws/sso/cache".to_string(),
            auth_token: "".to_string(),
            install_dir: "".to_string(),
            extension_js: "".to_string(),
        }
    }
}

impl Default for MachineIdConfig {
    fn default() -> Self {
        Self {
            linux_paths: vec![
                "/etc/machine-id".to_string(),
                "/var/lib/dbus/machine-id".to_string(),
            ],
            command_timeout_sec: 15,
        }
    }
}

impl MachineIdConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_sec)
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("KIRO_MANAGER_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .or_else(|| home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kiro-manager")
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("KIRO_MANAGER_CONFIG") {
        return PathBuf::from(path);
    }
    default_config_dir().join("config.yaml")
}

pub fn read_config_from_str(content: &str) -> Result<Config, ManagerError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

/// A missing file yields the built-in defaults.
pub fn read_config(path: &Path) -> Result<Config, ManagerError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file absent, using defaults");
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)
        .map_err(|err| ManagerError::io(format!("read config {}", path.display()), err))?;
    read_config_from_str(&content)
}

pub fn validate_config(cfg: &Config) -> Result<(), ManagerError> {
    if cfg.version != 1 {
        return Err(ManagerError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg
        .machine_id
        .linux_paths
        .iter()
        .all(|path| path.trim().is_empty())
    {
        return Err(ManagerError::Config(
            "machine_id.linux_paths must list at least one file".to_string(),
        ));
    }
    if cfg.machine_id.command_timeout_sec == 0 {
        return Err(ManagerError::Config(
            "machine_id.command_timeout_sec must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

pub fn expand_path(input: &str) -> PathBuf {
    if input == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    }
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn configured(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(expand_path(trimmed))
    }
}

/// Every on-disk location the core components operate on.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedPaths {
    pub config_path: PathBuf,
    pub backup_root: PathBuf,
    pub lock_dir: PathBuf,
    pub kiro_home: PathBuf,
    pub override_file: PathBuf,
    pub sso_cache: PathBuf,
    pub auth_token: PathBuf,
    pub install_dir: Option<PathBuf>,
    pub extension_js: PathBuf,
}

fn default_backup_root() -> Result<PathBuf, ManagerError> {
    let exe = env::current_exe()
        .map_err(|err| ManagerError::io("locate the running executable", err))?;
    let dir = exe.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join(BACKUP_DIR_NAME))
}

pub fn resolve_paths(
    cfg: &Config,
    config_path: &Path,
    platform: &dyn Platform,
) -> Result<ResolvedPaths, ManagerError> {
    let backup_root = match configured(&cfg.paths.backup_root) {
        Some(path) => path,
        None => default_backup_root()?,
    };
    let kiro_home = configured(&cfg.paths.kiro_home)
        .ok_or_else(|| ManagerError::Config("paths.kiro_home must not be empty".to_string()))?;
    let sso_cache = configured(&cfg.paths.sso_cache)
        .ok_or_else(|| ManagerError::Config("paths.sso_cache must not be empty".to_string()))?;
    let auth_token =
        configured(&cfg.paths.auth_token).unwrap_or_else(|| sso_cache.join(AUTH_TOKEN_FILE_NAME));

    let install_candidates = match configured(&cfg.paths.install_dir) {
        Some(path) => vec![path],
        None => platform.install_dir_candidates(),
    };
    let install_dir = install_candidates
        .iter()
        .find(|path| path.exists())
        .or_else(|| install_candidates.first())
        .cloned();

    let extension_js = match configured(&cfg.paths.extension_js) {
        Some(path) => path,
        None => match &install_dir {
            Some(dir) => platform.extension_js_path(dir),
            None => {
                return Err(ManagerError::Unsupported(format!(
                    "no Kiro install location is known for {}; set paths.install_dir",
                    platform.name()
                )))
            }
        },
    };

    Ok(ResolvedPaths {
        config_path: config_path.to_path_buf(),
        lock_dir: backup_root.join(".locks"),
        backup_root,
        override_file: kiro_home.join(OVERRIDE_FILE_NAME),
        kiro_home,
        sso_cache,
        auth_token,
        install_dir,
        extension_js,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_unknown_field_errors() {
        let yaml = r#"
version: 1
unknown: true
"#;
        assert!(read_config_from_str(yaml).is_err());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg.paths.kiro_home, "~/.kiro");
        assert_eq!(cfg.machine_id.linux_paths.len(), 2);
        assert_eq!(cfg.machine_id.command_timeout_sec, 15);
    }

    #[test]
    fn embedded_default_config_is_valid() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).expect("default config");
        assert_eq!(cfg.version, 1);
        assert!(cfg.paths.backup_root.is_empty());
    }

    #[test]
    fn config_rejects_zero_timeout_and_empty_probe_list() {
        let err = read_config_from_str("version: 1\nmachine_id:\n  command_timeout_sec: 0\n")
            .expect_err("zero timeout");
        assert!(err.to_string().contains("command_timeout_sec"));
        let err = read_config_from_str("version: 1\nmachine_id:\n  linux_paths: []\n")
            .expect_err("empty list");
        assert!(err.to_string().contains("linux_paths"));
    }

    #[test]
    fn config_rejects_other_versions() {
        let err = read_config_from_str("version: 2").expect_err("version");
        assert!(err.to_string().contains("unsupported config version 2"));
    }

    #[test]
    fn expand_tilde_works() {
        let expanded = expand_path("~/.kiro");
        assert!(!expanded.to_string_lossy().starts_with("~/"));
    }
}
