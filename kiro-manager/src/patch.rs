use crate::error::ManagerError;
use crate::fsutil::{copy_atomic, remove_file_if_exists, write_atomic, PathLock};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

pub const BACKUP_SUFFIX: &str = ".kiro-manager-backup";
pub const PATCH_LOCK_NAME: &str = "extension-patch.lock";
const DETECT_PREFIX_LEN: u64 = 1024;
const END_MARKER: &str = "/* END_KIRO_MANAGER_PATCH */";
const OVERRIDE_PATH_PLACEHOLDER: &str = "__KIRO_OVERRIDE_PATH__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchMarker {
    pub version: u32,
    pub start: &'static str,
    pub end: &'static str,
}

/// Every payload version this tool has ever injected, oldest first. The
/// last entry is the one `apply` writes.
pub const PATCH_MARKERS: [PatchMarker; 3] = [
    PatchMarker {
        version: 1,
        start: "/* KIRO_MANAGER_PATCH_V1 */",
        end: END_MARKER,
    },
    PatchMarker {
        version: 2,
        start: "/* KIRO_MANAGER_PATCH_V2 */",
        end: END_MARKER,
    },
    PatchMarker {
        version: 3,
        start: "/* KIRO_MANAGER_PATCH_V3 */",
        end: END_MARKER,
    },
];

pub fn current_marker() -> &'static PatchMarker {
    &PATCH_MARKERS[PATCH_MARKERS.len() - 1]
}

const PAYLOAD_BODY: &str = r#"
(function() {
  const fs = require('fs');
  const customIdPath = __KIRO_OVERRIDE_PATH__;
  let customMachineId = null;
  try {
    customMachineId = fs.readFileSync(customIdPath, 'utf8').trim();
  } catch {}
  if (!customMachineId) return;

  const idFiles = ['/etc/machine-id', '/var/lib/dbus/machine-id'];
  const probes = [/MachineGuid/i, /IOPlatformExpertDevice/i, /IOPlatformUUID/i, /machine-id/i, /wmic\s+csproduct\s+get\s+uuid/i];
  const isProbe = (cmd) => typeof cmd === 'string' && probes.some((re) => re.test(cmd));
  const probeOutput = (cmd) => {
    if (/MachineGuid/i.test(cmd)) return '\r\n    MachineGuid    REG_SZ    ' + customMachineId + '\r\n';
    if (/IOPlatform/i.test(cmd)) return '"IOPlatformUUID" = "' + customMachineId + '"\n';
    if (/wmic/i.test(cmd)) return 'UUID\r\n' + customMachineId + '\r\n';
    return customMachineId.replace(/-/g, '') + '\n';
  };
  const encode = (out, options) => {
    const enc = typeof options === 'string' ? options : options && options.encoding;
    return enc && enc !== 'buffer' ? out : Buffer.from(out);
  };

  const cp = require('child_process');
  const origExec = cp.exec;
  const origExecSync = cp.execSync;
  const origExecFileSync = cp.execFileSync;
  cp.exec = function(cmd, options, callback) {
    if (!isProbe(cmd)) return origExec.apply(this, arguments);
    const cb = typeof options === 'function' ? options : callback;
    const out = probeOutput(cmd);
    return origExec.call(this, process.platform === 'win32' ? 'cd .' : 'true', () => {
      if (cb) cb(null, out, '');
    });
  };
  cp.execSync = function(cmd, options) {
    if (!isProbe(cmd)) return origExecSync.apply(this, arguments);
    return encode(probeOutput(cmd), options);
  };
  cp.execFileSync = function(file, args, options) {
    const argv = Array.isArray(args) ? args : [];
    const cmd = [file].concat(argv).join(' ');
    if (!isProbe(cmd)) return origExecFileSync.apply(this, arguments);
    return encode(probeOutput(cmd), Array.isArray(args) ? options : args);
  };

  const origReadFileSync = fs.readFileSync;
  fs.readFileSync = function(file, options) {
    if (typeof file === 'string' && idFiles.includes(file)) {
      return encode(customMachineId.replace(/-/g, '') + '\n', options);
    }
    return origReadFileSync.apply(this, arguments);
  };

  const Module = require('module');
  const originalLoad = Module._load;
  Module._load = function(request, parent, isMain) {
    const mod = originalLoad.call(this, request, parent, isMain);
    if (request === 'vscode') {
      return new Proxy(mod, {
        get(target, prop) {
          if (prop === 'env') {
            return new Proxy(target.env, {
              get(envTarget, envProp) {
                if (envProp === 'machineId') return customMachineId;
                return envTarget[envProp];
              }
            });
          }
          return target[prop];
        }
      });
    }
    if (mod && typeof mod === 'object' && (typeof mod.machineIdSync === 'function' || typeof mod.machineId === 'function')) {
      return new Proxy(mod, {
        get(target, prop) {
          if (prop === 'machineIdSync') return function() { return customMachineId; };
          if (prop === 'machineId') return function() { return Promise.resolve(customMachineId); };
          return target[prop];
        }
      });
    }
    return mod;
  };
})();
"#;

/// Builds the interception payload for `override_file`, bounded by the
/// current markers and terminated by a newline.
pub fn render_payload(override_file: &Path) -> Result<String, ManagerError> {
    let marker = current_marker();
    let literal = serde_json::to_string(&override_file.to_string_lossy())?;
    let body = PAYLOAD_BODY.replace(OVERRIDE_PATH_PLACEHOLDER, &literal);
    Ok(format!("{}{}{}\n", marker.start, body, marker.end))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PatchState {
    Unpatched,
    PatchedCurrent,
    PatchedStale { version: u32 },
}

impl PatchState {
    pub fn label(&self) -> String {
        match self {
            Self::Unpatched => "unpatched".to_string(),
            Self::PatchedCurrent => format!("patched (v{})", current_marker().version),
            Self::PatchedStale { version } => format!("patched with stale v{version}"),
        }
    }
}

fn find(haystack: &[u8], needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Owns the agent extension script and its `.kiro-manager-backup` sibling.
pub struct PatchEngine {
    artifact: PathBuf,
    lock_path: PathBuf,
    override_file: PathBuf,
}

impl PatchEngine {
    pub fn new(artifact: PathBuf, lock_dir: &Path, override_file: PathBuf) -> Self {
        Self {
            artifact,
            lock_path: lock_dir.join(PATCH_LOCK_NAME),
            override_file,
        }
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.artifact.as_os_str().to_os_string();
        name.push(BACKUP_SUFFIX);
        PathBuf::from(name)
    }

    fn not_found(&self, err: io::Error) -> ManagerError {
        if err.kind() == io::ErrorKind::NotFound {
            ManagerError::ExtensionNotFound(self.artifact.clone())
        } else {
            ManagerError::io(format!("read {}", self.artifact.display()), err)
        }
    }

    /// Classifies the artifact from its first kilobyte only.
    pub fn detect(&self) -> Result<PatchState, ManagerError> {
        let file = File::open(&self.artifact).map_err(|err| self.not_found(err))?;
        let mut prefix = Vec::with_capacity(DETECT_PREFIX_LEN as usize);
        file.take(DETECT_PREFIX_LEN)
            .read_to_end(&mut prefix)
            .map_err(|err| self.not_found(err))?;

        let current = current_marker();
        if find(&prefix, current.start).is_some() {
            return Ok(PatchState::PatchedCurrent);
        }
        let stale = PATCH_MARKERS
            .iter()
            .rev()
            .filter(|marker| marker.version != current.version)
            .find(|marker| find(&prefix, marker.start).is_some());
        let state = match stale {
            Some(marker) => PatchState::PatchedStale {
                version: marker.version,
            },
            None => PatchState::Unpatched,
        };
        tracing::debug!(path = %self.artifact.display(), ?state, "detected patch state");
        Ok(state)
    }

    /// Returns `true` when the artifact was rewritten.
    pub fn apply(&self) -> Result<bool, ManagerError> {
        let _guard = PathLock::acquire(&self.lock_path)?;
        match self.detect()? {
            PatchState::PatchedCurrent => return Ok(false),
            PatchState::PatchedStale { version } => {
                tracing::info!(version, "removing stale patch before upgrade");
                self.strip(version)?;
            }
            PatchState::Unpatched => {}
        }

        let backup = self.backup_path();
        if !backup.exists() {
            copy_atomic(&self.artifact, &backup)?;
            tracing::info!(path = %backup.display(), "backed up extension.js");
        }

        let original = fs::read(&self.artifact).map_err(|err| self.not_found(err))?;
        let mut patched = render_payload(&self.override_file)?.into_bytes();
        patched.extend_from_slice(&original);
        write_atomic(&self.artifact, &patched)?;
        tracing::info!(
            path = %self.artifact.display(),
            version = current_marker().version,
            "patched extension.js"
        );
        Ok(true)
    }

    /// Returns `true` when a payload was removed.
    pub fn remove(&self) -> Result<bool, ManagerError> {
        let _guard = PathLock::acquire(&self.lock_path)?;
        let version = match self.detect()? {
            PatchState::Unpatched => return Ok(false),
            PatchState::PatchedCurrent => current_marker().version,
            PatchState::PatchedStale { version } => version,
        };
        self.strip(version)?;
        Ok(true)
    }

    fn strip(&self, version: u32) -> Result<(), ManagerError> {
        let end = PATCH_MARKERS
            .iter()
            .find(|marker| marker.version == version)
            .map(|marker| marker.end)
            .unwrap_or(END_MARKER);
        let content = fs::read(&self.artifact).map_err(|err| self.not_found(err))?;
        let backup = self.backup_path();

        match find(&content, end) {
            Some(idx) => {
                let mut cut = idx + end.len();
                if content.get(cut) == Some(&b'\n') {
                    cut += 1;
                }
                write_atomic(&self.artifact, &content[cut..])?;
                tracing::info!(version, path = %self.artifact.display(), "removed patch");
            }
            None => {
                if !backup.is_file() {
                    return Err(ManagerError::PatchBackupNotFound(backup));
                }
                tracing::warn!(
                    version,
                    path = %self.artifact.display(),
                    "end marker missing, restoring extension.js from backup"
                );
                copy_atomic(&backup, &self.artifact)?;
            }
        }
        remove_file_if_exists(&backup)?;
        Ok(())
    }
}
