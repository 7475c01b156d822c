use crate::error::{Interrupted, ManagerError};
use crate::fsutil::{clear_session_cache, remove_file_if_exists, write_atomic};
use crate::machineid::generate_machine_id;
use crate::patch::{PatchEngine, PatchState};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SoftResetResult {
    pub old_machine_id: String,
    pub new_machine_id: String,
    pub patched: bool,
    pub cache_cleared: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SoftResetStatus {
    pub is_patched: bool,
    pub patch_state: String,
    pub has_custom_id: bool,
    pub custom_machine_id: String,
    pub extension_path: String,
}

/// Reads the override identifier. An absent or blank file is `None`.
pub fn read_override(path: &Path) -> Result<Option<String>, ManagerError> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let id = content.trim();
            Ok((!id.is_empty()).then(|| id.to_string()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ManagerError::io(format!("read {}", path.display()), err)),
    }
}

pub fn write_override(path: &Path, machine_id: &str) -> Result<(), ManagerError> {
    write_atomic(path, machine_id.as_bytes())?;
    tracing::info!(path = %path.display(), "wrote override machine id");
    Ok(())
}

/// Substitutes the machine id seen by the Kiro agent extension without
/// touching the system identity store.
pub struct SoftResetController {
    engine: PatchEngine,
    override_file: PathBuf,
    session_cache: PathBuf,
}

impl SoftResetController {
    pub fn new(engine: PatchEngine, override_file: PathBuf, session_cache: PathBuf) -> Self {
        Self {
            engine,
            override_file,
            session_cache,
        }
    }

    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    pub fn soft_reset(&self) -> Result<SoftResetResult, Interrupted<SoftResetResult>> {
        let mut result = SoftResetResult::default();

        match read_override(&self.override_file) {
            Ok(previous) => result.old_machine_id = previous.unwrap_or_default(),
            Err(err) => tracing::warn!("ignoring unreadable override machine id: {err}"),
        }

        result.new_machine_id = generate_machine_id();
        if let Err(err) = write_override(&self.override_file, &result.new_machine_id) {
            return Err(Interrupted::new(result, err));
        }

        let state = match self.engine.detect() {
            Ok(state) => state,
            Err(err) => return Err(Interrupted::new(result, err)),
        };
        if state != PatchState::PatchedCurrent {
            if let Err(err) = self.engine.apply() {
                return Err(Interrupted::new(result, err));
            }
        }
        result.patched = true;

        if let Err(err) = clear_session_cache(&self.session_cache) {
            return Err(Interrupted::new(result, err));
        }
        result.cache_cleared = true;

        tracing::info!(new_machine_id = %result.new_machine_id, "soft reset complete");
        Ok(result)
    }

    /// Drops the override so the patched extension falls back to the real id.
    /// The patch itself stays installed.
    pub fn restore_original(&self) -> Result<(), ManagerError> {
        if remove_file_if_exists(&self.override_file)? {
            tracing::info!(path = %self.override_file.display(), "removed override machine id");
        }
        clear_session_cache(&self.session_cache)?;
        Ok(())
    }

    pub fn status(&self) -> SoftResetStatus {
        let mut status = SoftResetStatus {
            extension_path: self.engine.artifact().display().to_string(),
            ..SoftResetStatus::default()
        };
        match self.engine.detect() {
            Ok(state) => {
                status.is_patched = state == PatchState::PatchedCurrent;
                status.patch_state = state.label();
            }
            Err(err) => {
                tracing::debug!("patch state unavailable: {err}");
                status.extension_path.clear();
            }
        }
        if let Ok(Some(id)) = read_override(&self.override_file) {
            status.has_custom_id = true;
            status.custom_machine_id = id;
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::current_marker;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new(extension: Option<&str>) -> Self {
            let dir = tempdir().unwrap();
            if let Some(content) = extension {
                let path = dir.path().join("dist").join("extension.js");
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, content).unwrap();
            }
            Self { dir }
        }

        fn override_file(&self) -> PathBuf {
            self.dir.path().join(".kiro").join("custom-machine-id")
        }

        fn cache(&self) -> PathBuf {
            self.dir.path().join("sso").join("cache")
        }

        fn extension(&self) -> PathBuf {
            self.dir.path().join("dist").join("extension.js")
        }

        fn controller(&self) -> SoftResetController {
            let engine = PatchEngine::new(
                self.extension(),
                &self.dir.path().join(".locks"),
                self.override_file(),
            );
            SoftResetController::new(engine, self.override_file(), self.cache())
        }
    }

    #[test]
    fn soft_reset_writes_override_patches_and_clears_cache() {
        let fx = Fixture::new(Some("console.log(1)"));
        fs::create_dir_all(fx.cache()).unwrap();
        fs::write(fx.cache().join("kiro-auth-token.json"), "{}").unwrap();

        let result = fx.controller().soft_reset().unwrap();
        assert_eq!(result.old_machine_id, "");
        assert_eq!(result.new_machine_id.len(), 36);
        assert!(result.patched && result.cache_cleared);
        assert_eq!(
            fs::read_to_string(fx.override_file()).unwrap(),
            result.new_machine_id
        );
        assert!(fs::read_to_string(fx.extension())
            .unwrap()
            .starts_with(current_marker().start));
        assert!(!fx.cache().exists());

        let again = fx.controller().soft_reset().unwrap();
        assert_eq!(again.old_machine_id, result.new_machine_id);
        assert_ne!(again.new_machine_id, result.new_machine_id);
        assert_eq!(
            fs::read_to_string(fx.extension())
                .unwrap()
                .matches(current_marker().start)
                .count(),
            1
        );
    }

    #[test]
    fn soft_reset_without_extension_reports_progress() {
        let fx = Fixture::new(None);
        let interrupted = fx.controller().soft_reset().unwrap_err();
        assert!(matches!(
            interrupted.error,
            ManagerError::ExtensionNotFound(_)
        ));
        assert!(!interrupted.progress.new_machine_id.is_empty());
        assert!(!interrupted.progress.patched);
        assert!(!interrupted.progress.cache_cleared);
        assert_eq!(
            read_override(&fx.override_file()).unwrap().as_deref(),
            Some(interrupted.progress.new_machine_id.as_str())
        );
    }

    #[test]
    fn restore_keeps_patch_and_tolerates_absent_state() {
        let fx = Fixture::new(Some("console.log(1)"));
        let controller = fx.controller();
        controller.restore_original().unwrap();

        controller.soft_reset().unwrap();
        controller.restore_original().unwrap();
        assert!(!fx.override_file().exists());
        let status = controller.status();
        assert!(status.is_patched);
        assert!(!status.has_custom_id);
    }

    #[test]
    fn restore_clears_session_cache_and_override() {
        let fx = Fixture::new(Some("console.log(1)"));
        let controller = fx.controller();
        controller.soft_reset().unwrap();

        let nested = fx.cache().join("nested");
        fs::create_dir_all(&nested).unwrap();
        fs::write(fx.cache().join("kiro-auth-token.json"), "{}").unwrap();
        fs::write(nested.join("client.json"), "{}").unwrap();

        controller.restore_original().unwrap();
        assert!(!fx.cache().exists());
        assert!(!fx.override_file().exists());
        assert_eq!(
            controller.engine().detect().unwrap(),
            PatchState::PatchedCurrent
        );
        assert!(fs::read_to_string(fx.extension())
            .unwrap()
            .ends_with("console.log(1)"));
    }

    #[test]
    fn status_reflects_override_and_patch() {
        let fx = Fixture::new(Some("console.log(1)"));
        let controller = fx.controller();
        let before = controller.status();
        assert!(!before.is_patched);
        assert_eq!(before.patch_state, "unpatched");
        assert!(!before.has_custom_id);

        write_override(&fx.override_file(), "  custom-id \n").unwrap();
        let after = controller.status();
        assert!(after.has_custom_id);
        assert_eq!(after.custom_machine_id, "custom-id");
        assert_eq!(after.extension_path, fx.extension().display().to_string());
    }

    #[test]
    fn status_never_fails_without_install() {
        let fx = Fixture::new(None);
        fs::create_dir_all(fx.override_file()).unwrap();
        let status = fx.controller().status();
        assert_eq!(status, SoftResetStatus::default());
    }

    #[test]
    fn blank_override_counts_as_absent() {
        let fx = Fixture::new(None);
        write_override(&fx.override_file(), "   ").unwrap();
        assert_eq!(read_override(&fx.override_file()).unwrap(), None);
    }
}
