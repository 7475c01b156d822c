use crate::backup::BackupRegistry;
use crate::error::{Interrupted, ManagerError};
use crate::fsutil::clear_session_cache;
use crate::machineid::{generate_machine_id, raw_identifier, Platform, PlatformKind};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetResult {
    pub cache_cleared: bool,
    pub old_machine_id: String,
    pub new_machine_id: String,
    pub machine_id_changed: bool,
}

/// Replaces the system-wide `MachineGuid`. Windows only.
///
/// Unless `skip_backup_check` is set, the current id must already be stored
/// in some backup; otherwise nothing is changed.
pub fn reset_environment(
    platform: &dyn Platform,
    registry: &BackupRegistry<'_>,
    session_cache: &Path,
    skip_backup_check: bool,
) -> Result<ResetResult, Interrupted<ResetResult>> {
    let mut result = ResetResult::default();
    if platform.kind() != PlatformKind::Windows {
        return Err(Interrupted::new(result, ManagerError::NotWindows));
    }

    result.old_machine_id = match raw_identifier(platform) {
        Ok(id) => id,
        Err(err) => return Err(Interrupted::new(result, err)),
    };

    if skip_backup_check {
        tracing::warn!("skipping backup check before machine id reset");
    } else {
        match registry.find_by_machine_id(&result.old_machine_id) {
            Ok(Some(name)) => tracing::debug!(backup = %name, "current machine id is backed up"),
            Ok(None) => {
                let err = ManagerError::BackupRequired(result.old_machine_id.clone());
                return Err(Interrupted::new(result, err));
            }
            Err(err) => return Err(Interrupted::new(result, err)),
        }
    }

    if let Err(err) = clear_session_cache(session_cache) {
        return Err(Interrupted::new(result, err));
    }
    result.cache_cleared = true;

    result.new_machine_id = generate_machine_id();
    if let Err(err) = platform.set_system_identifier(&result.new_machine_id) {
        return Err(Interrupted::new(result, err));
    }
    result.machine_id_changed = true;
    tracing::info!(
        old = %result.old_machine_id,
        new = %result.new_machine_id,
        "replaced system machine id"
    );
    Ok(result)
}
