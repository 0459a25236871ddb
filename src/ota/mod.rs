//! Over-the-air upgrade boundary
//!
//! Binary download and flashing live elsewhere; the core only asks for
//! version checks and triggers the apply routine after quiescing audio.

use crate::error::OtaError;

/// An available firmware upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVersion {
    pub version: String,
    pub url: String,
}

/// Upgrade mechanics collaborator
pub trait OtaUpdater: Send + Sync {
    /// Ask the update server whether a newer firmware exists
    fn check_new_version(&self) -> Result<Option<NewVersion>, OtaError>;

    /// Confirm the running image after a successful boot so the
    /// bootloader stops considering a rollback
    fn mark_current_version_valid(&self);

    /// Download and flash the upgrade. On success the device reboots and
    /// this never returns; returning `Ok` is reserved for hosts where
    /// reboot is simulated.
    fn upgrade(&self, version: &NewVersion) -> Result<(), OtaError>;
}

/// Updater that never finds anything, for hosts without an update server
#[derive(Debug, Default)]
pub struct DisabledOta;

impl OtaUpdater for DisabledOta {
    fn check_new_version(&self) -> Result<Option<NewVersion>, OtaError> {
        Ok(None)
    }

    fn mark_current_version_valid(&self) {}

    fn upgrade(&self, _version: &NewVersion) -> Result<(), OtaError> {
        Err(OtaError::CheckFailed("updates disabled".to_string()))
    }
}
