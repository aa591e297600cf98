//! Settings backup and restore.
//!
//! Flashing some keyboards wipes their EEPROM: keymaps, colors, macros. The
//! [`SettingsBackup`] seam captures those settings before the reset and can
//! re-apply them afterwards. [`FocusBackup`] does it over Focus by reading
//! each settings command and writing the value back as an argument.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceHandle, DeviceIdentity};
use crate::error::{BackupError, RestoreError, Result};
use crate::family::FamilyProfile;

/// Captured settings of one keyboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    /// Keyboard the settings came from.
    pub identity: DeviceIdentity,
    /// Capture time, seconds since the Unix epoch.
    pub taken_at: u64,
    /// Settings command to value.
    pub entries: BTreeMap<String, String>,
}

impl BackupSnapshot {
    /// Empty snapshot stamped with the current time.
    pub fn new(identity: DeviceIdentity) -> Self {
        let taken_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            identity,
            taken_at,
            entries: BTreeMap::new(),
        }
    }

    /// Number of captured settings.
    pub fn len(&self) -> usize {
        self.entries
            .len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.entries
            .is_empty()
    }
}

/// Backup/restore collaborator used by update sessions.
pub trait SettingsBackup: Send + Sync {
    /// Capture settings from a device in normal mode.
    fn backup(&self, device: &mut dyn DeviceHandle) -> std::result::Result<BackupSnapshot, BackupError>;

    /// Re-apply a snapshot. Best-effort.
    fn restore(
        &self,
        device: &mut dyn DeviceHandle,
        snapshot: &BackupSnapshot,
    ) -> std::result::Result<(), RestoreError>;
}

/// Focus-based settings backup.
#[derive(Debug, Clone, Default)]
pub struct FocusBackup {
    commands: Option<Vec<String>>,
    persist_dir: Option<PathBuf>,
}

impl FocusBackup {
    /// Back up whatever settings the device's family lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Back up a fixed command list regardless of family.
    #[must_use]
    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = Some(
            commands
                .into_iter()
                .map(Into::into)
                .collect(),
        );
        self
    }

    /// Also write every snapshot as JSON into `dir`.
    #[must_use]
    pub fn with_persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(dir.into());
        self
    }

    fn commands_for(&self, identity: &DeviceIdentity) -> Vec<String> {
        match &self.commands {
            Some(commands) => commands.clone(),
            None => FamilyProfile::for_identity(identity)
                .settings_commands
                .iter()
                .map(|c| (*c).to_string())
                .collect(),
        }
    }

    /// File name a snapshot is persisted under.
    pub fn file_name(snapshot: &BackupSnapshot) -> String {
        format!(
            "{}-{}-{}.json",
            snapshot
                .identity
                .vendor
                .replace(['/', '\\'], ""),
            snapshot
                .identity
                .product
                .replace(['/', '\\'], ""),
            snapshot.taken_at
        )
    }

    /// Write a snapshot as pretty JSON.
    pub fn save(snapshot: &BackupSnapshot, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Read a snapshot written by [`FocusBackup::save`].
    pub fn load(path: &Path) -> Result<BackupSnapshot> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl SettingsBackup for FocusBackup {
    fn backup(&self, device: &mut dyn DeviceHandle) -> std::result::Result<BackupSnapshot, BackupError> {
        let identity = device.identity();
        let mut snapshot = BackupSnapshot::new(identity.clone());

        for command in self.commands_for(&identity) {
            let value = device
                .send_command(&command)
                .map_err(|source| BackupError::Command {
                    command: command.clone(),
                    source,
                })?;
            if value.is_empty() {
                debug!("`{command}` returned nothing, skipping");
                continue;
            }
            snapshot
                .entries
                .insert(command, single_line(&value));
        }
        info!("Backed up {} settings from {identity}", snapshot.len());

        if let Some(dir) = &self.persist_dir {
            let path = dir.join(Self::file_name(&snapshot));
            Self::save(&snapshot, &path).map_err(|e| BackupError::Persist(e.to_string()))?;
            info!("Saved settings backup to {}", path.display());
        }

        Ok(snapshot)
    }

    fn restore(
        &self,
        device: &mut dyn DeviceHandle,
        snapshot: &BackupSnapshot,
    ) -> std::result::Result<(), RestoreError> {
        let actual = device.identity();
        if actual != snapshot.identity {
            return Err(RestoreError::IdentityMismatch {
                expected: snapshot
                    .identity
                    .clone(),
                actual,
            });
        }

        for (command, value) in &snapshot.entries {
            let line = format!("{command} {}", single_line(value));
            if let Err(source) = device.send_command(&line) {
                warn!("Restoring `{command}` failed: {source}");
                return Err(RestoreError::Command {
                    command: command.clone(),
                    source,
                });
            }
        }
        info!("Restored {} settings to {actual}", snapshot.len());
        Ok(())
    }
}

/// Focus arguments are whitespace separated, so a multi-line reply is the
/// same value on one line.
fn single_line(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
