//! Settings backup and restore commands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::style;
use keyflash::{DeviceHandle, DeviceMode, FamilyProfile, FocusBackup, SettingsBackup};
use log::debug;

use crate::config::Config;
use crate::serial::{self, SelectedKeyboard, SerialOptions};
use crate::{Cli, CliError};

fn select_normal_mode(cli: &Cli, config: &Config) -> Result<SelectedKeyboard> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    let keyboard = serial::select_keyboard(&options, config)?;
    if keyboard.mode != DeviceMode::Normal {
        return Err(CliError::Usage(format!(
            "{} on {} is in its bootloader; settings are only reachable while the firmware runs",
            keyboard.family, keyboard.port
        ))
        .into());
    }
    if keyboard
        .family
        .settings_commands
        .is_empty()
    {
        return Err(CliError::Usage(format!(
            "{} keeps no settings that keyflash can back up",
            keyboard.family
        ))
        .into());
    }
    Ok(keyboard)
}

/// Backup command implementation.
pub(crate) fn cmd_backup(cli: &Cli, config: &Config, output: Option<&PathBuf>) -> Result<()> {
    let keyboard = select_normal_mode(cli, config)?;
    let mut device = keyboard.open()?;

    let snapshot = FocusBackup::new().backup(&mut device);
    if let Err(e) = device.close() {
        debug!("Closing {}: {e}", keyboard.port);
    }
    let snapshot = snapshot?;

    let path = output
        .cloned()
        .unwrap_or_else(|| config.backup_dir().join(FocusBackup::file_name(&snapshot)));
    FocusBackup::save(&snapshot, &path)
        .with_context(|| format!("Failed to write backup {}", path.display()))?;

    // Path on stdout so scripts can pick it up
    println!("{}", path.display());
    if !cli.quiet {
        eprintln!(
            "{} Saved {} settings from {}",
            style("✓").green(),
            snapshot.len(),
            keyboard.family
        );
    }
    Ok(())
}

/// Restore command implementation.
pub(crate) fn cmd_restore(cli: &Cli, config: &Config, file: &Path) -> Result<()> {
    let snapshot = FocusBackup::load(file)
        .with_context(|| format!("Failed to read backup {}", file.display()))?;

    let keyboard = select_normal_mode(cli, config)?;
    if FamilyProfile::known(&snapshot.identity) != Some(keyboard.family) {
        return Err(CliError::Usage(format!(
            "Backup was taken from {}, but the selected keyboard is {}",
            snapshot.identity, keyboard.family
        ))
        .into());
    }

    let mut device = keyboard.open()?;
    let result = FocusBackup::new().restore(&mut device, &snapshot);
    if let Err(e) = device.close() {
        debug!("Closing {}: {e}", keyboard.port);
    }
    result?;

    if !cli.quiet {
        eprintln!(
            "{} Restored {} settings to {}",
            style("✓").green(),
            snapshot.len(),
            keyboard.family
        );
    }
    Ok(())
}
