//! Flash command implementation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use keyflash::{
    CancelError, Collaborators, FailureReason, FirmwareResolver, FirmwareSource, FocusBackup,
    NativeDiscovery, Outcome, Phase, RecoveryHint, SessionEvent, StartError, Updater, writer_for,
};
use keyflash::firmware::validate_custom;
use log::debug;

use crate::config::Config;
use crate::serial::{self, SerialOptions};
use crate::{Cli, CliError, use_fancy_output};

/// Firmware source from the `flash` flags.
pub(crate) fn source_from_args(experimental: bool, custom: Option<&PathBuf>) -> FirmwareSource {
    match custom {
        Some(path) => FirmwareSource::Custom(path.clone()),
        None if experimental => FirmwareSource::Experimental,
        None => FirmwareSource::Default,
    }
}

/// What to tell the user after a failed update.
fn recovery_text(hint: RecoveryHint) -> &'static str {
    match hint {
        RecoveryHint::None => "The keyboard was not changed.",
        RecoveryHint::Reflash => "The keyboard is still in its bootloader. Run the update again.",
        RecoveryHint::ManualBootloaderEntry => {
            "Put the keyboard into its bootloader by hand (hold the bootloader key while \
             plugging it in), then run the update again."
        },
        RecoveryHint::ContactSupport => {
            "The new firmware did not come up. If the keyboard stays unresponsive, contact \
             the vendor's support."
        },
    }
}

fn failure_error(reason: &FailureReason) -> anyhow::Error {
    CliError::Failed(format!(
        "Update failed during {}: {reason}\n{}",
        reason.phase(),
        recovery_text(reason.recovery_hint())
    ))
    .into()
}

fn start_error(err: StartError) -> anyhow::Error {
    match err {
        StartError::SessionAlreadyActive(_) => CliError::Failed(err.to_string()).into(),
        StartError::Resolution(_) => CliError::Usage(err.to_string()).into(),
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    source: FirmwareSource,
    yes: bool,
    no_verify: bool,
) -> Result<()> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    let keyboard = serial::select_keyboard(&options, config)?;
    let family = keyboard.family;
    let updater_config = config.updater_config(no_verify);

    if let FirmwareSource::Custom(path) = &source {
        validate_custom(path).map_err(|e| CliError::Usage(e.to_string()))?;
    }

    let resolver = FirmwareResolver::new(config.firmware_dir(cli.firmware_dir.as_deref()));
    // Resolve up front so a missing image is reported before any prompt
    let locator = resolver
        .resolve(&source, &family.identity())
        .map_err(|e| CliError::Usage(e.to_string()))?;

    if !cli.quiet {
        eprintln!(
            "{} {} on {} ({} mode)",
            style("⌨").cyan(),
            family,
            keyboard.port,
            keyboard.mode
        );
        eprintln!(
            "{} Firmware: {} ({})",
            style("📦").cyan(),
            locator.path.display(),
            locator.kind
        );
    }

    if !yes {
        if cli.non_interactive {
            return Err(serial::usage_err(
                "Confirmation required. Pass --yes to update without prompting.",
            ));
        }
        if !serial::confirm("Update the keyboard firmware?", true)? {
            return Err(CliError::Cancelled("Update cancelled".to_string()).into());
        }
    }

    let writer = writer_for(family, config.readback(no_verify))?;
    let backup = FocusBackup::new().with_persist_dir(config.backup_dir());
    let collaborators =
        Collaborators::new(Arc::new(NativeDiscovery::new()), writer, Arc::new(backup));
    let updater = Updater::new(resolver, collaborators).with_config(updater_config);

    let device = keyboard.open()?;
    let session = updater
        .start_session(Box::new(device), source)
        .map_err(|rejected| start_error(rejected.error))?;

    let canceller = session.canceller();
    ctrlc::set_handler(move || match canceller.cancel() {
        Ok(()) => eprintln!("\n{} Cancelling...", style("⚠").yellow()),
        Err(CancelError::TooLate) => eprintln!(
            "\n{} Too late to cancel: the keyboard is already being reset or written.",
            style("⚠").yellow()
        ),
        Err(CancelError::NotActive) => {},
    })
    .context("Failed to install Ctrl-C handler")?;

    let pb = progress_bar(cli.quiet);
    for event in session.events() {
        debug!("Session event: {event:?}");
        match event {
            SessionEvent::Phase(Phase::AwaitingUserAction) => {
                if !family
                    .gesture_instructions
                    .is_empty()
                {
                    eprintln!(
                        "{} {}",
                        style("👉").yellow(),
                        style(family.gesture_instructions).bold()
                    );
                }
            },
            SessionEvent::Phase(Phase::Transitioning) if !cli.quiet => {
                eprintln!("{} Resetting into the bootloader...", style("🔄").cyan());
            },
            SessionEvent::Phase(Phase::Flashing) if !cli.quiet => {
                pb.set_message("Writing firmware");
            },
            SessionEvent::Phase(Phase::Verifying) => {
                pb.finish_with_message("Written");
                if !cli.quiet {
                    eprintln!("{} Waiting for the keyboard to restart...", style("⏳").yellow());
                }
            },
            SessionEvent::Countdown(n) => {
                eprintln!("  {}", style(n).bold().yellow());
            },
            SessionEvent::Progress { written, total } => {
                if total > 0 {
                    pb.set_position((written * 100 / total) as u64);
                }
            },
            SessionEvent::FirmwareVersion(version) if !cli.quiet => {
                eprintln!("{} Keyboard reports firmware {version}", style("✓").green());
            },
            SessionEvent::Warning(message) => {
                eprintln!("{} {message}", style("⚠").yellow());
            },
            SessionEvent::Finished(_) => {
                if !pb.is_finished() {
                    pb.finish_and_clear();
                }
            },
            _ => {},
        }
    }

    let report = session.wait();
    if let Some(mut device) = report.device {
        if let Err(e) = device.close() {
            debug!("Closing {}: {e}", device.port_name());
        }
    }

    match report.outcome {
        Outcome::Succeeded => {
            if !cli.quiet {
                eprintln!(
                    "\n{} {}",
                    style("🎉").green().bold(),
                    style("Firmware updated").green().bold()
                );
            }
            Ok(())
        },
        Outcome::Failed(reason) => Err(failure_error(&reason)),
        Outcome::Cancelled => Err(CliError::Cancelled("Update cancelled".to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyflash::{DeviceIdentity, ResolutionError, WriteError};
    use std::time::Duration;

    #[test]
    fn test_source_from_args() {
        assert_eq!(source_from_args(false, None), FirmwareSource::Default);
        assert_eq!(source_from_args(true, None), FirmwareSource::Experimental);

        let path = PathBuf::from("fw.hex");
        assert_eq!(
            source_from_args(false, Some(&path)),
            FirmwareSource::Custom(path.clone())
        );
    }

    #[test]
    fn test_failure_error_is_failed_with_hint() {
        let err = failure_error(&FailureReason::WriteTimeout(Duration::from_secs(120)));
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Failed(_))));
        let text = err.to_string();
        assert!(text.contains("flashing"));
        assert!(text.contains("bootloader by hand"));
    }

    #[test]
    fn test_unreadable_image_suggests_reflash() {
        let reason = FailureReason::Write(WriteError::InvalidImage("bad record".to_string()));
        assert!(
            failure_error(&reason)
                .to_string()
                .contains("Run the update again")
        );
    }

    #[test]
    fn test_start_error_classes() {
        let busy = start_error(StartError::SessionAlreadyActive(DeviceIdentity::new(
            "Dygma", "Raise",
        )));
        assert!(matches!(busy.downcast_ref::<CliError>(), Some(CliError::Failed(_))));

        let missing = start_error(StartError::Resolution(ResolutionError::NotFound {
            kind: keyflash::SourceKind::Default,
            path: PathBuf::from("/nowhere/default.hex"),
        }));
        assert!(matches!(missing.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_recovery_text_for_every_hint() {
        for hint in [
            RecoveryHint::None,
            RecoveryHint::Reflash,
            RecoveryHint::ManualBootloaderEntry,
            RecoveryHint::ContactSupport,
        ] {
            assert!(!recovery_text(hint).is_empty());
        }
    }
}
