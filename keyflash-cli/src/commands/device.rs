//! Device listing, version and firmware source commands.

use {
    crate::{
        Cli, CliError,
        config::Config,
        serial::{self, SerialOptions},
    },
    anyhow::Result,
    console::style,
    keyflash::{
        DetectedDevice, DeviceHandle, DeviceMode, FamilyProfile, FirmwareResolver, SourceKind,
        auto_detect_device, detect_devices, query_device_version,
    },
    log::debug,
};

fn device_json(device: &DetectedDevice) -> serde_json::Value {
    serde_json::json!({
        "name": device.name,
        "family": device.family.map(|f| f.name),
        "mode": device.mode.map(|m| m.to_string()),
        "vid": device.vid,
        "pid": device.pid,
        "manufacturer": device.manufacturer,
        "product": device.product,
        "serial": device.serial,
    })
}

/// List devices command implementation.
pub(crate) fn cmd_list_devices(json: bool) -> Result<()> {
    let detected = detect_devices();

    if json {
        let devices: Vec<serde_json::Value> = detected
            .iter()
            .map(device_json)
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "devices": devices,
            }
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output)?
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Serial ports")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for device in &detected {
        let family = match (device.family, device.mode) {
            (Some(family), Some(mode)) => format!(" [{}]", style(format!("{family}, {mode}")).yellow()),
            _ => String::new(),
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (device.vid, device.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = device
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(&device.name).cyan(),
            family,
            vid_pid,
            product
        );
    }

    if let Ok(keyboard) = auto_detect_device() {
        eprintln!(
            "\n{} Auto-detected keyboard: {}",
            style("→")
                .green()
                .bold(),
            style(&keyboard.name)
                .cyan()
                .bold()
        );
    }

    Ok(())
}

/// Version command implementation.
pub(crate) fn cmd_version(cli: &Cli, config: &Config) -> Result<()> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    let keyboard = serial::select_keyboard(&options, config)?;
    if keyboard.mode == DeviceMode::Bootloader {
        return Err(CliError::Usage(format!(
            "{} on {} is in its bootloader and cannot report a version",
            keyboard.family, keyboard.port
        ))
        .into());
    }

    let mut device = keyboard.open()?;
    let version = query_device_version(&mut device);
    if let Err(e) = device.close() {
        debug!("Closing {}: {e}", keyboard.port);
    }
    let version = version?;

    // Machine-readable on stdout, decoration on stderr
    println!("{version}");
    if !cli.quiet {
        eprintln!(
            "{} {} on {}",
            style("✓").green(),
            keyboard.family,
            keyboard.port
        );
    }
    Ok(())
}

/// Which sources can be offered for a family, in display order.
fn source_rows(resolver: &FirmwareResolver, family: &FamilyProfile) -> Vec<(SourceKind, bool)> {
    let available = resolver.available_sources(&family.identity());
    [SourceKind::Default, SourceKind::Experimental, SourceKind::Custom]
        .into_iter()
        .map(|kind| (kind, available.contains(&kind)))
        .collect()
}

/// Sources command implementation.
pub(crate) fn cmd_sources(
    cli: &Cli,
    config: &Config,
    family_name: Option<&str>,
    json: bool,
) -> Result<()> {
    let family = match family_name {
        Some(name) => FamilyProfile::from_name(name).ok_or_else(|| {
            CliError::Usage(format!(
                "Unknown keyboard family '{name}' (expected raise or model01)"
            ))
        })?,
        None => {
            let options = SerialOptions {
                port: cli.port.clone(),
                non_interactive: cli.non_interactive,
            };
            serial::select_keyboard(&options, config)?.family
        },
    };

    let resolver = FirmwareResolver::new(config.firmware_dir(cli.firmware_dir.as_deref()));
    let rows = source_rows(&resolver, family);

    if json {
        let sources: Vec<serde_json::Value> = rows
            .iter()
            .map(|(kind, available)| {
                serde_json::json!({
                    "kind": kind,
                    "available": available,
                    "path": resolver
                        .bundled_path(*kind, &family.identity())
                        .map(|p| p.display().to_string()),
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "family": family.name,
                "firmware_dir": resolver.root().display().to_string(),
                "sources": sources,
            }
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output)?
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style(format!("Firmware sources for {family}"))
            .bold()
            .underlined()
    );
    for (kind, available) in rows {
        let mark = if available {
            style("✓").green()
        } else {
            style("✗").red()
        };
        eprintln!("  {mark} {kind}");
    }
    Ok(())
}
