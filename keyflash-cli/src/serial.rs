//! Keyboard port selection.
//!
//! Picks the serial port of the keyboard to talk to:
//! - An explicit `--port` (or `[device] port` from config) always wins
//! - A single detected keyboard is selected automatically
//! - Several keyboards prompt via dialoguer, or fail in non-interactive mode

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    keyflash::{
        DetectedDevice, DeviceMode, FamilyProfile, NativePort, SerialDevice, detect_keyboards,
        find_device_by_port, format_device_list, open_device,
    },
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for keyboard selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if several keyboards are connected).
    pub non_interactive: bool,
}

/// A selected keyboard whose family and mode are known.
pub struct SelectedKeyboard {
    /// Port the keyboard was found on.
    pub port: String,
    /// Keyboard family.
    pub family: &'static FamilyProfile,
    /// Whether it runs its firmware or its bootloader.
    pub mode: DeviceMode,
}

impl SelectedKeyboard {
    /// Open a Focus connection to the keyboard.
    pub fn open(&self) -> Result<SerialDevice<NativePort>> {
        debug!("Opening {} ({}, {})", self.port, self.family, self.mode);
        Ok(open_device(&self.port, self.family.identity(), self.mode)?)
    }
}

pub(crate) fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Select a keyboard port, prompting if needed.
pub fn select_device(options: &SerialOptions, config: &Config) -> Result<DetectedDevice> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config
        .device
        .port
    {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    choose_keyboard(detect_keyboards(), options.non_interactive)
}

/// Select a keyboard and require that it is one of the known families.
pub fn select_keyboard(options: &SerialOptions, config: &Config) -> Result<SelectedKeyboard> {
    let device = select_device(options, config)?;
    match (device.family, device.mode) {
        (Some(family), Some(mode)) => Ok(SelectedKeyboard {
            port: device.name,
            family,
            mode,
        }),
        _ => Err(usage_err(&format!(
            "{} is not a supported keyboard (use `keyflash list-devices` to see what was detected)",
            device.name
        ))),
    }
}

fn choose_keyboard(keyboards: Vec<DetectedDevice>, non_interactive: bool) -> Result<DetectedDevice> {
    match keyboards
        .len()
        .cmp(&1)
    {
        Ordering::Less => Err(usage_err(
            "No keyboard found. Connect one or pass --port.",
        )),
        Ordering::Equal => {
            let mut keyboards = keyboards;
            let keyboard = keyboards.remove(0);
            info!("Auto-selected keyboard: {}", keyboard.name);
            Ok(keyboard)
        },
        Ordering::Greater if non_interactive => Err(usage_err(
            "Several keyboards are connected. Pass --port to pick one.",
        )),
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_keyboard_interactive(keyboards)
        },
    }
}

pub(crate) fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Interactive prompt requires a terminal. Use --non-interactive with explicit options.",
        ))
    }
}

pub(crate) fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Cancelled".to_string()).into()
            } else {
                usage_err(&format!("Prompt failed: {io_err}"))
            }
        },
    }
}

/// Find a port by name, keeping the name even if it is not detected.
fn find_port_by_name(name: &str) -> DetectedDevice {
    find_device_by_port(name).unwrap_or_else(|| {
        debug!("{name} not among detected ports");
        DetectedDevice::plain(name)
    })
}

/// Truncate labels to fit the terminal width.
fn fit_to_terminal(labels: Vec<String>) -> Vec<String> {
    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    labels
        .into_iter()
        .map(|n| console::truncate_str(&n, max_item_width, "\u{2026}").into_owned())
        .collect()
}

fn select_keyboard_interactive(keyboards: Vec<DetectedDevice>) -> Result<DetectedDevice> {
    eprintln!(
        "{} Found {} keyboards",
        style("ℹ").blue(),
        keyboards.len()
    );

    let labels = fit_to_terminal(format_device_list(&keyboards));
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the keyboard to update")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => keyboards
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow::anyhow!("Invalid keyboard index: {index}")),
        None => Err(CliError::Cancelled("Keyboard selection cancelled".to_string()).into()),
    }
}

/// Ask a yes/no question; `default` is preselected.
pub fn confirm(prompt: &str, default: bool) -> Result<bool> {
    ensure_interactive_terminal()?;
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(default)
        .interact_opt()
        .map_err(map_prompt_error)?
        .ok_or_else(|| CliError::Cancelled("Cancelled".to_string()).into())
}
