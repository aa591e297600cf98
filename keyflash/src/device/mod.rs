//! Keyboard device handles.
//!
//! A [`DeviceHandle`] is an open connection to one keyboard in one mode. It
//! never reconnects on its own: once the keyboard reboots into its bootloader
//! it shows up as a different port, and a [`DeviceDiscovery`] produces a new
//! handle for it.

pub mod detect;
pub mod focus;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CommandError, DiscoveryError};
use crate::port::Port;

pub use detect::{DetectedDevice, detect_devices, detect_keyboards, format_device_list};
#[cfg(feature = "native")]
pub use detect::{auto_detect_device, find_device_by_port};
pub use focus::SerialDevice;
#[cfg(feature = "native")]
pub use focus::{NativeDiscovery, open_device};

/// Firmware currently running on the keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    /// Application firmware; accepts Focus commands.
    Normal,
    /// Bootloader; accepts image writes only.
    Bootloader,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Bootloader => write!(f, "bootloader"),
        }
    }
}

/// Vendor and product of a keyboard.
///
/// Stable across re-enumeration, unlike the port name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Vendor name, e.g. "Dygma".
    pub vendor: String,
    /// Product name, e.g. "Raise".
    pub product: String,
}

impl DeviceIdentity {
    /// Create an identity from vendor and product names.
    pub fn new(vendor: impl Into<String>, product: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            product: product.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.vendor, self.product)
    }
}

/// An open connection to a keyboard.
pub trait DeviceHandle: Send {
    /// Mode the keyboard was in when this handle was opened.
    fn mode(&self) -> DeviceMode;

    /// Which keyboard this is.
    fn identity(&self) -> DeviceIdentity;

    /// Name of the port the handle is bound to.
    fn port_name(&self) -> &str;

    /// Send a text command and return its reply.
    fn send_command(&mut self, command: &str) -> Result<String, CommandError>;

    /// Release the connection so it can be re-opened elsewhere.
    fn close(&mut self) -> Result<(), CommandError>;

    /// Ask the keyboard to reboot into its bootloader.
    ///
    /// Consumes the handle: the port disappears with the reboot.
    fn reset_to_bootloader(self: Box<Self>) -> Result<(), CommandError>;

    /// Byte-level access for image writers.
    fn raw_port(&mut self) -> Option<&mut dyn Port>;
}

/// Produces handles for keyboards as they (re)appear.
pub trait DeviceDiscovery: Send + Sync {
    /// Wait up to `timeout` for `identity` to appear in `mode` and open it.
    fn discover(
        &self,
        identity: &DeviceIdentity,
        mode: DeviceMode,
        timeout: Duration,
    ) -> Result<Box<dyn DeviceHandle>, DiscoveryError>;
}

/// Version information reported by the `version` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTriple {
    /// Application (host software) version the firmware was built for.
    pub application: String,
    /// Kaleidoscope core version.
    pub kaleidoscope: Option<String>,
    /// Firmware build version.
    pub firmware: Option<String>,
}

impl VersionTriple {
    /// Parse a space-separated `version` reply.
    pub fn parse(reply: &str) -> Option<Self> {
        let mut parts = reply.split_whitespace();
        let application = parts.next()?.to_string();
        Some(Self {
            application,
            kaleidoscope: parts
                .next()
                .map(str::to_string),
            firmware: parts
                .next()
                .map(str::to_string),
        })
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.application)?;
        if let Some(kaleidoscope) = &self.kaleidoscope {
            write!(f, " (Kaleidoscope {kaleidoscope}")?;
            if let Some(firmware) = &self.firmware {
                write!(f, ", firmware {firmware}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Query the firmware version. Informational only.
pub fn query_device_version(device: &mut dyn DeviceHandle) -> Result<VersionTriple, CommandError> {
    let reply = device.send_command("version")?;
    VersionTriple::parse(&reply)
        .ok_or_else(|| CommandError::Protocol("empty reply to `version`".to_string()))
}
