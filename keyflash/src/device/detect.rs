//! Keyboard detection on USB serial ports.
//!
//! Ports are classified by USB VID/PID against the family table, which also
//! tells whether the keyboard is running its firmware or its bootloader.

use crate::device::DeviceMode;
use crate::family::FamilyProfile;

#[cfg(feature = "native")]
use {
    crate::error::{Error, Result},
    log::{debug, info, trace},
};

/// A serial port and what is known about the device behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedDevice {
    /// Port name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Keyboard family, if the USB IDs are known.
    pub family: Option<&'static FamilyProfile>,
    /// Mode implied by the USB product ID.
    pub mode: Option<DeviceMode>,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedDevice {
    /// Describe a port with no USB information.
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            family: None,
            mode: None,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Fill in USB IDs and classify them.
    #[must_use]
    pub fn with_usb(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        if let Some((family, mode)) = FamilyProfile::from_usb(vid, pid) {
            self.family = Some(family);
            self.mode = Some(mode);
        }
        self
    }

    /// Whether this port belongs to a known keyboard.
    pub fn is_keyboard(&self) -> bool {
        self.family
            .is_some()
    }
}

/// Detect all available serial ports with USB metadata.
#[cfg(feature = "native")]
pub fn detect_devices() -> Vec<DetectedDevice> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedDevice::plain(port_info.port_name.clone());

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected = detected.with_usb(usb_info.vid, usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, Family: {:?}, Mode: {:?})",
                        port_info.port_name,
                        usb_info.vid,
                        usb_info.pid,
                        detected.family.map(|f| f.name),
                        detected.mode
                    );
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Without native serial support there is nothing to enumerate.
#[cfg(not(feature = "native"))]
pub fn detect_devices() -> Vec<DetectedDevice> {
    Vec::new()
}

/// Detect ports that belong to known keyboards.
pub fn detect_keyboards() -> Vec<DetectedDevice> {
    detect_devices()
        .into_iter()
        .filter(DetectedDevice::is_keyboard)
        .collect()
}

/// Auto-detect a single keyboard, preferring one running its firmware.
#[cfg(feature = "native")]
pub fn auto_detect_device() -> Result<DetectedDevice> {
    let keyboards = detect_keyboards();

    if let Some(found) = keyboards
        .iter()
        .find(|d| d.mode == Some(DeviceMode::Normal))
    {
        info!("Auto-detected keyboard: {}", found.name);
        return Ok(found.clone());
    }

    if let Some(found) = keyboards.into_iter().next() {
        info!("Auto-detected keyboard in bootloader mode: {}", found.name);
        return Ok(found);
    }

    Err(Error::DeviceNotFound)
}

/// Find a detected port by exact name, case-insensitively on Windows names.
#[cfg(feature = "native")]
pub fn find_device_by_port(name: &str) -> Option<DetectedDevice> {
    let devices = detect_devices();

    if let Some(found) = devices
        .iter()
        .find(|d| d.name == name)
    {
        return Some(found.clone());
    }

    devices
        .into_iter()
        .find(|d| d.name.eq_ignore_ascii_case(name))
}

/// Format detected ports for display.
pub fn format_device_list(devices: &[DetectedDevice]) -> Vec<String> {
    let mut result = Vec::new();

    for device in devices {
        let device_info = match (device.family, device.mode, device.vid, device.pid) {
            (Some(family), Some(mode), _, _) => format!(" [{family}, {mode}]"),
            (_, _, Some(vid), Some(pid)) => format!(" [VID:{vid:04X} PID:{pid:04X}]"),
            _ => String::new(),
        };

        let product_info = device
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", device.name, device_info, product_info));
    }

    result
}
