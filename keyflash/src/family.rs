//! Keyboard family abstraction.
//!
//! Each supported family knows its USB IDs in both modes, whether resetting
//! it needs a physical key press from the user, whether flashing wipes its
//! settings, and which bootloader protocol it speaks.

use std::fmt;

use crate::device::{DeviceIdentity, DeviceMode};

/// Byte protocol spoken by a family's bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderProtocol {
    /// AVR109 / Caterina.
    Avr109,
    /// Vendor-specific protocol without a bundled writer.
    Vendor,
}

impl fmt::Display for BootloaderProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avr109 => write!(f, "AVR109"),
            Self::Vendor => write!(f, "vendor"),
        }
    }
}

/// Static description of a keyboard family.
#[derive(Debug, PartialEq, Eq)]
pub struct FamilyProfile {
    /// Short lowercase name, e.g. "raise".
    pub name: &'static str,
    /// Vendor part of the identity.
    pub vendor: &'static str,
    /// Product part of the identity.
    pub product: &'static str,
    /// USB vendor ID (`None` for the generic fallback).
    pub usb_vid: Option<u16>,
    /// USB product ID while running the application firmware.
    pub normal_pid: Option<u16>,
    /// USB product ID while in the bootloader.
    pub bootloader_pid: Option<u16>,
    /// The user must hold a key while the reset lands.
    pub requires_gesture: bool,
    /// Flashing erases settings, so they are backed up first.
    pub requires_backup: bool,
    /// Focus commands whose values make up a settings backup.
    pub settings_commands: &'static [&'static str],
    /// Bootloader protocol.
    pub bootloader: BootloaderProtocol,
    /// What to tell the user while the countdown runs.
    pub gesture_instructions: &'static str,
}

const RAISE_SETTINGS: &[&str] = &[
    "keymap.custom",
    "keymap.default",
    "keymap.onlyCustom",
    "settings.defaultLayer",
    "led.mode",
    "led.brightness",
    "led.brightnessUG",
    "led.fade",
    "idleleds.time_limit",
    "palette",
    "colormap.map",
    "macros.map",
    "superkeys.map",
    "superkeys.waittime",
    "superkeys.timeout",
    "superkeys.repeat",
    "superkeys.holdstart",
    "superkeys.overlap",
];

/// Dygma Raise.
pub static RAISE: FamilyProfile = FamilyProfile {
    name: "raise",
    vendor: "Dygma",
    product: "Raise",
    usb_vid: Some(0x1209),
    normal_pid: Some(0x2201),
    bootloader_pid: Some(0x2200),
    requires_gesture: true,
    requires_backup: true,
    settings_commands: RAISE_SETTINGS,
    bootloader: BootloaderProtocol::Vendor,
    gesture_instructions: "Press and hold the Escape key when the countdown reaches zero. \
                           Release it once the lights come back.",
};

/// Keyboardio Model 01.
pub static MODEL01: FamilyProfile = FamilyProfile {
    name: "model01",
    vendor: "Keyboardio",
    product: "Model01",
    usb_vid: Some(0x1209),
    normal_pid: Some(0x2301),
    bootloader_pid: Some(0x2300),
    requires_gesture: false,
    requires_backup: false,
    settings_commands: &[],
    bootloader: BootloaderProtocol::Avr109,
    gesture_instructions: "",
};

/// Fallback for keyboards not in the table.
pub static GENERIC: FamilyProfile = FamilyProfile {
    name: "generic",
    vendor: "",
    product: "",
    usb_vid: None,
    normal_pid: None,
    bootloader_pid: None,
    requires_gesture: false,
    requires_backup: false,
    settings_commands: &[],
    bootloader: BootloaderProtocol::Vendor,
    gesture_instructions: "",
};

/// All known families.
pub static FAMILIES: &[&FamilyProfile] = &[&RAISE, &MODEL01];

impl FamilyProfile {
    /// Identity of keyboards in this family.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.vendor, self.product)
    }

    /// Whether this is the generic fallback.
    pub fn is_generic(&self) -> bool {
        self.usb_vid.is_none()
    }

    /// Look up a known family by identity.
    pub fn known(identity: &DeviceIdentity) -> Option<&'static Self> {
        FAMILIES
            .iter()
            .copied()
            .find(|f| f.vendor == identity.vendor && f.product == identity.product)
    }

    /// Profile for an identity, falling back to [`GENERIC`].
    pub fn for_identity(identity: &DeviceIdentity) -> &'static Self {
        Self::known(identity).unwrap_or(&GENERIC)
    }

    /// Classify a USB VID/PID pair.
    pub fn from_usb(vid: u16, pid: u16) -> Option<(&'static Self, DeviceMode)> {
        FAMILIES
            .iter()
            .copied()
            .filter(|f| f.usb_vid == Some(vid))
            .find_map(|f| {
                if f.normal_pid == Some(pid) {
                    Some((f, DeviceMode::Normal))
                } else if f.bootloader_pid == Some(pid) {
                    Some((f, DeviceMode::Bootloader))
                } else {
                    None
                }
            })
    }

    /// Get a family from its short name.
    pub fn from_name(name: &str) -> Option<&'static Self> {
        match name.to_lowercase().as_str() {
            "raise" | "dygma" => Some(&RAISE),
            "model01" | "model-01" | "keyboardio" => Some(&MODEL01),
            _ => None,
        }
    }
}

impl fmt::Display for FamilyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_generic() {
            write!(f, "Generic")
        } else {
            write!(f, "{} {}", self.vendor, self.product)
        }
    }
}
