//! # keyflash
//!
//! Firmware updates for USB programmable keyboards.
//!
//! This crate drives a keyboard from its normal firmware into its bootloader
//! and through an image write, including:
//!
//! - Firmware source resolution (bundled default/experimental or a custom file)
//! - Settings backup and best-effort restore over the Focus serial protocol
//! - A countdown that lines the reset up with a key held by the user
//! - Re-acquiring the keyboard after it re-enumerates on a new port
//! - Intel HEX parsing and an AVR109 (Caterina) image writer
//!
//! ## Supported Keyboards
//!
//! - Keyboardio Model01 (AVR109 bootloader)
//! - Dygma Raise (sessions and backups; bootloader writing coming soon)
//!
//! ## Features
//!
//! - `native` (default): serial ports through the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use keyflash::{
//!     Collaborators, FamilyProfile, FirmwareResolver, FirmwareSource, FocusBackup,
//!     SessionEvent, Updater, writer_for,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         use keyflash::{NativeDiscovery, auto_detect_device, open_device};
//!
//!         let found = auto_detect_device()?;
//!         let (Some(family), Some(mode)) = (found.family, found.mode) else {
//!             return Ok(());
//!         };
//!         let device = open_device(&found.name, family.identity(), mode)?;
//!
//!         let collaborators = Collaborators::new(
//!             Arc::new(NativeDiscovery::new()),
//!             writer_for(family, true)?,
//!             Arc::new(FocusBackup::new()),
//!         );
//!         let updater = Updater::new(FirmwareResolver::new("firmware"), collaborators);
//!
//!         let session = updater
//!             .start_session(Box::new(device), FirmwareSource::Default)
//!             .map_err(|rejected| rejected.error)?;
//!         for event in session.events() {
//!             if let SessionEvent::Countdown(n) = event {
//!                 println!("{n}");
//!             }
//!         }
//!         println!("{}", session.wait().outcome);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod clock;
pub mod countdown;
pub mod device;
pub mod error;
pub mod family;
pub mod firmware;
pub mod image;
pub mod port;
pub mod session;
pub mod transition;
pub mod writer;

// Native-specific re-exports
#[cfg(feature = "native")]
pub use device::{NativeDiscovery, auto_detect_device, find_device_by_port, open_device};
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    backup::{BackupSnapshot, FocusBackup, SettingsBackup},
    clock::{Clock, SimulatedClock, SystemClock},
    countdown::{CountdownGate, GateResult, GateState, GateTick, run_countdown},
    device::{
        DetectedDevice, DeviceDiscovery, DeviceHandle, DeviceIdentity, DeviceMode, SerialDevice,
        VersionTriple, detect_devices, detect_keyboards, format_device_list, query_device_version,
    },
    error::{
        BackupError, CancelError, CommandError, DiscoveryError, Error, FailureReason,
        RecoveryHint, ResolutionError, RestoreError, Result, StartError, TransitionError,
        WriteError,
    },
    family::{BootloaderProtocol, FamilyProfile},
    firmware::{FirmwareLocator, FirmwareResolver, FirmwareSource, SourceKind},
    image::{HexImage, HexSegment},
    port::{Port, SerialConfig},
    session::{
        Canceller, Collaborators, Outcome, Phase, Rejected, SessionEvent, SessionHandle,
        SessionReport, Updater, UpdaterConfig,
    },
    transition::{BootloaderTransition, TransitionFailure, TransitionOutcome},
    writer::{Avr109Writer, ImageWriter, writer_for},
};
