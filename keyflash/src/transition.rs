//! Bootloader transition.
//!
//! Gets a keyboard into its bootloader. A keyboard already there is handed
//! straight back; otherwise the reset is sent exactly once and the handle is
//! consumed, because the port goes away when the keyboard reboots. Finding
//! the keyboard again on its new port is left to the caller.

use std::fmt;

use log::{debug, info};

use crate::backup::BackupSnapshot;
use crate::device::{DeviceHandle, DeviceIdentity, DeviceMode};
use crate::error::TransitionError;

/// Result of a successful [`BootloaderTransition::enter`].
pub enum TransitionOutcome {
    /// Already in bootloader mode; use this handle.
    Ready(Box<dyn DeviceHandle>),
    /// Reset sent; the keyboard must be re-acquired.
    Pending {
        /// Keyboard that was reset.
        identity: DeviceIdentity,
        /// Port it was on before the reset.
        previous_port: String,
    },
}

impl fmt::Debug for TransitionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(device) => f
                .debug_tuple("Ready")
                .field(&device.port_name())
                .finish(),
            Self::Pending {
                identity,
                previous_port,
            } => f
                .debug_struct("Pending")
                .field("identity", identity)
                .field("previous_port", previous_port)
                .finish(),
        }
    }
}

/// A refused or failed transition.
///
/// `device` is handed back whenever the reset was not sent.
pub struct TransitionFailure {
    /// What went wrong.
    pub error: TransitionError,
    /// The untouched handle, if it still exists.
    pub device: Option<Box<dyn DeviceHandle>>,
}

impl fmt::Debug for TransitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionFailure")
            .field("error", &self.error)
            .field("device", &self.device.as_ref().map(|d| d.port_name().to_string()))
            .finish()
    }
}

/// One-shot transition controller, owned by a single session.
#[derive(Debug, Default)]
pub struct BootloaderTransition {
    reset_sent: bool,
}

impl BootloaderTransition {
    /// Create a controller that has not reset anything yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a reset was issued.
    pub fn reset_sent(&self) -> bool {
        self.reset_sent
    }

    /// Bring `device` into bootloader mode.
    pub fn enter(
        &mut self,
        device: Box<dyn DeviceHandle>,
        snapshot: Option<&BackupSnapshot>,
        requires_backup: bool,
    ) -> Result<TransitionOutcome, TransitionFailure> {
        if self.reset_sent {
            return Err(TransitionFailure {
                error: TransitionError::InProgress,
                device: Some(device),
            });
        }

        if device.mode() == DeviceMode::Bootloader {
            debug!("{} is already in bootloader mode", device.port_name());
            return Ok(TransitionOutcome::Ready(device));
        }

        if requires_backup && snapshot.is_none() {
            return Err(TransitionFailure {
                error: TransitionError::BackupRequired,
                device: Some(device),
            });
        }

        let identity = device.identity();
        let previous_port = device
            .port_name()
            .to_string();
        info!("Resetting {identity} on {previous_port} into bootloader mode");

        // Counts as sent even on error: the device may have received it
        self.reset_sent = true;
        device
            .reset_to_bootloader()
            .map_err(|e| TransitionFailure {
                error: TransitionError::ResetFailed(e),
                device: None,
            })?;

        Ok(TransitionOutcome::Pending {
            identity,
            previous_port,
        })
    }
}
