//! Error types for keyflash.
//!
//! [`Error`] covers the native plumbing (serial ports, image files, snapshot
//! files). The remaining types describe how an update session can fail and
//! are all `Clone` so they can travel inside session events.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::device::{DeviceIdentity, DeviceMode};
use crate::firmware::SourceKind;
use crate::session::Phase;

/// Result type for keyflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for keyflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed Intel HEX record.
    #[error("Invalid HEX image (line {line}): {reason}")]
    InvalidHex {
        /// 1-based line number of the offending record, 0 for whole-image problems.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Intel HEX record checksum mismatch.
    #[error("HEX checksum mismatch on line {line}: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// 1-based line number of the offending record, 0 for whole-image problems.
        line: usize,
        /// Checksum computed from the record bytes.
        expected: u8,
        /// Checksum stored in the record.
        actual: u8,
    },

    /// Settings snapshot could not be encoded or decoded.
    #[error("Snapshot format error: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No matching keyboard was found.
    #[error("Keyboard not found")]
    DeviceNotFound,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported keyboard family or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure of a single command sent through a device handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Transport-level failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The device did not answer in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The handle was already closed or consumed.
    #[error("device handle is closed")]
    Closed,

    /// The device is in a mode that does not accept commands.
    #[error("commands are not accepted in {0} mode")]
    WrongMode(DeviceMode),

    /// The reply could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<io::Error> for CommandError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            Self::Timeout(err.to_string())
        } else {
            Self::Io(err.to_string())
        }
    }
}

impl From<Error> for CommandError {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e.into(),
            Error::Timeout(msg) => Self::Timeout(msg),
            Error::Protocol(msg) => Self::Protocol(msg),
            other => Self::Io(other.to_string()),
        }
    }
}

/// The requested firmware source cannot be used.
///
/// Never fatal: a presentation layer hides the source and the user picks
/// another one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// No image exists for this source and device.
    #[error("no {kind} firmware image at {}", path.display())]
    NotFound {
        /// Source that was requested.
        kind: SourceKind,
        /// Path that was probed.
        path: PathBuf,
    },

    /// The image exists but cannot be opened for reading.
    #[error("firmware image {} is not readable: {reason}", path.display())]
    Unreadable {
        /// Path that was probed.
        path: PathBuf,
        /// Operating system error text.
        reason: String,
    },
}

/// Settings backup failed. Raised before any reset, so the device is untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackupError {
    /// A settings query failed.
    #[error("backing up `{command}` failed: {source}")]
    Command {
        /// Settings command that failed.
        command: String,
        /// Underlying command failure.
        source: CommandError,
    },

    /// The snapshot could not be written to disk.
    #[error("could not persist settings snapshot: {0}")]
    Persist(String),
}

/// Settings restoration failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RestoreError {
    /// The snapshot belongs to another keyboard.
    #[error("snapshot was taken from {expected}, not {actual}")]
    IdentityMismatch {
        /// Identity recorded in the snapshot.
        expected: DeviceIdentity,
        /// Identity of the connected device.
        actual: DeviceIdentity,
    },

    /// Re-applying a setting failed.
    #[error("restoring `{command}` failed: {source}")]
    Command {
        /// Settings command that failed.
        command: String,
        /// Underlying command failure.
        source: CommandError,
    },
}

/// The image writer could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The image file could not be read.
    #[error("cannot read firmware image {}: {reason}", path.display())]
    ImageUnreadable {
        /// Image path.
        path: PathBuf,
        /// Operating system error text.
        reason: String,
    },

    /// The image file is not a valid image.
    #[error("invalid firmware image: {0}")]
    InvalidImage(String),

    /// The handle offers no byte-level transport.
    #[error("device handle has no raw transport")]
    NoTransport,

    /// The bootloader rejected or garbled the transfer.
    #[error("bootloader error: {0}")]
    Device(String),

    /// The write stopped before the image was complete.
    #[error("write aborted: {0}")]
    Aborted(String),
}

/// Discovery could not produce a handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// Nothing matching showed up before the deadline.
    #[error("{identity} did not appear in {mode} mode within {waited:?}")]
    NotFound {
        /// Device that was looked for.
        identity: DeviceIdentity,
        /// Mode it was expected in.
        mode: DeviceMode,
        /// How long discovery waited.
        waited: Duration,
    },

    /// The device family cannot be discovered by this implementation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// The bootloader transition could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// A reset was already sent for this session.
    #[error("a bootloader transition is already in progress")]
    InProgress,

    /// The family needs a settings snapshot before it may be reset.
    #[error("settings must be backed up before resetting this keyboard")]
    BackupRequired,

    /// Sending the reset failed.
    #[error("reset to bootloader failed: {0}")]
    ResetFailed(CommandError),
}

/// A session could not be started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    /// Another session owns this device.
    #[error("an update session is already active for {0}")]
    SessionAlreadyActive(DeviceIdentity),

    /// The firmware source did not resolve.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// A cancellation request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelError {
    /// The session already committed to resetting the device.
    #[error("too late to cancel: the device is already being reset")]
    TooLate,

    /// The session has already ended.
    #[error("no active session to cancel")]
    NotActive,
}

/// What the user should do after a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Nothing changed on the device.
    None,
    /// Retry the update; the bootloader is still reachable.
    Reflash,
    /// Put the keyboard into its bootloader by hand and retry.
    ManualBootloaderEntry,
    /// The keyboard may not boot.
    ContactSupport,
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// Backup failed; no reset was sent.
    #[error("settings backup failed: {0}")]
    Backup(BackupError),

    /// A reset had already been issued.
    #[error("a bootloader transition is already in progress")]
    TransitionInProgress,

    /// Reset was refused because no snapshot exists.
    #[error("settings must be backed up before resetting this keyboard")]
    BackupRequired,

    /// The reset could not be sent.
    #[error("reset to bootloader failed: {0}")]
    ResetFailed(CommandError),

    /// The device never came back in bootloader mode.
    #[error("device not re-acquired: {0}")]
    DeviceNotReacquired(DiscoveryError),

    /// The image writer reported an error.
    #[error("firmware write failed: {0}")]
    Write(WriteError),

    /// The image writer did not finish in time.
    #[error("firmware write did not finish within {0:?}")]
    WriteTimeout(Duration),

    /// Post-flash confirmation failed.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// The session stopped for an internal reason.
    #[error("session aborted: {0}")]
    Aborted(String),
}

impl FailureReason {
    /// Phase the session was in when it failed.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Backup(_) => Phase::AwaitingUserAction,
            Self::TransitionInProgress
            | Self::BackupRequired
            | Self::ResetFailed(_)
            | Self::DeviceNotReacquired(_) => Phase::Transitioning,
            Self::Write(_) | Self::WriteTimeout(_) | Self::Aborted(_) => Phase::Flashing,
            Self::VerificationFailed(_) => Phase::Verifying,
        }
    }

    /// Whether the device may be left in neither the old nor the new firmware.
    pub fn device_state_uncertain(&self) -> bool {
        !matches!(self, Self::Backup(_) | Self::BackupRequired)
    }

    /// Suggested recovery action.
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            Self::Backup(_) | Self::BackupRequired => RecoveryHint::None,
            Self::TransitionInProgress | Self::ResetFailed(_) | Self::DeviceNotReacquired(_) => {
                RecoveryHint::ManualBootloaderEntry
            },
            Self::Write(WriteError::ImageUnreadable { .. } | WriteError::InvalidImage(_)) => {
                RecoveryHint::Reflash
            },
            Self::Write(_) | Self::WriteTimeout(_) | Self::Aborted(_) => {
                RecoveryHint::ManualBootloaderEntry
            },
            Self::VerificationFailed(_) => RecoveryHint::ContactSupport,
        }
    }
}
