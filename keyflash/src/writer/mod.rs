//! Image writers.
//!
//! An [`ImageWriter`] moves a firmware image into a keyboard that is already
//! in its bootloader. Which writer applies depends on the family's
//! bootloader protocol; see [`writer_for`].

pub mod avr109;

use std::sync::Arc;

use crate::device::DeviceHandle;
use crate::error::{Error, Result, WriteError};
use crate::family::{BootloaderProtocol, FamilyProfile};
use crate::firmware::FirmwareLocator;

pub use avr109::Avr109Writer;

/// Progress callback: bytes written so far, total bytes.
pub type WriteProgress<'a> = &'a mut dyn FnMut(usize, usize);

/// Writes a firmware image through a bootloader handle.
///
/// A write is long-running and must not be interrupted once started.
pub trait ImageWriter: Send + Sync {
    /// Write the image at `locator` to `device`.
    fn write(
        &self,
        device: &mut dyn DeviceHandle,
        locator: &FirmwareLocator,
        progress: WriteProgress<'_>,
    ) -> std::result::Result<(), WriteError>;
}

/// Pick the bundled writer for a family.
pub fn writer_for(profile: &FamilyProfile, verify: bool) -> Result<Arc<dyn ImageWriter>> {
    match profile.bootloader {
        BootloaderProtocol::Avr109 => Ok(Arc::new(Avr109Writer::new().with_verify(verify))),
        BootloaderProtocol::Vendor => Err(Error::Unsupported(format!(
            "{profile} bootloader writing - support coming soon"
        ))),
    }
}
