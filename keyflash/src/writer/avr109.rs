//! AVR109 (Caterina) image writer.
//!
//! Caterina is the bootloader of ATmega32U4 keyboards. Commands are single
//! ASCII letters; most are acknowledged with a carriage return.
//!
//! ```text
//! S            -> 7-byte programmer id ("CATERIN")
//! b            -> 'Y' + block size (u16, big-endian)
//! P            -> '\r'   enter programming mode
//! e            -> '\r'   chip erase
//! A hi lo      -> '\r'   set word address
//! B hi lo F .. -> '\r'   write flash block
//! g hi lo F    -> data   read flash block
//! L            -> '\r'   leave programming mode
//! E            -> '\r'   exit bootloader
//! ```

use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace};

use crate::device::DeviceHandle;
use crate::error::{Error, WriteError};
use crate::firmware::FirmwareLocator;
use crate::image::HexImage;
use crate::port::Port;
use crate::writer::{ImageWriter, WriteProgress};

/// Acknowledgement byte.
const ACK: u8 = b'\r';

/// Length of the programmer identifier.
const PROGRAMMER_ID_LEN: usize = 7;

/// Default timeout for acknowledged commands.
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Chip erase is much slower than other commands.
const DEFAULT_ERASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fill value for gaps in the image (erased flash).
const ERASED: u8 = 0xFF;

/// AVR109 writer.
#[derive(Debug, Clone)]
pub struct Avr109Writer {
    verify: bool,
    ack_timeout: Duration,
    erase_timeout: Duration,
}

impl Default for Avr109Writer {
    fn default() -> Self {
        Self::new()
    }
}

impl Avr109Writer {
    /// Create a writer with read-back verification enabled.
    pub fn new() -> Self {
        Self {
            verify: true,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            erase_timeout: DEFAULT_ERASE_TIMEOUT,
        }
    }

    /// Enable or disable read-back verification.
    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Set the per-command timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, ack: Duration, erase: Duration) -> Self {
        self.ack_timeout = ack;
        self.erase_timeout = erase;
        self
    }
}

fn load_image(path: &Path) -> Result<HexImage, WriteError> {
    HexImage::from_file(path).map_err(|e| match e {
        Error::Io(io) => WriteError::ImageUnreadable {
            path: path.to_path_buf(),
            reason: io.to_string(),
        },
        other => WriteError::InvalidImage(other.to_string()),
    })
}

/// One programming conversation over a port.
struct Link<'a> {
    port: &'a mut dyn Port,
    timeout: Duration,
}

impl Link<'_> {
    fn send(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        trace!("AVR109 -> {bytes:02X?}");
        self.port
            .write_all_bytes(bytes)
            .map_err(|e| WriteError::Device(e.to_string()))
    }

    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, WriteError> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(len);
        let mut buf = [0u8; 256];

        while out.len() < len {
            let want = (len - out.len()).min(buf.len());
            match self.port.read(&mut buf[..want]) {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {},
                Err(e) => return Err(WriteError::Device(e.to_string())),
            }
            if out.len() < len && Instant::now() >= deadline {
                return Err(WriteError::Device(format!(
                    "bootloader sent {} of {len} expected bytes",
                    out.len()
                )));
            }
        }
        Ok(out)
    }

    fn command_acked(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), WriteError> {
        self.send(bytes)?;
        let reply = self.read_exact(1, timeout)?;
        if reply[0] == ACK {
            Ok(())
        } else {
            Err(WriteError::Device(format!(
                "command '{}' answered {:#04x} instead of CR",
                char::from(bytes[0]),
                reply[0]
            )))
        }
    }

    fn acked(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        let timeout = self.timeout;
        self.command_acked(bytes, timeout)
    }

    fn block_size(&mut self) -> Result<usize, WriteError> {
        self.send(b"b")?;
        let timeout = self.timeout;
        let reply = self.read_exact(3, timeout)?;
        if reply[0] != b'Y' {
            return Err(WriteError::Device(
                "bootloader does not support block transfers".to_string(),
            ));
        }
        // Whole words only
        let size = usize::from(BigEndian::read_u16(&reply[1..])) & !1;
        if size == 0 {
            return Err(WriteError::Device("bootloader reported zero block size".to_string()));
        }
        Ok(size)
    }

    fn set_address(&mut self, byte_address: u32) -> Result<(), WriteError> {
        let word = u16::try_from(byte_address / 2).map_err(|_| {
            WriteError::InvalidImage(format!(
                "address 0x{byte_address:06X} is outside the bootloader's range"
            ))
        })?;
        let mut cmd = [b'A', 0, 0];
        BigEndian::write_u16(&mut cmd[1..], word);
        self.acked(&cmd)
    }

    fn write_block(&mut self, data: &[u8]) -> Result<(), WriteError> {
        let mut cmd = Vec::with_capacity(data.len() + 4);
        cmd.extend_from_slice(&[b'B', 0, 0, b'F']);
        BigEndian::write_u16(&mut cmd[1..3], data.len() as u16);
        cmd.extend_from_slice(data);
        self.acked(&cmd)
    }

    fn read_block(&mut self, len: usize) -> Result<Vec<u8>, WriteError> {
        let mut cmd = [b'g', 0, 0, b'F'];
        BigEndian::write_u16(&mut cmd[1..3], len as u16);
        self.send(&cmd)?;
        let timeout = self.timeout;
        self.read_exact(len, timeout)
    }
}

impl ImageWriter for Avr109Writer {
    fn write(
        &self,
        device: &mut dyn DeviceHandle,
        locator: &FirmwareLocator,
        progress: WriteProgress<'_>,
    ) -> Result<(), WriteError> {
        let image = load_image(&locator.path)?;
        let (base, mut data) = image.to_flat(ERASED);
        if data.is_empty() {
            return Err(WriteError::InvalidImage("image contains no data".to_string()));
        }
        if base % 2 != 0 {
            return Err(WriteError::InvalidImage(format!(
                "image starts at odd address 0x{base:06X}"
            )));
        }
        if data.len() % 2 != 0 {
            data.push(ERASED);
        }

        let port_name = device
            .port_name()
            .to_string();
        let port = device
            .raw_port()
            .ok_or(WriteError::NoTransport)?;
        let mut link = Link {
            port,
            timeout: self.ack_timeout,
        };

        link.send(b"S")?;
        let id = link.read_exact(PROGRAMMER_ID_LEN, self.ack_timeout)?;
        info!(
            "Bootloader {} on {port_name}",
            String::from_utf8_lossy(&id)
        );

        let block = link.block_size()?;
        debug!("Block size: {block} bytes");

        link.acked(b"P")?;
        link.command_acked(b"e", self.erase_timeout)?;

        let total = data.len();
        let mut written = 0;
        progress(0, total);
        for (i, chunk) in data
            .chunks(block)
            .enumerate()
        {
            let address = base + (i * block) as u32;
            link.set_address(address)?;
            link.write_block(chunk)?;
            written += chunk.len();
            progress(written, total);
        }

        if self.verify {
            debug!("Verifying {total} bytes");
            for (i, chunk) in data
                .chunks(block)
                .enumerate()
            {
                let address = base + (i * block) as u32;
                link.set_address(address)?;
                let read = link.read_block(chunk.len())?;
                if read != chunk {
                    return Err(WriteError::Device(format!(
                        "verification failed in block at 0x{address:06X}"
                    )));
                }
            }
        }

        link.acked(b"L")?;
        link.acked(b"E")?;
        info!("Wrote {total} bytes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceIdentity, DeviceMode, SerialDevice};
    use crate::firmware::SourceKind;
    use crate::image::hex::tests::image_text;
    use crate::port::mock::MockSerial;
    use std::fs;
    use tempfile::TempDir;

    fn fixture(data: &[u8]) -> (TempDir, FirmwareLocator) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("firmware.hex");
        fs::write(&path, image_text(data)).unwrap();
        (
            dir,
            FirmwareLocator {
                path,
                kind: SourceKind::Custom,
            },
        )
    }

    fn bootloader(script: &[u8]) -> SerialDevice<MockSerial> {
        SerialDevice::new(
            MockSerial::new("/dev/ttyACM1", script),
            DeviceIdentity::new("Keyboardio", "Model01"),
            DeviceMode::Bootloader,
        )
    }

    /// Device replies for a successful write with 4-byte blocks.
    fn script(data: &[u8], verify: bool) -> Vec<u8> {
        let mut s = b"CATERIN".to_vec();
        s.extend_from_slice(&[b'Y', 0x00, 0x04, ACK, ACK]);
        for _ in data.chunks(4) {
            s.extend_from_slice(&[ACK, ACK]);
        }
        if verify {
            for chunk in data.chunks(4) {
                s.push(ACK);
                s.extend_from_slice(chunk);
            }
        }
        s.extend_from_slice(&[ACK, ACK]);
        s
    }

    fn fast() -> Avr109Writer {
        Avr109Writer::new().with_timeouts(Duration::from_millis(50), Duration::from_millis(50))
    }

    #[test]
    fn test_write_sends_expected_command_sequence() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let (_dir, locator) = fixture(&data);
        let mut device = bootloader(&script(&data, false));
        let mut reports = Vec::new();

        fast()
            .with_verify(false)
            .write(&mut device, &locator, &mut |w, t| reports.push((w, t)))
            .unwrap();

        let mut expected = b"SbPe".to_vec();
        expected.extend_from_slice(b"A\x00\x00B\x00\x04F\x01\x02\x03\x04");
        expected.extend_from_slice(b"A\x00\x02B\x00\x02F\x05\x06");
        expected.extend_from_slice(b"LE");
        assert_eq!(device.port().unwrap().write_buf, expected);
        assert_eq!(reports, vec![(0, 6), (4, 6), (6, 6)]);
    }

    #[test]
    fn test_write_with_verification() {
        let data = [0xAAu8, 0xBB, 0xCC, 0xDD, 0xEE];
        let (_dir, locator) = fixture(&data);
        // Padded to a whole word
        let padded = [0xAAu8, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let mut device = bootloader(&script(&padded, true));

        fast()
            .write(&mut device, &locator, &mut |_, _| {})
            .unwrap();

        let written = &device.port().unwrap().write_buf;
        assert!(written.ends_with(b"A\x00\x02g\x00\x02FLE"));
    }

    #[test]
    fn test_verification_mismatch_fails() {
        let data = [1u8, 2, 3, 4];
        let (_dir, locator) = fixture(&data);
        let mut device = bootloader(&script(&[9, 9, 9, 9], true));

        let err = fast()
            .write(&mut device, &locator, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, WriteError::Device(msg) if msg.contains("verification")));
    }

    #[test]
    fn test_nak_fails_the_write() {
        let data = [1u8, 2];
        let (_dir, locator) = fixture(&data);
        let mut script = b"CATERIN".to_vec();
        script.extend_from_slice(&[b'Y', 0x00, 0x80, b'?']);
        let mut device = bootloader(&script);

        let err = fast()
            .write(&mut device, &locator, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, WriteError::Device(_)));
    }

    #[test]
    fn test_missing_image_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let locator = FirmwareLocator {
            path: dir.path().join("absent.hex"),
            kind: SourceKind::Custom,
        };
        let mut device = bootloader(b"");

        let err = fast()
            .write(&mut device, &locator, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, WriteError::ImageUnreadable { .. }));
        assert!(device.port().unwrap().write_buf.is_empty());
    }

    #[test]
    fn test_garbage_image_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.hex");
        fs::write(&path, "not a hex file").unwrap();
        let locator = FirmwareLocator {
            path,
            kind: SourceKind::Custom,
        };
        let mut device = bootloader(b"");

        let err = fast()
            .write(&mut device, &locator, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, WriteError::InvalidImage(_)));
    }

    #[test]
    fn test_non_ascii_image_is_invalid_before_any_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accent.hex");
        fs::write(&path, ":a\u{e9}b\n:00000001FF\n").unwrap();
        let locator = FirmwareLocator {
            path,
            kind: SourceKind::Custom,
        };
        let mut device = bootloader(b"");

        let err = fast()
            .write(&mut device, &locator, &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, WriteError::InvalidImage(_)));
        assert!(device.port().unwrap().write_buf.is_empty());
    }
}
