//! Focus protocol device handle.
//!
//! Focus is the line-based command protocol spoken by Kaleidoscope firmware:
//! the host writes `command [args]\n`, the keyboard answers with zero or more
//! lines followed by a lone `.` line.
//!
//! ```text
//! host  -> "version\n"
//! board <- "0.1.2 1.99.8 v0.9.1\r\n.\r\n"
//! ```

use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::device::{DeviceHandle, DeviceIdentity, DeviceMode};
use crate::error::CommandError;
use crate::port::Port;

/// Baud rate used for Focus traffic.
pub const FOCUS_BAUD: u32 = 9600;

/// Opening the port at this rate and dropping DTR reboots into the bootloader.
pub const BOOTLOADER_TOUCH_BAUD: u32 = 1200;

/// How long a Focus command may take to answer.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// DTR pulse length for the 1200-baud touch.
const TOUCH_DELAY: Duration = Duration::from_millis(50);

/// Terminator of a non-empty reply.
const TERMINATOR: &[u8] = b"\r\n.\r\n";

/// Complete reply to a command with no output.
const EMPTY_REPLY: &[u8] = b".\r\n";

/// Focus device handle over any [`Port`].
pub struct SerialDevice<P: Port> {
    port: Option<P>,
    port_name: String,
    /// Bytes received past the last terminator.
    pending: Vec<u8>,
    identity: DeviceIdentity,
    mode: DeviceMode,
    command_timeout: Duration,
    touch_delay: Duration,
}

impl<P: Port> SerialDevice<P> {
    /// Wrap an opened port.
    pub fn new(port: P, identity: DeviceIdentity, mode: DeviceMode) -> Self {
        Self {
            port_name: port
                .name()
                .to_string(),
            port: Some(port),
            pending: Vec::new(),
            identity,
            mode,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            touch_delay: TOUCH_DELAY,
        }
    }

    /// Set how long to wait for a command reply.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the DTR pulse length of the bootloader reset.
    #[must_use]
    pub fn with_touch_delay(mut self, delay: Duration) -> Self {
        self.touch_delay = delay;
        self
    }

    /// Get a reference to the underlying port, if still open.
    pub fn port(&self) -> Option<&P> {
        self.port
            .as_ref()
    }

    fn port_mut(&mut self) -> Result<&mut P, CommandError> {
        self.port
            .as_mut()
            .ok_or(CommandError::Closed)
    }

    fn read_reply(&mut self, command: &str) -> Result<String, CommandError> {
        let timeout = self.command_timeout;
        let deadline = Instant::now() + timeout;
        let mut received = std::mem::take(&mut self.pending);
        let mut buf = [0u8; 256];

        loop {
            if let Some((reply, consumed)) = split_reply(&received) {
                self.pending = received.split_off(consumed);
                return Ok(reply);
            }

            let port = self.port_mut()?;
            match port.read(&mut buf) {
                Ok(n) => {
                    trace!("Focus: received {n} bytes");
                    received.extend_from_slice(&buf[..n]);
                },
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {},
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(CommandError::Timeout(format!(
                    "no reply to `{command}` within {timeout:?}"
                )));
            }
        }
    }
}

/// Split the first complete reply off `received`.
///
/// Returns the trimmed reply text and the number of bytes it occupied.
pub fn split_reply(received: &[u8]) -> Option<(String, usize)> {
    if received.starts_with(EMPTY_REPLY) {
        return Some((String::new(), EMPTY_REPLY.len()));
    }
    let end = received
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)?;
    let reply = String::from_utf8_lossy(&received[..end])
        .trim()
        .to_string();
    Some((reply, end + TERMINATOR.len()))
}

impl<P: Port> DeviceHandle for SerialDevice<P> {
    fn mode(&self) -> DeviceMode {
        self.mode
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity
            .clone()
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn send_command(&mut self, command: &str) -> Result<String, CommandError> {
        if self.mode == DeviceMode::Bootloader {
            return Err(CommandError::WrongMode(self.mode));
        }

        debug!("Focus -> {command}");
        let port = self.port_mut()?;
        port.clear_buffers()?;
        port.write_all_bytes(format!("{command}\n").as_bytes())?;

        let reply = self.read_reply(command)?;
        trace!("Focus <- {reply:?}");
        Ok(reply)
    }

    fn close(&mut self) -> Result<(), CommandError> {
        if let Some(mut port) = self.port.take() {
            debug!("Closing {}", self.port_name);
            port.close()?;
        }
        Ok(())
    }

    fn reset_to_bootloader(self: Box<Self>) -> Result<(), CommandError> {
        let mut this = *self;
        let touch_delay = this.touch_delay;
        let mut port = this
            .port
            .take()
            .ok_or(CommandError::Closed)?;

        debug!("Sending 1200-baud reset on {}", this.port_name);
        port.set_baud_rate(BOOTLOADER_TOUCH_BAUD)?;
        port.set_dtr(true)?;
        thread::sleep(touch_delay);
        port.set_dtr(false)?;
        port.close()?;
        Ok(())
    }

    fn raw_port(&mut self) -> Option<&mut dyn Port> {
        self.port
            .as_mut()
            .map(|p| p as &mut dyn Port)
    }
}

#[cfg(feature = "native")]
mod native_impl {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use log::{debug, info, warn};

    use super::{FOCUS_BAUD, SerialDevice};
    use crate::clock::{Clock, SystemClock};
    use crate::device::detect::detect_devices;
    use crate::device::{DeviceDiscovery, DeviceHandle, DeviceIdentity, DeviceMode};
    use crate::error::{DiscoveryError, Error, Result};
    use crate::family::FamilyProfile;
    use crate::port::{NativePort, SerialConfig};

    /// Maximum number of attempts to open a freshly enumerated port.
    const MAX_OPEN_PORT_ATTEMPTS: usize = 3;

    /// Delay between open attempts.
    const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

    /// Default interval between port scans.
    const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

    /// Open a Focus handle on a named port, retrying while the OS settles.
    pub fn open_device(
        port_name: &str,
        identity: DeviceIdentity,
        mode: DeviceMode,
    ) -> Result<SerialDevice<NativePort>> {
        let mut last_error = None;

        for attempt in 1..=MAX_OPEN_PORT_ATTEMPTS {
            let config = SerialConfig::new(port_name, FOCUS_BAUD);
            match NativePort::open(&config) {
                Ok(port) => {
                    if attempt > 1 {
                        debug!("Port opened on attempt {attempt}");
                    }
                    return Ok(SerialDevice::new(port, identity, mode));
                },
                Err(e) => {
                    warn!(
                        "Failed to open port {port_name} (attempt {attempt}/{MAX_OPEN_PORT_ATTEMPTS}): {e}"
                    );
                    last_error = Some(e);

                    if attempt < MAX_OPEN_PORT_ATTEMPTS {
                        thread::sleep(OPEN_RETRY_DELAY);
                    }
                },
            }
        }

        Err(last_error.unwrap_or(Error::DeviceNotFound))
    }

    /// Finds keyboards by scanning USB serial ports.
    pub struct NativeDiscovery {
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    }

    impl NativeDiscovery {
        /// Create a discovery that polls in real time.
        pub fn new() -> Self {
            Self {
                clock: Arc::new(SystemClock),
                poll_interval: DEFAULT_POLL_INTERVAL,
            }
        }

        /// Use a different clock for deadlines and polling.
        #[must_use]
        pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
            self.clock = clock;
            self
        }

        /// Set the interval between port scans.
        #[must_use]
        pub fn with_poll_interval(mut self, interval: Duration) -> Self {
            self.poll_interval = interval;
            self
        }
    }

    impl Default for NativeDiscovery {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DeviceDiscovery for NativeDiscovery {
        fn discover(
            &self,
            identity: &DeviceIdentity,
            mode: DeviceMode,
            timeout: Duration,
        ) -> std::result::Result<Box<dyn DeviceHandle>, DiscoveryError> {
            let profile = FamilyProfile::known(identity).ok_or_else(|| {
                DiscoveryError::Unsupported(format!("no USB IDs known for {identity}"))
            })?;

            let start = self.clock.now();
            let deadline = start + timeout;
            info!("Waiting for {identity} in {mode} mode...");

            loop {
                let candidate = detect_devices()
                    .into_iter()
                    .find(|d| d.family == Some(profile) && d.mode == Some(mode));

                if let Some(found) = candidate {
                    match open_device(&found.name, identity.clone(), mode) {
                        Ok(device) => {
                            info!("Found {identity} on {}", found.name);
                            return Ok(Box::new(device));
                        },
                        Err(e) => debug!("{} enumerated but did not open: {e}", found.name),
                    }
                }

                if self.clock.now() >= deadline {
                    return Err(DiscoveryError::NotFound {
                        identity: identity.clone(),
                        mode,
                        waited: self.clock.now() - start,
                    });
                }
                self.clock.sleep(self.poll_interval);
            }
        }
    }
}

#[cfg(feature = "native")]
pub use native_impl::{NativeDiscovery, open_device};
