//! Update sessions.
//!
//! An [`Updater`] turns a device handle and a firmware source into a running
//! session. Each session lives on its own worker thread and walks through
//! these phases:
//!
//! ```text
//! Idle -> SourceSelected -> [AwaitingUserAction] -> Transitioning
//!      -> Flashing -> [Verifying] -> Succeeded | Failed -> Idle
//! ```
//!
//! `AwaitingUserAction` only happens for families that need a key held
//! during the reset; `Verifying` only when verification is enabled. Entering
//! `Transitioning` is the commit point: before it a session can be
//! cancelled and the device is untouched, after it the session always runs
//! to `Succeeded` or `Failed`.
//!
//! Consumers observe a session through [`SessionHandle::events`] and the
//! [`SessionHandle::phase`]/[`SessionHandle::countdown`] accessors, and get
//! the final [`SessionReport`] from [`SessionHandle::wait`].

mod worker;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::fmt;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};

use crate::backup::SettingsBackup;
use crate::clock::{Clock, SystemClock};
use crate::countdown::{DEFAULT_COUNTDOWN, DEFAULT_TICK};
use crate::device::{DeviceDiscovery, DeviceHandle, DeviceIdentity, VersionTriple};
use crate::error::{CancelError, FailureReason, StartError};
use crate::family::FamilyProfile;
use crate::firmware::{FirmwareResolver, FirmwareSource};
use crate::writer::ImageWriter;

use worker::Worker;

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No session running.
    Idle,
    /// Firmware resolved.
    SourceSelected,
    /// Counting down to the reset while the user gets ready.
    AwaitingUserAction,
    /// Reset sent or device already in its bootloader.
    Transitioning,
    /// Image being written.
    Flashing,
    /// Waiting for the keyboard to come back with the new firmware.
    Verifying,
    /// Update finished.
    Succeeded,
    /// Update failed.
    Failed,
}

impl Phase {
    /// Whether this phase ends a session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::SourceSelected => "source selected",
            Self::AwaitingUserAction => "awaiting user action",
            Self::Transitioning => "transitioning",
            Self::Flashing => "flashing",
            Self::Verifying => "verifying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Image written (and verified, if enabled).
    Succeeded,
    /// Session failed.
    Failed(FailureReason),
    /// Cancelled before the commit point.
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(reason) => write!(f, "failed in {}: {reason}", reason.phase()),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Something a session consumer may want to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Phase changed.
    Phase(Phase),
    /// Countdown value; press the key when it reaches zero.
    Countdown(u32),
    /// Write progress in bytes.
    Progress {
        /// Bytes written so far.
        written: usize,
        /// Image size.
        total: usize,
    },
    /// Version reported after flashing.
    FirmwareVersion(VersionTriple),
    /// Non-fatal problem, such as a failed settings restore.
    Warning(String),
    /// The session let go of the device; reconnect before using it.
    Disconnected,
    /// Terminal outcome.
    Finished(Outcome),
}

/// Session timing and behaviour.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Countdown start value.
    pub countdown_from: u32,
    /// Time between countdown values.
    pub tick: Duration,
    /// How long to wait for the keyboard to reappear after the reset.
    pub reacquire_timeout: Duration,
    /// Upper bound on the image write.
    pub write_timeout: Duration,
    /// Check that the keyboard boots the new firmware.
    pub verify: bool,
    /// How long to wait for the keyboard to boot after flashing.
    pub verify_timeout: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            countdown_from: DEFAULT_COUNTDOWN,
            tick: DEFAULT_TICK,
            reacquire_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(120),
            verify: false,
            verify_timeout: Duration::from_secs(10),
        }
    }
}

/// External services a session relies on.
#[derive(Clone)]
pub struct Collaborators {
    /// Finds the keyboard again after it re-enumerates.
    pub discovery: Arc<dyn DeviceDiscovery>,
    /// Writes the image in bootloader mode.
    pub writer: Arc<dyn ImageWriter>,
    /// Saves and restores settings.
    pub backup: Arc<dyn SettingsBackup>,
    /// Drives the countdown.
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Bundle collaborators, using the system clock.
    pub fn new(
        discovery: Arc<dyn DeviceDiscovery>,
        writer: Arc<dyn ImageWriter>,
        backup: Arc<dyn SettingsBackup>,
    ) -> Self {
        Self {
            discovery,
            writer,
            backup,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a different clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .finish_non_exhaustive()
    }
}

/// Mutable state shared between a worker and its handle.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) phase: Phase,
    pub(crate) countdown: Option<u32>,
    pub(crate) cancel_requested: bool,
    pub(crate) committed: bool,
    pub(crate) finished: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: Phase::SourceSelected,
            countdown: None,
            cancel_requested: false,
            committed: false,
            finished: false,
        }
    }
}

type SharedState = Arc<Mutex<SessionState>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Releases a device identity from the active set when the session ends.
pub(crate) struct ActiveGuard {
    registry: Arc<Mutex<HashSet<DeviceIdentity>>>,
    identity: DeviceIdentity,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.identity);
        debug!("Released {}", self.identity);
    }
}

/// A session that was not started. The device is handed back untouched.
pub struct Rejected {
    /// Why the session was refused.
    pub error: StartError,
    /// The device passed to [`Updater::start_session`].
    pub device: Box<dyn DeviceHandle>,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .field("device", &self.device.port_name())
            .finish()
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for Rejected {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Final result of a session.
pub struct SessionReport {
    /// How it ended.
    pub outcome: Outcome,
    /// The device, when the session ended without touching it.
    pub device: Option<Box<dyn DeviceHandle>>,
}

impl fmt::Debug for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionReport")
            .field("outcome", &self.outcome)
            .field("device", &self.device.as_ref().map(|d| d.port_name().to_string()))
            .finish()
    }
}

/// Cancels a session from another thread, e.g. a Ctrl-C handler.
#[derive(Debug, Clone)]
pub struct Canceller {
    state: SharedState,
}

impl Canceller {
    /// Request cancellation.
    ///
    /// Succeeds while the session has not reached `Transitioning`. Repeated
    /// requests before that point also succeed.
    pub fn cancel(&self) -> Result<(), CancelError> {
        let mut state = lock(&self.state);
        if state.finished {
            return Err(CancelError::NotActive);
        }
        if state.committed {
            return Err(CancelError::TooLate);
        }
        if !state.cancel_requested {
            info!("Cancellation requested during {}", state.phase);
            state.cancel_requested = true;
        }
        Ok(())
    }
}

/// Handle to a running session.
pub struct SessionHandle {
    identity: DeviceIdentity,
    state: SharedState,
    events: Receiver<SessionEvent>,
    worker: JoinHandle<SessionReport>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("identity", &self.identity)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Keyboard being updated.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }

    /// Countdown value, while awaiting the user.
    pub fn countdown(&self) -> Option<u32> {
        lock(&self.state).countdown
    }

    /// Request cancellation. See [`Canceller::cancel`].
    pub fn cancel(&self) -> Result<(), CancelError> {
        self.canceller()
            .cancel()
    }

    /// A cancel handle that can outlive borrows of this session.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            state: Arc::clone(&self.state),
        }
    }

    /// Event stream. Ends after the final `Phase(Idle)`.
    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    /// Block until the session is over.
    pub fn wait(self) -> SessionReport {
        self.worker
            .join()
            .unwrap_or_else(|_| SessionReport {
                outcome: Outcome::Failed(FailureReason::Aborted(
                    "session worker panicked".to_string(),
                )),
                device: None,
            })
    }
}

/// Starts update sessions and keeps one session per keyboard.
#[derive(Debug)]
pub struct Updater {
    resolver: FirmwareResolver,
    collaborators: Collaborators,
    config: UpdaterConfig,
    active: Arc<Mutex<HashSet<DeviceIdentity>>>,
}

impl Updater {
    /// Create an updater with default timing.
    pub fn new(resolver: FirmwareResolver, collaborators: Collaborators) -> Self {
        Self {
            resolver,
            collaborators,
            config: UpdaterConfig::default(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Use a different configuration for new sessions.
    #[must_use]
    pub fn with_config(mut self, config: UpdaterConfig) -> Self {
        self.config = config;
        self
    }

    /// Configuration used for new sessions.
    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Firmware resolver.
    pub fn resolver(&self) -> &FirmwareResolver {
        &self.resolver
    }

    /// Whether a session is running for `identity`.
    ///
    /// A write that outlived its session's timeout still counts until it
    /// returns.
    pub fn is_active(&self, identity: &DeviceIdentity) -> bool {
        lock(&self.active).contains(identity)
    }

    /// Resolve `source` for `device` and start updating it.
    ///
    /// Fails without side effects if a session for the same keyboard is
    /// still running or the source does not resolve.
    pub fn start_session(
        &self,
        device: Box<dyn DeviceHandle>,
        source: FirmwareSource,
    ) -> Result<SessionHandle, Rejected> {
        let identity = device.identity();

        let mut active = lock(&self.active);
        if active.contains(&identity) {
            return Err(Rejected {
                error: StartError::SessionAlreadyActive(identity),
                device,
            });
        }
        let locator = match self
            .resolver
            .resolve(&source, &identity)
        {
            Ok(locator) => locator,
            Err(e) => {
                return Err(Rejected {
                    error: e.into(),
                    device,
                });
            },
        };
        active.insert(identity.clone());
        drop(active);

        info!(
            "Starting {} update of {identity} on {}",
            locator.kind,
            device.port_name()
        );

        let state = Arc::new(Mutex::new(SessionState::new()));
        let (events_tx, events_rx) = mpsc::channel();
        let worker = Worker {
            profile: FamilyProfile::for_identity(&identity),
            locator,
            collaborators: self
                .collaborators
                .clone(),
            config: self.config.clone(),
            state: Arc::clone(&state),
            events: events_tx,
            guard: Some(Arc::new(ActiveGuard {
                registry: Arc::clone(&self.active),
                identity: identity.clone(),
            })),
        };
        let worker = thread::spawn(move || worker.run(device));

        Ok(SessionHandle {
            identity,
            state,
            events: events_rx,
            worker,
        })
    }
}
