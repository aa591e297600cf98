//! Session worker thread.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, error, info, warn};

use super::{
    ActiveGuard, Collaborators, Outcome, Phase, SessionEvent, SessionReport, SharedState,
    UpdaterConfig, lock,
};
use crate::backup::BackupSnapshot;
use crate::countdown::{CountdownGate, GateResult, run_countdown};
use crate::device::{DeviceHandle, DeviceIdentity, DeviceMode, query_device_version};
use crate::error::{FailureReason, TransitionError, WriteError};
use crate::family::FamilyProfile;
use crate::firmware::FirmwareLocator;
use crate::transition::{BootloaderTransition, TransitionOutcome};

/// Why the session stopped early.
enum Stop {
    Cancelled,
    Failed(FailureReason),
}

impl From<FailureReason> for Stop {
    fn from(reason: FailureReason) -> Self {
        Self::Failed(reason)
    }
}

/// Messages from the write thread.
enum WriteMsg {
    Progress { written: usize, total: usize },
    Done(Result<(), WriteError>, Box<dyn DeviceHandle>),
}

/// What the worker is holding while it runs.
struct Flow {
    identity: DeviceIdentity,
    device: Option<Box<dyn DeviceHandle>>,
    snapshot: Option<BackupSnapshot>,
    transition: BootloaderTransition,
    flashed: bool,
}

pub(super) struct Worker {
    pub(super) profile: &'static FamilyProfile,
    pub(super) locator: FirmwareLocator,
    pub(super) collaborators: Collaborators,
    pub(super) config: UpdaterConfig,
    pub(super) state: SharedState,
    pub(super) events: Sender<SessionEvent>,
    pub(super) guard: Option<Arc<ActiveGuard>>,
}

impl Worker {
    pub(super) fn run(self, device: Box<dyn DeviceHandle>) -> SessionReport {
        let mut flow = Flow {
            identity: device.identity(),
            device: Some(device),
            snapshot: None,
            transition: BootloaderTransition::new(),
            flashed: false,
        };
        self.emit(SessionEvent::Phase(Phase::SourceSelected));

        match self.drive(&mut flow) {
            Ok(()) => self.finish(flow, Outcome::Succeeded),
            Err(Stop::Failed(reason)) => {
                error!("Update of {} failed: {reason}", flow.identity);
                self.restore_after_failure(&mut flow);
                self.finish(flow, Outcome::Failed(reason))
            },
            Err(Stop::Cancelled) => self.finish_cancelled(flow),
        }
    }

    fn drive(&self, flow: &mut Flow) -> Result<(), Stop> {
        let mode = flow
            .device
            .as_ref()
            .map_or(DeviceMode::Bootloader, |d| d.mode());
        let needs_gesture = self.profile.requires_gesture && mode == DeviceMode::Normal;
        let needs_backup = self.profile.requires_backup && mode == DeviceMode::Normal;

        if needs_gesture {
            self.set_phase(Phase::AwaitingUserAction);
            if self.cancel_requested() {
                return Err(Stop::Cancelled);
            }
            if needs_backup {
                self.take_backup(flow)?;
            }
            if !self.profile.gesture_instructions.is_empty() {
                debug!("{}", self.profile.gesture_instructions);
            }
            let mut gate = CountdownGate::new(self.config.countdown_from);
            let result = run_countdown(
                &mut gate,
                &*self.collaborators.clock,
                self.config.tick,
                |next| self.proceed(next),
                |value| self.show_countdown(value),
            );
            if result == GateResult::Cancelled {
                return Err(Stop::Cancelled);
            }
        } else {
            if needs_backup {
                self.take_backup(flow)?;
            }
            if !self.commit() {
                return Err(Stop::Cancelled);
            }
        }
        self.emit(SessionEvent::Phase(Phase::Transitioning));

        self.transition(flow)?;
        self.flash(flow)?;
        if self.config.verify {
            self.verify(flow)?;
        }
        Ok(())
    }

    fn take_backup(&self, flow: &mut Flow) -> Result<(), Stop> {
        let Some(device) = flow.device.as_mut() else {
            return Err(FailureReason::Aborted("no device to back up".to_string()).into());
        };
        let snapshot = self
            .collaborators
            .backup
            .backup(device.as_mut())
            .map_err(FailureReason::Backup)?;
        debug!("Captured {} settings", snapshot.len());
        flow.snapshot = Some(snapshot);
        Ok(())
    }

    fn transition(&self, flow: &mut Flow) -> Result<(), Stop> {
        let Some(device) = flow.device.take() else {
            return Err(FailureReason::Aborted("no device to reset".to_string()).into());
        };
        let outcome = flow
            .transition
            .enter(device, flow.snapshot.as_ref(), self.profile.requires_backup);

        match outcome {
            Ok(TransitionOutcome::Ready(device)) => {
                flow.device = Some(device);
                Ok(())
            },
            Ok(TransitionOutcome::Pending {
                identity,
                previous_port,
            }) => {
                let timeout = self.config.reacquire_timeout;
                debug!("Waiting up to {timeout:?} for {identity} to reappear in bootloader mode");
                let device = self
                    .collaborators
                    .discovery
                    .discover(&identity, DeviceMode::Bootloader, timeout)
                    .map_err(FailureReason::DeviceNotReacquired)?;
                info!(
                    "Re-acquired {identity}: {previous_port} -> {}",
                    device.port_name()
                );
                flow.device = Some(device);
                Ok(())
            },
            Err(failure) => {
                flow.device = failure.device;
                Err(match failure.error {
                    TransitionError::InProgress => FailureReason::TransitionInProgress,
                    TransitionError::BackupRequired => FailureReason::BackupRequired,
                    TransitionError::ResetFailed(e) => FailureReason::ResetFailed(e),
                }
                .into())
            },
        }
    }

    fn flash(&self, flow: &mut Flow) -> Result<(), Stop> {
        self.set_phase(Phase::Flashing);
        let Some(mut device) = flow.device.take() else {
            return Err(FailureReason::Aborted("no bootloader handle".to_string()).into());
        };
        info!(
            "Writing {} to {}",
            self.locator.path.display(),
            device.port_name()
        );

        let (tx, rx) = mpsc::channel();
        let writer = Arc::clone(&self.collaborators.writer);
        let locator = self.locator.clone();
        // The keyboard stays registered until the write returns, even if the session gives up on it
        let hold = self.guard.clone();
        thread::spawn(move || {
            let progress_tx = tx.clone();
            let result = writer.write(device.as_mut(), &locator, &mut |written, total| {
                let _ = progress_tx.send(WriteMsg::Progress { written, total });
            });
            if tx.send(WriteMsg::Done(result, device)).is_err() {
                warn!("Write finished after the session timed out");
            }
            drop(hold);
        });

        let timeout = self.config.write_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(WriteMsg::Progress { written, total }) => {
                    self.emit(SessionEvent::Progress { written, total });
                },
                Ok(WriteMsg::Done(result, device)) => {
                    flow.device = Some(device);
                    result.map_err(FailureReason::Write)?;
                    flow.flashed = true;
                    info!("Firmware written");
                    return Ok(());
                },
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Writer did not finish within {timeout:?}");
                    return Err(FailureReason::WriteTimeout(timeout).into());
                },
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(FailureReason::Aborted(
                        "writer stopped without reporting a result".to_string(),
                    )
                    .into());
                },
            }
        }
    }

    fn verify(&self, flow: &mut Flow) -> Result<(), Stop> {
        self.set_phase(Phase::Verifying);
        if let Some(mut bootloader) = flow.device.take() {
            if let Err(e) = bootloader.close() {
                debug!("Closing bootloader handle: {e}");
            }
        }

        let mut device = self
            .collaborators
            .discovery
            .discover(
                &flow.identity,
                DeviceMode::Normal,
                self.config.verify_timeout,
            )
            .map_err(|e| FailureReason::VerificationFailed(e.to_string()))?;
        let version = query_device_version(device.as_mut());
        flow.device = Some(device);

        let version = version.map_err(|e| FailureReason::VerificationFailed(e.to_string()))?;
        info!("{} reports version {version}", flow.identity);
        self.emit(SessionEvent::FirmwareVersion(version));
        Ok(())
    }

    fn restore_after_failure(&self, flow: &mut Flow) {
        if flow.flashed || !flow.transition.reset_sent() {
            return;
        }
        let (Some(snapshot), Some(device)) = (flow.snapshot.as_ref(), flow.device.as_mut()) else {
            return;
        };
        info!("Restoring settings on {}", device.port_name());
        if let Err(e) = self
            .collaborators
            .backup
            .restore(device.as_mut(), snapshot)
        {
            warn!("Settings restore failed: {e}");
            self.emit(SessionEvent::Warning(format!("settings restore failed: {e}")));
        }
    }

    fn finish(mut self, mut flow: Flow, outcome: Outcome) -> SessionReport {
        let untouched = !flow.transition.reset_sent()
            && !flow.flashed
            && flow
                .device
                .as_ref()
                .is_some_and(|d| d.mode() == DeviceMode::Normal);

        // Only a device the session never reset is handed back open
        let device = if untouched {
            flow.device.take()
        } else {
            if let Some(mut device) = flow.device.take() {
                if let Err(e) = device.close() {
                    debug!("Closing {}: {e}", device.port_name());
                }
            }
            None
        };

        let terminal = match outcome {
            Outcome::Succeeded => Phase::Succeeded,
            _ => Phase::Failed,
        };
        {
            let mut state = lock(&self.state);
            state.phase = terminal;
            state.countdown = None;
            state.finished = true;
        }
        self.emit(SessionEvent::Phase(terminal));
        self.emit(SessionEvent::Disconnected);
        self.emit(SessionEvent::Finished(outcome.clone()));
        self.release();
        self.emit(SessionEvent::Phase(Phase::Idle));

        SessionReport { outcome, device }
    }

    fn finish_cancelled(mut self, mut flow: Flow) -> SessionReport {
        info!("Update of {} cancelled", flow.identity);
        {
            let mut state = lock(&self.state);
            state.countdown = None;
            state.finished = true;
        }
        self.emit(SessionEvent::Finished(Outcome::Cancelled));
        self.release();
        self.emit(SessionEvent::Phase(Phase::Idle));

        SessionReport {
            outcome: Outcome::Cancelled,
            device: flow.device.take(),
        }
    }

    fn release(&mut self) {
        lock(&self.state).phase = Phase::Idle;
        drop(self.guard.take());
    }

    /// Countdown step check. Reaching zero commits the session.
    fn proceed(&self, next: u32) -> bool {
        if next == 0 {
            return self.commit();
        }
        !lock(&self.state).cancel_requested
    }

    /// Take the commit point unless cancellation won the race.
    fn commit(&self) -> bool {
        let mut state = lock(&self.state);
        if state.cancel_requested {
            return false;
        }
        state.committed = true;
        state.countdown = None;
        state.phase = Phase::Transitioning;
        true
    }

    fn cancel_requested(&self) -> bool {
        lock(&self.state).cancel_requested
    }

    fn show_countdown(&self, value: u32) {
        {
            let mut state = lock(&self.state);
            if !state.committed {
                state.countdown = Some(value);
            }
        }
        self.emit(SessionEvent::Countdown(value));
    }

    fn set_phase(&self, phase: Phase) {
        lock(&self.state).phase = phase;
        self.emit(SessionEvent::Phase(phase));
    }

    fn emit(&self, event: SessionEvent) {
        // A consumer that stopped listening does not stop the session
        let _ = self.events.send(event);
    }
}
