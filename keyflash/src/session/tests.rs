use super::*;
use crate::backup::BackupSnapshot;
use crate::clock::SimulatedClock;
use crate::error::{BackupError, CommandError, DiscoveryError, RestoreError, WriteError};
use crate::firmware::FirmwareLocator;
use crate::port::Port;
use crate::writer::WriteProgress;
use crate::device::DeviceMode;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::time::Instant;
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

// ---- Fakes ----

#[derive(Debug, Default)]
struct Log {
    commands: Vec<(String, String)>,
    resets: Vec<String>,
    closed: Vec<String>,
    written_to: Vec<String>,
    restores: usize,
    discoveries: Vec<DeviceMode>,
}

type SharedLog = Arc<Mutex<Log>>;

struct FakeDevice {
    identity: DeviceIdentity,
    mode: DeviceMode,
    port: String,
    log: SharedLog,
}

impl DeviceHandle for FakeDevice {
    fn mode(&self) -> DeviceMode {
        self.mode
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    fn port_name(&self) -> &str {
        &self.port
    }

    fn send_command(&mut self, command: &str) -> Result<String, CommandError> {
        lock(&self.log)
            .commands
            .push((self.port.clone(), command.to_string()));
        if command == "version" {
            Ok("v1.2.3 0.9.0 abc123".to_string())
        } else {
            Ok(String::new())
        }
    }

    fn close(&mut self) -> Result<(), CommandError> {
        lock(&self.log)
            .closed
            .push(self.port.clone());
        Ok(())
    }

    fn reset_to_bootloader(self: Box<Self>) -> Result<(), CommandError> {
        lock(&self.log)
            .resets
            .push(self.port.clone());
        Ok(())
    }

    fn raw_port(&mut self) -> Option<&mut dyn Port> {
        None
    }
}

fn raise() -> DeviceIdentity {
    DeviceIdentity::new("Dygma", "Raise")
}

fn model01() -> DeviceIdentity {
    DeviceIdentity::new("Keyboardio", "Model01")
}

fn device(
    identity: DeviceIdentity,
    mode: DeviceMode,
    port: &str,
    log: &SharedLog,
) -> Box<dyn DeviceHandle> {
    Box::new(FakeDevice {
        identity,
        mode,
        port: port.to_string(),
        log: Arc::clone(log),
    })
}

/// Answers `mode()` only after the test releases it, once.
struct SlowToAnswer {
    inner: FakeDevice,
    first_answer: Mutex<Option<mpsc::Receiver<()>>>,
}

impl DeviceHandle for SlowToAnswer {
    fn mode(&self) -> DeviceMode {
        let pending = lock(&self.first_answer).take();
        if let Some(release) = pending {
            let _ = release.recv();
        }
        self.inner.mode()
    }

    fn identity(&self) -> DeviceIdentity {
        self.inner.identity()
    }

    fn port_name(&self) -> &str {
        self.inner.port_name()
    }

    fn send_command(&mut self, command: &str) -> Result<String, CommandError> {
        self.inner.send_command(command)
    }

    fn close(&mut self) -> Result<(), CommandError> {
        self.inner.close()
    }

    fn reset_to_bootloader(self: Box<Self>) -> Result<(), CommandError> {
        Box::new(self.inner).reset_to_bootloader()
    }

    fn raw_port(&mut self) -> Option<&mut dyn Port> {
        None
    }
}

struct FakeDiscovery {
    bootloader_port: Option<String>,
    normal_port: Option<String>,
    /// Discovery in this mode waits until the receiver is released.
    hold: Option<(DeviceMode, Mutex<mpsc::Receiver<()>>)>,
    log: SharedLog,
}

impl DeviceDiscovery for FakeDiscovery {
    fn discover(
        &self,
        identity: &DeviceIdentity,
        mode: DeviceMode,
        timeout: Duration,
    ) -> Result<Box<dyn DeviceHandle>, DiscoveryError> {
        lock(&self.log)
            .discoveries
            .push(mode);
        if let Some((held, release)) = &self.hold {
            if *held == mode {
                let _ = lock(release).recv();
            }
        }
        let port = match mode {
            DeviceMode::Bootloader => &self.bootloader_port,
            DeviceMode::Normal => &self.normal_port,
        };
        match port {
            Some(port) => Ok(device(identity.clone(), mode, port, &self.log)),
            None => Err(DiscoveryError::NotFound {
                identity: identity.clone(),
                mode,
                waited: timeout,
            }),
        }
    }
}

enum WriteBehaviour {
    Succeed,
    Fail(WriteError),
    WaitFor(Mutex<mpsc::Receiver<()>>),
}

struct FakeWriter {
    behaviour: WriteBehaviour,
    log: SharedLog,
}

impl ImageWriter for FakeWriter {
    fn write(
        &self,
        device: &mut dyn DeviceHandle,
        _locator: &FirmwareLocator,
        progress: WriteProgress<'_>,
    ) -> Result<(), WriteError> {
        lock(&self.log)
            .written_to
            .push(device.port_name().to_string());
        progress(0, 8);
        match &self.behaviour {
            WriteBehaviour::Succeed => {},
            WriteBehaviour::Fail(e) => return Err(e.clone()),
            WriteBehaviour::WaitFor(release) => {
                let _ = lock(release).recv();
            },
        }
        progress(8, 8);
        Ok(())
    }
}

#[derive(Default)]
struct FakeBackup {
    fail_backup: bool,
    fail_restore: bool,
    log: SharedLog,
}

impl SettingsBackup for FakeBackup {
    fn backup(&self, device: &mut dyn DeviceHandle) -> Result<BackupSnapshot, BackupError> {
        if self.fail_backup {
            return Err(BackupError::Command {
                command: "keymap.custom".to_string(),
                source: CommandError::Timeout("keymap.custom".to_string()),
            });
        }
        let mut snapshot = BackupSnapshot::new(device.identity());
        snapshot
            .entries
            .insert("led.mode".to_string(), "2".to_string());
        Ok(snapshot)
    }

    fn restore(
        &self,
        _device: &mut dyn DeviceHandle,
        _snapshot: &BackupSnapshot,
    ) -> Result<(), RestoreError> {
        lock(&self.log).restores += 1;
        if self.fail_restore {
            return Err(RestoreError::Command {
                command: "led.mode".to_string(),
                source: CommandError::WrongMode(DeviceMode::Bootloader),
            });
        }
        Ok(())
    }
}

/// Clock whose sleeps block until the test releases them.
///
/// Dropping the release sender lets every remaining sleep through.
struct StepClock {
    clock: SimulatedClock,
    steps: Mutex<mpsc::Receiver<()>>,
}

impl StepClock {
    fn new() -> (Arc<Self>, Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let clock = Arc::new(Self {
            clock: SimulatedClock::new(),
            steps: Mutex::new(rx),
        });
        (clock, tx)
    }
}

impl Clock for StepClock {
    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn sleep(&self, duration: Duration) {
        let _ = lock(&self.steps).recv();
        self.clock.sleep(duration);
    }
}

struct Harness {
    log: SharedLog,
    firmware: TempDir,
    updater: Updater,
}

struct Setup {
    writer: WriteBehaviour,
    backup: FakeBackup,
    bootloader_port: Option<&'static str>,
    normal_port: Option<&'static str>,
    discovery_hold: Option<(DeviceMode, Mutex<mpsc::Receiver<()>>)>,
    clock: Arc<dyn Clock>,
    config: UpdaterConfig,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            writer: WriteBehaviour::Succeed,
            backup: FakeBackup::default(),
            bootloader_port: Some("/dev/ttyACM1"),
            normal_port: Some("/dev/ttyACM2"),
            discovery_hold: None,
            clock: Arc::new(SimulatedClock::new()),
            config: UpdaterConfig::default(),
        }
    }
}

impl Setup {
    fn build(self) -> Harness {
        init_logging();
        let log = Arc::new(Mutex::new(Log::default()));
        let firmware = tempfile::tempdir().unwrap();
        for identity in [raise(), model01()] {
            let dir = firmware
                .path()
                .join(&identity.vendor)
                .join(&identity.product);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("default.hex"), ":00000001FF\n").unwrap();
        }

        let backup = FakeBackup {
            log: Arc::clone(&log),
            ..self.backup
        };
        let collaborators = Collaborators::new(
            Arc::new(FakeDiscovery {
                bootloader_port: self.bootloader_port.map(str::to_string),
                normal_port: self.normal_port.map(str::to_string),
                hold: self.discovery_hold,
                log: Arc::clone(&log),
            }),
            Arc::new(FakeWriter {
                behaviour: self.writer,
                log: Arc::clone(&log),
            }),
            Arc::new(backup),
        )
        .with_clock(self.clock);
        let updater = Updater::new(FirmwareResolver::new(firmware.path()), collaborators)
            .with_config(self.config);

        Harness {
            log,
            firmware,
            updater,
        }
    }
}

/// Drain every event, then collect the report.
fn run_to_end(handle: SessionHandle) -> (Vec<SessionEvent>, SessionReport) {
    let events: Vec<SessionEvent> = handle
        .events()
        .iter()
        .collect();
    (events, handle.wait())
}

fn phases(events: &[SessionEvent]) -> Vec<Phase> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Phase(p) => Some(*p),
            _ => None,
        })
        .collect()
}

fn countdown_ticks(events: &[SessionEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Countdown(n) => Some(*n),
            _ => None,
        })
        .collect()
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn held(mode: DeviceMode) -> (Option<(DeviceMode, Mutex<mpsc::Receiver<()>>)>, Sender<()>) {
    let (tx, rx) = mpsc::channel();
    (Some((mode, Mutex::new(rx))), tx)
}

fn wait_for(handle: &SessionHandle, wanted: &SessionEvent) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    for event in handle.events() {
        let done = &event == wanted;
        seen.push(event);
        if done {
            return seen;
        }
    }
    panic!("session ended before {wanted:?}; saw {seen:?}");
}

// ---- Start ----

#[test]
fn test_missing_default_image_rejects_and_returns_device() {
    let harness = Setup::default().build();
    let log = Arc::clone(&harness.log);
    let acme = DeviceIdentity::new("Acme", "Board");

    let rejected = harness
        .updater
        .start_session(
            device(acme.clone(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Experimental,
        )
        .unwrap_err();

    assert!(matches!(rejected.error, StartError::Resolution(_)));
    assert_eq!(rejected.device.port_name(), "/dev/ttyACM0");
    assert!(!harness.updater.is_active(&acme));
}

#[test]
fn test_second_session_on_same_keyboard_is_rejected() {
    let (clock, steps) = StepClock::new();
    let harness = Setup {
        clock,
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let first = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    wait_for(&first, &SessionEvent::Countdown(3));
    assert!(harness.updater.is_active(&raise()));

    let rejected = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Normal, "/dev/ttyACM9", &log),
            FirmwareSource::Default,
        )
        .unwrap_err();
    assert_eq!(rejected.error, StartError::SessionAlreadyActive(raise()));
    assert_eq!(rejected.device.port_name(), "/dev/ttyACM9");

    first.cancel().unwrap();
    drop(steps);
    let (_, report) = run_to_end(first);
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert!(!harness.updater.is_active(&raise()));
}

// ---- Cancellation ----

#[test]
fn test_cancel_during_countdown_leaves_device_untouched() {
    let (clock, steps) = StepClock::new();
    let harness = Setup {
        clock,
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    let mut events = wait_for(&handle, &SessionEvent::Countdown(3));
    assert_eq!(handle.countdown(), Some(3));
    assert_eq!(handle.phase(), Phase::AwaitingUserAction);

    handle.cancel().unwrap();
    drop(steps);
    let canceller = handle.canceller();
    let (rest, report) = run_to_end(handle);
    events.extend(rest);

    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(countdown_ticks(&events), vec![3]);
    assert_eq!(
        phases(&events),
        vec![Phase::SourceSelected, Phase::AwaitingUserAction, Phase::Idle]
    );
    assert!(events.contains(&SessionEvent::Finished(Outcome::Cancelled)));
    assert!(!events.contains(&SessionEvent::Disconnected));

    let device = report.device.unwrap();
    assert_eq!(device.mode(), DeviceMode::Normal);
    assert_eq!(device.port_name(), "/dev/ttyACM0");
    assert!(lock(&log).resets.is_empty());
    assert_eq!(canceller.cancel(), Err(CancelError::NotActive));
}

#[test]
fn test_cancel_after_commit_is_too_late() {
    let (clock, steps) = StepClock::new();
    let (release_tx, release_rx) = mpsc::channel();
    let harness = Setup {
        clock,
        writer: WriteBehaviour::WaitFor(Mutex::new(release_rx)),
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    drop(steps);
    wait_for(&handle, &SessionEvent::Phase(Phase::Flashing));

    assert_eq!(handle.cancel(), Err(CancelError::TooLate));
    assert_eq!(handle.countdown(), None);

    drop(release_tx);
    let (_, report) = run_to_end(handle);
    assert_eq!(report.outcome, Outcome::Succeeded);
}

#[test]
fn test_cancel_before_commit_without_countdown() {
    let harness = Setup::default().build();
    let log = Arc::clone(&harness.log);
    let (release_tx, release_rx) = mpsc::channel();
    let slow = Box::new(SlowToAnswer {
        inner: FakeDevice {
            identity: model01(),
            mode: DeviceMode::Normal,
            port: "/dev/ttyACM0".to_string(),
            log: Arc::clone(&log),
        },
        first_answer: Mutex::new(Some(release_rx)),
    });

    let handle = harness
        .updater
        .start_session(slow, FirmwareSource::Default)
        .unwrap();
    let mut events = wait_for(&handle, &SessionEvent::Phase(Phase::SourceSelected));
    assert_eq!(handle.phase(), Phase::SourceSelected);

    handle.cancel().unwrap();
    drop(release_tx);
    let (rest, report) = run_to_end(handle);
    events.extend(rest);

    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(phases(&events), vec![Phase::SourceSelected, Phase::Idle]);
    assert_eq!(
        report
            .device
            .unwrap()
            .port_name(),
        "/dev/ttyACM0"
    );
    let log_state = lock(&log);
    assert!(log_state.resets.is_empty());
    assert!(log_state.written_to.is_empty());
}

#[test]
fn test_cancel_while_reacquiring_is_too_late() {
    let (hold, release) = held(DeviceMode::Bootloader);
    let harness = Setup {
        discovery_hold: hold,
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    wait_for(&handle, &SessionEvent::Phase(Phase::Transitioning));
    wait_until("discovery starts", || !lock(&log).discoveries.is_empty());

    assert_eq!(handle.phase(), Phase::Transitioning);
    assert_eq!(handle.cancel(), Err(CancelError::TooLate));

    drop(release);
    let (_, report) = run_to_end(handle);
    assert_eq!(report.outcome, Outcome::Succeeded);
}

#[test]
fn test_cancel_while_verifying_is_too_late() {
    let (hold, release) = held(DeviceMode::Normal);
    let harness = Setup {
        discovery_hold: hold,
        config: UpdaterConfig {
            verify: true,
            ..UpdaterConfig::default()
        },
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(model01(), DeviceMode::Bootloader, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    wait_for(&handle, &SessionEvent::Phase(Phase::Verifying));

    assert_eq!(handle.phase(), Phase::Verifying);
    assert_eq!(handle.cancel(), Err(CancelError::TooLate));

    drop(release);
    let (_, report) = run_to_end(handle);
    assert_eq!(report.outcome, Outcome::Succeeded);
}

// ---- Failures ----

#[test]
fn test_backup_failure_never_resets() {
    let harness = Setup {
        backup: FakeBackup {
            fail_backup: true,
            ..FakeBackup::default()
        },
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    let (events, report) = run_to_end(handle);

    let Outcome::Failed(reason) = &report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert!(matches!(reason, FailureReason::Backup(_)));
    assert!(!reason.device_state_uncertain());
    assert!(countdown_ticks(&events).is_empty());

    let log_state = lock(&log);
    assert!(log_state.resets.is_empty());
    assert!(log_state.closed.is_empty());
    assert_eq!(log_state.restores, 0);
    drop(log_state);

    let device = report.device.unwrap();
    assert_eq!(device.mode(), DeviceMode::Normal);
}

#[test]
fn test_lost_device_after_reset_fails_without_touching_old_handle() {
    let harness = Setup {
        bootloader_port: None,
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    let (events, report) = run_to_end(handle);

    let Outcome::Failed(reason) = &report.outcome else {
        panic!("expected failure, got {:?}", report.outcome);
    };
    assert!(matches!(reason, FailureReason::DeviceNotReacquired(_)));
    assert_eq!(reason.phase(), Phase::Transitioning);
    assert!(reason.device_state_uncertain());
    assert!(report.device.is_none());
    assert!(events.contains(&SessionEvent::Disconnected));

    let log_state = lock(&log);
    assert_eq!(log_state.resets, vec!["/dev/ttyACM0".to_string()]);
    assert!(log_state.commands.is_empty());
    assert!(log_state.closed.is_empty());
    assert_eq!(log_state.restores, 0);
}

#[test]
fn test_write_error_restores_once_and_disconnects() {
    let harness = Setup {
        writer: WriteBehaviour::Fail(WriteError::Device("programmer did not acknowledge".into())),
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    let (events, report) = run_to_end(handle);

    assert!(matches!(
        report.outcome,
        Outcome::Failed(FailureReason::Write(WriteError::Device(_)))
    ));
    assert_eq!(lock(&log).restores, 1);
    assert_eq!(lock(&log).closed, vec!["/dev/ttyACM1".to_string()]);

    let tail: Vec<&SessionEvent> = events
        .iter()
        .rev()
        .take(4)
        .collect();
    assert_eq!(tail[0], &SessionEvent::Phase(Phase::Idle));
    assert!(matches!(tail[1], SessionEvent::Finished(Outcome::Failed(_))));
    assert_eq!(tail[2], &SessionEvent::Disconnected);
    assert_eq!(tail[3], &SessionEvent::Phase(Phase::Failed));
}

#[test]
fn test_failed_restore_is_a_warning() {
    let harness = Setup {
        writer: WriteBehaviour::Fail(WriteError::Aborted("unplugged".into())),
        backup: FakeBackup {
            fail_restore: true,
            ..FakeBackup::default()
        },
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    let (events, report) = run_to_end(handle);

    assert!(matches!(
        report.outcome,
        Outcome::Failed(FailureReason::Write(WriteError::Aborted(_)))
    ));
    assert_eq!(lock(&log).restores, 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Warning(w) if w.contains("restore"))));
    assert!(events.contains(&SessionEvent::Disconnected));
}

#[test]
fn test_hung_writer_times_out() {
    let (release_tx, release_rx) = mpsc::channel();
    let harness = Setup {
        writer: WriteBehaviour::WaitFor(Mutex::new(release_rx)),
        config: UpdaterConfig {
            write_timeout: Duration::from_millis(100),
            ..UpdaterConfig::default()
        },
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(model01(), DeviceMode::Bootloader, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    let (events, report) = run_to_end(handle);

    assert_eq!(
        report.outcome,
        Outcome::Failed(FailureReason::WriteTimeout(Duration::from_millis(100)))
    );
    assert!(events.contains(&SessionEvent::Progress { written: 0, total: 8 }));
    assert!(events.contains(&SessionEvent::Disconnected));

    // The abandoned write still owns the bootloader handle
    assert!(harness.updater.is_active(&model01()));
    let rejected = harness
        .updater
        .start_session(
            device(model01(), DeviceMode::Bootloader, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap_err();
    assert_eq!(rejected.error, StartError::SessionAlreadyActive(model01()));
    assert_eq!(lock(&log).written_to.len(), 1);

    drop(release_tx);
    wait_until("the write returns", || !harness.updater.is_active(&model01()));
}

// ---- Full runs ----

#[test]
fn test_bootloader_device_with_custom_image_skips_countdown() {
    let harness = Setup::default().build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Bootloader, "/dev/ttyACM0", &log),
            FirmwareSource::Custom(PathBuf::from("/tmp/fw.hex")),
        )
        .unwrap();
    let (events, report) = run_to_end(handle);

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(
        phases(&events),
        vec![
            Phase::SourceSelected,
            Phase::Transitioning,
            Phase::Flashing,
            Phase::Succeeded,
            Phase::Idle,
        ]
    );
    assert!(countdown_ticks(&events).is_empty());

    let log_state = lock(&log);
    assert!(log_state.resets.is_empty());
    assert!(log_state.discoveries.is_empty());
    assert_eq!(log_state.written_to, vec!["/dev/ttyACM0".to_string()]);
}

#[test]
fn test_gesture_keyboard_full_update() {
    let harness = Setup::default().build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    let (events, report) = run_to_end(handle);

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert!(report.device.is_none());
    assert_eq!(countdown_ticks(&events), vec![3, 2, 1, 0]);
    assert_eq!(
        phases(&events),
        vec![
            Phase::SourceSelected,
            Phase::AwaitingUserAction,
            Phase::Transitioning,
            Phase::Flashing,
            Phase::Succeeded,
            Phase::Idle,
        ]
    );
    assert!(events.contains(&SessionEvent::Progress { written: 8, total: 8 }));
    assert!(events.contains(&SessionEvent::Disconnected));

    let log_state = lock(&log);
    assert_eq!(log_state.resets, vec!["/dev/ttyACM0".to_string()]);
    assert_eq!(log_state.written_to.len(), 1);
    assert_ne!(log_state.written_to[0], "/dev/ttyACM0");
    assert_eq!(log_state.restores, 0);
}

#[test]
fn test_countdown_uses_configured_tick() {
    let clock = Arc::new(SimulatedClock::new());
    let harness = Setup {
        clock: Arc::clone(&clock) as Arc<dyn Clock>,
        config: UpdaterConfig {
            countdown_from: 2,
            tick: Duration::from_millis(500),
            ..UpdaterConfig::default()
        },
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(raise(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    let (events, _) = run_to_end(handle);

    assert_eq!(countdown_ticks(&events), vec![2, 1, 0]);
    assert_eq!(clock.sleeps(), vec![Duration::from_millis(500); 2]);
}

#[test]
fn test_non_gesture_keyboard_resets_without_countdown() {
    let harness = Setup::default().build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(model01(), DeviceMode::Normal, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    let (events, report) = run_to_end(handle);

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert!(countdown_ticks(&events).is_empty());
    assert!(!phases(&events).contains(&Phase::AwaitingUserAction));
    assert_eq!(lock(&log).resets.len(), 1);
}

// ---- Verification ----

#[test]
fn test_verification_reports_version() {
    let harness = Setup {
        config: UpdaterConfig {
            verify: true,
            ..UpdaterConfig::default()
        },
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(model01(), DeviceMode::Bootloader, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    let (events, report) = run_to_end(handle);

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert!(phases(&events).contains(&Phase::Verifying));
    let version = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::FirmwareVersion(v) => Some(v.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(version.application, "v1.2.3");
    assert_eq!(version.firmware.as_deref(), Some("abc123"));

    let log_state = lock(&log);
    assert_eq!(log_state.discoveries, vec![DeviceMode::Normal]);
    assert_eq!(
        log_state.closed,
        vec!["/dev/ttyACM0".to_string(), "/dev/ttyACM2".to_string()]
    );
}

#[test]
fn test_keyboard_that_never_boots_fails_verification() {
    let harness = Setup {
        normal_port: None,
        config: UpdaterConfig {
            verify: true,
            ..UpdaterConfig::default()
        },
        ..Setup::default()
    }
    .build();
    let log = Arc::clone(&harness.log);

    let handle = harness
        .updater
        .start_session(
            device(model01(), DeviceMode::Bootloader, "/dev/ttyACM0", &log),
            FirmwareSource::Default,
        )
        .unwrap();
    let (_, report) = run_to_end(handle);

    let Outcome::Failed(reason) = report.outcome else {
        panic!("expected failure");
    };
    assert!(matches!(reason, FailureReason::VerificationFailed(_)));
    assert_eq!(reason.phase(), Phase::Verifying);
    assert_eq!(lock(&log).restores, 0);
}

#[test]
fn test_updater_exposes_resolver() {
    let harness = Setup::default().build();
    assert_eq!(harness.updater.resolver().root(), harness.firmware.path());
}
