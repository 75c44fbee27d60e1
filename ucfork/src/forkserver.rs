//! An AFL forkserver that forks nothing.
//!
//! `afl-fuzz` expects a forking target: it asks for a run, gets a pid back, and later the
//! exit status. Here every "fork" is a restore of the [`Context`] taken right after boot.
//! A decoy child (`/bin/cat` by default) stands in for the forked process, so the fuzzer
//! still has a pid to supervise. When the fuzzer kills it on timeout, the guest run is
//! stopped at the next basic block.
//!
//! The wire protocol is the usual one: `FORKSRV_FD` is the control channel, `FORKSRV_FD + 1`
//! the status channel, and every frame is 4 bytes, little endian.

use core::{
    cell::RefCell,
    convert::Infallible,
    fmt::{self, Debug, Formatter},
    ops::DerefMut,
    sync::atomic::{AtomicBool, Ordering},
};
use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{self, Child, Command, Stdio},
    rc::Rc,
    sync::Arc,
    thread,
};

use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitid, Id, WaitPidFlag},
    },
    unistd::Pid,
};
use ucfork_bolts::{os::adopt_fd, shmem::UnixShMem, Error};

use crate::{
    config::{ForkserverMode, SessionConfig},
    context::Context,
    coverage::EdgeCoverage,
    emu::{Emulator, ExitKind},
};

/// The control channel, as set up by `afl-fuzz`. Status is one above.
pub const FORKSRV_FD: i32 = 198;

/// Sent once, before the first control message is read
pub const FORKSRV_HELLO: [u8; 4] = [1, 2, 3, 4];

/// Reported for guest faults: `(status & 0x7f) != 0`, so the fuzzer sees a crash
pub const FAULT_STATUS: u32 = 255 + 2;

/// A wait status as `afl-fuzz` interprets it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkserverStatus(u32);

impl ForkserverStatus {
    /// Encode the outcome of a guest run.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn from_run(res: &Result<ExitKind, Error>) -> Self {
        match res {
            Ok(ExitKind::Exit(code)) => Self(((*code as u32) & 0xff) << 8),
            Ok(ExitKind::Stopped) => Self(Signal::SIGKILL as u32),
            Ok(ExitKind::Crash(_)) | Err(_) => Self(FAULT_STATUS),
        }
    }

    /// The status word as written to the fuzzer
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Whether the fuzzer will count this as a crash or a timeout kill
    #[must_use]
    pub fn is_fault(self) -> bool {
        self.0 & 0x7f != 0
    }

    /// The code a process would have exited with, `None` for faults
    #[must_use]
    pub fn exit_code(self) -> Option<i32> {
        if self.is_fault() {
            None
        } else {
            Some(((self.0 >> 8) & 0xff) as i32)
        }
    }

    /// The 4 byte status frame
    #[must_use]
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

/// Where the forkserver loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ForkserverState {
    /// Created, nothing sent yet
    Idle,
    /// Sending the hello
    Handshake,
    /// Blocked on the next control message
    WaitControl,
    /// Starting the decoy and sending its pid
    SpawnDecoy,
    /// Putting the boot snapshot back
    Restoring,
    /// The guest is running
    Running,
    /// Sending the run's status
    ReportStatus,
}

/// The child `afl-fuzz` thinks it forked.
#[derive(Debug)]
pub struct Decoy {
    child: Child,
}

impl Decoy {
    /// Start `command`. Its stdin stays open, so a `cat` lives until killed.
    pub fn spawn(command: &Path) -> Result<Self, Error> {
        let child = Command::new(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                Error::spawn(format!("Failed to spawn decoy {}: {err}", command.display()))
            })?;
        Ok(Self { child })
    }

    /// The pid reported to the fuzzer
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Set `cancel` as soon as the decoy exits, from a detached thread.
    ///
    /// The watcher never reaps the child, that is left to [`Decoy::kill`].
    pub fn watch(&self, cancel: Arc<AtomicBool>) -> Result<(), Error> {
        let pid = Pid::from_raw(self.child.id() as i32);
        thread::Builder::new()
            .name(format!("decoy-{pid}"))
            .spawn(move || {
                match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                    Ok(_) | Err(Errno::ECHILD) => {}
                    Err(err) => log::warn!("Watching decoy {pid} failed: {err}"),
                }
                cancel.store(true, Ordering::Relaxed);
            })
            .map_err(|err| Error::spawn(format!("Failed to spawn decoy watcher: {err}")))?;
        Ok(())
    }

    /// Kill and reap. Fine to call on an already dead decoy.
    pub fn kill(mut self) {
        let pid = Pid::from_raw(self.child.id() as i32);
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => log::warn!("Failed to kill decoy {pid}: {err}"),
        }
        if let Err(err) = self.child.wait() {
            log::warn!("Failed to reap decoy {pid}: {err}");
        }
    }
}

/// The forkserver loop for one guest.
pub struct Forkserver<E, M, C, S> {
    emu: E,
    context: Context,
    coverage: Rc<RefCell<EdgeCoverage<M>>>,
    control: C,
    status: S,
    decoy_command: PathBuf,
    state: ForkserverState,
    iterations: u64,
}

impl<E, M, C, S> Debug for Forkserver<E, M, C, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forkserver")
            .field("state", &self.state)
            .field("iterations", &self.iterations)
            .field("regions", &self.context.regions().len())
            .field("decoy_command", &self.decoy_command)
            .finish_non_exhaustive()
    }
}

impl<E, M, C, S> Forkserver<E, M, C, S>
where
    E: Emulator,
    M: DerefMut<Target = [u8]> + 'static,
    C: Read,
    S: Write,
{
    /// Hook coverage into a freshly booted guest and snapshot it.
    ///
    /// A partial snapshot is an error: restoring it would not reproduce the boot state.
    pub fn new(
        mut emu: E,
        map: M,
        control: C,
        status: S,
        config: &SessionConfig,
    ) -> Result<Self, Error> {
        let coverage = Rc::new(RefCell::new(EdgeCoverage::new(map)?));
        EdgeCoverage::install(&coverage, &mut emu)?;
        let context = Context::save(&mut emu)?.into_result()?;

        Ok(Self {
            emu,
            context,
            coverage,
            control,
            status,
            decoy_command: config.decoy_command().to_path_buf(),
            state: ForkserverState::Idle,
            iterations: 0,
        })
    }

    /// Where the loop is, or where it stopped
    #[must_use]
    pub fn state(&self) -> ForkserverState {
        self.state
    }

    /// Runs completed and reported
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// The guest engine
    #[must_use]
    pub fn emulator(&self) -> &E {
        &self.emu
    }

    /// The coverage recorder shared with the block hook
    #[must_use]
    pub fn coverage(&self) -> &Rc<RefCell<EdgeCoverage<M>>> {
        &self.coverage
    }

    fn write_frame(&mut self, frame: [u8; 4], what: &str) -> Result<(), Error> {
        self.status
            .write_all(&frame)
            .and_then(|()| self.status.flush())
            .map_err(|err| Error::protocol(format!("Failed to send {what}: {err}")))
    }

    /// Send the hello, then serve runs until the fuzzer goes away or something breaks.
    pub fn serve(&mut self, args: &[String], env: &[String]) -> Result<Infallible, Error> {
        self.state = ForkserverState::Handshake;
        self.write_frame(FORKSRV_HELLO, "hello")?;
        log::info!("Forkserver is up");

        loop {
            if let Err(err) = self.iteration(args, env) {
                log::error!("Forkserver stopped after {} runs: {err}", self.iterations);
                return Err(err);
            }
            self.iterations += 1;
        }
    }

    fn iteration(&mut self, args: &[String], env: &[String]) -> Result<(), Error> {
        self.state = ForkserverState::WaitControl;
        let mut msg = [0_u8; 4];
        self.control
            .read_exact(&mut msg)
            .map_err(|err| Error::protocol(format!("Failed to receive control signal: {err}")))?;

        self.state = ForkserverState::SpawnDecoy;
        let decoy = Decoy::spawn(&self.decoy_command)?;
        let cancel = self.coverage.borrow_mut().begin_iteration();
        if let Err(err) = decoy.watch(cancel) {
            decoy.kill();
            return Err(err);
        }
        let pid = decoy.pid();
        if let Err(err) = self.write_frame(pid.to_le_bytes(), "pid") {
            decoy.kill();
            return Err(err);
        }
        log::debug!("Run {} with decoy {pid}", self.iterations);

        let status = match self.restore_and_run(args, env) {
            Ok(status) => status,
            Err(err) => {
                // the fuzzer is waiting for a status for this pid
                if let Err(report) = self.write_frame(FAULT_STATUS.to_le_bytes(), "fault") {
                    log::error!("{report}");
                }
                decoy.kill();
                return Err(err);
            }
        };

        self.state = ForkserverState::ReportStatus;
        let sent = self.write_frame(status.to_le_bytes(), "status");
        decoy.kill();
        sent
    }

    fn restore_and_run(
        &mut self,
        args: &[String],
        env: &[String],
    ) -> Result<ForkserverStatus, Error> {
        self.state = ForkserverState::Restoring;
        self.context
            .restore(&mut self.emu)
            .map_err(|err| Error::fatal(format!("Context restore failed: {err}")))?;

        self.state = ForkserverState::Running;
        let res = self.emu.run(args, env);
        match &res {
            Ok(ExitKind::Crash(reason)) => log::debug!("Guest crashed: {reason}"),
            Err(err) => log::debug!("Guest run failed: {err}"),
            Ok(_) => {}
        }
        Ok(ForkserverStatus::from_run(&res))
    }
}

/// Run the guest exactly once, for when no fuzzer is serving us.
///
/// The outcome is encoded the same way the forkserver reports it, so a guest exit code can
/// never be mistaken for a fault.
pub fn run_once<E>(emu: &mut E, args: &[String], env: &[String]) -> ForkserverStatus
where
    E: Emulator + ?Sized,
{
    let res = emu.run(args, env);
    match &res {
        Ok(ExitKind::Exit(code)) => log::info!("Guest exited with {code}"),
        Ok(ExitKind::Crash(reason)) => log::error!("Guest crashed: {reason}"),
        Ok(ExitKind::Stopped) => log::error!("Guest was stopped"),
        Err(err) => log::error!("Guest run failed: {err}"),
    }
    ForkserverStatus::from_run(&res)
}

/// Serve `afl-fuzz` with a booted guest, in whatever mode the environment asks for.
///
/// Single run mode returns the status of the run, forkserver mode only returns on error.
pub fn start<E>(
    mut emu: E,
    config: &SessionConfig,
    args: &[String],
    env: &[String],
) -> Result<ForkserverStatus, Error>
where
    E: Emulator,
{
    match ForkserverMode::from_env()? {
        ForkserverMode::SingleRun(shm_id) => {
            if let Some(id) = shm_id {
                let map = UnixShMem::shmem_from_id_and_size(id, config.map_size())?;
                let coverage = Rc::new(RefCell::new(EdgeCoverage::new(map)?));
                EdgeCoverage::install(&coverage, &mut emu)?;
                coverage.borrow_mut().begin_iteration();
            } else {
                log::info!("No coverage map attached, running once");
            }
            Ok(run_once(&mut emu, args, env))
        }
        ForkserverMode::Forkserver(id) => {
            let map = UnixShMem::shmem_from_id_and_size(id, config.map_size())?;
            // Safety: afl-fuzz hands these to us and nothing else in the process uses them
            let control = unsafe { adopt_fd(config.control_fd()) }?;
            let status = unsafe { adopt_fd(config.status_fd()) }?;
            let mut forkserver = Forkserver::new(emu, map, control, status, config)?;
            forkserver.serve(args, env).map(|never| match never {})
        }
    }
}

/// [`start`], then exit the process with the guest's code.
///
/// Faults and session errors end the process with `SIGABRT` instead, so the parent sees a
/// signal death no exit code can produce.
pub fn start_and_exit<E>(emu: E, config: &SessionConfig, args: &[String], env: &[String]) -> !
where
    E: Emulator,
{
    match start(emu, config, args, env) {
        Ok(status) => match status.exit_code() {
            Some(code) => process::exit(code),
            None => process::abort(),
        },
        Err(err) => {
            log::error!("Session failed: {err}");
            process::abort()
        }
    }
}
