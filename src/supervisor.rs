use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::sleep;
#[cfg(windows)]
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityTracker;
use crate::config::UpstreamConfig;
use crate::errors::SupervisorError;
use crate::monitor;
use crate::port::{self, LOOPBACK_HOST};
use crate::state::{ProcessState, SupervisorStatus};

/// State machine owning one external server process per logical site.
///
/// Cloning is cheap and yields a handle to the same supervised process.
/// `start()`/`stop()` are serialized by one lock held for the full duration
/// of each transition; `is_running()`, `record_activity()` and `dial_addr()`
/// read lock-free mirrors that are only written while that lock is held.
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) config: UpstreamConfig,
    pub(crate) activity: ActivityTracker,
    /// Identity of the current running episode. Incremented on every start,
    /// so background tasks holding an older value know they are stale.
    pub(crate) epoch: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
    /// Assigned port while running, 0 otherwise.
    port: AtomicU16,
}

struct Lifecycle {
    phase: ProcessState,
    epoch: u64,
    pid: Option<u32>,
    port: Option<u16>,
}

impl ProcessSupervisor {
    /// Validates the configuration and creates a supervisor in the
    /// `NotStarted` phase. Nothing is spawned until the first `start()`.
    pub fn new(mut config: UpstreamConfig) -> Result<Self, SupervisorError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                activity: ActivityTracker::new(),
                epoch: AtomicU64::new(0),
                lifecycle: Mutex::new(Lifecycle {
                    phase: ProcessState::NotStarted,
                    epoch: 0,
                    pid: None,
                    port: None,
                }),
                running: AtomicBool::new(false),
                port: AtomicU16::new(0),
            }),
        })
    }

    /// Starts the process if it is not already running.
    ///
    /// Runs the preparation step to completion, allocates an ephemeral port,
    /// spawns the server with the rendered argument vector, and wires up the
    /// exit watcher and idle monitor for the new episode. Returns once the
    /// process handle exists; the server may not be accepting connections
    /// yet. Blocks concurrent `start()`/`stop()` callers for the duration.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let shared = &self.shared;
        let mut state = shared.lifecycle.lock().await;
        if !state.phase.accepts_start() {
            return Ok(());
        }
        state.phase = ProcessState::Starting;

        if let Some(prepare) = shared.config.prepare.clone() {
            if let Err(err) = run_preparation(&shared.config, &prepare).await {
                state.phase = ProcessState::Stopped;
                return Err(err);
            }
        }

        let assigned_port = match port::allocate_port().await {
            Ok(value) => value,
            Err(err) => {
                state.phase = ProcessState::Stopped;
                return Err(SupervisorError::PortAllocation(err));
            }
        };
        info!(
            site = %shared.config.location,
            port = assigned_port,
            "assigned ephemeral port to upstream process"
        );

        let args = render_args(&shared.config.args, assigned_port, &shared.config.location);
        let mut command = Command::new(&shared.config.program);
        #[cfg(unix)]
        {
            // Own process group so stop can signal the whole tree.
            unsafe {
                command.pre_exec(|| {
                    if nix::libc::setpgid(0, 0) == 0 {
                        Ok(())
                    } else {
                        Err(io::Error::last_os_error())
                    }
                });
            }
        }
        command
            .args(&args)
            .current_dir(&shared.config.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !shared.config.env.is_empty() {
            command.envs(&shared.config.env);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                state.phase = ProcessState::Stopped;
                return Err(SupervisorError::SpawnFailed {
                    program: shared.config.program.clone(),
                    source,
                });
            }
        };
        let Some(pid) = child.id() else {
            let _ = child.kill().await;
            state.phase = ProcessState::Stopped;
            return Err(SupervisorError::SpawnFailed {
                program: shared.config.program.clone(),
                source: io::Error::new(io::ErrorKind::Other, "spawned child has no pid"),
            });
        };

        let epoch = state.epoch.wrapping_add(1);
        state.epoch = epoch;
        shared.epoch.store(epoch, Ordering::SeqCst);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(
                stdout,
                "stdout",
                shared.config.location.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(
                stderr,
                "stderr",
                shared.config.location.clone(),
            ));
        }

        shared.activity.record();
        state.pid = Some(pid);
        state.port = Some(assigned_port);
        state.phase = ProcessState::Running;
        shared.running.store(true, Ordering::SeqCst);
        shared.port.store(assigned_port, Ordering::SeqCst);

        spawn_exit_watcher(Arc::clone(&self.shared), epoch, child, pid);
        monitor::spawn_idle_monitor(Arc::clone(&self.shared), epoch);

        info!(
            site = %shared.config.location,
            pid,
            port = assigned_port,
            "started upstream process"
        );
        Ok(())
    }

    /// Stops the process if it is running. Never fails from the caller's
    /// perspective: a termination request that is not honored within the
    /// configured grace period escalates to a forced kill, and kill failures
    /// are logged rather than surfaced.
    pub async fn stop(&self) {
        let mut state = self.shared.lifecycle.lock().await;
        self.shared.shutdown_locked(&mut state).await;
    }

    /// Whether the process handle currently exists and has not exited.
    ///
    /// Lock-free; the underlying flag is written only under the start/stop
    /// lock, so readers never observe a half-finished transition.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Marks the process as used right now. Callable at request frequency;
    /// never contends on the start/stop lock.
    pub fn record_activity(&self) {
        self.shared.activity.record();
    }

    /// Loopback address to dial, meaningful only while running.
    pub fn dial_addr(&self) -> Option<String> {
        let port = self.shared.port.load(Ordering::SeqCst);
        if port == 0 || !self.is_running() {
            return None;
        }
        Some(format!("{LOOPBACK_HOST}:{port}"))
    }

    /// Snapshot of the current lifecycle state, taken under the lock.
    pub async fn status(&self) -> SupervisorStatus {
        let state = self.shared.lifecycle.lock().await;
        SupervisorStatus {
            state: state.phase,
            pid: state.pid,
            port: state.port,
            epoch: state.epoch,
            idle_ms: self.shared.activity.idle_for().as_millis() as u64,
        }
    }
}

impl Shared {
    /// Stops the process only if the given episode is still the current one.
    /// Used by background tasks so a stale monitor never disturbs a process
    /// that was started again in the interim.
    pub(crate) async fn stop_epoch(&self, epoch: u64) {
        let mut state = self.lifecycle.lock().await;
        if state.epoch != epoch {
            return;
        }
        self.shutdown_locked(&mut state).await;
    }

    async fn shutdown_locked(&self, state: &mut Lifecycle) {
        if state.phase != ProcessState::Running {
            return;
        }
        state.phase = ProcessState::Stopping;
        self.running.store(false, Ordering::SeqCst);

        if let Some(pid) = state.pid {
            if let Err(err) = terminate_pid(pid, self.config.stop_timeout).await {
                warn!(
                    site = %self.config.location,
                    pid,
                    "failed to terminate upstream process cleanly: {err}"
                );
            }
        }

        state.pid = None;
        state.port = None;
        state.phase = ProcessState::Stopped;
        self.port.store(0, Ordering::SeqCst);
        info!(site = %self.config.location, "stopped upstream process");
    }
}

/// Waits for the child to exit and clears running state, whatever the cause.
/// A crash is not an error: the next caller simply observes "not running".
fn spawn_exit_watcher(shared: Arc<Shared>, epoch: u64, mut child: Child, pid: u32) {
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => {
                info!(
                    site = %shared.config.location,
                    pid,
                    code = ?status.code(),
                    "upstream process exited"
                );
            }
            Err(err) => {
                error!(
                    site = %shared.config.location,
                    pid,
                    "failed to wait on upstream process: {err}"
                );
            }
        }

        let mut state = shared.lifecycle.lock().await;
        if state.epoch != epoch {
            return;
        }
        if state.phase == ProcessState::Running {
            state.phase = ProcessState::Stopped;
            shared.running.store(false, Ordering::SeqCst);
        }
        state.pid = None;
        state.port = None;
        shared.port.store(0, Ordering::SeqCst);
    });
}

async fn run_preparation(
    config: &UpstreamConfig,
    argv: &[String],
) -> Result<(), SupervisorError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(SupervisorError::InvalidConfig(
            "preparation command cannot be empty".to_string(),
        ));
    };

    info!(
        site = %config.location,
        command = %argv.join(" "),
        "running preparation step"
    );
    let output = Command::new(program)
        .args(args)
        .current_dir(&config.directory)
        .envs(&config.env)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| SupervisorError::PreparationFailed(format!("failed to run {program}: {err}")))?;

    if !output.stdout.is_empty() {
        debug!(
            site = %config.location,
            "preparation stdout: {}",
            String::from_utf8_lossy(&output.stdout).trim_end()
        );
    }
    if !output.stderr.is_empty() {
        debug!(
            site = %config.location,
            "preparation stderr: {}",
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SupervisorError::PreparationFailed(format!(
            "{program} exited with {:?}: {}",
            output.status.code(),
            stderr.trim()
        )));
    }
    Ok(())
}

/// Substitutes the launch placeholders into the configured argument vector.
/// Arguments are always passed as a vector, never through a shell, so values
/// with spaces or special characters stay intact.
fn render_args(args: &[String], port: u16, location: &str) -> Vec<String> {
    let port = port.to_string();
    args.iter()
        .map(|arg| arg.replace("{port}", &port).replace("{location}", location))
        .collect()
}

/// Re-emits one of the child's output streams line by line through tracing.
/// Ends at EOF when the process exits.
async fn forward_output<R>(stream: R, channel: &'static str, site: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(site = %site, channel, "{line}"),
            Ok(None) => return,
            Err(err) => {
                debug!(site = %site, channel, "output stream closed: {err}");
                return;
            }
        }
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => false,
    }
}

#[cfg(windows)]
fn process_exists(pid: u32) -> bool {
    use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

    let mut system = System::new_all();
    system.refresh_processes(ProcessesToUpdate::Some(&[SysPid::from_u32(pid)]), true);
    system.process(SysPid::from_u32(pid)).is_some()
}

#[cfg(unix)]
async fn terminate_pid(pid: u32, timeout: Duration) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let os_pid = Pid::from_raw(pid as i32);
    let pgid = Pid::from_raw(-(pid as i32));

    let mut delivered = false;
    match kill(pgid, Signal::SIGINT) {
        Ok(()) => delivered = true,
        Err(Errno::ESRCH) => {}
        Err(err) => {
            warn!("failed to send SIGINT to process group {pgid} for pid {pid}: {err}");
        }
    }

    if !delivered {
        match kill(os_pid, Signal::SIGINT) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(err) => {
                return Err(anyhow::anyhow!("failed to send SIGINT to {pid}: {err}"));
            }
        }
    }

    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if !process_exists(pid) {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }

    if process_exists(pid) {
        let _ = kill(pgid, Signal::SIGKILL);
        let _ = kill(os_pid, Signal::SIGKILL);
    }

    Ok(())
}

#[cfg(windows)]
async fn terminate_pid(pid: u32, timeout: Duration) -> Result<()> {
    use anyhow::Context;

    if !process_exists(pid) {
        return Ok(());
    }

    let taskkill_timeout = timeout.max(Duration::from_secs(2));
    let pid_string = pid.to_string();
    let graceful_status = tokio_timeout(
        taskkill_timeout,
        Command::new("taskkill")
            .args(["/PID", &pid_string, "/T"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await
    .context("taskkill timed out during graceful stop")?
    .context("failed to run taskkill for graceful stop")?;

    if !graceful_status.success() && !process_exists(pid) {
        return Ok(());
    }

    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if !process_exists(pid) {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }

    if process_exists(pid) {
        let force_status = tokio_timeout(
            taskkill_timeout,
            Command::new("taskkill")
                .args(["/PID", &pid_string, "/T", "/F"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await
        .context("taskkill timed out during forced stop")?
        .context("failed to run taskkill for forced stop")?;
        if !force_status.success() && process_exists(pid) {
            anyhow::bail!("failed to force-kill process {pid} with taskkill");
        }
    }

    Ok(())
}

#[cfg(not(any(unix, windows)))]
async fn terminate_pid(_pid: u32, _timeout: Duration) -> Result<()> {
    Ok(())
}
