//! Language-server child process lifecycle: spawn, parent liveness
//! monitoring, and graceful-then-forced termination.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STATE_RUNNING: u8 = 0;
const STATE_TERMINATING: u8 = 1;
const STATE_TERMINATED: u8 = 2;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);
const PARENT_PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Builds the shell command that starts the language server.
///
/// On unix the server gets its own process group, so termination signals
/// reach any grandchildren it spawns.
fn create_server_command(cmd: &str, env: HashMap<String, String>, cwd: &str) -> Command {
    #[cfg(target_os = "windows")]
    {
        use winapi::um::winbase::CREATE_NO_WINDOW;

        let mut command = Command::new("cmd.exe");
        command
            .arg("/s")
            .arg("/c")
            .arg(cmd)
            .envs(env)
            .current_dir(Path::new(cwd))
            .creation_flags(CREATE_NO_WINDOW);
        command
    }

    #[cfg(not(target_os = "windows"))]
    {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .envs(env)
            .current_dir(Path::new(cwd))
            .process_group(0);
        command
    }
}

/// The server's piped stdio, handed to the relay (stdin/stdout) and the
/// stderr logger.
pub struct ServerIo {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Owns the server child process. Running → Terminating → Terminated;
/// `terminate` is re-entrant and a no-op once termination is underway.
#[derive(Clone)]
pub struct Supervisor {
    child: Arc<RwLock<Option<Child>>>,
    pid: u32,
    state: Arc<AtomicU8>,
    grace: Duration,
}

impl Supervisor {
    pub fn spawn(command: &str, env: HashMap<String, String>, cwd: &str) -> Result<(Self, ServerIo)> {
        info!("starting language server: {}", command);

        let mut child = create_server_command(command, env, cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn language server: {}", command))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to get server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to get server stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to get server stderr"))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("language server exited before startup completed"))?;

        let supervisor = Self {
            child: Arc::new(RwLock::new(Some(child))),
            pid,
            state: Arc::new(AtomicU8::new(STATE_RUNNING)),
            grace: DEFAULT_GRACE_PERIOD,
        };

        Ok((
            supervisor,
            ServerIo {
                stdin,
                stdout,
                stderr,
            },
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Waits for the server to exit and returns its status.
    pub async fn wait(&self) -> Option<ExitStatus> {
        let status = {
            let mut guard = self.child.write().await;
            match guard.as_mut() {
                Some(child) => child.wait().await.ok(),
                None => None,
            }
        };
        self.state.store(STATE_TERMINATED, Ordering::SeqCst);

        match &status {
            Some(status) if status.success() => info!("language server exited cleanly"),
            Some(status) => warn!("language server exited with status: {}", status),
            None => {}
        }
        status
    }

    /// Asks the server to exit, escalating to a forced kill of the whole
    /// process tree after the grace period.
    pub async fn terminate(&self) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_TERMINATING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            // Already terminating or already gone.
            return;
        }

        info!("terminating language server (pid {})", self.pid);
        terminate_gracefully(self.pid);

        tokio::time::sleep(self.grace).await;
        if self.state.load(Ordering::SeqCst) != STATE_TERMINATED {
            warn!(
                "language server did not exit within {:?}, killing process tree",
                self.grace
            );
            kill_forcefully(self.pid);
        }
    }
}

/// Monitors the given parent process and terminates the server once the
/// parent is gone. The probe is non-destructive.
pub fn watch_parent(supervisor: Supervisor, parent_pid: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(PARENT_PROBE_INTERVAL).await;
            if !process_alive(parent_pid) {
                info!("parent process {} is gone, shutting down", parent_pid);
                supervisor.terminate().await;
                break;
            }
        }
    })
}

/// Drains the server's stderr so its diagnostics are not lost.
pub fn spawn_stderr_logger(stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("server stderr: {}", line);
        }
        debug!("server stderr handler ended");
    })
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything. EPERM still
    // means the process exists.
    if unsafe { libc::kill(pid as i32, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn process_alive(pid: u32) -> bool {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::minwinbase::STILL_ACTIVE;
    use winapi::um::processthreadsapi::{GetExitCodeProcess, OpenProcess};
    use winapi::um::winnt::PROCESS_QUERY_LIMITED_INFORMATION;

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut code = 0u32;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE
    }
}

#[cfg(unix)]
fn terminate_gracefully(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(unix)]
fn kill_forcefully(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

// Windows has no process-group signals; taskkill /T reaps the whole tree.
#[cfg(windows)]
fn terminate_gracefully(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .output();
}

#[cfg(windows)]
fn kill_forcefully(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}
