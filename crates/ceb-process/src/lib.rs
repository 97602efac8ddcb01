//! Subprocess spawning, output capture, and timeout/termination policy.
//!
//! This is the low-level half of the execution engine: given an assembled
//! [`tokio::process::Command`], it spawns the child (optionally under a
//! resource sandbox from [`ceb_resource`]), drains stdout/stderr
//! concurrently with byte-level reads so partial-line output (progress bars,
//! REPL prompts) never looks like a hang, enforces a wall-clock deadline and
//! per-stream output cap, and reports a uniform [`ExecutionOutcome`].

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use ceb_resource::cgroup::SandboxConfig;
use ceb_resource::monitor::MemoryMonitor;
use ceb_resource::rlimit::RssWatcher;
use ceb_resource::sandbox::{SandboxCapability, detect_sandbox_capability};

/// Controls whether stdout is additionally forwarded to this process's
/// stderr in real time, as a `[stdout] `-prefixed tee. The MCP-facing
/// execution path always uses [`StreamMode::BufferOnly`]; `TeeToStderr` is
/// useful when driving this crate from an interactive CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    #[default]
    BufferOnly,
    TeeToStderr,
}

/// Holds sandbox resources that must live as long as the child process.
pub enum SandboxHandle {
    /// cgroup scope guard — dropped to stop the scope.
    Cgroup(ceb_resource::cgroup::CgroupScopeGuard),
    /// `setrlimit` was applied in the child; optional RSS watcher polls externally.
    Rlimit { watcher: Option<RssWatcher> },
    /// No sandbox active.
    None,
}

/// Why an execution ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The child exited on its own before the deadline.
    Exited,
    /// The wall-clock deadline elapsed; the child was terminated.
    TimedOut,
    /// Stdout crossed its byte cap; the child was terminated and the run is
    /// reported as failed, not merely truncated.
    OutputOverflow,
}

/// Result of executing a command to completion (or to forced termination).
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code. `124` on timeout, matching the shell convention
    /// this broker's result reporting follows.
    pub exit_code: i32,
    pub wall_time_ms: u64,
    pub peak_memory_mib: Option<u64>,
    pub reason: ExitReason,
    pub stderr_truncated: bool,
}

/// Per-stream byte caps and the wall-clock deadline for one execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub stdout_cap_bytes: usize,
    pub stderr_cap_bytes: usize,
    /// Grace period between the polite (SIGTERM) and forceful (SIGKILL)
    /// termination signals.
    pub termination_grace: Duration,
}

pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_STDIN_WRITE_TIMEOUT_SECS: u64 = 30;
const READ_BUF_SIZE: usize = 4096;

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            stdout_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
            stderr_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }
}

/// Spawn-time process control options.
#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions {
    pub stdin_write_timeout: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            stdin_write_timeout: Duration::from_secs(DEFAULT_STDIN_WRITE_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PreExecPolicy {
    SetsidOnly,
    SetsidAndRlimits {
        memory_max_mb: u64,
        pids_max: Option<u64>,
    },
}

/// Spawn a child process without waiting for it to complete.
///
/// - Captures stdout/stderr (piped)
/// - Pipes stdin when `stdin_data` is provided, otherwise closes it
/// - Isolates the child in its own process group (`setsid`) so termination
///   signals can target the whole group, not just the immediate child
/// - Enables `kill_on_drop` as a safety net against orphaned children
pub async fn spawn_tool(cmd: Command, stdin_data: Option<Vec<u8>>) -> Result<tokio::process::Child> {
    spawn_tool_with_options(cmd, stdin_data, SpawnOptions::default()).await
}

pub async fn spawn_tool_with_options(
    cmd: Command,
    stdin_data: Option<Vec<u8>>,
    spawn_options: SpawnOptions,
) -> Result<tokio::process::Child> {
    spawn_tool_with_pre_exec(cmd, stdin_data, PreExecPolicy::SetsidOnly, spawn_options).await
}

async fn spawn_tool_with_pre_exec(
    mut cmd: Command,
    stdin_data: Option<Vec<u8>>,
    pre_exec_policy: PreExecPolicy,
    spawn_options: SpawnOptions,
) -> Result<tokio::process::Child> {
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    if stdin_data.is_some() {
        cmd.stdin(std::process::Stdio::piped());
    } else {
        cmd.stdin(std::process::Stdio::null());
    }
    cmd.kill_on_drop(true);

    // SAFETY: setsid() and setrlimit are async-signal-safe and run before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(move || {
            libc::setsid();
            match pre_exec_policy {
                PreExecPolicy::SetsidOnly => Ok(()),
                PreExecPolicy::SetsidAndRlimits {
                    memory_max_mb,
                    pids_max,
                } => ceb_resource::rlimit::apply_rlimits(memory_max_mb, pids_max)
                    .map_err(std::io::Error::other),
            }
        });
    }
    #[cfg(not(unix))]
    let _ = pre_exec_policy;

    let mut child = cmd.spawn().context("failed to spawn command")?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            let stdin_write_timeout = spawn_options.stdin_write_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(stdin_write_timeout, async {
                    stdin.write_all(&data).await?;
                    stdin.shutdown().await?;
                    Ok::<_, std::io::Error>(())
                })
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("stdin write error: {e}"),
                    Err(_) => warn!(
                        timeout_secs = stdin_write_timeout.as_secs(),
                        "stdin write timed out"
                    ),
                }
            });
        } else {
            warn!("stdin was requested but no piped stdin handle was available");
        }
    }

    Ok(child)
}

/// Spawn a child with optional resource sandboxing.
///
/// When `sandbox` is `Some`, the child is wrapped in resource isolation
/// based on the host's detected [`SandboxCapability`]:
/// - `CgroupV2`: relaunched under `systemd-run --user --scope`.
/// - `Setrlimit`: `RLIMIT_AS`/`RLIMIT_NPROC` applied in `pre_exec`, plus an
///   [`RssWatcher`] polling from the parent side as a secondary net.
/// - `None`: falls through to [`spawn_tool_with_options`] unchanged.
pub async fn spawn_tool_sandboxed(
    cmd: Command,
    stdin_data: Option<Vec<u8>>,
    spawn_options: SpawnOptions,
    sandbox: Option<&SandboxConfig>,
    language: &str,
    session_id: &str,
) -> Result<(tokio::process::Child, SandboxHandle)> {
    let Some(config) = sandbox else {
        let child = spawn_tool_with_options(cmd, stdin_data, spawn_options).await?;
        return Ok((child, SandboxHandle::None));
    };

    match detect_sandbox_capability() {
        SandboxCapability::CgroupV2 => {
            spawn_with_cgroup(cmd, stdin_data, spawn_options, config, language, session_id).await
        }
        SandboxCapability::Setrlimit => spawn_with_rlimit(cmd, stdin_data, spawn_options, config).await,
        SandboxCapability::None => {
            debug!("no sandbox capability detected; spawning without isolation");
            let child = spawn_tool_with_options(cmd, stdin_data, spawn_options).await?;
            Ok((child, SandboxHandle::None))
        }
    }
}

async fn spawn_with_cgroup(
    original_cmd: Command,
    stdin_data: Option<Vec<u8>>,
    spawn_options: SpawnOptions,
    config: &SandboxConfig,
    language: &str,
    session_id: &str,
) -> Result<(tokio::process::Child, SandboxHandle)> {
    let scope_cmd = ceb_resource::cgroup::create_scope_command(language, session_id, config);

    let mut tokio_cmd = Command::from(scope_cmd);
    tokio_cmd.arg(original_cmd.as_std().get_program());
    tokio_cmd.args(original_cmd.as_std().get_args());

    let envs: Vec<_> = original_cmd
        .as_std()
        .get_envs()
        .filter_map(|(k, v)| v.map(|val| (k.to_owned(), val.to_owned())))
        .collect();
    for (key, val) in &envs {
        tokio_cmd.env(key, val);
    }

    if let Some(dir) = original_cmd.as_std().get_current_dir() {
        tokio_cmd.current_dir(dir);
    }

    let child = spawn_tool_with_options(tokio_cmd, stdin_data, spawn_options).await?;
    let guard = ceb_resource::cgroup::CgroupScopeGuard::new(language, session_id);

    debug!(scope = %guard.scope_name(), pid = child.id(), "spawned execution inside cgroup scope");

    Ok((child, SandboxHandle::Cgroup(guard)))
}

async fn spawn_with_rlimit(
    cmd: Command,
    stdin_data: Option<Vec<u8>>,
    spawn_options: SpawnOptions,
    config: &SandboxConfig,
) -> Result<(tokio::process::Child, SandboxHandle)> {
    let memory_max_mb = config.memory_max_mb;
    let pids_max = config.pids_max.map(u64::from);

    let child = spawn_tool_with_pre_exec(
        cmd,
        stdin_data,
        PreExecPolicy::SetsidAndRlimits {
            memory_max_mb,
            pids_max,
        },
        spawn_options,
    )
    .await?;

    let watcher = child.id().and_then(|pid| {
        debug!(pid, memory_max_mb, "starting RSS watcher for sandboxed execution");
        match RssWatcher::start(pid, memory_max_mb, Duration::from_secs(5)) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("failed to start RSS watcher: {e:#}");
                None
            }
        }
    });

    Ok((child, SandboxHandle::Rlimit { watcher }))
}

/// Wait for a spawned child, enforcing `limits`, and return the outcome.
///
/// Stdout and stderr are drained concurrently via byte-level reads (not
/// `read_line`) so partial-line progress output never looks like a hang.
/// Peak memory is sampled via [`MemoryMonitor`] when the child PID is known.
///
/// IMPORTANT: `child`'s stdout must be piped (stderr is optional). This
/// function takes ownership of both handles.
pub async fn wait_and_capture(
    mut child: tokio::process::Child,
    stream_mode: StreamMode,
    limits: ExecutionLimits,
) -> Result<ExecutionOutcome> {
    let started = Instant::now();
    let monitor = child.id().map(MemoryMonitor::start);

    let stdout = child.stdout.take().context("failed to capture stdout")?;
    let stderr = child.stderr.take();

    let mut stdout_reader = BufReader::new(stdout);
    let mut stderr_reader = stderr.map(BufReader::new);

    let mut out: Vec<u8> = Vec::new();
    let mut err: Vec<u8> = Vec::new();
    let mut stderr_truncated = false;
    let mut reason = ExitReason::Exited;

    let deadline = tokio::time::sleep(limits.timeout);
    tokio::pin!(deadline);

    let mut stdout_buf = [0u8; READ_BUF_SIZE];
    let mut stderr_buf = [0u8; READ_BUF_SIZE];
    let mut stdout_done = false;
    let mut stderr_done = stderr_reader.is_none();

    'drain: while !stdout_done || !stderr_done {
        let stderr_read = async {
            match stderr_reader.as_mut() {
                Some(r) => r.read(&mut stderr_buf).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = stdout_reader.read(&mut stdout_buf), if !stdout_done => {
                match result {
                    Ok(0) => stdout_done = true,
                    Ok(n) => {
                        if stream_mode == StreamMode::TeeToStderr {
                            eprint!("[stdout] {}", String::from_utf8_lossy(&stdout_buf[..n]));
                        }
                        out.extend_from_slice(&stdout_buf[..n]);
                        if out.len() > limits.stdout_cap_bytes {
                            reason = ExitReason::OutputOverflow;
                            warn!(cap = limits.stdout_cap_bytes, "stdout exceeded cap; terminating execution");
                            terminate(&mut child, limits.termination_grace).await;
                            break 'drain;
                        }
                    }
                    Err(_) => stdout_done = true,
                }
            }
            result = stderr_read, if !stderr_done => {
                match result {
                    Ok(0) => stderr_done = true,
                    Ok(n) => {
                        if err.len() < limits.stderr_cap_bytes {
                            let remaining = limits.stderr_cap_bytes - err.len();
                            let take = remaining.min(n);
                            err.extend_from_slice(&stderr_buf[..take]);
                            if take < n {
                                stderr_truncated = true;
                            }
                        } else {
                            stderr_truncated = true;
                        }
                    }
                    Err(_) => stderr_done = true,
                }
            }
            _ = &mut deadline => {
                reason = ExitReason::TimedOut;
                warn!(timeout_secs = limits.timeout.as_secs(), "execution exceeded wall-clock timeout");
                terminate(&mut child, limits.termination_grace).await;
                break 'drain;
            }
        }
    }

    let status = child.wait().await.context("failed to wait for command")?;
    let peak_memory_mib = match monitor {
        Some(m) => Some(m.stop().await),
        None => None,
    };

    let exit_code = match reason {
        ExitReason::TimedOut => 124,
        ExitReason::OutputOverflow => status.code().unwrap_or(1),
        ExitReason::Exited => status.code().unwrap_or_else(|| {
            warn!("process terminated by signal, reporting exit code 1");
            1
        }),
    };

    if stderr_truncated {
        err.extend_from_slice(b"\n[stderr truncated: output cap exceeded]\n");
    }

    Ok(ExecutionOutcome {
        stdout: String::from_utf8_lossy(&out).into_owned(),
        stderr: String::from_utf8_lossy(&err).into_owned(),
        exit_code,
        wall_time_ms: started.elapsed().as_millis() as u64,
        peak_memory_mib,
        reason,
        stderr_truncated,
    })
}

/// Two-phase termination: a polite process-group SIGTERM, then — if the
/// child has not exited after `grace` — a forceful process-group SIGKILL.
async fn terminate(child: &mut tokio::process::Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill() is async-signal-safe; negative PID targets the group.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
            return;
        }
    }
    let _ = child.start_kill();
}

/// Check if an executable is reachable via `PATH`.
pub async fn check_tool_installed(executable: &str) -> Result<()> {
    let output = Command::new("which")
        .arg(executable)
        .output()
        .await
        .context("failed to execute 'which'")?;

    if !output.status.success() {
        anyhow::bail!("'{executable}' is not installed or not in PATH");
    }

    Ok(())
}

/// Write `code` to a fresh file in `dir` named `code_<unixMillis>_<token><suffix>`.
pub fn write_source_file(dir: &Path, suffix: &str, code: &str) -> Result<std::path::PathBuf> {
    use std::io::Write;
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    // Process-unique jitter without an RNG dependency: combine pid with a
    // stack address, good enough to avoid same-millisecond collisions in
    // one session workspace.
    let addr = &millis as *const _ as usize;
    let token = (std::process::id() ^ (addr as u32)) & 0xFF_FFFF;
    let path = dir.join(format!("code_{millis}_{token:06x}{suffix}"));
    let mut f = std::fs::File::create(&path).context("failed to create source file")?;
    f.write_all(code.as_bytes())
        .context("failed to write source file")?;
    Ok(path)
}
