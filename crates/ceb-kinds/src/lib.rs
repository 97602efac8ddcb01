//! Session-kind specializations (C8): the one-shot execution session, the
//! web-IDE session (binds a local helper to a pooled TCP port), and the
//! browser-automation session (best-effort toolkit install, synthetic
//! browsing context). The helper and automation-toolkit child programs
//! themselves are external collaborators — this crate only spawns,
//! addresses, and reaps them.

use std::collections::{HashSet, VecDeque};
use std::ops::RangeInclusive;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ceb_core::Session;
use rand::Rng;
use tracing::{info, warn};

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);
const PORT_ALLOC_ATTEMPTS: usize = 16;

/// Bitmap-style pool of TCP ports in a fixed range. Released ports are held
/// in a cool-down queue for [`DEFAULT_COOLDOWN`] before becoming allocable
/// again, to avoid handing out a port still lingering in `TIME_WAIT`.
pub struct PortPool {
    range: RangeInclusive<u16>,
    cooldown: Duration,
    in_use: Mutex<HashSet<u16>>,
    cooling: Mutex<VecDeque<(Instant, u16)>>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            cooldown: DEFAULT_COOLDOWN,
            in_use: Mutex::new(HashSet::new()),
            cooling: Mutex::new(VecDeque::new()),
        }
    }

    #[cfg(test)]
    fn with_cooldown(range: RangeInclusive<u16>, cooldown: Duration) -> Self {
        Self {
            range,
            cooldown,
            in_use: Mutex::new(HashSet::new()),
            cooling: Mutex::new(VecDeque::new()),
        }
    }

    /// Drain cool-down entries whose cool-down has elapsed back into the
    /// free set, then allocate the lowest free port in range. Falls back to
    /// an offset + random probe when the sequential scan is exhausted.
    pub fn allocate(&self) -> Option<u16> {
        self.drain_cooldown();

        let mut in_use = self.in_use.lock().expect("port pool mutex poisoned");
        for port in self.range.clone() {
            if !in_use.contains(&port) {
                in_use.insert(port);
                return Some(port);
            }
        }
        drop(in_use);

        self.allocate_random_fallback()
    }

    fn allocate_random_fallback(&self) -> Option<u16> {
        let mut rng = rand::thread_rng();
        let span = self.range.end() - self.range.start() + 1;
        let mut in_use = self.in_use.lock().expect("port pool mutex poisoned");
        for _ in 0..PORT_ALLOC_ATTEMPTS {
            let offset = rng.gen_range(0..span);
            let candidate = self.range.start() + offset;
            if !in_use.contains(&candidate) {
                in_use.insert(candidate);
                return Some(candidate);
            }
        }
        warn!("port pool exhausted after random fallback attempts");
        None
    }

    /// Return a port to the pool. It remains unavailable until the
    /// cool-down elapses.
    pub fn release(&self, port: u16) {
        self.cooling
            .lock()
            .expect("port pool mutex poisoned")
            .push_back((Instant::now(), port));
    }

    fn drain_cooldown(&self) {
        let mut cooling = self.cooling.lock().expect("port pool mutex poisoned");
        let mut in_use = self.in_use.lock().expect("port pool mutex poisoned");
        while let Some((released_at, _)) = cooling.front() {
            if released_at.elapsed() < self.cooldown {
                break;
            }
            if let Some((_, port)) = cooling.pop_front() {
                in_use.remove(&port);
            }
        }
    }
}

/// Browser engines a playwright-style session may bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserEngine {
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chromium => "chromium",
            Self::Firefox => "firefox",
            Self::Webkit => "webkit",
        }
    }
}

/// Outcome of provisioning a web-IDE session's helper process.
pub struct VscodeProvisionOutcome {
    pub endpoints: std::collections::HashMap<String, String>,
    pub bound_port: Option<u16>,
}

/// Attempt to bind a local helper to a pooled port and serve `workspace_dir`.
/// On any failure (pool exhaustion, spawn failure, binary missing) the
/// session still provisions as workspace-only — no endpoint is set, per
/// §4.8.
pub async fn provision_vscode_session(
    pool: &PortPool,
    helper_host: &str,
    helper_program: &str,
    workspace_dir: &std::path::Path,
) -> VscodeProvisionOutcome {
    let Some(port) = pool.allocate() else {
        warn!("web-IDE session falling back to workspace-only: port pool exhausted");
        return VscodeProvisionOutcome {
            endpoints: Default::default(),
            bound_port: None,
        };
    };

    let mut cmd = tokio::process::Command::new(helper_program);
    cmd.arg("--host").arg(helper_host);
    cmd.arg("--port").arg(port.to_string());
    cmd.arg("--workspace").arg(workspace_dir);

    match ceb_process::spawn_tool(cmd, None).await {
        Ok(mut child) => {
            // Fire-and-forget: the helper outlives this call. Reap it in the
            // background so it never becomes a zombie.
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            let mut endpoints = std::collections::HashMap::new();
            endpoints.insert(
                "http".to_string(),
                format!("http://{helper_host}:{port}"),
            );
            info!(port, "web-IDE helper started");
            VscodeProvisionOutcome {
                endpoints,
                bound_port: Some(port),
            }
        }
        Err(e) => {
            warn!(error = %e, "web-IDE helper failed to start; falling back to workspace-only");
            pool.release(port);
            VscodeProvisionOutcome {
                endpoints: Default::default(),
                bound_port: None,
            }
        }
    }
}

/// Outcome of provisioning a browser-automation session.
pub struct PlaywrightProvisionOutcome {
    pub context_id: String,
    pub page_url: String,
    pub engine: BrowserEngine,
}

/// Best-effort install the automation toolkit and its driver bundle inside
/// the session workspace, then hand back a synthetic browsing context.
/// Install failures are logged, not fatal — the context is still returned.
pub async fn provision_playwright_session(
    session: &Session,
    workspace_dir: &std::path::Path,
    install_program: &str,
    install_args: &[&str],
    engine: BrowserEngine,
) -> PlaywrightProvisionOutcome {
    let mut cmd = tokio::process::Command::new(install_program);
    cmd.args(install_args);
    cmd.current_dir(workspace_dir);

    match ceb_process::spawn_tool(cmd, None).await {
        Ok(child) => match ceb_process::wait_and_capture(
            child,
            ceb_process::StreamMode::BufferOnly,
            ceb_process::ExecutionLimits::default(),
        )
        .await
        {
            Ok(outcome) if outcome.exit_code == 0 => {
                info!(session_id = %session.id, "automation toolkit install succeeded");
            }
            Ok(outcome) => {
                warn!(session_id = %session.id, exit_code = outcome.exit_code, "automation toolkit install exited non-zero");
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "automation toolkit install failed");
            }
        },
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "failed to spawn automation toolkit installer");
        }
    }

    PlaywrightProvisionOutcome {
        context_id: session.id.clone(),
        page_url: "about:blank".to_string(),
        engine,
    }
}
