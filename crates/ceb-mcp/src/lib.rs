//! Tool surface adapter (C10): exposes the broker's five operations as MCP
//! tools over an `rmcp` stdio transport. `BrokerServer` wires the static
//! registry (C1), policy screener (C3), admission controller (C4), session
//! manager (C6, itself wrapping the metadata store and workspace
//! provisioner), session-kind provisioning (C8), and health/metrics (C9)
//! behind one `#[tool_router]` implementation. The execution engine (C7) —
//! command assembly from a language's [`ceb_languages::RunRecipe`], sandboxed
//! spawn, and output capture — lives directly in the `execute_code` handler
//! below; there is no separate execution-engine crate.

use std::collections::HashMap;
use std::sync::Arc;

use ceb_admission::RateLimiter;
use ceb_config::Config;
use ceb_core::{BrokerError, LanguageId, Session, SessionKind, SessionStatus};
use ceb_kinds::{BrowserEngine, PlaywrightProvisionOutcome, PortPool};
use ceb_languages::RunRecipe;
use ceb_metrics::{ComponentHealth, ComponentStatus, HealthReport, MetricsRegistry, SessionCounts};
use ceb_policy::PolicyScreener;
use ceb_process::{ExecutionLimits, SpawnOptions, StreamMode};
use ceb_session::SessionManager;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use tracing::instrument;

const DEFAULT_CLIENT_ID: &str = "stdio-client";

const VSCODE_HELPER_PROGRAM: &str = "code-server";
const VSCODE_TEMPLATES: [&str; 5] = ["basic", "web", "api", "data-science", "machine-learning"];
const VSCODE_MEMORY_TIERS: [&str; 4] = ["1g", "2g", "4g", "8g"];
const VSCODE_DEFAULT_MEMORY: &str = "2g";

const PLAYWRIGHT_INSTALL_PROGRAM: &str = "npx";
const PLAYWRIGHT_MEMORY_TIERS: [&str; 3] = ["2g", "4g", "8g"];
const PLAYWRIGHT_DEFAULT_MEMORY: &str = "2g";

const MIN_VIEWPORT_WIDTH: u32 = 320;
const MAX_VIEWPORT_WIDTH: u32 = 3840;
const MIN_VIEWPORT_HEIGHT: u32 = 240;
const MAX_VIEWPORT_HEIGHT: u32 = 2160;

const SANDBOX_PIDS_MAX: u32 = 64;

/// How long a call waits for an execution slot before giving up with
/// [`BrokerError::QueueTimeout`].
const QUEUE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Execution admission (§4.7/§5): bounds overall concurrency to
// `max_concurrent_executions` and serializes runs within one session, so two
// `execute_code` calls sharing a `session_id` never race inside the same
// workspace directory.
// ---------------------------------------------------------------------------

struct ExecutionAdmission {
    slots: Arc<tokio::sync::Semaphore>,
    session_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held for the duration of one execution. Dropping it releases both the
/// global slot and the per-session lock, in that order.
struct ExecutionPermit {
    _session_guard: tokio::sync::OwnedMutexGuard<()>,
    _slot: tokio::sync::OwnedSemaphorePermit,
}

impl ExecutionAdmission {
    fn new(max_concurrent: u32) -> Self {
        Self {
            slots: Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1) as usize)),
            session_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .lock()
            .expect("session lock map poisoned")
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait for a global execution slot, then for exclusive use of
    /// `session_id`, both bounded by `timeout` in total. Returns
    /// [`BrokerError::QueueTimeout`] if either wait runs past it.
    async fn acquire(&self, session_id: &str, timeout: std::time::Duration) -> Result<ExecutionPermit, BrokerError> {
        let started = std::time::Instant::now();
        let waited = |started: std::time::Instant| started.elapsed().as_millis() as u64;

        let slot = tokio::time::timeout(timeout, Arc::clone(&self.slots).acquire_owned())
            .await
            .map_err(|_| BrokerError::QueueTimeout { waited_ms: waited(started) })?
            .expect("execution semaphore never closes");

        let lock = self.session_lock(session_id);
        let remaining = timeout.saturating_sub(started.elapsed());
        let session_guard = tokio::time::timeout(remaining, lock.lock_owned())
            .await
            .map_err(|_| BrokerError::QueueTimeout { waited_ms: waited(started) })?;

        Ok(ExecutionPermit {
            _session_guard: session_guard,
            _slot: slot,
        })
    }
}

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

/// Parameters for the `execute_code` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCodeParams {
    /// One of the fifteen supported languages (lowercase, e.g. "python", "rust").
    pub language: String,
    /// Source code to run.
    pub code: String,
    /// Run inside this existing session instead of a transient one-shot session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Wall-clock timeout, clamped into [1000, 300000]. Defaults to 30000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Text piped to the program's stdin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

/// Parameters for the `create_vscode_session` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateVscodeSessionParams {
    /// Language the workspace is pre-configured for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// One of "basic", "web", "api", "data-science", "machine-learning".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// One of "1g", "2g", "4g", "8g". Defaults to "2g".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Viewport dimensions for a `create_playwright_session` call.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ViewportParams {
    /// Pixels, clamped into [320, 3840].
    pub width: u32,
    /// Pixels, clamped into [240, 2160].
    pub height: u32,
}

/// Parameters for the `create_playwright_session` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlaywrightSessionParams {
    /// One of "chromium", "firefox", "webkit". Defaults to "chromium".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    /// Defaults to true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<ViewportParams>,
    /// One of "2g", "4g", "8g". Defaults to "2g".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Parameters for the `manage_sessions` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManageSessionsParams {
    /// One of "list", "get", "destroy".
    pub action: String,
    /// Required for "get" and "destroy".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Parameters for the `system_health` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SystemHealthParams {
    /// Include per-component detail in the report. Defaults to false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detailed: Option<bool>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The broker's MCP-facing server. Bundles every long-lived component
/// constructed at startup (C11's [`Config`], C6's [`SessionManager`], C3's
/// [`PolicyScreener`], C4's [`RateLimiter`], C8's [`PortPool`], C9's
/// [`MetricsRegistry`]) behind `Arc` handles so the struct stays cheap to
/// clone, matching `rmcp`'s per-connection handler model.
#[derive(Clone)]
pub struct BrokerServer {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
    policy: Arc<PolicyScreener>,
    rate_limiter: Arc<RateLimiter>,
    vscode_ports: Arc<PortPool>,
    metrics: Arc<MetricsRegistry>,
    admission: Arc<ExecutionAdmission>,
    tool_router: ToolRouter<BrokerServer>,
}

impl BrokerServer {
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionManager>,
        policy: Arc<PolicyScreener>,
        rate_limiter: Arc<RateLimiter>,
        vscode_ports: Arc<PortPool>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let admission = Arc::new(ExecutionAdmission::new(config.max_concurrent_executions));
        Self {
            config,
            sessions,
            policy,
            rate_limiter,
            vscode_ports,
            metrics,
            admission,
            tool_router: Self::tool_router(),
        }
    }

    /// Sweep sessions owned by the single stdio client that have gone idle
    /// past `max_age`. Intended for the entrypoint's periodic cleanup task.
    pub async fn cleanup_expired_sessions(&self, max_age: chrono::Duration) -> usize {
        self.sessions.cleanup_expired(DEFAULT_CLIENT_ID, max_age).await
    }
}

fn json_content<T: serde::Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn text_content(report: String) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(report)]))
}

fn err_result(msg: impl Into<String>) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.into())]))
}

/// Uniform error report: the stable error kind (§7) plus the human-readable
/// reason, so a caller can branch on `kind` without parsing prose. An
/// `Internal` error also echoes the correlation id attached to its tool
/// invocation's span, so an operator can line the report up with the logs.
fn format_error(err: &BrokerError) -> String {
    match err {
        BrokerError::Internal { correlation_id, .. } if !correlation_id.is_empty() => {
            format!(
                "Error ({}): {err} (correlation_id: {correlation_id})",
                err.kind()
            )
        }
        other => format!("Error ({}): {other}", other.kind()),
    }
}

fn rate_limited_err(remaining: std::time::Duration) -> BrokerError {
    BrokerError::RateLimited(format!("retry in {} ms", remaining.as_millis()))
}

fn parse_browser_engine(s: &str) -> Result<BrowserEngine, BrokerError> {
    match s {
        "chromium" => Ok(BrowserEngine::Chromium),
        "firefox" => Ok(BrowserEngine::Firefox),
        "webkit" => Ok(BrowserEngine::Webkit),
        other => Err(BrokerError::BadRequest(format!("unknown browser '{other}'"))),
    }
}

fn playwright_install_args(engine: BrowserEngine) -> Vec<&'static str> {
    vec!["--yes", "playwright", "install", "--with-deps", engine.as_str()]
}

/// Parse a memory-budget string like "512m" or "2g" into megabytes. Falls
/// back to 512 MiB for an unparseable budget rather than failing the run —
/// the budget is advisory sizing for the sandbox, not a validated input.
fn parse_memory_budget_mb(budget: &str) -> u64 {
    let lower = budget.trim().to_ascii_lowercase();
    if let Some(digits) = lower.strip_suffix('g') {
        digits.parse::<u64>().map(|g| g * 1024).unwrap_or(512)
    } else if let Some(digits) = lower.strip_suffix('m') {
        digits.parse::<u64>().unwrap_or(512)
    } else {
        lower.parse::<u64>().unwrap_or(512)
    }
}

/// Expand the literal placeholders a [`RunRecipe`] may reference: `{file}`
/// (full source path), `{dir}` (its parent directory, for `-cp`-style
/// classpath args), and `{class}` (its file stem, the main-class name javac
/// derives for Java — `java`/`javac` require the public class name to match
/// the source file's base name).
fn substitute_file(token: &str, path: &std::path::Path) -> String {
    let dir = path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let class = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    token
        .replace("{file}", &path.display().to_string())
        .replace("{dir}", &dir)
        .replace("{class}", &class)
}

// ---------------------------------------------------------------------------
// Execution engine (C7) — command assembly, sandboxed spawn, output capture
// ---------------------------------------------------------------------------

impl BrokerServer {
    async fn do_execute_code(&self, params: ExecuteCodeParams) -> Result<String, BrokerError> {
        let language: LanguageId = params
            .language
            .parse()
            .map_err(BrokerError::BadRequest)?;

        if params.code.trim().is_empty() {
            return Err(BrokerError::BadRequest("code must not be empty".into()));
        }

        self.rate_limiter
            .consume(DEFAULT_CLIENT_ID, 1)
            .map_err(rate_limited_err)?;

        let verdict = self.policy.screen(language, &params.code);
        if !verdict.valid {
            return Err(BrokerError::PolicyRejected {
                reason: verdict.reason.unwrap_or_else(|| "rejected".to_string()),
            });
        }

        let transient = params.session_id.is_none();
        let session = match &params.session_id {
            Some(id) => self.sessions.get_session(id).await?,
            None => {
                self.sessions
                    .create_session(
                        SessionKind::Execution,
                        Some(language),
                        "512m".to_string(),
                        DEFAULT_CLIENT_ID.to_string(),
                    )
                    .await?
            }
        };

        if !matches!(session.status, SessionStatus::Creating | SessionStatus::Running) {
            return Err(BrokerError::not_found("session", &session.id));
        }

        if session.status == SessionStatus::Creating {
            self.sessions
                .update_status(&session.id, SessionStatus::Running)
                .await?;
        }

        let timeout_ms = params
            .timeout_ms
            .unwrap_or(ceb_core::DEFAULT_TIMEOUT_MS)
            .clamp(ceb_core::MIN_TIMEOUT_MS, ceb_core::MAX_TIMEOUT_MS);

        let permit = self.admission.acquire(&session.id, QUEUE_TIMEOUT).await?;
        let run_result = self
            .run_in_workspace(&session, language, &params.code, params.stdin.clone(), timeout_ms)
            .await;
        drop(permit);

        if transient {
            let _ = self.sessions.destroy_session(&session.id).await;
        } else {
            let _ = self.sessions.touch(&session.id).await;
        }

        let result = run_result?;
        self.metrics.record_session_operation("execute_code");
        self.metrics.observe_duration("execute_code", result.wall_time_ms);

        Ok(format_execution_report(&result))
    }

    /// Assemble and run a language's [`RunRecipe`] inside `session`'s
    /// workspace. Both the compile step (if any) and the run step are
    /// spawned under a resource sandbox sized from the session's memory
    /// budget, resolving the OS-level quota question the same way as
    /// `ceb-process`'s own sandboxed-spawn path.
    async fn run_in_workspace(
        &self,
        session: &Session,
        language: LanguageId,
        code: &str,
        stdin: Option<String>,
        timeout_ms: u64,
    ) -> Result<ceb_core::ExecutionResult, BrokerError> {
        let descriptor = ceb_languages::lookup(language);
        let workspace_dir = std::path::PathBuf::from(&session.workspace_dir);

        let source_path = ceb_process::write_source_file(&workspace_dir, descriptor.source_suffix, code)
            .map_err(|e| BrokerError::internal(format!("failed to write source file: {e}")))?;

        let limits = ExecutionLimits {
            timeout: std::time::Duration::from_millis(timeout_ms),
            ..ExecutionLimits::default()
        };

        let sandbox = ceb_resource::SandboxConfig {
            memory_max_mb: parse_memory_budget_mb(&session.memory_budget),
            memory_swap_max_mb: None,
            pids_max: Some(SANDBOX_PIDS_MAX),
        };

        let base_workspace_dir = self.config.base_workspace_dir(language.as_str());
        let base_env = ceb_workspace::base_workspace_env(language, &base_workspace_dir);

        let outcome = match &descriptor.recipe {
            RunRecipe::Direct { program, args } => {
                let mut cmd = tokio::process::Command::new(program);
                cmd.current_dir(&workspace_dir);
                cmd.envs(base_env.iter().cloned());
                for arg in *args {
                    cmd.arg(substitute_file(arg, &source_path));
                }
                self.spawn_and_wait(cmd, stdin, &sandbox, language, &session.id, limits)
                    .await?
            }
            RunRecipe::CompileThenRun {
                compile_program,
                compile_args,
                run_program,
                run_args,
            } => {
                let mut compile_cmd = tokio::process::Command::new(*compile_program);
                compile_cmd.current_dir(&workspace_dir);
                compile_cmd.envs(base_env.iter().cloned());
                for arg in *compile_args {
                    compile_cmd.arg(substitute_file(arg, &source_path));
                }
                let compile_outcome = self
                    .spawn_and_wait(compile_cmd, None, &sandbox, language, &session.id, limits)
                    .await?;

                if compile_outcome.exit_code != 0 {
                    let _ = std::fs::remove_file(&source_path);
                    return Ok(ceb_core::ExecutionResult {
                        stdout: compile_outcome.stdout,
                        stderr: compile_outcome.stderr,
                        exit_code: compile_outcome.exit_code,
                        wall_time_ms: compile_outcome.wall_time_ms,
                        peak_memory_mib: compile_outcome.peak_memory_mib,
                    });
                }

                let mut run_cmd = tokio::process::Command::new(substitute_file(run_program, &source_path));
                run_cmd.current_dir(&workspace_dir);
                run_cmd.envs(base_env.iter().cloned());
                for arg in *run_args {
                    run_cmd.arg(substitute_file(arg, &source_path));
                }
                self.spawn_and_wait(run_cmd, stdin, &sandbox, language, &session.id, limits)
                    .await?
            }
        };

        let _ = std::fs::remove_file(&source_path);

        if outcome.reason == ceb_process::ExitReason::OutputOverflow {
            return Err(BrokerError::OutputOverflow {
                stream: "stdout".to_string(),
                cap_bytes: limits.stdout_cap_bytes,
            });
        }

        Ok(ceb_core::ExecutionResult {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            wall_time_ms: outcome.wall_time_ms,
            peak_memory_mib: outcome.peak_memory_mib,
        })
    }

    async fn spawn_and_wait(
        &self,
        cmd: tokio::process::Command,
        stdin: Option<String>,
        sandbox: &ceb_resource::SandboxConfig,
        language: LanguageId,
        session_id: &str,
        limits: ExecutionLimits,
    ) -> Result<ceb_process::ExecutionOutcome, BrokerError> {
        let stdin_bytes = stdin.map(String::into_bytes);
        let (child, _handle) = ceb_process::spawn_tool_sandboxed(
            cmd,
            stdin_bytes,
            SpawnOptions::default(),
            Some(sandbox),
            language.as_str(),
            session_id,
        )
        .await
        .map_err(|e| BrokerError::SpawnFailed(e.to_string()))?;

        ceb_process::wait_and_capture(child, StreamMode::BufferOnly, limits)
            .await
            .map_err(|e| BrokerError::internal(e.to_string()))
    }
}

fn format_execution_report(result: &ceb_core::ExecutionResult) -> String {
    let mut report = String::new();
    if !result.stdout.is_empty() {
        report.push_str("Output:\n");
        report.push_str(&result.stdout);
        report.push('\n');
    }
    if !result.stderr.is_empty() {
        report.push_str("Errors:\n");
        report.push_str(&result.stderr);
        report.push('\n');
    }
    report.push_str(&format!("Exit Code: {}\n", result.exit_code));
    report.push_str(&format!("Execution Time: {} ms\n", result.wall_time_ms));
    if let Some(mib) = result.peak_memory_mib {
        report.push_str(&format!("Memory Usage: {mib} MiB\n"));
    }
    report
}

// ---------------------------------------------------------------------------
// Session kinds (C8) — vscode / playwright provisioning
// ---------------------------------------------------------------------------

impl BrokerServer {
    async fn do_create_vscode_session(&self, params: CreateVscodeSessionParams) -> Result<String, BrokerError> {
        self.rate_limiter
            .consume(DEFAULT_CLIENT_ID, 1)
            .map_err(rate_limited_err)?;

        let language = match &params.language {
            Some(s) => Some(s.parse::<LanguageId>().map_err(BrokerError::BadRequest)?),
            None => None,
        };

        let template = params.template.unwrap_or_else(|| "basic".to_string());
        if !VSCODE_TEMPLATES.contains(&template.as_str()) {
            return Err(BrokerError::BadRequest(format!("unknown template '{template}'")));
        }

        let memory = params.memory.unwrap_or_else(|| VSCODE_DEFAULT_MEMORY.to_string());
        if !VSCODE_MEMORY_TIERS.contains(&memory.as_str()) {
            return Err(BrokerError::BadRequest(format!("unsupported memory tier '{memory}'")));
        }

        let session = self
            .sessions
            .create_session(SessionKind::Vscode, language, memory, DEFAULT_CLIENT_ID.to_string())
            .await?;

        let workspace_dir = std::path::PathBuf::from(&session.workspace_dir);
        let outcome = ceb_kinds::provision_vscode_session(
            &self.vscode_ports,
            &self.config.vscode_helper_host,
            VSCODE_HELPER_PROGRAM,
            &workspace_dir,
        )
        .await;

        let session = if let Some(port) = outcome.bound_port {
            self.sessions.set_bound_port(&session.id, Some(port)).await?;
            self.sessions.set_endpoints(&session.id, outcome.endpoints).await?;
            self.sessions
                .update_status(&session.id, SessionStatus::Running)
                .await?
        } else {
            session
        };

        self.metrics.record_session_operation("create_vscode_session");
        Ok(format_vscode_session_report(&session, &template))
    }

    async fn do_create_playwright_session(
        &self,
        params: CreatePlaywrightSessionParams,
    ) -> Result<String, BrokerError> {
        self.rate_limiter
            .consume(DEFAULT_CLIENT_ID, 1)
            .map_err(rate_limited_err)?;

        let browser = match params.browser.as_deref() {
            Some(s) => parse_browser_engine(s)?,
            None => BrowserEngine::Chromium,
        };
        let headless = params.headless.unwrap_or(true);

        let (width, height) = match params.viewport {
            Some(v) => {
                if !(MIN_VIEWPORT_WIDTH..=MAX_VIEWPORT_WIDTH).contains(&v.width) {
                    return Err(BrokerError::BadRequest(format!(
                        "viewport width {} out of range [{MIN_VIEWPORT_WIDTH}, {MAX_VIEWPORT_WIDTH}]",
                        v.width
                    )));
                }
                if !(MIN_VIEWPORT_HEIGHT..=MAX_VIEWPORT_HEIGHT).contains(&v.height) {
                    return Err(BrokerError::BadRequest(format!(
                        "viewport height {} out of range [{MIN_VIEWPORT_HEIGHT}, {MAX_VIEWPORT_HEIGHT}]",
                        v.height
                    )));
                }
                (v.width, v.height)
            }
            None => (1280, 720),
        };

        let memory = params.memory.unwrap_or_else(|| PLAYWRIGHT_DEFAULT_MEMORY.to_string());
        if !PLAYWRIGHT_MEMORY_TIERS.contains(&memory.as_str()) {
            return Err(BrokerError::BadRequest(format!("unsupported memory tier '{memory}'")));
        }

        let session = self
            .sessions
            .create_session(SessionKind::Playwright, None, memory, DEFAULT_CLIENT_ID.to_string())
            .await?;
        let workspace_dir = std::path::PathBuf::from(&session.workspace_dir);
        let install_args = playwright_install_args(browser);

        let outcome = ceb_kinds::provision_playwright_session(
            &session,
            &workspace_dir,
            PLAYWRIGHT_INSTALL_PROGRAM,
            &install_args,
            browser,
        )
        .await;

        let session = self
            .sessions
            .update_status(&session.id, SessionStatus::Running)
            .await?;

        self.metrics.record_session_operation("create_playwright_session");
        Ok(format_playwright_session_report(&session, browser, headless, (width, height), &outcome))
    }
}

fn format_vscode_session_report(session: &Session, template: &str) -> String {
    let endpoint = session
        .endpoints
        .get("http")
        .cloned()
        .unwrap_or_else(|| "(not allocated)".to_string());
    format!(
        "Session ID: {}\nLanguage: {}\nTemplate: {}\nMemory: {}\nStatus: {}\nEndpoint: {}\n",
        session.id,
        session.language.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string()),
        template,
        session.memory_budget,
        session.status,
        endpoint,
    )
}

fn format_playwright_session_report(
    session: &Session,
    browser: BrowserEngine,
    headless: bool,
    viewport: (u32, u32),
    outcome: &PlaywrightProvisionOutcome,
) -> String {
    format!(
        "Session ID: {}\nBrowser: {}\nHeadless: {}\nViewport: {}x{}\nMemory: {}\nStatus: {}\nContext ID: {}\nPage URL: {}\n",
        session.id,
        browser.as_str(),
        headless,
        viewport.0,
        viewport.1,
        session.memory_budget,
        session.status,
        outcome.context_id,
        outcome.page_url,
    )
}

// ---------------------------------------------------------------------------
// Session management (C6 accessor surface)
// ---------------------------------------------------------------------------

impl BrokerServer {
    async fn do_manage_sessions(&self, params: ManageSessionsParams) -> Result<String, BrokerError> {
        match params.action.as_str() {
            "list" => {
                let sessions = self.sessions.list_sessions(Some(DEFAULT_CLIENT_ID)).await;
                Ok(format_session_listing(&sessions))
            }
            "get" => {
                let id = params
                    .session_id
                    .ok_or_else(|| BrokerError::BadRequest("sessionId is required for 'get'".to_string()))?;
                let session = self.sessions.get_session(&id).await?;
                Ok(format_session_record(&session))
            }
            "destroy" => {
                let id = params
                    .session_id
                    .ok_or_else(|| BrokerError::BadRequest("sessionId is required for 'destroy'".to_string()))?;
                self.sessions.destroy_session(&id).await?;
                self.metrics.record_session_operation("destroy_session");
                Ok(format!("Session {id} destroyed.\n"))
            }
            other => Err(BrokerError::BadRequest(format!("unknown action '{other}'"))),
        }
    }
}

fn format_session_listing(sessions: &[Session]) -> String {
    if sessions.is_empty() {
        return "No active sessions.\n".to_string();
    }
    let mut out = format!("{} session(s):\n", sessions.len());
    for s in sessions {
        out.push_str(&format!(
            "  - {} [{}] status={} language={}\n",
            s.id,
            s.kind,
            s.status,
            s.language.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string()),
        ));
    }
    out
}

fn format_session_record(session: &Session) -> String {
    format!(
        "Session ID: {}\nType: {}\nLanguage: {}\nStatus: {}\nMemory: {}\nCreated At: {}\nLast Accessed At: {}\nWorkspace: {}\n",
        session.id,
        session.kind,
        session.language.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string()),
        session.status,
        session.memory_budget,
        session.created_at.to_rfc3339(),
        session.last_accessed_at.to_rfc3339(),
        session.workspace_dir,
    )
}

// ---------------------------------------------------------------------------
// Health & metrics (C9)
// ---------------------------------------------------------------------------

impl BrokerServer {
    fn build_health_report(&self) -> HealthReport {
        let (by_type, by_status, by_language) = self.sessions.stats().snapshot();
        let sessions = SessionCounts {
            by_type,
            by_status,
            by_language,
        };

        let components = vec![
            ComponentHealth {
                name: "policy_screener".to_string(),
                status: ComponentStatus::Healthy,
                detail: None,
            },
            ComponentHealth {
                name: "admission_controller".to_string(),
                status: ComponentStatus::Healthy,
                detail: None,
            },
            ComponentHealth {
                name: "session_manager".to_string(),
                status: ComponentStatus::Healthy,
                detail: None,
            },
        ];

        self.metrics.health_report(components, sessions)
    }
}

fn format_health_report(report: &HealthReport, timestamp: chrono::DateTime<chrono::Utc>, detailed: bool) -> String {
    let mut out = format!(
        "Status: {:?}\nTimestamp: {}\nUptime: {}s\nPlatform: {}\nMemory RSS: {} MiB\nSessions by type: {:?}\nSessions by status: {:?}\nSessions by language: {:?}\n",
        report.overall,
        timestamp.to_rfc3339(),
        report.uptime_secs,
        std::env::consts::OS,
        report.memory.rss_mb,
        report.sessions.by_type,
        report.sessions.by_status,
        report.sessions.by_language,
    );

    if detailed {
        out.push_str("Components:\n");
        for c in &report.components {
            let detail = c
                .detail
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default();
            out.push_str(&format!("  - {}: {:?}{detail}\n", c.name, c.status));
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Tool router
// ---------------------------------------------------------------------------

#[tool_router]
impl BrokerServer {
    #[tool(
        description = "Execute source code in one of the fifteen supported languages (python, javascript, typescript, java, c, cpp, csharp, rust, go, php, perl, ruby, lua, swift, objc). Runs in a transient session unless sessionId binds it to an existing one. Returns output, errors, exit code, execution time, and memory usage."
    )]
    #[instrument(skip(self, params), fields(language = %params.language, correlation_id = tracing::field::Empty))]
    async fn execute_code(&self, Parameters(params): Parameters<ExecuteCodeParams>) -> Result<CallToolResult, McpError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());
        match self.do_execute_code(params).await {
            Ok(report) => text_content(report),
            Err(e) => err_result(format_error(&e.with_correlation_id(&correlation_id))),
        }
    }

    #[tool(
        description = "Create a web-IDE (VS Code in the browser) session bound to a local helper process serving a per-session workspace. Optional language, template (basic, web, api, data-science, machine-learning), and memory tier (1g, 2g, 4g, 8g)."
    )]
    #[instrument(skip(self, params), fields(correlation_id = tracing::field::Empty))]
    async fn create_vscode_session(
        &self,
        Parameters(params): Parameters<CreateVscodeSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());
        match self.do_create_vscode_session(params).await {
            Ok(report) => text_content(report),
            Err(e) => err_result(format_error(&e.with_correlation_id(&correlation_id))),
        }
    }

    #[tool(
        description = "Create a browser-automation session with a synthetic browsing context. Optional browser engine (chromium, firefox, webkit), headless flag, viewport dimensions, and memory tier (2g, 4g, 8g)."
    )]
    #[instrument(skip(self, params), fields(correlation_id = tracing::field::Empty))]
    async fn create_playwright_session(
        &self,
        Parameters(params): Parameters<CreatePlaywrightSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());
        match self.do_create_playwright_session(params).await {
            Ok(report) => text_content(report),
            Err(e) => err_result(format_error(&e.with_correlation_id(&correlation_id))),
        }
    }

    #[tool(
        description = "List, fetch, or destroy sessions. action is one of \"list\", \"get\", \"destroy\"; sessionId is required for \"get\" and \"destroy\"."
    )]
    #[instrument(skip(self, params), fields(correlation_id = tracing::field::Empty))]
    async fn manage_sessions(
        &self,
        Parameters(params): Parameters<ManageSessionsParams>,
    ) -> Result<CallToolResult, McpError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());
        match self.do_manage_sessions(params).await {
            Ok(report) => text_content(report),
            Err(e) => err_result(format_error(&e.with_correlation_id(&correlation_id))),
        }
    }

    #[tool(
        description = "Report overall broker health: status, uptime, memory, and session counts by type/status/language. Pass detailed=true for per-component status."
    )]
    #[instrument(skip(self, params))]
    async fn system_health(&self, Parameters(params): Parameters<SystemHealthParams>) -> Result<CallToolResult, McpError> {
        let report = self.build_health_report();
        let detailed = params.detailed.unwrap_or(false);
        text_content(format_health_report(&report, chrono::Utc::now(), detailed))
    }
}

#[tool_handler]
impl ServerHandler for BrokerServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "ceb-broker".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "A multi-tenant code-execution broker. Use execute_code to run source in one \
                 of fifteen languages, create_vscode_session / create_playwright_session for \
                 longer-lived IDE or browser-automation sessions, manage_sessions to list/get/ \
                 destroy them, and system_health to check broker status."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ceb_admission::RateLimitConfig;
    use ceb_store::MetadataStore;
    use ceb_workspace::WorkspaceProvisioner;
    use std::time::Duration;

    fn test_server_with_rate_limit(root: &std::path::Path, points: u32) -> BrokerServer {
        let mut config = Config::default();
        config.broker_root = root.to_path_buf();
        let config = Arc::new(config);

        let store = Arc::new(MetadataStore::without_durable_tier());
        let workspace = Arc::new(WorkspaceProvisioner::new(config.clone()));
        let sessions = Arc::new(SessionManager::new(config.clone(), store, workspace));
        let policy = Arc::new(PolicyScreener::new());
        let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            points,
            window: Duration::from_secs(60),
            block_duration: Duration::from_millis(50),
        }));
        let vscode_ports = Arc::new(PortPool::new(
            config.vscode_helper_port_range_start..=config.vscode_helper_port_range_end,
        ));
        let metrics = Arc::new(MetricsRegistry::for_testing());

        BrokerServer::new(config, sessions, policy, rate_limiter, vscode_ports, metrics)
    }

    fn test_server(root: &std::path::Path) -> BrokerServer {
        test_server_with_rate_limit(root, 100)
    }

    #[test]
    fn test_parse_memory_budget_mb() {
        assert_eq!(parse_memory_budget_mb("512m"), 512);
        assert_eq!(parse_memory_budget_mb("2g"), 2048);
        assert_eq!(parse_memory_budget_mb("bogus"), 512);
    }

    #[test]
    fn test_substitute_file() {
        let path = std::path::Path::new("/tmp/code_1.rs");
        assert_eq!(substitute_file("{file}", path), "/tmp/code_1.rs");
        assert_eq!(substitute_file("{file}.out", path), "/tmp/code_1.rs.out");
    }

    #[test]
    fn test_substitute_file_dir_and_class_tokens() {
        let path = std::path::Path::new("/tmp/work/code_1.java");
        assert_eq!(substitute_file("{dir}", path), "/tmp/work");
        assert_eq!(substitute_file("{class}", path), "code_1");
        assert_eq!(substitute_file("-cp {dir} {class}", path), "-cp /tmp/work code_1");
    }

    #[test]
    fn test_format_error_includes_kind() {
        let err = BrokerError::PolicyRejected {
            reason: "python-os-system".to_string(),
        };
        let text = format_error(&err);
        assert!(text.contains("policy_rejected"));
        assert!(text.contains("python-os-system"));
    }

    #[test]
    fn test_format_execution_report_includes_fields() {
        let result = ceb_core::ExecutionResult {
            stdout: "hello\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            wall_time_ms: 42,
            peak_memory_mib: Some(8),
        };
        let report = format_execution_report(&result);
        assert!(report.contains("Output:\nhello"));
        assert!(report.contains("Exit Code: 0"));
        assert!(report.contains("Execution Time: 42 ms"));
        assert!(report.contains("Memory Usage: 8 MiB"));
    }

    #[tokio::test]
    async fn test_execute_code_hello_world_python_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let report = server
            .do_execute_code(ExecuteCodeParams {
                language: "python".to_string(),
                code: "print('hello from the broker')".to_string(),
                session_id: None,
                timeout_ms: None,
                stdin: None,
            })
            .await
            .unwrap();

        assert!(report.contains("hello from the broker"));
        assert!(report.contains("Exit Code: 0"));

        let listing = server.sessions.list_sessions(Some(DEFAULT_CLIENT_ID)).await;
        assert!(listing.is_empty());
    }

    #[tokio::test]
    async fn test_execute_code_policy_rejected_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let err = server
            .do_execute_code(ExecuteCodeParams {
                language: "python".to_string(),
                code: "import os; os.system('ls')".to_string(),
                session_id: None,
                timeout_ms: None,
                stdin: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::PolicyRejected { .. }));
        assert!(server.sessions.list_sessions(Some(DEFAULT_CLIENT_ID)).await.is_empty());
    }

    #[tokio::test]
    async fn test_execute_code_timeout_reports_exit_124() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let report = server
            .do_execute_code(ExecuteCodeParams {
                language: "javascript".to_string(),
                code: "while (true) {}".to_string(),
                session_id: None,
                timeout_ms: Some(1000),
                stdin: None,
            })
            .await
            .unwrap();

        assert!(report.contains("Exit Code: 124"));
    }

    #[tokio::test]
    async fn test_execute_code_unsupported_language_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let err = server
            .do_execute_code(ExecuteCodeParams {
                language: "cobol".to_string(),
                code: "DISPLAY 'HI'.".to_string(),
                session_id: None,
                timeout_ms: None,
                stdin: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_manage_sessions_list_get_destroy_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let session = server
            .sessions
            .create_session(
                SessionKind::Execution,
                Some(LanguageId::Python),
                "256m".to_string(),
                DEFAULT_CLIENT_ID.to_string(),
            )
            .await
            .unwrap();

        let listed = server
            .do_manage_sessions(ManageSessionsParams {
                action: "list".to_string(),
                session_id: None,
            })
            .await
            .unwrap();
        assert!(listed.contains(&session.id));

        let fetched = server
            .do_manage_sessions(ManageSessionsParams {
                action: "get".to_string(),
                session_id: Some(session.id.clone()),
            })
            .await
            .unwrap();
        assert!(fetched.contains("Session ID"));

        server
            .do_manage_sessions(ManageSessionsParams {
                action: "destroy".to_string(),
                session_id: Some(session.id.clone()),
            })
            .await
            .unwrap();

        let err = server
            .do_manage_sessions(ManageSessionsParams {
                action: "get".to_string(),
                session_id: Some(session.id),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_manage_sessions_requires_session_id_for_get() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());
        let err = server
            .do_manage_sessions(ManageSessionsParams {
                action: "get".to_string(),
                session_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_create_vscode_session_rejects_unknown_template() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());
        let err = server
            .do_create_vscode_session(CreateVscodeSessionParams {
                language: None,
                template: Some("enterprise".to_string()),
                memory: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_create_playwright_session_rejects_out_of_range_viewport() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());
        let err = server
            .do_create_playwright_session(CreatePlaywrightSessionParams {
                browser: None,
                headless: None,
                viewport: Some(ViewportParams { width: 100, height: 100 }),
                memory: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_create_playwright_session_defaults_to_chromium() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());
        let report = server
            .do_create_playwright_session(CreatePlaywrightSessionParams {
                browser: None,
                headless: None,
                viewport: None,
                memory: None,
            })
            .await
            .unwrap();
        assert!(report.contains("Browser: chromium"));
        assert!(report.contains("Page URL: about:blank"));
    }

    #[tokio::test]
    async fn test_system_health_reports_session_counts() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());
        server
            .sessions
            .create_session(SessionKind::Execution, Some(LanguageId::Rust), "256m".to_string(), DEFAULT_CLIENT_ID.to_string())
            .await
            .unwrap();

        let report = server.build_health_report();
        assert_eq!(report.sessions.by_type.get("execution"), Some(&1));
        assert_eq!(report.overall, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_rate_limit_exhaustion_then_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server_with_rate_limit(dir.path(), 1);

        let first = server
            .do_execute_code(ExecuteCodeParams {
                language: "python".to_string(),
                code: "print(1)".to_string(),
                session_id: None,
                timeout_ms: None,
                stdin: None,
            })
            .await;
        assert!(first.is_ok());

        let second = server
            .do_execute_code(ExecuteCodeParams {
                language: "python".to_string(),
                code: "print(2)".to_string(),
                session_id: None,
                timeout_ms: None,
                stdin: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(second, BrokerError::RateLimited(_)));

        tokio::time::sleep(Duration::from_millis(60)).await;

        let third = server
            .do_execute_code(ExecuteCodeParams {
                language: "python".to_string(),
                code: "print(3)".to_string(),
                session_id: None,
                timeout_ms: None,
                stdin: None,
            })
            .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_admission_queue_timeout_when_slots_exhausted() {
        let admission = ExecutionAdmission::new(1);
        let _held = admission.acquire("session-a", Duration::from_secs(1)).await.unwrap();

        let err = admission
            .acquire("session-b", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::QueueTimeout { .. }));
    }

    #[tokio::test]
    async fn test_admission_serializes_same_session() {
        let admission = ExecutionAdmission::new(4);
        let held = admission.acquire("session-a", Duration::from_secs(1)).await.unwrap();

        // A different session is unaffected by session-a's lock.
        assert!(admission.acquire("session-b", Duration::from_millis(20)).await.is_ok());

        // The same session must wait for the first guard to drop.
        let err = admission
            .acquire("session-a", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::QueueTimeout { .. }));

        drop(held);
        assert!(admission.acquire("session-a", Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_admission_releases_slot_on_drop() {
        let admission = ExecutionAdmission::new(1);
        {
            let _held = admission.acquire("session-a", Duration::from_secs(1)).await.unwrap();
        }
        assert!(admission.acquire("session-b", Duration::from_millis(50)).await.is_ok());
    }
}
