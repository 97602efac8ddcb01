use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One of the fifteen languages the broker can execute. Fixed at build time;
/// concrete toolchain recipes live in `ceb-languages`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[clap(rename_all = "lowercase")]
pub enum LanguageId {
    Python,
    Javascript,
    Typescript,
    Java,
    C,
    Cpp,
    Csharp,
    Rust,
    Go,
    Php,
    Perl,
    Ruby,
    Lua,
    Swift,
    Objc,
}

impl LanguageId {
    pub const ALL: [LanguageId; 15] = [
        Self::Python,
        Self::Javascript,
        Self::Typescript,
        Self::Java,
        Self::C,
        Self::Cpp,
        Self::Csharp,
        Self::Rust,
        Self::Go,
        Self::Php,
        Self::Perl,
        Self::Ruby,
        Self::Lua,
        Self::Swift,
        Self::Objc,
    ];

    /// Lowercase token used as the wire/path identifier (session workspace
    /// directory names, tool-surface `language` field, scope names).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
            Self::Typescript => "typescript",
            Self::Java => "java",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Csharp => "csharp",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::Php => "php",
            Self::Perl => "perl",
            Self::Ruby => "ruby",
            Self::Lua => "lua",
            Self::Swift => "swift",
            Self::Objc => "objc",
        }
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LanguageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("unknown language '{s}'"))
    }
}

/// The three kinds of session the broker manages (C8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Execution,
    Vscode,
    Playwright,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execution => write!(f, "execution"),
            Self::Vscode => write!(f, "vscode"),
            Self::Playwright => write!(f, "playwright"),
        }
    }
}

/// Session lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Mutable session record, persisted through the metadata store (C5).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub language: Option<LanguageId>,
    pub status: SessionStatus,
    pub memory_budget: String,
    pub workspace_dir: String,
    pub container_id: Option<String>,
    pub endpoints: HashMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_accessed_at: chrono::DateTime<chrono::Utc>,
    pub owner_client_id: String,
    pub bound_port: Option<u16>,
}

/// A request to run source code in a language (one-shot or bound to an
/// existing session).
#[derive(Clone, Debug, Deserialize)]
pub struct ExecutionRequest {
    pub language: LanguageId,
    pub code: String,
    pub session_id: Option<String>,
    pub stdin: Option<String>,
    pub timeout_ms: Option<u64>,
}

pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

impl ExecutionRequest {
    /// Resolved timeout, clamped into `[MIN_TIMEOUT_MS, MAX_TIMEOUT_MS]`.
    pub fn resolved_timeout_ms(&self) -> u64 {
        self.timeout_ms
            .unwrap_or(DEFAULT_TIMEOUT_MS)
            .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
    }
}

/// Result of an execution, returned to the caller.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub wall_time_ms: u64,
    pub peak_memory_mib: Option<u64>,
}

/// Static policy verdict, memoized by a digest of (language, code).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyVerdict {
    pub valid: bool,
    pub reason: Option<String>,
}

impl PolicyVerdict {
    pub fn allow() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Circuit-breaker state for one external dependency (C4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Output format for CLI/health-check responses.
#[derive(Clone, Debug, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
