//! Process-wide configuration (C11): environment variables with typed
//! defaults, plus an optional TOML overlay. Loaded once at startup; every
//! component receives a shared, reference-counted [`Config`] handle. There
//! is no hot-reload — a changed environment requires a process restart.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Resolved, immutable-after-load process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_concurrent_executions: u32,
    pub rate_limit_points: u32,
    pub rate_limit_window_secs: u64,
    pub rate_limit_block_secs: u64,
    pub metadata_store_host: String,
    pub metadata_store_port: u16,
    pub metadata_store_password: Option<String>,
    pub metadata_store_db: u32,
    pub session_timeout_hours: u64,
    pub cleanup_interval_minutes: u64,
    pub max_sessions_per_client: u32,
    pub broker_root: PathBuf,
    pub metrics_port: u16,
    pub vscode_helper_host: String,
    pub vscode_helper_port_range_start: u16,
    pub vscode_helper_port_range_end: u16,
}

/// Optional TOML overlay read from `BROKER_ROOT/config.toml` (or a path
/// given to [`Config::load_from`]). Every field is optional; only present
/// fields override the built-in default before environment variables are
/// applied on top.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    max_concurrent_executions: Option<u32>,
    rate_limit_points: Option<u32>,
    rate_limit_window_secs: Option<u64>,
    rate_limit_block_secs: Option<u64>,
    metadata_store_host: Option<String>,
    metadata_store_port: Option<u16>,
    metadata_store_db: Option<u32>,
    session_timeout_hours: Option<u64>,
    cleanup_interval_minutes: Option<u64>,
    max_sessions_per_client: Option<u32>,
    metrics_port: Option<u16>,
    vscode_helper_host: Option<String>,
    vscode_helper_port_range_start: Option<u16>,
    vscode_helper_port_range_end: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            rate_limit_points: 100,
            rate_limit_window_secs: 60,
            rate_limit_block_secs: 300,
            metadata_store_host: "127.0.0.1".to_string(),
            metadata_store_port: 6379,
            metadata_store_password: None,
            metadata_store_db: 0,
            session_timeout_hours: 24,
            cleanup_interval_minutes: 60,
            max_sessions_per_client: 10,
            broker_root: default_broker_root(),
            metrics_port: 9090,
            vscode_helper_host: "127.0.0.1".to_string(),
            vscode_helper_port_range_start: 8080,
            vscode_helper_port_range_end: 9999,
        }
    }
}

fn default_broker_root() -> PathBuf {
    directories::ProjectDirs::from("", "", "ceb")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("ceb"))
}

impl Config {
    /// Load configuration from the process environment, optionally
    /// overlaying a TOML file at `BROKER_ROOT/config.toml` when it exists.
    /// Returns a shared handle ready to be cloned into every component.
    pub fn load() -> Result<Arc<Self>> {
        let mut config = Self::default();

        if let Some(root) = std::env::var_os("BROKER_ROOT") {
            config.broker_root = PathBuf::from(root);
        }

        let overlay_path = config.broker_root.join("config.toml");
        if overlay_path.exists() {
            let overlay = Self::read_overlay(&overlay_path)
                .with_context(|| format!("failed to parse {}", overlay_path.display()))?;
            config.apply_overlay(overlay);
        }

        config.apply_env()?;
        Ok(Arc::new(config))
    }

    fn read_overlay(path: &std::path::Path) -> Result<ConfigOverlay> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).context("invalid TOML")
    }

    fn apply_overlay(&mut self, overlay: ConfigOverlay) {
        macro_rules! set_if_some {
            ($field:ident) => {
                if let Some(v) = overlay.$field {
                    self.$field = v;
                }
            };
        }
        set_if_some!(max_concurrent_executions);
        set_if_some!(rate_limit_points);
        set_if_some!(rate_limit_window_secs);
        set_if_some!(rate_limit_block_secs);
        set_if_some!(metadata_store_host);
        set_if_some!(metadata_store_port);
        set_if_some!(metadata_store_db);
        set_if_some!(session_timeout_hours);
        set_if_some!(cleanup_interval_minutes);
        set_if_some!(max_sessions_per_client);
        set_if_some!(metrics_port);
        set_if_some!(vscode_helper_host);
        set_if_some!(vscode_helper_port_range_start);
        set_if_some!(vscode_helper_port_range_end);
    }

    /// Environment variables take priority over both the built-in default
    /// and the TOML overlay. A malformed value fails startup outright
    /// rather than silently keeping the old value — an operator who typo'd
    /// an override needs to find out now, not infer it from wrong behavior
    /// later.
    fn apply_env(&mut self) -> Result<()> {
        macro_rules! env_parse {
            ($var:literal, $field:ident) => {
                if let Ok(raw) = std::env::var($var) {
                    self.$field = raw
                        .parse()
                        .with_context(|| format!("invalid {}: {raw:?}", $var))?;
                }
            };
        }

        env_parse!("MAX_CONCURRENT_EXECUTIONS", max_concurrent_executions);
        env_parse!("RATE_LIMIT_POINTS", rate_limit_points);
        env_parse!("RATE_LIMIT_WINDOW_SECS", rate_limit_window_secs);
        env_parse!("RATE_LIMIT_BLOCK_SECS", rate_limit_block_secs);
        env_parse!("METADATA_STORE_HOST", metadata_store_host);
        env_parse!("METADATA_STORE_PORT", metadata_store_port);
        env_parse!("METADATA_STORE_DB", metadata_store_db);
        env_parse!("SESSION_TIMEOUT_HOURS", session_timeout_hours);
        env_parse!("CLEANUP_INTERVAL_MINUTES", cleanup_interval_minutes);
        env_parse!("MAX_SESSIONS_PER_CLIENT", max_sessions_per_client);
        env_parse!("METRICS_PORT", metrics_port);
        env_parse!("VSCODE_HELPER_HOST", vscode_helper_host);
        env_parse!(
            "VSCODE_HELPER_PORT_RANGE_START",
            vscode_helper_port_range_start
        );
        env_parse!(
            "VSCODE_HELPER_PORT_RANGE_END",
            vscode_helper_port_range_end
        );

        if let Ok(password) = std::env::var("METADATA_STORE_PASSWORD") {
            self.metadata_store_password = Some(password);
        }

        if self.vscode_helper_port_range_start > self.vscode_helper_port_range_end {
            bail!(
                "VSCODE_HELPER_PORT_RANGE_START ({}) exceeds VSCODE_HELPER_PORT_RANGE_END ({})",
                self.vscode_helper_port_range_start,
                self.vscode_helper_port_range_end
            );
        }

        Ok(())
    }

    /// Workspace directory root for a given language's base environment:
    /// `{broker_root}/venvs/{language}`.
    pub fn base_workspace_dir(&self, language: &str) -> PathBuf {
        self.broker_root.join("venvs").join(language)
    }

    /// Workspace directory for a single session: `{broker_root}/sessions/{id}`.
    pub fn session_workspace_dir(&self, session_id: &str) -> PathBuf {
        self.broker_root.join("sessions").join(session_id)
    }
}
