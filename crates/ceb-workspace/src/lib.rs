//! Workspace provisioning (C2): per-language base environments created once
//! at startup, and per-session work directories created/destroyed on
//! demand. Base-workspace failures are logged and degrade that language
//! rather than aborting startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ceb_config::Config;
use ceb_core::LanguageId;
use tracing::{info, warn};

/// Languages whose base workspace failed to provision are still servable —
/// executions simply run without a pre-populated environment.
const BASE_WORKSPACE_CONCURRENCY: usize = 3;
const DEFAULT_STALE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct WorkspaceProvisioner {
    config: Arc<Config>,
}

impl WorkspaceProvisioner {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Idempotently create a base workspace for every supported language,
    /// capped at [`BASE_WORKSPACE_CONCURRENCY`] in flight. A failure for one
    /// language is logged and does not abort the others.
    pub async fn ensure_base_workspaces(&self) -> Vec<(LanguageId, Result<()>)> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(BASE_WORKSPACE_CONCURRENCY));
        let mut handles = Vec::new();

        for lang in LanguageId::ALL {
            let permit = Arc::clone(&semaphore);
            let dir = self.config.base_workspace_dir(lang.as_str());
            handles.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await;
                let result = ensure_base_workspace(lang, &dir).await;
                (lang, result)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((lang, result)) => {
                    if let Err(ref e) = result {
                        warn!(language = %lang, error = %e, "base workspace degraded");
                    }
                    results.push((lang, result));
                }
                Err(e) => warn!("base workspace provisioning task panicked: {e}"),
            }
        }
        results
    }

    /// Create a fresh session workspace directory. Caller already holds a
    /// valid session id (C6 owns id allocation).
    pub async fn new_session_workspace(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.config.session_workspace_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create session workspace {}", dir.display()))?;
        Ok(dir)
    }

    /// Recursively remove a session workspace. Errors are logged, not
    /// surfaced — a missing workspace is not the caller's problem.
    pub async fn destroy_session_workspace(&self, session_id: &str) {
        let dir = self.config.session_workspace_dir(session_id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session_id, error = %e, "failed to remove session workspace");
            }
        }
    }

    /// Scan the sessions root and remove directories whose modification
    /// time is older than `max_age` (default 24h). Intended for startup and
    /// the periodic cleanup sweep (C2/§4.2).
    pub async fn sweep_stale_workspaces(&self, max_age: Option<Duration>) -> Result<usize> {
        let max_age = max_age.unwrap_or(DEFAULT_STALE_MAX_AGE);
        let sessions_root = self.config.broker_root.join("sessions");

        let mut read_dir = match tokio::fs::read_dir(&sessions_root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", sessions_root.display()));
            }
        };

        let now = std::time::SystemTime::now();
        let mut removed = 0usize;
        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let modified = match metadata.modified() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > max_age {
                let path = entry.path();
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to sweep stale workspace");
                } else {
                    info!(path = %path.display(), age_secs = age.as_secs(), "swept stale workspace");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Create the per-language base workspace directory, including the
/// subdirectory tree that language's toolchain expects (a venv-shaped
/// `bin`/`lib` for Python, `.cargo` for Rust, `gopath` for Go, and so on —
/// see [`base_subdirs`]). Real package installation (pip/npm/gem/etc.) is
/// intentionally not modeled here — the skeleton tree and a marker file are
/// what downstream executions observe; install recipes live alongside
/// [`ceb_languages::lookup`].
async fn ensure_base_workspace(lang: LanguageId, dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create base workspace for {lang}"))?;

    for subdir in base_subdirs(lang) {
        tokio::fs::create_dir_all(dir.join(subdir))
            .await
            .with_context(|| format!("failed to create {subdir} for {lang}'s base workspace"))?;
    }

    let marker = dir.join(".ceb-base");
    if !marker.exists() {
        tokio::fs::write(&marker, lang.as_str())
            .await
            .with_context(|| format!("failed to write base workspace marker for {lang}"))?;
    }
    Ok(())
}

/// Subdirectories built under a language's base workspace, matching what its
/// toolchain expects as a package-cache/module-search root.
fn base_subdirs(lang: LanguageId) -> &'static [&'static str] {
    match lang {
        LanguageId::Python => &["bin", "lib/site-packages"],
        LanguageId::Javascript | LanguageId::Typescript => &["node_modules"],
        LanguageId::Go => &["gopath", "gopath/cache"],
        LanguageId::Rust => &[".cargo"],
        LanguageId::Ruby => &["lib/gems"],
        LanguageId::C | LanguageId::Cpp | LanguageId::Objc => &["include", "lib"],
        LanguageId::Java | LanguageId::Csharp => &["lib"],
        LanguageId::Swift => &["build"],
        LanguageId::Php | LanguageId::Perl | LanguageId::Lua => &[],
    }
}

/// Environment variables that point a spawned child at `base_dir`'s
/// pre-populated tree: an interpreter's module search path, a compiler's
/// package-cache root, or both. Returned pairs are meant to be applied with
/// `Command::envs` over the child's otherwise-inherited environment.
pub fn base_workspace_env(lang: LanguageId, base_dir: &Path) -> Vec<(String, String)> {
    match lang {
        LanguageId::Python => vec![
            ("VIRTUAL_ENV".to_string(), base_dir.display().to_string()),
            (
                "PYTHONPATH".to_string(),
                base_dir.join("lib").join("site-packages").display().to_string(),
            ),
            ("PATH".to_string(), prepend_path(&base_dir.join("bin"))),
        ],
        LanguageId::Javascript | LanguageId::Typescript => vec![(
            "NODE_PATH".to_string(),
            base_dir.join("node_modules").display().to_string(),
        )],
        LanguageId::Go => {
            let gopath = base_dir.join("gopath");
            vec![
                ("GOPATH".to_string(), gopath.display().to_string()),
                ("GOCACHE".to_string(), gopath.join("cache").display().to_string()),
            ]
        }
        LanguageId::Rust => vec![(
            "CARGO_HOME".to_string(),
            base_dir.join(".cargo").display().to_string(),
        )],
        LanguageId::Ruby => {
            let gems = base_dir.join("lib").join("gems");
            vec![
                ("GEM_HOME".to_string(), gems.display().to_string()),
                ("GEM_PATH".to_string(), gems.display().to_string()),
            ]
        }
        LanguageId::C | LanguageId::Cpp | LanguageId::Objc => vec![
            (
                "C_INCLUDE_PATH".to_string(),
                base_dir.join("include").display().to_string(),
            ),
            ("LIBRARY_PATH".to_string(), base_dir.join("lib").display().to_string()),
        ],
        LanguageId::Java | LanguageId::Csharp => vec![(
            "CLASSPATH".to_string(),
            base_dir.join("lib").display().to_string(),
        )],
        LanguageId::Swift | LanguageId::Php | LanguageId::Perl | LanguageId::Lua => Vec::new(),
    }
}

fn prepend_path(bin_dir: &Path) -> String {
    match std::env::var_os("PATH") {
        Some(existing) => format!("{}:{}", bin_dir.display(), existing.to_string_lossy()),
        None => bin_dir.display().to_string(),
    }
}
