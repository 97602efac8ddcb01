//! Session lifecycle management (C6): allocates ids, enforces the status
//! state machine, and delegates persistence to the metadata store (C5).
//! Creating a `Session` here never starts a subprocess — that is the
//! execution engine's job (C7), invoked once the caller has a session to
//! run code against.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ceb_config::Config;
use ceb_core::{BrokerError, LanguageId, Session, SessionKind, SessionStatus};
use ceb_store::MetadataStore;
use ceb_workspace::WorkspaceProvisioner;
use tracing::{debug, info};

/// In-memory counters by type/status/language, maintained incrementally as
/// sessions are created, transitioned, and destroyed. The metadata store's
/// tiers only index by owner (§4.5), so the process-wide totals C9 reports
/// live here instead of behind a full-store scan.
#[derive(Default)]
pub struct SessionStats {
    by_type: Mutex<HashMap<String, u64>>,
    by_status: Mutex<HashMap<String, u64>>,
    by_language: Mutex<HashMap<String, u64>>,
}

impl SessionStats {
    fn record_create(&self, kind: SessionKind, language: Option<LanguageId>, status: SessionStatus) {
        bump(&self.by_type, kind.to_string());
        bump(&self.by_status, status.to_string());
        if let Some(lang) = language {
            bump(&self.by_language, lang.to_string());
        }
    }

    fn record_status_change(&self, from: SessionStatus, to: SessionStatus) {
        drop_one(&self.by_status, from.to_string());
        bump(&self.by_status, to.to_string());
    }

    fn record_destroy(&self, kind: SessionKind, language: Option<LanguageId>, status: SessionStatus) {
        drop_one(&self.by_type, kind.to_string());
        drop_one(&self.by_status, status.to_string());
        if let Some(lang) = language {
            drop_one(&self.by_language, lang.to_string());
        }
    }

    /// Current totals, as `(by_type, by_status, by_language)`.
    pub fn snapshot(&self) -> (HashMap<String, u64>, HashMap<String, u64>, HashMap<String, u64>) {
        (
            self.by_type.lock().expect("stats mutex poisoned").clone(),
            self.by_status.lock().expect("stats mutex poisoned").clone(),
            self.by_language.lock().expect("stats mutex poisoned").clone(),
        )
    }
}

fn bump(map: &Mutex<HashMap<String, u64>>, key: String) {
    *map.lock().expect("stats mutex poisoned").entry(key).or_insert(0) += 1;
}

fn drop_one(map: &Mutex<HashMap<String, u64>>, key: String) {
    if let Some(count) = map.lock().expect("stats mutex poisoned").get_mut(&key) {
        *count = count.saturating_sub(1);
    }
}

pub struct SessionManager {
    config: Arc<Config>,
    store: Arc<MetadataStore>,
    workspace: Arc<WorkspaceProvisioner>,
    stats: SessionStats,
}

impl SessionManager {
    pub fn new(config: Arc<Config>, store: Arc<MetadataStore>, workspace: Arc<WorkspaceProvisioner>) -> Self {
        Self {
            config,
            store,
            workspace,
            stats: SessionStats::default(),
        }
    }

    /// Process-wide session counters for the health report (C9).
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Fetch one session by id.
    pub async fn get_session(&self, id: &str) -> Result<Session, BrokerError> {
        self.require_session(id).await
    }

    /// Set the bound TCP port (web-IDE sessions). Same status guard as
    /// [`Self::set_endpoints`].
    pub async fn set_bound_port(&self, id: &str, port: Option<u16>) -> Result<Session, BrokerError> {
        let mut session = self.require_session(id).await?;
        if !matches!(session.status, SessionStatus::Creating | SessionStatus::Running) {
            return Err(BrokerError::BadRequest(format!(
                "cannot bind a port on a session with status {:?}",
                session.status
            )));
        }
        session.bound_port = port;
        session.last_accessed_at = chrono::Utc::now();
        self.store.put(&session).await;
        Ok(session)
    }

    /// Allocate an id, provision a workspace directory, persist the session
    /// with `status = creating`. Does not start any subprocess.
    pub async fn create_session(
        &self,
        kind: SessionKind,
        language: Option<LanguageId>,
        memory_budget: String,
        owner_client_id: String,
    ) -> Result<Session, BrokerError> {
        let live = self.store.list_by_owner(&owner_client_id).await.len() as u32;
        if live >= self.config.max_sessions_per_client {
            return Err(BrokerError::RateLimited(format!(
                "client '{owner_client_id}' already has {live} sessions (limit {})",
                self.config.max_sessions_per_client
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();

        let workspace_dir = self
            .workspace
            .new_session_workspace(&id)
            .await
            .map_err(|e| BrokerError::internal(format!("workspace provisioning failed: {e}")))?;

        let now = chrono::Utc::now();
        let session = Session {
            id: id.clone(),
            kind,
            language,
            status: SessionStatus::Creating,
            memory_budget,
            workspace_dir: workspace_dir.display().to_string(),
            container_id: None,
            endpoints: HashMap::new(),
            created_at: now,
            last_accessed_at: now,
            owner_client_id,
            bound_port: None,
        };

        self.store.put(&session).await;
        self.stats.record_create(session.kind, session.language, session.status);
        info!(session_id = %id, kind = %session.kind, "session created");
        Ok(session)
    }

    /// Apply the status state machine. `creating -> {running, error}`,
    /// `running -> stopped`. `stopped`/`error` are terminal.
    pub async fn update_status(
        &self,
        id: &str,
        new_status: SessionStatus,
    ) -> Result<Session, BrokerError> {
        let mut session = self.require_session(id).await?;

        if !is_valid_transition(session.status, new_status) {
            return Err(BrokerError::BadRequest(format!(
                "invalid session status transition {:?} -> {:?}",
                session.status, new_status
            )));
        }

        self.stats.record_status_change(session.status, new_status);
        session.status = new_status;
        session.last_accessed_at = chrono::Utc::now();
        self.store.put(&session).await;
        debug!(session_id = id, status = %new_status, "session status updated");
        Ok(session)
    }

    /// Set the endpoint map. Only valid while the session is `creating` or
    /// `running`.
    pub async fn set_endpoints(
        &self,
        id: &str,
        endpoints: HashMap<String, String>,
    ) -> Result<Session, BrokerError> {
        let mut session = self.require_session(id).await?;

        if !matches!(session.status, SessionStatus::Creating | SessionStatus::Running) {
            return Err(BrokerError::BadRequest(format!(
                "cannot set endpoints on a session with status {:?}",
                session.status
            )));
        }

        session.endpoints = endpoints;
        session.last_accessed_at = chrono::Utc::now();
        self.store.put(&session).await;
        Ok(session)
    }

    /// Refresh `last_accessed_at` without otherwise touching the record.
    pub async fn touch(&self, id: &str) -> Result<Session, BrokerError> {
        let mut session = self.require_session(id).await?;
        session.last_accessed_at = chrono::Utc::now();
        self.store.put(&session).await;
        Ok(session)
    }

    /// Force a transition to terminal (if not already there), tear down
    /// the workspace, and remove the session from the metadata store.
    /// Unlike [`Self::update_status`], this accepts any originating status —
    /// destroying a session is always a legal move, including from
    /// `creating`.
    pub async fn destroy_session(&self, id: &str) -> Result<(), BrokerError> {
        let mut session = self.require_session(id).await?;

        if !matches!(session.status, SessionStatus::Stopped | SessionStatus::Error) {
            self.stats.record_status_change(session.status, SessionStatus::Stopped);
            session.status = SessionStatus::Stopped;
            session.last_accessed_at = chrono::Utc::now();
            self.store.put(&session).await;
        }

        self.workspace.destroy_session_workspace(id).await;
        self.store.delete(id).await;
        self.stats.record_destroy(session.kind, session.language, session.status);
        info!(session_id = id, "session destroyed");
        Ok(())
    }

    /// List sessions, optionally filtered by owner. Listing across all
    /// owners is intentionally not exposed by the metadata store's
    /// tier-aware index (§4.5); callers without an owner get an empty
    /// sequence rather than a full-store scan.
    pub async fn list_sessions(&self, owner_client_id: Option<&str>) -> Vec<Session> {
        match owner_client_id {
            Some(owner) => self.store.list_by_owner(owner).await,
            None => Vec::new(),
        }
    }

    /// Remove sessions whose `last_accessed_at` is older than `max_age`,
    /// scoped to one owner at a time (the only index the store supports).
    pub async fn cleanup_expired(
        &self,
        owner_client_id: &str,
        max_age: chrono::Duration,
    ) -> usize {
        let cutoff = chrono::Utc::now() - max_age;
        let stale: Vec<String> = self
            .store
            .list_by_owner(owner_client_id)
            .await
            .into_iter()
            .filter(|s| s.last_accessed_at < cutoff)
            .map(|s| s.id)
            .collect();

        let mut removed = 0;
        for id in stale {
            if self.destroy_session(&id).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    async fn require_session(&self, id: &str) -> Result<Session, BrokerError> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| BrokerError::not_found("session", id))
    }
}

fn is_valid_transition(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Creating, Running) | (Creating, Error) | (Running, Stopped) | (Running, Error)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ceb_config::Config;

    async fn manager(root: &std::path::Path) -> SessionManager {
        let mut config = Config::default();
        config.broker_root = root.to_path_buf();
        let config = Arc::new(config);
        let store = Arc::new(MetadataStore::without_durable_tier());
        let workspace = Arc::new(WorkspaceProvisioner::new(Arc::clone(&config)));
        SessionManager::new(config, store, workspace)
    }

    #[tokio::test]
    async fn test_create_session_starts_in_creating_status() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create_session(
                SessionKind::Execution,
                Some(LanguageId::Python),
                "512m".to_string(),
                "client-1".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Creating);
        assert!(std::path::Path::new(&session.workspace_dir).exists());
    }

    #[tokio::test]
    async fn test_valid_transition_creating_to_running() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create_session(SessionKind::Execution, None, "256m".into(), "client-1".into())
            .await
            .unwrap();
        let updated = mgr
            .update_status(&session.id, SessionStatus::Running)
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create_session(SessionKind::Execution, None, "256m".into(), "client-1".into())
            .await
            .unwrap();
        let err = mgr
            .update_status(&session.id, SessionStatus::Stopped)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_terminal_status_has_no_further_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create_session(SessionKind::Execution, None, "256m".into(), "client-1".into())
            .await
            .unwrap();
        mgr.update_status(&session.id, SessionStatus::Running).await.unwrap();
        mgr.update_status(&session.id, SessionStatus::Stopped).await.unwrap();
        let err = mgr
            .update_status(&session.id, SessionStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_set_endpoints_rejected_after_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create_session(SessionKind::Vscode, None, "256m".into(), "client-1".into())
            .await
            .unwrap();
        mgr.update_status(&session.id, SessionStatus::Running).await.unwrap();
        mgr.update_status(&session.id, SessionStatus::Stopped).await.unwrap();

        let mut endpoints = HashMap::new();
        endpoints.insert("http".to_string(), "http://127.0.0.1:8080".to_string());
        let err = mgr.set_endpoints(&session.id, endpoints).await.unwrap_err();
        assert!(matches!(err, BrokerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_destroy_session_removes_workspace_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create_session(SessionKind::Execution, None, "256m".into(), "client-1".into())
            .await
            .unwrap();
        let workspace_dir = session.workspace_dir.clone();

        mgr.destroy_session(&session.id).await.unwrap();

        assert!(!std::path::Path::new(&workspace_dir).exists());
        let err = mgr.touch(&session.id).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_sessions_by_owner() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        mgr.create_session(SessionKind::Execution, None, "256m".into(), "owner-a".into())
            .await
            .unwrap();
        mgr.create_session(SessionKind::Execution, None, "256m".into(), "owner-a".into())
            .await
            .unwrap();
        mgr.create_session(SessionKind::Execution, None, "256m".into(), "owner-b".into())
            .await
            .unwrap();

        let owned = mgr.list_sessions(Some("owner-a")).await;
        assert_eq!(owned.len(), 2);
        assert!(mgr.list_sessions(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_expired_removes_only_stale_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let fresh = mgr
            .create_session(SessionKind::Execution, None, "256m".into(), "owner-a".into())
            .await
            .unwrap();
        let stale = mgr
            .create_session(SessionKind::Execution, None, "256m".into(), "owner-a".into())
            .await
            .unwrap();

        // Force the stale session's timestamp back in time.
        let mut stale_session = mgr.touch(&stale.id).await.unwrap();
        stale_session.last_accessed_at = chrono::Utc::now() - chrono::Duration::hours(48);
        mgr.store.put(&stale_session).await;

        let removed = mgr
            .cleanup_expired("owner-a", chrono::Duration::hours(24))
            .await;
        assert_eq!(removed, 1);

        let remaining = mgr.list_sessions(Some("owner-a")).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh.id);
    }

    #[tokio::test]
    async fn test_create_session_rejected_past_per_client_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.broker_root = dir.path().to_path_buf();
        config.max_sessions_per_client = 2;
        let config = Arc::new(config);
        let store = Arc::new(MetadataStore::without_durable_tier());
        let workspace = Arc::new(WorkspaceProvisioner::new(Arc::clone(&config)));
        let mgr = SessionManager::new(config, store, workspace);

        for _ in 0..2 {
            mgr.create_session(SessionKind::Execution, None, "256m".into(), "owner-a".into())
                .await
                .unwrap();
        }

        let err = mgr
            .create_session(SessionKind::Execution, None, "256m".into(), "owner-a".into())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::RateLimited(_)));

        // A different owner is unaffected by owner-a's count.
        mgr.create_session(SessionKind::Execution, None, "256m".into(), "owner-b".into())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_session_returns_record() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create_session(SessionKind::Execution, None, "256m".into(), "client-1".into())
            .await
            .unwrap();
        let fetched = mgr.get_session(&session.id).await.unwrap();
        assert_eq!(fetched.id, session.id);
    }

    #[tokio::test]
    async fn test_get_session_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let err = mgr.get_session("nonexistent").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_set_bound_port_updates_record() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create_session(SessionKind::Vscode, None, "256m".into(), "client-1".into())
            .await
            .unwrap();
        let updated = mgr.set_bound_port(&session.id, Some(39123)).await.unwrap();
        assert_eq!(updated.bound_port, Some(39123));
    }

    #[tokio::test]
    async fn test_set_bound_port_rejected_after_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create_session(SessionKind::Vscode, None, "256m".into(), "client-1".into())
            .await
            .unwrap();
        mgr.update_status(&session.id, SessionStatus::Running).await.unwrap();
        mgr.update_status(&session.id, SessionStatus::Stopped).await.unwrap();

        let err = mgr.set_bound_port(&session.id, Some(39200)).await.unwrap_err();
        assert!(matches!(err, BrokerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_stats_track_create_transition_and_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr
            .create_session(
                SessionKind::Execution,
                Some(LanguageId::Python),
                "256m".into(),
                "client-1".into(),
            )
            .await
            .unwrap();

        let (by_type, by_status, by_language) = mgr.stats().snapshot();
        assert_eq!(by_type.get(&SessionKind::Execution.to_string()), Some(&1));
        assert_eq!(by_status.get(&SessionStatus::Creating.to_string()), Some(&1));
        assert_eq!(by_language.get(&LanguageId::Python.to_string()), Some(&1));

        mgr.update_status(&session.id, SessionStatus::Running).await.unwrap();
        let (_, by_status, _) = mgr.stats().snapshot();
        assert_eq!(by_status.get(&SessionStatus::Creating.to_string()), Some(&0));
        assert_eq!(by_status.get(&SessionStatus::Running.to_string()), Some(&1));

        mgr.destroy_session(&session.id).await.unwrap();
        let (by_type, by_status, by_language) = mgr.stats().snapshot();
        assert_eq!(by_type.get(&SessionKind::Execution.to_string()), Some(&0));
        assert_eq!(by_status.get(&SessionStatus::Stopped.to_string()), Some(&0));
        assert_eq!(by_language.get(&LanguageId::Python.to_string()), Some(&0));
    }
}
