//! Three-tier session metadata store (C5): a process-local near cache, an
//! optional durable Redis-compatible back end behind a pooled connection
//! and a dedicated circuit breaker, and an in-memory fallback used when the
//! durable tier is unavailable. `put` succeeds as long as the fallback tier
//! is written; `get` degrades tier by tier; `delete` and `listByOwner`
//! reconcile across whichever tiers are reachable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use ceb_admission::{CircuitBreaker, CircuitBreakerConfig};
use ceb_core::Session;
use redis::AsyncCommands;
use tracing::warn;

const NEAR_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
const NEAR_CACHE_MAX_CAPACITY: u64 = 5_000;
const DURABLE_TTL_SECS: u64 = 24 * 60 * 60;
const KEY_PREFIX: &str = "ceb:session:";
const OWNER_INDEX_PREFIX: &str = "ceb:owner:";

fn session_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

fn owner_key(owner_client_id: &str) -> String {
    format!("{OWNER_INDEX_PREFIX}{owner_client_id}")
}

struct DurableTier {
    pool: deadpool_redis::Pool,
    breaker: CircuitBreaker,
}

struct Fallback {
    sessions: Mutex<HashMap<String, Session>>,
}

impl Fallback {
    fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn put(&self, session: &Session) {
        self.sessions
            .lock()
            .expect("fallback mutex poisoned")
            .insert(session.id.clone(), session.clone());
    }

    fn get(&self, id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .expect("fallback mutex poisoned")
            .get(id)
            .cloned()
    }

    fn delete(&self, id: &str) {
        self.sessions
            .lock()
            .expect("fallback mutex poisoned")
            .remove(id);
    }

    fn list_by_owner(&self, owner_client_id: &str) -> Vec<Session> {
        self.sessions
            .lock()
            .expect("fallback mutex poisoned")
            .values()
            .filter(|s| s.owner_client_id == owner_client_id)
            .cloned()
            .collect()
    }
}

pub struct MetadataStore {
    near: moka::sync::Cache<String, Session>,
    durable: Option<DurableTier>,
    fallback: Fallback,
}

impl MetadataStore {
    /// Build a store with no durable tier — cache and fallback only. Used
    /// when `METADATA_STORE_HOST` points nowhere reachable at startup.
    pub fn without_durable_tier() -> Self {
        Self {
            near: Self::build_near_cache(),
            durable: None,
            fallback: Fallback::new(),
        }
    }

    /// Build a store backed by a Redis-compatible durable tier at
    /// `redis://{host}:{port}/{db}` (with optional password).
    pub fn with_durable_tier(
        host: &str,
        port: u16,
        db: u32,
        password: Option<&str>,
    ) -> anyhow::Result<Self> {
        let auth = password
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        let url = format!("redis://{auth}{host}:{port}/{db}");
        let cfg = deadpool_redis::Config::from_url(url);
        let pool = cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;

        Ok(Self {
            near: Self::build_near_cache(),
            durable: Some(DurableTier {
                pool,
                breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            }),
            fallback: Fallback::new(),
        })
    }

    fn build_near_cache() -> moka::sync::Cache<String, Session> {
        moka::sync::Cache::builder()
            .max_capacity(NEAR_CACHE_MAX_CAPACITY)
            .time_to_live(NEAR_CACHE_TTL)
            .build()
    }

    /// Write to all three tiers. Succeeds as long as the fallback tier
    /// accepted the write — the near cache never fails, and a durable-tier
    /// failure is logged and does not fail the call.
    pub async fn put(&self, session: &Session) {
        self.near.insert(session.id.clone(), session.clone());
        self.fallback.put(session);

        if let Some(durable) = &self.durable {
            if !durable.breaker.allow() {
                return;
            }
            match self.durable_put(durable, session).await {
                Ok(()) => durable.breaker.record_success(),
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "durable tier put failed");
                    durable.breaker.record_failure();
                }
            }
        }
    }

    async fn durable_put(&self, durable: &DurableTier, session: &Session) -> anyhow::Result<()> {
        let mut conn = durable.pool.get().await?;
        let payload = serde_json::to_string(session)?;
        conn.set_ex::<_, _, ()>(session_key(&session.id), payload, DURABLE_TTL_SECS)
            .await?;
        conn.sadd::<_, _, ()>(owner_key(&session.owner_client_id), &session.id)
            .await?;
        Ok(())
    }

    /// Read the near cache; on miss, the durable tier; on miss, the
    /// fallback. A durable-tier hit fills the near cache.
    pub async fn get(&self, id: &str) -> Option<Session> {
        if let Some(session) = self.near.get(id) {
            return Some(session);
        }

        if let Some(durable) = &self.durable {
            if durable.breaker.allow() {
                match self.durable_get(durable, id).await {
                    Ok(Some(session)) => {
                        durable.breaker.record_success();
                        self.near.insert(id.to_string(), session.clone());
                        return Some(session);
                    }
                    Ok(None) => {
                        durable.breaker.record_success();
                    }
                    Err(e) => {
                        warn!(session_id = id, error = %e, "durable tier get failed");
                        durable.breaker.record_failure();
                    }
                }
            }
        }

        self.fallback.get(id)
    }

    async fn durable_get(&self, durable: &DurableTier, id: &str) -> anyhow::Result<Option<Session>> {
        let mut conn = durable.pool.get().await?;
        let payload: Option<String> = conn.get(session_key(id)).await?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Remove from all three tiers. Durable-tier failures are logged;
    /// `delete` still reports success once cache and fallback are updated.
    pub async fn delete(&self, id: &str) {
        let owner = self.near.get(id).map(|s| s.owner_client_id);
        self.near.invalidate(id);
        self.fallback.delete(id);

        if let (Some(durable), Some(owner)) = (&self.durable, owner) {
            if durable.breaker.allow() {
                match self.durable_delete(durable, id, &owner).await {
                    Ok(()) => durable.breaker.record_success(),
                    Err(e) => {
                        warn!(session_id = id, error = %e, "durable tier delete failed");
                        durable.breaker.record_failure();
                    }
                }
            }
        }
    }

    async fn durable_delete(&self, durable: &DurableTier, id: &str, owner: &str) -> anyhow::Result<()> {
        let mut conn = durable.pool.get().await?;
        conn.del::<_, ()>(session_key(id)).await?;
        conn.srem::<_, _, ()>(owner_key(owner), id).await?;
        Ok(())
    }

    /// Merge near-cache and durable-tier (or fallback) results for one
    /// owner, de-duplicated by session id.
    pub async fn list_by_owner(&self, owner_client_id: &str) -> Vec<Session> {
        let mut by_id: HashMap<String, Session> = HashMap::new();

        for (_, session) in self.near.iter() {
            if session.owner_client_id == owner_client_id {
                by_id.insert(session.id.clone(), session);
            }
        }

        let mut used_durable = false;
        if let Some(durable) = &self.durable {
            if durable.breaker.allow() {
                match self.durable_list_by_owner(durable, owner_client_id).await {
                    Ok(sessions) => {
                        durable.breaker.record_success();
                        used_durable = true;
                        for session in sessions {
                            by_id.insert(session.id.clone(), session);
                        }
                    }
                    Err(e) => {
                        warn!(owner_client_id, error = %e, "durable tier list failed");
                        durable.breaker.record_failure();
                    }
                }
            }
        }

        if !used_durable {
            for session in self.fallback.list_by_owner(owner_client_id) {
                by_id.insert(session.id.clone(), session);
            }
        }

        by_id.into_values().collect()
    }

    async fn durable_list_by_owner(
        &self,
        durable: &DurableTier,
        owner_client_id: &str,
    ) -> anyhow::Result<Vec<Session>> {
        let mut conn = durable.pool.get().await?;
        let ids: Vec<String> = conn.smembers(owner_key(owner_client_id)).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            let payload: Option<String> = conn.get(session_key(&id)).await?;
            if let Some(json) = payload {
                sessions.push(serde_json::from_str(&json)?);
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ceb_core::{SessionKind, SessionStatus};
    use std::collections::HashMap as StdHashMap;

    fn sample_session(id: &str, owner: &str) -> Session {
        Session {
            id: id.to_string(),
            kind: SessionKind::Execution,
            language: None,
            status: SessionStatus::Running,
            memory_budget: "1g".to_string(),
            workspace_dir: format!("/var/ceb/sessions/{id}"),
            container_id: None,
            endpoints: StdHashMap::new(),
            created_at: chrono::Utc::now(),
            last_accessed_at: chrono::Utc::now(),
            owner_client_id: owner.to_string(),
            bound_port: None,
        }
    }

    #[tokio::test]
    async fn test_put_get_without_durable_tier() {
        let store = MetadataStore::without_durable_tier();
        let session = sample_session("01J1", "client-a");
        store.put(&session).await;
        let fetched = store.get("01J1").await.unwrap();
        assert_eq!(fetched.id, "01J1");
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = MetadataStore::without_durable_tier();
        assert!(store.get("does-not-exist").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_from_all_tiers() {
        let store = MetadataStore::without_durable_tier();
        let session = sample_session("01J2", "client-a");
        store.put(&session).await;
        store.delete("01J2").await;
        assert!(store.get("01J2").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MetadataStore::without_durable_tier();
        store.delete("never-existed").await;
        store.delete("never-existed").await;
    }

    #[tokio::test]
    async fn test_list_by_owner_filters_and_dedups() {
        let store = MetadataStore::without_durable_tier();
        store.put(&sample_session("01J3", "client-a")).await;
        store.put(&sample_session("01J4", "client-a")).await;
        store.put(&sample_session("01J5", "client-b")).await;

        let mut listed = store.list_by_owner("client-a").await;
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "01J3");
        assert_eq!(listed[1].id, "01J4");
    }

    #[tokio::test]
    async fn test_get_after_near_cache_eviction_falls_back() {
        let store = MetadataStore::without_durable_tier();
        let session = sample_session("01J6", "client-a");
        store.put(&session).await;
        store.near.invalidate("01J6");
        // Falls through to fallback tier since there's no durable tier.
        let fetched = store.get("01J6").await.unwrap();
        assert_eq!(fetched.id, "01J6");
    }
}
