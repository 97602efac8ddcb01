//! Health reporting and metrics (C9): component liveness rolled up into an
//! overall status, a process memory/CPU snapshot, and counters/gauges/
//! histograms exported in Prometheus's textual format.

use std::sync::Mutex;
use std::time::Instant;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use sysinfo::{Pid, System};

/// Per-component liveness, worst-of aggregated into the report's overall
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: ComponentStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub rss_mb: u64,
    pub heap_used_mb: u64,
    pub heap_total_mb: u64,
    pub external_mb: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionCounts {
    pub by_type: std::collections::HashMap<String, u64>,
    pub by_status: std::collections::HashMap<String, u64>,
    pub by_language: std::collections::HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: ComponentStatus,
    pub uptime_secs: u64,
    pub memory: MemorySnapshot,
    pub sessions: SessionCounts,
    pub components: Vec<ComponentHealth>,
}

/// Keeps the last `CAPACITY` duration samples for one named operation and
/// estimates a quantile by sorting and indexing, the same way the teacher's
/// usage-stats module estimates p95 from a bounded history.
const QUANTILE_WINDOW_CAPACITY: usize = 200;

#[derive(Default)]
struct DurationWindow {
    samples_ms: Vec<u64>,
}

impl DurationWindow {
    fn record(&mut self, ms: u64) {
        self.samples_ms.push(ms);
        if self.samples_ms.len() > QUANTILE_WINDOW_CAPACITY {
            self.samples_ms.remove(0);
        }
    }

    fn quantile(&self, q: f64) -> Option<u64> {
        if self.samples_ms.is_empty() {
            return None;
        }
        let mut sorted = self.samples_ms.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * q).ceil() as usize;
        let idx = idx.min(sorted.len()).saturating_sub(1);
        Some(sorted[idx])
    }
}

pub struct MetricsRegistry {
    handle: PrometheusHandle,
    started_at: Instant,
    durations: Mutex<std::collections::HashMap<String, DurationWindow>>,
}

impl MetricsRegistry {
    /// Install the process-global Prometheus recorder. Must be called once
    /// at startup, before any `metrics::counter!`/`gauge!`/`histogram!` call.
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        Ok(Self {
            handle,
            started_at: Instant::now(),
            durations: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Builds a registry backed by a standalone recorder handle, without
    /// installing it as the process-global recorder. Useful for embedding
    /// a registry in tests or secondary instances where only one process
    /// global install is allowed.
    pub fn for_testing() -> Self {
        Self {
            handle: PrometheusBuilder::new().build_recorder().handle(),
            started_at: Instant::now(),
            durations: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn record_http_request(&self, route: &str, status: u16) {
        metrics::counter!(
            "http_requests_total",
            "route" => route.to_string(),
            "status" => status.to_string(),
        )
        .increment(1);
    }

    pub fn record_session_operation(&self, operation: &str) {
        metrics::counter!("session_operations_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_container_operation(&self, operation: &str) {
        metrics::counter!("container_operations_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_database_operation(&self, operation: &str) {
        metrics::counter!("database_operations_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn set_process_memory_mb(&self, rss_mb: f64) {
        metrics::gauge!("process_memory_rss_mb").set(rss_mb);
    }

    pub fn set_cpu_percent(&self, percent: f64) {
        metrics::gauge!("process_cpu_percent").set(percent);
    }

    pub fn set_load_average(&self, one_min: f64) {
        metrics::gauge!("system_load_average_1m").set(one_min);
    }

    pub fn set_active_connections(&self, count: u64) {
        metrics::gauge!("active_connections").set(count as f64);
    }

    /// Record one duration sample both to the Prometheus histogram (for
    /// scraping) and to an internal rolling window (for the health report's
    /// p50/p95/p99, computed the same way regardless of exporter).
    pub fn observe_duration(&self, name: &str, ms: u64) {
        metrics::histogram!(format!("{name}_duration_ms")).record(ms as f64);
        self.durations
            .lock()
            .expect("duration window mutex poisoned")
            .entry(name.to_string())
            .or_default()
            .record(ms);
    }

    /// Quantiles {p50, p95, p99} for one named operation's recent durations.
    pub fn quantiles_ms(&self, name: &str) -> Option<(u64, u64, u64)> {
        let durations = self.durations.lock().expect("duration window mutex poisoned");
        let window = durations.get(name)?;
        Some((
            window.quantile(0.50)?,
            window.quantile(0.95)?,
            window.quantile(0.99)?,
        ))
    }

    /// Render all registered metrics in Prometheus's textual exposition
    /// format.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Serve `render()`'s output over a bare-bones HTTP listener: any
    /// request on any path gets a 200 with the Prometheus text exposition,
    /// no routing. Runs until the listener errors; callers spawn this as a
    /// background task.
    pub async fn serve_metrics(self: std::sync::Arc<Self>, port: u16) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        loop {
            let (mut stream, _) = listener.accept().await?;
            let registry = std::sync::Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = respond_with_metrics(&mut stream, &registry).await {
                    tracing::warn!(error = %e, "metrics connection failed");
                }
            });
        }
    }

    /// Build a [`HealthReport`], rolling the given per-component statuses up
    /// into an overall value (the worst of them, `Healthy` if empty).
    pub fn health_report(
        &self,
        components: Vec<ComponentHealth>,
        sessions: SessionCounts,
    ) -> HealthReport {
        let overall = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);

        HealthReport {
            overall,
            uptime_secs: self.started_at.elapsed().as_secs(),
            memory: process_memory_snapshot(),
            sessions,
            components,
        }
    }
}

/// Drain the request (HTTP method/headers are ignored entirely, this isn't
/// a real web server) and write back the metrics text export as a minimal
/// HTTP/1.1 response.
async fn respond_with_metrics(
    stream: &mut tokio::net::TcpStream,
    registry: &MetricsRegistry,
) -> anyhow::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf).await?;

    let body = registry.render();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Snapshot this process's RSS via `sysinfo`. There is no separate managed
/// heap in a native binary, so `heap_used`/`heap_total`/`external` mirror
/// the process's RSS and 0, matching what a non-GC runtime can actually
/// observe.
fn process_memory_snapshot() -> MemorySnapshot {
    let mut system = System::new();
    let pid = Pid::from_u32(std::process::id());
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);

    let rss_mb = system
        .process(pid)
        .map(|p| p.memory() / 1024 / 1024)
        .unwrap_or(0);

    MemorySnapshot {
        rss_mb,
        heap_used_mb: rss_mb,
        heap_total_mb: rss_mb,
        external_mb: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_status_ordering_picks_worst() {
        assert!(ComponentStatus::Unhealthy > ComponentStatus::Degraded);
        assert!(ComponentStatus::Degraded > ComponentStatus::Healthy);
    }

    #[test]
    fn test_duration_window_quantiles() {
        let mut window = DurationWindow::default();
        for ms in 1..=100u64 {
            window.record(ms);
        }
        assert_eq!(window.quantile(0.50), Some(50));
        assert_eq!(window.quantile(0.95), Some(95));
        assert_eq!(window.quantile(0.99), Some(99));
    }

    #[test]
    fn test_duration_window_caps_history() {
        let mut window = DurationWindow::default();
        for ms in 1..=(QUANTILE_WINDOW_CAPACITY as u64 + 50) {
            window.record(ms);
        }
        assert_eq!(window.samples_ms.len(), QUANTILE_WINDOW_CAPACITY);
        assert_eq!(window.samples_ms[0], 51);
    }

    #[test]
    fn test_empty_duration_window_has_no_quantile() {
        let window = DurationWindow::default();
        assert_eq!(window.quantile(0.50), None);
    }

    #[test]
    fn test_health_report_overall_is_worst_component() {
        let registry = MetricsRegistry::for_testing();
        let report = registry.health_report(
            vec![
                ComponentHealth {
                    name: "metadata_store".to_string(),
                    status: ComponentStatus::Healthy,
                    detail: None,
                },
                ComponentHealth {
                    name: "policy_screener".to_string(),
                    status: ComponentStatus::Degraded,
                    detail: Some("durable tier circuit open".to_string()),
                },
            ],
            SessionCounts::default(),
        );
        assert_eq!(report.overall, ComponentStatus::Degraded);
    }

    #[test]
    fn test_health_report_with_no_components_is_healthy() {
        let registry = MetricsRegistry::for_testing();
        let report = registry.health_report(Vec::new(), SessionCounts::default());
        assert_eq!(report.overall, ComponentStatus::Healthy);
    }
}
