//! OS-level resource isolation for spawned language runtimes: `setrlimit`,
//! a best-effort cgroup v2 / systemd-scope path, and RSS/peak-memory polling.

pub mod cgroup;
pub mod monitor;
pub mod rlimit;
pub mod sandbox;

pub use cgroup::{
    CgroupScopeGuard, OrphanScope, SandboxConfig, cleanup_orphan_scopes, create_scope_command,
};
pub use monitor::MemoryMonitor;
pub use rlimit::{RssWatcher, apply_rlimits};
pub use sandbox::{SandboxCapability, detect_sandbox_capability};
