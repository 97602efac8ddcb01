//! Shared error taxonomy and data-model types used across the broker crates.

pub mod error;
pub mod types;

pub use error::BrokerError;
pub use types::{
    CircuitState, ExecutionRequest, ExecutionResult, LanguageId, OutputFormat, PolicyVerdict,
    Session, SessionKind, SessionStatus, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS, MIN_TIMEOUT_MS,
};
