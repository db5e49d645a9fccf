//! Failure taxonomy for worker RPC.

use std::time::Duration;

/// Marker the worker daemon embeds in errors raised before the agent
/// process has booted. The interrupt path refuses to clear state on it.
pub(crate) const NOT_INITIALIZED_MARKER: &str = "not initialized";

/// Typed worker RPC failure.
///
/// Transient variants (`Timeout`, `Connect`, `Status` 5xx) feed the
/// controller's consecutive-failure budget and are never fatal on their
/// own. `Semantic` means the daemon answered but refused the operation.
#[derive(Debug, thiserror::Error)]
pub enum WorkerClientError {
    /// The call exceeded its per-call deadline.
    #[error("worker call to {endpoint} timed out after {timeout:?}")]
    Timeout {
        /// Endpoint path.
        endpoint: &'static str,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// TCP-level failure (connection refused, reset, DNS).
    #[error("worker unreachable on {endpoint}: {source}")]
    Connect {
        /// Endpoint path.
        endpoint: &'static str,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Non-2xx HTTP response.
    #[error("worker returned {status} on {endpoint}: {body}")]
    Status {
        /// Endpoint path.
        endpoint: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, for logs.
        body: String,
    },

    /// The daemon is up but the agent process has not booted yet.
    #[error("worker agent not initialized on {endpoint}")]
    NotInitialized {
        /// Endpoint path.
        endpoint: &'static str,
    },

    /// The daemon answered 2xx with `success = false`.
    #[error("worker refused {endpoint}: {message}")]
    Semantic {
        /// Endpoint path.
        endpoint: &'static str,
        /// Worker-provided failure detail.
        message: String,
    },

    /// The response body did not match the expected shape.
    #[error("bad worker response on {endpoint}: {source}")]
    InvalidResponse {
        /// Endpoint path.
        endpoint: &'static str,
        /// Decode error.
        #[source]
        source: reqwest::Error,
    },
}

impl WorkerClientError {
    /// Whether the failure counts against the consecutive-failure budget
    /// (the machine may be dead) rather than being a worker-side refusal.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerClientError::Timeout { .. } | WorkerClientError::Connect { .. } => true,
            WorkerClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result alias for worker RPC.
pub type WorkerResult<T> = std::result::Result<T, WorkerClientError>;
