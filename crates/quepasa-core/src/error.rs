use thiserror::Error;

/// Top-level error type for Quepasa.
///
/// Each variant maps to one policy at the HTTP boundary: `NotFound` becomes
/// 404/204, `Auth` 401/403, `NotReady` 503 with the current state string,
/// `Input` 400, `Upstream` a 4xx/5xx without automatic retry, and
/// `Transport` is recorded on the subscriber and retried with backoff.
#[derive(Debug, Error)]
pub enum QpError {
    /// Missing or malformed environment/configuration. Fails startup.
    #[error("config error: {0}")]
    Config(String),

    /// Tenant, message, or subscriber not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Token, JWT, or master key mismatch.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Operation requires the `ready` connection state.
    #[error("server not ready: current state {0}")]
    NotReady(String),

    /// Validation failure: invalid chat id, bad phone, weak password.
    #[error("invalid input: {0}")]
    Input(String),

    /// Webhook or queue delivery failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// WCL rejection (send failure, revoke not allowed). Never retried.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Storage error.
    #[error("store error: {0}")]
    Store(String),

    /// Bug or unexpected condition. Logged, connection left as is.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
