use thiserror::Error;

/// Flat error kind taxonomy surfaced by the engine, always paired with the
/// host it happened on (or `None` for host-independent prelude/postlude
/// failures) so operators and `azud history` can filter by kind.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("[{host}] config error: {message}")]
    Config { host: String, message: String },

    #[error("[{host}] auth error: {message}")]
    Auth { host: String, message: String },

    #[error("[{host}] precondition failed: {message}")]
    Precondition { host: String, message: String },

    #[error("[{host}] boot failed: {message}")]
    Boot { host: String, message: String },

    #[error("[{host}] readiness check failed: {message}")]
    Readiness { host: String, message: String },

    #[error("[{host}] proxy error: {message}")]
    Proxy { host: String, message: String },

    #[error("[{host}] hook error: {message}")]
    Hook { host: String, message: String },

    #[error("[{host}] bookkeeping error: {message}")]
    Bookkeeping { host: String, message: String },

    #[error("[{host}] canary error: {message}")]
    Canary { host: String, message: String },

    /// A failure too severe to attempt any further automatic recovery
    /// (e.g. a rollback requested while another rollback is in flight).
    #[error("critical: {message}")]
    Critical { message: String },
}

impl EngineError {
    pub fn host(&self) -> Option<&str> {
        match self {
            EngineError::Config { host, .. }
            | EngineError::Auth { host, .. }
            | EngineError::Precondition { host, .. }
            | EngineError::Boot { host, .. }
            | EngineError::Readiness { host, .. }
            | EngineError::Proxy { host, .. }
            | EngineError::Hook { host, .. }
            | EngineError::Bookkeeping { host, .. }
            | EngineError::Canary { host, .. } => Some(host),
            EngineError::Critical { .. } => None,
        }
    }

    pub fn auth(host: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EngineError::Auth {
            host: host.into(),
            message: err.to_string(),
        }
    }

    pub fn boot(host: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EngineError::Boot {
            host: host.into(),
            message: err.to_string(),
        }
    }

    pub fn readiness(host: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EngineError::Readiness {
            host: host.into(),
            message: err.to_string(),
        }
    }

    pub fn proxy(host: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EngineError::Proxy {
            host: host.into(),
            message: err.to_string(),
        }
    }

    pub fn precondition(host: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EngineError::Precondition {
            host: host.into(),
            message: err.to_string(),
        }
    }

    pub fn hook(host: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EngineError::Hook {
            host: host.into(),
            message: err.to_string(),
        }
    }

    pub fn bookkeeping(host: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EngineError::Bookkeeping {
            host: host.into(),
            message: err.to_string(),
        }
    }
}
