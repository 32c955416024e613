//! Error taxonomy for deployer operations
//!
//! Every fallible operation in the deployer funnels into [`DeployError`] so
//! the API layer can map failures onto stable HTTP statuses and JSON bodies
//! without string matching.

use thiserror::Error;

/// Result type for deployer operations
pub type Result<T> = std::result::Result<T, DeployError>;

/// Deployer errors
#[derive(Error, Debug)]
pub enum DeployError {
    /// Wrong, expired or unknown captcha
    #[error("captcha invalid")]
    CaptchaInvalid,

    /// Source address exceeded the admission window
    #[error("rate limit exceeded")]
    RateLimited,

    /// A global resource quota rejected the request
    #[error("resource {resource} exhausted")]
    QuotaExceeded {
        resource: String,
        current: f64,
        limit: f64,
    },

    /// The user already owns a running instance
    #[error("existing instance")]
    AlreadyOwns,

    /// No free port after the configured number of attempts
    #[error("no free port")]
    PortPoolFull,

    /// Retryable container engine failure, retries exhausted
    #[error("container engine unavailable: {0}")]
    EngineTransient(String),

    /// Non-retryable container engine failure
    #[error("container engine error: {0}")]
    EngineFatal(String),

    /// Database connectivity failure, retries exhausted
    #[error("database unavailable: {0}")]
    StoreTransient(String),

    /// The requested container does not exist
    #[error("not found")]
    NotFound,

    /// Admin endpoint hit without a valid key or local peer
    #[error("forbidden")]
    AdminForbidden,

    /// Anything that does not fit the categories above
    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// HTTP status code this error surfaces as
    pub fn status_code(&self) -> u16 {
        match self {
            DeployError::CaptchaInvalid | DeployError::AlreadyOwns => 400,
            DeployError::AdminForbidden => 403,
            DeployError::NotFound => 404,
            DeployError::RateLimited => 429,
            DeployError::EngineFatal(_) | DeployError::Internal(_) => 500,
            DeployError::QuotaExceeded { .. }
            | DeployError::PortPoolFull
            | DeployError::EngineTransient(_)
            | DeployError::StoreTransient(_) => 503,
        }
    }

    /// Label used for the `ctf_errors_total{type}` metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            DeployError::CaptchaInvalid => "captcha_invalid",
            DeployError::RateLimited => "rate_limited",
            DeployError::QuotaExceeded { .. } => "quota_exceeded",
            DeployError::AlreadyOwns => "already_owns",
            DeployError::PortPoolFull => "port_pool_full",
            DeployError::EngineTransient(_) => "engine_transient",
            DeployError::EngineFatal(_) => "engine_fatal",
            DeployError::StoreTransient(_) => "store_transient",
            DeployError::NotFound => "not_found",
            DeployError::AdminForbidden => "admin_forbidden",
            DeployError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_surface_contract() {
        assert_eq!(DeployError::CaptchaInvalid.status_code(), 400);
        assert_eq!(DeployError::AlreadyOwns.status_code(), 400);
        assert_eq!(DeployError::AdminForbidden.status_code(), 403);
        assert_eq!(DeployError::NotFound.status_code(), 404);
        assert_eq!(DeployError::RateLimited.status_code(), 429);
        assert_eq!(DeployError::EngineFatal("boom".into()).status_code(), 500);
        assert_eq!(DeployError::PortPoolFull.status_code(), 503);
        assert_eq!(
            DeployError::QuotaExceeded {
                resource: "containers".into(),
                current: 10.0,
                limit: 10.0,
            }
            .status_code(),
            503
        );
    }

    #[test]
    fn test_quota_message_names_resource() {
        let err = DeployError::QuotaExceeded {
            resource: "memory".into(),
            current: 7.5,
            limit: 8.0,
        };
        assert_eq!(err.to_string(), "resource memory exhausted");
    }
}
