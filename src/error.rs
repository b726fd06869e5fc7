//! Error taxonomy for the selection engine and its collaborators.
//!
//! Mirrors the retryability split the router layer in the teacher codebase
//! drew between deployment-local errors and router-level failures: kinds here
//! carry enough shape to decide retry/cooldown/failover without the caller
//! re-deriving it from an HTTP status code.

use thiserror::Error;

/// Reason a deployment was pushed into cooldown.
///
/// Kept distinct from [`SwitchboardError`] because a single error can trigger
/// cooldown while a different one (e.g. caller cancellation) never should.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownReason {
    Transient,
    RateLimit,
    Manual,
}

/// Errors surfaced by a [`crate::deployment::Deployment`] or the
/// [`crate::switchboard::Switchboard`] facade.
#[derive(Debug, Clone, Error)]
pub enum SwitchboardError {
    /// 5xx, connection reset, or timeout. Retried inside the DC; on
    /// exhaustion triggers cooldown and surfaces to the caller.
    #[error("transient upstream error from {deployment}: {message}")]
    TransientUpstream { deployment: String, message: String },

    /// 429. Carries `retry_after` when the server supplied one.
    #[error("rate limited by {deployment}: {message}")]
    RateLimited {
        deployment: String,
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// 401/403. Non-retryable; does not cool down the DC.
    #[error("unauthorized on {deployment}: {message}")]
    Unauthorized { deployment: String, message: String },

    /// 400 or similar client error. Non-retryable; does not cool down the DC.
    #[error("bad request to {deployment}: {message}")]
    BadRequest { deployment: String, message: String },

    /// Caller-initiated cancellation. Propagated without retry.
    #[error("request canceled")]
    Canceled,

    /// The selection engine found no healthy candidates.
    #[error("no healthy deployment available")]
    NoHealthyDeployment,

    /// The outer retry loop exhausted `max_attempts`; aggregates causes.
    #[error("all deployments failed after {attempts} attempt(s): {causes}")]
    AllDeploymentsFailed { attempts: u32, causes: String },

    /// Configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SwitchboardError {
    /// Whether the DC's inner retry loop should retry this error in place.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwitchboardError::TransientUpstream { .. } | SwitchboardError::RateLimited { .. }
        )
    }

    /// Whether this error should push the originating deployment into cooldown.
    pub fn cooldown_reason(&self) -> Option<CooldownReason> {
        match self {
            SwitchboardError::TransientUpstream { .. } => Some(CooldownReason::Transient),
            SwitchboardError::RateLimited {
                retry_after_secs, ..
            } => match retry_after_secs {
                Some(secs) if *secs <= 2 => None,
                _ => Some(CooldownReason::RateLimit),
            },
            _ => None,
        }
    }

    /// Classify an HTTP status code and response body into a `SwitchboardError`,
    /// given the name of the deployment that produced it.
    pub fn from_status(deployment: &str, status: u16, body: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        let message = body.into();
        match status {
            400 => SwitchboardError::BadRequest {
                deployment: deployment.to_string(),
                message,
            },
            401 | 403 => SwitchboardError::Unauthorized {
                deployment: deployment.to_string(),
                message,
            },
            429 => SwitchboardError::RateLimited {
                deployment: deployment.to_string(),
                message,
                retry_after_secs,
            },
            500..=599 => SwitchboardError::TransientUpstream {
                deployment: deployment.to_string(),
                message,
            },
            _ => SwitchboardError::TransientUpstream {
                deployment: deployment.to_string(),
                message,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;
