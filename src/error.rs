//! Error taxonomy shared by both front doors.
//!
//! Each variant maps to a distinct caller-visible outcome, so the front
//! doors can translate them without string matching. `Forbidden` and
//! `NotFound` are deliberately collapsed at the HTTP boundary so callers
//! cannot probe which targets exist.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// No credential, or a credential that did not verify.
    #[error("authentication required")]
    Unauthenticated,

    /// Authenticated, but not authorized for the requested target or session.
    #[error("access denied")]
    Forbidden,

    /// Unknown target id or session id.
    #[error("not found")]
    NotFound,

    /// Session aged past its TTL.
    #[error("session expired")]
    Expired,

    /// Session already bound to a transport.
    #[error("session already attached")]
    Conflict,

    /// Stored configuration is incomplete or unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Target node unreachable or rejected our credentials.
    #[error("upstream unavailable: {0}")]
    Upstream(String),
}

impl GatewayError {
    /// Message safe to show an unauthenticated or unauthorized caller.
    ///
    /// Forbidden collapses into NotFound so a denied caller learns nothing
    /// about whether the target exists.
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Forbidden | GatewayError::NotFound => "not found".to_string(),
            GatewayError::Invalid(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
