use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The error taxonomy every core module maps its failures into.
///
/// Store- and cache-facing code never returns a raw driver error across a
/// module boundary; it classifies the failure first so callers can branch
/// on meaning instead of on `sqlx`/`redis`/`lapin` internals.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate writes (re-insert of an existing timeline entry, re-follow
    /// of an already-followed user) land here. Callers treat this as a
    /// successful no-op, not a failure to surface.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store or broker unavailable, connection reset, deadlock victim, etc.
    /// Workers retry these with backoff; callers elsewhere should not treat
    /// them as permanent.
    #[error("transient store error: {0}")]
    Transient(#[source] anyhow::Error),

    /// Malformed or undecodable message. Always ack-and-log, never block
    /// the queue on one of these.
    #[error("poison message: {0}")]
    Poison(String),

    /// The cache degraded; the caller already has (or should fetch) the
    /// authoritative answer from the store. Never surfaced to an end user.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(#[source] anyhow::Error),
}

impl CoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::CacheUnavailable(_))
    }
}

/// Classifies a `sqlx::Error` into the taxonomy above. Every store function
/// routes its errors through this instead of propagating `sqlx::Error`
/// directly.
impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => CoreError::NotFound(err.to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                CoreError::Conflict(db_err.to_string())
            }
            _ => CoreError::Transient(anyhow::Error::new(err)),
        }
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::CacheUnavailable(anyhow::Error::new(err))
    }
}

impl From<lapin::Error> for CoreError {
    fn from(err: lapin::Error) -> Self {
        CoreError::Transient(anyhow::Error::new(err))
    }
}

/// Thin wrapper used at the admin/health HTTP boundary, in the same shape
/// the teacher used for its own handler error type.
#[derive(Debug)]
pub struct AdminError(pub anyhow::Error);

impl<E> From<E> for AdminError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        tracing::error!(error = ?self.0, "admin request failed");
        (StatusCode::INTERNAL_SERVER_ERROR).into_response()
    }
}
