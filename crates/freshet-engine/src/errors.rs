//! Engine error model and retry backoff policy.

use std::time::Duration;

use freshet_lake::LakeError;
use freshet_meta::MetaError;
use freshet_sql::SqlError;
use freshet_types::RefreshError;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_MAX_MS: u64 = 60_000;

/// Categorized engine error for retry and status decisions.
///
/// `Refresh` wraps a classified [`RefreshError`] whose kind drives the
/// executor's retry/classify logic. `Infrastructure` wraps opaque host-side
/// failures (metadata store I/O, task join errors) that are never retried
/// at the refresh level.
#[derive(Debug)]
pub enum EngineError {
    /// Classified refresh error.
    Refresh(RefreshError),
    /// Infrastructure error (metadata store, runtime plumbing).
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Refresh(e) => write!(f, "{e}"),
            Self::Infrastructure(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<RefreshError> for EngineError {
    fn from(e: RefreshError) -> Self {
        Self::Refresh(e)
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<MetaError> for EngineError {
    fn from(e: MetaError) -> Self {
        Self::Infrastructure(anyhow::Error::new(e).context("metadata store operation failed"))
    }
}

impl From<LakeError> for EngineError {
    fn from(e: LakeError) -> Self {
        Self::Refresh(classify_lake_error(&e))
    }
}

impl From<SqlError> for EngineError {
    fn from(e: SqlError) -> Self {
        Self::Refresh(classify_sql_error(&e))
    }
}

impl EngineError {
    /// Returns `true` if the wrapped error is retryable within the attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Refresh(e) => e.retryable,
            Self::Infrastructure(_) => false,
        }
    }

    /// The classified refresh error, if this is one.
    #[must_use]
    pub fn as_refresh_error(&self) -> Option<&RefreshError> {
        match self {
            Self::Refresh(e) => Some(e),
            Self::Infrastructure(_) => None,
        }
    }

    /// Stable error code for history records.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Refresh(e) => &e.code,
            Self::Infrastructure(_) => "INFRA",
        }
    }
}

/// Map a lake failure onto the refresh error taxonomy.
#[must_use]
pub fn classify_lake_error(e: &LakeError) -> RefreshError {
    if e.is_resource_exhaustion() {
        RefreshError::resource("LAKE_RESOURCE", e.to_string())
    } else {
        RefreshError::transient_lake("LAKE_TRANSIENT", e.to_string())
    }
}

/// Map a SQL front-end failure onto the refresh error taxonomy. All of
/// these are definitional: the stored query is at fault, so retrying
/// without a definition change is pointless.
#[must_use]
pub fn classify_sql_error(e: &SqlError) -> RefreshError {
    let code = match e {
        SqlError::Parse(_) => "INVALID_QUERY",
        SqlError::Ddl(_) => "INVALID_DDL",
        SqlError::Unsupported(_) => "UNSUPPORTED_QUERY",
    };
    RefreshError::definitional(code, e.to_string())
}

/// Exponential backoff for transient retries: base 1s, factor 2, cap 60s.
#[must_use]
pub fn compute_backoff(attempt: u32) -> Duration {
    let delay_ms = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshet_types::ErrorKind;

    #[test]
    fn transient_lake_errors_are_retryable() {
        let err: EngineError = LakeError::Execution("connection reset".into()).into();
        assert!(err.is_retryable());
        assert_eq!(err.as_refresh_error().unwrap().kind, ErrorKind::TransientLake);
    }

    #[test]
    fn resource_exhaustion_is_not_retryable() {
        let err: EngineError = LakeError::Execution("Out of Memory Error".into()).into();
        assert!(!err.is_retryable());
        assert_eq!(err.as_refresh_error().unwrap().kind, ErrorKind::Resource);
    }

    #[test]
    fn sql_errors_are_definitional() {
        let err: EngineError = SqlError::Parse("bad".into()).into();
        assert!(!err.is_retryable());
        let re = err.as_refresh_error().unwrap();
        assert_eq!(re.kind, ErrorKind::Definitional);
        assert_eq!(re.code, "INVALID_QUERY");
    }

    #[test]
    fn infrastructure_is_not_retryable() {
        let err: EngineError = anyhow::anyhow!("join error").into();
        assert!(!err.is_retryable());
        assert!(err.as_refresh_error().is_none());
        assert_eq!(err.code(), "INFRA");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(compute_backoff(1), Duration::from_millis(1_000));
        assert_eq!(compute_backoff(2), Duration::from_millis(2_000));
        assert_eq!(compute_backoff(3), Duration::from_millis(4_000));
        assert_eq!(compute_backoff(20), Duration::from_millis(60_000));
    }
}
