//! Metadata store error types.

/// Errors produced by [`MetaStore`](crate::MetaStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// Underlying `PostgreSQL` failure.
    #[error("postgres error: {0}")]
    Postgres(#[from] ::postgres::Error),

    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored value failed to decode (bad JSON, unknown enum label).
    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("metadata store lock poisoned")]
    LockPoisoned,
}

impl From<serde_json::Error> for MetaError {
    fn from(e: serde_json::Error) -> Self {
        Self::Corrupt(e.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, MetaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_displays_detail() {
        let err = MetaError::Corrupt("unknown status 'wedged'".into());
        assert!(err.to_string().contains("wedged"));
    }

    #[test]
    fn serde_errors_map_to_corrupt() {
        let bad: std::result::Result<Vec<String>, _> = serde_json::from_str("{not json");
        let err: MetaError = bad.unwrap_err().into();
        assert!(matches!(err, MetaError::Corrupt(_)));
    }
}
