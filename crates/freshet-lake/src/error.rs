//! Lake client error types.

/// Errors produced by [`Lake`](crate::Lake) operations.
#[derive(Debug, thiserror::Error)]
pub enum LakeError {
    /// Could not open or attach the lake.
    #[error("lake connection error: {0}")]
    Connection(String),

    /// A statement failed.
    #[error("lake execution error: {0}")]
    Execution(String),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("lake connection lock poisoned")]
    LockPoisoned,
}

impl LakeError {
    /// Whether this failure looks like memory or temp-space exhaustion
    /// rather than a transient fault.
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        let msg = self.to_string().to_ascii_lowercase();
        msg.contains("out of memory")
            || msg.contains("memory limit")
            || msg.contains("no space left")
            || msg.contains("temp_directory")
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, LakeError>;

/// Extension trait for converting `duckdb::Error` into `Result`.
pub(crate) trait DuckResultExt<T> {
    fn to_lake_err(self) -> Result<T>;
}

impl<T> DuckResultExt<T> for std::result::Result<T, duckdb::Error> {
    fn to_lake_err(self) -> Result<T> {
        self.map_err(|e| LakeError::Execution(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exhaustion_is_detected() {
        assert!(LakeError::Execution("Out of Memory Error: could not allocate".into())
            .is_resource_exhaustion());
        assert!(!LakeError::Execution("Binder Error: no such table".into())
            .is_resource_exhaustion());
    }
}
