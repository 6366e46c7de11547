//! SQL front-end error types.

/// Errors produced while parsing, analyzing, or rewriting queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SqlError {
    /// The input could not be parsed as SQL.
    #[error("invalid query: {0}")]
    Parse(String),

    /// The DDL statement is malformed (missing clause, bad option value).
    #[error("invalid ddl: {0}")]
    Ddl(String),

    /// The query uses a construct the engine does not support for its
    /// target refresh strategy.
    #[error("unsupported query construct: {0}")]
    Unsupported(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, SqlError>;
