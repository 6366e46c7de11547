//! SQL front end for the Freshet engine.
//!
//! Three concerns live here:
//!
//! - [`ddl`]: parsing `CREATE DYNAMIC TABLE` statements into a
//!   [`ddl::TableDefinition`].
//! - [`analyze`]: extracting source tables and grouping keys from a
//!   definition query and classifying its refresh capability.
//! - [`rewrite`]: the pure AST-to-AST rewriter that injects snapshot pins
//!   and affected-key predicates.
//!
//! Everything is deterministic: two calls with the same inputs yield
//! byte-identical SQL.

pub mod analyze;
pub mod ddl;
pub mod dialect;
pub mod error;
pub mod rewrite;
mod walk;

pub use analyze::{analyze_query, validate_strategy, QueryShape, RefreshCapability};
pub use ddl::{parse_create, TableDefinition, DEFAULT_SCHEMA};
pub use error::SqlError;
pub use rewrite::{add_predicate, keys_query, pin_snapshots, replace_source};
