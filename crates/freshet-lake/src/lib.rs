//! Lake client for the Freshet engine.
//!
//! The [`Lake`] trait is the engine's only view of the analytical store:
//! statement execution inside explicit transactions, per-source snapshot
//! identifiers, a change-feed relation over a snapshot pair, point-in-time
//! reads, and temporary result tables. [`DuckLakeClient`] implements it
//! over a DuckDB connection with an attached DuckLake catalog.

pub mod ducklake;
pub mod error;
pub mod lake;

pub use ducklake::DuckLakeClient;
pub use error::LakeError;
pub use lake::Lake;
