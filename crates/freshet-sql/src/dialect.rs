//! SQL dialect for Freshet definition queries.
//!
//! Delegates to `GenericDialect` but enables table-version clauses so the
//! rewriter's snapshot pins survive a re-parse.

use sqlparser::dialect::{Dialect, GenericDialect};

/// Dialect for dynamic-table definition queries.
#[derive(Debug, Default)]
pub struct FreshetDialect {
    generic: GenericDialect,
}

impl Dialect for FreshetDialect {
    fn is_identifier_start(&self, ch: char) -> bool {
        self.generic.is_identifier_start(ch)
    }

    fn is_identifier_part(&self, ch: char) -> bool {
        self.generic.is_identifier_part(ch)
    }

    fn is_delimited_identifier_start(&self, ch: char) -> bool {
        self.generic.is_delimited_identifier_start(ch)
    }

    fn supports_filter_during_aggregation(&self) -> bool {
        true
    }
}
