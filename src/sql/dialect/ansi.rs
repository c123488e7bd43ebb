//! Generic ANSI-like SQL dialect.
//!
//! Reference implementation used for warehouses without divergent
//! syntax; every operation comes from the trait defaults.

use super::SqlDialect;

/// Generic ANSI-like SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Ansi;

impl SqlDialect for Ansi {
    fn name(&self) -> &'static str {
        "ansi"
    }
}
