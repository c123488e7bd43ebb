//! Error types for query compilation.
//!
//! Every error here is raised synchronously while compiling a query or
//! immediately after an execution round-trip. Nothing is retried
//! internally; retry policy belongs to the caller. Row decoding never
//! raises — malformed fields degrade to zero/empty defaults instead
//! (see [`crate::decode`]).

use thiserror::Error;

/// Result type for query compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Invalid or incomplete datasource/experiment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// The experiment references an exposure query id that the
    /// datasource settings do not declare.
    #[error("unknown experiment assignment table: {0}")]
    UnknownExposureQuery(String),

    /// The dialect requires a database name to address the information
    /// schema and none is configured.
    #[error("no database provided; a database is required to query the information schema")]
    MissingDatabase,

    /// The dialect requires a schema name to qualify generated table
    /// names and none is configured.
    #[error("no schema provided; a schema is required to generate metric queries")]
    MissingSchema,

    /// A SQL template referenced a variable with no value available.
    #[error("unknown template variable: {{{{{0}}}}}")]
    UnknownTemplateVariable(String),
}

/// Errors that can occur while compiling a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// No declared identity join bridges the two identifier spaces.
    #[error("missing identifier join table for '{left}' and '{right}'")]
    MissingIdentityJoin { left: String, right: String },

    /// The dialect tag does not name a supported warehouse.
    #[error("unsupported SQL dialect: {0}")]
    UnsupportedDialect(String),

    /// An information-schema query returned zero tables.
    #[error("no tables found")]
    EmptyResult,
}
