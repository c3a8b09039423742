//! Error types.
//!
//! Only configuration errors (a broken conversion specification) and I/O-adjacent failures are
//! errors. Data gaps, consistency violations and downscale infeasibility are collected in the
//! [`Report`](crate::report::Report) instead.

#[derive(thiserror::Error, Debug)]
pub enum ConversionError {
    #[error("Wrapped anyhow error: {0}")]
    AnyhowError(#[from] anyhow::Error),
    #[error("Wrapped polars error: {0}")]
    PolarsError(#[from] polars::error::PolarsError),
    #[error("{context}: code '{code}' is not a member of target taxonomy '{taxonomy}'")]
    UnknownTargetCode {
        context: String,
        code: String,
        taxonomy: String,
    },
    #[error("Aggregation rule for '{0}' lists its own target among its sources")]
    SelfReference(String),
    #[error("Aggregation rule for '{0}' has no sources and no children in the target taxonomy")]
    EmptyAggregation(String),
    #[error("Aggregation rules form a cycle: {}", .0.join(" -> "))]
    AggregationCycle(Vec<String>),
    #[error("Gas basket '{basket}' references undefined constituent '{constituent}'")]
    UndefinedConstituent { basket: String, constituent: String },
    #[error("Gas basket '{0}' lists itself among its contents")]
    BasketSelfReference(String),
    #[error("Gas basket '{basket}' contains '{constituent}' under another GWP convention")]
    GwpMismatch { basket: String, constituent: String },
    #[error("Gas baskets and relabelling form a cycle: {}", .0.join(" -> "))]
    BasketCycle(Vec<String>),
    #[error("Invalid entity '{0}'")]
    InvalidEntity(String),
    #[error("Unknown GWP context '{0}'")]
    UnknownGwp(String),
    #[error("Invalid downscale rule for '{basket}': {reason}")]
    InvalidDownscale { basket: String, reason: String },
    #[error("Invalid regex '{pattern}' in selection: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Strict mapping: unmapped codes not in target taxonomy: {}", .0.join(", "))]
    UnmappedCodes(Vec<String>),
    #[error("Invalid interchange table: {0}")]
    InvalidTable(String),
}

pub type Result<T> = std::result::Result<T, ConversionError>;
