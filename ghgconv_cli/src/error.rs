use ghgconv::error::ConversionError;
use polars::error::PolarsError;

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error("{0:#}")]
    Anyhow(#[from] anyhow::Error),
    #[error("serde JSON error: {0}")]
    SerdeJSONError(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("polars error: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("conversion error: {0}")]
    ConversionError(#[from] ConversionError),
    #[error("std IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("task error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

pub type CliResult<T> = Result<T, CliError>;
