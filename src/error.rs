//! Error types for portfolio construction and the backtest.

use thiserror::Error;

/// Main error type for the crate.
///
/// Only [`BacktestError::ConfigError`] aborts a run. Every other variant is
/// raised by a single step (a return window, a solve, one trade leg) and is
/// handled locally by the engine.
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(#[from] chrono::ParseError),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Insufficient cash: required {required:.2}, available {available:.2}")]
    InsufficientCash { required: f64, available: f64 },

    #[error("Insufficient shares for {asset}: requested {requested}, held {held}")]
    InsufficientShares {
        asset: String,
        requested: i64,
        held: i64,
    },

    #[error("Invalid price for {asset}: {price}")]
    InvalidPrice { asset: String, price: f64 },

    #[error("No data loaded")]
    NoData,

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for crate operations.
pub type Result<T> = std::result::Result<T, BacktestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BacktestError::InvalidPrice {
            asset: "GLD".to_string(),
            price: -1.0,
        };
        assert_eq!(err.to_string(), "Invalid price for GLD: -1");

        let err = BacktestError::InsufficientCash {
            required: 1500.0,
            available: 1000.0,
        };
        assert!(err.to_string().contains("1500.00"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: BacktestError = io.into();
        assert!(matches!(err, BacktestError::IoError(_)));
    }
}
