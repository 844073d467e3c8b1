use datafusion::{arrow::error::ArrowError, error::DataFusionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Xlsx: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("'The date supplied {date} is invalid'")]
    InvalidDate { date: String },

    #[error("The start date: '{start_date}' is greater than the end date: '{end_date}'")]
    StartDateAfterEndDate {
        start_date: String,
        end_date: String,
    },

    #[error("Invalid credential row range {first}..={last}, rows are numbered from 1")]
    InvalidRowRange { first: usize, last: usize },

    #[error("Failed to build the API client: {0}")]
    ApiFailure(#[from] reqwest::Error),

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("Failed to read credential row {row_index}: {reason}")]
    ReadCredential { row_index: usize, reason: String },

    #[error("Failed to write credential row {row_index}: {reason}")]
    WriteCredential { row_index: usize, reason: String },

    #[error("Token refresh failed: {message}")]
    Refresh { message: String },

    #[error("Report fetch failed: {message}")]
    Fetch { message: String },

    #[error("Column '{column}' is missing from the report")]
    Schema { column: String },

    #[error("{message}")]
    NoData { message: String },
}
