use crate::error::Error;
use chrono::NaiveDate;
use clap::{Args as ClapArgs, ValueEnum};
use std::ops::RangeInclusive;
use std::path::PathBuf;

const DEFAULT_API_URL: &str = "https://adapi.xiaohongshu.com";
const CREDENTIAL_FILE: &str = "./refresh_tokens.xlsx";
const OUTPUT_DIR: &str = "./";
const REQUEST_TIMEOUT_SECS: &str = "60";

#[derive(ClapArgs, Debug, Clone)]
pub struct Config {
    #[arg(long, default_value = DEFAULT_API_URL, env = "API_URL")]
    pub(crate) api_url: String,

    #[arg(long, default_value = CREDENTIAL_FILE, env = "CREDENTIAL_FILE")]
    pub(crate) credential_file: PathBuf,

    #[arg(long, default_value = OUTPUT_DIR, env = "OUTPUT_DIR")]
    pub(crate) output_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Xlsx, env = "OUTPUT_FORMAT")]
    pub(crate) output_format: OutputFormat,

    #[arg(long, default_value = REQUEST_TIMEOUT_SECS, env = "REQUEST_TIMEOUT_SECS")]
    pub(crate) request_timeout_secs: u64,
}

/// File format of every spreadsheet the tool writes.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Xlsx,
    Csv,
    Parquet,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Xlsx => "xlsx",
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
        }
    }
}

/// Everything a report run needs besides connection settings.
#[derive(Debug, Clone)]
pub struct ReportPlan {
    pub rows: RangeInclusive<usize>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub page_size: u32,
    pub output_file: Option<PathBuf>,
    pub skip_failed_advertisers: bool,
}

impl ReportPlan {
    /// Rejects plans that could never produce a valid request.
    pub fn validate(&self) -> Result<(), Error> {
        if self.start > self.end {
            return Err(Error::StartDateAfterEndDate {
                start_date: self.start.to_string(),
                end_date: self.end.to_string(),
            });
        }

        if *self.rows.start() == 0 || self.rows.is_empty() {
            return Err(Error::InvalidRowRange {
                first: *self.rows.start(),
                last: *self.rows.end(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config(credential_file: PathBuf, output_dir: PathBuf) -> Config {
    Config {
        api_url: DEFAULT_API_URL.to_string(),
        credential_file,
        output_dir,
        output_format: OutputFormat::Csv,
        request_timeout_secs: 60,
    }
}
