mod api_client;
mod config;
mod credentials;
mod data;
mod error;
mod report;
mod runner;
mod token_manager;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::{Config, ReportPlan};
use error::Error;
use log::{error, info};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about = "Exports RedNote ad cost reports to spreadsheets")]
struct Args {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh every credential row and export the daily SPU cost report of all approved advertisers
    Fetch {
        #[arg(help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        start: NaiveDate,

        #[arg(help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        end: NaiveDate,

        /// First credential row to process (1-based)
        #[arg(long, default_value_t = 1)]
        first_row: usize,

        /// Last credential row to process (inclusive)
        #[arg(long, default_value_t = 2)]
        last_row: usize,

        #[arg(long, default_value_t = 500, value_parser = clap::value_parser!(u32).range(1..))]
        page_size: u32,

        /// Write the report here instead of a timestamped file under --output-dir
        #[arg(long)]
        output: Option<PathBuf>,

        /// Log a failed advertiser and continue with the next one
        #[arg(long)]
        skip_failed_advertisers: bool,
    },

    /// Refresh one credential row and export its advertiser accounts
    Advertisers {
        #[arg(long, default_value_t = 1)]
        row: usize,

        /// Ask the advertiser list endpoint instead of using the refresh response
        #[arg(long)]
        from_endpoint: bool,
    },

    /// Exchange an authorization code for the first refresh token of a credential row
    Authorize {
        #[arg(long, default_value_t = 1)]
        row: usize,

        #[arg(long)]
        auth_code: String,
    },
}

fn validate_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| "Invalid date, expected YYYY-MM-DD".to_string())
}

async fn run(args: Args) -> Result<(), Error> {
    match args.command {
        Command::Fetch {
            start,
            end,
            first_row,
            last_row,
            page_size,
            output,
            skip_failed_advertisers,
        } => {
            let plan = ReportPlan {
                rows: first_row..=last_row,
                start,
                end,
                page_size,
                output_file: output,
                skip_failed_advertisers,
            };
            let path = runner::fetch_cost_report(args.config, plan).await?;
            info!("done, report written to {}", path.display());
        }
        Command::Advertisers { row, from_endpoint } => {
            runner::list_advertisers(args.config, row, from_endpoint).await?;
        }
        Command::Authorize { row, auth_code } => {
            runner::authorize(args.config, row, &auth_code).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    env_logger::init();

    if let Err(err) = run(args).await {
        error!("run failed: {}", err);
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_validate_date() {
        assert_eq!(
            validate_date("2025-07-08"),
            Ok(NaiveDate::from_ymd_opt(2025, 7, 8).unwrap())
        );
        assert!(validate_date("2025-13-08").is_err());
        assert!(validate_date("08/07/2025").is_err());
    }

    #[test]
    fn test_fetch_defaults() {
        let args =
            Args::try_parse_from(["rednote-cost-report", "fetch", "2025-07-08", "2025-07-08"])
                .unwrap();

        assert_eq!(args.config.api_url, "https://adapi.xiaohongshu.com");
        match args.command {
            Command::Fetch {
                first_row,
                last_row,
                page_size,
                output,
                skip_failed_advertisers,
                ..
            } => {
                assert_eq!((first_row, last_row), (1, 2));
                assert_eq!(page_size, 500);
                assert!(output.is_none());
                assert!(!skip_failed_advertisers);
            }
            _ => panic!("Expected fetch command"),
        }
    }

    #[test]
    fn test_fetch_rejects_zero_page_size() {
        let result = Args::try_parse_from([
            "rednote-cost-report",
            "fetch",
            "2025-07-08",
            "2025-07-08",
            "--page-size",
            "0",
        ]);
        assert!(result.is_err());
    }
}
