use crate::api_client::{AdsApi, ApiClient, ReportQuery};
use crate::config::{Config, ReportPlan};
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::data::{self, AccountReportRow};
use crate::error::Error;
use crate::report::fetch_report;
use crate::token_manager::TokenManager;
use datafusion::prelude::SessionContext;
use log::{info, warn};
use std::path::PathBuf;

pub async fn fetch_cost_report(config: Config, plan: ReportPlan) -> Result<PathBuf, Error> {
    plan.validate()?;

    let api_client = ApiClient::new(&config)?;
    let store = FileCredentialStore::new(&config);

    run_report(&api_client, &store, &config, &plan).await
}

pub async fn list_advertisers(
    config: Config,
    row_index: usize,
    from_endpoint: bool,
) -> Result<Option<PathBuf>, Error> {
    let api_client = ApiClient::new(&config)?;
    let store = FileCredentialStore::new(&config);

    run_advertisers(&api_client, &store, &config, row_index, from_endpoint).await
}

pub async fn authorize(config: Config, row_index: usize, auth_code: &str) -> Result<(), Error> {
    let api_client = ApiClient::new(&config)?;
    let store = FileCredentialStore::new(&config);

    let session = TokenManager::new(&api_client, &store)
        .authorize(row_index, auth_code)
        .await?;

    info!(
        "credential row {} authorized, {} advertiser(s) approved",
        row_index,
        session.advertisers.len()
    );
    Ok(())
}

async fn run_report(
    api: &dyn AdsApi,
    store: &dyn CredentialStore,
    config: &Config,
    plan: &ReportPlan,
) -> Result<PathBuf, Error> {
    let token_manager = TokenManager::new(api, store);
    let mut report_rows: Vec<AccountReportRow> = vec![];

    for row_index in plan.rows.clone() {
        let session = token_manager.refresh(row_index).await?;

        for advertiser in &session.advertisers {
            let query = ReportQuery {
                advertiser_id: advertiser.advertiser_id.clone(),
                start_date: plan.start,
                end_date: plan.end,
                page_size: plan.page_size,
            };

            let rows = match fetch_report(api, &session.access_token, &query).await {
                Ok(rows) => rows,
                Err(err) if plan.skip_failed_advertisers => {
                    warn!("skipping advertiser {}: {}", advertiser.advertiser_id, err);
                    continue;
                }
                Err(err) => return Err(err),
            };

            report_rows.extend(rows.into_iter().map(|row| AccountReportRow {
                account_id: advertiser.advertiser_id.clone(),
                account_name: advertiser.display_name().to_string(),
                row,
            }));
        }
    }

    if report_rows.is_empty() {
        return Err(Error::NoData {
            message: "No report data found for the requested dates".to_string(),
        });
    }
    info!("fetched {} report rows in total", report_rows.len());

    let ctx = SessionContext::new();
    let report_df = data::transform(&report_rows, &ctx)?;

    data::export(
        report_df,
        plan.output_file.as_deref(),
        &config.output_dir,
        config.output_format,
    )
    .await
}

async fn run_advertisers(
    api: &dyn AdsApi,
    store: &dyn CredentialStore,
    config: &Config,
    row_index: usize,
    from_endpoint: bool,
) -> Result<Option<PathBuf>, Error> {
    let session = TokenManager::new(api, store).refresh(row_index).await?;

    let advertisers = if from_endpoint {
        api.fetch_advertisers(&session.access_token).await?
    } else {
        session.advertisers
    };
    info!("found {} advertiser(s)", advertisers.len());

    let ctx = SessionContext::new();
    data::export_advertisers(
        &advertisers,
        &ctx,
        &config.output_dir,
        config.output_format,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{
        AdvertiserRef, MockAdsApi, ReportData, ReportPage, ReportRow, TokenGrant,
    };
    use crate::config::test_config;
    use mockall::predicate::eq;
    use std::fs;
    use tempfile::TempDir;

    const STORE: &str = "app_id,secret,refresh_token\n\
                         4258,secret-a,refresh-a\n\
                         4259,secret-b,refresh-b\n";

    struct Fixture {
        dir: TempDir,
        config: Config,
        store: FileCredentialStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let credential_file = dir.path().join("tokens.csv");
        fs::write(&credential_file, STORE).unwrap();
        let config = test_config(credential_file.clone(), dir.path().join("out"));
        let store = FileCredentialStore::from_path(&credential_file);
        Fixture { dir, config, store }
    }

    fn read_csv_text(path: &std::path::Path) -> String {
        let bytes = fs::read(path).unwrap();
        assert_eq!(&bytes[..3], &[239, 187, 191]);
        String::from_utf8(bytes[3..].to_vec()).unwrap()
    }

    fn plan(skip_failed_advertisers: bool) -> ReportPlan {
        ReportPlan {
            rows: 1..=2,
            start: "2025-07-08".parse().unwrap(),
            end: "2025-07-08".parse().unwrap(),
            page_size: 500,
            output_file: None,
            skip_failed_advertisers,
        }
    }

    fn advertiser(id: &str, name: &str) -> AdvertiserRef {
        AdvertiserRef {
            advertiser_id: id.to_string(),
            advertiser_name: Some(name.to_string()),
        }
    }

    fn grant_for(credential_refresh: &str) -> TokenGrant {
        let (access, advertisers) = match credential_refresh {
            "refresh-a" => ("access-a", vec![advertiser("1001", "Shop A")]),
            _ => (
                "access-b",
                vec![advertiser("2001", "Shop B"), advertiser("2002", "Shop C")],
            ),
        };
        TokenGrant {
            access_token: access.to_string(),
            refresh_token: format!("{credential_refresh}-next"),
            approval_advertisers: advertisers,
        }
    }

    fn page_with(rows: usize) -> ReportPage {
        ReportPage {
            data: Some(ReportData {
                data_list: (0..rows)
                    .map(|idx| ReportRow {
                        time: "2025-07-08".to_string(),
                        spu_id: idx.to_string(),
                        fee: Some("1.5".to_string()),
                        ..Default::default()
                    })
                    .collect(),
                total_count: Some(rows as u64),
            }),
        }
    }

    fn mock_api() -> MockAdsApi {
        let mut api = MockAdsApi::new();
        api.expect_refresh_token()
            .times(2)
            .returning(|credential| Ok(grant_for(&credential.refresh_token)));
        api
    }

    #[tokio::test]
    async fn test_run_report_tags_and_exports_all_advertisers() {
        let fx = fixture();
        let mut api = mock_api();
        api.expect_fetch_report_page()
            .withf(|token, query, _| token == "access-a" && query.advertiser_id == "1001")
            .times(1)
            .returning(|_, _, _| Ok(page_with(2)));
        api.expect_fetch_report_page()
            .withf(|token, query, _| token == "access-b" && query.advertiser_id == "2001")
            .times(1)
            .returning(|_, _, _| Ok(page_with(3)));
        api.expect_fetch_report_page()
            .withf(|token, query, _| token == "access-b" && query.advertiser_id == "2002")
            .times(1)
            .returning(|_, _, _| Ok(page_with(0)));

        let path = run_report(&api, &fx.store, &fx.config, &plan(false))
            .await
            .unwrap();

        let contents = read_csv_text(&path);
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(
            lines[0],
            "时间,账户主id,账户主name,宝贝ID,商品名称,消费,曝光量,点击量,点击率,平均点击单价,千次曝光成本"
        );
        assert_eq!(lines.len(), 6);
        assert!(lines[1].starts_with("2025-07-08,1001,Shop A,0,"));
        assert!(lines[3].starts_with("2025-07-08,2001,Shop B,0,"));

        assert_eq!(fx.store.read_credential(1).unwrap().refresh_token, "refresh-a-next");
        assert_eq!(fx.store.read_credential(2).unwrap().refresh_token, "refresh-b-next");
    }

    #[tokio::test]
    async fn test_run_report_stops_on_failed_advertiser() {
        let fx = fixture();
        let mut api = MockAdsApi::new();
        api.expect_refresh_token()
            .times(1)
            .returning(|credential| Ok(grant_for(&credential.refresh_token)));
        api.expect_fetch_report_page()
            .times(1)
            .returning(|_, _, _| {
                Err(Error::Fetch {
                    message: "invalid token".to_string(),
                })
            });

        let err = run_report(&api, &fx.store, &fx.config, &plan(false))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Fetch { message } if message == "invalid token"));
        assert!(!fx.dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_run_report_skips_failed_advertiser() {
        let fx = fixture();
        let mut api = mock_api();
        api.expect_fetch_report_page()
            .withf(|_, query, _| query.advertiser_id == "1001")
            .times(1)
            .returning(|_, _, _| {
                Err(Error::Fetch {
                    message: "invalid token".to_string(),
                })
            });
        api.expect_fetch_report_page()
            .withf(|_, query, _| query.advertiser_id != "1001")
            .times(2)
            .returning(|_, _, _| Ok(page_with(1)));

        let path = run_report(&api, &fx.store, &fx.config, &plan(true))
            .await
            .unwrap();

        let contents = read_csv_text(&path);
        assert_eq!(contents.lines().count(), 3);
        assert!(!contents.contains("Shop A"));
    }

    #[tokio::test]
    async fn test_run_report_without_rows() {
        let fx = fixture();
        let mut api = mock_api();
        api.expect_fetch_report_page()
            .times(3)
            .returning(|_, _, _| Ok(page_with(0)));

        let err = run_report(&api, &fx.store, &fx.config, &plan(false))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoData { .. }));
    }

    #[tokio::test]
    async fn test_run_report_refresh_failure_keeps_store() {
        let fx = fixture();
        let mut api = MockAdsApi::new();
        api.expect_refresh_token().times(1).returning(|_| {
            Err(Error::Refresh {
                message: "invalid token".to_string(),
            })
        });
        api.expect_fetch_report_page().never();

        let err = run_report(&api, &fx.store, &fx.config, &plan(false))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Refresh { message } if message == "invalid token"));
        assert_eq!(fs::read_to_string(&fx.config.credential_file).unwrap(), STORE);
    }

    #[tokio::test]
    async fn test_run_advertisers_from_refresh_response() {
        let fx = fixture();
        let mut api = MockAdsApi::new();
        api.expect_refresh_token()
            .times(1)
            .returning(|credential| Ok(grant_for(&credential.refresh_token)));
        api.expect_fetch_advertisers().never();

        let path = run_advertisers(&api, &fx.store, &fx.config, 2, false)
            .await
            .unwrap()
            .unwrap();

        let contents = read_csv_text(&path);
        assert_eq!(
            contents.lines().collect::<Vec<_>>(),
            vec!["advertiser_id,advertiser_name", "2001,Shop B", "2002,Shop C"]
        );
    }

    #[tokio::test]
    async fn test_run_advertisers_from_endpoint() {
        let fx = fixture();
        let mut api = MockAdsApi::new();
        api.expect_refresh_token()
            .times(1)
            .returning(|credential| Ok(grant_for(&credential.refresh_token)));
        api.expect_fetch_advertisers()
            .with(eq("access-a"))
            .times(1)
            .returning(|_| Ok(vec![]));
        api.expect_fetch_report_page().never();

        let path = run_advertisers(&api, &fx.store, &fx.config, 1, true)
            .await
            .unwrap();

        assert!(path.is_none());
    }
}
