use crate::api_client::{AdsApi, ReportQuery, ReportRow};
use crate::error::Error;
use log::{info, warn};

/// Pages through the SPU report of one advertiser.
///
/// The page count is fixed by the `total_count` of the first page. Any failed
/// page aborts the whole fetch; rows are returned in page order, then in the
/// order the platform listed them.
pub async fn fetch_report(
    api: &dyn AdsApi,
    access_token: &str,
    query: &ReportQuery,
) -> Result<Vec<ReportRow>, Error> {
    if query.page_size == 0 {
        return Err(Error::Fetch {
            message: "page size must be at least 1".to_string(),
        });
    }

    let mut rows = Vec::new();
    let mut total_pages: u64 = 1;
    let mut page_num: u32 = 1;

    while u64::from(page_num) <= total_pages {
        let page = api.fetch_report_page(access_token, query, page_num).await?;

        let Some(data) = page.data else {
            warn!(
                "report page {} for advertiser {} carried no data, stopping",
                page_num, query.advertiser_id
            );
            break;
        };

        if page_num == 1 {
            if data.data_list.is_empty() {
                break;
            }
            total_pages = match data.total_count {
                Some(total_count) => total_count.div_ceil(u64::from(query.page_size)),
                None => 1,
            };
        }

        rows.extend(data.data_list);
        page_num += 1;
    }

    info!(
        "fetched {} report rows for advertiser {}",
        rows.len(),
        query.advertiser_id
    );

    Ok(rows)
}
