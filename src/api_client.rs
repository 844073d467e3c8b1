use crate::config::Config;
use crate::credentials::CredentialRecord;
use crate::error::Error;
use chrono::NaiveDate;
use log::debug;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;

const ACCESS_TOKEN_HEADER: &str = "Access-Token";
const REFRESH_TOKEN_PATH: &[&str] = &["api", "open", "oauth2", "refresh_token"];
const ACCESS_TOKEN_PATH: &[&str] = &["api", "open", "oauth2", "access_token"];
const ADVERTISERS_PATH: &[&str] = &["api", "open", "oauth2", "advertiser", "get"];
const SPU_REPORT_PATH: &[&str] = &["api", "open", "wind", "data", "report", "offline", "spu"];

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AdsApi: Send + Sync + 'static {
    /// Exchanges the stored refresh token for a new token pair.
    /// # Arguments
    /// * `credential` - The credential row holding app id, secret and current refresh token.
    /// # Returns
    /// The issued [`TokenGrant`], or [`Error::Refresh`] carrying the platform's message.
    async fn refresh_token(&self, credential: &CredentialRecord) -> Result<TokenGrant, Error>;

    /// Exchanges a one-time authorization code for the first token pair of an app.
    async fn exchange_auth_code(
        &self,
        app_id: u64,
        secret: &str,
        auth_code: &str,
    ) -> Result<TokenGrant, Error>;

    /// Lists the advertiser accounts visible to an access token.
    async fn fetch_advertisers(&self, access_token: &str) -> Result<Vec<AdvertiserRef>, Error>;

    /// Fetches a single page of the daily SPU cost report.
    /// # Arguments
    /// * `access_token` - A valid access token for the advertiser.
    /// * `query` - Advertiser, date range and page size.
    /// * `page_num` - 1-based page number.
    /// # Returns
    /// The decoded [`ReportPage`], or [`Error::Fetch`] on any transport, decoding or platform failure.
    async fn fetch_report_page(
        &self,
        access_token: &str,
        query: &ReportQuery,
        page_num: u32,
    ) -> Result<ReportPage, Error>;
}

/// Token pair issued by the refresh or authorization-code endpoints.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub approval_advertisers: Vec<AdvertiserRef>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AdvertiserRef {
    #[serde(deserialize_with = "required_text")]
    pub advertiser_id: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub advertiser_name: Option<String>,
}

impl AdvertiserRef {
    pub fn display_name(&self) -> &str {
        self.advertiser_name.as_deref().unwrap_or_default()
    }
}

/// One day/SPU record as delivered by the report endpoint. Metrics are kept as
/// raw text here and coerced to numbers when the report is transformed.
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ReportRow {
    #[serde(deserialize_with = "required_text")]
    pub time: String,
    #[serde(deserialize_with = "required_text")]
    pub spu_id: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub spu_name: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub fee: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub impression: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub click: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub ctr: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub acp: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub cpm: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub spu_pic: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportQuery {
    pub advertiser_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub page_size: u32,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ReportData {
    #[serde(default)]
    pub data_list: Vec<ReportRow>,
    #[serde(default)]
    pub total_count: Option<u64>,
}

/// A decoded report response. `data` is `None` when the platform omitted the
/// payload entirely, which ends pagination.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReportPage {
    pub data: Option<ReportData>,
}

#[derive(Deserialize)]
struct Envelope {
    code: Option<i64>,
    message: Option<String>,
    data: Option<Value>,
}

#[derive(Deserialize)]
struct AdvertiserList {
    #[serde(default)]
    advertisers: Vec<AdvertiserRef>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    app_id: u64,
    secret: &'a str,
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct AuthCodeRequest<'a> {
    app_id: u64,
    secret: &'a str,
    auth_code: &'a str,
}

#[derive(Serialize)]
struct ReportRequest<'a> {
    advertiser_id: &'a str,
    start_date: String,
    end_date: String,
    time_unit: &'static str,
    page_num: u32,
    page_size: u32,
}

fn required_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(<D::Error as serde::de::Error>::custom(format!(
            "expected a string or number, found {other}"
        ))),
    }
}

fn optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Checks the HTTP status and the platform's `code` field, then decodes `data`.
/// The error string is the platform's own message whenever it supplied one.
///
/// With `code_required` a body without `code` is a failure; the token
/// endpoints always send one.
fn decode<T: DeserializeOwned>(
    status: StatusCode,
    body: &str,
    code_required: bool,
) -> Result<Option<T>, String> {
    if !status.is_success() {
        return Err(format!("request failed with status {status}: {body}"));
    }

    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| format!("unparseable response body ({e}): {body}"))?;

    match envelope.code {
        Some(0) => {}
        None if !code_required => {}
        None => {
            return Err(envelope
                .message
                .unwrap_or_else(|| "response carries no status code".to_string()))
        }
        Some(code) => {
            return Err(envelope
                .message
                .unwrap_or_else(|| format!("platform returned code {code}")))
        }
    }

    match envelope.data {
        None | Some(Value::Null) => Ok(None),
        Some(data) => serde_json::from_value(data)
            .map(Some)
            .map_err(|e| format!("malformed response data: {e}")),
    }
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("rednote-cost-report/", env!("CARGO_PKG_VERSION")));

        let is_loopback = Url::parse(&config.api_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .is_some_and(|host| matches!(host.as_str(), "127.0.0.1" | "localhost" | "[::1]"));
        if is_loopback {
            builder = builder.no_proxy();
        }

        let client = builder.build()?;

        Ok(ApiClient {
            client,
            base_url: config.api_url.to_string(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post<B: Serialize + Sync>(
        &self,
        url: Url,
        access_token: Option<&str>,
        body: &B,
    ) -> Result<(StatusCode, String), reqwest::Error> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = access_token {
            request = request.header(ACCESS_TOKEN_HEADER, token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        Ok((status, text))
    }

    async fn issue_token<B: Serialize + Sync>(
        &self,
        path: &[&str],
        body: &B,
    ) -> Result<TokenGrant, Error> {
        let url = self.endpoint(path)?;
        let (status, text) = self
            .post(url, None, body)
            .await
            .map_err(|e| Error::Refresh {
                message: e.to_string(),
            })?;

        decode::<TokenGrant>(status, &text, true)
            .and_then(|grant| grant.ok_or_else(|| "response carries no token data".to_string()))
            .map_err(|message| Error::Refresh { message })
    }
}

#[async_trait::async_trait]
impl AdsApi for ApiClient {
    async fn refresh_token(&self, credential: &CredentialRecord) -> Result<TokenGrant, Error> {
        let body = RefreshRequest {
            app_id: credential.app_id,
            secret: &credential.secret,
            refresh_token: &credential.refresh_token,
        };
        self.issue_token(REFRESH_TOKEN_PATH, &body).await
    }

    async fn exchange_auth_code(
        &self,
        app_id: u64,
        secret: &str,
        auth_code: &str,
    ) -> Result<TokenGrant, Error> {
        let body = AuthCodeRequest {
            app_id,
            secret,
            auth_code,
        };
        self.issue_token(ACCESS_TOKEN_PATH, &body).await
    }

    async fn fetch_advertisers(&self, access_token: &str) -> Result<Vec<AdvertiserRef>, Error> {
        let url = self.endpoint(ADVERTISERS_PATH)?;
        let (status, text) = self
            .post(url, Some(access_token), &serde_json::json!({}))
            .await
            .map_err(|e| Error::Fetch {
                message: e.to_string(),
            })?;

        let list = decode::<AdvertiserList>(status, &text, false)
            .map_err(|message| Error::Fetch { message })?;

        Ok(list.map(|l| l.advertisers).unwrap_or_default())
    }

    async fn fetch_report_page(
        &self,
        access_token: &str,
        query: &ReportQuery,
        page_num: u32,
    ) -> Result<ReportPage, Error> {
        let url = self.endpoint(SPU_REPORT_PATH)?;
        let body = ReportRequest {
            advertiser_id: &query.advertiser_id,
            start_date: query.start_date.format("%Y-%m-%d").to_string(),
            end_date: query.end_date.format("%Y-%m-%d").to_string(),
            time_unit: "DAY",
            page_num,
            page_size: query.page_size,
        };

        debug!(
            "requesting report page {} for advertiser {}",
            page_num, query.advertiser_id
        );

        let (status, text) = self
            .post(url, Some(access_token), &body)
            .await
            .map_err(|e| Error::Fetch {
                message: e.to_string(),
            })?;

        let data =
            decode::<ReportData>(status, &text, false).map_err(|message| Error::Fetch { message })?;

        Ok(ReportPage { data })
    }
}
