//! Google Ads API client, configured from an external credentials file.

use crate::ads::{
    AdAccountMeta, AdInsightsSource, AdSpendAggregator, DailySpendRow, FxTable, HourlySpendRow,
    InsightsLevel, SpendPage,
};
use crate::config::{GoogleAdsSettings, ReconcilerConfig};
use crate::error::{KpiError, Result};
use crate::http::{build_client, check_status};
use crate::resilience::WarnOnce;
use crate::schema::AdPlatform;
use crate::window::parse_timezone;
use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use log::debug;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const ADS_BASE_URL: &str = "https://googleads.googleapis.com";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const VENDOR: &str = "google_ads";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleAdsCredentials {
    pub developer_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub login_customer_id: Option<String>,
}

impl GoogleAdsCredentials {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn normalize_customer_id(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchRow>,
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchRow {
    #[serde(default)]
    segments: Segments,
    #[serde(default)]
    metrics: Metrics,
    customer: Option<CustomerRow>,
}

#[derive(Debug, Default, Deserialize)]
struct Segments {
    date: Option<NaiveDate>,
    hour: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metrics {
    /// int64 values arrive as JSON strings.
    cost_micros: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomerRow {
    id: Option<String>,
    time_zone: String,
    currency_code: String,
}

fn micros_to_decimal(raw: Option<&str>) -> Result<Decimal> {
    match raw {
        None => Ok(Decimal::ZERO),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map(|micros| Decimal::new(micros, 6))
            .map_err(|e| KpiError::data(VENDOR, format!("costMicros '{}': {}", raw, e))),
    }
}

fn hourly_rows(response: &SearchResponse) -> Result<Vec<HourlySpendRow>> {
    response
        .results
        .iter()
        .map(|row| {
            let (Some(date), Some(hour)) = (row.segments.date, row.segments.hour) else {
                return Err(KpiError::data(VENDOR, "search row without date/hour segment"));
            };
            Ok(HourlySpendRow {
                date,
                hour,
                spend: micros_to_decimal(row.metrics.cost_micros.as_deref())?,
            })
        })
        .collect()
}

fn resource_for(level: InsightsLevel) -> &'static str {
    match level {
        InsightsLevel::Ad => "ad_group_ad",
        InsightsLevel::Campaign => "campaign",
    }
}

pub struct GoogleAdsClient {
    client: Client,
    credentials: GoogleAdsCredentials,
    customer_id: String,
    api_version: String,
    token: Mutex<Option<CachedToken>>,
}

impl GoogleAdsClient {
    pub fn new(credentials: GoogleAdsCredentials, customer_id: Option<&str>, api_version: &str) -> Result<Self> {
        let customer_id = customer_id
            .or(credentials.customer_id.as_deref())
            .map(normalize_customer_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| KpiError::Config("Google Ads customer id is missing".to_string()))?;

        Ok(Self {
            client: build_client(VENDOR)?,
            credentials,
            customer_id,
            api_version: api_version.to_string(),
            token: Mutex::new(None),
        })
    }

    pub fn from_settings(settings: &GoogleAdsSettings) -> Result<Option<Self>> {
        let Some(path) = settings.credentials_path.as_deref().filter(|_| settings.is_configured()) else {
            return Ok(None);
        };
        let credentials = GoogleAdsCredentials::from_json_file(path)?;
        Self::new(credentials, settings.customer_id.as_deref(), &settings.api_version).map(Some)
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", self.credentials.refresh_token.as_str()),
            ])
            .send()
            .await?;
        let token: TokenResponse = check_status(VENDOR, response).await?.json().await?;
        debug!("google ads access token refreshed, valid for {}s", token.expires_in);

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn search(&self, query: &str, page_token: Option<String>) -> Result<SearchResponse> {
        let url = format!(
            "{}/{}/customers/{}/googleAds:search",
            ADS_BASE_URL, self.api_version, self.customer_id
        );
        let mut body = json!({ "query": query });
        if let Some(token) = page_token {
            body["pageToken"] = json!(token);
        }

        let mut request = self
            .client
            .post(&url)
            .bearer_auth(self.access_token().await?)
            .header("developer-token", &self.credentials.developer_token)
            .json(&body);
        if let Some(login) = self.credentials.login_customer_id.as_deref() {
            request = request.header("login-customer-id", normalize_customer_id(login));
        }

        let response = check_status(VENDOR, request.send().await?).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl AdInsightsSource for GoogleAdsClient {
    fn platform(&self) -> AdPlatform {
        AdPlatform::Google
    }

    async fn account_meta(&self) -> Result<AdAccountMeta> {
        let response = self
            .search("SELECT customer.id, customer.time_zone, customer.currency_code FROM customer", None)
            .await?;
        let customer = response
            .results
            .into_iter()
            .find_map(|row| row.customer)
            .ok_or_else(|| KpiError::data(VENDOR, "customer query returned no rows"))?;

        Ok(AdAccountMeta {
            account_id: customer.id.unwrap_or_else(|| self.customer_id.clone()),
            timezone: parse_timezone(&customer.time_zone)?,
            currency: customer.currency_code,
        })
    }

    async fn hourly_spend_page(
        &self,
        level: InsightsLevel,
        since: NaiveDate,
        until: NaiveDate,
        cursor: Option<String>,
    ) -> Result<SpendPage> {
        let query = format!(
            "SELECT segments.date, segments.hour, metrics.cost_micros FROM {} \
             WHERE segments.date BETWEEN '{}' AND '{}'",
            resource_for(level),
            since,
            until
        );
        let response = self.search(&query, cursor).await?;
        Ok(SpendPage {
            rows: hourly_rows(&response)?,
            next_cursor: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn daily_totals(&self, since: NaiveDate, until: NaiveDate) -> Result<Vec<DailySpendRow>> {
        let query = format!(
            "SELECT segments.date, metrics.cost_micros FROM customer \
             WHERE segments.date BETWEEN '{}' AND '{}'",
            since, until
        );
        let mut rows = Vec::new();
        let mut page_token = None;

        loop {
            let response = self.search(&query, page_token.take()).await?;
            for row in &response.results {
                let Some(date) = row.segments.date else {
                    return Err(KpiError::data(VENDOR, "daily row without date segment"));
                };
                rows.push(DailySpendRow {
                    date,
                    spend: micros_to_decimal(row.metrics.cost_micros.as_deref())?,
                });
            }
            match response.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(rows)
    }
}

/// Google spend of the shop-local `date` in USD, built straight from the
/// reconciler configuration. Returns zero when Google Ads is not configured.
pub async fn daily_spend_usd_aligned(date: NaiveDate, shop_tz: &Tz, config: &ReconcilerConfig) -> Result<Decimal> {
    let warnings = Arc::new(WarnOnce::new());
    let aggregator = match GoogleAdsClient::from_settings(&config.google_ads)? {
        Some(client) => AdSpendAggregator::new(Arc::new(client), "USD", config.retry.clone(), warnings.clone()),
        None => AdSpendAggregator::disabled(AdPlatform::Google, "USD", warnings.clone()),
    };
    let fx = FxTable::new("USD", config.fx_rates.clone(), warnings);
    let spend = aggregator.daily_spend(date, shop_tz).await?;
    Ok(fx.normalize(spend.spend, &spend.currency))
}
