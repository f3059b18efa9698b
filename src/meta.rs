//! Meta Marketing API insights client.

use crate::ads::{AdAccountMeta, AdInsightsSource, DailySpendRow, HourlySpendRow, InsightsLevel, SpendPage};
use crate::config::MetaSettings;
use crate::error::{KpiError, Result};
use crate::http::{build_client, parse_amount};
use crate::schema::AdPlatform;
use crate::window::parse_timezone;
use async_trait::async_trait;
use chrono::NaiveDate;
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use url::Url;

const GRAPH_BASE_URL: &str = "https://graph.facebook.com";
const HOURLY_BREAKDOWN: &str = "hourly_stats_aggregated_by_advertiser_time_zone";
const PAGE_LIMIT: &str = "500";
const VENDOR: &str = "meta";

#[derive(Debug, Deserialize)]
struct AccountResponse {
    account_id: Option<String>,
    timezone_name: String,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct InsightsResponse {
    #[serde(default)]
    data: Vec<InsightsRow>,
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct InsightsRow {
    date_start: NaiveDate,
    spend: Option<String>,
    hourly_stats_aggregated_by_advertiser_time_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    cursors: Option<Cursors>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Cursors {
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: Option<String>,
    code: Option<i64>,
}

/// `"13:00:00 - 13:59:59"` -> 13.
fn parse_hour_bucket(bucket: &str) -> Option<u32> {
    let hour: u32 = bucket.trim().split(':').next()?.trim().parse().ok()?;
    (hour < 24).then_some(hour)
}

fn parse_insights_page(body: &str) -> Result<SpendPage> {
    let response: InsightsResponse = serde_json::from_str(body)?;
    let mut rows = Vec::with_capacity(response.data.len());

    for row in response.data {
        let Some(bucket) = row.hourly_stats_aggregated_by_advertiser_time_zone.as_deref() else {
            return Err(KpiError::data(VENDOR, "insights row without hourly breakdown"));
        };
        let Some(hour) = parse_hour_bucket(bucket) else {
            return Err(KpiError::data(VENDOR, format!("unparseable hour bucket '{}'", bucket)));
        };
        let record = format!("{} {}", row.date_start, bucket);
        rows.push(HourlySpendRow {
            date: row.date_start,
            hour,
            spend: parse_amount(VENDOR, &record, row.spend.as_deref()),
        });
    }

    Ok(SpendPage {
        rows,
        next_cursor: next_cursor(response.paging),
    })
}

/// Meta returns a cursor on every page; only pages with a `next` link continue.
fn next_cursor(paging: Option<Paging>) -> Option<String> {
    let paging = paging?;
    paging.next.as_ref()?;
    paging.cursors?.after
}

/// Graph API errors carry their own codes; 190 is an invalid or expired token.
fn map_graph_error(status: u16, body: &str) -> KpiError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let message = envelope.error.message.unwrap_or_default();
            match envelope.error.code {
                Some(190) | Some(102) | Some(200) => KpiError::Authorization {
                    vendor: VENDOR.to_string(),
                    status,
                },
                Some(4) | Some(17) | Some(32) | Some(613) => KpiError::Transient {
                    vendor: VENDOR.to_string(),
                    status: Some(status),
                    details: message,
                },
                _ => KpiError::from_status(VENDOR, status, message),
            }
        }
        Err(_) => KpiError::from_status(VENDOR, status, body.to_string()),
    }
}

pub struct MetaInsightsClient {
    client: Client,
    access_token: String,
    account_id: String,
    base_url: String,
}

impl MetaInsightsClient {
    pub fn new(access_token: String, ad_account_id: &str, api_version: &str) -> Result<Self> {
        let account_id = ad_account_id.trim().trim_start_matches("act_").to_string();
        if account_id.is_empty() {
            return Err(KpiError::Config("Meta ad account id is empty".to_string()));
        }
        Ok(Self {
            client: build_client(VENDOR)?,
            access_token,
            account_id,
            base_url: format!("{}/{}", GRAPH_BASE_URL, api_version),
        })
    }

    /// `None` when the settings are disabled or incomplete.
    pub fn from_settings(settings: &MetaSettings) -> Result<Option<Self>> {
        if !settings.is_configured() {
            return Ok(None);
        }
        match (&settings.access_token, &settings.ad_account_id) {
            (Some(token), Some(account)) => {
                Self::new(token.clone(), account, &settings.api_version).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn url(&self, path: &str, params: &[(&str, String)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/act_{}{}", self.base_url, self.account_id, path))
            .map_err(|e| KpiError::Config(format!("Meta URL: {}", e)))?;
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
            .append_pair("access_token", &self.access_token);
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(map_graph_error(status.as_u16(), &body))
        }
    }

    fn time_range(since: NaiveDate, until: NaiveDate) -> String {
        json!({ "since": since.to_string(), "until": until.to_string() }).to_string()
    }
}

#[async_trait]
impl AdInsightsSource for MetaInsightsClient {
    fn platform(&self) -> AdPlatform {
        AdPlatform::Meta
    }

    async fn account_meta(&self) -> Result<AdAccountMeta> {
        let url = self.url("", &[("fields", "account_id,timezone_name,currency".to_string())])?;
        let account: AccountResponse = serde_json::from_str(&self.get(url).await?)?;
        Ok(AdAccountMeta {
            account_id: account.account_id.unwrap_or_else(|| self.account_id.clone()),
            timezone: parse_timezone(&account.timezone_name)?,
            currency: account.currency,
        })
    }

    async fn hourly_spend_page(
        &self,
        level: InsightsLevel,
        since: NaiveDate,
        until: NaiveDate,
        cursor: Option<String>,
    ) -> Result<SpendPage> {
        let mut params = vec![
            ("level", level.as_str().to_string()),
            ("fields", "spend".to_string()),
            ("breakdowns", HOURLY_BREAKDOWN.to_string()),
            ("time_range", Self::time_range(since, until)),
            ("time_increment", "1".to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        if let Some(after) = cursor {
            params.push(("after", after));
        }
        let url = self.url("/insights", &params)?;
        debug!("meta insights level={} {}..{}", level.as_str(), since, until);
        parse_insights_page(&self.get(url).await?)
    }

    async fn daily_totals(&self, since: NaiveDate, until: NaiveDate) -> Result<Vec<DailySpendRow>> {
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![
                ("level", "account".to_string()),
                ("fields", "spend".to_string()),
                ("time_range", Self::time_range(since, until)),
                ("time_increment", "1".to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ];
            if let Some(after) = cursor.take() {
                params.push(("after", after));
            }
            let body = self.get(self.url("/insights", &params)?).await?;
            let response: InsightsResponse = serde_json::from_str(&body)?;

            for row in response.data {
                let record = row.date_start.to_string();
                rows.push(DailySpendRow {
                    date: row.date_start,
                    spend: parse_amount(VENDOR, &record, row.spend.as_deref()),
                });
            }

            match next_cursor(response.paging) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(rows)
    }
}
