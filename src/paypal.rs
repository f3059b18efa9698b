//! PayPal transaction search client.

use crate::config::PayPalSettings;
use crate::error::{KpiError, Result};
use crate::fees::{TransactionPage, TransactionSource};
use crate::http::{build_client, check_status, parse_amount};
use crate::schema::ProcessorTransaction;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const LIVE_BASE_URL: &str = "https://api-m.paypal.com";
const SANDBOX_BASE_URL: &str = "https://api-m.sandbox.paypal.com";
const VENDOR: &str = "paypal";
const PAGE_SIZE: u32 = 500;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

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
struct SearchResponse {
    #[serde(default)]
    transaction_details: Vec<TransactionDetail>,
    #[serde(default)]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct TransactionDetail {
    transaction_info: TransactionInfo,
}

#[derive(Debug, Deserialize)]
struct TransactionInfo {
    transaction_id: String,
    transaction_initiation_date: String,
    transaction_status: Option<String>,
    fee_amount: Option<Amount>,
    shipping_amount: Option<Amount>,
    transaction_amount: Option<Amount>,
}

#[derive(Debug, Deserialize)]
struct Amount {
    currency_code: String,
    value: String,
}

/// PayPal writes offsets both as `+0000` and as `Z`.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// `None` when the record has no usable date; it cannot be placed in a
/// window, so it is logged and skipped.
fn convert(info: TransactionInfo) -> Option<ProcessorTransaction> {
    let record = info.transaction_id.as_str();
    let Some(initiated_at) = parse_timestamp(&info.transaction_initiation_date) else {
        warn!(
            "{} transaction {} has unparseable date '{}', skipping it",
            VENDOR, record, info.transaction_initiation_date
        );
        return None;
    };
    let currency = info
        .fee_amount
        .as_ref()
        .or(info.transaction_amount.as_ref())
        .or(info.shipping_amount.as_ref())
        .map(|a| a.currency_code.clone())
        .unwrap_or_default();
    let fee = parse_amount(VENDOR, record, info.fee_amount.as_ref().map(|a| a.value.as_str()));
    let shipping = parse_amount(VENDOR, record, info.shipping_amount.as_ref().map(|a| a.value.as_str()));

    Some(ProcessorTransaction {
        id: info.transaction_id,
        initiated_at,
        status: info.transaction_status,
        currency,
        fee,
        shipping,
    })
}

fn parse_search_page(body: &str) -> Result<TransactionPage> {
    let response: SearchResponse = serde_json::from_str(body)?;
    Ok(TransactionPage {
        transactions: response
            .transaction_details
            .into_iter()
            .filter_map(|d| convert(d.transaction_info))
            .collect(),
        total_pages: response.total_pages,
    })
}

pub struct PayPalClient {
    client: Client,
    base_url: String,
    basic_auth: String,
    token: Mutex<Option<CachedToken>>,
}

impl PayPalClient {
    pub fn new(client_id: &str, client_secret: &str, sandbox: bool) -> Result<Self> {
        let credentials = STANDARD.encode(format!("{}:{}", client_id, client_secret));
        Ok(Self {
            client: build_client(VENDOR)?,
            base_url: if sandbox { SANDBOX_BASE_URL } else { LIVE_BASE_URL }.to_string(),
            basic_auth: format!("Basic {}", credentials),
            token: Mutex::new(None),
        })
    }

    pub fn from_settings(settings: &PayPalSettings) -> Result<Option<Self>> {
        if !settings.is_configured() {
            return Ok(None);
        }
        match (&settings.client_id, &settings.client_secret) {
            (Some(id), Some(secret)) => Self::new(id, secret, settings.sandbox).map(Some),
            _ => Ok(None),
        }
    }

    /// Client-credentials token, reused until shortly before it expires.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.base_url))
            .header("Authorization", &self.basic_auth)
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let token: TokenResponse = check_status(VENDOR, response).await?.json().await?;
        debug!("paypal access token refreshed, valid for {}s", token.expires_in);

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}

#[async_trait]
impl TransactionSource for PayPalClient {
    fn name(&self) -> &str {
        VENDOR
    }

    async fn fetch_transactions_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: u32,
    ) -> Result<TransactionPage> {
        if end <= start {
            return Err(KpiError::DateError(format!(
                "transaction search end {} is not after start {}",
                end, start
            )));
        }
        let query = [
            ("start_date", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end_date", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("fields", "transaction_info".to_string()),
            ("page_size", PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];
        let response = self
            .client
            .get(format!("{}/v1/reporting/transactions", self.base_url))
            .bearer_auth(self.access_token().await?)
            .query(&query)
            .send()
            .await?;
        let body = check_status(VENDOR, response).await?.text().await?;
        parse_search_page(&body)
    }
}
