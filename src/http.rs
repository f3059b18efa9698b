use crate::error::{KpiError, Result};
use log::warn;
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

const USER_AGENT: &str = concat!("shop-kpi-builder/", env!("CARGO_PKG_VERSION"));
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn build_client(vendor: &str) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| KpiError::Config(format!("{} HTTP client: {}", vendor, e)))
}

/// Passes successful responses through and maps the rest onto [`KpiError`].
pub(crate) async fn check_status(vendor: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(KpiError::from_status(vendor, status.as_u16(), truncate(&body, 500)))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Parses a vendor money string. Malformed values count as zero and are
/// logged with the record they belong to.
pub(crate) fn parse_amount(vendor: &str, record: &str, raw: Option<&str>) -> Decimal {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Decimal::ZERO;
    };
    match Decimal::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("{} record {}: unparseable amount '{}' ({}), using 0", vendor, record, raw, e);
            Decimal::ZERO
        }
    }
}
