//! Ad platform spend, aligned to the shop-local day.
//!
//! Vendors report spend per hour in the ad account's own timezone. For one
//! shop day we build the [`VendorHourWindow`] of account-local hours that
//! overlap it, fetch hourly rows for that span and keep only the rows whose
//! `(date, hour)` falls inside the window. When the ad-level breakdown has
//! no matching rows at all the same window is summed at campaign level
//! instead; the two levels are never mixed.

use crate::error::{KpiError, Result};
use crate::resilience::{retry_transient, RetryPolicy, WarnOnce};
use crate::schema::{AdPlatform, AdSpendFact};
use crate::window::{days_in_range, map_to_vendor_hours, resolve, VendorHourWindow};
use async_trait::async_trait;
use chrono::NaiveDate;
use chrono_tz::Tz;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightsLevel {
    Ad,
    Campaign,
}

impl InsightsLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightsLevel::Ad => "ad",
            InsightsLevel::Campaign => "campaign",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdAccountMeta {
    pub account_id: String,
    pub timezone: Tz,
    pub currency: String,
}

/// Spend for one account-local hour. `date` and `hour` are in the account timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlySpendRow {
    pub date: NaiveDate,
    pub hour: u32,
    pub spend: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailySpendRow {
    pub date: NaiveDate,
    pub spend: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpendPage {
    pub rows: Vec<HourlySpendRow>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySpend {
    pub spend: Decimal,
    pub currency: String,
}

impl DailySpend {
    pub fn zero(currency: impl Into<String>) -> Self {
        Self {
            spend: Decimal::ZERO,
            currency: currency.into(),
        }
    }
}

/// Reporting API of one ad account.
#[async_trait]
pub trait AdInsightsSource: Send + Sync {
    fn platform(&self) -> AdPlatform;

    async fn account_meta(&self) -> Result<AdAccountMeta>;

    /// One page of hourly rows for account-local dates `since..=until`.
    async fn hourly_spend_page(
        &self,
        level: InsightsLevel,
        since: NaiveDate,
        until: NaiveDate,
        cursor: Option<String>,
    ) -> Result<SpendPage>;

    /// Account totals per account-local date `since..=until`.
    async fn daily_totals(&self, since: NaiveDate, until: NaiveDate) -> Result<Vec<DailySpendRow>>;
}

/// Converts vendor currencies into the reporting currency with static rates.
#[derive(Debug, Clone)]
pub struct FxTable {
    reporting_currency: String,
    rates: BTreeMap<String, Decimal>,
    warnings: Arc<WarnOnce>,
}

impl FxTable {
    pub fn new(
        reporting_currency: impl Into<String>,
        rates: BTreeMap<String, Decimal>,
        warnings: Arc<WarnOnce>,
    ) -> Self {
        Self {
            reporting_currency: reporting_currency.into().to_uppercase(),
            rates: rates
                .into_iter()
                .map(|(code, rate)| (code.to_uppercase(), rate))
                .collect(),
            warnings,
        }
    }

    pub fn reporting_currency(&self) -> &str {
        &self.reporting_currency
    }

    /// Amount in the reporting currency. An unknown currency yields zero and
    /// a single warning per currency.
    pub fn normalize(&self, amount: Decimal, currency: &str) -> Decimal {
        let code = currency.trim().to_uppercase();
        if code == self.reporting_currency || amount.is_zero() {
            return amount;
        }
        match self.rates.get(&code) {
            Some(rate) => amount * rate,
            None => {
                self.warnings.warn(
                    &format!("fx:{}", code),
                    &format!(
                        "No FX rate configured for {} -> {}; treating amounts as 0",
                        code, self.reporting_currency
                    ),
                );
                Decimal::ZERO
            }
        }
    }
}

pub struct AdSpendAggregator {
    platform: AdPlatform,
    source: Option<Arc<dyn AdInsightsSource>>,
    default_currency: String,
    retry: RetryPolicy,
    warnings: Arc<WarnOnce>,
    meta: OnceCell<AdAccountMeta>,
}

impl AdSpendAggregator {
    pub fn new(
        source: Arc<dyn AdInsightsSource>,
        default_currency: impl Into<String>,
        retry: RetryPolicy,
        warnings: Arc<WarnOnce>,
    ) -> Self {
        Self {
            platform: source.platform(),
            source: Some(source),
            default_currency: default_currency.into(),
            retry,
            warnings,
            meta: OnceCell::new(),
        }
    }

    /// Aggregator for a platform without credentials or explicitly switched
    /// off. It always reports zero spend.
    pub fn disabled(
        platform: AdPlatform,
        default_currency: impl Into<String>,
        warnings: Arc<WarnOnce>,
    ) -> Self {
        Self {
            platform,
            source: None,
            default_currency: default_currency.into(),
            retry: RetryPolicy::none(),
            warnings,
            meta: OnceCell::new(),
        }
    }

    pub fn platform(&self) -> AdPlatform {
        self.platform
    }

    pub fn is_enabled(&self) -> bool {
        self.source.is_some()
    }

    /// Account metadata, fetched on first use and shared by every later call.
    pub async fn account_meta(&self) -> Result<&AdAccountMeta> {
        let source = self.require_source()?;
        self.meta
            .get_or_try_init(|| async {
                let op = format!("{} account metadata", self.platform);
                let meta = retry_transient(&self.retry, &op, || source.account_meta()).await?;
                info!(
                    "{} account {} reports in {} ({})",
                    self.platform,
                    meta.account_id,
                    meta.timezone.name(),
                    meta.currency
                );
                Ok::<AdAccountMeta, KpiError>(meta)
            })
            .await
    }

    fn require_source(&self) -> Result<&Arc<dyn AdInsightsSource>> {
        self.source.as_ref().ok_or_else(|| {
            KpiError::Config(format!("{} ad account is not configured", self.platform))
        })
    }

    fn zero(&self) -> DailySpend {
        let currency = self
            .meta
            .get()
            .map(|m| m.currency.clone())
            .unwrap_or_else(|| self.default_currency.clone());
        DailySpend::zero(currency)
    }

    fn warn_unconfigured(&self) {
        self.warnings.warn(
            &format!("{}:unconfigured", self.platform),
            &format!(
                "{} spend disabled or missing credentials; reporting zero spend",
                self.platform
            ),
        );
    }

    fn degrade<T>(&self, result: Result<T>, fallback: impl FnOnce() -> T) -> Result<T> {
        match result {
            Err(e) if e.is_authorization() => {
                self.warnings.warn(
                    &format!("{}:authorization", self.platform),
                    &format!("{} rejected credentials, treating spend as zero: {}", self.platform, e),
                );
                Ok(fallback())
            }
            other => other,
        }
    }

    async fn fetch_hourly(
        &self,
        source: &Arc<dyn AdInsightsSource>,
        level: InsightsLevel,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<HourlySpendRow>> {
        let op = format!("{} {}-level insights {}..{}", self.platform, level.as_str(), since, until);
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors = HashSet::new();

        loop {
            let page = retry_transient(&self.retry, &op, || {
                source.hourly_spend_page(level, since, until, cursor.clone())
            })
            .await?;
            debug!("{}: page with {} rows", op, page.rows.len());
            rows.extend(page.rows);

            match page.next_cursor {
                Some(next) if seen_cursors.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!("{}: cursor {} repeated, stopping pagination", op, next);
                    break;
                }
                None => break,
            }
        }

        Ok(rows)
    }

    /// Spend of the shop-local `date`, in the ad account's currency.
    pub async fn daily_spend(&self, date: NaiveDate, shop_tz: &Tz) -> Result<DailySpend> {
        if self.source.is_none() {
            self.warn_unconfigured();
            return Ok(self.zero());
        }
        let result = self.aligned_spend(date, shop_tz).await;
        self.degrade(result, || self.zero())
    }

    async fn aligned_spend(&self, date: NaiveDate, shop_tz: &Tz) -> Result<DailySpend> {
        let source = self.require_source()?;
        let meta = self.account_meta().await?;
        let window = resolve(shop_tz, date)?;
        let mask = map_to_vendor_hours(&window, &meta.timezone);
        let Some((since, until)) = mask.date_span() else {
            return Ok(DailySpend::zero(meta.currency.clone()));
        };

        let ad_rows = self.fetch_hourly(source, InsightsLevel::Ad, since, until).await?;
        let (matched, spend) = sum_within(&ad_rows, &mask);
        if matched > 0 {
            debug!("{} {}: {} ad-level hours matched", self.platform, date, matched);
            return Ok(DailySpend {
                spend,
                currency: meta.currency.clone(),
            });
        }

        debug!(
            "{} {}: no ad-level rows inside the shop day, falling back to campaign level",
            self.platform, date
        );
        let campaign_rows = self
            .fetch_hourly(source, InsightsLevel::Campaign, since, until)
            .await?;
        let (matched, spend) = sum_within(&campaign_rows, &mask);
        debug!("{} {}: {} campaign-level hours matched", self.platform, date, matched);
        Ok(DailySpend {
            spend,
            currency: meta.currency.clone(),
        })
    }

    /// Per-day spend for a backfill range using account daily totals. Days
    /// are account-local, not shop-local: a deliberate approximation that
    /// trades hour alignment for one request per range.
    pub async fn range_spend(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<NaiveDate, DailySpend>> {
        let zeros = || -> BTreeMap<NaiveDate, DailySpend> {
            days_in_range(start, end)
                .into_iter()
                .map(|d| (d, self.zero()))
                .collect()
        };

        let Some(source) = self.source.as_ref() else {
            self.warn_unconfigured();
            return Ok(zeros());
        };

        let result = async {
            let meta = self.account_meta().await?;
            let op = format!("{} daily totals {}..{}", self.platform, start, end);
            let rows = retry_transient(&self.retry, &op, || source.daily_totals(start, end)).await?;

            let mut by_day: BTreeMap<NaiveDate, DailySpend> = days_in_range(start, end)
                .into_iter()
                .map(|d| (d, DailySpend::zero(meta.currency.clone())))
                .collect();
            for row in rows {
                if let Some(day) = by_day.get_mut(&row.date) {
                    day.spend += row.spend;
                }
            }
            Ok::<_, KpiError>(by_day)
        }
        .await;

        self.degrade(result, zeros)
    }

    /// Persistable spend fact for one shop day, or `None` when the platform
    /// is not configured.
    pub async fn spend_fact(
        &self,
        date: NaiveDate,
        shop_tz: &Tz,
        fx: &FxTable,
    ) -> Result<Option<AdSpendFact>> {
        if !self.is_enabled() {
            self.warn_unconfigured();
            return Ok(None);
        }
        let daily = self.daily_spend(date, shop_tz).await?;
        let account_id = self
            .meta
            .get()
            .map(|m| m.account_id.clone())
            .unwrap_or_default();

        Ok(Some(AdSpendFact {
            date,
            platform: self.platform,
            account_id,
            spend_normalized: fx.normalize(daily.spend, &daily.currency),
            spend: daily.spend,
            currency: daily.currency,
        }))
    }
}

/// Number of rows inside the window and their summed spend.
pub fn sum_within(rows: &[HourlySpendRow], mask: &VendorHourWindow) -> (usize, Decimal) {
    rows.iter()
        .filter(|row| mask.contains(row.date, row.hour))
        .fold((0, Decimal::ZERO), |(n, sum), row| (n + 1, sum + row.spend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::parse_timezone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeInsights {
        meta: AdAccountMeta,
        ad_rows: Vec<HourlySpendRow>,
        campaign_rows: Vec<HourlySpendRow>,
        daily: Vec<DailySpendRow>,
        page_size: usize,
        fail_status: Option<u16>,
        meta_calls: AtomicU32,
        campaign_calls: AtomicU32,
    }

    impl FakeInsights {
        fn new(timezone: &str) -> Self {
            Self {
                meta: AdAccountMeta {
                    account_id: "act_42".to_string(),
                    timezone: parse_timezone(timezone).unwrap(),
                    currency: "EUR".to_string(),
                },
                ad_rows: vec![],
                campaign_rows: vec![],
                daily: vec![],
                page_size: 2,
                fail_status: None,
                meta_calls: AtomicU32::new(0),
                campaign_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AdInsightsSource for FakeInsights {
        fn platform(&self) -> AdPlatform {
            AdPlatform::Meta
        }

        async fn account_meta(&self) -> Result<AdAccountMeta> {
            self.meta_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.meta.clone())
        }

        async fn hourly_spend_page(
            &self,
            level: InsightsLevel,
            since: NaiveDate,
            until: NaiveDate,
            cursor: Option<String>,
        ) -> Result<SpendPage> {
            if let Some(status) = self.fail_status {
                return Err(KpiError::from_status("fake", status, "injected"));
            }
            let source = match level {
                InsightsLevel::Ad => &self.ad_rows,
                InsightsLevel::Campaign => {
                    self.campaign_calls.fetch_add(1, Ordering::SeqCst);
                    &self.campaign_rows
                }
            };
            let in_span: Vec<HourlySpendRow> = source
                .iter()
                .filter(|r| r.date >= since && r.date <= until)
                .cloned()
                .collect();
            let offset: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (offset + self.page_size).min(in_span.len());
            Ok(SpendPage {
                rows: in_span[offset..end].to_vec(),
                next_cursor: (end < in_span.len()).then(|| end.to_string()),
            })
        }

        async fn daily_totals(&self, since: NaiveDate, until: NaiveDate) -> Result<Vec<DailySpendRow>> {
            if let Some(status) = self.fail_status {
                return Err(KpiError::from_status("fake", status, "injected"));
            }
            Ok(self
                .daily
                .iter()
                .filter(|r| r.date >= since && r.date <= until)
                .cloned()
                .collect())
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(d: NaiveDate, hour: u32, spend: Decimal) -> HourlySpendRow {
        HourlySpendRow { date: d, hour, spend }
    }

    fn aggregator(fake: Arc<FakeInsights>, warnings: Arc<WarnOnce>) -> AdSpendAggregator {
        AdSpendAggregator::new(fake, "USD", RetryPolicy::none(), warnings)
    }

    fn new_york() -> Tz {
        parse_timezone("America/New_York").unwrap()
    }

    #[tokio::test]
    async fn test_ad_level_rows_filtered_to_shop_day() {
        let mut fake = FakeInsights::new("UTC");
        fake.ad_rows = vec![
            row(date(2024, 7, 4), 3, dec!(100)),
            row(date(2024, 7, 4), 4, dec!(1.5)),
            row(date(2024, 7, 4), 23, dec!(2.25)),
            row(date(2024, 7, 5), 3, dec!(3)),
            row(date(2024, 7, 5), 4, dec!(100)),
        ];
        fake.campaign_rows = vec![row(date(2024, 7, 4), 12, dec!(999))];
        let fake = Arc::new(fake);

        let agg = aggregator(fake.clone(), Arc::new(WarnOnce::new()));
        let spend = agg.daily_spend(date(2024, 7, 4), &new_york()).await.unwrap();

        assert_eq!(spend.spend, dec!(6.75));
        assert_eq!(spend.currency, "EUR");
        assert_eq!(fake.campaign_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_campaign_fallback_when_ad_rows_masked_out() {
        let mut fake = FakeInsights::new("UTC");
        fake.ad_rows = vec![
            row(date(2024, 7, 4), 2, dec!(10)),
            row(date(2024, 7, 5), 5, dec!(3)),
        ];
        fake.campaign_rows = vec![
            row(date(2024, 7, 4), 2, dec!(100)),
            row(date(2024, 7, 4), 10, dec!(7.5)),
            row(date(2024, 7, 5), 3, dec!(2.5)),
            row(date(2024, 7, 5), 4, dec!(50)),
        ];
        let fake = Arc::new(fake);

        let agg = aggregator(fake.clone(), Arc::new(WarnOnce::new()));
        let spend = agg.daily_spend(date(2024, 7, 4), &new_york()).await.unwrap();

        assert_eq!(spend.spend, dec!(10));
        assert_eq!(fake.campaign_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_spend_rows_do_not_trigger_fallback() {
        let mut fake = FakeInsights::new("America/New_York");
        fake.ad_rows = vec![row(date(2024, 7, 4), 9, dec!(0))];
        fake.campaign_rows = vec![row(date(2024, 7, 4), 9, dec!(40))];
        let fake = Arc::new(fake);

        let agg = aggregator(fake.clone(), Arc::new(WarnOnce::new()));
        let spend = agg.daily_spend(date(2024, 7, 4), &new_york()).await.unwrap();

        assert_eq!(spend.spend, Decimal::ZERO);
        assert_eq!(fake.campaign_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_account_meta_cached_across_days() {
        let mut fake = FakeInsights::new("Europe/Berlin");
        fake.ad_rows = (0..24).map(|h| row(date(2024, 7, 4), h, dec!(1))).collect();
        let fake = Arc::new(fake);

        let agg = aggregator(fake.clone(), Arc::new(WarnOnce::new()));
        let tz = parse_timezone("Europe/Berlin").unwrap();
        let (a, b) = tokio::join!(
            agg.daily_spend(date(2024, 7, 4), &tz),
            agg.daily_spend(date(2024, 7, 5), &tz)
        );

        assert_eq!(a.unwrap().spend, dec!(24));
        assert_eq!(b.unwrap().spend, Decimal::ZERO);
        assert_eq!(fake.meta_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_authorization_failure_degrades_to_zero_and_warns_once() {
        let mut fake = FakeInsights::new("UTC");
        fake.fail_status = Some(401);
        let warnings = Arc::new(WarnOnce::new());
        let agg = aggregator(Arc::new(fake), warnings.clone());

        let first = agg.daily_spend(date(2024, 7, 4), &new_york()).await.unwrap();
        assert_eq!(first.spend, Decimal::ZERO);
        assert!(warnings.has_warned("meta:authorization"));
        assert!(!warnings.warn("meta:authorization", "again"));

        let range = agg.range_spend(date(2024, 7, 1), date(2024, 7, 3)).await.unwrap();
        assert_eq!(range.len(), 3);
    }

    #[tokio::test]
    async fn test_other_failures_propagate() {
        let mut fake = FakeInsights::new("UTC");
        fake.fail_status = Some(500);
        let agg = aggregator(Arc::new(fake), Arc::new(WarnOnce::new()));

        let err = agg.daily_spend(date(2024, 7, 4), &new_york()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_disabled_platform_reports_zero() {
        let warnings = Arc::new(WarnOnce::new());
        let agg = AdSpendAggregator::disabled(AdPlatform::Google, "USD", warnings.clone());

        let spend = agg.daily_spend(date(2024, 7, 4), &new_york()).await.unwrap();
        assert_eq!(spend, DailySpend::zero("USD"));
        assert!(warnings.has_warned("google:unconfigured"));

        let fx = FxTable::new("USD", BTreeMap::new(), warnings);
        assert!(agg.spend_fact(date(2024, 7, 4), &new_york(), &fx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_range_spend_fills_missing_days() {
        let mut fake = FakeInsights::new("UTC");
        fake.daily = vec![
            DailySpendRow { date: date(2024, 7, 1), spend: dec!(10) },
            DailySpendRow { date: date(2024, 7, 3), spend: dec!(5) },
            DailySpendRow { date: date(2024, 7, 3), spend: dec!(1) },
        ];
        let agg = aggregator(Arc::new(fake), Arc::new(WarnOnce::new()));

        let range = agg.range_spend(date(2024, 7, 1), date(2024, 7, 3)).await.unwrap();
        let spends: Vec<Decimal> = range.values().map(|d| d.spend).collect();
        assert_eq!(spends, vec![dec!(10), Decimal::ZERO, dec!(6)]);
    }

    #[tokio::test]
    async fn test_spend_fact_normalizes_currency() {
        let mut fake = FakeInsights::new("UTC");
        fake.ad_rows = vec![row(date(2024, 7, 4), 12, dec!(20))];
        let warnings = Arc::new(WarnOnce::new());
        let agg = aggregator(Arc::new(fake), warnings.clone());
        let fx = FxTable::new(
            "USD",
            BTreeMap::from([("eur".to_string(), dec!(1.1))]),
            warnings,
        );

        let fact = agg
            .spend_fact(date(2024, 7, 4), &chrono_tz::UTC, &fx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fact.account_id, "act_42");
        assert_eq!(fact.spend, dec!(20));
        assert_eq!(fact.spend_normalized, dec!(22.0));
    }

    #[test]
    fn test_fx_unknown_currency_is_zero() {
        let warnings = Arc::new(WarnOnce::new());
        let fx = FxTable::new("usd", BTreeMap::new(), warnings.clone());
        assert_eq!(fx.normalize(dec!(5), "USD"), dec!(5));
        assert_eq!(fx.normalize(dec!(5), "GBP"), Decimal::ZERO);
        assert!(warnings.has_warned("fx:GBP"));
    }
}
