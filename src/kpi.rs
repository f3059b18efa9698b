use crate::ads::{AdSpendAggregator, DailySpend, FxTable};
use crate::error::{KpiError, Result};
use crate::fees::{FeeAggregator, FeeSummary};
use crate::orders::{ratio_pct, OrderAggregator, OrderAnalytics};
use crate::schema::AdPlatform;
use crate::window::{days_in_range, resolve};
use chrono::NaiveDate;
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use log::{info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Ad spend of one shop day in the reporting currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdSpendTotals {
    pub google: Decimal,
    pub meta: Decimal,
}

impl AdSpendTotals {
    pub fn total(&self) -> Decimal {
        self.google + self.meta
    }

    pub fn get(&self, platform: AdPlatform) -> Decimal {
        match platform {
            AdPlatform::Google => self.google,
            AdPlatform::Meta => self.meta,
        }
    }
}

fn per_unit(amount: Decimal, count: u32) -> Decimal {
    if count == 0 {
        Decimal::ZERO
    } else {
        amount / Decimal::from(count)
    }
}

/// Reconciled KPIs of one shop-local day. Money is unrounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayKpi {
    pub date: NaiveDate,
    pub orders: u32,
    pub cancelled_orders: u32,
    pub returning_customers: u32,
    pub gross: Decimal,
    pub discounts: Decimal,
    pub refunds: Decimal,
    pub net: Decimal,
    pub cogs: Decimal,
    pub shipping_charged: Decimal,
    pub shipping_estimate: Decimal,
    pub ad_spend: AdSpendTotals,
    pub google_purchases: u32,
    pub meta_purchases: u32,
    pub google_cpa: Decimal,
    pub meta_cpa: Decimal,
    pub blended_cpa: Decimal,
    pub processor_fees: Decimal,
    /// Shipping labels bought through the payment processor. Reported only;
    /// the estimate already covers shipping cost in the profit figures.
    pub processor_shipping: Decimal,
    pub operational_profit: Decimal,
    pub net_margin: Decimal,
    pub margin_pct: Decimal,
    pub aov: Decimal,
    /// Set when the day could not be computed; every figure is then zero.
    pub error: Option<String>,
}

impl DayKpi {
    pub fn assemble(
        date: NaiveDate,
        orders: &OrderAnalytics,
        ad_spend: AdSpendTotals,
        fees: &FeeSummary,
    ) -> Self {
        let t = &orders.totals;
        let mut kpi = DayKpi {
            date,
            orders: orders.order_count,
            cancelled_orders: orders.cancelled_count,
            returning_customers: orders.returning_customers,
            gross: t.gross,
            discounts: t.discounts,
            refunds: t.refunds,
            net: t.net,
            cogs: t.cogs,
            shipping_charged: t.shipping_charged,
            shipping_estimate: t.shipping_estimate,
            ad_spend,
            google_purchases: orders.purchases(AdPlatform::Google),
            meta_purchases: orders.purchases(AdPlatform::Meta),
            processor_fees: fees.fees,
            processor_shipping: fees.shipping,
            ..DayKpi::default()
        };
        kpi.derive();
        kpi
    }

    pub fn zero_with_error(date: NaiveDate, error: impl Into<String>) -> Self {
        DayKpi {
            date,
            error: Some(error.into()),
            ..DayKpi::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn purchases(&self, platform: AdPlatform) -> u32 {
        match platform {
            AdPlatform::Google => self.google_purchases,
            AdPlatform::Meta => self.meta_purchases,
        }
    }

    /// Recomputes every derived figure from the summed ones.
    fn derive(&mut self) {
        let total_spend = self.ad_spend.total();
        self.operational_profit = self.net + self.shipping_charged
            - self.shipping_estimate
            - self.cogs
            - self.processor_fees;
        self.net_margin = self.operational_profit - total_spend;
        self.margin_pct = ratio_pct(self.net_margin, self.net + self.shipping_charged);
        self.aov = per_unit(self.net, self.orders);
        self.google_cpa = per_unit(self.ad_spend.google, self.google_purchases);
        self.meta_cpa = per_unit(self.ad_spend.meta, self.meta_purchases);
        self.blended_cpa = per_unit(total_spend, self.orders);
    }
}

/// Sum of a run of days with ratios recomputed from the sums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthToDate {
    pub first_day: NaiveDate,
    pub last_day: NaiveDate,
    pub failed_days: Vec<NaiveDate>,
    pub totals: DayKpi,
}

impl MonthToDate {
    pub fn from_days(days: &[DayKpi]) -> Option<Self> {
        let first_day = days.iter().map(|d| d.date).min()?;
        let last_day = days.iter().map(|d| d.date).max()?;

        let mut totals = DayKpi {
            date: last_day,
            ..DayKpi::default()
        };
        let mut failed_days = Vec::new();

        for day in days {
            if day.is_error() {
                failed_days.push(day.date);
                continue;
            }
            totals.orders += day.orders;
            totals.cancelled_orders += day.cancelled_orders;
            totals.returning_customers += day.returning_customers;
            totals.gross += day.gross;
            totals.discounts += day.discounts;
            totals.refunds += day.refunds;
            totals.net += day.net;
            totals.cogs += day.cogs;
            totals.shipping_charged += day.shipping_charged;
            totals.shipping_estimate += day.shipping_estimate;
            totals.ad_spend.google += day.ad_spend.google;
            totals.ad_spend.meta += day.ad_spend.meta;
            totals.google_purchases += day.google_purchases;
            totals.meta_purchases += day.meta_purchases;
            totals.processor_fees += day.processor_fees;
            totals.processor_shipping += day.processor_shipping;
        }
        totals.derive();
        if !failed_days.is_empty() {
            totals.error = Some(format!("{} day(s) failed", failed_days.len()));
        }

        Some(Self {
            first_day,
            last_day,
            failed_days,
            totals,
        })
    }
}

pub struct KpiAssembler {
    shop_tz: Tz,
    orders: OrderAggregator,
    google: AdSpendAggregator,
    meta: AdSpendAggregator,
    fees: FeeAggregator,
    fx: FxTable,
    max_workers: usize,
}

impl KpiAssembler {
    pub fn new(
        shop_tz: Tz,
        orders: OrderAggregator,
        google: AdSpendAggregator,
        meta: AdSpendAggregator,
        fees: FeeAggregator,
        fx: FxTable,
    ) -> Self {
        Self {
            shop_tz,
            orders: orders.with_fx(fx.clone()),
            google,
            meta,
            fees,
            fx,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn shop_timezone(&self) -> &Tz {
        &self.shop_tz
    }

    pub fn orders(&self) -> &OrderAggregator {
        &self.orders
    }

    pub fn ad_aggregator(&self, platform: AdPlatform) -> &AdSpendAggregator {
        match platform {
            AdPlatform::Google => &self.google,
            AdPlatform::Meta => &self.meta,
        }
    }

    pub fn fx(&self) -> &FxTable {
        &self.fx
    }

    fn normalized(&self, spend: &DailySpend) -> Decimal {
        self.fx.normalize(spend.spend, &spend.currency)
    }

    pub async fn compute_day(&self, date: NaiveDate) -> Result<DayKpi> {
        let window = resolve(&self.shop_tz, date)?;
        info!("Computing {} over {} .. {}", date, window.start, window.end);

        let (orders, google, meta, fees) = tokio::try_join!(
            self.orders.aggregate(&window),
            self.google.daily_spend(date, &self.shop_tz),
            self.meta.daily_spend(date, &self.shop_tz),
            self.fees.summarize(&window, &self.fx),
        )?;

        let ad_spend = AdSpendTotals {
            google: self.normalized(&google),
            meta: self.normalized(&meta),
        };
        Ok(DayKpi::assemble(date, &orders.analytics, ad_spend, &fees))
    }

    async fn compute_day_isolated(&self, date: NaiveDate) -> DayKpi {
        match self.compute_day(date).await {
            Ok(kpi) => kpi,
            Err(e) => {
                warn!("KPI computation for {} failed: {}", date, e);
                DayKpi::zero_with_error(date, e.to_string())
            }
        }
    }

    /// KPIs for `start..=end` in chronological order. Days run concurrently
    /// on at most `max_workers` tasks; a failed day becomes a zero row with
    /// its error attached.
    pub async fn compute_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DayKpi>> {
        if end < start {
            return Err(KpiError::DateError(format!(
                "range end {} is before start {}",
                end, start
            )));
        }
        let days = days_in_range(start, end);
        if days.len() == 1 {
            return Ok(vec![self.compute_day_isolated(start).await]);
        }

        let workers = self.max_workers.min(days.len());
        info!("Computing {} days {} .. {} on {} workers", days.len(), start, end, workers);

        let by_date: BTreeMap<NaiveDate, DayKpi> = stream::iter(days)
            .map(|date| async move { (date, self.compute_day_isolated(date).await) })
            .buffer_unordered(workers)
            .collect()
            .await;

        Ok(by_date.into_values().collect())
    }
}
