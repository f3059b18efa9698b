use crate::error::{KpiError, Result};
use crate::kpi::{DayKpi, KpiAssembler, MonthToDate};
use crate::resilience::{retry_transient, RetryPolicy};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use log::info;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReportMonth {
    pub year: i32,
    pub month: u32,
}

impl ReportMonth {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> Result<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .ok_or_else(|| KpiError::DateError(format!("invalid month {}", self)))
    }
}

impl fmt::Display for ReportMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

fn money(value: Decimal) -> Decimal {
    value.round_dp(2)
}

/// Presentation row: the only place money is rounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub date: NaiveDate,
    pub orders: u32,
    pub gross: Decimal,
    pub discounts: Decimal,
    pub refunds: Decimal,
    pub net: Decimal,
    pub cogs: Decimal,
    pub shipping_charged: Decimal,
    pub shipping_estimate: Decimal,
    pub google_spend: Decimal,
    pub meta_spend: Decimal,
    pub total_ad_spend: Decimal,
    pub google_purchases: u32,
    pub meta_purchases: u32,
    pub google_cpa: Decimal,
    pub meta_cpa: Decimal,
    pub blended_cpa: Decimal,
    pub processor_fees: Decimal,
    pub processor_shipping: Decimal,
    pub operational_profit: Decimal,
    pub net_margin: Decimal,
    pub margin_pct: Decimal,
    pub aov: Decimal,
    pub returning_customers: u32,
    pub error: Option<String>,
}

impl From<&DayKpi> for ReportRow {
    fn from(kpi: &DayKpi) -> Self {
        Self {
            date: kpi.date,
            orders: kpi.orders,
            gross: money(kpi.gross),
            discounts: money(kpi.discounts),
            refunds: money(kpi.refunds),
            net: money(kpi.net),
            cogs: money(kpi.cogs),
            shipping_charged: money(kpi.shipping_charged),
            shipping_estimate: money(kpi.shipping_estimate),
            google_spend: money(kpi.ad_spend.google),
            meta_spend: money(kpi.ad_spend.meta),
            total_ad_spend: money(kpi.ad_spend.total()),
            google_purchases: kpi.google_purchases,
            meta_purchases: kpi.meta_purchases,
            google_cpa: money(kpi.google_cpa),
            meta_cpa: money(kpi.meta_cpa),
            blended_cpa: money(kpi.blended_cpa),
            processor_fees: money(kpi.processor_fees),
            processor_shipping: money(kpi.processor_shipping),
            operational_profit: money(kpi.operational_profit),
            net_margin: money(kpi.net_margin),
            margin_pct: money(kpi.margin_pct),
            aov: money(kpi.aov),
            returning_customers: kpi.returning_customers,
            error: kpi.error.clone(),
        }
    }
}

/// Destination of the monthly report. Patching the same cell twice leaves
/// the same final state as patching it once.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn patch_day(&self, month: ReportMonth, day_of_month: u32, row: &ReportRow) -> Result<()>;

    async fn patch_month_to_date(&self, month: ReportMonth, row: &ReportRow) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonthSheet {
    pub days: BTreeMap<u32, ReportRow>,
    pub month_to_date: Option<ReportRow>,
}

#[derive(Debug, Default)]
pub struct MemoryReportSink {
    sheets: RwLock<BTreeMap<ReportMonth, MonthSheet>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sheet(&self, month: ReportMonth) -> Option<MonthSheet> {
        self.sheets.read().ok()?.get(&month).cloned()
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn patch_day(&self, month: ReportMonth, day_of_month: u32, row: &ReportRow) -> Result<()> {
        if !(1..=31).contains(&day_of_month) {
            return Err(KpiError::DateError(format!("day {} of {}", day_of_month, month)));
        }
        let mut sheets = self
            .sheets
            .write()
            .map_err(|_| KpiError::Storage("report sheets lock poisoned".to_string()))?;
        sheets
            .entry(month)
            .or_default()
            .days
            .insert(day_of_month, row.clone());
        Ok(())
    }

    async fn patch_month_to_date(&self, month: ReportMonth, row: &ReportRow) -> Result<()> {
        let mut sheets = self
            .sheets
            .write()
            .map_err(|_| KpiError::Storage("report sheets lock poisoned".to_string()))?;
        sheets.entry(month).or_default().month_to_date = Some(row.clone());
        Ok(())
    }
}

pub async fn publish_month_to_date(
    assembler: &KpiAssembler,
    sink: &dyn ReportSink,
    date: NaiveDate,
) -> Result<MonthToDate> {
    publish_month_to_date_with(assembler, sink, date, &RetryPolicy::default()).await
}

/// Computes every day from the first of `date`'s month through `date`,
/// patches each day row and then the month-to-date row. Sink writes retry
/// on transient failures.
pub async fn publish_month_to_date_with(
    assembler: &KpiAssembler,
    sink: &dyn ReportSink,
    date: NaiveDate,
    retry: &RetryPolicy,
) -> Result<MonthToDate> {
    let month = ReportMonth::of(date);
    let days = assembler.compute_range(month.first_day()?, date).await?;

    for kpi in &days {
        let row = ReportRow::from(kpi);
        let op = format!("patch {} day {}", month, kpi.date.day());
        retry_transient(retry, &op, || sink.patch_day(month, kpi.date.day(), &row)).await?;
    }

    let mtd = MonthToDate::from_days(&days)
        .ok_or_else(|| KpiError::DateError(format!("no days to publish for {}", month)))?;
    let row = ReportRow::from(&mtd.totals);
    let op = format!("patch {} month to date", month);
    retry_transient(retry, &op, || sink.patch_month_to_date(month, &row)).await?;

    info!(
        "Published {} days of {} ({} failed)",
        days.len(),
        month,
        mtd.failed_days.len()
    );
    Ok(mtd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn kpi() -> DayKpi {
        DayKpi {
            date: NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
            orders: 3,
            net: dec!(100.005),
            margin_pct: dec!(39.784946),
            aov: dec!(33.335),
            processor_shipping: dec!(7.254),
            ..DayKpi::default()
        }
    }

    #[test]
    fn test_row_rounds_to_cents() {
        let row = ReportRow::from(&kpi());
        assert_eq!(row.net, dec!(100.00));
        assert_eq!(row.margin_pct, dec!(39.78));
        assert_eq!(row.aov, dec!(33.34));
        assert_eq!(row.processor_shipping, dec!(7.25));
    }

    #[test]
    fn test_report_month() {
        let month = ReportMonth::of(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(month.to_string(), "2024-02");
        assert_eq!(month.first_day().unwrap(), NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
    }

    #[tokio::test]
    async fn test_patch_day_is_idempotent() {
        let sink = MemoryReportSink::new();
        let month = ReportMonth { year: 2024, month: 2 };
        let row = ReportRow::from(&kpi());

        sink.patch_day(month, 29, &row).await.unwrap();
        let once = sink.sheet(month).unwrap();
        sink.patch_day(month, 29, &row).await.unwrap();

        assert_eq!(sink.sheet(month).unwrap(), once);
        assert_eq!(once.days.len(), 1);
        assert!(sink.patch_day(month, 0, &row).await.is_err());
    }
}
