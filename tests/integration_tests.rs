use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use shop_kpi_builder::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SHOP_TZ: chrono_tz::Tz = chrono_tz::America::New_York;

fn june(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
}

/// One order per day at noon New York time, matching the worked margin example.
fn order(id: &str, day: u32) -> Order {
    Order {
        id: id.to_string(),
        name: Some(format!("#{}", id)),
        created_at: Utc.with_ymd_and_hms(2024, 6, day, 16, 0, 0).unwrap(),
        cancelled_at: None,
        source_name: Some("web".to_string()),
        currency: "USD".to_string(),
        customer: Some(Customer {
            id: Some(format!("customer-{}", id)),
            orders_count: 1,
        }),
        shipping_address: Some(ShippingAddress {
            country: Some("United States".to_string()),
            country_code: Some("US".to_string()),
        }),
        line_items: vec![LineItem {
            title: "Ceramic mug".to_string(),
            variant_id: Some("mug-blue".to_string()),
            quantity: 2,
            unit_price: dec!(50),
            line_total: dec!(100),
            unit_cost: Some(dec!(15)),
            weight_kg: Some(0.4),
        }],
        total_discounts: dec!(10),
        total_refunded: dec!(5),
        shipping_charged: dec!(8),
        custom_attributes: vec![CustomAttribute {
            key: "utm_source".to_string(),
            value: Some("facebook".to_string()),
        }],
        journey: CustomerJourney::default(),
    }
}

struct FakeStore {
    orders: Vec<Order>,
    fail_on: Option<NaiveDate>,
    slow: bool,
}

#[async_trait]
impl OrderSource for FakeStore {
    async fn fetch_orders_page(&self, query: &OrderQuery, _cursor: Option<String>) -> Result<OrderPage> {
        let day = query.since.date_naive();
        if self.slow {
            // Earlier days finish last.
            let delay = 40u64.saturating_sub(u64::from(day.day()) * 5);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_on == Some(day) {
            return Err(KpiError::from_status("fake-store", 503, "simulated outage"));
        }
        Ok(OrderPage {
            orders: self
                .orders
                .iter()
                .filter(|o| o.created_at >= query.since && o.created_at < query.until)
                .cloned()
                .collect(),
            next_cursor: None,
        })
    }
}

/// Meta account reporting in UTC: 20.00 at 12:00 UTC every day, plus one
/// stray row at 02:00 UTC on June 1st that belongs to the May 31st shop day.
struct FakeMeta {
    meta_calls: AtomicUsize,
}

#[async_trait]
impl AdInsightsSource for FakeMeta {
    fn platform(&self) -> AdPlatform {
        AdPlatform::Meta
    }

    async fn account_meta(&self) -> Result<AdAccountMeta> {
        self.meta_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AdAccountMeta {
            account_id: "act_42".to_string(),
            timezone: chrono_tz::UTC,
            currency: "USD".to_string(),
        })
    }

    async fn hourly_spend_page(
        &self,
        _level: InsightsLevel,
        since: NaiveDate,
        until: NaiveDate,
        _cursor: Option<String>,
    ) -> Result<shop_kpi_builder::ads::SpendPage> {
        let mut rows = Vec::new();
        for date in shop_kpi_builder::window::days_in_range(since, until) {
            rows.push(shop_kpi_builder::ads::HourlySpendRow {
                date,
                hour: 12,
                spend: dec!(20),
            });
            if date == june(1) {
                rows.push(shop_kpi_builder::ads::HourlySpendRow {
                    date,
                    hour: 2,
                    spend: dec!(99),
                });
            }
        }
        Ok(shop_kpi_builder::ads::SpendPage {
            rows,
            next_cursor: None,
        })
    }

    async fn daily_totals(
        &self,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<shop_kpi_builder::ads::DailySpendRow>> {
        Ok(shop_kpi_builder::window::days_in_range(since, until)
            .into_iter()
            .map(|date| shop_kpi_builder::ads::DailySpendRow {
                date,
                spend: dec!(20),
            })
            .collect())
    }
}

struct Fixture {
    assembler: Arc<KpiAssembler>,
    meta: Arc<FakeMeta>,
}

fn fixture(fail_on: Option<NaiveDate>, slow: bool) -> Fixture {
    fixture_in_currency(fail_on, slow, "USD", BTreeMap::new())
}

fn fixture_in_currency(
    fail_on: Option<NaiveDate>,
    slow: bool,
    store_currency: &str,
    fx_rates: BTreeMap<String, Decimal>,
) -> Fixture {
    let warnings = Arc::new(WarnOnce::new());
    let orders: Vec<Order> = (1..=5)
        .map(|d| Order {
            currency: store_currency.to_string(),
            ..order(&format!("{}", 1000 + d), d)
        })
        .collect();
    let store = StoreHandle::new(
        "us",
        Arc::new(FakeStore {
            orders,
            fail_on,
            slow,
        }),
    );
    let shipping = ShippingMatrix::from_rows(vec![
        ShippingRate {
            geo: "US".to_string(),
            weight_kg: 1.0,
            rate_usd: dec!(6),
        },
        ShippingRate {
            geo: "Rest of World".to_string(),
            weight_kg: 1.0,
            rate_usd: dec!(25),
        },
    ])
    .unwrap();

    let order_aggregator = OrderAggregator::new(
        vec![store],
        Arc::new(shipping),
        SHOP_TZ,
        RetryPolicy::none(),
        warnings.clone(),
    )
    .with_own_domains(vec!["example.com".to_string()]);

    let meta = Arc::new(FakeMeta {
        meta_calls: AtomicUsize::new(0),
    });
    let meta_aggregator = AdSpendAggregator::new(meta.clone(), "USD", RetryPolicy::none(), warnings.clone());
    let google_aggregator = AdSpendAggregator::disabled(AdPlatform::Google, "USD", warnings.clone());
    let fx = FxTable::new("USD", fx_rates, warnings.clone());

    let assembler = KpiAssembler::new(
        SHOP_TZ,
        order_aggregator,
        google_aggregator,
        meta_aggregator,
        FeeAggregator::disabled(warnings),
        fx,
    )
    .with_max_workers(5);

    Fixture {
        assembler: Arc::new(assembler),
        meta,
    }
}

#[tokio::test]
async fn test_single_day_matches_worked_example() -> anyhow::Result<()> {
    let f = fixture(None, false);
    let kpi = f.assembler.compute_day(june(1)).await?;

    assert_eq!(kpi.orders, 1);
    assert_eq!(kpi.net, dec!(85));
    assert_eq!(kpi.shipping_estimate, dec!(6));
    assert_eq!(kpi.ad_spend.meta, dec!(20));
    assert_eq!(kpi.ad_spend.google, Decimal::ZERO);
    assert_eq!(kpi.operational_profit, dec!(57));
    assert_eq!(kpi.net_margin, dec!(37));
    assert_eq!(kpi.margin_pct.round_dp(1), dec!(39.8));
    assert_eq!(kpi.meta_purchases, 1);
    assert_eq!(kpi.meta_cpa, dec!(20));
    assert!(kpi.error.is_none());
    Ok(())
}

#[tokio::test]
async fn test_foreign_store_reported_in_reporting_currency() -> anyhow::Result<()> {
    let rates = BTreeMap::from([("EUR".to_string(), dec!(1.1))]);
    let f = fixture_in_currency(None, false, "EUR", rates);
    let kpi = f.assembler.compute_day(june(1)).await?;

    assert_eq!(kpi.gross, dec!(110.0));
    assert_eq!(kpi.net, dec!(93.5));
    assert_eq!(kpi.cogs, dec!(33.0));
    assert_eq!(kpi.shipping_charged, dec!(8.8));
    assert_eq!(kpi.shipping_estimate, dec!(6));
    // 93.5 + 8.8 - 6 - 33
    assert_eq!(kpi.operational_profit, dec!(63.3));
    assert_eq!(kpi.net_margin, dec!(43.3));

    let mtd = MonthToDate::from_days(&f.assembler.compute_range(june(1), june(2)).await?).unwrap();
    assert_eq!(mtd.totals.net, dec!(187.0));
    Ok(())
}

#[tokio::test]
async fn test_range_is_chronological_regardless_of_completion_order() -> anyhow::Result<()> {
    let f = fixture(None, true);
    let days = f.assembler.compute_range(june(1), june(5)).await?;

    let dates: Vec<NaiveDate> = days.iter().map(|d| d.date).collect();
    assert_eq!(dates, (1..=5).map(june).collect::<Vec<_>>());
    assert!(days.iter().all(|d| d.orders == 1 && d.error.is_none()));
    assert_eq!(f.meta.meta_calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_day_does_not_abort_siblings() -> anyhow::Result<()> {
    let f = fixture(Some(june(3)), true);
    let days = f.assembler.compute_range(june(1), june(5)).await?;

    assert_eq!(days.len(), 5);
    let failed = &days[2];
    assert_eq!(failed.date, june(3));
    assert!(failed.error.as_deref().unwrap_or_default().contains("simulated outage"));
    assert_eq!(failed.net, Decimal::ZERO);

    for day in days.iter().filter(|d| d.date != june(3)) {
        assert!(day.error.is_none(), "{} should succeed", day.date);
        assert_eq!(day.net, dec!(85));
    }
    Ok(())
}

#[tokio::test]
async fn test_sync_twice_converges() -> anyhow::Result<()> {
    let f = fixture(None, false);
    let store = Arc::new(MemoryFactStore::new());
    let sync = SyncOrchestrator::new(f.assembler.clone(), store.clone());

    let first = sync.run_day(june(2)).await;
    let second = sync.run_day(june(2)).await;

    for reports in [&first, &second] {
        assert_eq!(reports[0].status, JobStatus::Skipped, "{}", reports[0]);
        assert!(reports[1..].iter().all(|r| r.status == JobStatus::Succeeded));
    }
    assert_eq!(store.ad_spend_facts().len(), 1);
    assert_eq!(store.ad_spend_facts()[0].spend_normalized, dec!(20));
    assert_eq!(store.ad_spend_facts()[0].account_id, "act_42");
    assert_eq!(store.orders().len(), 1);
    assert_eq!(store.day_kpis().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_month_to_date_order_sync() -> anyhow::Result<()> {
    let f = fixture(None, false);
    let store = Arc::new(MemoryFactStore::new());
    let sync = SyncOrchestrator::new(f.assembler.clone(), store.clone());

    let report = sync.sync_month_to_date_orders(june(3)).await;

    assert_eq!(report.status, JobStatus::Succeeded);
    assert_eq!(report.records, 3);
    let mut ids: Vec<String> = store.orders().into_iter().map(|o| o.order.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["1001", "1002", "1003"]);
    Ok(())
}

#[tokio::test]
async fn test_publish_month_to_date() -> anyhow::Result<()> {
    let f = fixture(Some(june(2)), false);
    let sink = MemoryReportSink::new();

    let mtd = publish_month_to_date(&f.assembler, &sink, june(3)).await?;

    let sheet = sink.sheet(ReportMonth::of(june(3))).expect("sheet written");
    assert_eq!(sheet.days.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(sheet.days[&2].error.is_some());
    assert_eq!(sheet.days[&1].margin_pct, dec!(39.78));

    let totals = sheet.month_to_date.expect("month to date row");
    assert_eq!(totals.orders, 2);
    assert_eq!(totals.net, dec!(170.00));
    assert_eq!(mtd.failed_days, vec![june(2)]);

    // Publishing again leaves the sheet unchanged.
    let before = sink.sheet(ReportMonth::of(june(3)));
    publish_month_to_date(&f.assembler, &sink, june(3)).await?;
    assert_eq!(sink.sheet(ReportMonth::of(june(3))), before);
    Ok(())
}

#[test]
fn test_window_and_vendor_hours_agree_across_dst() {
    let tz = chrono_tz::Europe::London;
    let window = resolve(&tz, NaiveDate::from_ymd_opt(2024, 10, 27).unwrap()).unwrap();
    assert_eq!(window.duration_hours(), 25);

    let hours = map_to_vendor_hours(&window, &chrono_tz::America::Los_Angeles);
    assert_eq!(hours.hour_count(), 25);
}

#[test]
fn test_config_schema_generation() {
    let schema = ReconcilerConfig::schema_as_json().unwrap();
    assert!(schema.contains("timezone"));
    assert!(schema.contains("fx_rates"));
}
