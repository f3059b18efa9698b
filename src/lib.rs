//! # Shop KPI Builder
//!
//! Reconciles a merchant's storefront orders, ad platform spend,
//! payment-processor fees and estimated shipping costs into one KPI record
//! per shop-local calendar day.
//!
//! ## Core Concepts
//!
//! - **Shop day**: a calendar date in the merchant's timezone. Its UTC window
//!   is 23, 24 or 25 hours long depending on DST.
//! - **Vendor hour window**: the account-local hours of an ad platform that
//!   overlap a shop day. Hourly spend outside it is discarded.
//! - **Channels**: web-analytics signals map to [`Channel`]; storefront custom
//!   attributes map to [`AttributedChannel`]. The two vocabularies are separate.
//! - **Operational profit**: net revenue plus shipping charged, minus the
//!   shipping estimate, COGS and processor fees. Net margin also subtracts ad spend.
//!
//! ## Example
//!
//! ```rust,ignore
//! use shop_kpi_builder::*;
//! use chrono::NaiveDate;
//! use std::sync::Arc;
//!
//! let config = load_config("reconciler.json")?;
//! let assembler = live::build_assembler(&config, Arc::new(WarnOnce::new()))?;
//!
//! let june = assembler
//!     .compute_range(
//!         NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
//!         NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
//!     )
//!     .await?;
//! ```

pub mod ads;
pub mod channel;
pub mod config;
pub mod error;
pub mod fees;
pub mod kpi;
pub mod orders;
pub mod report;
pub mod resilience;
pub mod schema;
pub mod shipping;
pub mod sync;
pub mod window;

#[cfg(feature = "live")]
pub mod google_ads;
#[cfg(feature = "live")]
mod http;
#[cfg(feature = "live")]
pub mod live;
#[cfg(feature = "live")]
pub mod meta;
#[cfg(feature = "live")]
pub mod paypal;
#[cfg(feature = "live")]
pub mod shopify;

pub use ads::{AdAccountMeta, AdInsightsSource, AdSpendAggregator, DailySpend, FxTable, InsightsLevel};
pub use channel::{classify, extract_host, AttributedChannel, AttributionSignals, Channel};
pub use config::ReconcilerConfig;
pub use error::{KpiError, Result};
pub use fees::{FeeAggregator, FeeSummary, TransactionPage, TransactionSource};
pub use kpi::{AdSpendTotals, DayKpi, KpiAssembler, MonthToDate};
pub use orders::{
    OrderAggregate, OrderAggregator, OrderAnalytics, OrderFinancials, OrderPage, OrderQuery,
    OrderSource, StoreHandle, TaggedOrder,
};
pub use report::{publish_month_to_date, MemoryReportSink, ReportMonth, ReportRow, ReportSink};
pub use resilience::{RetryPolicy, WarnOnce};
pub use schema::*;
pub use shipping::ShippingMatrix;
pub use sync::{FactStore, JobReport, JobStatus, MemoryFactStore, SyncOrchestrator};
pub use window::{
    map_to_vendor_hours, resolve, resolve_month_to_date, LocalWindow, ShopDay, VendorHourWindow,
};

use log::info;
use std::path::Path;

/// Reads a configuration file, overlays credentials from the environment and
/// validates the result.
pub fn load_config(path: impl AsRef<Path>) -> Result<ReconcilerConfig> {
    let path = path.as_ref();
    let mut config = ReconcilerConfig::from_json_file(path)?;
    config.apply_env_overrides();
    config.validate()?;
    info!(
        "Loaded configuration from {} ({} store(s), timezone {})",
        path.display(),
        config.stores.len(),
        config.shop.timezone
    );
    Ok(config)
}
