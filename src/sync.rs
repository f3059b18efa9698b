//! Idempotent persistence of synced facts.
//!
//! Every write is an upsert by natural key: spend facts by
//! `(date, platform, account)`, orders by vendor order id, day KPIs by date.
//! Re-running a job for a day that was already synced converges to the same
//! stored state.

use crate::error::{KpiError, Result};
use crate::kpi::{DayKpi, KpiAssembler};
use crate::orders::TaggedOrder;
use crate::schema::{AdPlatform, AdSpendFact};
use crate::window::{resolve, resolve_month_to_date, LocalWindow};
use async_trait::async_trait;
use chrono::NaiveDate;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

#[async_trait]
pub trait FactStore: Send + Sync {
    async fn upsert_ad_spend(&self, fact: &AdSpendFact) -> Result<()>;

    async fn upsert_order(&self, order: &TaggedOrder) -> Result<()>;

    async fn upsert_day_kpi(&self, kpi: &DayKpi) -> Result<()>;
}

/// In-process [`FactStore`], used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryFactStore {
    ad_spend: RwLock<BTreeMap<(NaiveDate, AdPlatform, String), AdSpendFact>>,
    orders: RwLock<BTreeMap<String, TaggedOrder>>,
    day_kpis: RwLock<BTreeMap<NaiveDate, DayKpi>>,
}

fn poisoned(what: &str) -> KpiError {
    KpiError::Storage(format!("{} table lock poisoned", what))
}

impl MemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ad_spend_facts(&self) -> Vec<AdSpendFact> {
        self.ad_spend
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn orders(&self) -> Vec<TaggedOrder> {
        self.orders
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn day_kpis(&self) -> Vec<DayKpi> {
        self.day_kpis
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FactStore for MemoryFactStore {
    async fn upsert_ad_spend(&self, fact: &AdSpendFact) -> Result<()> {
        let mut table = self.ad_spend.write().map_err(|_| poisoned("ad_spend"))?;
        table.insert(fact.natural_key(), fact.clone());
        Ok(())
    }

    async fn upsert_order(&self, order: &TaggedOrder) -> Result<()> {
        let mut table = self.orders.write().map_err(|_| poisoned("orders"))?;
        table.insert(order.order.id.clone(), order.clone());
        Ok(())
    }

    async fn upsert_day_kpi(&self, kpi: &DayKpi) -> Result<()> {
        let mut table = self.day_kpis.write().map_err(|_| poisoned("day_kpis"))?;
        table.insert(kpi.date, kpi.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: String,
    pub status: JobStatus,
    pub records: usize,
    pub detail: Option<String>,
}

impl JobReport {
    fn succeeded(job: String, records: usize) -> Self {
        info!("{}: {} records upserted", job, records);
        Self {
            job,
            status: JobStatus::Succeeded,
            records,
            detail: None,
        }
    }

    fn skipped(job: String, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        info!("{}: skipped ({})", job, reason);
        Self {
            job,
            status: JobStatus::Skipped,
            records: 0,
            detail: Some(reason),
        }
    }

    fn failed(job: String, error: &KpiError) -> Self {
        warn!("{}: failed: {}", job, error);
        Self {
            job,
            status: JobStatus::Failed,
            records: 0,
            detail: Some(error.to_string()),
        }
    }

    fn from_result(job: String, result: Result<usize>) -> Self {
        match result {
            Ok(records) => Self::succeeded(job, records),
            Err(e) => Self::failed(job, &e),
        }
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} ({} records)", self.job, self.status, self.records)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// Runs sync jobs against a [`FactStore`]. Jobs never return errors; the
/// outcome of each is described by its [`JobReport`].
pub struct SyncOrchestrator {
    assembler: Arc<KpiAssembler>,
    store: Arc<dyn FactStore>,
}

impl SyncOrchestrator {
    pub fn new(assembler: Arc<KpiAssembler>, store: Arc<dyn FactStore>) -> Self {
        Self { assembler, store }
    }

    pub async fn sync_ad_spend(&self, date: NaiveDate, platform: AdPlatform) -> JobReport {
        let job = format!("ad_spend:{}:{}", platform, date);
        let aggregator = self.assembler.ad_aggregator(platform);
        if !aggregator.is_enabled() {
            return JobReport::skipped(job, format!("{} is not configured", platform));
        }

        let fact = aggregator
            .spend_fact(date, self.assembler.shop_timezone(), self.assembler.fx())
            .await;
        match fact {
            Ok(Some(fact)) => {
                let result = self.store.upsert_ad_spend(&fact).await.map(|_| 1);
                JobReport::from_result(job, result)
            }
            Ok(None) => JobReport::skipped(job, format!("{} is not configured", platform)),
            Err(e) => JobReport::failed(job, &e),
        }
    }

    async fn sync_orders_in(&self, job: String, window: Result<LocalWindow>) -> JobReport {
        let result = async {
            let window = window?;
            let aggregate = self.assembler.orders().aggregate(&window).await?;
            for order in &aggregate.orders {
                self.store.upsert_order(order).await?;
            }
            Ok::<_, KpiError>(aggregate.orders.len())
        }
        .await;
        JobReport::from_result(job, result)
    }

    pub async fn sync_orders(&self, date: NaiveDate) -> JobReport {
        let window = resolve(self.assembler.shop_timezone(), date);
        self.sync_orders_in(format!("orders:{}", date), window).await
    }

    /// Orders from the first of the month through `up_to`.
    pub async fn sync_month_to_date_orders(&self, up_to: NaiveDate) -> JobReport {
        let window = resolve_month_to_date(self.assembler.shop_timezone(), up_to);
        self.sync_orders_in(format!("orders:month_to_date:{}", up_to), window)
            .await
    }

    pub async fn sync_day_kpi(&self, date: NaiveDate) -> JobReport {
        let job = format!("day_kpi:{}", date);
        let result = async {
            let kpi = self.assembler.compute_day(date).await?;
            self.store.upsert_day_kpi(&kpi).await?;
            Ok::<_, KpiError>(1)
        }
        .await;
        JobReport::from_result(job, result)
    }

    /// Every job for one shop day, in a fixed order.
    pub async fn run_day(&self, date: NaiveDate) -> Vec<JobReport> {
        vec![
            self.sync_ad_spend(date, AdPlatform::Google).await,
            self.sync_ad_spend(date, AdPlatform::Meta).await,
            self.sync_orders(date).await,
            self.sync_day_kpi(date).await,
        ]
    }
}
