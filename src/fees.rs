//! Payment-processor fees and shipping labels bought through the processor.

use crate::ads::FxTable;
use crate::error::{KpiError, Result};
use crate::resilience::{retry_transient, RetryPolicy, WarnOnce};
use crate::schema::ProcessorTransaction;
use crate::window::LocalWindow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionPage {
    pub transactions: Vec<ProcessorTransaction>,
    /// Total page count reported by the vendor; pages are 1-based.
    pub total_pages: u32,
}

#[async_trait]
pub trait TransactionSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_transactions_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: u32,
    ) -> Result<TransactionPage>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeeSummary {
    /// Absolute fees in the reporting currency.
    pub fees: Decimal,
    pub shipping: Decimal,
    pub transaction_count: usize,
}

pub struct FeeAggregator {
    source: Option<Arc<dyn TransactionSource>>,
    retry: RetryPolicy,
    warnings: Arc<WarnOnce>,
}

impl FeeAggregator {
    pub fn new(source: Arc<dyn TransactionSource>, retry: RetryPolicy, warnings: Arc<WarnOnce>) -> Self {
        Self {
            source: Some(source),
            retry,
            warnings,
        }
    }

    pub fn disabled(warnings: Arc<WarnOnce>) -> Self {
        Self {
            source: None,
            retry: RetryPolicy::none(),
            warnings,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.source.is_some()
    }

    pub async fn summarize(&self, window: &LocalWindow, fx: &FxTable) -> Result<FeeSummary> {
        self.summarize_at(window, fx, Utc::now()).await
    }

    /// Fees inside `window`, with the window end clamped to strictly before
    /// `now`. Rejected credentials and unknown accounts yield an empty summary.
    pub async fn summarize_at(
        &self,
        window: &LocalWindow,
        fx: &FxTable,
        now: DateTime<Utc>,
    ) -> Result<FeeSummary> {
        let Some(source) = self.source.as_ref() else {
            self.warnings.warn(
                "processor:unconfigured",
                "Payment processor credentials missing; reporting zero fees",
            );
            return Ok(FeeSummary::default());
        };

        let end = window.end.min(now - Duration::seconds(1));
        if window.start >= end {
            debug!("Fee window {} .. {} lies in the future, nothing to fetch", window.start, window.end);
            return Ok(FeeSummary::default());
        }

        match self.collect(source, window.start, end).await {
            Ok(transactions) => Ok(summarize_transactions(&transactions, fx)),
            Err(e) if degrades_to_empty(&e) => {
                self.warnings.warn(
                    &format!("{}:authorization", source.name()),
                    &format!("{} rejected the transaction search, treating fees as zero: {}", source.name(), e),
                );
                Ok(FeeSummary::default())
            }
            Err(e) => Err(e),
        }
    }

    async fn collect(
        &self,
        source: &Arc<dyn TransactionSource>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProcessorTransaction>> {
        let op = format!("{} transactions {} .. {}", source.name(), start, end);
        let mut seen = HashSet::new();
        let mut transactions = Vec::new();
        let mut page = 1;

        loop {
            let result = retry_transient(&self.retry, &op, || {
                source.fetch_transactions_page(start, end, page)
            })
            .await?;
            debug!(
                "{}: page {}/{} with {} transactions",
                op,
                page,
                result.total_pages,
                result.transactions.len()
            );

            for tx in result.transactions {
                if seen.insert(tx.id.clone()) {
                    transactions.push(tx);
                } else {
                    debug!("{}: duplicate transaction {} skipped", op, tx.id);
                }
            }

            if page >= result.total_pages {
                break;
            }
            page += 1;
        }

        info!("{}: {} transactions", op, transactions.len());
        Ok(transactions)
    }
}

fn degrades_to_empty(e: &KpiError) -> bool {
    e.is_authorization() || matches!(e, KpiError::Vendor { status: 404, .. })
}

pub fn summarize_transactions(transactions: &[ProcessorTransaction], fx: &FxTable) -> FeeSummary {
    transactions.iter().fold(FeeSummary::default(), |mut acc, tx| {
        acc.fees += fx.normalize(tx.fee.abs(), &tx.currency);
        acc.shipping += fx.normalize(tx.shipping.abs(), &tx.currency);
        acc.transaction_count += 1;
        acc
    })
}
