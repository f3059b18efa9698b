//! Builds a [`KpiAssembler`] backed by the real vendor APIs.

use crate::ads::{AdInsightsSource, AdSpendAggregator, FxTable};
use crate::config::ReconcilerConfig;
use crate::error::Result;
use crate::fees::FeeAggregator;
use crate::google_ads::GoogleAdsClient;
use crate::kpi::KpiAssembler;
use crate::meta::MetaInsightsClient;
use crate::orders::{OrderAggregator, StoreHandle};
use crate::paypal::PayPalClient;
use crate::resilience::WarnOnce;
use crate::schema::AdPlatform;
use crate::shipping::ShippingMatrix;
use crate::shopify::ShopifyOrderSource;
use log::info;
use std::sync::Arc;

fn ad_aggregator(
    platform: AdPlatform,
    client: Option<Arc<dyn AdInsightsSource>>,
    config: &ReconcilerConfig,
    warnings: &Arc<WarnOnce>,
) -> AdSpendAggregator {
    let currency = config.shop.reporting_currency.clone();
    match client {
        Some(source) => AdSpendAggregator::new(source, currency, config.retry.clone(), warnings.clone()),
        None => AdSpendAggregator::disabled(platform, currency, warnings.clone()),
    }
}

/// Validates `config` and wires every configured vendor. Vendors without
/// credentials are kept as disabled sources that report zero.
pub fn build_assembler(config: &ReconcilerConfig, warnings: Arc<WarnOnce>) -> Result<KpiAssembler> {
    config.validate()?;
    let shop_tz = config.shop_timezone()?;

    let mut stores = Vec::new();
    for store in &config.stores {
        match ShopifyOrderSource::from_settings(store)? {
            Some(source) => stores.push(StoreHandle::new(store.name.clone(), Arc::new(source))),
            None => {
                warnings.warn(
                    &format!("shopify:{}:unconfigured", store.name),
                    &format!(
                        "Store {} has no access token ({}); its orders are skipped",
                        store.name,
                        store.token_env_var()
                    ),
                );
            }
        }
    }

    let orders = OrderAggregator::new(
        stores,
        Arc::new(ShippingMatrix::from_settings(&config.shipping)?),
        shop_tz,
        config.retry.clone(),
        warnings.clone(),
    )
    .with_own_domains(config.shop.own_domains.clone())
    .with_exclude_cancelled(config.exclude_cancelled);

    let google = GoogleAdsClient::from_settings(&config.google_ads)?
        .map(|c| Arc::new(c) as Arc<dyn AdInsightsSource>);
    let meta = MetaInsightsClient::from_settings(&config.meta)?
        .map(|c| Arc::new(c) as Arc<dyn AdInsightsSource>);

    let fees = match PayPalClient::from_settings(&config.paypal)? {
        Some(client) => FeeAggregator::new(Arc::new(client), config.retry.clone(), warnings.clone()),
        None => FeeAggregator::disabled(warnings.clone()),
    };

    info!(
        "Reconciler for {} with {} store(s), google={}, meta={}, processor={}",
        config.shop.timezone,
        config.stores.len(),
        google.is_some(),
        meta.is_some(),
        fees.is_enabled()
    );

    let google = ad_aggregator(AdPlatform::Google, google, config, &warnings);
    let meta = ad_aggregator(AdPlatform::Meta, meta, config, &warnings);
    let fx = FxTable::new(config.shop.reporting_currency.clone(), config.fx_rates.clone(), warnings);

    Ok(KpiAssembler::new(shop_tz, orders, google, meta, fees, fx).with_max_workers(config.max_workers))
}
