use crate::error::{KpiError, Result};
use crate::resilience::RetryPolicy;
use crate::window::parse_timezone;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const DEFAULT_REPORTING_CURRENCY: &str = "USD";
pub const DEFAULT_SHOPIFY_API_VERSION: &str = "2024-07";
pub const DEFAULT_META_API_VERSION: &str = "v19.0";
pub const DEFAULT_GOOGLE_ADS_API_VERSION: &str = "v17";
const MAX_WORKERS_LIMIT: usize = 64;

fn default_true() -> bool {
    true
}

fn default_currency() -> String {
    DEFAULT_REPORTING_CURRENCY.to_string()
}

fn default_shopify_api_version() -> String {
    DEFAULT_SHOPIFY_API_VERSION.to_string()
}

fn default_meta_api_version() -> String {
    DEFAULT_META_API_VERSION.to_string()
}

fn default_google_ads_api_version() -> String {
    DEFAULT_GOOGLE_ADS_API_VERSION.to_string()
}

fn default_max_workers() -> usize {
    crate::kpi::DEFAULT_MAX_WORKERS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ShopSettings {
    #[schemars(description = "IANA timezone of the merchant, e.g. 'America/New_York'. Every shop day is a calendar day in this zone.")]
    pub timezone: String,

    #[serde(default)]
    #[schemars(description = "Domains owned by the shop. Referrals from these hosts count as direct traffic.")]
    pub own_domains: Vec<String>,

    #[serde(default = "default_currency")]
    #[schemars(description = "ISO currency all KPI money is reported in. Defaults to USD.")]
    pub reporting_currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StoreSettings {
    #[schemars(description = "Short store label used to tag orders, e.g. 'us' or 'eu'.")]
    pub name: String,

    #[schemars(description = "Storefront domain, e.g. 'example.myshopify.com'.")]
    pub shop_domain: String,

    #[serde(default)]
    #[schemars(description = "Admin API token. Usually supplied through SHOPIFY_ACCESS_TOKEN_<STORE>.")]
    pub access_token: Option<String>,

    #[serde(default = "default_shopify_api_version")]
    pub api_version: String,
}

impl StoreSettings {
    /// Environment variable holding this store's token.
    pub fn token_env_var(&self) -> String {
        let suffix: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("SHOPIFY_ACCESS_TOKEN_{}", suffix)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetaSettings {
    #[serde(default = "default_true")]
    #[schemars(description = "Set to false to report zero Meta spend without calling the API.")]
    pub enabled: bool,

    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    #[schemars(description = "Ad account id with or without the 'act_' prefix.")]
    pub ad_account_id: Option<String>,

    #[serde(default = "default_meta_api_version")]
    pub api_version: String,
}

impl Default for MetaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            access_token: None,
            ad_account_id: None,
            api_version: default_meta_api_version(),
        }
    }
}

impl MetaSettings {
    pub fn is_configured(&self) -> bool {
        self.enabled && has_value(&self.access_token) && has_value(&self.ad_account_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GoogleAdsSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    #[schemars(description = "Path to the JSON credentials file (developer token, OAuth client and refresh token).")]
    pub credentials_path: Option<String>,

    #[serde(default)]
    #[schemars(description = "Customer id to report on; overrides the one in the credentials file.")]
    pub customer_id: Option<String>,

    #[serde(default = "default_google_ads_api_version")]
    pub api_version: String,
}

impl Default for GoogleAdsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            credentials_path: None,
            customer_id: None,
            api_version: default_google_ads_api_version(),
        }
    }
}

impl GoogleAdsSettings {
    pub fn is_configured(&self) -> bool {
        self.enabled && has_value(&self.credentials_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PayPalSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default)]
    #[schemars(description = "Use the sandbox API host instead of production.")]
    pub sandbox: bool,
}

impl Default for PayPalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            client_id: None,
            client_secret: None,
            sandbox: false,
        }
    }
}

impl PayPalSettings {
    pub fn is_configured(&self) -> bool {
        self.enabled && has_value(&self.client_id) && has_value(&self.client_secret)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ShippingSettings {
    #[serde(default)]
    #[schemars(description = "CSV with columns geo, weight_kg, rate_usd. Without it every estimate is the unmatched default.")]
    pub rates_path: Option<String>,

    #[serde(default)]
    #[schemars(description = "Estimate used when no geo row matches, in USD. Defaults to 0.")]
    pub unmatched_default: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReconcilerConfig {
    pub shop: ShopSettings,

    #[serde(default)]
    pub stores: Vec<StoreSettings>,

    #[serde(default)]
    pub meta: MetaSettings,

    #[serde(default)]
    pub google_ads: GoogleAdsSettings,

    #[serde(default)]
    pub paypal: PayPalSettings,

    #[serde(default)]
    pub shipping: ShippingSettings,

    #[serde(default)]
    #[schemars(description = "Multiplier converting one unit of a currency into the reporting currency, keyed by ISO code.")]
    pub fx_rates: BTreeMap<String, Decimal>,

    #[serde(default = "default_max_workers")]
    #[schemars(description = "Upper bound on days computed concurrently in a range.")]
    pub max_workers: usize,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    #[schemars(description = "Ask storefronts to leave cancelled orders out instead of flagging them.")]
    pub exclude_cancelled: bool,
}

fn has_value(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

impl ReconcilerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Overlays credentials from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Overlays credentials from `lookup`; empty values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = get("META_ACCESS_TOKEN") {
            self.meta.access_token = Some(token);
        }
        if let Some(account) = get("META_AD_ACCOUNT_ID") {
            self.meta.ad_account_id = Some(account);
        }
        if let Some(path) = get("GOOGLE_ADS_CREDENTIALS") {
            self.google_ads.credentials_path = Some(path);
        }
        if let Some(id) = get("PAYPAL_CLIENT_ID") {
            self.paypal.client_id = Some(id);
        }
        if let Some(secret) = get("PAYPAL_CLIENT_SECRET") {
            self.paypal.client_secret = Some(secret);
        }
        for store in self.stores.iter_mut() {
            if let Some(token) = get(&store.token_env_var()) {
                store.access_token = Some(token);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        parse_timezone(&self.shop.timezone)?;

        if self.shop.reporting_currency.trim().len() != 3 {
            return Err(KpiError::Config(format!(
                "reporting_currency '{}' is not a 3-letter ISO code",
                self.shop.reporting_currency
            )));
        }
        if self.max_workers == 0 || self.max_workers > MAX_WORKERS_LIMIT {
            return Err(KpiError::Config(format!(
                "max_workers must be between 1 and {}, got {}",
                MAX_WORKERS_LIMIT, self.max_workers
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(KpiError::Config(format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.shipping.unmatched_default.is_sign_negative() && !self.shipping.unmatched_default.is_zero() {
            return Err(KpiError::Config(
                "shipping.unmatched_default must not be negative".to_string(),
            ));
        }
        for (code, rate) in &self.fx_rates {
            if rate.is_sign_negative() || rate.is_zero() {
                return Err(KpiError::Config(format!("fx rate for {} must be positive", code)));
            }
        }

        let mut names = std::collections::HashSet::new();
        for store in &self.stores {
            if store.name.trim().is_empty() || store.shop_domain.trim().is_empty() {
                return Err(KpiError::Config(
                    "every store needs a name and a shop_domain".to_string(),
                ));
            }
            if !names.insert(store.name.to_lowercase()) {
                return Err(KpiError::Config(format!("duplicate store name '{}'", store.name)));
            }
        }
        Ok(())
    }

    pub fn shop_timezone(&self) -> Result<Tz> {
        parse_timezone(&self.shop.timezone)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ReconcilerConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&Self::generate_json_schema())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"{ "shop": { "timezone": "Europe/Berlin" } }"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = ReconcilerConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(config.shop.reporting_currency, "USD");
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.meta.enabled);
        assert!(!config.meta.is_configured());
        assert_eq!(config.shipping.unmatched_default, Decimal::ZERO);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "shop": { "timezone": "America/New_York", "own_domains": ["example.com"], "reporting_currency": "USD" },
            "stores": [
                { "name": "us", "shop_domain": "us-example.myshopify.com" },
                { "name": "eu-2", "shop_domain": "eu-example.myshopify.com", "api_version": "2024-10" }
            ],
            "meta": { "ad_account_id": "act_123" },
            "google_ads": { "enabled": false },
            "paypal": { "sandbox": true },
            "shipping": { "rates_path": "rates.csv", "unmatched_default": "12.5" },
            "fx_rates": { "EUR": "1.08" },
            "max_workers": 8,
            "retry": { "max_retries": 5, "base_delay_ms": 250, "max_delay_ms": 8000 }
        }"#;
        let config = ReconcilerConfig::from_json_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.stores[0].api_version, DEFAULT_SHOPIFY_API_VERSION);
        assert_eq!(config.stores[1].api_version, "2024-10");
        assert!(!config.google_ads.is_configured());
        assert_eq!(config.shipping.unmatched_default, dec!(12.5));
        assert_eq!(config.fx_rates["EUR"], dec!(1.08));
        assert_eq!(config.shop_timezone().unwrap(), chrono_tz::America::New_York);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ReconcilerConfig::from_json_str(
            r#"{ "shop": { "timezone": "UTC" }, "stores": [ { "name": "eu-2", "shop_domain": "x.myshopify.com" } ], "meta": { "ad_account_id": "act_1" } }"#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("META_ACCESS_TOKEN", "meta-token"),
            ("PAYPAL_CLIENT_ID", "pp-id"),
            ("PAYPAL_CLIENT_SECRET", "  "),
            ("SHOPIFY_ACCESS_TOKEN_EU_2", "shpat_1"),
        ]
        .into_iter()
        .collect();

        config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert!(config.meta.is_configured());
        assert_eq!(config.stores[0].access_token.as_deref(), Some("shpat_1"));
        assert_eq!(config.paypal.client_id.as_deref(), Some("pp-id"));
        assert!(config.paypal.client_secret.is_none());
        assert!(!config.paypal.is_configured());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ReconcilerConfig::from_json_str(MINIMAL).unwrap();
        config.shop.timezone = "Mars/Olympus".to_string();
        assert!(matches!(config.validate(), Err(KpiError::UnknownTimezone(_))));

        let mut config = ReconcilerConfig::from_json_str(MINIMAL).unwrap();
        config.max_workers = 0;
        assert!(matches!(config.validate(), Err(KpiError::Config(_))));

        let mut config = ReconcilerConfig::from_json_str(MINIMAL).unwrap();
        config.fx_rates.insert("EUR".to_string(), dec!(-1));
        assert!(config.validate().is_err());

        let mut config = ReconcilerConfig::from_json_str(MINIMAL).unwrap();
        config.stores = vec![
            StoreSettings {
                name: "us".to_string(),
                shop_domain: "a.myshopify.com".to_string(),
                access_token: None,
                api_version: default_shopify_api_version(),
            },
            StoreSettings {
                name: "US".to_string(),
                shop_domain: "b.myshopify.com".to_string(),
                access_token: None,
                api_version: default_shopify_api_version(),
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_schema_generation() {
        let schema = ReconcilerConfig::schema_as_json().unwrap();
        assert!(schema.contains("reporting_currency"));
        assert!(schema.contains("unmatched_default"));
        assert!(schema.contains("max_retries"));
    }
}
