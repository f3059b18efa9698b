use crate::channel::AttributionSignals;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdPlatform {
    Google,
    Meta,
}

impl AdPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdPlatform::Google => "google",
            AdPlatform::Meta => "meta",
        }
    }
}

impl fmt::Display for AdPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomAttribute {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Option<String>,
    /// Lifetime order count including the current order.
    pub orders_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub country: Option<String>,
    pub country_code: Option<String>,
}

/// First-touch marketing data captured by the storefront.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerJourney {
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub referrer_url: Option<String>,
    pub landing_page_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub title: String,
    pub variant_id: Option<String>,
    pub quantity: u32,
    pub unit_price: Decimal,
    /// Price already multiplied by quantity by the vendor.
    pub line_total: Decimal,
    pub unit_cost: Option<Decimal>,
    pub weight_kg: Option<f64>,
}

impl LineItem {
    pub fn gross(&self) -> Decimal {
        self.line_total
    }

    pub fn cogs(&self) -> Decimal {
        match self.unit_cost {
            Some(cost) if self.quantity > 0 => cost * Decimal::from(self.quantity),
            _ => Decimal::ZERO,
        }
    }

    pub fn weight_kg(&self) -> f64 {
        match self.weight_kg {
            Some(w) if w.is_finite() && w > 0.0 => w * self.quantity as f64,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Vendor-assigned id, unique per vendor.
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub source_name: Option<String>,
    pub currency: String,
    pub customer: Option<Customer>,
    pub shipping_address: Option<ShippingAddress>,
    pub line_items: Vec<LineItem>,
    pub total_discounts: Decimal,
    pub total_refunded: Decimal,
    pub shipping_charged: Decimal,
    #[serde(default)]
    pub custom_attributes: Vec<CustomAttribute>,
    #[serde(default)]
    pub journey: CustomerJourney,
}

impl Order {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    pub fn is_returning_customer(&self) -> bool {
        self.customer
            .as_ref()
            .map(|c| c.orders_count > 1)
            .unwrap_or(false)
    }

    pub fn weight_kg(&self) -> f64 {
        self.line_items.iter().map(LineItem::weight_kg).sum()
    }

    pub fn attribution_signals(&self) -> AttributionSignals {
        AttributionSignals {
            source_name: self.source_name.clone(),
            utm_source: self.journey.utm_source.clone(),
            utm_medium: self.journey.utm_medium.clone(),
            referrer_url: self.journey.referrer_url.clone(),
            landing_page_url: self.journey.landing_page_url.clone(),
        }
    }
}

/// One day of spend for one ad account, persisted by `(date, platform, account_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSpendFact {
    pub date: NaiveDate,
    pub platform: AdPlatform,
    pub account_id: String,
    pub spend: Decimal,
    pub currency: String,
    pub spend_normalized: Decimal,
}

impl AdSpendFact {
    pub fn natural_key(&self) -> (NaiveDate, AdPlatform, String) {
        (self.date, self.platform, self.account_id.clone())
    }
}

/// Row of the shipping matrix. `geo` is a country name, an ISO code or a
/// rest-of-world marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingRate {
    pub geo: String,
    pub weight_kg: f64,
    pub rate_usd: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorTransaction {
    pub id: String,
    pub initiated_at: DateTime<Utc>,
    pub status: Option<String>,
    pub currency: String,
    pub fee: Decimal,
    pub shipping: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(quantity: u32, line_total: Decimal, unit_cost: Option<Decimal>) -> LineItem {
        LineItem {
            title: "Tee".to_string(),
            variant_id: None,
            quantity,
            unit_price: dec!(10),
            line_total,
            unit_cost,
            weight_kg: Some(0.25),
        }
    }

    #[test]
    fn test_line_item_gross_is_not_remultiplied() {
        let line = item(3, dec!(30), Some(dec!(4)));
        assert_eq!(line.gross(), dec!(30));
        assert_eq!(line.cogs(), dec!(12));
        assert!((line.weight_kg() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_cogs_requires_cost_and_quantity() {
        assert_eq!(item(0, dec!(0), Some(dec!(4))).cogs(), Decimal::ZERO);
        assert_eq!(item(2, dec!(20), None).cogs(), Decimal::ZERO);
    }

    #[test]
    fn test_fact_natural_key() {
        let fact = AdSpendFact {
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            platform: AdPlatform::Meta,
            account_id: "act_1".to_string(),
            spend: dec!(12.5),
            currency: "EUR".to_string(),
            spend_normalized: dec!(13.5),
        };
        let (date, platform, account) = fact.natural_key();
        assert_eq!(date.to_string(), "2024-05-01");
        assert_eq!(platform.to_string(), "meta");
        assert_eq!(account, "act_1");
    }
}
