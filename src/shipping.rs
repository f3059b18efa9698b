use crate::config::ShippingSettings;
use crate::error::{KpiError, Result};
use crate::schema::{Order, ShippingAddress, ShippingRate};
use log::{debug, info};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// Currency every rate in the matrix is quoted in.
pub const RATE_CURRENCY: &str = "USD";

const DEFAULT_GEO_MARKERS: [&str; 6] = ["default", "*", "row", "rest of world", "world", "other"];

static COUNTRY_NAMES: [(&str, &[&str]); 24] = [
    ("US", &["united states", "united states of america", "usa"]),
    ("GB", &["united kingdom", "great britain", "uk", "england"]),
    ("CA", &["canada"]),
    ("AU", &["australia"]),
    ("NZ", &["new zealand"]),
    ("DE", &["germany", "deutschland"]),
    ("FR", &["france"]),
    ("NL", &["netherlands", "the netherlands", "holland"]),
    ("BE", &["belgium"]),
    ("AT", &["austria", "österreich"]),
    ("CH", &["switzerland", "schweiz"]),
    ("IT", &["italy", "italia"]),
    ("ES", &["spain", "españa"]),
    ("PT", &["portugal"]),
    ("IE", &["ireland"]),
    ("SE", &["sweden"]),
    ("NO", &["norway"]),
    ("DK", &["denmark"]),
    ("FI", &["finland"]),
    ("PL", &["poland"]),
    ("CZ", &["czech republic", "czechia"]),
    ("JP", &["japan"]),
    ("MX", &["mexico"]),
    ("BR", &["brazil", "brasil"]),
];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GeoKey {
    Country(String),
    Code(String),
    Default,
}

fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn country_code_for_name(name: &str) -> Option<&'static str> {
    let name = normalize_name(name);
    COUNTRY_NAMES
        .iter()
        .find(|(_, names)| names.contains(&name.as_str()))
        .map(|(code, _)| *code)
}

fn names_for_code(code: &str) -> &'static [&'static str] {
    COUNTRY_NAMES
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, names)| *names)
        .unwrap_or(&[])
}

/// Canonical key for a geo string from the rate table or an address.
pub fn canonicalize_geo(raw: &str) -> GeoKey {
    let name = normalize_name(raw);
    if name.is_empty() || DEFAULT_GEO_MARKERS.contains(&name.as_str()) {
        return GeoKey::Default;
    }
    if name.len() == 2 && name.chars().all(|c| c.is_ascii_alphabetic()) {
        return GeoKey::Code(name.to_uppercase());
    }
    GeoKey::Country(name)
}

#[derive(Debug, Clone, PartialEq)]
struct Tier {
    weight_kg: f64,
    rate: Decimal,
}

/// Estimated shipping cost by destination and weight tier. Built once per
/// reporting run and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ShippingMatrix {
    tiers: BTreeMap<GeoKey, Vec<Tier>>,
    unmatched_default: Decimal,
}

impl ShippingMatrix {
    pub fn from_rows(rows: Vec<ShippingRate>) -> Result<Self> {
        let mut grouped: BTreeMap<GeoKey, Vec<Tier>> = BTreeMap::new();

        for row in rows {
            if !row.weight_kg.is_finite() || row.weight_kg < 0.0 {
                return Err(KpiError::data(
                    "shipping_rates",
                    format!("invalid weight tier {} for '{}'", row.weight_kg, row.geo),
                ));
            }
            if row.rate_usd.is_sign_negative() && !row.rate_usd.is_zero() {
                return Err(KpiError::data(
                    "shipping_rates",
                    format!("negative rate {} for '{}'", row.rate_usd, row.geo),
                ));
            }

            let key = canonicalize_geo(&row.geo);
            let tiers = grouped.entry(key).or_default();
            if tiers.iter().any(|t| t.weight_kg == row.weight_kg) {
                return Err(KpiError::data(
                    "shipping_rates",
                    format!("duplicate tier {} kg for '{}'", row.weight_kg, row.geo),
                ));
            }
            tiers.push(Tier {
                weight_kg: row.weight_kg,
                rate: row.rate_usd,
            });
        }

        for tiers in grouped.values_mut() {
            tiers.sort_by(|a, b| a.weight_kg.total_cmp(&b.weight_kg));
            // A heavier tier never costs less than a lighter one.
            let mut running = Decimal::ZERO;
            for tier in tiers.iter_mut() {
                running = running.max(tier.rate);
                tier.rate = running;
            }
        }

        info!("Loaded shipping matrix with {} geo groups", grouped.len());
        Ok(Self {
            tiers: grouped,
            unmatched_default: Decimal::ZERO,
        })
    }

    /// Reads `geo,weight_kg,rate_usd` rows.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let rows = csv_reader
            .deserialize::<ShippingRate>()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Self::from_rows(rows)
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }

    /// Value returned when neither the destination nor a default row matches.
    pub fn with_unmatched_default(mut self, value: Decimal) -> Self {
        self.unmatched_default = value.max(Decimal::ZERO);
        self
    }

    /// Matrix described by the shipping section of the configuration. Without
    /// a rates file every estimate is the unmatched default.
    pub fn from_settings(settings: &ShippingSettings) -> Result<Self> {
        let matrix = match settings.rates_path.as_deref() {
            Some(path) => Self::from_csv_path(path)?,
            None => {
                info!("No shipping rates file configured; estimates use the unmatched default");
                Self::default()
            }
        };
        Ok(matrix.with_unmatched_default(settings.unmatched_default))
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    fn candidates(country: Option<&str>, country_code: Option<&str>) -> Vec<GeoKey> {
        let mut keys = Vec::new();
        let mut push = |key: GeoKey| {
            if key != GeoKey::Default && !keys.contains(&key) {
                keys.push(key);
            }
        };

        if let Some(country) = country {
            push(canonicalize_geo(country));
        }
        if let Some(code) = country_code {
            push(canonicalize_geo(code));
        }
        if let Some(code) = country.and_then(country_code_for_name) {
            push(GeoKey::Code(code.to_string()));
        }
        if let Some(code) = country_code {
            for name in names_for_code(code.trim()) {
                push(GeoKey::Country((*name).to_string()));
            }
        }
        keys.push(GeoKey::Default);
        keys
    }

    fn rate_in(tiers: &[Tier], weight_kg: f64) -> Option<Decimal> {
        tiers
            .iter()
            .find(|t| t.weight_kg >= weight_kg)
            .or_else(|| tiers.last())
            .map(|t| t.rate)
    }

    /// Estimated cost for a destination. The most specific geo with any rows
    /// wins; within it the smallest tier that holds `weight_kg` is used, and
    /// weights above the heaviest tier are priced at that tier.
    pub fn estimate_for(&self, country: Option<&str>, country_code: Option<&str>, weight_kg: f64) -> Decimal {
        let weight = if weight_kg.is_finite() && weight_kg > 0.0 {
            weight_kg
        } else {
            0.0
        };

        for key in Self::candidates(country, country_code) {
            if let Some(tiers) = self.tiers.get(&key) {
                if let Some(rate) = Self::rate_in(tiers, weight) {
                    return rate;
                }
            }
        }

        debug!(
            "No shipping rate for {:?}/{:?} at {} kg; using unmatched default",
            country, country_code, weight
        );
        self.unmatched_default
    }

    /// `geo` may be a country name, an ISO code or a default marker.
    pub fn estimate(&self, geo: &str, weight_kg: f64) -> Decimal {
        match canonicalize_geo(geo) {
            GeoKey::Code(code) => self.estimate_for(None, Some(&code), weight_kg),
            GeoKey::Country(name) => self.estimate_for(Some(&name), None, weight_kg),
            GeoKey::Default => self.estimate_for(None, None, weight_kg),
        }
    }

    pub fn estimate_address(&self, address: Option<&ShippingAddress>, weight_kg: f64) -> Decimal {
        let country = address.and_then(|a| a.country.as_deref());
        let code = address.and_then(|a| a.country_code.as_deref());
        self.estimate_for(country, code, weight_kg)
    }

    pub fn estimate_order(&self, order: &Order) -> Decimal {
        self.estimate_address(order.shipping_address.as_ref(), order.weight_kg())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rate(geo: &str, weight_kg: f64, rate_usd: Decimal) -> ShippingRate {
        ShippingRate {
            geo: geo.to_string(),
            weight_kg,
            rate_usd,
        }
    }

    fn matrix() -> ShippingMatrix {
        ShippingMatrix::from_rows(vec![
            rate("Germany", 0.5, dec!(6)),
            rate("Germany", 2.0, dec!(9)),
            rate("DE", 0.5, dec!(7)),
            rate("US", 0.5, dec!(8)),
            rate("US", 1.0, dec!(7.5)),
            rate("US", 5.0, dec!(15)),
            rate("Rest of World", 1.0, dec!(20)),
            rate("Rest of World", 10.0, dec!(45)),
        ])
        .unwrap()
    }

    #[test]
    fn test_canonicalize_geo() {
        assert_eq!(canonicalize_geo(" de "), GeoKey::Code("DE".to_string()));
        assert_eq!(
            canonicalize_geo("United  Kingdom"),
            GeoKey::Country("united kingdom".to_string())
        );
        assert_eq!(canonicalize_geo("ROW"), GeoKey::Default);
        assert_eq!(country_code_for_name("USA"), Some("US"));
    }

    #[test]
    fn test_ceiling_tier() {
        let m = matrix();
        assert_eq!(m.estimate("Germany", 0.3), dec!(6));
        assert_eq!(m.estimate("Germany", 0.5), dec!(6));
        assert_eq!(m.estimate("Germany", 0.51), dec!(9));
    }

    #[test]
    fn test_country_name_beats_code() {
        let m = matrix();
        assert_eq!(m.estimate_for(Some("Germany"), Some("DE"), 0.2), dec!(6));
        assert_eq!(m.estimate_for(Some("Deutschland"), Some("DE"), 0.2), dec!(7));
        assert_eq!(m.estimate_for(None, Some("US"), 0.2), dec!(8));
        assert_eq!(m.estimate_for(Some("United States"), None, 0.2), dec!(8));
    }

    #[test]
    fn test_default_and_unmatched() {
        let m = matrix();
        assert_eq!(m.estimate("France", 3.0), dec!(45));
        assert_eq!(m.estimate("FR", 12.0), dec!(45));

        let empty = ShippingMatrix::from_rows(vec![rate("US", 1.0, dec!(5))])
            .unwrap()
            .with_unmatched_default(dec!(12.5));
        assert_eq!(empty.estimate("France", 1.0), dec!(12.5));
        assert_eq!(ShippingMatrix::default().estimate("US", 1.0), Decimal::ZERO);
    }

    #[test]
    fn test_monotonic_in_weight() {
        let m = matrix();
        for geo in ["US", "Germany", "France", "DE"] {
            let mut previous = Decimal::ZERO;
            for step in 0..200 {
                let weight = step as f64 * 0.1;
                let estimate = m.estimate(geo, weight);
                assert!(estimate >= previous, "{} at {} kg", geo, weight);
                assert!(!estimate.is_sign_negative());
                previous = estimate;
            }
        }
        // The cheaper 1 kg US row is lifted to the 0.5 kg price.
        assert_eq!(m.estimate("US", 0.8), dec!(8));
    }

    #[test]
    fn test_degenerate_weights() {
        let m = matrix();
        assert_eq!(m.estimate("US", f64::NAN), dec!(8));
        assert_eq!(m.estimate("US", -3.0), dec!(8));
    }

    #[test]
    fn test_invalid_rows_rejected() {
        assert!(ShippingMatrix::from_rows(vec![rate("US", 1.0, dec!(-1))]).is_err());
        assert!(ShippingMatrix::from_rows(vec![rate("US", f64::NAN, dec!(1))]).is_err());
        assert!(
            ShippingMatrix::from_rows(vec![rate("US", 1.0, dec!(1)), rate("us", 1.0, dec!(2))])
                .is_err()
        );
    }

    #[test]
    fn test_from_csv() {
        let data = "geo,weight_kg,rate_usd\nUS, 1.0, 5.25\nUS,3,9\ndefault,50,80\n";
        let m = ShippingMatrix::from_csv_reader(data.as_bytes()).unwrap();
        assert_eq!(m.estimate("US", 2.0), dec!(9));
        assert_eq!(m.estimate("Japan", 2.0), dec!(80));
    }
}
