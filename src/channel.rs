//! Acquisition channel attribution.
//!
//! Two vocabularies live here and are intentionally kept apart:
//! [`Channel`] is derived from web-analytics signals (UTM parameters,
//! referrer, landing page) and [`AttributedChannel`] is read from the
//! storefront's order-level custom attributes.

use crate::schema::CustomAttribute;
use serde::{Deserialize, Serialize};
use url::Url;

const GOOGLE_HOST_FRAGMENTS: [&str; 6] = [
    "google.",
    "youtube.",
    "gmail.",
    "googleadservices.",
    "doubleclick.",
    "googlesyndication.",
];

const CHATGPT_SOURCES: [&str; 3] = ["chatgpt.com", "openai", "chatgpt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    GooglePaid,
    Klaviyo,
    ChatGpt,
    Direct,
    OtherOrganic,
}

/// Raw marketing metadata for one order or session. Every field is optional
/// because vendors omit them freely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributionSignals {
    pub source_name: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub referrer_url: Option<String>,
    pub landing_page_url: Option<String>,
}

fn normalized(value: Option<&str>) -> String {
    value.map(|v| v.trim().to_lowercase()).unwrap_or_default()
}

/// Lower-cased host of `raw`, tolerating a missing scheme. Anything that
/// does not parse yields an empty string.
pub fn extract_host(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed.trim_start_matches('/'))
    };

    Url::parse(&candidate)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_default()
}

fn has_gclid(url: &str) -> bool {
    url.to_lowercase().contains("gclid=")
}

fn is_own_domain(host: &str, own_domains: &[String]) -> bool {
    let host = host.trim_start_matches("www.");
    own_domains.iter().any(|domain| {
        let domain = domain.trim().to_lowercase();
        let domain = domain.trim_start_matches("www.");
        !domain.is_empty() && (host == domain || host.ends_with(&format!(".{}", domain)))
    })
}

/// Maps raw attribution signals to a [`Channel`]. Pure and total; the first
/// matching rule wins.
pub fn classify(signals: &AttributionSignals, own_domains: &[String]) -> Channel {
    let source_name = normalized(signals.source_name.as_deref());
    let utm_source = normalized(signals.utm_source.as_deref());
    let utm_medium = normalized(signals.utm_medium.as_deref());
    let referrer = normalized(signals.referrer_url.as_deref());
    let landing = normalized(signals.landing_page_url.as_deref());
    let referrer_host = extract_host(&referrer);

    if source_name == "klaviyo" || utm_source == "klaviyo" || utm_medium == "email" {
        return Channel::Klaviyo;
    }

    let gclid = has_gclid(&referrer) || has_gclid(&landing);
    if gclid {
        return Channel::GooglePaid;
    }

    if utm_source == "google"
        || utm_medium == "cpc"
        || utm_medium == "product_sync"
        || source_name == "google"
    {
        return Channel::GooglePaid;
    }

    // Performance Max clicks arrive without UTM parameters.
    if GOOGLE_HOST_FRAGMENTS
        .iter()
        .any(|fragment| referrer_host.contains(fragment))
    {
        return Channel::GooglePaid;
    }

    if CHATGPT_SOURCES.contains(&utm_source.as_str()) || referrer_host == "chatgpt.com" {
        return Channel::ChatGpt;
    }

    let no_utm = utm_source.is_empty() && utm_medium.is_empty();
    if no_utm && (referrer_host.is_empty() || is_own_domain(&referrer_host, own_domains)) {
        return Channel::Direct;
    }

    Channel::OtherOrganic
}

/// Channel vocabulary carried by storefront custom attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributedChannel {
    Meta,
    Google,
    Email,
    TikTok,
    Other,
    Unattributed,
}

const ATTRIBUTION_KEYS: [&str; 5] = [
    "channel",
    "utm_source",
    "_utm_source",
    "source",
    "referrer_source",
];

/// Brand names may prefix a token ("facebookads"); short markers such as
/// "fb" must be the whole token.
const MIN_PREFIX_LEN: usize = 5;

fn has_token(value: &str, needles: &[&str]) -> bool {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .any(|token| {
            needles.iter().any(|n| {
                token == *n || (n.len() >= MIN_PREFIX_LEN && token.starts_with(n))
            })
        })
}

impl AttributedChannel {
    fn from_value(value: &str) -> Self {
        let value = value.trim().to_lowercase();
        if value.is_empty() {
            return Self::Unattributed;
        }

        if has_token(&value, &["facebook", "instagram", "meta", "fb", "fbclid"]) {
            Self::Meta
        } else if has_token(&value, &["google", "youtube", "gclid"]) {
            Self::Google
        } else if has_token(&value, &["klaviyo", "email", "newsletter"]) {
            Self::Email
        } else if has_token(&value, &["tiktok"]) {
            Self::TikTok
        } else {
            Self::Other
        }
    }

    /// Reads the first recognised attribution key from the order's custom
    /// attributes. Keys are matched case-insensitively in priority order.
    pub fn from_custom_attributes(attributes: &[CustomAttribute]) -> Self {
        for key in ATTRIBUTION_KEYS {
            let found = attributes
                .iter()
                .find(|a| a.key.trim().eq_ignore_ascii_case(key))
                .and_then(|a| a.value.as_deref());
            if let Some(value) = found {
                let channel = Self::from_value(value);
                if channel != Self::Unattributed {
                    return channel;
                }
            }
        }
        Self::Unattributed
    }
}
