//! Shopify Admin GraphQL order source.

use crate::config::StoreSettings;
use crate::error::{KpiError, Result};
use crate::http::{build_client, check_status, parse_amount};
use crate::orders::{OrderPage, OrderQuery, OrderSource};
use crate::schema::{CustomAttribute, Customer, CustomerJourney, LineItem, Order, ShippingAddress};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

const VENDOR: &str = "shopify";
const PAGE_SIZE: u32 = 100;
const LINE_ITEM_PAGE_SIZE: u32 = 100;

const ORDERS_QUERY: &str = r#"
query Orders($first: Int!, $after: String, $query: String!) {
  orders(first: $first, after: $after, query: $query, sortKey: CREATED_AT) {
    pageInfo { hasNextPage endCursor }
    nodes {
      id
      name
      createdAt
      cancelledAt
      sourceName
      currencyCode
      customer { id numberOfOrders }
      shippingAddress { country countryCodeV2 }
      totalDiscountsSet { shopMoney { amount currencyCode } }
      totalRefundedSet { shopMoney { amount currencyCode } }
      totalShippingPriceSet { shopMoney { amount currencyCode } }
      customAttributes { key value }
      customerJourneySummary {
        firstVisit {
          landingPage
          referrerUrl
          utmParameters { source medium }
        }
      }
      lineItems(first: 100) {
        pageInfo { hasNextPage endCursor }
        nodes {
          title
          quantity
          originalUnitPriceSet { shopMoney { amount currencyCode } }
          originalTotalSet { shopMoney { amount currencyCode } }
          variant {
            id
            inventoryItem {
              unitCost { amount }
              measurement { weight { unit value } }
            }
          }
        }
      }
    }
  }
}
"#;

const LINE_ITEMS_QUERY: &str = r#"
query OrderLineItems($id: ID!, $first: Int!, $after: String) {
  order(id: $id) {
    lineItems(first: $first, after: $after) {
      pageInfo { hasNextPage endCursor }
      nodes {
        title
        quantity
        originalUnitPriceSet { shopMoney { amount currencyCode } }
        originalTotalSet { shopMoney { amount currencyCode } }
        variant {
          id
          inventoryItem {
            unitCost { amount }
            measurement { weight { unit value } }
          }
        }
      }
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    extensions: Option<ErrorExtensions>,
}

#[derive(Debug, Deserialize)]
struct ErrorExtensions {
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrdersData {
    orders: Connection<RawOrder>,
}

#[derive(Debug, Deserialize)]
struct OrderData {
    order: Option<LineItemsOnly>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineItemsOnly {
    line_items: Connection<RawLineItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection<T> {
    #[serde(default)]
    page_info: Option<PageInfo>,
    nodes: Vec<T>,
}

impl<T> Connection<T> {
    fn next_cursor(&self) -> Option<String> {
        self.page_info
            .as_ref()
            .filter(|p| p.has_next_page)
            .and_then(|p| p.end_cursor.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoneyBag {
    shop_money: Money,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Money {
    amount: Option<String>,
    currency_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    id: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
    source_name: Option<String>,
    currency_code: Option<String>,
    customer: Option<RawCustomer>,
    shipping_address: Option<RawAddress>,
    total_discounts_set: Option<MoneyBag>,
    total_refunded_set: Option<MoneyBag>,
    total_shipping_price_set: Option<MoneyBag>,
    #[serde(default)]
    custom_attributes: Vec<CustomAttribute>,
    customer_journey_summary: Option<JourneySummary>,
    line_items: Connection<RawLineItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCustomer {
    id: Option<String>,
    /// Shopify serializes this UnsignedInt64 as a string.
    number_of_orders: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAddress {
    country: Option<String>,
    country_code_v2: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JourneySummary {
    first_visit: Option<Visit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Visit {
    landing_page: Option<String>,
    referrer_url: Option<String>,
    utm_parameters: Option<UtmParameters>,
}

#[derive(Debug, Deserialize)]
struct UtmParameters {
    source: Option<String>,
    medium: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLineItem {
    title: String,
    quantity: i64,
    original_unit_price_set: Option<MoneyBag>,
    original_total_set: Option<MoneyBag>,
    variant: Option<RawVariant>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVariant {
    id: String,
    inventory_item: Option<InventoryItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InventoryItem {
    unit_cost: Option<Money>,
    measurement: Option<Measurement>,
}

#[derive(Debug, Deserialize)]
struct Measurement {
    weight: Option<Weight>,
}

#[derive(Debug, Deserialize)]
struct Weight {
    unit: String,
    value: f64,
}

impl Weight {
    fn kilograms(&self) -> Option<f64> {
        let factor = match self.unit.as_str() {
            "KILOGRAMS" => 1.0,
            "GRAMS" => 0.001,
            "POUNDS" => 0.453_592_37,
            "OUNCES" => 0.028_349_523_125,
            _ => return None,
        };
        Some(self.value * factor)
    }
}

fn amount(record: &str, bag: Option<&MoneyBag>) -> Decimal {
    parse_amount(VENDOR, record, bag.and_then(|b| b.shop_money.amount.as_deref()))
}

fn convert_line(order_label: &str, raw: RawLineItem) -> LineItem {
    let record = format!("{} / {}", order_label, raw.title);
    let quantity = match u32::try_from(raw.quantity) {
        Ok(q) => q,
        Err(_) => {
            warn!("{} record {}: quantity {} out of range, using 0", VENDOR, record, raw.quantity);
            0
        }
    };
    let inventory = raw.variant.as_ref().and_then(|v| v.inventory_item.as_ref());
    let unit_cost = inventory
        .and_then(|i| i.unit_cost.as_ref())
        .and_then(|m| m.amount.as_deref())
        .map(|a| parse_amount(VENDOR, &record, Some(a)));
    let weight_kg = inventory
        .and_then(|i| i.measurement.as_ref())
        .and_then(|m| m.weight.as_ref())
        .and_then(Weight::kilograms);

    LineItem {
        unit_price: amount(&record, raw.original_unit_price_set.as_ref()),
        line_total: amount(&record, raw.original_total_set.as_ref()),
        variant_id: raw.variant.map(|v| v.id),
        title: raw.title,
        quantity,
        unit_cost,
        weight_kg,
    }
}

/// An order whose first page of line items was not the last one.
#[derive(Debug, Clone, PartialEq)]
struct LineItemContinuation {
    index: usize,
    order_id: String,
    label: String,
    cursor: String,
}

fn convert_order(raw: RawOrder) -> Order {
    let label = order_label(&raw);
    let currency = raw
        .currency_code
        .clone()
        .or_else(|| {
            raw.total_shipping_price_set
                .as_ref()
                .and_then(|b| b.shop_money.currency_code.clone())
        })
        .unwrap_or_default();

    let customer = raw.customer.map(|c| Customer {
        id: c.id,
        orders_count: c
            .number_of_orders
            .as_deref()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0),
    });

    let visit = raw.customer_journey_summary.and_then(|j| j.first_visit);
    let journey = match visit {
        Some(visit) => CustomerJourney {
            utm_source: visit.utm_parameters.as_ref().and_then(|u| u.source.clone()),
            utm_medium: visit.utm_parameters.as_ref().and_then(|u| u.medium.clone()),
            referrer_url: visit.referrer_url,
            landing_page_url: visit.landing_page,
        },
        None => CustomerJourney::default(),
    };

    Order {
        total_discounts: amount(&label, raw.total_discounts_set.as_ref()),
        total_refunded: amount(&label, raw.total_refunded_set.as_ref()),
        shipping_charged: amount(&label, raw.total_shipping_price_set.as_ref()),
        line_items: raw
            .line_items
            .nodes
            .into_iter()
            .map(|line| convert_line(&label, line))
            .collect(),
        shipping_address: raw.shipping_address.map(|a| ShippingAddress {
            country: a.country,
            country_code: a.country_code_v2,
        }),
        id: raw.id,
        name: raw.name,
        created_at: raw.created_at,
        cancelled_at: raw.cancelled_at,
        source_name: raw.source_name,
        currency,
        customer,
        custom_attributes: raw.custom_attributes,
        journey,
    }
}

fn order_label(raw: &RawOrder) -> String {
    raw.name.clone().unwrap_or_else(|| raw.id.clone())
}

fn map_graphql_errors(errors: &[GraphQlError]) -> KpiError {
    let details = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    let code = errors
        .iter()
        .find_map(|e| e.extensions.as_ref().and_then(|x| x.code.as_deref()));
    match code {
        Some("THROTTLED") => KpiError::Transient {
            vendor: VENDOR.to_string(),
            status: None,
            details,
        },
        Some("ACCESS_DENIED") => KpiError::Authorization {
            vendor: VENDOR.to_string(),
            status: 403,
        },
        _ => KpiError::data(VENDOR, details),
    }
}

fn parse_response<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    let response: GraphQlResponse<T> = serde_json::from_str(body)?;
    if !response.errors.is_empty() {
        return Err(map_graphql_errors(&response.errors));
    }
    response
        .data
        .ok_or_else(|| KpiError::data(VENDOR, "response without data"))
}

fn parse_orders_page(body: &str) -> Result<(OrderPage, Vec<LineItemContinuation>)> {
    let orders = parse_response::<OrdersData>(body)?.orders;
    let next_cursor = orders.next_cursor();

    let mut continuations = Vec::new();
    let mut converted = Vec::with_capacity(orders.nodes.len());
    for (index, raw) in orders.nodes.into_iter().enumerate() {
        if let Some(cursor) = raw.line_items.next_cursor() {
            continuations.push(LineItemContinuation {
                index,
                order_id: raw.id.clone(),
                label: order_label(&raw),
                cursor,
            });
        }
        converted.push(convert_order(raw));
    }

    Ok((
        OrderPage {
            orders: converted,
            next_cursor,
        },
        continuations,
    ))
}

fn parse_line_items_page(body: &str, label: &str) -> Result<(Vec<LineItem>, Option<String>)> {
    let order = parse_response::<OrderData>(body)?
        .order
        .ok_or_else(|| KpiError::data(VENDOR, format!("order {} not found for line items", label)))?;
    let next_cursor = order.line_items.next_cursor();
    let lines = order
        .line_items
        .nodes
        .into_iter()
        .map(|line| convert_line(label, line))
        .collect();
    Ok((lines, next_cursor))
}

/// Shopify search syntax for the window. Bounds are UTC instants.
pub fn search_query(query: &OrderQuery) -> String {
    let mut search = format!(
        "created_at:>='{}' created_at:<'{}'",
        query.since.to_rfc3339_opts(SecondsFormat::Secs, true),
        query.until.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    if query.exclude_cancelled {
        search.push_str(" -status:cancelled");
    }
    search
}

pub struct ShopifyOrderSource {
    client: Client,
    endpoint: String,
    access_token: String,
}

impl ShopifyOrderSource {
    pub fn new(shop_domain: &str, access_token: String, api_version: &str) -> Result<Self> {
        let domain = shop_domain
            .trim()
            .trim_start_matches("https://")
            .trim_end_matches('/');
        Ok(Self {
            client: build_client(VENDOR)?,
            endpoint: format!("https://{}/admin/api/{}/graphql.json", domain, api_version),
            access_token,
        })
    }

    /// `None` when the store has no access token.
    pub fn from_settings(store: &StoreSettings) -> Result<Option<Self>> {
        match store.access_token.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(token) => Self::new(&store.shop_domain, token.to_string(), &store.api_version).map(Some),
            None => Ok(None),
        }
    }
}

impl ShopifyOrderSource {
    async fn post(&self, payload: &serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Shopify-Access-Token", &self.access_token)
            .json(payload)
            .send()
            .await?;
        Ok(check_status(VENDOR, response).await?.text().await?)
    }

    /// Line items past the first page of an order.
    async fn remaining_line_items(&self, continuation: &LineItemContinuation) -> Result<Vec<LineItem>> {
        let mut lines = Vec::new();
        let mut cursor = Some(continuation.cursor.clone());

        while let Some(after) = cursor {
            debug!("shopify line items of {} after {}", continuation.label, after);
            let payload = json!({
                "query": LINE_ITEMS_QUERY,
                "variables": {
                    "id": continuation.order_id.as_str(),
                    "first": LINE_ITEM_PAGE_SIZE,
                    "after": after.as_str(),
                }
            });
            let body = self.post(&payload).await?;
            let (page, next) = parse_line_items_page(&body, &continuation.label)?;
            lines.extend(page);
            cursor = next.filter(|n| *n != after);
        }
        Ok(lines)
    }
}

#[async_trait]
impl OrderSource for ShopifyOrderSource {
    async fn fetch_orders_page(&self, query: &OrderQuery, cursor: Option<String>) -> Result<OrderPage> {
        let payload = json!({
            "query": ORDERS_QUERY,
            "variables": {
                "first": PAGE_SIZE,
                "after": cursor,
                "query": search_query(query),
            }
        });
        debug!("shopify orders page after {:?}", payload["variables"]["after"]);

        let body = self.post(&payload).await?;
        let (mut page, continuations) = parse_orders_page(&body)?;
        for continuation in &continuations {
            let extra = self.remaining_line_items(continuation).await?;
            if let Some(order) = page.orders.get_mut(continuation.index) {
                order.line_items.extend(extra);
            }
        }
        Ok(page)
    }
}
