use crate::ads::FxTable;
use crate::channel::{classify, AttributedChannel, Channel};
use crate::error::Result;
use crate::resilience::{retry_transient, RetryPolicy, WarnOnce};
use crate::schema::{AdPlatform, Order};
use crate::shipping::{ShippingMatrix, RATE_CURRENCY};
use crate::window::{resolve, LocalWindow};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct OrderQuery {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub exclude_cancelled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    pub next_cursor: Option<String>,
}

/// Paginated order listing of one storefront. Orders are created within
/// `[since, until)`.
#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn fetch_orders_page(&self, query: &OrderQuery, cursor: Option<String>) -> Result<OrderPage>;
}

#[derive(Clone)]
pub struct StoreHandle {
    pub name: String,
    pub source: Arc<dyn OrderSource>,
}

impl StoreHandle {
    pub fn new(name: impl Into<String>, source: Arc<dyn OrderSource>) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

pub(crate) fn ratio_pct(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        Decimal::ZERO
    } else {
        numerator / denominator * Decimal::ONE_HUNDRED
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderFinancials {
    pub gross: Decimal,
    pub discounts: Decimal,
    pub refunds: Decimal,
    /// `gross - discounts - refunds`, never below zero.
    pub net: Decimal,
    pub cogs: Decimal,
    pub shipping_charged: Decimal,
    pub shipping_estimate: Decimal,
    pub profit: Decimal,
    pub margin_pct: Decimal,
}

impl OrderFinancials {
    pub fn for_order(order: &Order, shipping: &ShippingMatrix) -> Self {
        let gross: Decimal = order.line_items.iter().map(|l| l.gross()).sum();
        let cogs: Decimal = order.line_items.iter().map(|l| l.cogs()).sum();
        let discounts = order.total_discounts;
        let refunds = order.total_refunded;
        let net = (gross - discounts - refunds).max(Decimal::ZERO);
        let shipping_charged = order.shipping_charged;
        let shipping_estimate = shipping.estimate_order(order);
        let profit = net + shipping_charged - shipping_estimate - cogs;

        Self {
            gross,
            discounts,
            refunds,
            net,
            cogs,
            shipping_charged,
            shipping_estimate,
            profit,
            margin_pct: ratio_pct(profit, net + shipping_charged),
        }
    }

    /// Converts amounts quoted in `order_currency` (and the shipping
    /// estimate, quoted in the rate currency) into the reporting currency.
    pub fn in_reporting_currency(&self, fx: &FxTable, order_currency: &str) -> Self {
        let convert = |amount: Decimal| fx.normalize(amount, order_currency);
        let net = convert(self.net);
        let cogs = convert(self.cogs);
        let shipping_charged = convert(self.shipping_charged);
        let shipping_estimate = fx.normalize(self.shipping_estimate, RATE_CURRENCY);
        let profit = net + shipping_charged - shipping_estimate - cogs;

        Self {
            gross: convert(self.gross),
            discounts: convert(self.discounts),
            refunds: convert(self.refunds),
            net,
            cogs,
            shipping_charged,
            shipping_estimate,
            profit,
            margin_pct: ratio_pct(profit, net + shipping_charged),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedOrder {
    pub store: String,
    pub order: Order,
    pub channel: AttributedChannel,
    pub acquisition: Channel,
    pub cancelled: bool,
    pub financials: OrderFinancials,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub orders: u32,
    pub net: Decimal,
    pub profit: Decimal,
}

impl Bucket {
    fn add(&mut self, financials: &OrderFinancials) {
        self.orders += 1;
        self.net += financials.net;
        self.profit += financials.profit;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAnalytics {
    pub order_count: u32,
    pub cancelled_count: u32,
    pub returning_customers: u32,
    pub totals: OrderFinancials,
    /// Index is the shop-local hour of creation.
    pub by_hour: Vec<Bucket>,
    pub by_country: BTreeMap<String, Bucket>,
    pub by_channel: BTreeMap<AttributedChannel, Bucket>,
    pub by_acquisition: BTreeMap<Channel, Bucket>,
}

impl Default for OrderAnalytics {
    fn default() -> Self {
        Self {
            order_count: 0,
            cancelled_count: 0,
            returning_customers: 0,
            totals: OrderFinancials::default(),
            by_hour: vec![Bucket::default(); 24],
            by_country: BTreeMap::new(),
            by_channel: BTreeMap::new(),
            by_acquisition: BTreeMap::new(),
        }
    }
}

impl OrderAnalytics {
    fn add(&mut self, tagged: &TaggedOrder, shop_tz: &Tz) {
        if tagged.cancelled {
            self.cancelled_count += 1;
            return;
        }

        let f = &tagged.financials;
        self.order_count += 1;
        if tagged.order.is_returning_customer() {
            self.returning_customers += 1;
        }

        let t = &mut self.totals;
        t.gross += f.gross;
        t.discounts += f.discounts;
        t.refunds += f.refunds;
        t.net += f.net;
        t.cogs += f.cogs;
        t.shipping_charged += f.shipping_charged;
        t.shipping_estimate += f.shipping_estimate;
        t.profit += f.profit;
        t.margin_pct = ratio_pct(t.profit, t.net + t.shipping_charged);

        let hour = tagged.order.created_at.with_timezone(shop_tz).hour() as usize;
        if let Some(bucket) = self.by_hour.get_mut(hour) {
            bucket.add(f);
        }
        self.by_country
            .entry(country_key(&tagged.order))
            .or_default()
            .add(f);
        self.by_channel.entry(tagged.channel).or_default().add(f);
        self.by_acquisition
            .entry(tagged.acquisition)
            .or_default()
            .add(f);
    }

    /// Orders attributed to an ad platform through custom attributes.
    pub fn purchases(&self, platform: AdPlatform) -> u32 {
        let channel = match platform {
            AdPlatform::Google => AttributedChannel::Google,
            AdPlatform::Meta => AttributedChannel::Meta,
        };
        self.by_channel.get(&channel).map(|b| b.orders).unwrap_or(0)
    }
}

fn country_key(order: &Order) -> String {
    let address = order.shipping_address.as_ref();
    address
        .and_then(|a| a.country_code.as_deref())
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .or_else(|| {
            address
                .and_then(|a| a.country.as_deref())
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
        })
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Zeroes negative money fields, logging the affected record.
fn sanitize(store: &str, mut order: Order) -> Order {
    let label = order_label(&order.id, &order.name);
    let fix = |field: &str, value: &mut Decimal| {
        if value.is_sign_negative() && !value.is_zero() {
            warn!(
                "Order {} from {}: negative {} ({}), using 0",
                label, store, field, value
            );
            *value = Decimal::ZERO;
        }
    };

    fix("total_discounts", &mut order.total_discounts);
    fix("total_refunded", &mut order.total_refunded);
    fix("shipping_charged", &mut order.shipping_charged);
    for line in order.line_items.iter_mut() {
        fix("line_total", &mut line.line_total);
        if let Some(cost) = line.unit_cost.as_mut() {
            fix("unit_cost", cost);
        }
    }
    order
}

fn order_label(id: &str, name: &Option<String>) -> String {
    match name {
        Some(name) => format!("{} ({})", name, id),
        None => id.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAggregate {
    /// Newest first; cancelled orders included and flagged.
    pub orders: Vec<TaggedOrder>,
    pub analytics: OrderAnalytics,
}

pub struct OrderAggregator {
    stores: Vec<StoreHandle>,
    shipping: Arc<ShippingMatrix>,
    shop_tz: Tz,
    own_domains: Vec<String>,
    exclude_cancelled: bool,
    fx: Option<FxTable>,
    retry: RetryPolicy,
    warnings: Arc<WarnOnce>,
}

impl OrderAggregator {
    pub fn new(
        stores: Vec<StoreHandle>,
        shipping: Arc<ShippingMatrix>,
        shop_tz: Tz,
        retry: RetryPolicy,
        warnings: Arc<WarnOnce>,
    ) -> Self {
        Self {
            stores,
            shipping,
            shop_tz,
            own_domains: Vec::new(),
            exclude_cancelled: false,
            fx: None,
            retry,
            warnings,
        }
    }

    /// Domains whose referrals count as direct traffic.
    pub fn with_own_domains(mut self, domains: Vec<String>) -> Self {
        self.own_domains = domains;
        self
    }

    pub fn with_exclude_cancelled(mut self, exclude: bool) -> Self {
        self.exclude_cancelled = exclude;
        self
    }

    /// Report order money in the table's currency. Without a table amounts
    /// stay in each store's own currency.
    pub fn with_fx(mut self, fx: FxTable) -> Self {
        self.fx = Some(fx);
        self
    }

    pub fn shop_timezone(&self) -> &Tz {
        &self.shop_tz
    }

    async fn fetch_store(&self, store: &StoreHandle, query: &OrderQuery) -> Result<Vec<Order>> {
        let op = format!("orders from {}", store.name);
        let mut orders = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors = HashSet::new();

        loop {
            let page = retry_transient(&self.retry, &op, || {
                store.source.fetch_orders_page(query, cursor.clone())
            })
            .await?;
            debug!("{}: page with {} orders", op, page.orders.len());
            orders.extend(page.orders);

            match page.next_cursor {
                Some(next) if seen_cursors.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!("{}: cursor {} repeated, stopping pagination", op, next);
                    break;
                }
                None => break,
            }
        }
        Ok(orders)
    }

    /// Orders of every store created inside `window`, deduplicated by vendor
    /// id (first store wins) and summarised.
    pub async fn aggregate(&self, window: &LocalWindow) -> Result<OrderAggregate> {
        let query = OrderQuery {
            since: window.start,
            until: window.end,
            exclude_cancelled: self.exclude_cancelled,
        };

        let mut seen_ids = HashSet::new();
        let mut tagged = Vec::new();

        for store in &self.stores {
            let orders = match self.fetch_store(store, &query).await {
                Ok(orders) => orders,
                Err(e) if e.is_authorization() => {
                    self.warnings.warn(
                        &format!("orders:{}:authorization", store.name),
                        &format!("Store {} rejected credentials, skipping its orders: {}", store.name, e),
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            for order in orders {
                if !window.contains(order.created_at) {
                    debug!(
                        "Order {} from {} created at {} is outside the window, skipping",
                        order.id, store.name, order.created_at
                    );
                    continue;
                }
                if !seen_ids.insert(order.id.clone()) {
                    debug!("Order {} from {} already seen, skipping duplicate", order.id, store.name);
                    continue;
                }
                tagged.push(self.tag(&store.name, order));
            }
        }

        tagged.sort_by(|a, b| {
            b.order
                .created_at
                .cmp(&a.order.created_at)
                .then_with(|| a.order.id.cmp(&b.order.id))
        });

        let mut analytics = OrderAnalytics::default();
        for order in &tagged {
            analytics.add(order, &self.shop_tz);
        }

        info!(
            "Aggregated {} orders ({} cancelled) from {} stores for {} .. {}",
            analytics.order_count,
            analytics.cancelled_count,
            self.stores.len(),
            window.start,
            window.end
        );

        Ok(OrderAggregate {
            orders: tagged,
            analytics,
        })
    }

    /// Aggregate over the shop-local dates `start..=end`.
    pub async fn aggregate_days(&self, start: NaiveDate, end: NaiveDate) -> Result<OrderAggregate> {
        let window = LocalWindow {
            start: resolve(&self.shop_tz, start)?.start,
            end: resolve(&self.shop_tz, end)?.end,
        };
        self.aggregate(&window).await
    }

    fn tag(&self, store: &str, order: Order) -> TaggedOrder {
        let order = sanitize(store, order);
        let mut financials = OrderFinancials::for_order(&order, &self.shipping);
        if let Some(fx) = &self.fx {
            financials = financials.in_reporting_currency(fx, &order.currency);
        }
        TaggedOrder {
            store: store.to_string(),
            channel: AttributedChannel::from_custom_attributes(&order.custom_attributes),
            acquisition: classify(&order.attribution_signals(), &self.own_domains),
            cancelled: order.is_cancelled(),
            financials,
            order,
        }
    }
}
