use crate::error::{KpiError, Result};
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| KpiError::UnknownTimezone(name.to_string()))
}

/// A calendar date interpreted in the merchant's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShopDay {
    pub date: NaiveDate,
    pub timezone: Tz,
}

impl ShopDay {
    pub fn new(date: NaiveDate, timezone: Tz) -> Self {
        Self { date, timezone }
    }

    pub fn window(&self) -> Result<LocalWindow> {
        resolve(&self.timezone, self.date)
    }
}

/// Half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl LocalWindow {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    pub fn duration_hours(&self) -> i64 {
        (self.end - self.start).num_hours()
    }
}

/// Converts local midnight of `date` to UTC using the timezone database.
///
/// When midnight itself is skipped by a DST jump the day starts at the first
/// local instant that exists.
pub fn localize_midnight(tz: &Tz, date: NaiveDate) -> Result<DateTime<Utc>> {
    let midnight = date.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&midnight) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            for minutes in (15..=180).step_by(15) {
                let candidate = midnight + Duration::minutes(minutes);
                if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
                    return Ok(dt.with_timezone(&Utc));
                }
            }
            Err(KpiError::DateError(format!(
                "No valid local start of day for {} in {}",
                date,
                tz.name()
            )))
        }
    }
}

fn next_day(date: NaiveDate) -> Result<NaiveDate> {
    date.succ_opt()
        .ok_or_else(|| KpiError::DateError(format!("No calendar day after {}", date)))
}

pub fn resolve(shop_tz: &Tz, calendar_date: NaiveDate) -> Result<LocalWindow> {
    Ok(LocalWindow {
        start: localize_midnight(shop_tz, calendar_date)?,
        end: localize_midnight(shop_tz, next_day(calendar_date)?)?,
    })
}

/// Window from the 1st of the month of `up_to_date` through the end of `up_to_date`.
pub fn resolve_month_to_date(shop_tz: &Tz, up_to_date: NaiveDate) -> Result<LocalWindow> {
    let first = up_to_date
        .with_day(1)
        .ok_or_else(|| KpiError::DateError(format!("No first day of month for {}", up_to_date)))?;
    Ok(LocalWindow {
        start: localize_midnight(shop_tz, first)?,
        end: localize_midnight(shop_tz, next_day(up_to_date)?)?,
    })
}

/// Inclusive list of calendar dates from `start` to `end`.
pub fn days_in_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

/// Vendor-local hours (0-23) that overlap one shop-local day, keyed by
/// vendor-local calendar date.
///
/// A local hour repeated by a vendor-side DST fall-back appears once, the
/// way hourly insight buckets merge it. `repeated_hours` counts the UTC
/// hours folded that way, so `hour_count() + repeated_hours()` equals the
/// window's UTC duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorHourWindow {
    pub timezone: Tz,
    hours: BTreeMap<NaiveDate, BTreeSet<u32>>,
    repeated: usize,
}

impl VendorHourWindow {
    pub fn contains(&self, date: NaiveDate, hour: u32) -> bool {
        self.hours
            .get(&date)
            .map(|set| set.contains(&hour))
            .unwrap_or(false)
    }

    pub fn hours_for(&self, date: NaiveDate) -> Option<&BTreeSet<u32>> {
        self.hours.get(&date)
    }

    pub fn dates(&self) -> impl Iterator<Item = &NaiveDate> {
        self.hours.keys()
    }

    /// First and last vendor-local date touched; this is the span to fetch.
    pub fn date_span(&self) -> Option<(NaiveDate, NaiveDate)> {
        let first = *self.hours.keys().next()?;
        let last = *self.hours.keys().next_back()?;
        Some((first, last))
    }

    pub fn hour_count(&self) -> usize {
        self.hours.values().map(BTreeSet::len).sum()
    }

    pub fn repeated_hours(&self) -> usize {
        self.repeated
    }

    pub fn is_empty(&self) -> bool {
        self.hours.is_empty()
    }
}

pub fn map_to_vendor_hours(window: &LocalWindow, vendor_tz: &Tz) -> VendorHourWindow {
    let start = window.start.with_timezone(vendor_tz).naive_local();
    let end = window.end.with_timezone(vendor_tz).naive_local();
    let mut hours: BTreeMap<NaiveDate, BTreeSet<u32>> = BTreeMap::new();

    let mut insert = |date: NaiveDate, from: u32, to: u32| {
        // Hours skipped by a vendor-side DST jump never carry rows.
        let set: BTreeSet<u32> = (from..to)
            .filter(|h| {
                date.and_hms_opt(*h, 0, 0)
                    .map(|t| vendor_tz.from_local_datetime(&t).earliest().is_some())
                    .unwrap_or(false)
            })
            .collect();
        if !set.is_empty() {
            hours.entry(date).or_default().extend(set);
        }
    };

    if window.end > window.start {
        let (start_date, start_hour) = (start.date(), start.hour());
        let (end_date, end_hour) = (end.date(), end.hour());

        if start_date == end_date {
            insert(start_date, start_hour, end_hour);
        } else {
            insert(start_date, start_hour, 24);
            for date in start_date.iter_days().skip(1).take_while(|d| *d < end_date) {
                insert(date, 0, 24);
            }
            insert(end_date, 0, end_hour);
        }
    }

    VendorHourWindow {
        timezone: *vendor_tz,
        hours,
        repeated: folded_hours(window, vendor_tz),
    }
}

/// UTC hours of `window` whose vendor-local (date, hour) was already seen.
fn folded_hours(window: &LocalWindow, vendor_tz: &Tz) -> usize {
    let mut seen = BTreeSet::new();
    let mut folded = 0;
    let mut instant = window.start;
    while instant < window.end {
        let local = instant.with_timezone(vendor_tz);
        if !seen.insert((local.date_naive(), local.hour())) {
            folded += 1;
        }
        instant += Duration::hours(1);
    }
    folded
}
