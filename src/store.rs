//! In-memory event log: the storage and rendering collaborator behind the
//! write endpoints and live views.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::change_watcher::StoreNotifier;
use crate::view::{Period, RenderError, ViewFilter, ViewRenderer};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no events recorded")]
    Empty,

    #[error("invalid period: {0}")]
    InvalidPeriod(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodCount {
    pub period: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusiestDay {
    pub date: NaiveDate,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub total: usize,
    pub last_event_at: Option<DateTime<Utc>>,
    pub busiest_day: Option<BusiestDay>,
}

#[derive(Debug, Serialize)]
struct ViewPayload<'a> {
    view: String,
    table: &'a [PeriodCount],
    footer: &'a Statistics,
}

pub fn is_leap_year(year: i32) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let days = match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => return None,
    };
    Some(days)
}

/// Fill the gaps in sparse per-period counts with zeroes for `1..=last`.
fn fill_periods(counts: &BTreeMap<u32, u32>, last: u32) -> Vec<PeriodCount> {
    (1..=last)
        .map(|period| PeriodCount {
            period,
            count: counts.get(&period).copied().unwrap_or(0),
        })
        .collect()
}

pub struct EventLog {
    /// Insertion order; the tail is the most recently recorded event.
    events: RwLock<Vec<DateTime<Utc>>>,
    offset: FixedOffset,
    notifier: Option<StoreNotifier>,
}

impl EventLog {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            offset,
            notifier: None,
        }
    }

    /// Attach the commit hook fired after every successful mutation.
    pub fn with_notifier(mut self, notifier: StoreNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn now_local(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    fn committed(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.content_written();
        }
    }

    /// Record an event at `at`, or now.
    pub async fn add(&self, at: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let at = at.unwrap_or_else(Utc::now);
        self.events.write().await.push(at);
        self.committed();
        at
    }

    /// Remove the most recently recorded event, whatever its timestamp.
    pub async fn delete_last(&self) -> Result<DateTime<Utc>, StoreError> {
        let removed = self.events.write().await.pop().ok_or(StoreError::Empty)?;
        self.committed();
        Ok(removed)
    }

    pub async fn last_event(&self) -> Option<DateTime<Utc>> {
        self.events.read().await.iter().max().copied()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Event count per month of `year`, up to the current month for the
    /// current year.
    pub async fn monthly(&self, now: DateTime<FixedOffset>, year: i32) -> Vec<PeriodCount> {
        let last = match year.cmp(&now.year()) {
            std::cmp::Ordering::Less => 12,
            std::cmp::Ordering::Equal => now.month(),
            std::cmp::Ordering::Greater => 0,
        };

        let mut counts = BTreeMap::new();
        for at in self.events.read().await.iter() {
            let local = at.with_timezone(&self.offset);
            if local.year() == year {
                *counts.entry(local.month()).or_insert(0) += 1;
            }
        }

        fill_periods(&counts, last)
    }

    /// Event count per day of one month, up to today for the current month.
    pub async fn daily(
        &self,
        now: DateTime<FixedOffset>,
        year: i32,
        month: u32,
    ) -> Result<Vec<PeriodCount>, StoreError> {
        let length = days_in_month(year, month)
            .ok_or_else(|| StoreError::InvalidPeriod(format!("month {month}")))?;
        let last = match (year, month).cmp(&(now.year(), now.month())) {
            std::cmp::Ordering::Less => length,
            std::cmp::Ordering::Equal => now.day(),
            std::cmp::Ordering::Greater => 0,
        };

        let mut counts = BTreeMap::new();
        for at in self.events.read().await.iter() {
            let local = at.with_timezone(&self.offset);
            if local.year() == year && local.month() == month {
                *counts.entry(local.day()).or_insert(0) += 1;
            }
        }

        Ok(fill_periods(&counts, last))
    }

    pub async fn statistics(&self) -> Statistics {
        let events = self.events.read().await;

        let mut per_day: BTreeMap<NaiveDate, u32> = BTreeMap::new();
        for at in events.iter() {
            *per_day
                .entry(at.with_timezone(&self.offset).date_naive())
                .or_insert(0) += 1;
        }

        Statistics {
            total: events.len(),
            last_event_at: events.iter().max().copied(),
            busiest_day: per_day
                .into_iter()
                .max_by_key(|(_, count)| *count)
                .map(|(date, count)| BusiestDay { date, count }),
        }
    }

    /// Render `filter` as it looks at `now`.
    pub async fn render_at(
        &self,
        filter: &ViewFilter,
        now: DateTime<FixedOffset>,
    ) -> Result<String, RenderError> {
        let table = match (filter.period, filter.month) {
            (Period::Monthly, _) => self.monthly(now, filter.year).await,
            (Period::Daily, Some(month)) => self
                .daily(now, filter.year, month)
                .await
                .map_err(|e| RenderError::new(filter, e.to_string()))?,
            (Period::Daily, None) => {
                return Err(RenderError::new(filter, "daily view needs a month"));
            }
        };
        let footer = self.statistics().await;

        serde_json::to_string(&ViewPayload {
            view: filter.to_string(),
            table: &table,
            footer: &footer,
        })
        .map_err(|e| RenderError::new(filter, e.to_string()))
    }
}

#[async_trait]
impl ViewRenderer for EventLog {
    async fn render_view(&self, filter: &ViewFilter) -> Result<String, RenderError> {
        self.render_at(filter, self.now_local()).await
    }
}
