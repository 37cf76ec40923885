//! The aggregate view a live session renders, and the collaborator that
//! renders it.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Monthly,
    Daily,
}

impl FromStr for Period {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(Period::Monthly),
            "daily" => Ok(Period::Daily),
            other => Err(format!("unknown period '{other}', expected 'monthly' or 'daily'")),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Monthly => f.write_str("monthly"),
            Period::Daily => f.write_str("daily"),
        }
    }
}

/// Which table a subscriber is looking at: the months of a year, or the days
/// of one month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewFilter {
    pub period: Period,
    pub year: i32,
    pub month: Option<u32>,
}

impl ViewFilter {
    pub fn monthly(year: i32) -> Self {
        Self {
            period: Period::Monthly,
            year,
            month: None,
        }
    }

    pub fn daily(year: i32, month: u32) -> Self {
        Self {
            period: Period::Daily,
            year,
            month: Some(month),
        }
    }
}

impl fmt::Display for ViewFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.month {
            Some(month) => write!(f, "{}:{}-{:02}", self.period, self.year, month),
            None => write!(f, "{}:{}", self.period, self.year),
        }
    }
}

/// A render or query failure during a live update. Never fatal to a session.
#[derive(Debug, Clone, Error)]
#[error("failed to render {view}: {reason}")]
pub struct RenderError {
    pub view: String,
    pub reason: String,
}

impl RenderError {
    pub fn new(view: &ViewFilter, reason: impl Into<String>) -> Self {
        Self {
            view: view.to_string(),
            reason: reason.into(),
        }
    }
}

/// Storage and templating behind a live view.
#[async_trait]
pub trait ViewRenderer: Send + Sync {
    async fn render_view(&self, filter: &ViewFilter) -> Result<String, RenderError>;
}
