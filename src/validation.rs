use chrono::{DateTime, Datelike, FixedOffset, Utc};
use serde::Deserialize;
use validator::Validate;

use crate::error::EventGateError;
use crate::view::{Period, ViewFilter};

/// Query string of a live view subscription.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SubscribeQuery {
    pub period: Option<String>,
    #[validate(range(min = 1, max = 9999))]
    pub year: Option<i32>,
    #[validate(range(min = 1, max = 12))]
    pub month: Option<u32>,
}

/// Body of an event insert. An empty body means "now".
#[derive(Debug, Default, Deserialize)]
pub struct CreateEventRequest {
    pub timestamp: Option<DateTime<Utc>>,
}

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Resolve a subscription query into a view filter. Missing year and
    /// month default to the current ones.
    pub fn subscribe_filter(
        query: &SubscribeQuery,
        now: DateTime<FixedOffset>,
    ) -> Result<ViewFilter, EventGateError> {
        query.validate()?;

        let period = query
            .period
            .as_deref()
            .ok_or_else(|| EventGateError::InvalidRequest("Missing 'period' parameter".to_string()))?
            .parse::<Period>()
            .map_err(EventGateError::InvalidRequest)?;

        let year = query.year.unwrap_or_else(|| now.year());
        if year > now.year() {
            return Err(EventGateError::InvalidRequest(format!(
                "Year {year} is in the future"
            )));
        }

        match period {
            Period::Monthly => Ok(ViewFilter::monthly(year)),
            Period::Daily => {
                let month = query.month.unwrap_or_else(|| now.month());
                if year == now.year() && month > now.month() {
                    return Err(EventGateError::InvalidRequest(format!(
                        "Month {year}-{month:02} is in the future"
                    )));
                }
                Ok(ViewFilter::daily(year, month))
            }
        }
    }

    /// Parse an insert body. Timestamps after `now` are rejected.
    pub fn create_event(
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, EventGateError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let request: CreateEventRequest = serde_json::from_slice(body)
            .map_err(|e| EventGateError::InvalidRequest(format!("Malformed body: {e}")))?;

        match request.timestamp {
            None => Err(EventGateError::InvalidRequest(
                "timestamp can't be empty!".to_string(),
            )),
            Some(at) if at > now => Err(EventGateError::InvalidRequest(
                "event time can't be after current time!".to_string(),
            )),
            Some(at) => Ok(Some(at)),
        }
    }
}
