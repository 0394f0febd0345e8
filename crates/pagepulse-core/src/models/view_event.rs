//! Page-view event model
//!
//! One record per content view. String fields are bounded by the column sizes
//! of `article_view_events` and get truncated right before persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Timestamp format used for `created_at` (SQL DATETIME compatible)
pub const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Maximum stored length (in chars) of each bounded column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnLimits {
    /// VARCHAR(45), long enough for any IPv6 text form
    pub ip: usize,
    pub user_agent: usize,
    pub referrer: usize,
}

impl Default for ColumnLimits {
    fn default() -> Self {
        Self {
            ip: 45,
            user_agent: 1024,
            referrer: 2048,
        }
    }
}

/// A single content-view occurrence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEvent {
    #[serde(default)]
    pub article_id: Option<i64>,

    #[serde(default)]
    pub ip: Option<String>,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub referrer: Option<String>,

    /// `YYYY-MM-DD HH:MM:SS` in UTC
    #[serde(default)]
    pub created_at: Option<String>,

    #[serde(default)]
    pub user_id: Option<i64>,
}

impl ViewEvent {
    /// New event for an article, stamped with the current time
    pub fn new(article_id: Option<i64>) -> Self {
        Self {
            article_id,
            created_at: Some(format_created_at(Utc::now())),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Truncate bounded string fields in place.
    ///
    /// Returns how many fields were cut. Each cut is logged; nothing here can fail.
    pub fn truncate_to(&mut self, limits: &ColumnLimits) -> usize {
        [
            truncate_field(&mut self.ip, "ip", limits.ip),
            truncate_field(&mut self.user_agent, "user_agent", limits.user_agent),
            truncate_field(&mut self.referrer, "referrer", limits.referrer),
        ]
        .into_iter()
        .filter(|cut| *cut)
        .count()
    }
}

/// Format a timestamp the way `created_at` is stored
pub fn format_created_at(ts: DateTime<Utc>) -> String {
    ts.format(CREATED_AT_FORMAT).to_string()
}

fn truncate_field(field: &mut Option<String>, name: &'static str, max_chars: usize) -> bool {
    let Some(value) = field.as_mut() else {
        return false;
    };

    // Byte offset of the first char past the limit, if any
    let Some((cut_at, _)) = value.char_indices().nth(max_chars) else {
        return false;
    };

    let original_chars = value.chars().count();
    value.truncate(cut_at);
    warn!(
        field = name,
        limit = max_chars,
        original_chars,
        "Truncated view event field to column limit"
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_stamps_created_at() {
        let event = ViewEvent::new(Some(42));
        assert_eq!(event.article_id, Some(42));
        let created = event.created_at.unwrap();
        assert_eq!(created.len(), "2024-01-01 00:00:00".len());
        assert!(chrono::NaiveDateTime::parse_from_str(&created, CREATED_AT_FORMAT).is_ok());
    }

    #[test]
    fn test_format_created_at() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_created_at(ts), "2024-03-09 07:05:01");
    }

    #[test]
    fn test_truncate_within_limits_is_noop() {
        let mut event = ViewEvent::new(Some(1))
            .with_ip("203.0.113.7")
            .with_user_agent("curl/8.0")
            .with_referrer("https://example.com/");
        let before = event.clone();

        assert_eq!(event.truncate_to(&ColumnLimits::default()), 0);
        assert_eq!(event, before);
    }

    #[test]
    fn test_truncate_oversized_fields() {
        let mut event = ViewEvent::new(Some(1))
            .with_ip("x".repeat(60))
            .with_user_agent("u".repeat(2000))
            .with_referrer("r".repeat(10));

        let cut = event.truncate_to(&ColumnLimits::default());

        assert_eq!(cut, 2);
        assert_eq!(event.ip.as_deref().map(str::len), Some(45));
        assert_eq!(event.user_agent.as_deref().map(str::len), Some(1024));
        assert_eq!(event.referrer.as_deref(), Some("rrrrrrrrrr"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let limits = ColumnLimits {
            ip: 3,
            ..Default::default()
        };
        let mut event = ViewEvent::default().with_ip("ééééé");

        assert_eq!(event.truncate_to(&limits), 1);
        assert_eq!(event.ip.as_deref(), Some("ééé"));
    }

    #[test]
    fn test_missing_fields_deserialize_as_none() {
        let event: ViewEvent = serde_json::from_str(r#"{"article_id": 7}"#).unwrap();
        assert_eq!(event.article_id, Some(7));
        assert!(event.ip.is_none());
        assert!(event.created_at.is_none());
        assert!(event.user_id.is_none());
    }
}
