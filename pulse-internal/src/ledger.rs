use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

use crate::auth::Identity;

/// The billable actions the gateway accounts for.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionType {
    ProfileAnalysis,
    Post,
    Comment,
    Idea,
}

/// Calendar month a usage record belongs to, rendered as `YYYY-MM`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn of(at: DateTime<Utc>) -> Self {
        Period {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn current() -> Self {
        Self::of(Utc::now())
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.to_string()
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("Invalid period `{s}`: expected YYYY-MM"))?;
        let year: i32 = year
            .parse()
            .map_err(|_| format!("Invalid period `{s}`: bad year"))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("Invalid period `{s}`: bad month"))?;
        if !(1..=12).contains(&month) {
            return Err(format!("Invalid period `{s}`: month out of range"));
        }
        Ok(Period { year, month })
    }
}

impl TryFrom<String> for Period {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One row per completed billable action. Append-only: created exactly once
/// after the action succeeds, never mutated or deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub action_type: ActionType,
    pub occurred_at: DateTime<Utc>,
    pub period: Period,
    #[serde(default)]
    pub metadata: Value,
}

impl UsageRecord {
    pub fn new(identity: &Identity, action_type: ActionType, metadata: Value) -> Self {
        Self::new_at(identity, action_type, metadata, Utc::now())
    }

    /// Exactly one of `user_id` / `ip_address` is set, derived from the
    /// identity that performed the action.
    pub fn new_at(
        identity: &Identity,
        action_type: ActionType,
        metadata: Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let (user_id, ip_address) = match identity {
            Identity::User { user_id } => (Some(user_id.clone()), None),
            Identity::Anonymous { ip_address } => (None, Some(ip_address.clone())),
        };
        UsageRecord {
            id: Uuid::now_v7(),
            user_id,
            ip_address,
            action_type,
            occurred_at,
            period: Period::of(occurred_at),
            metadata,
        }
    }

    /// Storage key for the identity behind this record.
    pub fn owner(&self) -> String {
        self.user_id
            .clone()
            .or_else(|| self.ip_address.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_action_type_names() {
        assert_eq!(ActionType::ProfileAnalysis.to_string(), "profile_analysis");
        assert_eq!(ActionType::Post.to_string(), "post");
        assert_eq!("comment".parse::<ActionType>().unwrap(), ActionType::Comment);
        assert_eq!("idea".parse::<ActionType>().unwrap(), ActionType::Idea);
        assert!("pdf_export".parse::<ActionType>().is_err());
    }

    #[test]
    fn test_period_display_and_parse() {
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap();
        let period = Period::of(at);
        assert_eq!(period.to_string(), "2025-03");
        assert_eq!("2025-03".parse::<Period>().unwrap(), period);
        assert!("2025".parse::<Period>().is_err());
        assert!("2025-13".parse::<Period>().is_err());
        assert!("2025-0".parse::<Period>().is_err());
    }

    #[test]
    fn test_period_changes_on_month_rollover() {
        let march = Utc.with_ymd_and_hms(2025, 3, 31, 23, 59, 59).unwrap();
        let april = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        assert_ne!(Period::of(march), Period::of(april));
    }

    #[test]
    fn test_record_from_user_identity() {
        let identity = Identity::User {
            user_id: "user-1".to_string(),
        };
        let record = UsageRecord::new(&identity, ActionType::Post, json!({"topic": "hiring"}));
        assert_eq!(record.user_id.as_deref(), Some("user-1"));
        assert_eq!(record.ip_address, None);
        assert_eq!(record.owner(), "user-1");
    }

    #[test]
    fn test_record_from_anonymous_identity() {
        let identity = Identity::Anonymous {
            ip_address: "203.0.113.9".to_string(),
        };
        let record = UsageRecord::new(&identity, ActionType::ProfileAnalysis, Value::Null);
        assert_eq!(record.user_id, None);
        assert_eq!(record.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(record.owner(), "203.0.113.9");
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let identity = Identity::User {
            user_id: "user-1".to_string(),
        };
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap();
        let record = UsageRecord::new_at(&identity, ActionType::Idea, Value::Null, at);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["userId"], json!("user-1"));
        assert_eq!(value["actionType"], json!("idea"));
        assert_eq!(value["period"], json!("2025-06"));
    }
}
