//! Core domain types for the tastebase knowledge base.

use std::ops::{Add, AddAssign};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TastebaseError};

/// Generate a new time-sortable record identifier (UUID v7).
pub fn new_record_id() -> String {
    Uuid::now_v7().to_string()
}

/// Render a timestamp in the fixed-width form used for every stored column.
///
/// Fixed width keeps lexical order equal to chronological order, which the
/// cache expiry filter relies on.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored RFC 3339 timestamp.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TastebaseError::Storage(format!("invalid timestamp `{s}`: {e}")))
}

// ---------------------------------------------------------------------------
// Token usage
// ---------------------------------------------------------------------------

/// Token counts reported by one or more external calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Build a usage record, deriving the total.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Tables that hold externally-visible records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTable {
    Chefs,
    Restaurants,
    Shows,
    ChefShows,
    PendingDiscoveries,
    ReviewQueue,
}

impl EntityTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chefs => "chefs",
            Self::Restaurants => "restaurants",
            Self::Shows => "shows",
            Self::ChefShows => "chef_shows",
            Self::PendingDiscoveries => "pending_discoveries",
            Self::ReviewQueue => "review_queue",
        }
    }
}

impl std::fmt::Display for EntityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A person in the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chef {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operating status of a venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestaurantStatus {
    Open,
    Closed,
    #[default]
    Unknown,
}

impl RestaurantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for RestaurantStatus {
    type Err = TastebaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" | "permanently_closed" | "permanently closed" => Ok(Self::Closed),
            "unknown" => Ok(Self::Unknown),
            other => Err(TastebaseError::parse(format!(
                "unknown restaurant status `{other}`"
            ))),
        }
    }
}

/// A venue in the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restaurant {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chef_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub status: RestaurantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A TV show that links chefs together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Show {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Discoveries
// ---------------------------------------------------------------------------

/// The three kinds of discovery awaiting review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    Show,
    Chef,
    Restaurant,
}

impl DiscoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Show => "show",
            Self::Chef => "chef",
            Self::Restaurant => "restaurant",
        }
    }
}

impl std::str::FromStr for DiscoveryKind {
    type Err = TastebaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "show" => Ok(Self::Show),
            "chef" => Ok(Self::Chef),
            "restaurant" => Ok(Self::Restaurant),
            other => Err(TastebaseError::validation(format!(
                "unknown discovery type `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowDiscovery {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChefDiscovery {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestaurantDiscovery {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chef_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// A typed discovery payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "discovery_type", content = "payload", rename_all = "snake_case")]
pub enum Discovery {
    Show(ShowDiscovery),
    Chef(ChefDiscovery),
    Restaurant(RestaurantDiscovery),
}

impl Discovery {
    pub fn kind(&self) -> DiscoveryKind {
        match self {
            Self::Show(_) => DiscoveryKind::Show,
            Self::Chef(_) => DiscoveryKind::Chef,
            Self::Restaurant(_) => DiscoveryKind::Restaurant,
        }
    }

    /// Display name of the discovered thing.
    pub fn name(&self) -> &str {
        match self {
            Self::Show(s) => &s.name,
            Self::Chef(c) => &c.name,
            Self::Restaurant(r) => &r.name,
        }
    }

    /// Serialize only the payload (the kind is stored in its own column).
    pub fn payload_json(&self) -> Result<String> {
        let value = match self {
            Self::Show(s) => serde_json::to_string(s),
            Self::Chef(c) => serde_json::to_string(c),
            Self::Restaurant(r) => serde_json::to_string(r),
        };
        value.map_err(|e| TastebaseError::Storage(format!("serialize discovery payload: {e}")))
    }

    /// Rebuild a discovery from its stored kind and payload columns.
    pub fn from_parts(kind: DiscoveryKind, payload_json: &str) -> Result<Self> {
        let parsed = match kind {
            DiscoveryKind::Show => serde_json::from_str(payload_json).map(Self::Show),
            DiscoveryKind::Chef => serde_json::from_str(payload_json).map(Self::Chef),
            DiscoveryKind::Restaurant => serde_json::from_str(payload_json).map(Self::Restaurant),
        };
        parsed.map_err(|e| {
            TastebaseError::Storage(format!("invalid {} payload: {e}", kind.as_str()))
        })
    }
}

/// Review status of a pending discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Pending,
    Approved,
    Rejected,
    NeedsReview,
    Merged,
}

impl DiscoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::NeedsReview => "needs_review",
            Self::Merged => "merged",
        }
    }

    /// Live records block new inserts with the same identity.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Approved | Self::NeedsReview)
    }
}

impl std::str::FromStr for DiscoveryStatus {
    type Err = TastebaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "needs_review" => Ok(Self::NeedsReview),
            "merged" => Ok(Self::Merged),
            other => Err(TastebaseError::validation(format!(
                "unknown discovery status `{other}`"
            ))),
        }
    }
}

/// An unapproved candidate record awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDiscovery {
    pub id: String,
    pub discovery: Discovery,
    /// Normalized identity used by the insert gate.
    pub identity_key: String,
    pub source_ref: String,
    pub status: DiscoveryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Audit + review
// ---------------------------------------------------------------------------

/// Kind of change recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
    DuplicateSuppressed,
    FlaggedForReview,
    Rollback,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::DuplicateSuppressed => "duplicate_suppressed",
            Self::FlaggedForReview => "flagged_for_review",
            Self::Rollback => "rollback",
        }
    }
}

impl std::str::FromStr for ChangeType {
    type Err = TastebaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "duplicate_suppressed" => Ok(Self::DuplicateSuppressed),
            "flagged_for_review" => Ok(Self::FlaggedForReview),
            "rollback" => Ok(Self::Rollback),
            other => Err(TastebaseError::Storage(format!("unknown change type `{other}`"))),
        }
    }
}

/// One audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_data: Option<serde_json::Value>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl AuditEntry {
    pub fn new(table: impl Into<String>, change_type: ChangeType, source: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            record_id: None,
            change_type,
            old_data: None,
            new_data: None,
            source: source.into(),
            confidence: None,
        }
    }

    pub fn record(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn old(mut self, data: serde_json::Value) -> Self {
        self.old_data = Some(data);
        self
    }

    pub fn new_value(mut self, data: serde_json::Value) -> Self {
        self.new_data = Some(data);
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// A duplicate pair parked for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub id: String,
    pub entity_type: String,
    pub record_a: String,
    pub record_b: serde_json::Value,
    pub confidence: f64,
    pub reasoning: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ids_are_unique() {
        assert_ne!(new_record_id(), new_record_id());
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1500);
        let (sa, sb) = (format_timestamp(a), format_timestamp(b));
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
        assert_eq!(parse_timestamp(&sa).unwrap().timestamp_micros(), a.timestamp_micros());
    }

    #[test]
    fn token_usage_adds() {
        let mut total = TokenUsage::default();
        total += TokenUsage::new(100, 20);
        total += TokenUsage::new(5, 5);
        assert_eq!(total, TokenUsage::new(105, 25));
        assert_eq!(total.total_tokens, 130);
    }

    #[test]
    fn discovery_payload_roundtrip_through_columns() {
        let discovery = Discovery::Chef(ChefDiscovery {
            name: "Stephanie Izard".into(),
            city: Some("Chicago".into()),
            state: Some("IL".into()),
            show_name: Some("Top Chef".into()),
            role: Some("winner".into()),
        });
        let payload = discovery.payload_json().unwrap();
        assert!(!payload.contains("discovery_type"));
        let back = Discovery::from_parts(DiscoveryKind::Chef, &payload).unwrap();
        assert_eq!(back, discovery);
        assert_eq!(back.kind(), DiscoveryKind::Chef);
        assert_eq!(back.name(), "Stephanie Izard");
    }

    #[test]
    fn discovery_serializes_as_tagged_union() {
        let discovery = Discovery::Show(ShowDiscovery {
            name: "Top Chef".into(),
            network: Some("Bravo".into()),
            season: None,
        });
        let json = serde_json::to_string(&discovery).unwrap();
        assert!(json.contains(r#""discovery_type":"show""#));
        assert!(json.contains(r#""payload":{"name":"Top Chef""#));
    }

    #[test]
    fn live_statuses() {
        assert!(DiscoveryStatus::Pending.is_live());
        assert!(DiscoveryStatus::Approved.is_live());
        assert!(DiscoveryStatus::NeedsReview.is_live());
        assert!(!DiscoveryStatus::Rejected.is_live());
        assert!(!DiscoveryStatus::Merged.is_live());
    }

    #[test]
    fn restaurant_status_parsing() {
        assert_eq!("OPEN".parse::<RestaurantStatus>().unwrap(), RestaurantStatus::Open);
        assert_eq!(
            "permanently closed".parse::<RestaurantStatus>().unwrap(),
            RestaurantStatus::Closed
        );
        assert!("maybe".parse::<RestaurantStatus>().is_err());
    }
}
