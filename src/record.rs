//! Record and event types shared across the storage engine
//!
//! A `StorageRecord` is an already-serialized event payload plus the metadata
//! the store needs for leasing, retry accounting, and trim priority. An
//! `Event` is the pre-serialization shape that travels through the admission
//! pipeline and gets context fields stamped onto it before it becomes a
//! record.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique, client-generated record identifier
pub type RecordId = String;

/// HTTP header name/value pairs captured at the last upload attempt
pub type HttpHeaders = Vec<(String, String)>;

/// Get current time in Unix milliseconds
pub fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Event latency tier, ordered by urgency
///
/// Governs acquire ordering (more urgent first) and trim priority (less
/// urgent records are evicted first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLatency {
    /// Never uploaded; kept only for local inspection
    Off,
    Normal,
    /// Uploaded when the network is not metered
    CostDeferred,
    RealTime,
    Max,
}

impl EventLatency {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Off => 0,
            Self::Normal => 1,
            Self::CostDeferred => 2,
            Self::RealTime => 3,
            Self::Max => 4,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => Self::Off,
            1 => Self::Normal,
            2 => Self::CostDeferred,
            3 => Self::RealTime,
            _ => Self::Max,
        }
    }

    /// Parse the snake_case name used in config values and metadata filters
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "off" => Some(Self::Off),
            "normal" => Some(Self::Normal),
            "cost_deferred" => Some(Self::CostDeferred),
            "real_time" => Some(Self::RealTime),
            "max" => Some(Self::Max),
            _ => None,
        }
    }
}

/// Persistence class biasing trim away from `Critical` records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPersistence {
    Normal,
    Critical,
}

impl EventPersistence {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Normal => 1,
            Self::Critical => 2,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        if value >= 2 {
            Self::Critical
        } else {
            Self::Normal
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "normal" => Some(Self::Normal),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// PII classification attached to a context or event property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    #[default]
    None,
    DistinguishedName,
    GenericData,
    IpAddress,
    Identity,
    Uri,
}

/// Property value variants supported by the event schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

/// A property value together with its PII tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventProperty {
    pub value: PropertyValue,
    #[serde(default, skip_serializing_if = "is_pii_none")]
    pub pii: PiiKind,
}

fn is_pii_none(pii: &PiiKind) -> bool {
    *pii == PiiKind::None
}

impl EventProperty {
    pub fn str(value: impl Into<String>) -> Self {
        Self {
            value: PropertyValue::Str(value.into()),
            pii: PiiKind::None,
        }
    }

    pub fn int(value: i64) -> Self {
        Self {
            value: PropertyValue::Int(value),
            pii: PiiKind::None,
        }
    }

    pub fn double(value: f64) -> Self {
        Self {
            value: PropertyValue::Double(value),
            pii: PiiKind::None,
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self {
            value: PropertyValue::Bool(value),
            pii: PiiKind::None,
        }
    }

    pub fn with_pii(mut self, pii: PiiKind) -> Self {
        self.pii = pii;
        self
    }
}

/// Pre-serialization event traveling through the admission pipeline
///
/// Properties keep insertion order; `set_property` upserts in place so
/// stamping the same state twice yields an identical event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub name: String,
    pub tenant_token: String,
    /// Diagnostic level; `None` means the emitting logger did not set one
    pub diag_level: Option<u8>,
    pub latency: EventLatency,
    pub persistence: EventPersistence,
    pub timestamp: i64,
    pub properties: Vec<(String, EventProperty)>,
}

impl Event {
    pub fn new(tenant_token: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant_token: tenant_token.into(),
            diag_level: None,
            latency: EventLatency::Normal,
            persistence: EventPersistence::Normal,
            timestamp: current_millis(),
            properties: Vec::new(),
        }
    }

    pub fn with_latency(mut self, latency: EventLatency) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_persistence(mut self, persistence: EventPersistence) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_diag_level(mut self, level: u8) -> Self {
        self.diag_level = Some(level);
        self
    }

    /// Upsert a property, keeping the original insertion position on update
    pub fn set_property(&mut self, name: impl Into<String>, value: EventProperty) {
        let name = name.into();
        match self.properties.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = value,
            None => self.properties.push((name, value)),
        }
    }

    pub fn get_property(&self, name: &str) -> Option<&EventProperty> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Serialize to the opaque payload stored alongside record metadata
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut properties = serde_json::Map::new();
        for (name, prop) in &self.properties {
            properties.insert(name.clone(), serde_json::to_value(prop)?);
        }
        let body = serde_json::json!({
            "name": self.name,
            "timestamp": self.timestamp,
            "properties": properties,
        });
        serde_json::to_vec(&body)
    }
}

/// One serialized telemetry event plus the metadata the store tracks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub id: RecordId,
    pub tenant_token: String,
    pub latency: EventLatency,
    pub persistence: EventPersistence,
    /// Milliseconds since epoch at emit
    pub timestamp: i64,
    pub retry_count: u32,
    /// Lease deadline in Unix milliseconds; present iff currently on lease
    pub reserved_until: Option<i64>,
    pub http_headers: Option<HttpHeaders>,
    pub payload: Vec<u8>,
}

impl StorageRecord {
    pub fn new(
        tenant_token: impl Into<String>,
        latency: EventLatency,
        persistence: EventPersistence,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_token: tenant_token.into(),
            latency,
            persistence,
            timestamp: current_millis(),
            retry_count: 0,
            reserved_until: None,
            http_headers: None,
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<RecordId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this record is selectable by `acquire` at time `now`
    pub fn is_available(&self, now: i64) -> bool {
        match self.reserved_until {
            None => true,
            Some(deadline) => deadline <= now,
        }
    }
}
