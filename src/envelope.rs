//! Wire-level event envelopes.
//!
//! Every frame on a stream is a flat JSON object with at least a `type`. The
//! known tags map onto [`EventKind`]; anything else is kept verbatim as
//! [`EventKind::Unknown`] so newer backends never break older clients.

use crate::constants::{CACHE_MISS_REDIRECT_TYPE, TERMINAL_ERROR_TYPE};
use crate::types::{Result, VantageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Connected,
    Heartbeat,
    Progress,
    AnalysisStarted,
    CacheHit,
    CacheMiss,
    CacheMissRedirect,
    NodeExecution,
    SearchProgress,
    InsightDiscovered,
    OpportunityGenerated,
    AnalysisCompleted,
    StreamCompleted,
    StreamingComplete,
    Error,
    Unknown(String),
}

impl EventKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "connected" => EventKind::Connected,
            "heartbeat" | "keepalive" => EventKind::Heartbeat,
            "progress" => EventKind::Progress,
            "analysis_started" => EventKind::AnalysisStarted,
            "cache_hit" => EventKind::CacheHit,
            "cache_miss" => EventKind::CacheMiss,
            CACHE_MISS_REDIRECT_TYPE => EventKind::CacheMissRedirect,
            "node_execution" => EventKind::NodeExecution,
            "search_progress" => EventKind::SearchProgress,
            "insight_discovered" => EventKind::InsightDiscovered,
            "opportunity_generated" => EventKind::OpportunityGenerated,
            "analysis_completed" => EventKind::AnalysisCompleted,
            "stream_completed" => EventKind::StreamCompleted,
            "streaming_complete" => EventKind::StreamingComplete,
            TERMINAL_ERROR_TYPE => EventKind::Error,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Progress => "progress",
            EventKind::AnalysisStarted => "analysis_started",
            EventKind::CacheHit => "cache_hit",
            EventKind::CacheMiss => "cache_miss",
            EventKind::CacheMissRedirect => CACHE_MISS_REDIRECT_TYPE,
            EventKind::NodeExecution => "node_execution",
            EventKind::SearchProgress => "search_progress",
            EventKind::InsightDiscovered => "insight_discovered",
            EventKind::OpportunityGenerated => "opportunity_generated",
            EventKind::AnalysisCompleted => "analysis_completed",
            EventKind::StreamCompleted => "stream_completed",
            EventKind::StreamingComplete => "streaming_complete",
            EventKind::Error => TERMINAL_ERROR_TYPE,
            EventKind::Unknown(tag) => tag,
        }
    }

    pub fn is_terminal_success(&self) -> bool {
        matches!(
            self,
            EventKind::AnalysisCompleted | EventKind::StreamCompleted | EventKind::StreamingComplete
        )
    }

    /// Kinds after which the server sends nothing further on this connection.
    pub fn is_terminal(&self) -> bool {
        self.is_terminal_success()
            || matches!(self, EventKind::Error | EventKind::CacheMissRedirect)
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        EventKind::from_tag(&s)
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub message: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_progress",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress: Option<u8>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub sequence: Option<u64>,
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub event_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub cached: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub cost_saved: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_hit: Option<bool>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Identity used to recognise the same envelope arriving twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    EventId(String),
    Sequence(u64),
    /// Canonical JSON of the whole envelope: type, message, timestamp,
    /// progress and every other field. Only a byte-for-byte repeat matches.
    Content(String),
}

impl EventEnvelope {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            message: None,
            progress: None,
            timestamp: Some(Utc::now().to_rfc3339()),
            sequence: None,
            event_id: None,
            cached: None,
            cost_saved: None,
            cache_hit: None,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    pub fn with_cost_saved(mut self, cost: f64) -> Self {
        self.cost_saved = Some(cost);
        self
    }

    /// Parses one SSE `data` payload.
    ///
    /// `event_name` is the SSE `event:` field; it supplies the type when the
    /// JSON object carries none. `sse_id` fills `event_id` the same way.
    pub fn parse(data: &str, event_name: Option<&str>, sse_id: Option<&str>) -> Result<Self> {
        let mut value: Value = serde_json::from_str(data)?;
        let object = match value.as_object_mut() {
            Some(o) => o,
            None => {
                return Err(VantageError::Protocol("envelope is not a JSON object".into()).into())
            }
        };

        let has_type = matches!(object.get("type"), Some(Value::String(t)) if !t.is_empty());
        if !has_type {
            match event_name {
                Some(name) if !name.is_empty() && name != "message" => {
                    object.insert("type".into(), Value::String(name.to_string()));
                }
                _ => {
                    return Err(VantageError::Protocol("envelope has no type".into()).into());
                }
            }
        }

        if !object.contains_key("event_id") {
            if let Some(id) = sse_id.filter(|id| !id.is_empty()) {
                object.insert("event_id".into(), Value::String(id.to_string()));
            }
        }

        Ok(serde_json::from_value(value)?)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    pub fn dedup_key(&self) -> DedupKey {
        if let Some(id) = &self.event_id {
            return DedupKey::EventId(id.clone());
        }
        if let Some(seq) = self.sequence {
            return DedupKey::Sequence(seq);
        }
        // extra is a sorted map, so equal envelopes serialize identically
        let body = serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self));
        DedupKey::Content(body)
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Human-readable text of an insight or opportunity event.
    pub fn insight_text(&self) -> Option<String> {
        for key in ["insight", "opportunity", "title"] {
            if let Some(text) = self.extra.get(key).and_then(|v| v.as_str()) {
                return Some(text.to_string());
            }
        }
        self.message.clone()
    }
}

// Known fields tolerate odd JSON types: an unusable value reads as absent
// rather than failing the whole frame.

fn lenient_progress<'de, D>(deserializer: D) -> std::result::Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let number = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(number
        .filter(|n| n.is_finite())
        .map(|n| n.round().clamp(0.0, 100.0) as u8))
}

fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_text<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    })
}

fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let number = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().trim_start_matches('$').parse::<f64>().ok(),
        _ => None,
    };
    Ok(number.filter(|n| n.is_finite()))
}

fn lenient_bool<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    })
}
