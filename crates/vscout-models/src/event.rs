//! Raw analysis events and canonical processed events.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::short_id;
use crate::JobId;

/// Gameplay event vocabulary. Anything outside it is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Shot,
    Goal,
    Pass,
    Assist,
    Rebound,
    Steal,
    Block,
    Foul,
    Turnover,
    Substitution,
    Timeout,
    PeriodStart,
    PeriodEnd,
}

impl EventType {
    pub const ALL: [EventType; 13] = [
        EventType::Shot,
        EventType::Goal,
        EventType::Pass,
        EventType::Assist,
        EventType::Rebound,
        EventType::Steal,
        EventType::Block,
        EventType::Foul,
        EventType::Turnover,
        EventType::Substitution,
        EventType::Timeout,
        EventType::PeriodStart,
        EventType::PeriodEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Shot => "shot",
            EventType::Goal => "goal",
            EventType::Pass => "pass",
            EventType::Assist => "assist",
            EventType::Rebound => "rebound",
            EventType::Steal => "steal",
            EventType::Block => "block",
            EventType::Foul => "foul",
            EventType::Turnover => "turnover",
            EventType::Substitution => "substitution",
            EventType::Timeout => "timeout",
            EventType::PeriodStart => "period_start",
            EventType::PeriodEnd => "period_end",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event type '{0}' is not in the vocabulary")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    /// Accepts any casing and `-`/space separators ("Period Start",
    /// "period-start").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        EventType::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == normalized)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// One event as reported by the analysis service for a single chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RawEvent {
    #[serde(alias = "type")]
    pub event_type: String,
    /// Chunk-relative time (`SS`, `MM:SS` or `HH:MM:SS`)
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_side: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jersey_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jersey_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// A canonical, deduplicated event on the job's absolute timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProcessedEvent {
    /// Stable id derived from the dedup key
    pub id: String,
    pub job_id: JobId,
    pub event_type: EventType,
    /// Seconds from the start of the source video
    pub timestamp_secs: f64,
    /// `HH:MM:SS[.mmm]` rendering of `timestamp_secs`
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub chunk_sequence: u32,
    pub window_start_secs: f64,
    pub window_end_secs: f64,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
}

impl ProcessedEvent {
    /// Event id for a dedup key. Store layers key events by this id, so a
    /// duplicate key can never be written twice.
    pub fn id_for_key(dedup_key: &str) -> String {
        short_id("evt", &[dedup_key])
    }
}

/// Order events by absolute time, breaking ties by id for stability.
pub fn sort_by_timeline(events: &mut [ProcessedEvent]) {
    events.sort_by(|a, b| {
        a.timestamp_secs
            .total_cmp(&b.timestamp_secs)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_parsing_normalizes() {
        assert_eq!("Goal".parse::<EventType>().unwrap(), EventType::Goal);
        assert_eq!("period start".parse::<EventType>().unwrap(), EventType::PeriodStart);
        assert_eq!("Period-End".parse::<EventType>().unwrap(), EventType::PeriodEnd);
        assert!("celebration".parse::<EventType>().is_err());
    }

    #[test]
    fn test_raw_event_accepts_type_alias() {
        let raw: RawEvent =
            serde_json::from_str(r#"{"type": "shot", "timestamp": "01:05", "jersey_number": "9"}"#).unwrap();
        assert_eq!(raw.event_type, "shot");
        assert_eq!(raw.jersey_number.as_deref(), Some("9"));
        assert!(raw.team_side.is_none());
    }

    #[test]
    fn test_id_for_key_is_stable() {
        assert_eq!(ProcessedEvent::id_for_key("goal:12:team_x"), ProcessedEvent::id_for_key("goal:12:team_x"));
        assert_ne!(ProcessedEvent::id_for_key("goal:12:team_x"), ProcessedEvent::id_for_key("goal:13:team_x"));
    }
}
