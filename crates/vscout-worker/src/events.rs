//! Event processing: raw per-chunk analysis output to canonical events.
//!
//! Absolute time is the chunk's start plus the reported chunk-relative
//! time, so an event seen by two overlapping chunks lands on (nearly) the
//! same absolute second. Identities are hashes of the reported attributes,
//! which keeps them stable across chunks and retries without a central
//! allocator. Deduplication buckets absolute time into 5 second windows.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, warn};
use vscout_models::{
    format_seconds, parse_timestamp, sort_by_timeline, EventType, IdentifiedEntity, JobId, ProcessedEvent, RawEvent,
};

/// Width of the dedup time bucket in seconds.
pub const DEDUP_BUCKET_SECS: f64 = 5.0;

/// Placeholder entity component of a dedup key for events with no team or player.
const NO_ENTITY: &str = "none";

/// Where a chunk sits on the source video's timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkWindow {
    pub sequence: u32,
    pub start_secs: f64,
    pub duration_secs: f64,
    /// Leading seconds shared with the previous chunk
    pub overlap_secs: f64,
}

impl ChunkWindow {
    pub fn end_secs(&self) -> f64 {
        self.start_secs + self.duration_secs
    }

    /// Whether an absolute time falls in the part this chunk shares with
    /// its predecessor.
    pub fn in_leading_overlap(&self, absolute_secs: f64) -> bool {
        self.sequence > 0 && absolute_secs < self.start_secs + self.overlap_secs
    }
}

/// Everything one call needs. `seen_keys` and `known_entities` carry state
/// across calls for the same job and are updated in place.
pub struct EventInput<'a> {
    pub job_id: &'a JobId,
    pub window: ChunkWindow,
    pub raw_events: &'a [RawEvent],
    pub seen_keys: &'a mut HashSet<String>,
    pub known_entities: &'a mut HashMap<String, IdentifiedEntity>,
}

/// Result of processing one chunk's raw events.
#[derive(Debug, Default)]
pub struct ProcessedBatch {
    /// Newly accepted events ordered by absolute time
    pub events: Vec<ProcessedEvent>,
    /// Entities first seen in this batch
    pub new_entities: Vec<IdentifiedEntity>,
    pub unknown_type: usize,
    pub duplicates: usize,
    pub errors: usize,
    /// Accepted events that fell in the leading overlap
    pub overlap_accepted: usize,
}

impl ProcessedBatch {
    pub fn dropped(&self) -> usize {
        self.unknown_type + self.duplicates + self.errors
    }
}

/// Dedup key: `{type}:{floor(abs / 5)}:{entity}`.
pub fn dedup_key(event_type: EventType, absolute_secs: f64, entity: Option<&str>) -> String {
    let bucket = (absolute_secs / DEDUP_BUCKET_SECS).floor() as i64;
    format!("{}:{}:{}", event_type.as_str(), bucket, entity.unwrap_or(NO_ENTITY))
}

enum Outcome {
    Accepted(Box<ProcessedEvent>),
    UnknownType,
    Duplicate,
}

/// Convert one chunk's raw events into canonical, deduplicated events.
pub fn process_events(input: EventInput<'_>) -> ProcessedBatch {
    let EventInput {
        job_id,
        window,
        raw_events,
        seen_keys,
        known_entities,
    } = input;

    let mut batch = ProcessedBatch::default();

    for (index, raw) in raw_events.iter().enumerate() {
        match process_one(job_id, &window, raw, seen_keys, known_entities, &mut batch.new_entities) {
            Ok(Outcome::Accepted(event)) => {
                if window.in_leading_overlap(event.timestamp_secs) {
                    batch.overlap_accepted += 1;
                }
                batch.events.push(*event);
            }
            Ok(Outcome::UnknownType) => {
                debug!(job_id = %job_id, sequence = window.sequence, event_type = %raw.event_type, "Dropping event outside vocabulary");
                batch.unknown_type += 1;
            }
            Ok(Outcome::Duplicate) => batch.duplicates += 1,
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    sequence = window.sequence,
                    index,
                    "Skipping event: {}",
                    e
                );
                batch.errors += 1;
            }
        }
    }

    sort_by_timeline(&mut batch.events);
    batch
}

fn process_one(
    job_id: &JobId,
    window: &ChunkWindow,
    raw: &RawEvent,
    seen_keys: &mut HashSet<String>,
    known_entities: &mut HashMap<String, IdentifiedEntity>,
    new_entities: &mut Vec<IdentifiedEntity>,
) -> Result<Outcome, String> {
    let Ok(event_type) = raw.event_type.parse::<EventType>() else {
        return Ok(Outcome::UnknownType);
    };

    let relative = parse_timestamp(&raw.timestamp).map_err(|e| e.to_string())?;
    let absolute = window.start_secs + relative;
    if !absolute.is_finite() {
        return Err(format!("timestamp '{}' is out of range", raw.timestamp));
    }

    let team_id = resolve_team(job_id, window.sequence, raw, known_entities, new_entities);
    let player_id = resolve_player(job_id, window.sequence, raw, team_id.as_deref(), known_entities, new_entities);

    let key = dedup_key(event_type, absolute, player_id.as_deref().or(team_id.as_deref()));
    if !seen_keys.insert(key.clone()) {
        return Ok(Outcome::Duplicate);
    }

    Ok(Outcome::Accepted(Box::new(ProcessedEvent {
        id: ProcessedEvent::id_for_key(&key),
        job_id: job_id.clone(),
        event_type,
        timestamp_secs: absolute,
        timestamp: format_seconds(absolute),
        player_id,
        team_id,
        description: raw.description.clone(),
        confidence: raw.confidence,
        chunk_sequence: window.sequence,
        window_start_secs: window.start_secs,
        window_end_secs: window.end_secs(),
        dedup_key: key,
        created_at: Utc::now(),
    })))
}

fn remember(
    entity: IdentifiedEntity,
    known_entities: &mut HashMap<String, IdentifiedEntity>,
    new_entities: &mut Vec<IdentifiedEntity>,
) -> String {
    let id = entity.id.clone();
    if !known_entities.contains_key(&id) {
        known_entities.insert(id.clone(), entity.clone());
        new_entities.push(entity);
    }
    id
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

fn resolve_team(
    job_id: &JobId,
    sequence: u32,
    raw: &RawEvent,
    known_entities: &mut HashMap<String, IdentifiedEntity>,
    new_entities: &mut Vec<IdentifiedEntity>,
) -> Option<String> {
    let side = non_blank(&raw.team_side);
    let color = non_blank(&raw.jersey_color);
    let description = non_blank(&raw.team_description);
    if side.is_none() && color.is_none() && description.is_none() {
        return None;
    }
    let team = IdentifiedEntity::team(job_id.clone(), side, color, description, sequence);
    Some(remember(team, known_entities, new_entities))
}

fn resolve_player(
    job_id: &JobId,
    sequence: u32,
    raw: &RawEvent,
    team_id: Option<&str>,
    known_entities: &mut HashMap<String, IdentifiedEntity>,
    new_entities: &mut Vec<IdentifiedEntity>,
) -> Option<String> {
    let player = IdentifiedEntity::player(
        job_id.clone(),
        team_id.map(str::to_string),
        non_blank(&raw.jersey_number),
        non_blank(&raw.player_description),
        sequence,
    )?;
    Some(remember(player, known_entities, new_entities))
}
