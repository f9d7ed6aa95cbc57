//! Team and player identities.
//!
//! Analysis output only describes who did something ("home side, red
//! shirts, number 23"). Identities are minted by hashing the normalized
//! description, so the same description observed in any chunk maps to
//! the same id. Near-identical free text ("dark blue" vs "navy") still
//! yields distinct ids.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::job_status::UnknownStatus;
use crate::utils::{normalize_text, short_id};
use crate::JobId;

/// Placeholder team component for players with no team attributes.
pub const UNASSIGNED_TEAM: &str = "unassigned";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Team,
    Player,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Team => "team",
            EntityKind::Player => "player",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "team" => Ok(EntityKind::Team),
            "player" => Ok(EntityKind::Player),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A team or player identity accumulated for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IdentifiedEntity {
    pub id: String,
    pub kind: EntityKind,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jersey_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Owning team, for players
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub first_seen_chunk: u32,
    pub created_at: DateTime<Utc>,
}

impl IdentifiedEntity {
    /// Deterministic team id from side and color (or free-text description
    /// when no color was reported).
    pub fn team_id(side: Option<&str>, color_or_description: Option<&str>) -> String {
        let side = side.map(normalize_text).unwrap_or_default();
        let look = color_or_description.map(normalize_text).unwrap_or_default();
        short_id("team", &["team", &side, &look])
    }

    /// Deterministic player id from the owning team and jersey number (or
    /// free-text description when no number was reported).
    pub fn player_id(team_id: Option<&str>, jersey_or_description: &str) -> String {
        let team = team_id.unwrap_or(UNASSIGNED_TEAM);
        let marker = normalize_text(jersey_or_description);
        short_id("player", &["player", team, &marker])
    }

    pub fn team(
        job_id: JobId,
        side: Option<String>,
        color: Option<String>,
        description: Option<String>,
        first_seen_chunk: u32,
    ) -> Self {
        let id = Self::team_id(side.as_deref(), color.as_deref().or(description.as_deref()));
        Self {
            id,
            kind: EntityKind::Team,
            job_id,
            side,
            color,
            jersey_number: None,
            description,
            team_id: None,
            first_seen_chunk,
            created_at: Utc::now(),
        }
    }

    pub fn player(
        job_id: JobId,
        team_id: Option<String>,
        jersey_number: Option<String>,
        description: Option<String>,
        first_seen_chunk: u32,
    ) -> Option<Self> {
        let marker = jersey_number.as_deref().or(description.as_deref())?;
        let id = Self::player_id(team_id.as_deref(), marker);
        Some(Self {
            id,
            kind: EntityKind::Player,
            job_id,
            side: None,
            color: None,
            jersey_number,
            description,
            team_id,
            first_seen_chunk,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_id_ignores_case_and_spacing() {
        let a = IdentifiedEntity::team_id(Some("home"), Some("Red"));
        let b = IdentifiedEntity::team_id(Some(" HOME "), Some("red "));
        assert_eq!(a, b);
    }

    #[test]
    fn test_team_id_differs_by_color_and_side() {
        let red = IdentifiedEntity::team_id(Some("home"), Some("red"));
        let blue = IdentifiedEntity::team_id(Some("home"), Some("blue"));
        let away_red = IdentifiedEntity::team_id(Some("away"), Some("red"));
        assert_ne!(red, blue);
        assert_ne!(red, away_red);
    }

    #[test]
    fn test_player_id_scoped_to_team() {
        let home = IdentifiedEntity::team_id(Some("home"), Some("red"));
        let away = IdentifiedEntity::team_id(Some("away"), Some("blue"));
        assert_ne!(
            IdentifiedEntity::player_id(Some(&home), "23"),
            IdentifiedEntity::player_id(Some(&away), "23")
        );
        assert_eq!(
            IdentifiedEntity::player_id(Some(&home), "23"),
            IdentifiedEntity::player_id(Some(&home), " 23")
        );
    }

    #[test]
    fn test_player_requires_a_marker() {
        let job = JobId::from_string("job_1");
        assert!(IdentifiedEntity::player(job.clone(), None, None, None, 0).is_none());
        let player = IdentifiedEntity::player(job, None, None, Some("tall goalkeeper".into()), 2).unwrap();
        assert_eq!(player.kind, EntityKind::Player);
        assert_eq!(player.id, IdentifiedEntity::player_id(None, "tall goalkeeper"));
    }
}
