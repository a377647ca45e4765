//! Core domain model for troop advancement sync.
//!
//! These types are the handoff contract between the payload adapters, the
//! SQLite store, the sync orchestrator and the analytics queries. They carry
//! no persistence or network behavior of their own.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "troop-core";

/// Program id of the Scouts BSA rank ladder (Scout through Eagle).
pub const SCOUTS_BSA_PROGRAM_ID: i64 = 2;

/// Merit badges counted toward the Eagle rank.
pub const EAGLE_REQUIRED_MERIT_BADGES: [&str; 18] = [
    "Camping",
    "Citizenship in the Community",
    "Citizenship in the Nation",
    "Citizenship in the World",
    "Citizenship in Society",
    "Communication",
    "Cooking",
    "Emergency Preparedness",
    "Environmental Science",
    "Family Life",
    "First Aid",
    "Lifesaving",
    "Hiking",
    "Cycling",
    "Personal Fitness",
    "Personal Management",
    "Sustainability",
    "Swimming",
];

pub fn is_eagle_required_name(name: &str) -> bool {
    EAGLE_REQUIRED_MERIT_BADGES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name.trim()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvancementStatus {
    Completed,
    InProgress,
}

impl AdvancementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::InProgress => "in_progress",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "in_progress" => Some(Self::InProgress),
            _ => None,
        }
    }

    /// An advancement with no completion date recorded is in progress.
    pub fn from_completion_date(date: Option<&str>) -> Self {
        match date {
            Some(d) if !d.trim().is_empty() => Self::Completed,
            _ => Self::InProgress,
        }
    }
}

impl fmt::Display for AdvancementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvancementType {
    Rank,
    Award,
}

impl AdvancementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rank => "rank",
            Self::Award => "award",
        }
    }
}

/// A named, ordered advancement level within a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rank {
    pub id: i64,
    pub name: String,
    pub level: i64,
    pub program_id: i64,
    pub program: Option<String>,
    pub image_url: Option<String>,
    pub version: Option<String>,
    pub active: bool,
    pub raw_json: Option<String>,
}

/// Scoping key a requirement tree is read and written under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequirementScope {
    Rank { rank_id: i64 },
    MeritBadge { mb_api_id: i64, version_id: String },
}

impl fmt::Display for RequirementScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rank { rank_id } => write!(f, "rank {rank_id}"),
            Self::MeritBadge {
                mb_api_id,
                version_id,
            } => write!(f, "merit badge {mb_api_id} v{version_id}"),
        }
    }
}

/// Rank-specific thresholds, non-null only on the node that carries them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementThresholds {
    pub eagle_mb_required: Option<i64>,
    pub total_mb_required: Option<i64>,
    pub service_hours_required: Option<i64>,
    pub months_since_last_rank: Option<i64>,
}

impl RequirementThresholds {
    pub fn is_empty(&self) -> bool {
        self.eagle_mb_required.is_none()
            && self.total_mb_required.is_none()
            && self.service_hours_required.is_none()
            && self.months_since_last_rank.is_none()
    }
}

/// One node of a rank or merit badge requirement definition tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementDefinition {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub requirement_number: Option<String>,
    pub list_number: Option<String>,
    pub short: Option<String>,
    pub name: Option<String>,
    pub required: bool,
    /// How many children must be satisfied ("choose N of M").
    pub children_required: Option<i64>,
    pub sort_order: Option<String>,
    pub thresholds: RequirementThresholds,
    pub raw_json: String,
}

/// One node of a per-scout completion tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementCompletion {
    pub requirement_id: i64,
    pub parent_id: Option<i64>,
    pub completed: bool,
    pub date_completed: Option<String>,
    pub raw_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeritBadge {
    pub name: String,
    pub is_eagle_required: bool,
    pub image_url: Option<String>,
    pub active: bool,
}

/// Partial scout attributes contributed by a roster import or a profile fetch.
///
/// `None` fields never erase stored values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoutUpsert {
    pub user_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub member_id: Option<String>,
    pub patrol: Option<String>,
    pub birthdate: Option<String>,
}

impl ScoutUpsert {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scout {
    pub user_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub member_id: Option<String>,
    pub patrol: Option<String>,
    pub current_rank_id: Option<i64>,
    pub birthdate: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Scout {
    pub fn display_name(&self) -> String {
        display_name(
            self.first_name.as_deref(),
            self.last_name.as_deref(),
            &self.user_id,
        )
    }
}

/// "First Last", falling back to the user id when both names are blank.
pub fn display_name(first: Option<&str>, last: Option<&str>, user_id: &str) -> String {
    let full = format!("{} {}", first.unwrap_or_default(), last.unwrap_or_default());
    let full = full.trim();
    if full.is_empty() {
        user_id.to_string()
    } else {
        full.to_string()
    }
}

/// A rank as it appears in one scout's rank summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YouthRank {
    pub rank: Rank,
    pub date_earned: Option<String>,
    pub raw_json: String,
}

impl YouthRank {
    pub fn status(&self) -> AdvancementStatus {
        AdvancementStatus::from_completion_date(self.date_earned.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoutAdvancement {
    pub advancement_type: AdvancementType,
    pub advancement_id: i64,
    pub advancement_name: Option<String>,
    pub status: AdvancementStatus,
    pub date_completed: Option<String>,
    pub date_started: Option<String>,
    pub raw_json: Option<String>,
}

/// A merit badge as it appears in one scout's merit badge summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YouthMeritBadge {
    pub name: String,
    pub mb_api_id: Option<i64>,
    pub version_id: Option<String>,
    pub is_eagle_required: bool,
    pub image_url: Option<String>,
    pub date_completed: Option<String>,
    pub date_started: Option<String>,
    pub raw_json: String,
}

impl YouthMeritBadge {
    pub fn status(&self) -> AdvancementStatus {
        AdvancementStatus::from_completion_date(self.date_completed.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipPosition {
    pub position: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub unit: Option<String>,
    pub patrol: Option<String>,
    pub days_in_position: Option<i64>,
    pub approved: bool,
    pub raw_json: String,
}

/// One roster line as handed over by the roster importer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterRow {
    pub user_id: Option<String>,
    pub member_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub patrol: Option<String>,
    /// Membership type column, when the export carries one (e.g. `YOUTH`).
    pub member_type: Option<String>,
}

impl RosterRow {
    /// The user id when present, otherwise the member id.
    pub fn primary_id(&self) -> Option<&str> {
        non_blank(self.user_id.as_deref()).or_else(|| non_blank(self.member_id.as_deref()))
    }

    pub fn is_youth(&self) -> bool {
        match non_blank(self.member_type.as_deref()) {
            Some(kind) => kind.eq_ignore_ascii_case("youth"),
            None => true,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    /// Major phase boundary.
    Step,
    Log,
    Error,
    /// Terminal success; the text is the store location.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub text: String,
}

impl ProgressEvent {
    pub fn step(text: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Step,
            text: text.into(),
        }
    }

    pub fn log(text: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Log,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Error,
            text: text.into(),
        }
    }

    pub fn complete(location: impl Into<String>) -> Self {
        Self {
            kind: ProgressKind::Complete,
            text: location.into(),
        }
    }
}
