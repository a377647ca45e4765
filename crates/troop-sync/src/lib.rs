//! Sync orchestration: one full pass from the advancement API into the troop store.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};
use troop_core::{ProgressEvent, ProgressKind, SCOUTS_BSA_PROGRAM_ID};
use uuid::Uuid;

pub mod cache;
pub mod orchestrator;

pub use cache::DefinitionCache;
pub use orchestrator::SyncOrchestrator;

pub const CRATE_NAME: &str = "troop-sync";

#[derive(Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub troop_name: String,
    /// Program whose ranks are prefetched and whose in-progress ranks get requirement detail.
    pub program_id: i64,
    /// Skip both per-requirement detail steps.
    pub skip_requirements: bool,
    pub username: String,
    pub password: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("TROOP_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./scouting_troop.db")),
            troop_name: std::env::var("TROOP_NAME").unwrap_or_else(|_| "My Troop".to_string()),
            program_id: std::env::var("TROOP_PROGRAM_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(SCOUTS_BSA_PROGRAM_ID),
            skip_requirements: std::env::var("TROOP_SKIP_REQS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            username: std::env::var("SCOUTING_USERNAME").unwrap_or_default(),
            password: std::env::var("SCOUTING_PASSWORD").unwrap_or_default(),
        }
    }

    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            troop_name: "My Troop".to_string(),
            program_id: SCOUTS_BSA_PROGRAM_ID,
            skip_requirements: false,
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("db_path", &self.db_path)
            .field("troop_name", &self.troop_name)
            .field("program_id", &self.program_id)
            .field("skip_requirements", &self.skip_requirements)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Authenticating,
    InitializingStore,
    SyncingReferenceData,
    ImportingRoster,
    SyncingScouts,
    Done,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authenticating => "authenticating",
            Self::InitializingStore => "initializing_store",
            Self::SyncingReferenceData => "syncing_reference_data",
            Self::ImportingRoster => "importing_roster",
            Self::SyncingScouts => "syncing_scouts",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The six fault-isolated fetch-and-merge steps run for every scout, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoutStep {
    Ranks,
    RankRequirements,
    MeritBadges,
    MeritBadgeRequirements,
    Leadership,
    Profile,
}

impl ScoutStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ranks => "ranks",
            Self::RankRequirements => "rank requirements",
            Self::MeritBadges => "merit badges",
            Self::MeritBadgeRequirements => "merit badge requirements",
            Self::Leadership => "leadership",
            Self::Profile => "profile",
        }
    }
}

impl fmt::Display for ScoutStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of the ordered progress stream.
pub trait ProgressSink: Send {
    fn emit(&mut self, event: ProgressEvent);
}

impl ProgressSink for Vec<ProgressEvent> {
    fn emit(&mut self, event: ProgressEvent) {
        self.push(event);
    }
}

impl ProgressSink for UnboundedSender<ProgressEvent> {
    fn emit(&mut self, event: ProgressEvent) {
        // A dropped receiver means nobody is watching; the run goes on.
        let _ = self.send(event);
    }
}

/// Forwards progress events into `tracing` for callers without a UI.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn emit(&mut self, event: ProgressEvent) {
        match event.kind {
            ProgressKind::Step => info!(kind = "step", "{}", event.text),
            ProgressKind::Log => info!(kind = "log", "{}", event.text),
            ProgressKind::Error => error!(kind = "error", "{}", event.text),
            ProgressKind::Complete => info!(kind = "complete", location = %event.text, "sync complete"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub db_path: String,
    pub ranks_stored: usize,
    pub roster_imported: Option<usize>,
    pub roster_skipped: Option<usize>,
    pub scouts_total: usize,
    pub scouts_synced: usize,
    /// Requirement definition trees fetched during the run (each at most once).
    pub definitions_fetched: usize,
    pub warnings: usize,
    /// Stopped early by the cancellation signal, between two scouts.
    pub cancelled: bool,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Credentials rejected, or the token expired mid-run. Writes that landed
    /// before the failure are kept.
    #[error("authentication failed during {phase}: {message}")]
    Authentication {
        phase: SyncPhase,
        last_completed: Option<String>,
        message: String,
        warnings: usize,
    },
    #[error("store failure during {phase}: {source:#}")]
    Store {
        phase: SyncPhase,
        #[source]
        source: anyhow::Error,
    },
}

impl SyncError {
    pub fn phase(&self) -> SyncPhase {
        match self {
            Self::Authentication { phase, .. } | Self::Store { phase, .. } => *phase,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_debug_hides_password() {
        let config = SyncConfig::new("troop.db").with_credentials("scoutmaster", "hunter2");
        let rendered = format!("{config:?}");
        assert!(rendered.contains("scoutmaster"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn config_defaults_follow_the_base_program() {
        let config = SyncConfig::new("troop.db");
        assert_eq!(config.program_id, SCOUTS_BSA_PROGRAM_ID);
        assert_eq!(config.troop_name, "My Troop");
        assert!(!config.skip_requirements);
    }

    #[test]
    fn channel_sink_tolerates_a_closed_receiver() {
        let (mut tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        tx.emit(ProgressEvent::log("nobody listening"));
    }

    #[test]
    fn sync_error_reports_phase() {
        let err = SyncError::Authentication {
            phase: SyncPhase::SyncingScouts,
            last_completed: Some("scout 1002: profile".into()),
            message: "token expired".into(),
            warnings: 1,
        };
        assert_eq!(err.phase(), SyncPhase::SyncingScouts);
        assert!(err.is_authentication());
        assert_eq!(
            err.to_string(),
            "authentication failed during syncing_scouts: token expired"
        );
    }
}
