//! Advancement API boundary + payload adapters.
//!
//! The network client that talks to the advancement API lives outside this
//! workspace; [`AdvancementSource`] is the contract it fulfils. Everything the
//! sync pipeline needs to turn the opaque JSON payloads into core records
//! (tree flattening, field aliases, list mapping) lives here.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod fields;
pub mod fixture;
pub mod payloads;
pub mod tree;

pub use fixture::FixtureSource;
pub use payloads::{
    merit_badge_definition_version, parse_leadership, parse_rank_catalog,
    parse_youth_merit_badges, parse_youth_ranks, profile_birthdate,
};
pub use tree::{
    flatten_requirements, requirement_roots, Flattened, MeritBadgeCompletionShape,
    MeritBadgeDefinitionShape, RankCompletionShape, RankDefinitionShape, TreeShape,
};

pub const CRATE_NAME: &str = "troop-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Credentials rejected or the bearer token expired; no further call can succeed.
    #[error("authentication failed{}: {message}", http_suffix(.status))]
    Authentication { status: Option<u16>, message: String },
    #[error("http status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected payload: {0}")]
    Payload(String),
}

impl ApiError {
    /// Classify a non-success HTTP status; 401 and 403 are authentication failures.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            401 | 403 => Self::Authentication {
                status: Some(status),
                message,
            },
            _ => Self::Http { status, message },
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Authentication { status, .. } => *status,
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (http {s})")).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("{what}: unexpected {found} payload")]
    UnexpectedShape {
        what: &'static str,
        found: &'static str,
    },
    #[error("{what}: object carries none of {}", .keys.join(", "))]
    MissingList {
        what: &'static str,
        keys: &'static [&'static str],
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub token: String,
    pub user_id: Option<String>,
}

/// Calls the sync pipeline makes against the advancement API.
///
/// Every method returns the endpoint's JSON body untouched. Implementations
/// must report rejected or expired credentials as
/// [`ApiError::Authentication`]; the orchestrator aborts on that kind and
/// continues past every other error.
#[async_trait]
pub trait AdvancementSource: Send + Sync {
    async fn authenticate(&mut self, username: &str, password: &str)
        -> Result<AuthSession, ApiError>;

    async fn get_ranks(&self, program_id: i64) -> Result<JsonValue, ApiError>;

    async fn get_rank_requirements(&self, rank_id: i64) -> Result<JsonValue, ApiError>;

    async fn get_youth_ranks(&self, user_id: &str) -> Result<JsonValue, ApiError>;

    async fn get_youth_rank_requirements(
        &self,
        user_id: &str,
        rank_id: i64,
    ) -> Result<JsonValue, ApiError>;

    async fn get_youth_merit_badges(&self, user_id: &str) -> Result<JsonValue, ApiError>;

    async fn get_mb_requirements(&self, mb_id: i64) -> Result<JsonValue, ApiError>;

    async fn get_youth_mb_requirements(
        &self,
        user_id: &str,
        mb_id: i64,
    ) -> Result<JsonValue, ApiError>;

    async fn get_leadership_history(&self, user_id: &str) -> Result<JsonValue, ApiError>;

    async fn get_person_profile(&self, user_id: &str) -> Result<JsonValue, ApiError>;
}
