//! Fixture-first [`AdvancementSource`] backed by JSON files on disk.
//!
//! Layout under the fixture root:
//!
//! ```text
//! auth.json                                   {"username", "password", "token", "account": {"userId"}}
//! ranks.json
//! rank_requirements/<rank_id>.json
//! merit_badge_requirements/<mb_id>.json
//! youth/<user_id>/ranks.json
//! youth/<user_id>/ranks/<rank_id>/requirements.json
//! youth/<user_id>/merit_badges.json
//! youth/<user_id>/merit_badges/<mb_id>/requirements.json
//! youth/<user_id>/leadership.json
//! youth/<user_id>/profile.json
//! ```
//!
//! A missing file answers like a 404. Youth endpoints answer 401 until
//! [`AdvancementSource::authenticate`] has succeeded.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{AdvancementSource, ApiError, AuthSession};

#[derive(Debug, Clone, Deserialize)]
struct FixtureAuth {
    username: String,
    password: String,
    token: String,
    #[serde(default)]
    account: Option<FixtureAccount>,
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureAccount {
    #[serde(rename = "userId")]
    user_id: JsonValue,
}

#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
    token: Option<String>,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            token: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn public(&self, rel: impl AsRef<Path>) -> Result<JsonValue, ApiError> {
        let path = self.root.join(rel);
        if !path.exists() {
            return Err(ApiError::Http {
                status: 404,
                message: format!("no fixture at {}", path.display()),
            });
        }
        read_json_file(&path).map_err(|err| ApiError::Payload(format!("{err:#}")))
    }

    fn youth(&self, user_id: &str, rel: impl AsRef<Path>) -> Result<JsonValue, ApiError> {
        if self.token.is_none() {
            return Err(ApiError::from_status(401, "not authenticated"));
        }
        self.public(Path::new("youth").join(user_id).join(rel))
    }
}

fn read_json_file(path: &Path) -> Result<JsonValue> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl AdvancementSource for FixtureSource {
    async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<AuthSession, ApiError> {
        let path = self.root.join("auth.json");
        let auth: FixtureAuth = read_json_file(&path)
            .and_then(|value| serde_json::from_value(value).context("decoding auth.json"))
            .map_err(|err| ApiError::Transport(format!("{err:#}")))?;
        if auth.username != username || auth.password != password {
            return Err(ApiError::from_status(401, "invalid username or password"));
        }
        self.token = Some(auth.token.clone());
        let user_id = auth.account.map(|account| match account.user_id {
            JsonValue::String(s) => s,
            other => other.to_string(),
        });
        Ok(AuthSession {
            token: auth.token,
            user_id,
        })
    }

    async fn get_ranks(&self, _program_id: i64) -> Result<JsonValue, ApiError> {
        self.public("ranks.json")
    }

    async fn get_rank_requirements(&self, rank_id: i64) -> Result<JsonValue, ApiError> {
        self.public(format!("rank_requirements/{rank_id}.json"))
    }

    async fn get_youth_ranks(&self, user_id: &str) -> Result<JsonValue, ApiError> {
        self.youth(user_id, "ranks.json")
    }

    async fn get_youth_rank_requirements(
        &self,
        user_id: &str,
        rank_id: i64,
    ) -> Result<JsonValue, ApiError> {
        self.youth(user_id, format!("ranks/{rank_id}/requirements.json"))
    }

    async fn get_youth_merit_badges(&self, user_id: &str) -> Result<JsonValue, ApiError> {
        self.youth(user_id, "merit_badges.json")
    }

    async fn get_mb_requirements(&self, mb_id: i64) -> Result<JsonValue, ApiError> {
        self.public(format!("merit_badge_requirements/{mb_id}.json"))
    }

    async fn get_youth_mb_requirements(
        &self,
        user_id: &str,
        mb_id: i64,
    ) -> Result<JsonValue, ApiError> {
        self.youth(user_id, format!("merit_badges/{mb_id}/requirements.json"))
    }

    async fn get_leadership_history(&self, user_id: &str) -> Result<JsonValue, ApiError> {
        self.youth(user_id, "leadership.json")
    }

    async fn get_person_profile(&self, user_id: &str) -> Result<JsonValue, ApiError> {
        self.youth(user_id, "profile.json")
    }
}
