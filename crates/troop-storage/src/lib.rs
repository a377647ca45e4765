//! Single-file SQLite store for troop advancement data.
//!
//! [`TroopStore`] owns every write to the schema in `migrations/`. Definition
//! rows (ranks, requirement trees, merit badges) replace on conflict, scout
//! attributes coalesce, completions replace. Every write is keyed by a natural
//! key so repeating it leaves the store unchanged.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use troop_core::{Rank, Scout, EAGLE_REQUIRED_MERIT_BADGES};

pub mod lock;
pub mod roster;
pub mod upsert;

pub use lock::{LockError, StoreLock};
pub use roster::RosterImport;
pub use upsert::{LeadershipOutcome, MeritBadgeOutcome};

pub const CRATE_NAME: &str = "troop-storage";

pub const TROOP_NAME_SETTING: &str = "troop_name";

#[derive(Debug, Clone)]
pub struct TroopStore {
    pool: SqlitePool,
    location: String,
}

impl TroopStore {
    /// Open (creating when missing) the store at `path` and apply migrations.
    ///
    /// The parent directory must already exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .with_context(|| format!("opening store {}", path.display()))?;

        let store = Self {
            pool,
            location: path.display().to_string(),
        };
        store.migrate().await?;
        info!(location = %store.location, "troop store opened");
        Ok(store)
    }

    /// Open an existing store for analytics; writes fail and no migration runs.
    pub async fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .with_context(|| format!("opening store {} read-only", path.display()))?;
        Ok(Self {
            pool,
            location: path.display().to_string(),
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory sqlite url")?
            .foreign_keys(true);
        // One connection that never recycles; a second would see an empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .context("opening in-memory store")?;
        let store = Self {
            pool,
            location: ":memory:".to_string(),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("applying troop store migrations")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Filesystem path (or `:memory:`) reported in the sync completion event.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.location)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Record the troop name and seed the Eagle-required merit badge list.
    pub async fn initialize(&self, troop_name: &str) -> Result<()> {
        self.set_setting(TROOP_NAME_SETTING, troop_name).await?;

        let mut tx = self.pool.begin().await.context("beginning seed transaction")?;
        let mut seeded = 0u64;
        for name in EAGLE_REQUIRED_MERIT_BADGES {
            seeded += sqlx::query(
                "INSERT OR IGNORE INTO merit_badges (name, is_eagle_required) VALUES (?, 1)",
            )
            .bind(name)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("seeding merit badge {name}"))?
            .rows_affected();
        }
        tx.commit().await.context("committing seed transaction")?;
        debug!(seeded, "eagle-required merit badges seeded");
        Ok(())
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing setting {key}"))?;
        Ok(())
    }

    pub async fn setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("reading setting {key}"))?;
        Ok(value.flatten())
    }

    /// Scouts in roster order (the order they were first added).
    pub async fn scouts(&self) -> Result<Vec<Scout>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, first_name, last_name, scouting_member_id, patrol,
                   current_rank_id, birthdate, last_synced_at
            FROM scouts
            ORDER BY rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing scouts")?;
        rows.iter().map(scout_from_row).collect()
    }

    pub async fn scout(&self, user_id: &str) -> Result<Option<Scout>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, first_name, last_name, scouting_member_id, patrol,
                   current_rank_id, birthdate, last_synced_at
            FROM scouts
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading scout {user_id}"))?;
        row.as_ref().map(scout_from_row).transpose()
    }

    pub async fn scout_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM scouts")
            .fetch_one(&self.pool)
            .await
            .context("counting scouts")
    }

    pub async fn mark_scout_synced(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE scouts SET last_synced_at = ? WHERE user_id = ?")
            .bind(at)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("stamping sync time for scout {user_id}"))?;
        Ok(())
    }

    /// Ranks of one program, lowest level first.
    pub async fn ranks_for_program(&self, program_id: i64) -> Result<Vec<Rank>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, level, program_id, program, image_url, version, active, raw_json
            FROM ranks
            WHERE program_id = ?
            ORDER BY level, id
            "#,
        )
        .bind(program_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing ranks of program {program_id}"))?;

        rows.iter()
            .map(|row| -> Result<Rank> {
                Ok(Rank {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    level: row.try_get("level")?,
                    program_id: row.try_get("program_id")?,
                    program: row.try_get("program")?,
                    image_url: row.try_get("image_url")?,
                    version: row.try_get("version")?,
                    active: row.try_get("active")?,
                    raw_json: row.try_get("raw_json")?,
                })
            })
            .collect()
    }

    /// Row count of one schema table.
    pub async fn table_count(&self, table: Table) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("counting {}", table.name()))
    }
}

/// Schema tables, for counts in progress reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Ranks,
    Requirements,
    MeritBadges,
    MbRequirements,
    Scouts,
    ScoutAdvancements,
    ScoutMeritBadges,
    ScoutRequirementCompletions,
    ScoutMbRequirementCompletions,
    ScoutLeadership,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ranks => "ranks",
            Self::Requirements => "requirements",
            Self::MeritBadges => "merit_badges",
            Self::MbRequirements => "mb_requirements",
            Self::Scouts => "scouts",
            Self::ScoutAdvancements => "scout_advancements",
            Self::ScoutMeritBadges => "scout_merit_badges",
            Self::ScoutRequirementCompletions => "scout_requirement_completions",
            Self::ScoutMbRequirementCompletions => "scout_mb_requirement_completions",
            Self::ScoutLeadership => "scout_leadership",
        }
    }
}

fn scout_from_row(row: &SqliteRow) -> Result<Scout> {
    Ok(Scout {
        user_id: row.try_get("user_id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        member_id: row.try_get("scouting_member_id")?,
        patrol: row.try_get("patrol")?,
        current_rank_id: row.try_get("current_rank_id")?,
        birthdate: row.try_get("birthdate")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

/// Blank text is treated as absent so it never overwrites a stored value.
pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
