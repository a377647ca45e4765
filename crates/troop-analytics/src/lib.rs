//! Read-only troop planning queries over a synced store.
//!
//! Every query is a pure read and returns rows in a stable order for the same
//! store contents. Percentages are `part / whole * 100`; a troop with no
//! scouts yields empty (or zero-count) results, never a division by zero.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use tracing::debug;
use troop_core::{display_name, Rank, SCOUTS_BSA_PROGRAM_ID};
use troop_storage::TroopStore;

pub const CRATE_NAME: &str = "troop-analytics";

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    /// Minimum share of the troop (percent) a plan recommendation must benefit.
    pub plan_threshold: f64,
    pub needs_mb_limit: usize,
    /// Program whose rank ladder next-rank and req-matrix walk.
    pub program_id: i64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            plan_threshold: 50.0,
            needs_mb_limit: 20,
            program_id: SCOUTS_BSA_PROGRAM_ID,
        }
    }
}

impl AnalyticsConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            plan_threshold: std::env::var("TROOP_PLAN_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.plan_threshold),
            needs_mb_limit: std::env::var("TROOP_NEEDS_MB_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.needs_mb_limit),
            program_id: std::env::var("TROOP_PROGRAM_ID")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.program_id),
        }
    }
}

/// A merit badge offered as a group activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRow {
    pub merit_badge: String,
    pub is_eagle_required: bool,
    pub scouts_benefiting: i64,
    pub total_scouts: i64,
    /// Rounded to one decimal.
    pub pct_benefiting: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeedsMbRow {
    pub merit_badge: String,
    pub is_eagle_required: bool,
    pub scouts_needing: i64,
    pub total_scouts: i64,
    pub pct_needing: f64,
}

/// One top-level requirement of an in-progress merit badge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MbRequirementRow {
    pub merit_badge: String,
    pub requirement_id: i64,
    pub requirement_number: Option<String>,
    pub description: Option<String>,
    pub scouts_working: i64,
    pub scouts_done: i64,
    pub scouts_needing: i64,
    pub pct_complete: f64,
    /// Display names of the working scouts who have not completed it, in roster order.
    pub scouts_missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoutSummaryRow {
    pub user_id: String,
    pub scout_name: String,
    pub current_rank: Option<String>,
    pub merit_badges_earned: i64,
    pub eagle_merit_badges_earned: i64,
    pub merit_badges_in_progress: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextRankRow {
    pub user_id: String,
    pub scout_name: String,
    pub current_rank: Option<String>,
    pub next_rank: String,
    pub total_requirements: i64,
    pub completed_requirements: i64,
    pub remaining: i64,
    pub pct_complete: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReqMatrixRow {
    pub requirement_id: i64,
    pub requirement_number: Option<String>,
    pub description: Option<String>,
    pub total_scouts: i64,
    pub scouts_completed: i64,
    pub scouts_needing: i64,
    pub pct_incomplete: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReqMatrix {
    /// No (or no matching) rank was given; pick one of these.
    RankChoices { ranks: Vec<Rank> },
    Requirements { rank: Rank, rows: Vec<ReqMatrixRow> },
}

#[derive(Debug, Clone)]
pub struct TroopAnalytics {
    store: TroopStore,
    config: AnalyticsConfig,
}

impl TroopAnalytics {
    pub fn new(store: TroopStore, config: AnalyticsConfig) -> Self {
        Self { store, config }
    }

    /// Open a finished store read-only.
    pub async fn open(path: impl AsRef<Path>, config: AnalyticsConfig) -> Result<Self> {
        let store = TroopStore::open_read_only(path).await?;
        Ok(Self::new(store, config))
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Merit badges at least `threshold` percent of the troop still needs;
    /// `None` uses the configured threshold.
    pub async fn plan(&self, threshold: Option<f64>) -> Result<Vec<PlanRow>> {
        let threshold = threshold.unwrap_or(self.config.plan_threshold);
        let total = self.store.scout_count().await?;
        let rows = self
            .badge_needs(false)
            .await?
            .into_iter()
            .filter(|need| raw_percent(need.count, total) >= threshold)
            .map(|need| PlanRow {
                pct_benefiting: percent(need.count, total),
                merit_badge: need.name,
                is_eagle_required: need.is_eagle_required,
                scouts_benefiting: need.count,
                total_scouts: total,
            })
            .collect::<Vec<_>>();
        debug!(threshold, rows = rows.len(), "plan computed");
        Ok(rows)
    }

    /// The `limit` merit badges the most scouts have not completed.
    pub async fn needs_mb(&self, limit: Option<usize>, eagle_only: bool) -> Result<Vec<NeedsMbRow>> {
        let limit = limit.unwrap_or(self.config.needs_mb_limit);
        let total = self.store.scout_count().await?;
        Ok(self
            .badge_needs(eagle_only)
            .await?
            .into_iter()
            .take(limit)
            .map(|need| NeedsMbRow {
                pct_needing: percent(need.count, total),
                merit_badge: need.name,
                is_eagle_required: need.is_eagle_required,
                scouts_needing: need.count,
                total_scouts: total,
            })
            .collect())
    }

    /// Active badges with the number of scouts lacking a completion, most needed
    /// first and ties by name. Badges every scout has completed are omitted.
    async fn badge_needs(&self, eagle_only: bool) -> Result<Vec<BadgeNeed>> {
        let rows = sqlx::query(
            r#"
            SELECT mb.name, mb.is_eagle_required, COUNT(s.user_id) AS scouts_needing
            FROM merit_badges mb
            CROSS JOIN scouts s
            LEFT JOIN scout_merit_badges smb
                ON smb.scout_user_id = s.user_id
                AND smb.merit_badge_name = mb.name
                AND smb.status = 'completed'
            WHERE smb.id IS NULL
              AND mb.active = 1
              AND (? = 0 OR mb.is_eagle_required = 1)
            GROUP BY mb.id
            ORDER BY scouts_needing DESC, mb.name ASC
            "#,
        )
        .bind(eagle_only)
        .fetch_all(self.store.pool())
        .await
        .context("counting scouts needing each merit badge")?;

        rows.iter()
            .map(|row| -> Result<BadgeNeed> {
                Ok(BadgeNeed {
                    name: row.try_get("name")?,
                    is_eagle_required: row.try_get("is_eagle_required")?,
                    count: row.try_get("scouts_needing")?,
                })
            })
            .collect()
    }

    /// Top-level requirements of in-progress merit badges, optionally for one badge.
    pub async fn mb_requirements(&self, merit_badge: Option<&str>) -> Result<Vec<MbRequirementRow>> {
        let in_progress = sqlx::query(
            r#"
            SELECT smb.merit_badge_name, smb.mb_api_id, smb.mb_version_id,
                   s.user_id, s.first_name, s.last_name
            FROM scout_merit_badges smb
            JOIN scouts s ON s.user_id = smb.scout_user_id
            WHERE smb.status = 'in_progress'
              AND smb.mb_api_id IS NOT NULL
              AND (? IS NULL OR smb.merit_badge_name = ?)
            ORDER BY smb.merit_badge_name, s.rowid
            "#,
        )
        .bind(merit_badge)
        .bind(merit_badge)
        .fetch_all(self.store.pool())
        .await
        .context("listing in-progress merit badges")?;

        let mut groups: BTreeMap<String, BadgeGroup> = BTreeMap::new();
        for row in &in_progress {
            let name: String = row.try_get("merit_badge_name")?;
            let mb_api_id: i64 = row.try_get("mb_api_id")?;
            let version: Option<String> = row.try_get("mb_version_id")?;
            let user_id: String = row.try_get("user_id")?;
            let first: Option<String> = row.try_get("first_name")?;
            let last: Option<String> = row.try_get("last_name")?;
            let group = groups.entry(name).or_insert_with(|| BadgeGroup {
                mb_api_id,
                preferred_version: version.unwrap_or_default(),
                scouts: Vec::new(),
            });
            let scout_name = display_name(first.as_deref(), last.as_deref(), &user_id);
            group.scouts.push((user_id, scout_name));
        }

        let mut out = Vec::new();
        for (badge, group) in groups {
            let Some(version) = self
                .stored_mb_version(group.mb_api_id, &group.preferred_version)
                .await?
            else {
                debug!(%badge, "no requirement definitions stored for badge");
                continue;
            };
            let requirements = sqlx::query(
                r#"
                SELECT id, requirement_number, short, name
                FROM mb_requirements
                WHERE mb_api_id = ? AND mb_version_id = ? AND parent_requirement_id IS NULL
                ORDER BY sort_order, requirement_number, id
                "#,
            )
            .bind(group.mb_api_id)
            .bind(&version)
            .fetch_all(self.store.pool())
            .await
            .with_context(|| format!("loading requirements of {badge}"))?;

            let done: HashSet<(String, i64)> = sqlx::query(
                r#"
                SELECT scout_user_id, mb_requirement_id
                FROM scout_mb_requirement_completions
                WHERE mb_api_id = ? AND completed = 1
                "#,
            )
            .bind(group.mb_api_id)
            .fetch_all(self.store.pool())
            .await
            .with_context(|| format!("loading completions of {badge}"))?
            .iter()
            .map(|row| -> Result<(String, i64)> {
                Ok((row.try_get("scout_user_id")?, row.try_get("mb_requirement_id")?))
            })
            .collect::<Result<_>>()?;

            let working = group.scouts.len() as i64;
            for req in &requirements {
                let requirement_id: i64 = req.try_get("id")?;
                let missing: Vec<String> = group
                    .scouts
                    .iter()
                    .filter(|(user_id, _)| !done.contains(&(user_id.clone(), requirement_id)))
                    .map(|(_, name)| name.clone())
                    .collect();
                let needing = missing.len() as i64;
                out.push(MbRequirementRow {
                    merit_badge: badge.clone(),
                    requirement_id,
                    requirement_number: req.try_get("requirement_number")?,
                    description: description(req.try_get("short")?, req.try_get("name")?),
                    scouts_working: working,
                    scouts_done: working - needing,
                    scouts_needing: needing,
                    pct_complete: percent(working - needing, working),
                    scouts_missing: missing,
                });
            }
        }
        Ok(out)
    }

    /// The version scouts report when its tree is stored, else the newest stored version.
    async fn stored_mb_version(&self, mb_api_id: i64, preferred: &str) -> Result<Option<String>> {
        sqlx::query_scalar(
            r#"
            SELECT mb_version_id
            FROM mb_requirements
            WHERE mb_api_id = ?
            GROUP BY mb_version_id
            ORDER BY (mb_version_id = ?) DESC, mb_version_id DESC
            LIMIT 1
            "#,
        )
        .bind(mb_api_id)
        .bind(preferred)
        .fetch_optional(self.store.pool())
        .await
        .with_context(|| format!("resolving stored version of merit badge {mb_api_id}"))
    }

    /// One row per scout, most senior rank first, then by name.
    pub async fn summary(&self) -> Result<Vec<ScoutSummaryRow>> {
        let rows = sqlx::query(
            r#"
            SELECT
                s.user_id, s.first_name, s.last_name, s.last_synced_at,
                cr.name AS current_rank,
                COALESCE(cr.level, 0) AS rank_level,
                (SELECT COUNT(*) FROM scout_merit_badges smb
                 WHERE smb.scout_user_id = s.user_id AND smb.status = 'completed') AS earned,
                (SELECT COUNT(*) FROM scout_merit_badges smb
                 JOIN merit_badges mb ON mb.name = smb.merit_badge_name
                 WHERE smb.scout_user_id = s.user_id AND smb.status = 'completed'
                   AND mb.is_eagle_required = 1) AS eagle_earned,
                (SELECT COUNT(*) FROM scout_merit_badges smb
                 WHERE smb.scout_user_id = s.user_id AND smb.status = 'in_progress') AS in_progress
            FROM scouts s
            LEFT JOIN ranks cr ON cr.id = s.current_rank_id
            ORDER BY s.rowid
            "#,
        )
        .fetch_all(self.store.pool())
        .await
        .context("summarizing scouts")?;

        let mut out = rows
            .iter()
            .map(|row| -> Result<(i64, ScoutSummaryRow)> {
                let user_id: String = row.try_get("user_id")?;
                let first: Option<String> = row.try_get("first_name")?;
                let last: Option<String> = row.try_get("last_name")?;
                Ok((
                    row.try_get("rank_level")?,
                    ScoutSummaryRow {
                        scout_name: display_name(first.as_deref(), last.as_deref(), &user_id),
                        user_id,
                        current_rank: row.try_get("current_rank")?,
                        merit_badges_earned: row.try_get("earned")?,
                        eagle_merit_badges_earned: row.try_get("eagle_earned")?,
                        merit_badges_in_progress: row.try_get("in_progress")?,
                        last_synced_at: row.try_get("last_synced_at")?,
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        out.sort_by(|(la, a), (lb, b)| lb.cmp(la).then_with(|| a.scout_name.cmp(&b.scout_name)));
        Ok(out.into_iter().map(|(_, row)| row).collect())
    }

    /// Scouts ordered by how few required top-level requirements of their next rank remain.
    pub async fn next_rank(&self) -> Result<Vec<NextRankRow>> {
        let rows = sqlx::query(
            r#"
            WITH next_rank AS (
                SELECT
                    s.user_id, s.first_name, s.last_name,
                    cr.name AS current_rank,
                    (SELECT nr.id FROM ranks nr
                     WHERE nr.program_id = ?
                       AND nr.level > COALESCE(cr.level, 0)
                     ORDER BY nr.level, nr.id
                     LIMIT 1) AS next_rank_id
                FROM scouts s
                LEFT JOIN ranks cr ON cr.id = s.current_rank_id
            )
            SELECT
                n.user_id, n.first_name, n.last_name, n.current_rank,
                r.name AS next_rank,
                COUNT(q.id) AS total_requirements,
                COALESCE(SUM(CASE WHEN c.completed = 1 THEN 1 ELSE 0 END), 0) AS completed_requirements
            FROM next_rank n
            JOIN ranks r ON r.id = n.next_rank_id
            JOIN requirements q
                ON q.rank_id = r.id
                AND q.required = 1
                AND q.parent_requirement_id IS NULL
            LEFT JOIN scout_requirement_completions c
                ON c.scout_user_id = n.user_id
                AND c.requirement_id = q.id
            GROUP BY n.user_id
            "#,
        )
        .bind(self.config.program_id)
        .fetch_all(self.store.pool())
        .await
        .context("computing next-rank progress")?;

        let mut out = rows
            .iter()
            .map(|row| -> Result<NextRankRow> {
                let user_id: String = row.try_get("user_id")?;
                let first: Option<String> = row.try_get("first_name")?;
                let last: Option<String> = row.try_get("last_name")?;
                let total: i64 = row.try_get("total_requirements")?;
                let completed: i64 = row.try_get("completed_requirements")?;
                Ok(NextRankRow {
                    scout_name: display_name(first.as_deref(), last.as_deref(), &user_id),
                    user_id,
                    current_rank: row.try_get("current_rank")?,
                    next_rank: row.try_get("next_rank")?,
                    total_requirements: total,
                    completed_requirements: completed,
                    remaining: total - completed,
                    pct_complete: percent(completed, total),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        out.sort_by(|a, b| {
            a.remaining
                .cmp(&b.remaining)
                .then_with(|| {
                    raw_percent(b.completed_requirements, b.total_requirements)
                        .total_cmp(&raw_percent(a.completed_requirements, a.total_requirements))
                })
                .then_with(|| a.scout_name.cmp(&b.scout_name))
        });
        Ok(out)
    }

    /// Requirement need counts for one rank (by id or case-insensitive name).
    ///
    /// Without a rank, or with one that matches nothing, returns the program's
    /// ranks to choose from.
    pub async fn req_matrix(&self, rank: Option<&str>) -> Result<ReqMatrix> {
        let ranks = self.store.ranks_for_program(self.config.program_id).await?;
        let Some(wanted) = rank.map(str::trim).filter(|r| !r.is_empty()) else {
            return Ok(ReqMatrix::RankChoices { ranks });
        };
        let chosen = match wanted.parse::<i64>() {
            Ok(id) => ranks.iter().find(|r| r.id == id),
            Err(_) => ranks.iter().find(|r| r.name.eq_ignore_ascii_case(wanted)),
        };
        let Some(rank) = chosen.cloned() else {
            debug!(wanted, "rank not found, offering choices");
            return Ok(ReqMatrix::RankChoices { ranks });
        };

        let total = self.store.scout_count().await?;
        let rows = sqlx::query(
            r#"
            SELECT
                r.id, r.requirement_number, r.short, r.name,
                COUNT(DISTINCT src.scout_user_id) AS scouts_completed
            FROM requirements r
            LEFT JOIN scout_requirement_completions src
                ON src.requirement_id = r.id
                AND src.completed = 1
            WHERE r.rank_id = ?
              AND r.required = 1
              AND r.parent_requirement_id IS NULL
            GROUP BY r.id
            ORDER BY r.sort_order, r.requirement_number, r.id
            "#,
        )
        .bind(rank.id)
        .fetch_all(self.store.pool())
        .await
        .with_context(|| format!("building requirement matrix for {}", rank.name))?;

        let mut out = rows
            .iter()
            .map(|row| -> Result<ReqMatrixRow> {
                let completed: i64 = row.try_get("scouts_completed")?;
                let needing = (total - completed).max(0);
                Ok(ReqMatrixRow {
                    requirement_id: row.try_get("id")?,
                    requirement_number: row.try_get("requirement_number")?,
                    description: description(row.try_get("short")?, row.try_get("name")?),
                    total_scouts: total,
                    scouts_completed: completed,
                    scouts_needing: needing,
                    pct_incomplete: percent(needing, total),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        // Stable sort keeps requirement order among equal counts.
        out.sort_by(|a, b| b.scouts_needing.cmp(&a.scouts_needing));
        Ok(ReqMatrix::Requirements { rank, rows: out })
    }
}

struct BadgeNeed {
    name: String,
    is_eagle_required: bool,
    count: i64,
}

struct BadgeGroup {
    mb_api_id: i64,
    preferred_version: String,
    /// (user id, display name) in roster order.
    scouts: Vec<(String, String)>,
}

fn raw_percent(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Percentage rounded to one decimal.
pub fn percent(part: i64, whole: i64) -> f64 {
    (raw_percent(part, whole) * 10.0).round() / 10.0
}

/// Short label, else the name cut to 60 characters.
fn description(short: Option<String>, name: Option<String>) -> Option<String> {
    short
        .filter(|s| !s.trim().is_empty())
        .or_else(|| name.map(|n| n.chars().take(60).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_empty_troops() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(10, 20), 50.0);
        assert_eq!(percent(1, 3), 33.3);
        assert_eq!(percent(2, 3), 66.7);
    }

    #[test]
    fn description_prefers_short_label() {
        assert_eq!(
            description(Some("Pack".into()), Some("Pack for a campout".into())).as_deref(),
            Some("Pack")
        );
        let long = "x".repeat(80);
        assert_eq!(description(None, Some(long)).map(|d| d.len()), Some(60));
        assert_eq!(description(Some(" ".into()), None), None);
    }
}
