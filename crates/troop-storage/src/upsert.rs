//! Create-or-update writes, one family per entity.

use anyhow::{Context, Result};
use sqlx::{Sqlite, Transaction};
use tracing::debug;
use troop_core::{
    AdvancementType, LeadershipPosition, MeritBadge, Rank, RequirementCompletion,
    RequirementDefinition, ScoutAdvancement, ScoutUpsert, YouthMeritBadge, YouthRank,
};

use crate::{non_blank, TroopStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeritBadgeOutcome {
    pub stored: usize,
    pub completed: usize,
    pub in_progress: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeadershipOutcome {
    pub inserted: usize,
    /// Stints matched on their identity tuple and refreshed in place.
    pub refreshed: usize,
}

impl TroopStore {
    /// Replace catalog ranks by id.
    pub async fn upsert_ranks(&self, ranks: &[Rank]) -> Result<usize> {
        let mut tx = self.pool().begin().await.context("beginning rank upsert")?;
        for rank in ranks {
            sqlx::query(
                r#"
                INSERT INTO ranks (id, name, level, program_id, program, image_url, version, active, raw_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    level = excluded.level,
                    program_id = excluded.program_id,
                    program = excluded.program,
                    image_url = excluded.image_url,
                    version = excluded.version,
                    active = excluded.active,
                    raw_json = excluded.raw_json
                "#,
            )
            .bind(rank.id)
            .bind(&rank.name)
            .bind(rank.level)
            .bind(rank.program_id)
            .bind(&rank.program)
            .bind(&rank.image_url)
            .bind(&rank.version)
            .bind(rank.active)
            .bind(&rank.raw_json)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting rank {}", rank.id))?;
        }
        tx.commit().await.context("committing rank upsert")?;
        Ok(ranks.len())
    }

    /// Insert a rank seen only in a scout record; catalog data is never overwritten.
    pub async fn ensure_rank(&self, rank: &Rank) -> Result<()> {
        let mut tx = self.pool().begin().await.context("beginning rank insert")?;
        ensure_rank_tx(&mut tx, rank).await?;
        tx.commit().await.context("committing rank insert")?;
        Ok(())
    }

    /// Replace one rank's requirement tree rows.
    ///
    /// `rows` must be parent-before-children, as the tree merger emits them.
    pub async fn upsert_rank_requirements(
        &self,
        rank_id: i64,
        rows: &[RequirementDefinition],
    ) -> Result<usize> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("beginning requirement upsert")?;
        for req in rows {
            sqlx::query(
                r#"
                INSERT INTO requirements (
                    id, rank_id, parent_requirement_id, requirement_number, list_number,
                    short, name, required, children_required, sort_order,
                    eagle_mb_required, total_mb_required, service_hours_required,
                    months_since_last_rank, raw_json
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    rank_id = excluded.rank_id,
                    parent_requirement_id = excluded.parent_requirement_id,
                    requirement_number = excluded.requirement_number,
                    list_number = excluded.list_number,
                    short = excluded.short,
                    name = excluded.name,
                    required = excluded.required,
                    children_required = excluded.children_required,
                    sort_order = excluded.sort_order,
                    eagle_mb_required = excluded.eagle_mb_required,
                    total_mb_required = excluded.total_mb_required,
                    service_hours_required = excluded.service_hours_required,
                    months_since_last_rank = excluded.months_since_last_rank,
                    raw_json = excluded.raw_json
                "#,
            )
            .bind(req.id)
            .bind(rank_id)
            .bind(req.parent_id)
            .bind(&req.requirement_number)
            .bind(&req.list_number)
            .bind(&req.short)
            .bind(&req.name)
            .bind(req.required)
            .bind(req.children_required)
            .bind(&req.sort_order)
            .bind(req.thresholds.eagle_mb_required)
            .bind(req.thresholds.total_mb_required)
            .bind(req.thresholds.service_hours_required)
            .bind(req.thresholds.months_since_last_rank)
            .bind(&req.raw_json)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting requirement {} of rank {rank_id}", req.id))?;
        }
        tx.commit().await.context("committing requirement upsert")?;
        debug!(rank_id, rows = rows.len(), "rank requirements stored");
        Ok(rows.len())
    }

    /// Replace one merit badge version's requirement tree rows.
    pub async fn upsert_merit_badge_requirements(
        &self,
        mb_api_id: i64,
        version_id: &str,
        rows: &[RequirementDefinition],
    ) -> Result<usize> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("beginning merit badge requirement upsert")?;
        for req in rows {
            sqlx::query(
                r#"
                INSERT INTO mb_requirements (
                    id, mb_api_id, mb_version_id, parent_requirement_id, requirement_number,
                    list_number, short, name, required, children_required, sort_order, raw_json
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(mb_api_id, mb_version_id, id) DO UPDATE SET
                    parent_requirement_id = excluded.parent_requirement_id,
                    requirement_number = excluded.requirement_number,
                    list_number = excluded.list_number,
                    short = excluded.short,
                    name = excluded.name,
                    required = excluded.required,
                    children_required = excluded.children_required,
                    sort_order = excluded.sort_order,
                    raw_json = excluded.raw_json
                "#,
            )
            .bind(req.id)
            .bind(mb_api_id)
            .bind(version_id)
            .bind(req.parent_id)
            .bind(&req.requirement_number)
            .bind(&req.list_number)
            .bind(&req.short)
            .bind(&req.name)
            .bind(req.required)
            .bind(req.children_required)
            .bind(&req.sort_order)
            .bind(&req.raw_json)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "upserting requirement {} of merit badge {mb_api_id} v{version_id}",
                    req.id
                )
            })?;
        }
        tx.commit()
            .await
            .context("committing merit badge requirement upsert")?;
        Ok(rows.len())
    }

    /// Replace a merit badge's attributes by name; returns its stable id.
    pub async fn upsert_merit_badge(&self, badge: &MeritBadge) -> Result<i64> {
        let mut tx = self.pool().begin().await.context("beginning merit badge upsert")?;
        let id = upsert_merit_badge_tx(&mut tx, badge).await?;
        tx.commit().await.context("committing merit badge upsert")?;
        Ok(id)
    }

    /// Coalescing scout upsert: absent or blank fields keep what is stored.
    pub async fn upsert_scout(&self, scout: &ScoutUpsert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scouts (user_id, first_name, last_name, scouting_member_id, patrol, birthdate)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                first_name = COALESCE(excluded.first_name, scouts.first_name),
                last_name = COALESCE(excluded.last_name, scouts.last_name),
                scouting_member_id = COALESCE(excluded.scouting_member_id, scouts.scouting_member_id),
                patrol = COALESCE(excluded.patrol, scouts.patrol),
                birthdate = COALESCE(excluded.birthdate, scouts.birthdate)
            "#,
        )
        .bind(scout.user_id.trim())
        .bind(non_blank(scout.first_name.as_deref()))
        .bind(non_blank(scout.last_name.as_deref()))
        .bind(non_blank(scout.member_id.as_deref()))
        .bind(non_blank(scout.patrol.as_deref()))
        .bind(non_blank(scout.birthdate.as_deref()))
        .execute(self.pool())
        .await
        .with_context(|| format!("upserting scout {}", scout.user_id))?;
        Ok(())
    }

    /// Add a scout by id and "First Last" name; the first word is the first name.
    pub async fn add_scout(&self, user_id: &str, full_name: &str) -> Result<()> {
        let mut parts = full_name.split_whitespace();
        let first = parts.next().map(str::to_string);
        let rest = parts.collect::<Vec<_>>().join(" ");
        let scout = ScoutUpsert {
            first_name: first,
            last_name: Some(rest),
            ..ScoutUpsert::new(user_id)
        };
        self.upsert_scout(&scout).await
    }

    pub async fn upsert_advancement(
        &self,
        user_id: &str,
        advancement: &ScoutAdvancement,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await.context("beginning advancement upsert")?;
        upsert_advancement_tx(&mut tx, user_id, advancement).await?;
        tx.commit().await.context("committing advancement upsert")?;
        Ok(())
    }

    /// Store a scout's rank summary and refresh their current rank.
    ///
    /// Returns the resolved current rank: the completed rank of
    /// `base_program_id` with the highest level. A scout with no completed
    /// rank in that program keeps whatever was stored before.
    pub async fn record_youth_ranks(
        &self,
        user_id: &str,
        ranks: &[YouthRank],
        base_program_id: i64,
    ) -> Result<Option<i64>> {
        let mut tx = self.pool().begin().await.context("beginning youth rank write")?;
        for youth_rank in ranks {
            ensure_rank_tx(&mut tx, &youth_rank.rank).await?;
            let status = youth_rank.status();
            let advancement = ScoutAdvancement {
                advancement_type: AdvancementType::Rank,
                advancement_id: youth_rank.rank.id,
                advancement_name: Some(youth_rank.rank.name.clone()),
                status,
                date_completed: youth_rank.date_earned.clone(),
                date_started: None,
                raw_json: Some(youth_rank.raw_json.clone()),
            };
            upsert_advancement_tx(&mut tx, user_id, &advancement).await?;
        }

        let current: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT r.id
            FROM scout_advancements a
            JOIN ranks r ON r.id = a.advancement_id
            WHERE a.scout_user_id = ?
              AND a.advancement_type = 'rank'
              AND a.status = 'completed'
              AND r.program_id = ?
            ORDER BY r.level DESC, r.id DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(base_program_id)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("resolving current rank of scout {user_id}"))?;

        if let Some(rank_id) = current {
            sqlx::query("UPDATE scouts SET current_rank_id = ? WHERE user_id = ?")
                .bind(rank_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("setting current rank of scout {user_id}"))?;
        }
        tx.commit().await.context("committing youth rank write")?;
        Ok(current)
    }

    /// Store a scout's merit badge summary, merging each badge into the catalog by name.
    pub async fn record_youth_merit_badges(
        &self,
        user_id: &str,
        badges: &[YouthMeritBadge],
    ) -> Result<MeritBadgeOutcome> {
        let mut outcome = MeritBadgeOutcome::default();
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("beginning youth merit badge write")?;
        for badge in badges {
            upsert_merit_badge_tx(
                &mut tx,
                &MeritBadge {
                    name: badge.name.clone(),
                    is_eagle_required: badge.is_eagle_required,
                    image_url: badge.image_url.clone(),
                    active: true,
                },
            )
            .await?;

            let status = badge.status();
            sqlx::query(
                r#"
                INSERT INTO scout_merit_badges (
                    scout_user_id, merit_badge_name, status, date_completed, date_started,
                    mb_api_id, mb_version_id, raw_json
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(scout_user_id, merit_badge_name) DO UPDATE SET
                    status = excluded.status,
                    date_completed = excluded.date_completed,
                    date_started = excluded.date_started,
                    mb_api_id = excluded.mb_api_id,
                    mb_version_id = excluded.mb_version_id,
                    raw_json = excluded.raw_json
                "#,
            )
            .bind(user_id)
            .bind(&badge.name)
            .bind(status.as_str())
            .bind(&badge.date_completed)
            .bind(&badge.date_started)
            .bind(badge.mb_api_id)
            .bind(&badge.version_id)
            .bind(&badge.raw_json)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting merit badge {} for scout {user_id}", badge.name))?;

            outcome.stored += 1;
            match status {
                troop_core::AdvancementStatus::Completed => outcome.completed += 1,
                troop_core::AdvancementStatus::InProgress => outcome.in_progress += 1,
            }
        }
        tx.commit()
            .await
            .context("committing youth merit badge write")?;
        Ok(outcome)
    }

    /// Replace a scout's completion rows for one rank's requirements.
    pub async fn record_rank_completions(
        &self,
        user_id: &str,
        rank_id: i64,
        rows: &[RequirementCompletion],
    ) -> Result<usize> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("beginning rank completion write")?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO scout_requirement_completions (
                    scout_user_id, requirement_id, rank_id, completed, date_completed
                )
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(scout_user_id, requirement_id) DO UPDATE SET
                    rank_id = excluded.rank_id,
                    completed = excluded.completed,
                    date_completed = excluded.date_completed
                "#,
            )
            .bind(user_id)
            .bind(row.requirement_id)
            .bind(rank_id)
            .bind(row.completed)
            .bind(&row.date_completed)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "upserting completion of requirement {} for scout {user_id}",
                    row.requirement_id
                )
            })?;
        }
        tx.commit()
            .await
            .context("committing rank completion write")?;
        Ok(rows.len())
    }

    /// Replace a scout's completion rows for one merit badge version.
    pub async fn record_merit_badge_completions(
        &self,
        user_id: &str,
        mb_api_id: i64,
        version_id: &str,
        rows: &[RequirementCompletion],
    ) -> Result<usize> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("beginning merit badge completion write")?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO scout_mb_requirement_completions (
                    scout_user_id, mb_requirement_id, mb_api_id, mb_version_id,
                    completed, date_completed, raw_json
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(scout_user_id, mb_requirement_id, mb_api_id, mb_version_id) DO UPDATE SET
                    completed = excluded.completed,
                    date_completed = excluded.date_completed,
                    raw_json = excluded.raw_json
                "#,
            )
            .bind(user_id)
            .bind(row.requirement_id)
            .bind(mb_api_id)
            .bind(version_id)
            .bind(row.completed)
            .bind(&row.date_completed)
            .bind(&row.raw_json)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "upserting completion of merit badge requirement {} for scout {user_id}",
                    row.requirement_id
                )
            })?;
        }
        tx.commit()
            .await
            .context("committing merit badge completion write")?;
        Ok(rows.len())
    }

    /// Store leadership stints, matching existing rows on the full identity
    /// tuple (position, dates, unit, patrol) with null-safe comparison.
    pub async fn record_leadership(
        &self,
        user_id: &str,
        positions: &[LeadershipPosition],
    ) -> Result<LeadershipOutcome> {
        let mut outcome = LeadershipOutcome::default();
        let mut tx = self.pool().begin().await.context("beginning leadership write")?;
        for stint in positions {
            let matched = sqlx::query(
                r#"
                UPDATE scout_leadership
                SET days_in_position = ?, approved = ?, raw_json = ?
                WHERE scout_user_id = ?
                  AND position = ?
                  AND start_date IS ?
                  AND end_date IS ?
                  AND unit IS ?
                  AND patrol IS ?
                "#,
            )
            .bind(stint.days_in_position)
            .bind(stint.approved)
            .bind(&stint.raw_json)
            .bind(user_id)
            .bind(&stint.position)
            .bind(&stint.start_date)
            .bind(&stint.end_date)
            .bind(&stint.unit)
            .bind(&stint.patrol)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("refreshing leadership of scout {user_id}"))?
            .rows_affected();

            if matched > 0 {
                outcome.refreshed += 1;
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO scout_leadership (
                    scout_user_id, position, start_date, end_date, unit, patrol,
                    days_in_position, approved, raw_json
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(user_id)
            .bind(&stint.position)
            .bind(&stint.start_date)
            .bind(&stint.end_date)
            .bind(&stint.unit)
            .bind(&stint.patrol)
            .bind(stint.days_in_position)
            .bind(stint.approved)
            .bind(&stint.raw_json)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting leadership of scout {user_id}"))?;
            outcome.inserted += 1;
        }
        tx.commit().await.context("committing leadership write")?;
        Ok(outcome)
    }
}

async fn ensure_rank_tx(tx: &mut Transaction<'_, Sqlite>, rank: &Rank) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO ranks (id, name, level, program_id, program, image_url, version, active, raw_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(rank.id)
    .bind(&rank.name)
    .bind(rank.level)
    .bind(rank.program_id)
    .bind(&rank.program)
    .bind(&rank.image_url)
    .bind(&rank.version)
    .bind(rank.active)
    .bind(&rank.raw_json)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("inserting rank {}", rank.id))?;
    Ok(())
}

async fn upsert_merit_badge_tx(
    tx: &mut Transaction<'_, Sqlite>,
    badge: &MeritBadge,
) -> Result<i64> {
    sqlx::query_scalar(
        r#"
        INSERT INTO merit_badges (name, is_eagle_required, image_url, active)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            is_eagle_required = excluded.is_eagle_required,
            image_url = excluded.image_url,
            active = excluded.active
        RETURNING id
        "#,
    )
    .bind(&badge.name)
    .bind(badge.is_eagle_required)
    .bind(&badge.image_url)
    .bind(badge.active)
    .fetch_one(&mut **tx)
    .await
    .with_context(|| format!("upserting merit badge {}", badge.name))
}

async fn upsert_advancement_tx(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: &str,
    adv: &ScoutAdvancement,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO scout_advancements (
            scout_user_id, advancement_type, advancement_id, advancement_name,
            status, date_completed, date_started, raw_json
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(scout_user_id, advancement_type, advancement_id) DO UPDATE SET
            advancement_name = excluded.advancement_name,
            status = excluded.status,
            date_completed = excluded.date_completed,
            date_started = excluded.date_started,
            raw_json = excluded.raw_json
        "#,
    )
    .bind(user_id)
    .bind(adv.advancement_type.as_str())
    .bind(adv.advancement_id)
    .bind(&adv.advancement_name)
    .bind(adv.status.as_str())
    .bind(&adv.date_completed)
    .bind(&adv.date_started)
    .bind(&adv.raw_json)
    .execute(&mut **tx)
    .await
    .with_context(|| {
        format!(
            "upserting {} {} for scout {user_id}",
            adv.advancement_type.as_str(),
            adv.advancement_id
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Table;
    use troop_core::{AdvancementStatus, RequirementThresholds};

    fn rank(id: i64, name: &str, level: i64) -> Rank {
        Rank {
            id,
            name: name.to_string(),
            level,
            program_id: 2,
            program: Some("Scouts BSA".into()),
            image_url: None,
            version: None,
            active: true,
            raw_json: None,
        }
    }

    fn definition(id: i64, parent_id: Option<i64>, name: &str) -> RequirementDefinition {
        RequirementDefinition {
            id,
            parent_id,
            requirement_number: Some(id.to_string()),
            list_number: None,
            short: Some(name.to_string()),
            name: Some(name.to_string()),
            required: true,
            children_required: None,
            sort_order: None,
            thresholds: RequirementThresholds::default(),
            raw_json: "{}".into(),
        }
    }

    fn youth_rank(r: Rank, earned: Option<&str>) -> YouthRank {
        YouthRank {
            rank: r,
            date_earned: earned.map(str::to_string),
            raw_json: "{}".into(),
        }
    }

    async fn store_with_scout(user_id: &str) -> TroopStore {
        let store = TroopStore::open_in_memory().await.unwrap();
        store.upsert_scout(&ScoutUpsert::new(user_id)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn repeated_definition_upserts_are_idempotent() {
        let store = TroopStore::open_in_memory().await.unwrap();
        let ranks = vec![rank(1, "Scout", 1), rank(2, "Tenderfoot", 2)];
        let reqs = vec![
            definition(201, None, "Camp"),
            definition(2011, Some(201), "Pack"),
            definition(202, None, "Cook"),
        ];
        for _ in 0..2 {
            store.upsert_ranks(&ranks).await.unwrap();
            store.upsert_rank_requirements(2, &reqs).await.unwrap();
        }
        assert_eq!(store.table_count(Table::Ranks).await.unwrap(), 2);
        assert_eq!(store.table_count(Table::Requirements).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn definitions_replace_previous_values() {
        let store = TroopStore::open_in_memory().await.unwrap();
        let mut scout = rank(1, "Scout", 1);
        scout.image_url = Some("old.png".into());
        store.upsert_ranks(&[scout.clone()]).await.unwrap();
        scout.image_url = Some("new.png".into());
        scout.name = "Scout Rank".into();
        store.upsert_ranks(&[scout]).await.unwrap();

        let stored = store.ranks_for_program(2).await.unwrap();
        assert_eq!(stored[0].name, "Scout Rank");
        assert_eq!(stored[0].image_url.as_deref(), Some("new.png"));
    }

    #[tokio::test]
    async fn ensure_rank_never_overwrites_catalog_rows() {
        let store = TroopStore::open_in_memory().await.unwrap();
        store.upsert_ranks(&[rank(3, "Second Class", 3)]).await.unwrap();
        store.ensure_rank(&rank(3, "renamed", 99)).await.unwrap();
        store.ensure_rank(&rank(4, "First Class", 4)).await.unwrap();

        let stored = store.ranks_for_program(2).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].name, "Second Class");
        assert_eq!(stored[0].level, 3);
    }

    #[tokio::test]
    async fn requirement_parents_resolve_within_the_same_rank() {
        let store = TroopStore::open_in_memory().await.unwrap();
        store
            .upsert_ranks(&[rank(1, "Scout", 1), rank(2, "Tenderfoot", 2)])
            .await
            .unwrap();
        store
            .upsert_rank_requirements(1, &[definition(101, None, "a"), definition(1011, Some(101), "b")])
            .await
            .unwrap();
        store
            .upsert_rank_requirements(
                2,
                &[
                    definition(201, None, "c"),
                    definition(2011, Some(201), "d"),
                    definition(2012, Some(201), "e"),
                ],
            )
            .await
            .unwrap();

        let orphans: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM requirements c
            LEFT JOIN requirements p ON p.id = c.parent_requirement_id
            WHERE c.parent_requirement_id IS NOT NULL
              AND (p.id IS NULL OR p.rank_id != c.rank_id)
            "#,
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn merit_badge_requirements_are_scoped_by_version() {
        let store = TroopStore::open_in_memory().await.unwrap();
        let rows = vec![definition(1, None, "Explain"), definition(2, Some(1), "Show")];
        store
            .upsert_merit_badge_requirements(42, "2019", &rows)
            .await
            .unwrap();
        store
            .upsert_merit_badge_requirements(42, "2021", &rows)
            .await
            .unwrap();
        store
            .upsert_merit_badge_requirements(42, "2021", &rows)
            .await
            .unwrap();
        assert_eq!(store.table_count(Table::MbRequirements).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn scout_upsert_coalesces_absent_fields() {
        let store = TroopStore::open_in_memory().await.unwrap();
        store
            .upsert_scout(&ScoutUpsert {
                first_name: Some("Ada".into()),
                last_name: Some("Lovelace".into()),
                patrol: Some("Eagles".into()),
                ..ScoutUpsert::new("1001")
            })
            .await
            .unwrap();
        store
            .upsert_scout(&ScoutUpsert {
                patrol: Some("  ".into()),
                birthdate: Some("2011-05-14".into()),
                ..ScoutUpsert::new("1001")
            })
            .await
            .unwrap();
        store
            .upsert_scout(&ScoutUpsert {
                patrol: Some("Hawks".into()),
                ..ScoutUpsert::new("1001")
            })
            .await
            .unwrap();

        let scout = store.scout("1001").await.unwrap().unwrap();
        assert_eq!(scout.first_name.as_deref(), Some("Ada"));
        assert_eq!(scout.last_name.as_deref(), Some("Lovelace"));
        assert_eq!(scout.patrol.as_deref(), Some("Hawks"));
        assert_eq!(scout.birthdate.as_deref(), Some("2011-05-14"));
        assert_eq!(store.scout_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn add_scout_splits_the_full_name() {
        let store = TroopStore::open_in_memory().await.unwrap();
        store.add_scout("77", "Mary Anne Jones").await.unwrap();
        store.add_scout("78", "Cher").await.unwrap();

        let mary = store.scout("77").await.unwrap().unwrap();
        assert_eq!(mary.first_name.as_deref(), Some("Mary"));
        assert_eq!(mary.last_name.as_deref(), Some("Anne Jones"));
        let cher = store.scout("78").await.unwrap().unwrap();
        assert_eq!(cher.last_name, None);
        assert_eq!(cher.display_name(), "Cher");
    }

    #[tokio::test]
    async fn youth_ranks_resolve_highest_completed_base_rank() {
        let store = store_with_scout("1001").await;
        store
            .upsert_ranks(&[rank(1, "Scout", 1), rank(2, "Tenderfoot", 2), rank(3, "Second Class", 3)])
            .await
            .unwrap();
        let mut cub = rank(14, "Arrow of Light", 14);
        cub.program_id = 1;

        let ranks = vec![
            youth_rank(rank(2, "Tenderfoot", 2), Some("2024-01-10")),
            youth_rank(rank(1, "Scout", 1), Some("2023-09-01")),
            youth_rank(rank(3, "Second Class", 3), None),
            youth_rank(cub, Some("2023-02-01")),
        ];
        let current = store.record_youth_ranks("1001", &ranks, 2).await.unwrap();
        assert_eq!(current, Some(2));
        assert_eq!(store.scout("1001").await.unwrap().unwrap().current_rank_id, Some(2));

        store.record_youth_ranks("1001", &ranks, 2).await.unwrap();
        assert_eq!(store.table_count(Table::ScoutAdvancements).await.unwrap(), 4);
        assert_eq!(store.table_count(Table::Ranks).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn completions_replace_the_previous_observation() {
        let store = store_with_scout("1001").await;
        store.upsert_ranks(&[rank(2, "Tenderfoot", 2)]).await.unwrap();
        let pending = RequirementCompletion {
            requirement_id: 201,
            parent_id: None,
            completed: false,
            date_completed: None,
            raw_json: "{}".into(),
        };
        store
            .record_rank_completions("1001", 2, &[pending.clone()])
            .await
            .unwrap();
        let done = RequirementCompletion {
            completed: true,
            date_completed: Some("2024-03-03".into()),
            ..pending
        };
        store.record_rank_completions("1001", 2, &[done]).await.unwrap();

        let row: (bool, Option<String>) = sqlx::query_as(
            "SELECT completed, date_completed FROM scout_requirement_completions WHERE requirement_id = 201",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(row, (true, Some("2024-03-03".to_string())));
        assert_eq!(
            store.table_count(Table::ScoutRequirementCompletions).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn youth_merit_badges_merge_into_catalog_by_name() {
        let store = store_with_scout("1001").await;
        store.initialize("Troop").await.unwrap();
        let badge = |name: &str, done: Option<&str>| YouthMeritBadge {
            name: name.to_string(),
            mb_api_id: Some(42),
            version_id: Some("2021".into()),
            is_eagle_required: troop_core::is_eagle_required_name(name),
            image_url: Some(format!("{name}.png")),
            date_completed: done.map(str::to_string),
            date_started: Some("2024-01-01".into()),
            raw_json: "{}".into(),
        };
        let outcome = store
            .record_youth_merit_badges("1001", &[badge("Cooking", None), badge("Archery", Some("2024-05-01"))])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MeritBadgeOutcome {
                stored: 2,
                completed: 1,
                in_progress: 1
            }
        );
        store
            .record_youth_merit_badges("1001", &[badge("Cooking", Some("2024-06-01"))])
            .await
            .unwrap();

        assert_eq!(store.table_count(Table::MeritBadges).await.unwrap(), 19);
        let status: String = sqlx::query_scalar(
            "SELECT status FROM scout_merit_badges WHERE merit_badge_name = 'Cooking'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(AdvancementStatus::parse(&status), Some(AdvancementStatus::Completed));
    }

    #[tokio::test]
    async fn merit_badge_id_is_stable_across_upserts() {
        let store = TroopStore::open_in_memory().await.unwrap();
        let mut badge = MeritBadge {
            name: "Chess".into(),
            is_eagle_required: false,
            image_url: None,
            active: true,
        };
        let first = store.upsert_merit_badge(&badge).await.unwrap();
        badge.image_url = Some("chess.png".into());
        let second = store.upsert_merit_badge(&badge).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn leadership_matches_on_identity_tuple() {
        let store = store_with_scout("1001").await;
        let stint = LeadershipPosition {
            position: "Patrol Leader".into(),
            start_date: Some("2024-01-01".into()),
            end_date: None,
            unit: Some("Troop 42".into()),
            patrol: None,
            days_in_position: Some(30),
            approved: false,
            raw_json: "{}".into(),
        };
        let first = store.record_leadership("1001", &[stint.clone()]).await.unwrap();
        assert_eq!(first.inserted, 1);

        let refreshed = LeadershipPosition {
            days_in_position: Some(90),
            approved: true,
            ..stint.clone()
        };
        let second = store.record_leadership("1001", &[refreshed]).await.unwrap();
        assert_eq!(second, LeadershipOutcome { inserted: 0, refreshed: 1 });

        let ended = LeadershipPosition {
            end_date: Some("2024-06-01".into()),
            ..stint
        };
        store.record_leadership("1001", &[ended]).await.unwrap();

        assert_eq!(store.table_count(Table::ScoutLeadership).await.unwrap(), 2);
        let days: i64 = sqlx::query_scalar(
            "SELECT days_in_position FROM scout_leadership WHERE end_date IS NULL",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(days, 90);
    }

    #[tokio::test]
    async fn mark_synced_stamps_the_scout() {
        let store = store_with_scout("1001").await;
        let at = chrono::Utc::now();
        store.mark_scout_synced("1001", at).await.unwrap();
        let scout = store.scout("1001").await.unwrap().unwrap();
        assert_eq!(
            scout.last_synced_at.map(|t| t.timestamp()),
            Some(at.timestamp())
        );
    }
}
