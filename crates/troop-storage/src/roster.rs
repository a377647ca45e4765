//! Roster import: rows handed over by the external CSV importer.

use anyhow::{Context, Result};
use tracing::{debug, info};
use troop_core::{RosterRow, ScoutUpsert};

use crate::{non_blank, TroopStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RosterImport {
    pub imported: usize,
    /// Rows without any identifier, or whose member type is not youth.
    pub skipped: usize,
}

impl TroopStore {
    /// Coalesce roster rows into the scouts table.
    ///
    /// A row keyed only by member id lands on the scout already carrying that
    /// member id, so importing a later roster that adds user ids does not
    /// duplicate anyone.
    pub async fn import_roster(&self, rows: &[RosterRow]) -> Result<RosterImport> {
        let mut outcome = RosterImport::default();
        for row in rows {
            if !row.is_youth() {
                debug!(member_type = ?row.member_type, "skipping non-youth roster row");
                outcome.skipped += 1;
                continue;
            }
            let Some(primary) = row.primary_id() else {
                debug!("skipping roster row without user or member id");
                outcome.skipped += 1;
                continue;
            };

            let user_id = self.resolve_roster_key(primary, row).await?;
            self.upsert_scout(&ScoutUpsert {
                first_name: row.first_name.clone(),
                last_name: row.last_name.clone(),
                member_id: row.member_id.clone(),
                patrol: row.patrol.clone(),
                ..ScoutUpsert::new(user_id)
            })
            .await?;
            outcome.imported += 1;
        }
        info!(
            imported = outcome.imported,
            skipped = outcome.skipped,
            "roster imported"
        );
        Ok(outcome)
    }

    async fn resolve_roster_key(&self, primary: &str, row: &RosterRow) -> Result<String> {
        let exists: Option<String> = sqlx::query_scalar("SELECT user_id FROM scouts WHERE user_id = ?")
            .bind(primary)
            .fetch_optional(self.pool())
            .await
            .with_context(|| format!("looking up scout {primary}"))?;
        if exists.is_some() {
            return Ok(primary.to_string());
        }

        let Some(member_id) = non_blank(row.member_id.as_deref()) else {
            return Ok(primary.to_string());
        };
        let by_member: Option<String> = sqlx::query_scalar(
            "SELECT user_id FROM scouts WHERE scouting_member_id = ? ORDER BY rowid LIMIT 1",
        )
        .bind(member_id)
        .fetch_optional(self.pool())
        .await
        .with_context(|| format!("looking up scout by member id {member_id}"))?;
        let Some(existing) = by_member else {
            return Ok(primary.to_string());
        };

        // A scout first imported under its member id takes the real user id once one shows up.
        let user_id = non_blank(row.user_id.as_deref());
        match user_id {
            Some(user_id) if existing == member_id && user_id != existing => {
                self.rekey_scout(&existing, user_id).await?;
                Ok(user_id.to_string())
            }
            _ => Ok(existing),
        }
    }

    /// Move a scout and every row hanging off it from `old` to `new`.
    async fn rekey_scout(&self, old: &str, new: &str) -> Result<()> {
        let mut tx = self.pool().begin().await.context("beginning scout re-key")?;
        // Checked at commit, once parent and children agree again.
        sqlx::query("PRAGMA defer_foreign_keys = ON")
            .execute(&mut *tx)
            .await
            .context("deferring foreign keys")?;
        for table in [
            "scouts",
            "scout_advancements",
            "scout_merit_badges",
            "scout_requirement_completions",
            "scout_mb_requirement_completions",
            "scout_leadership",
        ] {
            let column = if table == "scouts" { "user_id" } else { "scout_user_id" };
            sqlx::query(&format!("UPDATE {table} SET {column} = ? WHERE {column} = ?"))
                .bind(new)
                .bind(old)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("re-keying {table} from {old} to {new}"))?;
        }
        tx.commit().await.context("committing scout re-key")?;
        info!(from = old, to = new, "scout re-keyed to user id");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troop_core::{AdvancementStatus, AdvancementType, ScoutAdvancement};

    fn row(user_id: Option<&str>, member_id: Option<&str>, first: &str, last: &str) -> RosterRow {
        RosterRow {
            user_id: user_id.map(str::to_string),
            member_id: member_id.map(str::to_string),
            first_name: Some(first.to_string()),
            last_name: Some(last.to_string()),
            patrol: None,
            member_type: None,
        }
    }

    #[tokio::test]
    async fn importing_the_same_roster_twice_adds_no_duplicates() {
        let store = TroopStore::open_in_memory().await.unwrap();
        let roster = vec![
            row(Some("1001"), Some("M1"), "Ada", "Lovelace"),
            row(None, Some("M2"), "Alan", "Turing"),
            row(None, None, "No", "Id"),
        ];
        let first = store.import_roster(&roster).await.unwrap();
        let second = store.import_roster(&roster).await.unwrap();

        assert_eq!(first, RosterImport { imported: 2, skipped: 1 });
        assert_eq!(second, first);
        assert_eq!(store.scout_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn superset_roster_moves_member_keyed_scouts_to_their_user_id() {
        let store = TroopStore::open_in_memory().await.unwrap();
        store
            .import_roster(&[row(None, Some("M2"), "Alan", "Turing")])
            .await
            .unwrap();
        store
            .upsert_advancement(
                "M2",
                &ScoutAdvancement {
                    advancement_type: AdvancementType::Rank,
                    advancement_id: 1,
                    advancement_name: Some("Scout".into()),
                    status: AdvancementStatus::InProgress,
                    date_completed: None,
                    date_started: None,
                    raw_json: None,
                },
            )
            .await
            .unwrap();
        store
            .import_roster(&[
                row(Some("2002"), Some("M2"), "Alan", "Turing"),
                row(Some("2003"), None, "Grace", "Hopper"),
            ])
            .await
            .unwrap();

        let scouts = store.scouts().await.unwrap();
        let ids: Vec<_> = scouts.iter().map(|s| s.user_id.as_str()).collect();
        assert_eq!(ids, vec!["2002", "2003"]);
        assert_eq!(scouts[0].member_id.as_deref(), Some("M2"));
        let moved: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scout_advancements WHERE scout_user_id = '2002'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(moved, 1);

        // Importing the same roster again is a no-op.
        store
            .import_roster(&[row(Some("2002"), Some("M2"), "Alan", "Turing")])
            .await
            .unwrap();
        assert_eq!(store.scout_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn non_youth_rows_are_skipped() {
        let store = TroopStore::open_in_memory().await.unwrap();
        let mut adult = row(Some("5"), None, "Pat", "Leader");
        adult.member_type = Some("ADULT".into());
        let mut youth = row(Some("6"), None, "Sam", "Scout");
        youth.member_type = Some("YOUTH".into());

        let outcome = store.import_roster(&[adult, youth]).await.unwrap();
        assert_eq!(outcome, RosterImport { imported: 1, skipped: 1 });
        assert!(store.scout("5").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn roster_keeps_profile_fields_from_earlier_syncs() {
        let store = TroopStore::open_in_memory().await.unwrap();
        store
            .upsert_scout(&ScoutUpsert {
                birthdate: Some("2011-05-14".into()),
                patrol: Some("Eagles".into()),
                ..ScoutUpsert::new("1001")
            })
            .await
            .unwrap();
        store
            .import_roster(&[row(Some("1001"), None, "Ada", "Lovelace")])
            .await
            .unwrap();

        let scout = store.scout("1001").await.unwrap().unwrap();
        assert_eq!(scout.birthdate.as_deref(), Some("2011-05-14"));
        assert_eq!(scout.patrol.as_deref(), Some("Eagles"));
        assert_eq!(scout.first_name.as_deref(), Some("Ada"));
    }
}
