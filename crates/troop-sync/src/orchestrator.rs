//! The sync state machine.
//!
//! `Authenticating -> InitializingStore -> SyncingReferenceData ->
//! ImportingRoster (optional) -> SyncingScouts -> Done`. Scouts are processed
//! one at a time in roster order, each through six fault-isolated steps. An
//! authentication failure anywhere ends the run; every other failure becomes
//! a warning and the run moves on to the next step.

use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use troop_adapters::{
    flatten_requirements, merit_badge_definition_version, parse_leadership, parse_rank_catalog,
    parse_youth_merit_badges, parse_youth_ranks, profile_birthdate, AdvancementSource, ApiError,
    MeritBadgeCompletionShape, MeritBadgeDefinitionShape, PayloadError, RankCompletionShape,
    RankDefinitionShape,
};
use troop_core::{AdvancementStatus, ProgressEvent, RosterRow, Scout, ScoutUpsert, YouthMeritBadge};
use troop_storage::{RosterImport, StoreLock, TroopStore};
use uuid::Uuid;

use crate::{
    DefinitionCache, ProgressSink, ScoutStep, SyncConfig, SyncError, SyncPhase, SyncRunSummary,
};

/// Failure of one fetch-and-merge step.
#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl StepError {
    fn is_authentication(&self) -> bool {
        matches!(self, Self::Api(err) if err.is_authentication())
    }
}

/// Mutable state of one run: the progress stream, counters and the definition cache.
struct Run<'a> {
    sink: &'a mut dyn ProgressSink,
    phase: SyncPhase,
    last_completed: Option<String>,
    warnings: usize,
    cache: DefinitionCache,
    ranks_stored: usize,
    roster: Option<RosterImport>,
    scouts_total: usize,
    scouts_synced: usize,
    cancelled: bool,
}

impl<'a> Run<'a> {
    fn new(sink: &'a mut dyn ProgressSink) -> Self {
        Self {
            sink,
            phase: SyncPhase::Authenticating,
            last_completed: None,
            warnings: 0,
            cache: DefinitionCache::default(),
            ranks_stored: 0,
            roster: None,
            scouts_total: 0,
            scouts_synced: 0,
            cancelled: false,
        }
    }

    fn enter(&mut self, phase: SyncPhase, text: impl Into<String>) {
        self.phase = phase;
        debug!(%phase, "sync phase");
        self.sink.emit(ProgressEvent::step(text));
    }

    fn log(&mut self, text: impl Into<String>) {
        self.sink.emit(ProgressEvent::log(text));
    }

    fn completed(&mut self, what: impl Into<String>) {
        self.last_completed = Some(what.into());
    }

    /// Authentication failures abort the run; anything else is a warning.
    fn absorb(&mut self, subject: &str, step: &str, err: StepError) -> Result<(), SyncError> {
        if err.is_authentication() {
            return Err(self.fatal(format!("{err}")));
        }
        self.warnings += 1;
        warn!(subject, step, error = %err, "sync step failed, continuing");
        self.sink
            .emit(ProgressEvent::error(format!("{subject}: {step} failed: {err}")));
        Ok(())
    }

    fn fatal(&mut self, message: String) -> SyncError {
        let phase = self.phase;
        warn!(%phase, %message, "sync aborted on authentication failure");
        self.sink.emit(ProgressEvent::error(match phase {
            SyncPhase::Authenticating => format!("Authentication failed: {message}"),
            _ => format!("Token expired mid-sync; re-authenticate and run again ({message})"),
        }));
        self.phase = SyncPhase::Failed;
        SyncError::Authentication {
            phase,
            last_completed: self.last_completed.clone(),
            message,
            warnings: self.warnings,
        }
    }

    fn store_failure(&mut self, source: anyhow::Error) -> SyncError {
        let phase = self.phase;
        self.sink
            .emit(ProgressEvent::error(format!("Database error: {source:#}")));
        self.phase = SyncPhase::Failed;
        SyncError::Store { phase, source }
    }
}

pub struct SyncOrchestrator<S> {
    config: SyncConfig,
    source: S,
    cancel: Option<watch::Receiver<bool>>,
}

impl<S: AdvancementSource> SyncOrchestrator<S> {
    pub fn new(config: SyncConfig, source: S) -> Self {
        Self {
            config,
            source,
            cancel: None,
        }
    }

    /// Stop between scouts once the watched value turns `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Run one full sync, importing `roster` first when given.
    pub async fn run(
        &mut self,
        roster: Option<&[RosterRow]>,
        sink: &mut dyn ProgressSink,
    ) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("troop_sync", %run_id);
        self.run_inner(run_id, roster, sink).instrument(span).await
    }

    async fn run_inner(
        &mut self,
        run_id: Uuid,
        roster: Option<&[RosterRow]>,
        sink: &mut dyn ProgressSink,
    ) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let mut run = Run::new(sink);

        run.enter(
            SyncPhase::Authenticating,
            format!("Authenticating as {}", self.config.username),
        );
        if let Err(err) = self
            .source
            .authenticate(&self.config.username, &self.config.password)
            .await
        {
            return Err(run.fatal(err.to_string()));
        }
        run.log("Authentication successful");
        run.completed("authentication");

        run.enter(SyncPhase::InitializingStore, "Initializing database");
        let (store, _lock) = match self.open_store().await {
            Ok(opened) => opened,
            Err(err) => return Err(run.store_failure(err)),
        };
        run.completed("store initialization");

        let outcome = self.sync_into(&store, &mut run, roster).await;
        let location = store.location().to_string();
        store.close().await;
        outcome?;

        if run.cancelled {
            info!(synced = run.scouts_synced, "sync cancelled");
        } else {
            run.phase = SyncPhase::Done;
            run.sink.emit(ProgressEvent::complete(location.clone()));
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            db_path: location,
            ranks_stored: run.ranks_stored,
            roster_imported: run.roster.map(|r| r.imported),
            roster_skipped: run.roster.map(|r| r.skipped),
            scouts_total: run.scouts_total,
            scouts_synced: run.scouts_synced,
            definitions_fetched: run.cache.fetches(),
            warnings: run.warnings,
            cancelled: run.cancelled,
        };
        info!(
            scouts = summary.scouts_synced,
            warnings = summary.warnings,
            "sync finished"
        );
        Ok(summary)
    }

    async fn open_store(&self) -> anyhow::Result<(TroopStore, StoreLock)> {
        let path = &self.config.db_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }
        let lock = StoreLock::acquire(path)?;
        let store = TroopStore::open(path).await?;
        store.initialize(&self.config.troop_name).await?;
        Ok((store, lock))
    }

    async fn sync_into(
        &self,
        store: &TroopStore,
        run: &mut Run<'_>,
        roster: Option<&[RosterRow]>,
    ) -> Result<(), SyncError> {
        run.enter(SyncPhase::SyncingReferenceData, "Downloading rank definitions");
        self.sync_reference_data(store, run).await?;

        if let Some(rows) = roster {
            run.enter(
                SyncPhase::ImportingRoster,
                format!("Importing roster ({} rows)", rows.len()),
            );
            match store.import_roster(rows).await {
                Ok(outcome) => {
                    run.log(format!(
                        "{} scouts imported ({} rows skipped)",
                        outcome.imported, outcome.skipped
                    ));
                    run.roster = Some(outcome);
                    run.completed("roster import");
                }
                Err(err) => run.absorb("roster", "import", StepError::Store(err))?,
            }
        }

        let scouts = store.scouts().await.map_err(|err| run.store_failure(err))?;
        run.scouts_total = scouts.len();
        if scouts.is_empty() {
            run.log("No scouts in the database");
            if roster.is_none() {
                run.log("Tip: import a roster export to add scouts");
            }
            return Ok(());
        }

        let total = scouts.len();
        run.enter(
            SyncPhase::SyncingScouts,
            format!("Syncing advancement data for {total} {}", scouts_word(total)),
        );
        for (index, scout) in scouts.iter().enumerate() {
            if self.cancel_requested() {
                run.cancelled = true;
                run.log(format!("Sync cancelled after {index} of {total} {}", scouts_word(total)));
                return Ok(());
            }
            run.log(format!("[{}/{total}] {}", index + 1, scout.display_name()));
            let span = info_span!("scout_sync", user_id = %scout.user_id);
            self.sync_scout(store, run, scout).instrument(span).await?;
            run.scouts_synced += 1;
        }

        run.enter(
            SyncPhase::Done,
            format!("Synced {total} {} successfully", scouts_word(total)),
        );
        Ok(())
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn sync_reference_data(
        &self,
        store: &TroopStore,
        run: &mut Run<'_>,
    ) -> Result<(), SyncError> {
        match self.store_rank_catalog(store).await {
            Ok(count) => {
                run.ranks_stored = count;
                run.log(format!("{count} ranks stored"));
                run.completed("rank catalog");
            }
            Err(err) => run.absorb("reference data", "rank catalog", err)?,
        }

        let ranks = store
            .ranks_for_program(self.config.program_id)
            .await
            .map_err(|err| run.store_failure(err))?;
        let mut stored = 0usize;
        for rank in &ranks {
            match self.ensure_rank_definition(store, &mut run.cache, rank.id).await {
                Ok(()) => stored += 1,
                Err(err) => {
                    run.absorb("reference data", &format!("{} requirements", rank.name), err)?
                }
            }
        }
        if !ranks.is_empty() {
            run.log(format!("Requirements stored for {stored} of {} ranks", ranks.len()));
            run.completed("rank requirements");
        }
        Ok(())
    }

    async fn store_rank_catalog(&self, store: &TroopStore) -> Result<usize, StepError> {
        let payload = self.source.get_ranks(self.config.program_id).await?;
        let ranks = parse_rank_catalog(&payload)?;
        Ok(store.upsert_ranks(&ranks).await?)
    }

    async fn sync_scout(
        &self,
        store: &TroopStore,
        run: &mut Run<'_>,
        scout: &Scout,
    ) -> Result<(), SyncError> {
        let user_id = scout.user_id.as_str();
        let name = scout.display_name();
        let done = |step: ScoutStep| format!("{name}: {step}");

        let in_progress_ranks = match self.sync_youth_ranks(store, user_id).await {
            Ok(ranks) => {
                run.completed(done(ScoutStep::Ranks));
                ranks
            }
            Err(err) => {
                run.absorb(&name, ScoutStep::Ranks.as_str(), err)?;
                Vec::new()
            }
        };

        if !self.config.skip_requirements {
            for rank_id in in_progress_ranks {
                match self
                    .sync_rank_requirements(store, &mut run.cache, user_id, rank_id)
                    .await
                {
                    Ok(rows) => debug!(rank_id, rows, "rank completions stored"),
                    Err(err) => run.absorb(
                        &name,
                        &format!("{} (rank {rank_id})", ScoutStep::RankRequirements),
                        err,
                    )?,
                }
            }
            run.completed(done(ScoutStep::RankRequirements));
        }

        let in_progress_badges = match self.sync_youth_merit_badges(store, user_id).await {
            Ok(badges) => {
                run.completed(done(ScoutStep::MeritBadges));
                badges
            }
            Err(err) => {
                run.absorb(&name, ScoutStep::MeritBadges.as_str(), err)?;
                Vec::new()
            }
        };

        if !self.config.skip_requirements {
            for badge in &in_progress_badges {
                match self
                    .sync_merit_badge_requirements(store, &mut run.cache, user_id, badge)
                    .await
                {
                    Ok(rows) => debug!(badge = %badge.name, rows, "merit badge completions stored"),
                    Err(err) => run.absorb(
                        &name,
                        &format!("{} ({})", ScoutStep::MeritBadgeRequirements, badge.name),
                        err,
                    )?,
                }
            }
            run.completed(done(ScoutStep::MeritBadgeRequirements));
        }

        match self.sync_leadership(store, user_id).await {
            Ok(()) => run.completed(done(ScoutStep::Leadership)),
            Err(err) => run.absorb(&name, ScoutStep::Leadership.as_str(), err)?,
        }

        match self.sync_profile(store, user_id).await {
            Ok(()) => run.completed(done(ScoutStep::Profile)),
            Err(err) => run.absorb(&name, ScoutStep::Profile.as_str(), err)?,
        }

        if let Err(err) = store.mark_scout_synced(user_id, Utc::now()).await {
            run.absorb(&name, "sync timestamp", StepError::Store(err))?;
        }
        Ok(())
    }

    /// Returns the scout's in-progress ranks of the configured program.
    async fn sync_youth_ranks(
        &self,
        store: &TroopStore,
        user_id: &str,
    ) -> Result<Vec<i64>, StepError> {
        let payload = self.source.get_youth_ranks(user_id).await?;
        let ranks = parse_youth_ranks(&payload)?;
        let current = store
            .record_youth_ranks(user_id, &ranks, self.config.program_id)
            .await?;
        debug!(ranks = ranks.len(), ?current, "youth ranks stored");
        Ok(ranks
            .iter()
            .filter(|r| {
                r.rank.program_id == self.config.program_id
                    && r.status() == AdvancementStatus::InProgress
            })
            .map(|r| r.rank.id)
            .collect())
    }

    async fn ensure_rank_definition(
        &self,
        store: &TroopStore,
        cache: &mut DefinitionCache,
        rank_id: i64,
    ) -> Result<(), StepError> {
        if cache.has_rank(rank_id) {
            return Ok(());
        }
        let payload = self.source.get_rank_requirements(rank_id).await?;
        let flat = flatten_requirements(&RankDefinitionShape { rank_id }, &payload);
        if flat.dropped > 0 {
            debug!(rank_id, dropped = flat.dropped, "requirement nodes without id dropped");
        }
        store.upsert_rank_requirements(rank_id, &flat.rows).await?;
        cache.record_rank(rank_id);
        Ok(())
    }

    async fn sync_rank_requirements(
        &self,
        store: &TroopStore,
        cache: &mut DefinitionCache,
        user_id: &str,
        rank_id: i64,
    ) -> Result<usize, StepError> {
        self.ensure_rank_definition(store, cache, rank_id).await?;
        let payload = self
            .source
            .get_youth_rank_requirements(user_id, rank_id)
            .await?;
        let flat = flatten_requirements(&RankCompletionShape { rank_id }, &payload);
        Ok(store
            .record_rank_completions(user_id, rank_id, &flat.rows)
            .await?)
    }

    /// Returns the scout's in-progress badges that carry an API id.
    async fn sync_youth_merit_badges(
        &self,
        store: &TroopStore,
        user_id: &str,
    ) -> Result<Vec<YouthMeritBadge>, StepError> {
        let payload = self.source.get_youth_merit_badges(user_id).await?;
        let badges = parse_youth_merit_badges(&payload)?;
        let outcome = store.record_youth_merit_badges(user_id, &badges).await?;
        debug!(
            stored = outcome.stored,
            completed = outcome.completed,
            "youth merit badges stored"
        );
        Ok(badges
            .into_iter()
            .filter(|b| b.status() == AdvancementStatus::InProgress && b.mb_api_id.is_some())
            .collect())
    }

    async fn sync_merit_badge_requirements(
        &self,
        store: &TroopStore,
        cache: &mut DefinitionCache,
        user_id: &str,
        badge: &YouthMeritBadge,
    ) -> Result<usize, StepError> {
        let Some(mb_api_id) = badge.mb_api_id else {
            return Ok(0);
        };

        if cache.merit_badge_version(mb_api_id).is_none() {
            let definition = self.source.get_mb_requirements(mb_api_id).await?;
            let version_id =
                merit_badge_definition_version(&definition, badge.version_id.as_deref());
            let shape = MeritBadgeDefinitionShape {
                mb_api_id,
                version_id: version_id.clone(),
            };
            let flat = flatten_requirements(&shape, &definition);
            store
                .upsert_merit_badge_requirements(mb_api_id, &version_id, &flat.rows)
                .await?;
            cache.record_merit_badge(mb_api_id, version_id);
        }

        let payload = self
            .source
            .get_youth_mb_requirements(user_id, mb_api_id)
            .await?;
        let version_id = cache
            .merit_badge_version(mb_api_id)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| badge.version_id.clone())
            .unwrap_or_default();
        let shape = MeritBadgeCompletionShape {
            mb_api_id,
            version_id: version_id.clone(),
        };
        let flat = flatten_requirements(&shape, &payload);
        Ok(store
            .record_merit_badge_completions(user_id, mb_api_id, &version_id, &flat.rows)
            .await?)
    }

    async fn sync_leadership(&self, store: &TroopStore, user_id: &str) -> Result<(), StepError> {
        let payload = self.source.get_leadership_history(user_id).await?;
        let positions = parse_leadership(&payload)?;
        let outcome = store.record_leadership(user_id, &positions).await?;
        debug!(
            inserted = outcome.inserted,
            refreshed = outcome.refreshed,
            "leadership stored"
        );
        Ok(())
    }

    async fn sync_profile(&self, store: &TroopStore, user_id: &str) -> Result<(), StepError> {
        let profile = self.source.get_person_profile(user_id).await?;
        if let Some(birthdate) = profile_birthdate(&profile)? {
            store
                .upsert_scout(&ScoutUpsert {
                    birthdate: Some(birthdate),
                    ..ScoutUpsert::new(user_id)
                })
                .await?;
        }
        Ok(())
    }
}

fn scouts_word(count: usize) -> &'static str {
    if count == 1 {
        "scout"
    } else {
        "scouts"
    }
}
