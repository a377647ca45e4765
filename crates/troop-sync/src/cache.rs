use std::collections::{HashMap, HashSet};

/// Requirement definition trees already stored during the current run.
///
/// Owned by a single run; a new run starts empty so definitions are refreshed
/// once per sync and never shared between runs.
#[derive(Debug, Default, Clone)]
pub struct DefinitionCache {
    ranks: HashSet<i64>,
    /// Merit badge id to the version its tree was stored under.
    merit_badges: HashMap<i64, String>,
    fetches: usize,
}

impl DefinitionCache {
    pub fn has_rank(&self, rank_id: i64) -> bool {
        self.ranks.contains(&rank_id)
    }

    pub fn record_rank(&mut self, rank_id: i64) {
        if self.ranks.insert(rank_id) {
            self.fetches += 1;
        }
    }

    pub fn merit_badge_version(&self, mb_api_id: i64) -> Option<&str> {
        self.merit_badges.get(&mb_api_id).map(String::as_str)
    }

    pub fn record_merit_badge(&mut self, mb_api_id: i64, version_id: impl Into<String>) {
        if self
            .merit_badges
            .insert(mb_api_id, version_id.into())
            .is_none()
        {
            self.fetches += 1;
        }
    }

    /// Distinct definition trees fetched and stored.
    pub fn fetches(&self) -> usize {
        self.fetches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_each_definition_once() {
        let mut cache = DefinitionCache::default();
        cache.record_rank(2);
        cache.record_rank(2);
        cache.record_merit_badge(42, "2021");
        assert!(cache.has_rank(2));
        assert!(!cache.has_rank(3));
        assert_eq!(cache.merit_badge_version(42), Some("2021"));
        assert_eq!(cache.merit_badge_version(57), None);
        assert_eq!(cache.fetches(), 2);
    }
}
