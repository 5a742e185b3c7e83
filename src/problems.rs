//! Deduplicated problem registry shared between the player and its loaders.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::types::Problem;

/// Keeps the set of problems visible to the UI, keyed by the stable id each
/// reporting component supplies. Re-adding an id replaces the existing entry
/// instead of appending, so a flapping condition stays a single item.
#[derive(Debug, Default)]
pub struct ProblemManager {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    problems: BTreeMap<String, Problem>,
    revision: u64,
}

impl ProblemManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the problem stored under `problem.id`.
    ///
    /// Returns true when this changed the visible set.
    pub fn add(&self, problem: Problem) -> bool {
        let mut inner = self.inner.lock();
        let changed = inner.problems.get(&problem.id) != Some(&problem);
        if changed {
            debug!(id = %problem.id, severity = ?problem.severity, "problem reported");
            inner.problems.insert(problem.id.clone(), problem);
            inner.revision += 1;
        }
        changed
    }

    /// Remove the problem with the given id once the condition resolves.
    ///
    /// Returns true when an entry was actually removed.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.problems.remove(id).is_some();
        if removed {
            debug!(id, "problem cleared");
            inner.revision += 1;
        }
        removed
    }

    pub fn has(&self, id: &str) -> bool {
        self.inner.lock().problems.contains_key(id)
    }

    /// Snapshot of all current problems, ordered by id for deterministic
    /// emission.
    pub fn problems(&self) -> Vec<Problem> {
        self.inner.lock().problems.values().cloned().collect()
    }

    /// Monotonic counter bumped on every visible change; lets emitters skip
    /// rebuilding state when nothing changed.
    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_reporting_replaces_instead_of_appending() {
        let manager = ProblemManager::new();
        assert!(manager.add(Problem::warn("decode-failed:/a", "first")));
        assert!(manager.add(Problem::warn("decode-failed:/a", "second")));
        let problems = manager.problems();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].message, "second");
    }

    #[test]
    fn identical_re_report_is_not_a_change() {
        let manager = ProblemManager::new();
        let problem = Problem::warn("w", "same");
        assert!(manager.add(problem.clone()));
        let revision = manager.revision();
        assert!(!manager.add(problem));
        assert_eq!(manager.revision(), revision);
    }

    #[test]
    fn remove_clears_only_the_named_id() {
        let manager = ProblemManager::new();
        manager.add(Problem::warn("a", "one"));
        manager.add(Problem::error("b", "two"));
        assert!(manager.remove("a"));
        assert!(!manager.remove("a"));
        assert!(manager.has("b"));
        assert_eq!(manager.problems().len(), 1);
    }

    #[test]
    fn snapshot_is_ordered_by_id() {
        let manager = ProblemManager::new();
        manager.add(Problem::warn("zeta", "z"));
        manager.add(Problem::warn("alpha", "a"));
        let ids: Vec<_> = manager.problems().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}
