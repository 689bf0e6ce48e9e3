//! Configuration selection.
//!
//! Kernels ask a [`ConfigStrategy`] for their tile configuration instead of
//! hard-coding it. Two flavours exist in the workspace: closed-form
//! heuristics (attention block sizes) and [`ConfigTable`], a tuned candidate
//! list that is pruned per problem and then either benchmarked through a
//! caller-supplied hook or resolved to its first surviving entry.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Result, RuntimeError};

/// Maps a problem description onto a kernel configuration.
pub trait ConfigStrategy<P: ?Sized> {
    type Config;

    fn choose_config(&self, problem: &P) -> Self::Config;
}

/// Tuned candidate list keyed by a problem signature.
pub struct ConfigTable<C, K> {
    name: &'static str,
    candidates: Vec<C>,
    prune: Option<fn(&C, &K) -> bool>,
    cache: Mutex<HashMap<K, C>>,
}

impl<C, K> Debug for ConfigTable<C, K>
where
    C: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigTable")
            .field("name", &self.name)
            .field("candidates", &self.candidates)
            .finish()
    }
}

impl<C, K> ConfigTable<C, K>
where
    C: Clone + Debug,
    K: Clone + Debug + Eq + Hash,
{
    pub fn new(name: &'static str, candidates: Vec<C>) -> Result<Self> {
        if candidates.is_empty() {
            return Err(RuntimeError::EmptyConfigTable { table: name });
        }
        Ok(Self {
            name,
            candidates,
            prune: None,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Keeps only candidates for which `keep(config, key)` holds.
    pub fn with_prune(mut self, keep: fn(&C, &K) -> bool) -> Self {
        self.prune = Some(keep);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn candidates(&self) -> &[C] {
        &self.candidates
    }

    /// Candidates surviving the prune predicate. Falls back to the full table
    /// when the predicate rejects everything.
    pub fn candidates_for(&self, key: &K) -> Vec<C> {
        let kept: Vec<C> = match self.prune {
            Some(keep) => self
                .candidates
                .iter()
                .filter(|c| keep(c, key))
                .cloned()
                .collect(),
            None => self.candidates.clone(),
        };
        if kept.is_empty() {
            log::warn!(
                "config table {} pruned every candidate for {:?}; using the full table",
                self.name,
                key
            );
            self.candidates.clone()
        } else {
            kept
        }
    }

    pub fn cached(&self, key: &K) -> Option<C> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    /// Benchmarks every surviving candidate with `bench` and caches the
    /// fastest. Candidates for which `bench` returns `None` are skipped.
    pub fn select_with<F>(&self, key: &K, mut bench: F) -> C
    where
        F: FnMut(&C) -> Option<Duration>,
    {
        if let Some(hit) = self.cached(key) {
            return hit;
        }
        let candidates = self.candidates_for(key);
        let mut best: Option<(Duration, C)> = None;
        for candidate in candidates.iter() {
            if let Some(elapsed) = bench(candidate) {
                if best.as_ref().map_or(true, |(t, _)| elapsed < *t) {
                    best = Some((elapsed, candidate.clone()));
                }
            }
        }
        let chosen = match best {
            Some((elapsed, config)) => {
                log::debug!(
                    "config table {} tuned {:?} -> {:?} ({:?})",
                    self.name,
                    key,
                    config,
                    elapsed
                );
                config
            }
            None => candidates[0].clone(),
        };
        self.store(key, chosen.clone());
        chosen
    }

    /// Cached entry or the first surviving candidate.
    pub fn select(&self, key: &K) -> C {
        if let Some(hit) = self.cached(key) {
            return hit;
        }
        let chosen = self.candidates_for(key)[0].clone();
        self.store(key, chosen.clone());
        chosen
    }

    fn store(&self, key: &K, config: C) {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone(), config);
    }
}

impl<C, K> ConfigStrategy<K> for ConfigTable<C, K>
where
    C: Clone + Debug,
    K: Clone + Debug + Eq + Hash,
{
    type Config = C;

    fn choose_config(&self, problem: &K) -> C {
        self.select(problem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Tile {
        block: usize,
    }

    fn table() -> ConfigTable<Tile, usize> {
        ConfigTable::new(
            "test",
            vec![Tile { block: 8 }, Tile { block: 32 }, Tile { block: 128 }],
        )
        .unwrap()
        .with_prune(|tile, n| tile.block <= *n)
    }

    #[test]
    fn empty_tables_are_rejected() {
        let err = ConfigTable::<Tile, usize>::new("empty", Vec::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::EmptyConfigTable { table: "empty" }));
    }

    #[test]
    fn prune_filters_by_problem() {
        let table = table();
        assert_eq!(table.candidates_for(&40), vec![Tile { block: 8 }, Tile { block: 32 }]);
        // Nothing fits: the full table is used rather than failing.
        assert_eq!(table.candidates_for(&4).len(), 3);
    }

    #[test]
    fn benchmark_hook_picks_fastest_and_caches() {
        let table = table();
        let mut calls = 0;
        let chosen = table.select_with(&256, |tile| {
            calls += 1;
            Some(Duration::from_micros(1000 / tile.block as u64))
        });
        assert_eq!(chosen, Tile { block: 128 });
        assert_eq!(calls, 3);

        let again = table.select_with(&256, |_| panic!("cached entries are not re-benchmarked"));
        assert_eq!(again, chosen);
    }

    #[test]
    fn strategy_defaults_to_first_surviving_candidate() {
        let table = table();
        assert_eq!(table.choose_config(&64), Tile { block: 8 });
        assert_eq!(table.cached(&64), Some(Tile { block: 8 }));
    }
}
