//! Visited-Set Tracker
//!
//! Per-application sets of resolved resource ids that a live module graph
//! has ingested. An explicit insertion-order sequence of application keys
//! is kept alongside the map so oldest-first eviction is a stated contract
//! rather than an accident of hash iteration order.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub(crate) struct VisitedSets {
    sets: HashMap<String, HashSet<String>>,
    /// Application keys in first-visit order
    order: Vec<String>,
}

impl VisitedSets {
    /// Idempotent add; creates the application's set lazily on first visit.
    pub fn record(&mut self, app_id: &str, id: String) {
        if !self.sets.contains_key(app_id) {
            self.sets.insert(app_id.to_string(), HashSet::new());
            self.order.push(app_id.to_string());
        }
        if let Some(set) = self.sets.get_mut(app_id) {
            set.insert(id);
        }
    }

    pub fn contains_app(&self, app_id: &str) -> bool {
        self.sets.contains_key(app_id)
    }

    pub fn ids(&self, app_id: &str) -> Vec<String> {
        self.sets
            .get(app_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove_id(&mut self, app_id: &str, id: &str) {
        if let Some(set) = self.sets.get_mut(app_id) {
            set.remove(id);
        }
    }

    pub fn is_drained(&self, app_id: &str) -> bool {
        self.sets.get(app_id).is_some_and(HashSet::is_empty)
    }

    pub fn remove_app(&mut self, app_id: &str) {
        self.sets.remove(app_id);
        self.order.retain(|key| key != app_id);
    }

    /// Application keys, oldest first
    pub fn app_ids_oldest_first(&self) -> Vec<String> {
        self.order.clone()
    }
}
