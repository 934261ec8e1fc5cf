//! In-memory capability registry
//!
//! Maps worker ids to capability sets and availability. Mutated by
//! registration and heartbeats, read by the orchestrator for routing.

use crate::error::{RegistryError, RegistryResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use workflow_types::{CapabilityTag, WorkerId};

/// Whether a worker can take work right now
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    #[default]
    Available,
    Busy,
    Offline,
}

/// One registered worker
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub worker_id: WorkerId,
    pub capabilities: BTreeSet<CapabilityTag>,
    pub availability: Availability,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Selection sequence number of the last time this worker was picked
    pub last_selected: Option<u64>,
}

impl WorkerEntry {
    pub fn can_serve(&self, capability: &CapabilityTag) -> bool {
        self.availability == Availability::Available && self.capabilities.contains(capability)
    }
}

/// Capability registry with least-recently-used selection
pub struct CapabilityRegistry {
    entries: DashMap<WorkerId, WorkerEntry>,
    /// Serializes selection so concurrent callers rotate correctly
    selection_seq: Mutex<u64>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            selection_seq: Mutex::new(0),
        }
    }

    /// Register a worker as available with the given capabilities
    pub fn register<I>(&self, worker_id: WorkerId, capabilities: I) -> RegistryResult<()>
    where
        I: IntoIterator<Item = CapabilityTag>,
    {
        if self.entries.contains_key(&worker_id) {
            return Err(RegistryError::AlreadyRegistered(worker_id));
        }
        let now = Utc::now();
        let entry = WorkerEntry {
            worker_id: worker_id.clone(),
            capabilities: capabilities.into_iter().collect(),
            availability: Availability::Available,
            registered_at: now,
            last_heartbeat: now,
            last_selected: None,
        };
        info!(
            worker_id = %worker_id,
            capabilities = entry.capabilities.len(),
            "Worker registered"
        );
        self.entries.insert(worker_id, entry);
        Ok(())
    }

    pub fn deregister(&self, worker_id: &WorkerId) -> RegistryResult<WorkerEntry> {
        let (_, entry) = self
            .entries
            .remove(worker_id)
            .ok_or_else(|| RegistryError::WorkerNotFound(worker_id.clone()))?;
        info!(worker_id = %worker_id, "Worker deregistered");
        Ok(entry)
    }

    /// Record a heartbeat and the availability it reports
    pub fn heartbeat(&self, worker_id: &WorkerId, availability: Availability) -> RegistryResult<()> {
        let mut entry = self
            .entries
            .get_mut(worker_id)
            .ok_or_else(|| RegistryError::WorkerNotFound(worker_id.clone()))?;
        entry.last_heartbeat = Utc::now();
        entry.availability = availability;
        Ok(())
    }

    pub fn set_availability(
        &self,
        worker_id: &WorkerId,
        availability: Availability,
    ) -> RegistryResult<()> {
        let mut entry = self
            .entries
            .get_mut(worker_id)
            .ok_or_else(|| RegistryError::WorkerNotFound(worker_id.clone()))?;
        if entry.availability != availability {
            debug!(worker_id = %worker_id, availability = ?availability, "Availability changed");
        }
        entry.availability = availability;
        Ok(())
    }

    /// Mark workers whose last heartbeat is older than `max_age` offline.
    ///
    /// Returns the workers that went offline.
    pub fn expire_stale(&self, max_age: Duration) -> Vec<WorkerId> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut expired = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if entry.availability != Availability::Offline && now - entry.last_heartbeat > max_age {
                entry.availability = Availability::Offline;
                expired.push(entry.worker_id.clone());
            }
        }

        if !expired.is_empty() {
            warn!(count = expired.len(), "Workers went offline after missing heartbeats");
        }
        expired.sort();
        expired
    }

    /// Available workers holding `capability`, ordered by id
    pub fn capable_workers(&self, capability: &CapabilityTag) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self
            .entries
            .iter()
            .filter(|e| e.can_serve(capability))
            .map(|e| e.worker_id.clone())
            .collect();
        workers.sort();
        workers
    }

    /// Pick up to `count` available workers holding `capability`.
    ///
    /// Least recently selected first; never-selected workers come before
    /// any selected one, ties break by worker id. Workers in `exclude` are
    /// skipped. Picked workers are marked as just selected.
    pub fn select(
        &self,
        capability: &CapabilityTag,
        count: usize,
        exclude: &[WorkerId],
    ) -> Vec<WorkerId> {
        let mut seq = self.selection_seq.lock();

        let mut candidates: Vec<(Option<u64>, WorkerId)> = self
            .entries
            .iter()
            .filter(|e| e.can_serve(capability) && !exclude.contains(&e.worker_id))
            .map(|e| (e.last_selected, e.worker_id.clone()))
            .collect();
        // None sorts before Some
        candidates.sort();

        let chosen: Vec<WorkerId> = candidates
            .into_iter()
            .take(count)
            .map(|(_, id)| id)
            .collect();

        for worker_id in &chosen {
            *seq += 1;
            if let Some(mut entry) = self.entries.get_mut(worker_id) {
                entry.last_selected = Some(*seq);
            }
        }

        debug!(
            capability = %capability,
            requested = count,
            selected = chosen.len(),
            "Workers selected"
        );
        chosen
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<WorkerEntry> {
        self.entries.get(worker_id).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<WorkerEntry> {
        let mut all: Vec<WorkerEntry> = self.entries.iter().map(|e| e.clone()).collect();
        all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> CapabilityTag {
        CapabilityTag::new(s)
    }

    fn wid(s: &str) -> WorkerId {
        WorkerId::new(s)
    }

    fn registry_with(workers: &[(&str, &[&str])]) -> CapabilityRegistry {
        let registry = CapabilityRegistry::new();
        for (id, caps) in workers {
            registry
                .register(wid(id), caps.iter().map(|c| tag(c)))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry_with(&[("a", &["billing"]), ("b", &["billing", "refunds"])]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capable_workers(&tag("refunds")), vec![wid("b")]);
        assert_eq!(
            registry.capable_workers(&tag("billing")),
            vec![wid("a"), wid("b")]
        );
        assert!(registry.capable_workers(&tag("shipping")).is_empty());

        let entry = registry.get(&wid("a")).unwrap();
        assert_eq!(entry.availability, Availability::Available);
        assert!(entry.last_selected.is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = registry_with(&[("a", &["billing"])]);
        assert!(matches!(
            registry.register(wid("a"), [tag("billing")]),
            Err(RegistryError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn test_unknown_worker_errors() {
        let registry = CapabilityRegistry::new();
        assert!(matches!(
            registry.heartbeat(&wid("ghost"), Availability::Available),
            Err(RegistryError::WorkerNotFound(_))
        ));
        assert!(registry.deregister(&wid("ghost")).is_err());
    }

    #[test]
    fn test_lru_rotation() {
        let registry = registry_with(&[
            ("a", &["billing"]),
            ("b", &["billing"]),
            ("c", &["billing"]),
        ]);
        let billing = tag("billing");

        assert_eq!(registry.select(&billing, 1, &[]), vec![wid("a")]);
        assert_eq!(registry.select(&billing, 1, &[]), vec![wid("b")]);
        assert_eq!(registry.select(&billing, 1, &[]), vec![wid("c")]);
        assert_eq!(registry.select(&billing, 1, &[]), vec![wid("a")]);
        assert_eq!(registry.select(&billing, 2, &[]), vec![wid("b"), wid("c")]);
    }

    #[test]
    fn test_new_worker_selected_first() {
        let registry = registry_with(&[("a", &["billing"]), ("b", &["billing"])]);
        let billing = tag("billing");
        registry.select(&billing, 2, &[]);

        registry.register(wid("z"), [billing.clone()]).unwrap();
        assert_eq!(registry.select(&billing, 1, &[]), vec![wid("z")]);
    }

    #[test]
    fn test_select_skips_unavailable_and_excluded() {
        let registry = registry_with(&[
            ("a", &["billing"]),
            ("b", &["billing"]),
            ("c", &["billing"]),
        ]);
        let billing = tag("billing");
        registry.set_availability(&wid("a"), Availability::Busy).unwrap();

        assert_eq!(
            registry.select(&billing, 3, &[wid("b")]),
            vec![wid("c")]
        );
        assert!(registry.select(&tag("shipping"), 3, &[]).is_empty());
    }

    #[test]
    fn test_expire_stale() {
        let registry = registry_with(&[("a", &["billing"]), ("b", &["billing"])]);
        if let Some(mut entry) = registry.entries.get_mut(&wid("a")) {
            entry.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        }

        let expired = registry.expire_stale(Duration::from_secs(60));
        assert_eq!(expired, vec![wid("a")]);
        assert_eq!(registry.capable_workers(&tag("billing")), vec![wid("b")]);

        registry.heartbeat(&wid("a"), Availability::Available).unwrap();
        assert_eq!(registry.capable_workers(&tag("billing")).len(), 2);
    }

    #[test]
    fn test_entry_serde() {
        let registry = registry_with(&[("a", &["billing"])]);
        let json = serde_json::to_value(registry.get(&wid("a")).unwrap()).unwrap();
        assert_eq!(json["availability"], "available");
    }
}
