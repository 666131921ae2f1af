//! Adaptive per-(target, probe) baselines.
//!
//! The store is an explicit keyed map handed to each detection pass. Every key
//! has its own lock, so read-modify-write updates for one probe are serialized
//! while passes touching other probes or targets proceed in parallel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BaselineKey {
    pub target: String,
    pub probe_id: u64,
}

impl BaselineKey {
    pub fn new(target: impl Into<String>, probe_id: u64) -> Self {
        Self {
            target: target.into(),
            probe_id,
        }
    }
}

/// Historical expectation for one probe toward one target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Exponentially weighted average latency (ms).
    pub avg_latency: Option<f64>,
    pub latency_samples: u64,
    /// Last observed hop sequence.
    pub route: Option<Vec<String>>,
    /// Timestamps of route changes still inside the rolling window.
    pub route_changes: VecDeque<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Baseline {
    /// Route changes recorded inside the window.
    pub fn route_change_count(&self) -> usize {
        self.route_changes.len()
    }
}

/// What an update did to the stored baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaselineUpdate {
    pub route_changed: bool,
    pub route_changes_in_window: usize,
}

#[derive(Debug)]
pub struct BaselineStore {
    smoothing: f64,
    route_window: Duration,
    entries: RwLock<HashMap<BaselineKey, Arc<Mutex<Option<Baseline>>>>>,
}

impl BaselineStore {
    /// `smoothing` is the weight of the newest latency sample, in `(0, 1]`.
    pub fn new(smoothing: f64, route_window: Duration) -> Self {
        Self {
            smoothing,
            route_window,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only lookup. `None` means no history for this probe.
    pub fn get_baseline(&self, target: &str, probe_id: u64) -> Option<Baseline> {
        let key = BaselineKey::new(target, probe_id);
        let slot = self.entries.read().ok()?.get(&key).map(Arc::clone)?;
        let guard = match slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    /// Fold a new observation into the baseline for `(target, probe_id)`.
    pub fn update_baseline(
        &self,
        target: &str,
        probe_id: u64,
        latency: Option<f64>,
        route: Option<&[String]>,
    ) -> BaselineUpdate {
        self.update_baseline_at(target, probe_id, latency, route, Utc::now())
    }

    pub fn update_baseline_at(
        &self,
        target: &str,
        probe_id: u64,
        latency: Option<f64>,
        route: Option<&[String]>,
        at: DateTime<Utc>,
    ) -> BaselineUpdate {
        self.with_entry(target, probe_id, |slot| {
            self.apply(slot, latency, route, at)
        })
    }

    /// Run `f` with exclusive access to one key's slot. Detectors use this to
    /// judge a sample against the prior baseline and commit the update in one
    /// critical section.
    pub fn with_entry<R>(
        &self,
        target: &str,
        probe_id: u64,
        f: impl FnOnce(&mut Option<Baseline>) -> R,
    ) -> R {
        let key = BaselineKey::new(target, probe_id);
        let slot = self.slot(key);
        let mut guard = match slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Apply an observation to a slot already held via [`Self::with_entry`].
    pub fn apply(
        &self,
        slot: &mut Option<Baseline>,
        latency: Option<f64>,
        route: Option<&[String]>,
        at: DateTime<Utc>,
    ) -> BaselineUpdate {
        let baseline = slot.get_or_insert_with(Baseline::default);

        if let Some(sample) = latency {
            baseline.avg_latency = Some(match baseline.avg_latency {
                Some(avg) => self.smoothing * sample + (1.0 - self.smoothing) * avg,
                None => sample,
            });
            baseline.latency_samples += 1;
        }

        if let Some(cutoff) = at.checked_sub_signed(self.route_window) {
            while baseline.route_changes.front().is_some_and(|t| *t <= cutoff) {
                baseline.route_changes.pop_front();
            }
        }

        let mut route_changed = false;
        if let Some(hops) = route.filter(|hops| !hops.is_empty()) {
            if let Some(previous) = &baseline.route {
                if previous.as_slice() != hops {
                    route_changed = true;
                    baseline.route_changes.push_back(at);
                }
            }
            baseline.route = Some(hops.to_vec());
        }

        baseline.updated_at = Some(at);
        debug!(
            avg_latency = ?baseline.avg_latency,
            route_changed,
            route_changes = baseline.route_changes.len(),
            "baseline updated"
        );

        BaselineUpdate {
            route_changed,
            route_changes_in_window: baseline.route_changes.len(),
        }
    }

    /// Drop all history.
    pub fn reset(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Copy out every populated entry, ordered by key, for persistence.
    pub fn snapshot(&self) -> Vec<(BaselineKey, Baseline)> {
        let slots: Vec<(BaselineKey, Arc<Mutex<Option<Baseline>>>)> = match self.entries.read() {
            Ok(entries) => entries
                .iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect(),
            Err(_) => return Vec::new(),
        };

        let mut out: Vec<(BaselineKey, Baseline)> = slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let guard = match slot.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.clone().map(|b| (key, b))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Load previously persisted entries, replacing any existing state for those keys.
    pub fn restore(&self, entries: impl IntoIterator<Item = (BaselineKey, Baseline)>) {
        for (key, baseline) in entries {
            let slot = self.slot(key);
            let mut guard = match slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Some(baseline);
        }
    }

    fn slot(&self, key: BaselineKey) -> Arc<Mutex<Option<Baseline>>> {
        if let Ok(entries) = self.entries.read() {
            if let Some(slot) = entries.get(&key) {
                return Arc::clone(slot);
            }
        }
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(entries.entry(key).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BaselineStore {
        BaselineStore::new(0.5, Duration::hours(1))
    }

    fn route(hops: &[&str]) -> Vec<String> {
        hops.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_absent_until_first_update() {
        let store = store();
        assert!(store.get_baseline("example.com", 1).is_none());
        store.update_baseline("example.com", 1, Some(50.0), None);
        let b = store.get_baseline("example.com", 1).unwrap();
        assert_eq!(b.avg_latency, Some(50.0));
        assert_eq!(b.latency_samples, 1);
        assert!(store.get_baseline("example.com", 2).is_none());
        assert!(store.get_baseline("other.net", 1).is_none());
    }

    #[test]
    fn test_weighted_average_favors_recent() {
        let store = store();
        store.update_baseline("t", 1, Some(100.0), None);
        store.update_baseline("t", 1, Some(200.0), None);
        let b = store.get_baseline("t", 1).unwrap();
        assert_eq!(b.avg_latency, Some(150.0));
        store.update_baseline("t", 1, None, None);
        assert_eq!(store.get_baseline("t", 1).unwrap().avg_latency, Some(150.0));
    }

    #[test]
    fn test_route_change_counting() {
        let store = store();
        let now = Utc::now();
        let a = route(&["10.0.0.1", "10.0.0.2"]);
        let b = route(&["10.0.0.2", "10.0.0.1"]);

        let first = store.update_baseline_at("t", 1, None, Some(a.as_slice()), now);
        assert!(!first.route_changed);

        let same = store.update_baseline_at("t", 1, None, Some(a.as_slice()), now);
        assert!(!same.route_changed);

        // Same hops, different order is a different path.
        let changed = store.update_baseline_at("t", 1, None, Some(b.as_slice()), now);
        assert!(changed.route_changed);
        assert_eq!(changed.route_changes_in_window, 1);
        assert_eq!(store.get_baseline("t", 1).unwrap().route, Some(b));
    }

    #[test]
    fn test_route_changes_expire_outside_window() {
        let store = store();
        let start = Utc::now();
        let a = route(&["a", "b"]);
        let b = route(&["a", "c"]);
        store.update_baseline_at("t", 1, None, Some(a.as_slice()), start);
        store.update_baseline_at("t", 1, None, Some(b.as_slice()), start);
        store.update_baseline_at("t", 1, None, Some(a.as_slice()), start + Duration::minutes(10));

        let later = store.update_baseline_at("t", 1, None, Some(b.as_slice()), start + Duration::minutes(90));
        assert_eq!(later.route_changes_in_window, 1);
    }

    #[test]
    fn test_empty_route_does_not_replace() {
        let store = store();
        let a = route(&["a", "b"]);
        store.update_baseline("t", 1, None, Some(a.as_slice()));
        let empty: Vec<String> = Vec::new();
        let update = store.update_baseline("t", 1, None, Some(empty.as_slice()));
        assert!(!update.route_changed);
        assert_eq!(store.get_baseline("t", 1).unwrap().route, Some(a));
    }

    #[test]
    fn test_snapshot_restore() {
        let store = store();
        store.update_baseline("b.example", 2, Some(20.0), None);
        store.update_baseline("a.example", 1, Some(10.0), None);
        let snap = store.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].0, BaselineKey::new("a.example", 1));

        let fresh = BaselineStore::new(0.5, Duration::hours(1));
        fresh.restore(snap);
        assert_eq!(fresh.get_baseline("b.example", 2).unwrap().avg_latency, Some(20.0));

        fresh.reset();
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_concurrent_updates_same_key() {
        let store = Arc::new(BaselineStore::new(1.0, Duration::hours(1)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.update_baseline("t", 7, Some(10.0), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get_baseline("t", 7).unwrap().latency_samples, 800);
    }
}
