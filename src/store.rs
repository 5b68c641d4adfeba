use crate::observation::Observation;
use crate::{AtmoError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One stored record together with the wall-clock time of its last accepted
/// update, in milliseconds since the Unix epoch. The timestamp drives both
/// TTL expiry and the capacity-eviction victim choice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreEntry {
    /// the station's most recent observation
    pub observation: Observation,
    /// wall-clock of the last accepted update for this station
    pub last_update_ms: u64,
}

/// outcome of a [`ObservationStore::put_or_replace`] call
#[derive(Debug, PartialEq)]
pub enum PutOutcome {
    /// first record for this station id; `evicted` names the station that was
    /// removed to make room, when the store was already at capacity
    Created {
        /// id of the entry evicted to keep the store within its bound
        evicted: Option<String>,
    },
    /// an existing station's record was overwritten
    Updated,
}

/// The bounded, expiring observation index owned by the aggregation server.
///
/// Holds at most `max_stations` entries keyed by station id. A new id arriving
/// at capacity evicts the entry with the oldest update time (ties broken by
/// lexicographically smallest id), so the bound holds at every observable
/// point. Entries older than the TTL are invisible to reads and removed by
/// [`expire`](ObservationStore::expire).
///
/// The whole map is snapshotted to a JSON file: written to a `.tmp` sibling,
/// fsynced, then atomically renamed into place, so no reader or recoverer can
/// observe a torn snapshot.
#[derive(Debug)]
pub struct ObservationStore {
    // snapshot file location, owned exclusively by this store
    path: PathBuf,
    // capacity bound K
    max_stations: usize,
    // entry lifetime T in milliseconds
    ttl_ms: u64,
    // the single flat index; BTreeMap gives stable response order and the
    // deterministic eviction tie-break
    entries: BTreeMap<String, StoreEntry>,
}

impl ObservationStore {
    /// opens a store backed by the snapshot file at `path`, restoring any
    /// snapshot found there. An absent, empty or corrupt file starts the
    /// store empty.
    ///
    /// # Errors
    /// returns [`AtmoError::Io`] if the file exists but cannot be read
    pub fn open(path: impl Into<PathBuf>, max_stations: usize, ttl_ms: u64) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => {
                debug!(path = %path.display(), "empty snapshot file, starting empty");
                BTreeMap::new()
            }
            Ok(content) => match serde_json::from_str::<BTreeMap<String, StoreEntry>>(&content) {
                Ok(entries) => {
                    info!(path = %path.display(), records = entries.len(), "restored snapshot");
                    entries
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt snapshot file, starting empty");
                    BTreeMap::new()
                }
            },
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no snapshot file, starting empty");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(ObservationStore {
            path,
            max_stations,
            ttl_ms,
            entries,
        })
    }

    /// inserts or replaces the observation for its station id, stamping the
    /// entry with `now_ms`. When the id is new and the store is at capacity,
    /// the oldest entry is evicted first so the size bound is never exceeded.
    ///
    /// # Errors
    /// returns [`AtmoError::MissingId`] if the observation has no non-empty
    /// `id`; the store never holds a record whose key differs from its id
    pub fn put_or_replace(&mut self, observation: Observation, now_ms: u64) -> Result<PutOutcome> {
        let id = observation
            .station_id()
            .ok_or(AtmoError::MissingId)?
            .to_string();

        let outcome = if self.entries.contains_key(&id) {
            PutOutcome::Updated
        } else {
            let evicted = if self.entries.len() == self.max_stations {
                self.evict_oldest()
            } else {
                None
            };
            PutOutcome::Created { evicted }
        };

        self.entries.insert(
            id,
            StoreEntry {
                observation,
                last_update_ms: now_ms,
            },
        );
        Ok(outcome)
    }

    /// returns the live (non-expired) observations, in stable station-id order
    pub fn get_all(&self, now_ms: u64) -> Vec<Observation> {
        self.entries
            .values()
            .filter(|entry| !self.is_expired(entry, now_ms))
            .map(|entry| entry.observation.clone())
            .collect()
    }

    /// returns the observation for `id` iff it is present and not expired
    pub fn get_one(&self, id: &str, now_ms: u64) -> Option<Observation> {
        self.entries
            .get(id)
            .filter(|entry| !self.is_expired(entry, now_ms))
            .map(|entry| entry.observation.clone())
    }

    /// removes every entry whose last update is older than the TTL, returning
    /// the evicted station ids
    pub fn expire(&mut self, now_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now_ms))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
            info!(station = %id, "expired stale observation");
        }
        expired
    }

    /// writes the full store to the snapshot file: serialize to `<path>.tmp`,
    /// fsync, then atomically rename over the snapshot so no partial state is
    /// ever visible.
    ///
    /// # Errors
    /// returns [`AtmoError::Io`] if the temp file cannot be written or renamed
    pub fn flush(&self) -> Result<()> {
        let tmp = tmp_path(&self.path);
        let content = serde_json::to_string_pretty(&self.entries)?;
        let mut file = File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), records = self.entries.len(), "snapshot flushed");
        Ok(())
    }

    /// number of entries currently held, expired or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// true when the store holds no entries at all
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// drops every entry; used by tests to reset state between scenarios
    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    fn is_expired(&self, entry: &StoreEntry, now_ms: u64) -> bool {
        now_ms.saturating_sub(entry.last_update_ms) > self.ttl_ms
    }

    // removes and returns the id of the entry with the oldest update time,
    // ties broken by lexicographically smallest id (first in iteration order)
    fn evict_oldest(&mut self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_update_ms)
            .map(|(id, _)| id.clone())?;
        self.entries.remove(&victim);
        info!(station = %victim, "evicted oldest observation to stay within capacity");
        Some(victim)
    }
}

/// sibling temp file used for the atomic snapshot replace
fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    const K: usize = 20;
    const TTL_MS: u64 = 30_000;

    fn obs(id: &str) -> Observation {
        Observation::from_json(&format!(r#"{{"id":"{}","air_temp":13.3}}"#, id)).unwrap()
    }

    fn scratch_store(dir: &tempfile::TempDir) -> ObservationStore {
        ObservationStore::open(dir.path().join("weatherInfo.json"), K, TTL_MS).unwrap()
    }

    #[test]
    fn put_reports_created_then_updated() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = scratch_store(&dir);

        let first = store.put_or_replace(obs("IDS60901"), 1_000).unwrap();
        assert_eq!(first, PutOutcome::Created { evicted: None });

        let second = store.put_or_replace(obs("IDS60901"), 2_000).unwrap();
        assert_eq!(second, PutOutcome::Updated);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn rejects_record_without_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = scratch_store(&dir);
        let no_id = Observation::from_json(r#"{"air_temp":13.3}"#).unwrap();
        assert!(matches!(
            store.put_or_replace(no_id, 1_000),
            Err(AtmoError::MissingId)
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn capacity_bound_holds_after_every_put() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = scratch_store(&dir);

        for i in 0..25 {
            store
                .put_or_replace(obs(&format!("IDS609{:02}", i)), 1_000 + i as u64)
                .unwrap();
            assert!(store.len() <= K);
        }
        assert_eq!(store.len(), K);

        // the five oldest are gone, the twenty newest remain
        for i in 0..5 {
            assert!(store.get_one(&format!("IDS609{:02}", i), 4_000).is_none());
        }
        for i in 5..25 {
            assert!(store.get_one(&format!("IDS609{:02}", i), 4_000).is_some());
        }
    }

    #[test]
    fn eviction_victim_is_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = scratch_store(&dir);

        for i in 0..K {
            store
                .put_or_replace(obs(&format!("IDS609{:02}", i)), 1_000 + i as u64)
                .unwrap();
        }
        // refreshing the oldest entry protects it from the next eviction
        store.put_or_replace(obs("IDS60900"), 9_000).unwrap();

        let outcome = store.put_or_replace(obs("NEW00001"), 10_000).unwrap();
        assert_eq!(
            outcome,
            PutOutcome::Created {
                evicted: Some("IDS60901".to_string())
            }
        );
        assert!(store.get_one("IDS60900", 10_000).is_some());
    }

    #[test]
    fn eviction_tie_breaks_on_smallest_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = scratch_store(&dir);

        // all twenty entries share one timestamp
        for i in 0..K {
            store
                .put_or_replace(obs(&format!("IDS609{:02}", i)), 5_000)
                .unwrap();
        }
        let outcome = store.put_or_replace(obs("ZZZ99999"), 6_000).unwrap();
        assert_eq!(
            outcome,
            PutOutcome::Created {
                evicted: Some("IDS60900".to_string())
            }
        );
    }

    #[test]
    fn entries_expire_strictly_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = scratch_store(&dir);
        store.put_or_replace(obs("IDS60901"), 10_000).unwrap();

        // visible at exactly T
        assert!(store.get_one("IDS60901", 10_000 + TTL_MS).is_some());
        assert_eq!(store.expire(10_000 + TTL_MS), Vec::<String>::new());

        // gone one millisecond past T
        assert!(store.get_one("IDS60901", 10_000 + TTL_MS + 1).is_none());
        assert_eq!(
            store.expire(10_000 + TTL_MS + 1),
            vec!["IDS60901".to_string()]
        );
        assert!(store.is_empty());
    }

    #[test]
    fn expired_entries_are_invisible_to_get_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = scratch_store(&dir);
        store.put_or_replace(obs("IDS60901"), 0).unwrap();
        store.put_or_replace(obs("IDS60902"), 40_000).unwrap();

        let live = store.get_all(45_000);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].station_id(), Some("IDS60902"));
    }

    #[test]
    fn get_all_returns_stable_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = scratch_store(&dir);
        store.put_or_replace(obs("IDS60903"), 1_000).unwrap();
        store.put_or_replace(obs("IDS60901"), 2_000).unwrap();
        store.put_or_replace(obs("IDS60902"), 3_000).unwrap();

        let ids: Vec<_> = store
            .get_all(3_000)
            .iter()
            .map(|o| o.station_id().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["IDS60901", "IDS60902", "IDS60903"]);
    }

    #[test]
    fn clear_all_empties_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = scratch_store(&dir);
        store.put_or_replace(obs("IDS60901"), 1_000).unwrap();
        store.put_or_replace(obs("IDS60902"), 2_000).unwrap();

        store.clear_all();
        assert!(store.is_empty());
        assert!(store.get_all(2_000).is_empty());
    }

    #[test]
    fn snapshot_round_trips_through_flush_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weatherInfo.json");

        let mut store = ObservationStore::open(&path, K, TTL_MS).unwrap();
        store.put_or_replace(obs("IDS60901"), 1_000).unwrap();
        store.put_or_replace(obs("IDS60902"), 2_000).unwrap();
        store.flush().unwrap();

        let restored = ObservationStore::open(&path, K, TTL_MS).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(
            restored.get_one("IDS60901", 2_000),
            Some(obs("IDS60901"))
        );
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weatherInfo.json");
        fs::write(&path, "not json at all").unwrap();

        let store = ObservationStore::open(&path, K, TTL_MS).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn missing_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            ObservationStore::open(dir.path().join("nonexistent.json"), K, TTL_MS).unwrap();
        assert!(store.is_empty());
    }
}
