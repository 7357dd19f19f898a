//! Point Value Cache
//!
//! Latest observed value per point. Entries are created by the first good
//! read and replaced atomically afterwards; an update whose operation
//! completed before the stored one is discarded. Evicted points are
//! remembered so a read that completed before the eviction cannot bring them
//! back.

use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use bms_types::{PointId, PointValue, Quality, Value};

use crate::registry::{ChangeListener, RegistryChange};

#[derive(Default)]
pub struct PointValueCache {
    entries: DashMap<PointId, PointValue>,
    /// When each removed point was evicted
    evicted: DashMap<PointId, Instant>,
}

impl PointValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, point_id: PointId) -> Option<PointValue> {
        self.entries.get(&point_id).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a successful read. Returns false when a later completion won.
    pub fn update_good(&self, point_id: PointId, value: Value, completed_at: Instant) -> bool {
        match self.entries.entry(point_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().completed_at > completed_at {
                    return false;
                }
                entry.insert(PointValue::good(value, completed_at));
                true
            }
            Entry::Vacant(entry) => {
                if let Some(evicted_at) = self.evicted.get(&point_id).map(|e| *e) {
                    if evicted_at >= completed_at {
                        return false;
                    }
                    self.evicted.remove(&point_id);
                }
                entry.insert(PointValue::good(value, completed_at));
                true
            }
        }
    }

    /// Device-level failure: keep the value, mark it stale
    pub fn mark_stale(&self, point_id: PointId, error: &str, completed_at: Instant) -> bool {
        self.degrade(point_id, Quality::Stale, error, completed_at)
    }

    /// Point-level failure: keep the value, mark it in error
    pub fn mark_error(&self, point_id: PointId, error: &str, completed_at: Instant) -> bool {
        self.degrade(point_id, Quality::Error, error, completed_at)
    }

    fn degrade(&self, point_id: PointId, quality: Quality, error: &str, completed_at: Instant) -> bool {
        // Failures never create entries
        let Some(mut entry) = self.entries.get_mut(&point_id) else {
            return false;
        };
        if entry.completed_at > completed_at {
            return false;
        }
        entry.quality = quality;
        entry.error = Some(error.to_string());
        entry.completed_at = completed_at;
        true
    }

    /// Drop a point's entry and refuse reads that completed before now
    pub fn remove(&self, point_id: PointId) -> Option<PointValue> {
        self.evicted.insert(point_id, Instant::now());
        self.entries.remove(&point_id).map(|(_, v)| v)
    }
}

impl ChangeListener for PointValueCache {
    fn on_change(&self, change: &RegistryChange) {
        if let RegistryChange::PointsRemoved { point_ids, .. } = change {
            for point_id in point_ids {
                self.remove(*point_id);
            }
        }
    }
}
