//! Anchor registry - process-wide identity → anchor table
//!
//! At most one live [`SpatialAnchor`] exists per identity. Entries are
//! weak: once every handle to an anchor is dropped the entry is dead and a
//! later lookup for that identity builds a fresh `Pending` anchor.
//!
//! Mutation happens only on the delivery task; reads are safe from any
//! thread and collections are returned as snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use anchorage_core::{AnchorId, Pose, VpsError, VpsResult};

use crate::anchor::{AnchorCell, SpatialAnchor};

/// Weak table of live anchors. Clones share the same table.
#[derive(Clone, Default)]
pub struct AnchorRegistry {
    entries: Arc<RwLock<HashMap<AnchorId, Weak<AnchorCell>>>>,
}

impl AnchorRegistry {
    pub fn new() -> Self {
        AnchorRegistry::default()
    }

    /// Get the live anchor for an identity
    pub fn get(&self, id: AnchorId) -> Option<SpatialAnchor> {
        self.entries
            .read()
            .get(&id)
            .and_then(Weak::upgrade)
            .map(SpatialAnchor::from_cell)
    }

    /// Get the live anchor or create a `Pending` one. Idempotent.
    ///
    /// Returns the anchor and whether it was created by this call.
    pub fn get_or_create(&self, id: AnchorId, default_pose: Option<Pose>) -> (SpatialAnchor, bool) {
        let mut entries = self.entries.write();
        if let Some(anchor) = entries
            .get(&id)
            .and_then(Weak::upgrade)
            .map(SpatialAnchor::from_cell)
        {
            return (anchor, false);
        }

        let anchor = SpatialAnchor::new(id, default_pose);
        if entries.insert(id, anchor.downgrade()).is_some() {
            debug!(anchor = %id, "replaced collected registry entry");
        }
        (anchor, true)
    }

    /// Insert a brand-new anchor; colliding with a live identity is an error
    pub fn insert_new(&self, id: AnchorId, pose: Option<Pose>) -> VpsResult<SpatialAnchor> {
        let mut entries = self.entries.write();
        if entries.get(&id).is_some_and(|w| w.strong_count() > 0) {
            return Err(VpsError::AlreadyExists(id));
        }

        let anchor = SpatialAnchor::new(id, pose);
        entries.insert(id, anchor.downgrade());
        Ok(anchor)
    }

    /// Remove an identity; returns the anchor if it was still alive
    pub fn remove(&self, id: AnchorId) -> Option<SpatialAnchor> {
        self.entries
            .write()
            .remove(&id)
            .and_then(|w| w.upgrade())
            .map(SpatialAnchor::from_cell)
    }

    /// Check if a live anchor exists for an identity
    pub fn contains(&self, id: AnchorId) -> bool {
        self.entries
            .read()
            .get(&id)
            .is_some_and(|w| w.strong_count() > 0)
    }

    /// Number of live anchors
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live anchor
    pub fn all(&self) -> Vec<SpatialAnchor> {
        self.entries
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .map(SpatialAnchor::from_cell)
            .collect()
    }

    /// Live anchors among the given identities, in the given order
    pub fn resolve_many(&self, ids: &[AnchorId]) -> Vec<SpatialAnchor> {
        let entries = self.entries.read();
        ids.iter()
            .filter_map(|id| entries.get(id).and_then(Weak::upgrade))
            .map(SpatialAnchor::from_cell)
            .collect()
    }

    /// Drop dead entries; returns how many were collected
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, w| w.strong_count() > 0);
        before - entries.len()
    }
}

impl std::fmt::Debug for AnchorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorRegistry")
            .field("live", &self.len())
            .finish()
    }
}
