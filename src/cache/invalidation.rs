//! Relation-driven invalidation of the elements cache.
//!
//! When an entity changes, every entity related to it (as parent or child)
//! that is resident in a published store has its elements-level values
//! cleared, in both preview modes and for every culture. The changed entity's
//! own elements-level values are cleared too.

use std::ops::AddAssign;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::application::repos::RelationService;
use crate::domain::kits::ContentNodeKit;
use crate::domain::relations::neighbor_ids;

use super::elements::ElementsCache;
use super::published::ContentTypeCache;
use super::snapshot::SnapshotContentStore;

/// What one invalidation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationOutcome {
    /// Distinct related ids found through the relation service.
    pub neighbors: usize,
    /// Related ids resident in a published store.
    pub resident: usize,
    /// Elements cache entries removed.
    pub cleared: usize,
    /// The relation lookup failed and neighbors were not visited.
    pub skipped: bool,
}

impl AddAssign for InvalidationOutcome {
    fn add_assign(&mut self, other: Self) {
        self.neighbors += other.neighbors;
        self.resident += other.resident;
        self.cleared += other.cleared;
        self.skipped |= other.skipped;
    }
}

pub struct ElementsInvalidator {
    relations: Arc<dyn RelationService>,
    elements: Arc<ElementsCache>,
    content_types: Arc<ContentTypeCache>,
    stores: Vec<Arc<SnapshotContentStore>>,
}

impl ElementsInvalidator {
    pub fn new(
        relations: Arc<dyn RelationService>,
        elements: Arc<ElementsCache>,
        content_types: Arc<ContentTypeCache>,
        stores: Vec<Arc<SnapshotContentStore>>,
    ) -> Self {
        Self {
            relations,
            elements,
            content_types,
            stores,
        }
    }

    /// Clear elements-level values that depend on `changed_id`.
    ///
    /// `changed` is the entity's kit when it is known (for a delete, the kit
    /// that was removed). A failing relation lookup is logged and reported
    /// in the outcome; it never fails the caller.
    pub async fn invalidate(
        &self,
        changed_id: i32,
        changed: Option<&ContentNodeKit>,
    ) -> InvalidationOutcome {
        let mut outcome = InvalidationOutcome::default();
        if let Some(kit) = changed {
            outcome.cleared += self.clear_kit(kit);
        }

        let (as_parent, as_child) = futures::join!(
            self.relations.get_by_parent_id(changed_id),
            self.relations.get_by_child_id(changed_id)
        );
        let (as_parent, as_child) = match (as_parent, as_child) {
            (Ok(as_parent), Ok(as_child)) => (as_parent, as_child),
            (Err(err), _) | (_, Err(err)) => {
                warn!(
                    content_id = changed_id,
                    error = %err,
                    "Relation lookup failed; skipping elements cache invalidation"
                );
                outcome.skipped = true;
                return outcome;
            }
        };

        let neighbors = neighbor_ids(changed_id, &as_parent, &as_child);
        outcome.neighbors = neighbors.len();
        for id in neighbors {
            for store in &self.stores {
                if let Some(kit) = store.get_by_id(id) {
                    outcome.resident += 1;
                    outcome.cleared += self.clear_kit(&kit);
                }
            }
        }

        debug!(
            content_id = changed_id,
            neighbors = outcome.neighbors,
            resident = outcome.resident,
            cleared = outcome.cleared,
            "Elements cache invalidated"
        );
        outcome
    }

    /// Drop every elements-level value, used when whole trees or types change.
    pub fn clear_all(&self) {
        let cleared = self.elements.len();
        self.elements.clear();
        debug!(cleared, "Elements cache cleared");
    }

    /// Every property of the kit's type is scanned for elements-level ones.
    /// Each is cleared for every culture it was cached under, including
    /// cultures the kit no longer carries.
    fn clear_kit(&self, kit: &ContentNodeKit) -> usize {
        let Some(content_type) = self.content_types.get(kit.content_type_id()) else {
            return 0;
        };
        content_type
            .elements_level_properties()
            .map(|property| self.elements.remove_property(kit.key(), &property.alias))
            .sum()
    }
}
