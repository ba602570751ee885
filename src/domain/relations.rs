//! Relations between entities, used to find cache entries that depend on a
//! changed entity.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A directed dependency edge: the parent's cached value references the child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub parent_id: i32,
    pub child_id: i32,
    pub relation_type_alias: String,
}

impl Relation {
    pub fn new(parent_id: i32, child_id: i32, relation_type_alias: impl Into<String>) -> Self {
        Self {
            parent_id,
            child_id,
            relation_type_alias: relation_type_alias.into(),
        }
    }
}

/// Distinct ids on the far side of `id`'s relations.
///
/// Children of relations where `id` is the parent, plus parents of relations
/// where `id` is the child. The entity itself is never included.
pub fn neighbor_ids(id: i32, as_parent: &[Relation], as_child: &[Relation]) -> BTreeSet<i32> {
    as_parent
        .iter()
        .map(|r| r.child_id)
        .chain(as_child.iter().map(|r| r.parent_id))
        .filter(|neighbor| *neighbor != id)
        .collect()
}
