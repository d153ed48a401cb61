//! Mutation batcher: partitions pending mutations into per-user batches.
//!
//! Batches come out as an ordered list. A mutation joins the earliest batch
//! of its user that is not before the latest batch already holding its
//! entity, so applying batches in list order preserves per-entity creation
//! order even when two users touched the same entity.

use std::collections::HashMap;

use tracing::error;

use crate::error::SyncError;
use crate::types::{EntityKind, Mutation};

/// Mutations of one user, submitted as a single atomic remote batch.
#[derive(Debug, Clone, PartialEq)]
pub struct UserBatch {
    pub user_id: String,
    /// In creation order
    pub mutations: Vec<Mutation>,
}

impl UserBatch {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            mutations: Vec::new(),
        }
    }

    pub fn entity_keys(&self) -> impl Iterator<Item = EntityKey> + '_ {
        self.mutations.iter().map(EntityKey::of)
    }
}

/// Identity of the entity a mutation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn of(mutation: &Mutation) -> Self {
        Self {
            kind: mutation.entity_kind.clone(),
            id: mutation.entity_id.clone(),
        }
    }
}

/// Output of `plan_batches`.
#[derive(Debug, Default)]
pub struct BatchPlan {
    pub batches: Vec<UserBatch>,
    /// Mutations the gateway could not interpret, with the reason
    pub rejected: Vec<(Mutation, SyncError)>,
}

impl BatchPlan {
    pub fn mutation_count(&self) -> usize {
        self.batches.iter().map(|b| b.mutations.len()).sum()
    }
}

/// Group `mutations` into ordered per-user batches.
///
/// Input is sorted by `sequence` first, so callers may pass mutations in any
/// order. Mutations with an unrecognized kind never reach a batch.
pub fn plan_batches(mut mutations: Vec<Mutation>) -> BatchPlan {
    mutations.sort_by_key(|m| m.sequence);

    let mut plan = BatchPlan::default();
    // entity -> index of the latest batch holding one of its mutations
    let mut entity_floor: HashMap<EntityKey, usize> = HashMap::new();

    for mutation in mutations {
        if !mutation.entity_kind.is_supported() {
            error!(
                mutation_id = %mutation.id,
                kind = %mutation.entity_kind,
                "skipping mutation with unsupported kind"
            );
            let err = SyncError::UnsupportedMutation {
                id: mutation.id.clone(),
                kind: mutation.entity_kind.to_string(),
            };
            plan.rejected.push((mutation, err));
            continue;
        }

        let key = EntityKey::of(&mutation);
        let floor = entity_floor.get(&key).copied().unwrap_or(0);
        let slot = plan
            .batches
            .iter()
            .enumerate()
            .skip(floor)
            .find(|(_, batch)| batch.user_id == mutation.user_id)
            .map(|(index, _)| index);

        let index = match slot {
            Some(index) => index,
            None => {
                plan.batches.push(UserBatch::new(&mutation.user_id));
                plan.batches.len() - 1
            }
        };

        entity_floor.insert(key, index);
        plan.batches[index].mutations.push(mutation);
    }

    plan
}
