//! Batcher tests: grouping and per-entity ordering across users.

use std::collections::HashMap;

use survey_sync::sync::batcher::plan_batches;
use survey_sync::types::{EntityKind, Mutation, MutationType};

fn obs(seq: i64, obs_id: &str, user: &str, t: MutationType) -> Mutation {
    let mut m = Mutation::observation("s1", "f1", obs_id, user, t).with_id(format!("m{seq}"));
    m.sequence = seq;
    m
}

/// Position of every mutation id when batches are applied in order.
fn apply_order(mutations: Vec<Mutation>) -> Vec<Mutation> {
    plan_batches(mutations)
        .batches
        .into_iter()
        .flat_map(|b| b.mutations)
        .collect()
}

#[test]
fn every_batch_has_a_single_user() {
    let plan = plan_batches(vec![
        obs(1, "o1", "u1", MutationType::Create),
        obs(2, "o2", "u2", MutationType::Create),
        obs(3, "o3", "u1", MutationType::Create),
        obs(4, "o4", "u3", MutationType::Create),
    ]);
    assert_eq!(plan.batches.len(), 3);
    for batch in &plan.batches {
        assert!(batch.mutations.iter().all(|m| m.user_id == batch.user_id));
    }
}

#[test]
fn per_entity_order_survives_interleaved_users() {
    let users = ["u1", "u2", "u3"];
    let entities = ["o1", "o2", "o3", "o4"];
    let mut input = Vec::new();
    for seq in 1..=36 {
        let user = users[(seq as usize * 7) % users.len()];
        let entity = entities[(seq as usize * 5) % entities.len()];
        input.push(obs(seq, entity, user, MutationType::Update));
    }
    // feed them shuffled; the batcher sorts by sequence
    input.reverse();

    let ordered = apply_order(input);
    assert_eq!(ordered.len(), 36);

    let mut last_seen: HashMap<String, i64> = HashMap::new();
    for m in ordered {
        if let Some(prev) = last_seen.insert(m.entity_id.clone(), m.sequence) {
            assert!(
                prev < m.sequence,
                "entity {} applied {} after {}",
                m.entity_id,
                m.sequence,
                prev
            );
        }
    }
}

#[test]
fn create_precedes_update_of_another_user() {
    let ordered = apply_order(vec![
        obs(1, "o9", "u2", MutationType::Update),
        obs(2, "o1", "u1", MutationType::Create),
        obs(3, "o1", "u2", MutationType::Update),
    ]);
    let ids: Vec<_> = ordered.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
}

#[test]
fn feature_and_observation_with_same_id_are_distinct_entities() {
    let mut feature = Mutation::feature("s1", "x1", "u1", MutationType::Update);
    feature.sequence = 1;
    let observation = obs(2, "x1", "u2", MutationType::Update);
    let tail = {
        let mut m = Mutation::feature("s1", "x9", "u1", MutationType::Update);
        m.sequence = 3;
        m
    };

    let plan = plan_batches(vec![feature, observation, tail]);
    // x9 joins the first u1 batch; the observation does not block it
    assert_eq!(plan.batches.len(), 2);
    assert_eq!(plan.batches[0].mutations.len(), 2);
    assert_eq!(plan.batches[1].mutations[0].entity_kind, EntityKind::Observation);
}

#[test]
fn rejected_mutations_do_not_affect_grouping() {
    let bad = obs(2, "o1", "u2", MutationType::Update)
        .with_kind(EntityKind::Unrecognized("LEGACY".to_string()));
    let plan = plan_batches(vec![
        obs(1, "o1", "u1", MutationType::Create),
        bad,
        obs(3, "o1", "u1", MutationType::Update),
    ]);
    assert_eq!(plan.batches.len(), 1);
    assert_eq!(plan.batches[0].mutations.len(), 2);
    assert_eq!(plan.rejected.len(), 1);
    assert_eq!(plan.rejected[0].0.id, "m2");
}
