mod common;

use std::sync::Arc;

use common::*;
use discmap_crawler::discovery::identity::compare_distance;
use discmap_crawler::discovery::{lookup, LookupConfig, LookupStatus, NodeId};

fn config() -> LookupConfig {
    LookupConfig::default()
}

#[tokio::test]
async fn test_converges_to_true_nearest() {
    let mut network = SimNetwork::new();
    let nodes = network.add_many(100, Behavior::Honest);
    let network = Arc::new(network);
    let session = SimSession::new(Arc::clone(&network));

    let target = random_target();
    let result = lookup(&session, &nodes[7], &target, &config()).await;

    let expected: Vec<_> = network
        .closest(target.id(), |_| true)
        .into_iter()
        .take(SIM_BUCKET_SIZE)
        .collect();
    assert_eq!(result.status, LookupStatus::Converged);
    assert_eq!(ids(&result.nodes), expected);
    assert!(result.rounds <= config().max_rounds);
}

#[tokio::test]
async fn test_terminates_with_unresponsive_nodes() {
    let mut network = SimNetwork::new();
    let honest = network.add_many(40, Behavior::Honest);
    network.add_many(20, Behavior::Silent);
    let network = Arc::new(network);
    let session = SimSession::new(Arc::clone(&network));

    let target = random_target();
    let result = lookup(&session, &honest[0], &target, &config()).await;

    // Silent nodes free slots for the next closest, so the answer covers
    // every responsive node of the nearest set and stays within one more
    let nearest = network.closest(target.id(), |_| true);
    let honest = |ids: &[NodeId]| -> Vec<NodeId> {
        ids.iter()
            .filter(|id| network.behavior(id) == Some(Behavior::Honest))
            .copied()
            .collect()
    };
    let expected = honest(&nearest[..SIM_BUCKET_SIZE]);
    let ceiling = honest(&nearest[..SIM_BUCKET_SIZE + 1]);
    let found = ids(&result.nodes);
    assert!(expected.iter().all(|id| found.contains(id)));
    assert!(found.iter().all(|id| ceiling.contains(id)));
    assert!(result.rounds <= config().max_rounds);
    assert!(result.failed > 0 || expected.len() == SIM_BUCKET_SIZE);
}

#[tokio::test]
async fn test_bounded_with_partial_knowledge() {
    let mut network = SimNetwork::new();
    let nodes = network.add_many(200, Behavior::Honest);
    network.add_many(30, Behavior::Silent);
    network.limit_knowledge(SIM_BUCKET_SIZE);
    let network = Arc::new(network);
    let session = SimSession::new(Arc::clone(&network));

    let target = random_target();
    let result = lookup(&session, &nodes[0], &target, &config()).await;

    assert!(result.rounds <= config().max_rounds);
    assert!(result.nodes.len() <= SIM_BUCKET_SIZE);
    assert!(!result.nodes.is_empty());
    for node in &result.nodes {
        assert_eq!(network.behavior(node.id()), Some(Behavior::Honest));
    }
    for pair in result.nodes.windows(2) {
        assert!(compare_distance(target.id(), pair[0].id(), pair[1].id()).is_lt());
    }
}

#[tokio::test]
async fn test_valid_and_invalid_neighbors() {
    let mut network = SimNetwork::new();
    let target = network.add(Behavior::Honest);
    let valid = network.add_many(3, Behavior::Honest);
    let invalid = network.add_many(2, Behavior::BadSignature);

    let mut neighborhood = ids(&valid);
    neighborhood.extend(ids(&invalid));
    network.set_known(target.id(), neighborhood.clone());
    for node in &valid {
        let mut known = neighborhood.clone();
        known.push(*target.id());
        network.set_known(node.id(), known);
    }

    let network = Arc::new(network);
    let session = SimSession::new(Arc::clone(&network));
    let result = lookup(&session, &target, &target, &config()).await;

    assert_eq!(result.status, LookupStatus::Converged);
    assert_eq!(sorted_ids(&result.nodes), sorted_ids(&valid));
    // Bad signatures are not retried
    assert_eq!(result.failed, 2);
    assert_eq!(result.queried, 1 + 3 + 2);
}

#[tokio::test]
async fn test_bootstrap_unreachable() {
    let mut network = SimNetwork::new();
    let bootstrap = network.add(Behavior::Silent);
    network.add_many(10, Behavior::Honest);
    let network = Arc::new(network);
    let session = SimSession::new(Arc::clone(&network));

    let result = lookup(&session, &bootstrap, &bootstrap, &config()).await;
    assert_eq!(result.status, LookupStatus::BootstrapUnreachable);
    assert!(result.nodes.is_empty());
    assert_eq!(session.queries(), 1 + config().max_retries);
}

#[tokio::test]
async fn test_round_budget_respected() {
    let mut network = SimNetwork::new();
    let nodes = network.add_many(300, Behavior::Honest);
    network.limit_knowledge(4);
    let network = Arc::new(network);
    let session = SimSession::new(Arc::clone(&network));

    let config = LookupConfig {
        fan_out: 1,
        max_rounds: 3,
        ..config()
    };
    let result = lookup(&session, &nodes[0], &random_target(), &config).await;
    assert!(result.rounds <= 3);
    // Honest nodes never time out, so every query is a single attempt
    assert_eq!(result.queried, session.queries());
}
