use std::sync::Arc;
use std::time::Duration;

use tsync_core::crypto::Identity;
use tsyncd::EngineState;

use crate::*;

/// Two nodes find each other and see matching fingerprints.
#[tokio::test]
async fn test_two_nodes_discover_each_other() {
    let Some(nodes) = start_nodes(39_101, vec![node("alpha", 39_101), node("beta", 39_101)]).await
    else {
        return;
    };
    let (a, b) = (&nodes[0], &nodes[1]);

    assert!(
        wait_until(Duration::from_secs(3), || find_peer(a, "beta").is_some()
            && find_peer(b, "alpha").is_some())
        .await,
        "nodes did not discover each other"
    );

    let beta = find_peer(a, "beta").unwrap();
    let data = a.peers().get(&beta).unwrap();
    assert_eq!(data.human_hash, b.human_id());
    assert_eq!(data.port, b.our_address().port());
    assert!(data.epoch >= 1);
    assert_eq!(a.peers().len(), 1, "a node never lists itself");
    assert!(matches!(a.state(), EngineState::Running { epoch } if epoch >= 1));

    stop_all(&nodes).await;
}

/// Epochs only go up as seen by the other side.
#[tokio::test]
async fn test_epochs_increase() {
    let Some(nodes) = start_nodes(39_102, vec![node("alpha", 39_102), node("beta", 39_102)]).await
    else {
        return;
    };
    let (a, b) = (&nodes[0], &nodes[1]);
    assert!(wait_until(Duration::from_secs(3), || find_peer(a, "beta").is_some()).await);

    let beta = find_peer(a, "beta").unwrap();
    let first = a.peers().get(&beta).unwrap().epoch;
    assert!(
        wait_until(Duration::from_secs(3), || a
            .peers()
            .get(&beta)
            .is_some_and(|d| d.epoch > first))
        .await
    );
    let EngineState::Running { epoch } = b.state() else {
        panic!("beta stopped");
    };
    assert!(epoch >= a.peers().get(&beta).unwrap().epoch);

    stop_all(&nodes).await;
}

/// A stopped node drops out of the other node's table after the timeout.
#[tokio::test]
async fn test_silent_peer_expires() {
    let mut fast = node("alpha", 39_103);
    fast.timeout = Duration::from_millis(500);
    let Some(nodes) = start_nodes(39_103, vec![fast, node("beta", 39_103)]).await else {
        return;
    };
    let (a, b) = (&nodes[0], &nodes[1]);
    assert!(wait_until(Duration::from_secs(3), || find_peer(a, "beta").is_some()).await);

    let version = a.peers().version();
    b.stop().await;
    assert!(b.stopped());
    assert!(
        wait_until(Duration::from_secs(3), || a.peers().is_empty()).await,
        "beta never expired"
    );
    assert!(a.peers().version() > version);

    stop_all(&nodes).await;
}

/// Three nodes each see the other two.
#[tokio::test]
async fn test_three_nodes() {
    let names = ["alpha", "beta", "gamma"];
    let configs = names.iter().map(|n| node(n, 39_104)).collect();
    let Some(nodes) = start_nodes(39_104, configs).await else {
        return;
    };

    assert!(
        wait_until(Duration::from_secs(3), || nodes.iter().all(|n| n.peers().len() == 2)).await,
        "full mesh never formed"
    );
    for (node, name) in nodes.iter().zip(names) {
        assert!(find_peer(node, name).is_none());
    }

    stop_all(&nodes).await;
}

/// A second instance with the same name and identity stops; the first
/// keeps running.
#[tokio::test]
async fn test_duplicate_instance_stops() {
    let identity = Arc::new(Identity::generate().unwrap());
    let first = node_with_identity("alpha", 39_105, identity.clone());
    let Some(first) = start_nodes(39_105, vec![first]).await else {
        return;
    };
    tokio::time::sleep(Duration::from_millis(500)).await;

    let second = node_with_identity("alpha", 39_105, identity);
    let Some(second) = start_nodes(39_105, vec![second]).await else {
        stop_all(&first).await;
        return;
    };

    let twin = &second[0];
    tokio::time::timeout(Duration::from_secs(3), twin.wait_stopped())
        .await
        .expect("duplicate instance kept running");
    assert_eq!(twin.state(), EngineState::Stopped);
    assert!(!first[0].stopped());
    assert!(first[0].peers().is_empty());

    stop_all(&second).await;
    stop_all(&first).await;
}
