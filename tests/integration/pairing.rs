use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tsync_services::{ConnStatus, TrustDecision};
use tsyncd::ServerError;

use crate::*;

/// Start two nodes and wait until each lists the other.
async fn discovered_pair(
    port: u16,
    a: ServerConfig,
    b: ServerConfig,
) -> Option<(Vec<Server>, Peer, Peer)> {
    let nodes = start_nodes(port, vec![a, b]).await?;
    let found = wait_until(Duration::from_secs(3), || {
        find_peer(&nodes[0], "beta").is_some() && find_peer(&nodes[1], "alpha").is_some()
    })
    .await;
    assert!(found, "nodes did not discover each other");
    let beta = find_peer(&nodes[0], "beta")?;
    let alpha = find_peer(&nodes[1], "alpha")?;
    Some((nodes, alpha, beta))
}

/// Collects `(sender name, payload)` for every delivered payload.
fn collect_data(config: &mut ServerConfig) -> mpsc::UnboundedReceiver<(String, Vec<u8>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    config.on_data = Some(Arc::new(move |peer: &Peer, data: &[u8]| {
        let _ = tx.send((peer.name.clone(), data.to_vec()));
    }));
    rx
}

/// Request, accept, key agreement, then signed payloads both ways.
#[tokio::test]
async fn test_accepted_request_pairs() {
    let mut a = node("alpha", 39_201);
    let mut b = node("beta", 39_201);
    let mut a_rx = collect_data(&mut a);
    let mut b_rx = collect_data(&mut b);
    let Some((nodes, alpha, beta)) = discovered_pair(39_201, a, b).await else {
        return;
    };
    let (a, b) = (&nodes[0], &nodes[1]);

    a.connect_to_peer(&beta).await.unwrap();
    assert_eq!(status(a, &beta), Some(ConnStatus::ConnSent));
    assert!(
        wait_until(Duration::from_secs(2), || {
            status(b, &alpha) == Some(ConnStatus::Incoming)
        })
        .await,
        "request never arrived"
    );

    // Nothing moves until beta's user answers
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(status(a, &beta), Some(ConnStatus::ConnSent));
    assert!(matches!(
        a.send_data(&beta, b"too early").await,
        Err(ServerError::NotConnected { .. })
    ));

    b.accept_request(&alpha).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || status(a, &beta) == Some(ConnStatus::Connected)
            && status(b, &alpha) == Some(ConnStatus::Connected))
        .await,
        "pairing never completed"
    );

    let a_session = a.connections().get(&beta).unwrap().session.unwrap();
    let b_session = b.connections().get(&alpha).unwrap().session.unwrap();
    assert_eq!(a_session.key().as_bytes(), b_session.key().as_bytes());
    assert_eq!(a.trust().check(&beta), TrustDecision::Pinned);
    assert_eq!(b.trust().check(&alpha), TrustDecision::Pinned);

    a.send_data(&beta, b"hello beta").await.unwrap();
    b.send_data(&alpha, b"hello alpha").await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), b_rx.recv()).await.unwrap();
    assert_eq!(got, Some(("alpha".to_string(), b"hello beta".to_vec())));
    let got = tokio::time::timeout(Duration::from_secs(2), a_rx.recv()).await.unwrap();
    assert_eq!(got, Some(("beta".to_string(), b"hello alpha".to_vec())));

    // Application data shaped like a key share is still just data
    a.send_data(&beta, b"ecdh1 x.sneaky").await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), b_rx.recv()).await.unwrap();
    assert_eq!(got, Some(("alpha".to_string(), b"ecdh1 x.sneaky".to_vec())));
    assert_eq!(
        a.connections().get(&beta).unwrap().session.unwrap().key().as_bytes(),
        a_session.key().as_bytes()
    );

    a.disconnect(&beta).unwrap();
    assert_eq!(status(a, &beta), Some(ConnStatus::Disconnected));

    stop_all(&nodes).await;
}

/// A rejected request fails on the requesting side.
#[tokio::test]
async fn test_rejected_request_fails() {
    let Some((nodes, alpha, beta)) =
        discovered_pair(39_202, node("alpha", 39_202), node("beta", 39_202)).await
    else {
        return;
    };
    let (a, b) = (&nodes[0], &nodes[1]);

    a.connect_to_peer(&beta).await.unwrap();
    let arrived = wait_until(Duration::from_secs(2), || {
        status(b, &alpha) == Some(ConnStatus::Incoming)
    })
    .await;
    assert!(arrived, "request never arrived");

    b.reject_request(&alpha, "not now").await.unwrap();
    assert_eq!(status(b, &alpha), Some(ConnStatus::Failed));
    assert!(
        wait_until(Duration::from_secs(2), || status(a, &beta) == Some(ConnStatus::Failed)).await,
        "rejection never arrived"
    );
    assert_eq!(b.trust().check(&alpha), TrustDecision::Unknown);
    assert!(matches!(
        b.accept_request(&alpha).await,
        Err(ServerError::NoPendingRequest { .. })
    ));

    stop_all(&nodes).await;
}

/// With auto-accept on, the responder pairs without being asked.
#[tokio::test]
async fn test_auto_accept_pairs_immediately() {
    let mut b = node("beta", 39_203);
    b.auto_accept = true;
    let Some((nodes, alpha, beta)) = discovered_pair(39_203, node("alpha", 39_203), b).await else {
        return;
    };
    let (a, b) = (&nodes[0], &nodes[1]);

    a.connect_to_peer(&beta).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || status(a, &beta) == Some(ConnStatus::Connected)
            && status(b, &alpha) == Some(ConnStatus::Connected))
        .await,
        "auto-accepted pairing never completed"
    );

    stop_all(&nodes).await;
}

/// Pairing calls fail cleanly once the engine has stopped.
#[tokio::test]
async fn test_stopped_engine_refuses_pairing() {
    let Some((nodes, _alpha, beta)) =
        discovered_pair(39_204, node("alpha", 39_204), node("beta", 39_204)).await
    else {
        return;
    };
    let a = &nodes[0];
    a.stop().await;
    a.stop().await;

    assert!(matches!(a.connect_to_peer(&beta).await, Err(ServerError::NotRunning)));
    assert!(matches!(
        a.send_data(&beta, b"late").await,
        Err(ServerError::NotRunning)
    ));

    stop_all(&nodes).await;
}
