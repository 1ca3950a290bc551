use std::time::Duration;

use stowage::libipld;
use stowage::p2p::DEFAULT_MAX_PAYLOAD;
use stowage::{CancellationToken, Error, Node};
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);

fn ctx() -> CancellationToken {
    // run with RUST_LOG=stowage=trace to watch the stream dispatching
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    CancellationToken::new()
}

// Make sure a payload sent between two fresh nodes arrives under the
// fingerprint the sender was given.
#[tokio::test]
async fn two_node_echo() {
    let node_a = Node::new("a").await.unwrap();
    let node_b = Node::new("b").await.unwrap();

    timeout(TIMEOUT, node_b.connect(node_a.addrs[0].clone()))
        .await
        .expect("timeout")
        .expect("should have connected");

    let fp = timeout(TIMEOUT, node_b.send(&ctx(), node_a.id, &b"hi data"[..]))
        .await
        .expect("timeout")
        .expect("send should succeed");

    let (sender, payload) = timeout(TIMEOUT, node_a.receive(&ctx(), &fp))
        .await
        .expect("timeout")
        .expect("receive should succeed");

    assert_eq!(sender, node_b.id);
    assert_eq!(&payload[..], b"hi data");
}

// The waiter path: the receiver blocks first, the payload arrives second.
#[tokio::test]
async fn receive_before_send() {
    let node_a = Node::new("a").await.unwrap();
    let node_b = Node::new("b").await.unwrap();

    node_b.connect(node_a.addrs[0].clone()).await.unwrap();

    let payload = b"early waiter".to_vec();
    let fp = stowage::fingerprint(
        stowage::RAW_CODEC,
        libipld::multihash::Code::Sha2_256,
        &payload,
    );

    let receiver = {
        let token = ctx();
        let host = (*node_a).clone();
        tokio::spawn(async move { host.receive(&token, &fp).await })
    };

    // give the waiter a moment to register
    tokio::time::sleep(Duration::from_millis(100)).await;
    node_b.send(&ctx(), node_a.id, payload.clone()).await.unwrap();

    let (sender, received) = timeout(TIMEOUT, receiver)
        .await
        .expect("timeout")
        .expect("join")
        .expect("receive should succeed");
    assert_eq!(sender, node_b.id);
    assert_eq!(&received[..], &payload[..]);
}

// A received payload can be written into the block store only because its
// fingerprint verifies.
#[tokio::test]
async fn received_payload_stores_verified() {
    let node_a = Node::new("a").await.unwrap();
    let node_b = Node::new("b").await.unwrap();

    node_b.connect(node_a.addrs[0].clone()).await.unwrap();
    let fp = node_b
        .send(&ctx(), node_a.id, &b"block bytes"[..])
        .await
        .unwrap();
    let (_, payload) = timeout(TIMEOUT, node_a.receive(&ctx(), &fp))
        .await
        .unwrap()
        .unwrap();

    node_a
        .repo
        .block_store()
        .put_with_fingerprint(fp, payload)
        .await
        .unwrap();
    assert!(node_a.repo.block_store().has(&fp).await.unwrap());
}

#[tokio::test]
async fn send_constraints() {
    let node_a = Node::new("a").await.unwrap();
    let node_b = Node::new("b").await.unwrap();

    node_b.connect(node_a.addrs[0].clone()).await.unwrap();

    let err = node_b
        .send(&ctx(), node_a.id, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PayloadEmpty));

    let err = node_b
        .send(&ctx(), node_a.id, vec![0u8; DEFAULT_MAX_PAYLOAD + 1])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge { .. }));

    // a maximum-sized payload still goes through
    let fp = timeout(
        TIMEOUT,
        node_b.send(&ctx(), node_a.id, vec![7u8; DEFAULT_MAX_PAYLOAD]),
    )
    .await
    .expect("timeout")
    .expect("max-sized payload should send");
    let (_, payload) = timeout(TIMEOUT, node_a.receive(&ctx(), &fp))
        .await
        .expect("timeout")
        .expect("receive should succeed");
    assert_eq!(payload.len(), DEFAULT_MAX_PAYLOAD);
}

#[tokio::test]
async fn send_to_unknown_peer_fails() {
    let node_a = Node::new("a").await.unwrap();
    let stranger = Node::new("b").await.unwrap();

    // no connection between the two
    let err = node_a
        .send(&ctx(), stranger.id, &b"data"[..])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerUnknown(_)));
}

#[tokio::test]
async fn cancelled_receive_unregisters() {
    let node_a = Node::new("a").await.unwrap();

    let fp = stowage::fingerprint(
        stowage::RAW_CODEC,
        libipld::multihash::Code::Sha2_256,
        b"never arrives",
    );

    let token = ctx();
    let waiting = {
        let host = (*node_a).clone();
        let token = token.clone();
        tokio::spawn(async move { host.receive(&token, &fp).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let err = timeout(TIMEOUT, waiting)
        .await
        .expect("timeout")
        .expect("join")
        .expect_err("cancelled receive should fail");
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn close_fails_outstanding_and_future_receives() {
    let node_a = Node::new("a").await.unwrap();

    let fp = stowage::fingerprint(
        stowage::RAW_CODEC,
        libipld::multihash::Code::Sha2_256,
        b"never arrives",
    );

    let waiting = {
        let host = (*node_a).clone();
        tokio::spawn(async move { host.receive(&CancellationToken::new(), &fp).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    node_a.close();

    let err = timeout(TIMEOUT, waiting)
        .await
        .expect("timeout")
        .expect("join")
        .expect_err("receive across close should fail");
    assert!(matches!(err, Error::Closed));

    let err = node_a.receive(&ctx(), &fp).await.unwrap_err();
    assert!(matches!(err, Error::Closed));
}

#[tokio::test]
async fn connect_is_idempotent_and_lists_peers() {
    let node_a = Node::new("a").await.unwrap();
    let node_b = Node::new("b").await.unwrap();

    for _ in 0..3 {
        // no timeout-hangs on duplicate dials
        timeout(TIMEOUT, node_a.connect(node_b.addrs[0].clone()))
            .await
            .expect("timeout")
            .expect("connect");
    }

    let peers = node_a.peers().await.unwrap();
    assert_eq!(peers, vec![node_b.id]);

    let addrs = node_a.addresses().await.unwrap();
    assert!(!addrs.is_empty());
    let full = node_a.full_addresses().await.unwrap();
    assert!(full
        .iter()
        .all(|addr| addr.to_string().ends_with(&node_a.id.to_string())));
}

#[tokio::test]
async fn stats_track_payload_flow() {
    let node_a = Node::new("a").await.unwrap();
    let node_b = Node::new("b").await.unwrap();

    node_b.connect(node_a.addrs[0].clone()).await.unwrap();
    let fp = node_b.send(&ctx(), node_a.id, &b"counted"[..]).await.unwrap();
    node_a.receive(&ctx(), &fp).await.unwrap();

    let sent = node_b.stats();
    assert_eq!(sent.payloads_sent, 1);
    assert_eq!(sent.bytes_sent, b"counted".len() as u64);

    let received = node_a.stats();
    assert_eq!(received.payloads_received, 1);
    assert_eq!(received.bytes_received, b"counted".len() as u64);
}
