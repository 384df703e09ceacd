//! Loopback TCP: two factories talking over real sockets, and a three-node peer exchange.

use std::sync::Arc;
use std::time::Duration;

use peerlink_core::{CancellationToken, Multiaddr};
use peerlink_linux::config::Config;
use peerlink_linux::protocols::{Ping, EXCHANGE_PROTOCOL_ID, PING_PROTOCOL_ID};
use peerlink_linux::routing::RoutingTable;
use peerlink_linux::{build_factory, Node};

const WAIT: Duration = Duration::from_secs(10);

fn loopback() -> Multiaddr {
    "/ip4/127.0.0.1/tcp/0".parse().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn a_listens_b_dials_and_pings() {
    let token = CancellationToken::new();

    let (table_a, _added_a) = RoutingTable::new();
    let table_a = Arc::new(table_a);
    let factory_a = build_factory(table_a.clone(), Arc::new(Ping::new(Duration::from_millis(10)))).unwrap();
    let a = factory_a.create_local_peer(None, None);
    let listener = a.listen(&loopback(), &token).await.unwrap();
    table_a.set_local_listener_address(listener.address().clone()).unwrap();
    assert_ne!(listener.address().socket_addr().unwrap().port(), 0);

    let (table_b, mut added_b) = RoutingTable::new();
    let table_b = Arc::new(table_b);
    let ping_b = Arc::new(Ping::new(Duration::from_millis(10)).with_count(3));
    let factory_b = build_factory(table_b.clone(), ping_b.clone()).unwrap();
    let b = factory_b.create_local_peer(None, None);
    table_b
        .set_local_listener_address("/ip4/127.0.0.1/tcp/1".parse::<Multiaddr>().unwrap().with_peer_id(b.peer_id()))
        .unwrap();

    let remote = tokio::time::timeout(WAIT, b.dial(listener.address(), &token))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote.peer_id(), a.peer_id());

    let accepted = tokio::time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    assert_eq!(accepted.peer_id(), b.peer_id());

    tokio::time::timeout(WAIT, remote.dial(PING_PROTOCOL_ID, &token))
        .await
        .unwrap()
        .unwrap();
    assert!(ping_b.last_rtt().is_some());

    tokio::time::timeout(WAIT, remote.dial(EXCHANGE_PROTOCOL_ID, &token))
        .await
        .unwrap()
        .unwrap();
    // B learned A's listener address.
    assert!(table_b.contains(&a.peer_id()));
    let learned = added_b.recv().await.unwrap();
    assert_eq!(learned.peer_id(), Some(a.peer_id()));
    // A learned B's advertised listener address.
    assert!(table_a.contains(&b.peer_id()));

    remote.disconnect();
    tokio::time::timeout(WAIT, accepted.closed()).await.unwrap();
    token.cancel();
}

fn node_config(bootstrap: Vec<Multiaddr>) -> Config {
    Config {
        listen_addr: loopback(),
        discovery: false,
        bootstrap,
        ping_interval_secs: 1,
        ..Config::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn peers_learned_through_exchange() {
    let token = CancellationToken::new();
    let a = Node::start(&node_config(vec![]), token.clone()).await.unwrap();
    let b = Node::start(&node_config(vec![a.listener_address().clone()]), token.clone())
        .await
        .unwrap();
    let c = Node::start(&node_config(vec![b.listener_address().clone()]), token.clone())
        .await
        .unwrap();

    let a_id = a.local_peer().peer_id();
    let learned = tokio::time::timeout(WAIT, async {
        while !c.table().contains(&a_id) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(learned.is_ok(), "C never learned about A");
    assert!(b.table().contains(&a_id));

    token.cancel();
}
