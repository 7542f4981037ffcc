//! Loopback integration: one-shot RPCs against a live inbound listener.
//!
//! Node B runs the real stack (listener → pool → queue → RIB); the test
//! plays node A using the RPC sink directly and observes B's published
//! state after each call settles.

use std::sync::Arc;
use std::time::Duration;

use trellis_core::action::{Action, RouteUpdate, UpdateEntry};
use trellis_core::config::NodeConfig;
use trellis_core::route::{ConnectionStatus, PeerInfo, PeerRecord, Protocol, Route};
use trellis_peering::monitor::{create_monitor, NodeEvent};
use trellis_peering::pool::ConnectionPool;
use trellis_peering::queue::QueueRunner;
use trellis_peering::rib::{Rib, StateHandle};
use trellis_peering::sink::{NullSink, PeerSink, RpcSink};

fn spawn_node_b(port: u16) -> (StateHandle, trellis_peering::queue::QueueHandle, trellis_peering::monitor::NodeMonitor) {
    let config = NodeConfig::new("node-b", format!("http://127.0.0.1:{port}"))
        .with_tick_interval(Duration::from_millis(50));
    let rib = Rib::new(config);
    let state = rib.handle();
    let (events, monitor) = create_monitor();
    let (queue, runner) = QueueRunner::new(rib, Arc::new(NullSink), events);
    compio::runtime::spawn(runner.run()).detach();

    let listener_queue = queue.clone();
    compio::runtime::spawn(async move {
        let listener = compio::net::TcpListener::bind(format!("127.0.0.1:{port}").as_str())
            .await
            .expect("bind loopback");
        ConnectionPool::new().serve(listener, listener_queue).await;
    })
    .detach();

    (state, queue, monitor)
}

fn peer_record_for_b(port: u16) -> PeerRecord {
    let info = PeerInfo::new("node-b", format!("http://127.0.0.1:{port}")).with_token("tok-b");
    let mut record = PeerRecord::initializing(&info, Some(60));
    record.status = ConnectionStatus::Connected;
    record
}

fn a_info() -> PeerInfo {
    PeerInfo::new("node-a", "http://127.0.0.1:1").with_token("tok-a")
}

async fn settle() {
    compio::time::sleep(Duration::from_millis(30)).await;
}

#[test]
fn full_dialogue_over_loopback() {
    let port = portpicker::pick_unused_port().expect("free port");
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let (state, queue, monitor) = spawn_node_b(port);
        settle().await;

        // B learns about A through its admin surface
        queue
            .submit(Action::LocalPeerCreate(a_info()))
            .await
            .unwrap();

        let sink = RpcSink::new(
            &NodeConfig::new("node-a", "http://127.0.0.1:1")
                .with_rpc_deadline(Duration::from_secs(2))
                .with_node_token("tok-a"),
        );
        let local = a_info();
        let target = peer_record_for_b(port);

        // open: B marks the session connected
        sink.send_open(&target, &local).await.unwrap();
        settle().await;
        let table_snapshot = state.table();
        let peer = table_snapshot.peer("node-a").expect("peer recorded");
        assert_eq!(peer.status, ConnectionStatus::Connected);

        // update: B stores the learned route and stamps an egress port
        let update = RouteUpdate::new(vec![UpdateEntry::add(
            Route::new("service-a", Protocol::Http, "http://a:8080").with_port(5000),
            smallvec::smallvec!["node-a".to_string()],
        )]);
        sink.send_update(&target, &local, &update).await.unwrap();
        settle().await;
        let table = state.table();
        let learned = table.internal_route("service-a", "node-a").expect("route learned");
        assert_eq!(learned.route.envoy_port, Some(5000));
        assert_eq!(learned.node_path.as_slice(), ["node-a".to_string()]);

        // keepalive refreshes the hold timer
        let before = state.table().peer("node-a").unwrap().last_received.unwrap();
        compio::time::sleep(Duration::from_millis(20)).await;
        sink.send_keepalive(&target, &local).await.unwrap();
        settle().await;
        let after = state.table().peer("node-a").unwrap().last_received.unwrap();
        assert!(after >= before);

        // close: peer and its routes disappear
        sink.send_close(&target, &local, 1000, Some("shutting down"))
            .await
            .unwrap();
        settle().await;
        let table = state.table();
        assert!(table.peer("node-a").is_none());
        assert!(table.internal_route("service-a", "node-a").is_none());

        // the monitor saw the lifecycle
        let events: Vec<NodeEvent> = monitor.drain().collect();
        assert!(events.iter().any(|e| matches!(e, NodeEvent::PeerUp { peer } if peer == "node-a")));
        assert!(events.iter().any(|e| matches!(e, NodeEvent::PeerDown { peer } if peer == "node-a")));
        assert!(events
            .iter()
            .any(|e| matches!(e, NodeEvent::RoutesChanged { .. })));
    });
}

#[test]
fn unknown_caller_is_rejected() {
    let port = portpicker::pick_unused_port().expect("free port");
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let (state, _queue, _monitor) = spawn_node_b(port);
        settle().await;

        let sink = RpcSink::new(
            &NodeConfig::new("node-x", "http://127.0.0.1:1")
                .with_rpc_deadline(Duration::from_secs(2))
                .with_node_token("tok-x"),
        );
        // B has never heard of node-x: the open is rejected
        let error = sink
            .send_open(
                &peer_record_for_b(port),
                &PeerInfo::new("node-x", "http://127.0.0.1:1"),
            )
            .await
            .unwrap_err();
        assert!(error.to_string().contains("Peer not found"));
        assert!(state.table().internal.peers.is_empty());
    });
}

#[test]
fn unreachable_peer_settles_rejected() {
    compio::runtime::Runtime::new().unwrap().block_on(async {
        let sink = RpcSink::new(
            &NodeConfig::new("node-a", "http://127.0.0.1:1")
                .with_rpc_deadline(Duration::from_millis(300))
                .with_node_token("tok-a"),
        );
        let dead_port = portpicker::pick_unused_port().expect("free port");
        let target = peer_record_for_b(dead_port);
        let settled = sink
            .fan_out(
                &a_info(),
                &[trellis_core::propagate::Propagation::Keepalive { peer: target }],
            )
            .await;
        assert_eq!(settled.len(), 1);
        assert!(!settled[0].is_fulfilled());
        assert_eq!(settled[0].kind(), "keepalive");
    });
}
