//! Several nodes sharing one in-process group

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use zonecast::codec::ChunkedFileCodec;
use zonecast::config::AppConfig;
use zonecast::network::{GroupTransport, MemoryHub, MemoryLinks};
use zonecast::node::{Node, StreamBackends};
use zonecast::protocol::{ControlMessage, PeerZone, Track, ZoneId};
use zonecast::streaming::MulticastScanner;
use zonecast::zones::ZoneProperties;

fn spawn_node(hub: &MemoryHub, name: &str) -> Arc<Node> {
    let mut config = AppConfig::default();
    config.node.name = name.to_string();
    let backends = StreamBackends {
        allocator: Arc::new(MulticastScanner::with_check(8, |_| Ok(false))),
        codec: Arc::new(ChunkedFileCodec::new(256, 64, None)),
        links: Arc::new(MemoryLinks::new()),
    };
    let node = Node::new(config, hub.join(name), backends).unwrap();
    node.start();
    node
}

/// Poll `check` until it holds or two seconds pass
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_nodes_discover_each_other() {
    let hub = MemoryHub::new();
    let kitchen = spawn_node(&hub, "kitchen");
    let patio = spawn_node(&hub, "patio");

    assert!(eventually(|| async { kitchen.registry().len() == 2 && patio.registry().len() == 2 }).await);

    // Each node also learned the other's zone
    let patio_zone = patio.local_zone().unwrap();
    assert!(eventually(|| async { kitchen.zones().contains(patio_zone) }).await);
    assert_eq!(kitchen.zones().properties_of(patio_zone).unwrap().name, "patio");
}

#[tokio::test]
async fn test_departed_peer_is_removed() {
    let hub = MemoryHub::new();
    let kitchen = spawn_node(&hub, "kitchen");
    let patio_transport = hub.join("patio");
    let mut patio_events = patio_transport.take_events().unwrap();

    // A bare member answering discovery by hand
    let patio_id = "patio-id".to_string();
    let mut patio = zonecast::protocol::Peer::new(patio_id.clone(), "patio");
    patio.address = Some(patio_transport.local_address());
    tokio::spawn({
        let transport = patio_transport.clone();
        async move {
            while let Some(event) = patio_events.recv().await {
                if let zonecast::network::TransportEvent::Message { from, message } = event {
                    if matches!(message, zonecast::protocol::GroupMessage::Discovery) {
                        let _ = transport.send(&from, &zonecast::protocol::GroupMessage::PeerData(patio.clone()));
                    }
                }
            }
        }
    });

    assert!(eventually(|| async { kitchen.registry().lookup(&patio_id).is_some() }).await);

    hub.leave(&patio_transport.local_address());
    assert!(eventually(|| async { kitchen.registry().lookup(&patio_id).is_none() }).await);
    assert_eq!(kitchen.registry().len(), 1);
}

#[tokio::test]
async fn test_late_joiner_adopts_zone_map() {
    let hub = MemoryHub::new();
    let kitchen = spawn_node(&hub, "kitchen");
    let party = ZoneId::new();
    let replies = kitchen
        .handle_control(ControlMessage::NewZone {
            zone: party,
            properties: ZoneProperties::new("Party"),
        })
        .await;
    assert!(replies.is_empty());

    let patio = spawn_node(&hub, "patio");
    assert!(eventually(|| async { patio.zones().contains(party) }).await);
    assert_eq!(patio.zones().properties_of(party).unwrap().name, "Party");
}

#[tokio::test]
async fn test_queue_and_zone_edits_propagate() {
    let hub = MemoryHub::new();
    let kitchen = spawn_node(&hub, "kitchen");
    let patio = spawn_node(&hub, "patio");
    assert!(eventually(|| async { kitchen.registry().len() == 2 && patio.registry().len() == 2 }).await);

    let zone = kitchen.local_zone().unwrap();
    assert!(eventually(|| async { patio.zones().contains(zone) }).await);
    let first = Track::new(1, "First", "Band", 1000);
    let second = Track::new(2, "Second", "Band", 1000);
    kitchen
        .handle_control(ControlMessage::QueueBack { zone, track: first.clone() })
        .await;
    kitchen
        .handle_control(ControlMessage::QueueBack { zone, track: second.clone() })
        .await;

    assert!(eventually(|| async { patio.zones().properties_of(zone).map(|p| p.queue.len() == 2).unwrap_or(false) }).await);
    // Tail plays first
    assert_eq!(patio.zones().current(zone), Some(first.clone()));
    assert_eq!(kitchen.zones().properties_of(zone).unwrap().queue.len(), 2);

    // Move patio into the kitchen's zone
    let patio_id = patio.local_id().to_string();
    kitchen
        .handle_control(ControlMessage::PeerZoneChange {
            peers: vec![PeerZone {
                peer: patio_id.clone(),
                zone,
            }],
        })
        .await;
    assert!(eventually(|| async { patio.local_zone() == Some(zone) }).await);
    assert_eq!(kitchen.registry().peers_in_zone(zone).len(), 2);
}

#[tokio::test]
async fn test_rename_reaches_other_nodes() {
    let hub = MemoryHub::new();
    let kitchen = spawn_node(&hub, "kitchen");
    let patio = spawn_node(&hub, "patio");
    assert!(eventually(|| async { patio.registry().len() == 2 }).await);

    kitchen
        .handle_control(ControlMessage::Rename {
            name: "Big kitchen".into(),
        })
        .await;
    let id = kitchen.local_id().to_string();
    assert!(eventually(|| async { patio.registry().lookup(&id).map(|p| p.name == "Big kitchen").unwrap_or(false) }).await);
}
