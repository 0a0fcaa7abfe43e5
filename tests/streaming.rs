//! Streaming a track from one node to a zone spanning two nodes

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use zonecast::codec::ChunkedFileCodec;
use zonecast::config::AppConfig;
use zonecast::network::{MemoryHub, MemoryLinks};
use zonecast::node::{Node, StreamBackends};
use zonecast::protocol::{ControlMessage, PeerZone, Role, StreamCommand, Track};
use zonecast::streaming::{MulticastScanner, SessionState};

fn spawn_node(hub: &MemoryHub, links: &MemoryLinks, name: &str) -> Arc<Node> {
    let mut config = AppConfig::default();
    config.node.name = name.to_string();
    let backends = StreamBackends {
        allocator: Arc::new(MulticastScanner::with_check(8, |_| Ok(false))),
        codec: Arc::new(ChunkedFileCodec::new(256, 64, None)),
        links: Arc::new(links.clone()),
    };
    let node = Node::new(config, hub.join(name), backends).unwrap();
    node.start();
    node
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..150 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zone_plays_track_held_by_another_node() {
    let hub = MemoryHub::new();
    let links = MemoryLinks::new();
    let kitchen = spawn_node(&hub, &links, "kitchen");
    let patio = spawn_node(&hub, &links, "patio");
    assert!(eventually(|| async { kitchen.registry().len() == 2 && patio.registry().len() == 2 }).await);

    // 256 frames of 32 ms
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("song.raw");
    std::fs::write(&path, vec![0u8; 64 * 1024]).unwrap();
    let song = Track::new(7, "Song", "Band", 8_000);
    kitchen
        .handle_control(ControlMessage::SetCatalog {
            tracks: vec![song.clone().with_path(&path)],
        })
        .await;

    let zone = kitchen.local_zone().unwrap();
    assert!(eventually(|| async { patio.zones().contains(zone) }).await);
    kitchen
        .handle_control(ControlMessage::PeerZoneChange {
            peers: vec![PeerZone {
                peer: patio.local_id().to_string(),
                zone,
            }],
        })
        .await;
    kitchen
        .handle_control(ControlMessage::QueueFront { zone, track: song.clone() })
        .await;

    let kitchen_id = kitchen.local_id().to_string();
    assert!(
        eventually(|| async {
            patio.local_zone() == Some(zone)
                && patio.zones().current(zone) == Some(song.clone())
                && patio.registry().lookup(&kitchen_id).map_or(false, |p| p.holds(&song).is_some())
        })
        .await
    );

    // Play is requested from the node that does not hold the file
    let replies = patio
        .handle_control(ControlMessage::Stream {
            zone,
            action: StreamCommand::Play,
        })
        .await;
    assert!(replies.is_empty(), "{:?}", replies);

    assert!(eventually(|| async { kitchen.coordinator().state((7, Role::Publisher)) == Some(SessionState::Playing) }).await);
    assert!(eventually(|| async { patio.coordinator().state((7, Role::Receiver)) == Some(SessionState::Playing) }).await);
    assert!(eventually(|| async { links.packets_sent() > 0 }).await);
    assert!(!patio.coordinator().contains((7, Role::Publisher)));

    // Stop from the other side tears down both ends
    kitchen
        .handle_control(ControlMessage::Stream {
            zone,
            action: StreamCommand::Teardown,
        })
        .await;
    assert!(eventually(|| async { !kitchen.coordinator().contains((7, Role::Publisher)) }).await);
    assert!(eventually(|| async { !patio.coordinator().contains((7, Role::Receiver)) }).await);

    kitchen.shutdown();
    patio.shutdown();
}

#[tokio::test]
async fn test_play_without_holder_is_an_error() {
    let hub = MemoryHub::new();
    let links = MemoryLinks::new();
    let kitchen = spawn_node(&hub, &links, "kitchen");
    let zone = kitchen.local_zone().unwrap();

    // Nobody holds this track
    kitchen
        .handle_control(ControlMessage::QueueFront {
            zone,
            track: Track::new(9, "Ghost", "Band", 1000),
        })
        .await;
    let replies = kitchen
        .handle_control(ControlMessage::Stream {
            zone,
            action: StreamCommand::Play,
        })
        .await;
    assert!(matches!(replies.as_slice(), [ControlMessage::Error { .. }]));
    assert!(kitchen.coordinator().is_empty());
    assert_eq!(links.packets_sent(), 0);
}
