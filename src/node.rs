//! Node controller
//!
//! Owns one instance of every registry and wires them to the transport, the
//! streaming coordinator and the local control channel. Every inbound group
//! message is handled on its own task; handlers only rely on the registries'
//! own locking.

use parking_lot::Mutex;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::catalog::{load_catalog, merged_library};
use crate::codec::{AudioCodec, ChunkedFileCodec};
use crate::config::AppConfig;
use crate::error::RegistryError;
use crate::events::{Notification, Notifier};
use crate::network::external::ZoneRequest;
use crate::network::link::{StreamLinks, UdpLinks};
use crate::network::messenger::{ExternalMembers, Messenger};
use crate::network::transport::{GroupTransport, TransportEvent, View};
use crate::peers::{MembershipTracker, PeerRegistry};
use crate::protocol::{
    ControlMessage, GroupMessage, MemberAddress, Peer, PeerId, QueueChange, StreamCommand, ZoneId,
};
use crate::streaming::allocator::{AddressAllocator, MulticastScanner};
use crate::streaming::worker::{SessionContext, StreamSettings};
use crate::streaming::StreamSessionCoordinator;
use crate::zones::ZoneDirectory;
use crate::Result;

/// Pluggable pieces behind the streaming sessions
pub struct StreamBackends {
    pub allocator: Arc<dyn AddressAllocator>,
    pub codec: Arc<dyn AudioCodec>,
    pub links: Arc<dyn StreamLinks>,
}

impl StreamBackends {
    /// Socket scanner, chunked file codec and UDP links
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            allocator: Arc::new(MulticastScanner::new(&config.network)),
            codec: Arc::new(ChunkedFileCodec::from_config(&config.streaming)),
            links: Arc::new(UdpLinks::new(config.network.multicast_ttl)),
        }
    }
}

/// Node summary for the status route
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: PeerId,
    pub name: String,
    pub zone: Option<ZoneId>,
    pub address: MemberAddress,
    pub peers: usize,
    pub zones: usize,
    pub sessions: usize,
    pub pool_size: usize,
    pub uptime_seconds: u64,
}

/// One participating node
pub struct Node {
    local_id: PeerId,
    config: AppConfig,
    messenger: Messenger,
    notifier: Notifier,
    registry: Arc<PeerRegistry>,
    zones: Arc<ZoneDirectory>,
    membership: MembershipTracker,
    coordinator: Arc<StreamSessionCoordinator>,
    transport: Arc<dyn GroupTransport>,
    requests_tx: mpsc::UnboundedSender<ZoneRequest>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<ZoneRequest>>>,
    bootstrapped: AtomicBool,
    started: Instant,
}

impl Node {
    pub fn new(config: AppConfig, transport: Arc<dyn GroupTransport>, backends: StreamBackends) -> Result<Arc<Self>> {
        let notifier = Notifier::new();
        let registry = Arc::new(PeerRegistry::new(notifier.clone()));
        let zones = Arc::new(ZoneDirectory::new(notifier.clone()));
        let messenger = Messenger::new(transport.clone(), Arc::new(ExternalMembers::new()));
        let local_id = Uuid::new_v4().to_string();

        let mut local = Peer::new(local_id.clone(), config.node.name.clone());
        let address = transport.local_address();
        local.ip = Some(address.ip());
        local.address = Some(address);
        if let Some(path) = &config.node.catalog {
            local.catalog = load_catalog(path)?;
        }
        zones.ensure(local.zone, &local.name);
        registry.add_or_replace(local);

        let ctx = SessionContext {
            local_id: local_id.clone(),
            messenger: messenger.clone(),
            registry: registry.clone(),
            allocator: backends.allocator,
            codec: backends.codec,
            links: backends.links,
            settings: StreamSettings::from_config(&config.network, &config.streaming),
        };
        let coordinator = Arc::new(StreamSessionCoordinator::new(
            ctx,
            zones.clone(),
            notifier.clone(),
            config.streaming.max_sessions,
            Duration::from_millis(config.streaming.next_settle_ms),
        ));
        let membership = MembershipTracker::new(registry.clone(), messenger.clone(), config.node.mobile_marker.clone());
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            local_id,
            config,
            messenger,
            notifier,
            registry,
            zones,
            membership,
            coordinator,
            transport,
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            bootstrapped: AtomicBool::new(false),
            started: Instant::now(),
        }))
    }

    /// Start consuming transport events and zone requests
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        tasks.extend(self.coordinator.start());

        match self.transport.take_events() {
            Some(mut events) => {
                let node = self.clone();
                tasks.push(tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let node = node.clone();
                        match event {
                            TransportEvent::Message { from, message } => {
                                tokio::spawn(async move { node.receive(from, message).await });
                            }
                            TransportEvent::ViewChanged(view) => {
                                tokio::spawn(async move { node.on_view_changed(view).await });
                            }
                        }
                    }
                    tracing::info!("Group transport closed");
                }));
            }
            None => tracing::warn!("Transport events already taken, node will not hear the group"),
        }

        if let Some(mut requests) = self.requests_rx.lock().take() {
            let node = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(request) = requests.recv().await {
                    if let Err(e) = node.coordinator.request(request.zone, request.command).await {
                        tracing::warn!("{} request for zone {} failed: {}", request.command.as_str(), request.zone, e);
                    }
                }
            }));
        }

        tracing::info!("Node {} ({}) started at {}", self.config.node.name, self.local_id, self.messenger.local_address());
        tasks
    }

    /// Stop every session
    pub fn shutdown(&self) {
        tracing::info!("Shutting down node {}", self.local_id);
        self.coordinator.teardown_all();
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local_peer(&self) -> Option<Peer> {
        self.registry.lookup(&self.local_id)
    }

    pub fn local_zone(&self) -> Option<ZoneId> {
        self.local_peer().map(|p| p.zone)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn zones(&self) -> &Arc<ZoneDirectory> {
        &self.zones
    }

    pub fn coordinator(&self) -> &Arc<StreamSessionCoordinator> {
        &self.coordinator
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Channel the external device gateway forwards requests on
    pub fn request_sender(&self) -> mpsc::UnboundedSender<ZoneRequest> {
        self.requests_tx.clone()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.local_id.clone(),
            name: self.local_peer().map(|p| p.name).unwrap_or_default(),
            zone: self.local_zone(),
            address: self.messenger.local_address(),
            peers: self.registry.len(),
            zones: self.zones.len(),
            sessions: self.coordinator.len(),
            pool_size: self.coordinator.pool_size(),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    async fn on_view_changed(&self, view: View) {
        let diff = self.membership.on_view_changed(view.clone()).await;
        tracing::debug!("View of {} members: {} joined, {} left", view.len(), diff.joined.len(), diff.left.len());

        let local = self.messenger.local_address();
        if let Some(provider) = view.coordinator() {
            if view.contains(&local) && !self.bootstrapped.swap(true, Ordering::SeqCst) {
                if *provider == local {
                    tracing::debug!("Oldest member of the group, no zone state to fetch");
                } else {
                    tracing::debug!("Requesting zone state from {}", provider);
                    self.messenger.send_logged(provider, &GroupMessage::StateRequest);
                }
            }
        }
    }

    async fn receive(&self, from: MemberAddress, message: GroupMessage) {
        let kind = message.kind();
        tracing::trace!("Received {} packet from {}", kind, from);
        if let Err(e) = self.dispatch(&from, message).await {
            tracing::warn!("Failed to handle {} from {}: {}", kind, from, e);
        }
    }

    /// Apply one group message
    pub async fn dispatch(&self, from: &MemberAddress, message: GroupMessage) -> Result<()> {
        match message {
            GroupMessage::StateRequest => {
                let state = self.zones.provide_state()?;
                self.messenger.send(from, &GroupMessage::StateTransfer(state))?;
            }
            GroupMessage::StateTransfer(state) => {
                let adopted = self.zones.adopt_state(&state)?;
                tracing::info!("Adopted {} zones from {}", adopted, from);
            }
            GroupMessage::Discovery => {
                self.membership.on_discovery_request(from);
                let local = self.local_peer().ok_or_else(|| RegistryError::UnknownPeer(self.local_id.clone()))?;
                let properties = self.zones.properties_of(local.zone)?;
                self.messenger.send(
                    from,
                    &GroupMessage::ZoneMapping {
                        zone: local.zone,
                        properties,
                    },
                )?;
                self.messenger.send(from, &GroupMessage::PeerData(local))?;
            }
            GroupMessage::PeerData(peer) => {
                self.zones.ensure(peer.zone, &peer.name);
                self.registry.add_or_replace(peer);
            }
            GroupMessage::PeerEdit { id, name } => self.registry.edit_name(&id, &name)?,
            GroupMessage::PeerStatus { id, online, zone } => {
                if let Some(peer) = self.registry.lookup(&id) {
                    self.zones.ensure(zone, &peer.name);
                }
                self.registry.edit_status(&id, online, zone)?;
            }
            GroupMessage::PeerZone(moves) => {
                let moved = self.registry.update_zones(&moves);
                tracing::debug!("{} of {} peers changed zone", moved, moves.len());
            }
            GroupMessage::ZoneMapping { zone, properties } => self.zones.put(zone, properties),
            GroupMessage::QueueChange { zone, change } => {
                // The originator applied the edit before broadcasting it
                if *from != self.messenger.local_address() {
                    self.zones.apply(zone, change)?;
                }
            }
            GroupMessage::Stream {
                command,
                descriptor,
                zone,
            } => self.coordinator.handle_stream(command, descriptor, zone).await?,
            GroupMessage::StreamAck { track_id, peer, .. } => self.coordinator.handle_ack(track_id, peer)?,
            GroupMessage::Catalog { peer, tracks } => self.registry.update_catalog(&peer, tracks)?,
            GroupMessage::Update => self.push_update(),
        }
        Ok(())
    }

    /// Ask the local consumer to refresh everything
    fn push_update(&self) {
        self.notifier.publish(Notification::PeersChanged);
        self.notifier.publish(Notification::ZonesChanged);
        self.notifier.publish(Notification::LibraryChanged);
    }

    /// Full state for a freshly connected control client
    pub fn snapshot(&self) -> Vec<ControlMessage> {
        let mut messages = vec![
            ControlMessage::PeerList {
                peers: self.registry.all(),
            },
            ControlMessage::ZoneMap {
                zones: self.zones.snapshot(),
            },
            ControlMessage::Library {
                tracks: merged_library(&self.registry.all()),
            },
        ];
        if let Some(peer) = self.local_peer() {
            messages.push(ControlMessage::LocalPeer { peer });
        }
        messages
    }

    /// Control message for a change notification
    pub fn render(&self, notification: Notification) -> ControlMessage {
        match notification {
            Notification::PeersChanged => ControlMessage::PeerList {
                peers: self.registry.all(),
            },
            Notification::ZonesChanged => ControlMessage::ZoneMap {
                zones: self.zones.snapshot(),
            },
            Notification::LibraryChanged => ControlMessage::Library {
                tracks: merged_library(&self.registry.all()),
            },
            Notification::Stream {
                zone,
                command,
                descriptor,
            } => ControlMessage::StreamEvent {
                zone,
                action: command,
                descriptor,
            },
        }
    }

    /// Handle a command from the local control channel. Returns replies for
    /// the client that sent it.
    pub async fn handle_control(&self, message: ControlMessage) -> Vec<ControlMessage> {
        match self.apply_control(message).await {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!("Control command failed: {}", e);
                vec![ControlMessage::Error { message: e.to_string() }]
            }
        }
    }

    async fn apply_control(&self, message: ControlMessage) -> Result<Vec<ControlMessage>> {
        match message {
            ControlMessage::RequestUpdate => return Ok(self.snapshot()),
            ControlMessage::GetLocalPeer => {
                let peer = self.local_peer().ok_or_else(|| RegistryError::UnknownPeer(self.local_id.clone()))?;
                return Ok(vec![ControlMessage::LocalPeer { peer }]);
            }
            ControlMessage::Rename { name } => {
                self.registry.edit_name(&self.local_id, &name)?;
                self.messenger.broadcast(&GroupMessage::PeerEdit {
                    id: self.local_id.clone(),
                    name,
                })?;
            }
            ControlMessage::SetCatalog { tracks } => {
                self.registry.update_catalog(&self.local_id, tracks.clone())?;
                self.messenger.broadcast(&GroupMessage::Catalog {
                    peer: self.local_id.clone(),
                    tracks,
                })?;
            }
            ControlMessage::PeerZoneChange { peers } => {
                let moves: Vec<(PeerId, ZoneId)> = peers.into_iter().map(|p| (p.peer, p.zone)).collect();
                self.registry.update_zones(&moves);
                self.messenger.broadcast(&GroupMessage::PeerZone(moves))?;
            }
            ControlMessage::PeerStatusChange { online } => self.change_status(online)?,
            ControlMessage::NewZone { zone, properties } => {
                self.zones.put(zone, properties.clone());
                self.messenger.broadcast(&GroupMessage::ZoneMapping { zone, properties })?;
            }
            ControlMessage::QueueFront { zone, track } => self.edit_queue(zone, QueueChange::Front(track))?,
            ControlMessage::QueueBack { zone, track } => self.edit_queue(zone, QueueChange::Back(track))?,
            ControlMessage::QueueRemove { zone, track } => self.edit_queue(zone, QueueChange::Remove(track))?,
            ControlMessage::NewQueue { zone, tracks } => self.edit_queue(zone, QueueChange::Replace(tracks))?,
            ControlMessage::SetPassword { zone, password } => {
                self.zones.set_password(zone, password)?;
                let properties = self.zones.properties_of(zone)?;
                self.messenger.broadcast(&GroupMessage::ZoneMapping { zone, properties })?;
            }
            ControlMessage::Authorize { zone, password } => {
                let granted = self.zones.authorize(zone, &password);
                return Ok(vec![ControlMessage::AuthResult { zone, granted }]);
            }
            ControlMessage::Stream { zone, action } => self.request(zone, action).await?,
            other => {
                return Ok(vec![ControlMessage::Error {
                    message: format!("unexpected command from client: {:?}", other),
                }])
            }
        }
        Ok(Vec::new())
    }

    /// Play, pause, skip or stop the current track of a zone
    pub async fn request(&self, zone: ZoneId, command: StreamCommand) -> Result<()> {
        self.coordinator.request(zone, command).await
    }

    /// Apply a queue edit locally, then tell everyone else
    pub fn edit_queue(&self, zone: ZoneId, change: QueueChange) -> Result<()> {
        self.zones.apply(zone, change.clone())?;
        self.messenger.broadcast(&GroupMessage::QueueChange { zone, change })?;
        Ok(())
    }

    /// Going private moves this peer into a fresh zone of its own
    fn change_status(&self, online: bool) -> Result<()> {
        let local = self.local_peer().ok_or_else(|| RegistryError::UnknownPeer(self.local_id.clone()))?;
        let zone = if online {
            local.zone
        } else {
            let zone = ZoneId::new();
            self.zones.ensure(zone, &local.name);
            let properties = self.zones.properties_of(zone)?;
            self.messenger.broadcast(&GroupMessage::ZoneMapping { zone, properties })?;
            zone
        };

        self.registry.edit_status(&self.local_id, online, zone)?;
        self.messenger.broadcast(&GroupMessage::PeerStatus {
            id: self.local_id.clone(),
            online,
            zone,
        })?;
        Ok(())
    }

    /// IPv4 address other devices reach this node on
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_peer().and_then(|p| p.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::{MemoryHub, MemoryLinks};
    use crate::protocol::Track;
    use crate::zones::ZoneProperties;

    fn node(hub: &MemoryHub, name: &str) -> Arc<Node> {
        let mut config = AppConfig::default();
        config.node.name = name.to_string();
        let backends = StreamBackends {
            allocator: Arc::new(MulticastScanner::with_check(4, |_| Ok(false))),
            codec: Arc::new(ChunkedFileCodec::new(256, 64, None)),
            links: Arc::new(MemoryLinks::new()),
        };
        Node::new(config, hub.join(name), backends).unwrap()
    }

    #[tokio::test]
    async fn test_local_peer_owns_a_zone() {
        let hub = MemoryHub::new();
        let node = node(&hub, "kitchen");

        let peer = node.local_peer().unwrap();
        assert_eq!(peer.name, "kitchen");
        assert!(peer.address.is_some());
        assert_eq!(node.zones().properties_of(peer.zone).unwrap().name, "kitchen");
        assert_eq!(node.status().peers, 1);
    }

    #[tokio::test]
    async fn test_queue_echo_is_not_applied_twice() {
        let hub = MemoryHub::new();
        let node = node(&hub, "kitchen");
        let zone = node.local_zone().unwrap();
        let track = Track::new(1, "Song", "Band", 1000);

        node.edit_queue(zone, QueueChange::Back(track.clone())).unwrap();
        let own = node.messenger().local_address();
        node.dispatch(
            &own,
            GroupMessage::QueueChange {
                zone,
                change: QueueChange::Back(track.clone()),
            },
        )
        .await
        .unwrap();
        assert_eq!(node.zones().properties_of(zone).unwrap().queue, vec![track]);
    }

    #[tokio::test]
    async fn test_state_request_is_answered() {
        let hub = MemoryHub::new();
        let provider = node(&hub, "provider");
        let joiner = hub.join("joiner");
        let mut events = joiner.take_events().unwrap();
        let zone = ZoneId::new();
        provider.zones().put(zone, ZoneProperties::new("Patio"));

        provider
            .dispatch(&joiner.local_address(), GroupMessage::StateRequest)
            .await
            .unwrap();

        let mut state = None;
        while let Ok(event) = events.try_recv() {
            if let TransportEvent::Message {
                message: GroupMessage::StateTransfer(bytes),
                ..
            } = event
            {
                state = Some(bytes);
            }
        }

        let fresh = ZoneDirectory::new(Notifier::new());
        assert_eq!(fresh.adopt_state(&state.unwrap()).unwrap(), 2);
        assert_eq!(fresh.properties_of(zone).unwrap().name, "Patio");
    }

    #[tokio::test]
    async fn test_control_errors_are_reported() {
        let hub = MemoryHub::new();
        let node = node(&hub, "kitchen");

        let replies = node
            .handle_control(ControlMessage::Stream {
                zone: ZoneId::new(),
                action: StreamCommand::Play,
            })
            .await;
        assert!(matches!(replies.as_slice(), [ControlMessage::Error { .. }]));

        let replies = node
            .handle_control(ControlMessage::Authorize {
                zone: node.local_zone().unwrap(),
                password: "anything".into(),
            })
            .await;
        assert!(matches!(replies.as_slice(), [ControlMessage::AuthResult { granted: true, .. }]));
    }

    #[tokio::test]
    async fn test_going_private_moves_to_fresh_zone() {
        let hub = MemoryHub::new();
        let node = node(&hub, "kitchen");
        let before = node.local_zone().unwrap();

        assert!(node.handle_control(ControlMessage::PeerStatusChange { online: false }).await.is_empty());
        let peer = node.local_peer().unwrap();
        assert!(!peer.online);
        assert_ne!(peer.zone, before);
        assert!(node.zones().contains(peer.zone));
    }
}
