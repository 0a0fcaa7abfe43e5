//! UDP multicast group transport
//!
//! Members announce themselves with periodic heartbeats on a shared
//! multicast group. The view is every member heard from within the member
//! timeout, ordered by start time, so the oldest member comes first and acts
//! as state provider. Broadcasts go to the group; unicast goes straight to
//! the member's own socket.
//!
//! Messages whose encoding exceeds one datagram are split into numbered
//! fragments and reassembled per sender. Incomplete messages are dropped
//! after the member timeout.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::NetworkConfig;
use crate::constants::MAX_GROUP_DATAGRAM;
use crate::error::NetworkError;
use crate::network::transport::{GroupTransport, TransportEvent, View};
use crate::network::udp;
use crate::protocol::{GroupMessage, MemberAddress};

/// Largest encoded message carried whole; bigger ones are fragmented
const FRAGMENT_PAYLOAD: usize = 60_000;

/// Upper bound on the fragments of one message
const MAX_FRAGMENTS: usize = 1024;

/// Datagram body on the group wire
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Body {
    Heartbeat,
    Leave,
    Message(GroupMessage),
    /// One piece of an encoded [`GroupMessage`]
    Fragment {
        msg_id: u64,
        index: u32,
        count: u32,
        bytes: Vec<u8>,
    },
}

/// Split an encoded message into fragment bodies
fn fragment(payload: &[u8], msg_id: u64) -> Vec<Body> {
    let count = payload.chunks(FRAGMENT_PAYLOAD).len() as u32;
    payload
        .chunks(FRAGMENT_PAYLOAD)
        .enumerate()
        .map(|(index, chunk)| Body::Fragment {
            msg_id,
            index: index as u32,
            count,
            bytes: chunk.to_vec(),
        })
        .collect()
}

struct Partial {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    started: Instant,
}

/// Fragments waiting for the rest of their message, keyed by sender
#[derive(Default)]
struct Reassembler {
    pending: HashMap<(MemberAddress, u64), Partial>,
}

impl Reassembler {
    /// Store one fragment. Returns the whole payload once every piece arrived.
    fn insert(&mut self, from: &MemberAddress, msg_id: u64, index: u32, count: u32, bytes: Vec<u8>) -> Option<Vec<u8>> {
        let count = count as usize;
        let index = index as usize;
        if count == 0 || count > MAX_FRAGMENTS || index >= count {
            tracing::trace!("Dropping malformed fragment {}/{} from {}", index, count, from);
            return None;
        }

        let key = (from.clone(), msg_id);
        let partial = self.pending.entry(key.clone()).or_insert_with(|| Partial {
            parts: vec![None; count],
            received: 0,
            started: Instant::now(),
        });
        if partial.parts.len() != count {
            tracing::trace!("Fragment count mismatch for message {} from {}", msg_id, from);
            return None;
        }
        if partial.parts[index].is_none() {
            partial.parts[index] = Some(bytes);
            partial.received += 1;
        }
        if partial.received < count {
            return None;
        }

        let partial = self.pending.remove(&key)?;
        Some(partial.parts.into_iter().flatten().flatten().collect())
    }

    fn expire(&mut self, max_age: Duration) {
        let before = self.pending.len();
        self.pending.retain(|_, partial| partial.started.elapsed() < max_age);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            tracing::debug!("Dropped {} incomplete group messages", dropped);
        }
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    from: MemberAddress,
    /// Milliseconds since the epoch when the sender started
    started_at: i64,
    body: Body,
}

impl Envelope {
    fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        let data = bincode::serialize(self).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        if data.len() > MAX_GROUP_DATAGRAM {
            return Err(NetworkError::PacketTooLarge(data.len()));
        }
        Ok(data)
    }

    fn decode(data: &[u8]) -> Result<Self, NetworkError> {
        bincode::deserialize(data).map_err(|e| NetworkError::Serialization(e.to_string()))
    }
}

struct MemberState {
    started_at: i64,
    last_seen: Instant,
}

/// Membership table plus the last view handed out
struct Members {
    table: HashMap<MemberAddress, MemberState>,
    last_view: View,
}

impl Members {
    fn view(&self) -> View {
        let mut members: Vec<(&MemberAddress, i64)> =
            self.table.iter().map(|(a, s)| (a, s.started_at)).collect();
        members.sort_by(|(a, at), (b, bt)| at.cmp(bt).then_with(|| a.cmp(b)));
        View::new(members.into_iter().map(|(a, _)| a.clone()).collect())
    }

    /// Returns the new view if it differs from the last one handed out
    fn refresh(&mut self) -> Option<View> {
        let view = self.view();
        if view != self.last_view {
            self.last_view = view.clone();
            Some(view)
        } else {
            None
        }
    }
}

struct Shared {
    local: MemberAddress,
    started_at: i64,
    group: SocketAddr,
    member_timeout: Duration,
    send_socket: UdpSocket,
    members: Mutex<Members>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    fragments: Mutex<Reassembler>,
    next_msg_id: AtomicU64,
}

impl Shared {
    fn envelope(&self, body: Body) -> Envelope {
        Envelope {
            from: self.local.clone(),
            started_at: self.started_at,
            body,
        }
    }

    fn send_envelope(&self, target: SocketAddr, envelope: &Envelope) -> Result<(), NetworkError> {
        let data = envelope.encode()?;
        self.send_socket
            .send_to(&data, target)
            .map_err(|e| NetworkError::SendFailed(format!("{}: {}", target, e)))?;
        Ok(())
    }

    /// Send a message whole, or in fragments when it outgrows a datagram
    fn send_message(&self, target: SocketAddr, message: &GroupMessage) -> Result<(), NetworkError> {
        for envelope in self.envelopes(message)? {
            self.send_envelope(target, &envelope)?;
        }
        Ok(())
    }

    fn envelopes(&self, message: &GroupMessage) -> Result<Vec<Envelope>, NetworkError> {
        let payload = message.encode()?;
        if payload.len() <= FRAGMENT_PAYLOAD {
            return Ok(vec![self.envelope(Body::Message(message.clone()))]);
        }

        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let bodies = fragment(&payload, msg_id);
        if bodies.len() > MAX_FRAGMENTS {
            return Err(NetworkError::PacketTooLarge(payload.len()));
        }
        tracing::trace!(
            "Splitting {} ({} bytes) into {} fragments",
            message.kind(),
            payload.len(),
            bodies.len()
        );
        Ok(bodies.into_iter().map(|body| self.envelope(body)).collect())
    }

    fn emit_view(&self, view: Option<View>) {
        if let Some(view) = view {
            tracing::debug!("Group view now has {} members", view.len());
            let _ = self.events_tx.send(TransportEvent::ViewChanged(view));
        }
    }

    fn handle_datagram(&self, data: &[u8]) {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::trace!("Dropping undecodable group datagram: {}", e);
                return;
            }
        };

        let from = envelope.from.clone();
        match envelope.body {
            Body::Leave => {
                let view = {
                    let mut members = self.members.lock();
                    members.table.remove(&from);
                    members.refresh()
                };
                self.emit_view(view);
            }
            Body::Heartbeat => self.touch(&from, envelope.started_at),
            Body::Message(message) => {
                self.touch(&from, envelope.started_at);
                let _ = self.events_tx.send(TransportEvent::Message { from, message });
            }
            Body::Fragment {
                msg_id,
                index,
                count,
                bytes,
            } => {
                self.touch(&from, envelope.started_at);
                let whole = self.fragments.lock().insert(&from, msg_id, index, count, bytes);
                if let Some(payload) = whole {
                    match GroupMessage::decode(&payload) {
                        Ok(message) => {
                            let _ = self.events_tx.send(TransportEvent::Message { from, message });
                        }
                        Err(e) => tracing::warn!("Dropping reassembled message from {}: {}", from, e),
                    }
                }
            }
        }
    }

    fn touch(&self, from: &MemberAddress, started_at: i64) {
        let view = {
            let mut members = self.members.lock();
            let state = members.table.entry(from.clone()).or_insert(MemberState {
                started_at,
                last_seen: Instant::now(),
            });
            state.last_seen = Instant::now();
            state.started_at = started_at;
            members.refresh()
        };
        self.emit_view(view);
    }

    fn expire(&self) {
        let view = {
            let mut members = self.members.lock();
            let timeout = self.member_timeout;
            let local = &self.local;
            members
                .table
                .retain(|address, state| address == local || state.last_seen.elapsed() < timeout);
            members.refresh()
        };
        self.emit_view(view);
        self.fragments.lock().expire(self.member_timeout);
    }
}

/// Group transport over UDP multicast
pub struct UdpGroupTransport {
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpGroupTransport {
    /// Join the group and start heartbeating. Must be called inside a runtime.
    pub fn start(name: &str, config: &NetworkConfig) -> Result<Arc<Self>, NetworkError> {
        let local_ip = local_ip_address::local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let unicast = udp::create_socket(SocketAddr::new(local_ip, 0))?;
        let unicast_addr = unicast
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let multicast = udp::create_multicast_socket(config.group_address, config.group_port)?;
        let send_socket = udp::create_sender_socket(config.multicast_ttl)?;

        let local = MemberAddress::new(name, unicast_addr);
        let started_at = chrono::Utc::now().timestamp_millis();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut table = HashMap::new();
        table.insert(
            local.clone(),
            MemberState {
                started_at,
                last_seen: Instant::now(),
            },
        );

        let shared = Arc::new(Shared {
            local: local.clone(),
            started_at,
            group: SocketAddr::V4(SocketAddrV4::new(config.group_address, config.group_port)),
            member_timeout: Duration::from_millis(config.member_timeout_ms),
            send_socket,
            members: Mutex::new(Members {
                table,
                last_view: View::default(),
            }),
            events_tx,
            fragments: Mutex::new(Reassembler::default()),
            next_msg_id: AtomicU64::new(0),
        });

        let mut tasks = Vec::new();
        tasks.push(spawn_receiver(shared.clone(), udp::into_tokio(multicast)?));
        tasks.push(spawn_receiver(shared.clone(), udp::into_tokio(unicast)?));
        tasks.push(spawn_heartbeat(
            shared.clone(),
            Duration::from_millis(config.heartbeat_interval_ms),
        ));

        let view = shared.members.lock().refresh();
        shared.emit_view(view);
        tracing::info!("Joined group {} as {}", shared.group, local);

        Ok(Arc::new(Self {
            shared,
            events: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(tasks),
        }))
    }

    /// Announce departure and stop background tasks
    pub fn shutdown(&self) {
        let leave = self.shared.envelope(Body::Leave);
        if let Err(e) = self.shared.send_envelope(self.shared.group, &leave) {
            tracing::warn!("Failed to announce leave: {}", e);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn view(&self) -> View {
        self.shared.members.lock().view()
    }
}

impl Drop for UdpGroupTransport {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl GroupTransport for UdpGroupTransport {
    fn local_address(&self) -> MemberAddress {
        self.shared.local.clone()
    }

    fn send(&self, dest: &MemberAddress, message: &GroupMessage) -> Result<(), NetworkError> {
        if !self.shared.members.lock().table.contains_key(dest) {
            return Err(NetworkError::UnknownMember(dest.to_string()));
        }
        self.shared.send_message(dest.addr, message)
    }

    fn broadcast(&self, message: &GroupMessage) -> Result<(), NetworkError> {
        self.shared.send_message(self.shared.group, message)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().take()
    }
}

fn spawn_receiver(shared: Arc<Shared>, socket: tokio::net::UdpSocket) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_GROUP_DATAGRAM];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, _)) => shared.handle_datagram(&buf[..len]),
                Err(e) => {
                    tracing::warn!("Group receive error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

fn spawn_heartbeat(shared: Arc<Shared>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let heartbeat = shared.envelope(Body::Heartbeat);
            if let Err(e) = shared.send_envelope(shared.group, &heartbeat) {
                tracing::warn!("Heartbeat failed: {}", e);
            }
            shared.expire();
        }
    })
}
