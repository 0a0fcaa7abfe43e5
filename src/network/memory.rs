//! In-process group transport
//!
//! Every transport joined to the same hub sees the others as members.
//! Joining or leaving emits a view change to every remaining member.
//! Outbound messages are also recorded so tests can inspect them.
//! [`MemoryLinks`] does the same for stream packets.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::NetworkError;
use crate::network::link::{FrameListener, FrameTransmitter, StreamLinks};
use crate::network::packet::StreamPacket;
use crate::network::transport::{GroupTransport, TransportEvent, View};
use crate::protocol::{GroupMessage, MemberAddress};

/// How long an in-process listener waits per poll
const LISTENER_POLL: Duration = Duration::from_millis(20);

const FIRST_PORT: u16 = 20_000;

/// Message recorded by a memory transport
#[derive(Debug, Clone)]
pub struct Outgoing {
    /// `None` for broadcasts
    pub dest: Option<MemberAddress>,
    pub message: GroupMessage,
}

struct HubInner {
    members: Vec<(MemberAddress, mpsc::UnboundedSender<TransportEvent>)>,
    next_port: u16,
}

impl HubInner {
    fn view(&self) -> View {
        View::new(self.members.iter().map(|(a, _)| a.clone()).collect())
    }

    fn announce_view(&self) {
        let view = self.view();
        for (_, tx) in &self.members {
            let _ = tx.send(TransportEvent::ViewChanged(view.clone()));
        }
    }
}

/// Shared in-process "network"
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                members: Vec::new(),
                next_port: FIRST_PORT,
            })),
        }
    }

    /// Join a new member; every member, the new one included, sees a view change
    pub fn join(&self, name: &str) -> Arc<MemoryTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let port = inner.next_port;
        inner.next_port += 1;
        let address = MemberAddress::new(name, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        inner.members.push((address.clone(), tx));
        inner.announce_view();

        Arc::new(MemoryTransport {
            hub: self.inner.clone(),
            address,
            events: Mutex::new(Some(rx)),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Remove a member; the remaining members see a view change
    pub fn leave(&self, address: &MemberAddress) {
        let mut inner = self.inner.lock();
        inner.members.retain(|(a, _)| a != address);
        inner.announce_view();
    }

    pub fn view(&self) -> View {
        self.inner.lock().view()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's handle on a [`MemoryHub`]
pub struct MemoryTransport {
    hub: Arc<Mutex<HubInner>>,
    address: MemberAddress,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    sent: Mutex<Vec<Outgoing>>,
}

impl MemoryTransport {
    /// Drain the record of outbound messages
    pub fn take_sent(&self) -> Vec<Outgoing> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl GroupTransport for MemoryTransport {
    fn local_address(&self) -> MemberAddress {
        self.address.clone()
    }

    fn send(&self, dest: &MemberAddress, message: &GroupMessage) -> Result<(), NetworkError> {
        self.sent.lock().push(Outgoing {
            dest: Some(dest.clone()),
            message: message.clone(),
        });

        let hub = self.hub.lock();
        let (_, tx) = hub
            .members
            .iter()
            .find(|(a, _)| a == dest)
            .ok_or_else(|| NetworkError::UnknownMember(dest.to_string()))?;
        tx.send(TransportEvent::Message {
            from: self.address.clone(),
            message: message.clone(),
        })
        .map_err(|_| NetworkError::Closed)
    }

    fn broadcast(&self, message: &GroupMessage) -> Result<(), NetworkError> {
        self.sent.lock().push(Outgoing {
            dest: None,
            message: message.clone(),
        });

        let hub = self.hub.lock();
        for (_, tx) in &hub.members {
            let _ = tx.send(TransportEvent::Message {
                from: self.address.clone(),
                message: message.clone(),
            });
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().take()
    }
}

type Subscribers = HashMap<SocketAddr, Vec<std_mpsc::Sender<StreamPacket>>>;

/// In-process stream links. Packets sent to an address reach every listener
/// opened on it.
#[derive(Clone, Default)]
pub struct MemoryLinks {
    subscribers: Arc<Mutex<Subscribers>>,
    packets_sent: Arc<AtomicU64>,
}

impl MemoryLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets transmitted by every transmitter of this bus
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }
}

impl StreamLinks for MemoryLinks {
    fn transmitter(&self, targets: Vec<SocketAddr>) -> Result<Box<dyn FrameTransmitter>, NetworkError> {
        Ok(Box::new(MemoryTransmitter {
            subscribers: self.subscribers.clone(),
            total: self.packets_sent.clone(),
            targets,
            sent: 0,
        }))
    }

    fn listener(&self, group: Ipv4Addr, port: u16) -> Result<Box<dyn FrameListener>, NetworkError> {
        let (tx, rx) = std_mpsc::channel();
        self.subscribers
            .lock()
            .entry(SocketAddr::new(IpAddr::V4(group), port))
            .or_default()
            .push(tx);
        Ok(Box::new(MemoryListener { rx }))
    }
}

struct MemoryTransmitter {
    subscribers: Arc<Mutex<Subscribers>>,
    total: Arc<AtomicU64>,
    targets: Vec<SocketAddr>,
    sent: u64,
}

impl FrameTransmitter for MemoryTransmitter {
    fn transmit(&mut self, packet: &StreamPacket) -> Result<(), NetworkError> {
        let mut subscribers = self.subscribers.lock();
        for target in &self.targets {
            if let Some(listeners) = subscribers.get_mut(target) {
                // Closed listeners are pruned as they are found
                listeners.retain(|tx| tx.send(packet.clone()).is_ok());
            }
        }
        self.sent += 1;
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn packets_sent(&self) -> u64 {
        self.sent
    }
}

struct MemoryListener {
    rx: std_mpsc::Receiver<StreamPacket>,
}

impl FrameListener for MemoryListener {
    fn poll(&mut self) -> Result<Option<StreamPacket>, NetworkError> {
        match self.rx.recv_timeout(LISTENER_POLL) {
            Ok(packet) => Ok(Some(packet)),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(NetworkError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_announces_view_to_everyone() {
        let hub = MemoryHub::new();
        let a = hub.join("a");
        let mut a_events = a.take_events().unwrap();
        let b = hub.join("b");

        // a sees itself, then a + b
        let mut last = None;
        while let Ok(event) = a_events.try_recv() {
            last = Some(event);
        }
        match last {
            Some(TransportEvent::ViewChanged(view)) => {
                assert_eq!(view.len(), 2);
                assert_eq!(view.coordinator(), Some(&a.local_address()));
                assert!(view.contains(&b.local_address()));
            }
            other => panic!("expected view change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unicast_reaches_only_destination() {
        let hub = MemoryHub::new();
        let a = hub.join("a");
        let b = hub.join("b");
        let mut b_events = b.take_events().unwrap();
        while b_events.try_recv().is_ok() {}

        a.send(&b.local_address(), &GroupMessage::Discovery).unwrap();
        match b_events.recv().await {
            Some(TransportEvent::Message { from, message }) => {
                assert_eq!(from, a.local_address());
                assert!(matches!(message, GroupMessage::Discovery));
            }
            other => panic!("expected message, got {:?}", other),
        }
        assert_eq!(a.take_sent().len(), 1);
    }

    #[test]
    fn test_send_to_departed_member_fails() {
        let hub = MemoryHub::new();
        let a = hub.join("a");
        let b = hub.join("b");
        hub.leave(&b.local_address());
        assert!(matches!(
            a.send(&b.local_address(), &GroupMessage::Update),
            Err(NetworkError::UnknownMember(_))
        ));
    }

    #[test]
    fn test_links_deliver_to_group_listeners() {
        let links = MemoryLinks::new();
        let group = Ipv4Addr::new(226, 0, 0, 1);
        let mut listener = links.listener(group, 5005).unwrap();
        let mut other = links.listener(Ipv4Addr::new(226, 0, 0, 2), 5005).unwrap();

        let mut tx = links
            .transmitter(vec![SocketAddr::new(IpAddr::V4(group), 5005)])
            .unwrap();
        tx.transmit(&StreamPacket::new(7, 0, 0, bytes::Bytes::from_static(b"abc")))
            .unwrap();

        let packet = listener.poll().unwrap().unwrap();
        assert_eq!(packet.track_id, 7);
        assert!(other.poll().unwrap().is_none());
        assert_eq!(links.packets_sent(), 1);
    }
}
