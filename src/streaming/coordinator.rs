//! Stream session coordinator
//!
//! Owns the bounded pool of sessions, keyed by track and role. Inbound
//! stream commands are routed to the matching session task; zone-level
//! requests from the UI or remote controls are resolved against the queue and
//! the catalogs and turned into stream commands for the source peer.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::catalog::locate_source;
use crate::constants::MAX_SESSIONS_CEILING;
use crate::error::{Error, RegistryError, StreamError};
use crate::events::{Notification, Notifier};
use crate::protocol::{
    GroupMessage, PeerId, QueueChange, Role, StreamCommand, StreamDescriptor, TrackId, ZoneId,
};
use crate::streaming::session::SessionState;
use crate::streaming::worker::{
    spawn_session, EndReason, SessionCommand, SessionContext, SessionEnded, SessionHandle, SessionKey,
};
use crate::zones::ZoneDirectory;
use crate::Result;

/// Result of asking for a new session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    AlreadyExists,
    /// The pool is at capacity
    Rejected,
}

/// Session summary for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub track_id: TrackId,
    pub title: String,
    pub role: Role,
    pub zone: ZoneId,
    pub state: SessionState,
}

struct Pool {
    sessions: HashMap<SessionKey, SessionHandle>,
    max: usize,
}

/// Owner of every streaming session on this node
pub struct StreamSessionCoordinator {
    ctx: Arc<SessionContext>,
    zones: Arc<ZoneDirectory>,
    notifier: Notifier,
    pool: Mutex<Pool>,
    serial: AtomicU64,
    next_settle: Duration,
    ended_tx: mpsc::UnboundedSender<SessionEnded>,
    ended_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEnded>>>,
}

impl StreamSessionCoordinator {
    pub fn new(
        ctx: SessionContext,
        zones: Arc<ZoneDirectory>,
        notifier: Notifier,
        max_sessions: usize,
        next_settle: Duration,
    ) -> Self {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        Self {
            ctx: Arc::new(ctx),
            zones,
            notifier,
            pool: Mutex::new(Pool {
                sessions: HashMap::new(),
                max: max_sessions.clamp(1, MAX_SESSIONS_CEILING),
            }),
            serial: AtomicU64::new(0),
            next_settle,
            ended_tx,
            ended_rx: Mutex::new(Some(ended_rx)),
        }
    }

    /// Start reaping finished sessions. Only the first call spawns the loop.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut ended_rx = self.ended_rx.lock().take()?;
        let weak = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            while let Some(ended) = ended_rx.recv().await {
                match weak.upgrade() {
                    Some(coordinator) => coordinator.on_session_ended(ended),
                    None => break,
                }
            }
        }))
    }

    /// Create a session in `Init` unless one exists for the key or the pool
    /// is full
    pub fn add_session(&self, descriptor: StreamDescriptor, zone: ZoneId) -> AddOutcome {
        let key = (descriptor.track_id, descriptor.role);
        let mut pool = self.pool.lock();

        if pool.sessions.contains_key(&key) {
            return AddOutcome::AlreadyExists;
        }
        if pool.sessions.len() >= pool.max {
            tracing::warn!(
                "Session pool full ({} sessions), rejecting track {}",
                pool.max,
                descriptor.track_id
            );
            return AddOutcome::Rejected;
        }

        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Adding {:?} session for track {} in zone {}", key.1, key.0, zone);
        let handle = spawn_session(self.ctx.clone(), descriptor, zone, serial, self.ended_tx.clone());
        pool.sessions.insert(key, handle);
        AddOutcome::Created
    }

    /// Change the pool capacity. Sessions above a lowered limit keep running.
    pub fn set_pool_size(&self, size: usize) -> std::result::Result<(), StreamError> {
        if !(1..=MAX_SESSIONS_CEILING).contains(&size) {
            return Err(StreamError::InvalidPoolSize(size));
        }
        self.pool.lock().max = size;
        tracing::info!("Session pool size set to {}", size);
        Ok(())
    }

    pub fn pool_size(&self) -> usize {
        self.pool.lock().max
    }

    pub fn len(&self) -> usize {
        self.pool.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.lock().sessions.is_empty()
    }

    pub fn contains(&self, key: SessionKey) -> bool {
        self.pool.lock().sessions.contains_key(&key)
    }

    pub fn state(&self, key: SessionKey) -> Option<SessionState> {
        self.pool.lock().sessions.get(&key).map(|h| h.state())
    }

    /// Follow the state of one session
    pub fn watch(&self, key: SessionKey) -> Option<watch::Receiver<SessionState>> {
        self.pool.lock().sessions.get(&key).map(|h| h.subscribe())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.pool
            .lock()
            .sessions
            .iter()
            .map(|(key, handle)| SessionInfo {
                track_id: key.0,
                title: handle.descriptor.title.clone(),
                role: key.1,
                zone: handle.zone,
                state: handle.state(),
            })
            .collect()
    }

    pub fn setup(&self, key: SessionKey) -> std::result::Result<(), StreamError> {
        self.command(key, SessionCommand::Setup)
    }

    pub fn play(&self, key: SessionKey) -> std::result::Result<(), StreamError> {
        self.command(key, SessionCommand::Play)
    }

    pub fn pause(&self, key: SessionKey) -> std::result::Result<(), StreamError> {
        self.command(key, SessionCommand::Pause)
    }

    /// Stop a session and drop it from the pool. Returns false if there was
    /// nothing to stop.
    pub fn teardown(&self, key: SessionKey) -> bool {
        let handle = self.pool.lock().sessions.remove(&key);
        match handle {
            Some(handle) => {
                tracing::debug!("Tearing down {:?} session for track {}", key.1, key.0);
                // A task that already exited has released everything
                let _ = handle.send(SessionCommand::Teardown);
                true
            }
            None => false,
        }
    }

    pub fn teardown_all(&self) {
        let handles: Vec<_> = self.pool.lock().sessions.drain().collect();
        for (_, handle) in handles {
            let _ = handle.send(SessionCommand::Teardown);
        }
    }

    /// A receiver acknowledged setup of one of our publishers
    pub fn handle_ack(&self, track_id: TrackId, peer: PeerId) -> std::result::Result<(), StreamError> {
        tracing::trace!("Ack from {} for track {}", peer, track_id);
        self.command((track_id, Role::Publisher), SessionCommand::Ack(peer))
    }

    /// Stream command received from the group
    pub async fn handle_stream(&self, command: StreamCommand, descriptor: StreamDescriptor, zone: ZoneId) -> Result<()> {
        tracing::debug!(
            "{} {:?} for track {} in zone {}",
            command.as_str(),
            descriptor.role,
            descriptor.track_id,
            zone
        );

        match descriptor.role {
            Role::Publisher => {
                if command == StreamCommand::Next {
                    return self.next(zone).await;
                }
                if command != StreamCommand::Play && self.local_zone() == Some(zone) {
                    self.notify(zone, command, &descriptor);
                }
                self.on_publish(command, descriptor, zone)?;
            }
            Role::Receiver => {
                self.notify(zone, command, &descriptor);
                self.on_receive(command, descriptor, zone)?;
            }
        }
        Ok(())
    }

    /// Act on a user or remote-control command for a zone
    pub async fn request(&self, zone: ZoneId, command: StreamCommand) -> Result<()> {
        match command {
            StreamCommand::Next => self.next(zone).await,
            command => self.dispatch(zone, command).await,
        }
    }

    /// Skip to the next queued track. Fails with `EmptyQueue` if nothing is
    /// left to play.
    pub async fn next(&self, zone: ZoneId) -> Result<()> {
        self.advance_queue(zone).await?;
        if self.zones.current(zone).is_none() {
            tracing::info!("Queue of zone {} is empty, nothing to play", zone);
            return Err(StreamError::EmptyQueue(zone).into());
        }
        self.dispatch(zone, StreamCommand::Play).await
    }

    fn on_publish(&self, command: StreamCommand, descriptor: StreamDescriptor, zone: ZoneId) -> Result<()> {
        let key = (descriptor.track_id, Role::Publisher);
        match command {
            StreamCommand::Setup => self.open(descriptor, zone)?,
            StreamCommand::Play => {
                self.open(descriptor, zone)?;
                self.play(key)?;
            }
            StreamCommand::Pause => self.pause(key)?,
            StreamCommand::Teardown => {
                self.teardown(key);
            }
            StreamCommand::Next => {}
        }
        Ok(())
    }

    fn on_receive(&self, command: StreamCommand, descriptor: StreamDescriptor, zone: ZoneId) -> Result<()> {
        let key = (descriptor.track_id, Role::Receiver);
        match command {
            StreamCommand::Setup | StreamCommand::Play => {
                self.drop_stale_receiver(&descriptor);
                self.open(descriptor, zone)?;
                if command == StreamCommand::Play {
                    self.play(key)?;
                }
            }
            StreamCommand::Pause => self.pause(key)?,
            StreamCommand::Teardown => {
                self.teardown(key);
            }
            StreamCommand::Next => tracing::trace!("Ignoring next for receiver of track {}", key.0),
        }
        Ok(())
    }

    /// Create and set up a session unless it exists
    fn open(&self, descriptor: StreamDescriptor, zone: ZoneId) -> std::result::Result<(), StreamError> {
        let key = (descriptor.track_id, descriptor.role);
        match self.add_session(descriptor, zone) {
            AddOutcome::Created => self.setup(key),
            AddOutcome::AlreadyExists => Ok(()),
            AddOutcome::Rejected => Err(StreamError::PoolFull(self.pool_size())),
        }
    }

    /// A receiver still bound to an older stream of the same track id is
    /// replaced
    fn drop_stale_receiver(&self, descriptor: &StreamDescriptor) {
        let key = (descriptor.track_id, Role::Receiver);
        let stale = self.pool.lock().sessions.get(&key).map_or(false, |h| {
            h.descriptor.group != descriptor.group || h.descriptor.publisher != descriptor.publisher
        });
        if stale {
            tracing::debug!("Replacing stale receiver for track {}", key.0);
            self.teardown(key);
        }
    }

    /// Resolve the zone's current track and send `command` for it. Tracks no
    /// peer can publish are skipped when playing.
    async fn dispatch(&self, zone: ZoneId, command: StreamCommand) -> Result<()> {
        let attempts = self.zones.properties_of(zone)?.queue.len().max(1);

        for _ in 0..attempts {
            let track = self
                .zones
                .current(zone)
                .ok_or(StreamError::EmptyQueue(zone))?;

            match locate_source(&self.ctx.registry.all(), &track) {
                Some((peer, entry)) => {
                    let descriptor = StreamDescriptor::publish(&entry, peer.id.clone(), self.ctx.settings.stream_port);
                    return match command {
                        StreamCommand::Play | StreamCommand::Setup => {
                            let address = peer.address.ok_or_else(|| RegistryError::UnknownPeer(peer.id.clone()))?;
                            self.ctx.messenger.send(
                                &address,
                                &GroupMessage::Stream {
                                    command,
                                    descriptor,
                                    zone,
                                },
                            )?;
                            Ok(())
                        }
                        command => self.fan_out(zone, command, &descriptor),
                    };
                }
                None if command == StreamCommand::Play => {
                    tracing::warn!("No peer can play '{}' (track {}), skipping", track.title, track.id);
                    self.advance_queue(zone).await?;
                }
                None => return Err(RegistryError::NoSource(track.id).into()),
            }
        }
        Err(StreamError::EmptyQueue(zone).into())
    }

    /// Send the publish descriptor to its source and the receive descriptor
    /// to every peer of the zone
    fn fan_out(&self, zone: ZoneId, command: StreamCommand, descriptor: &StreamDescriptor) -> Result<()> {
        let source = self
            .ctx
            .registry
            .lookup(&descriptor.source)
            .and_then(|p| p.address)
            .ok_or_else(|| RegistryError::UnknownPeer(descriptor.source.clone()))?;
        self.ctx.messenger.send(
            &source,
            &GroupMessage::Stream {
                command,
                descriptor: descriptor.clone(),
                zone,
            },
        )?;

        let message = GroupMessage::Stream {
            command,
            descriptor: descriptor.for_receivers(),
            zone,
        };
        for peer in self.ctx.registry.peers_in_zone(zone) {
            if let Some(address) = &peer.address {
                self.ctx.messenger.send_logged(address, &message);
            }
        }
        Ok(())
    }

    /// Drop the current track from the queue everywhere and stop its stream
    async fn advance_queue(&self, zone: ZoneId) -> Result<()> {
        let current = self
            .zones
            .current(zone)
            .ok_or(StreamError::EmptyQueue(zone))?;

        self.zones.queue_remove(zone, &current)?;
        self.ctx.messenger.broadcast_logged(&GroupMessage::QueueChange {
            zone,
            change: QueueChange::Remove(current.clone()),
        });
        tokio::time::sleep(self.next_settle).await;

        let descriptor = match locate_source(&self.ctx.registry.all(), &current) {
            Some((peer, entry)) => {
                let descriptor = StreamDescriptor::publish(&entry, peer.id, self.ctx.settings.stream_port);
                if let Err(e) = self.fan_out(zone, StreamCommand::Teardown, &descriptor) {
                    tracing::warn!("Could not stop track {}: {}", current.id, e);
                }
                descriptor
            }
            None => StreamDescriptor::publish(&current, self.ctx.local_id.clone(), self.ctx.settings.stream_port),
        };

        let key = (current.id, Role::Publisher);
        let local_publisher = self.pool.lock().sessions.get(&key).map_or(false, |h| h.zone == zone);
        if local_publisher {
            self.teardown(key);
        }
        if self.local_zone() == Some(zone) {
            self.notify(zone, StreamCommand::Teardown, &descriptor);
        }
        Ok(())
    }

    fn on_session_ended(self: Arc<Self>, ended: SessionEnded) {
        let removed = {
            let mut pool = self.pool.lock();
            match pool.sessions.get(&ended.key) {
                Some(handle) if handle.serial == ended.serial => pool.sessions.remove(&ended.key).is_some(),
                _ => false,
            }
        };
        if removed {
            tracing::debug!("Session for track {} left the pool", ended.key.0);
        }

        let (track_id, role) = ended.key;
        let still_current = self.zones.current(ended.zone).map_or(false, |t| t.id == track_id);
        if ended.reason == EndReason::Finished && role == Role::Publisher && still_current {
            let zone = ended.zone;
            tokio::spawn(async move {
                match self.next(zone).await {
                    Ok(()) => {}
                    Err(Error::Stream(StreamError::EmptyQueue(_))) => {
                        tracing::info!("Zone {} reached the end of its queue", zone)
                    }
                    Err(e) => tracing::warn!("Could not advance zone {}: {}", zone, e),
                }
            });
        }
    }

    fn command(&self, key: SessionKey, command: SessionCommand) -> std::result::Result<(), StreamError> {
        let pool = self.pool.lock();
        let handle = pool.sessions.get(&key).ok_or(StreamError::NotFound(key.0))?;
        handle.send(command)
    }

    fn local_zone(&self) -> Option<ZoneId> {
        self.ctx.registry.lookup(&self.ctx.local_id).map(|p| p.zone)
    }

    fn notify(&self, zone: ZoneId, command: StreamCommand, descriptor: &StreamDescriptor) {
        self.notifier.publish(Notification::Stream {
            zone,
            command,
            descriptor: descriptor.clone(),
        });
    }
}

impl Drop for StreamSessionCoordinator {
    fn drop(&mut self) {
        self.teardown_all();
    }
}
