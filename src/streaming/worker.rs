//! Session tasks
//!
//! Every session runs as its own tokio task consuming a command channel.
//! Publishers pace frames from the codec onto the stream link inside the
//! task, with each read done on the blocking pool. Receivers hand the
//! multicast listener to a dedicated thread that reorders packets and feeds
//! the sink.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::audio::buffer::JitterBuffer;
use crate::codec::{AudioCodec, Frame, FrameSink, FrameSource};
use crate::config::{NetworkConfig, StreamingConfig};
use crate::error::{CodecError, StreamError};
use crate::network::link::{group_target, FrameListener, FrameTransmitter, StreamLinks};
use crate::network::messenger::Messenger;
use crate::network::packet::StreamPacket;
use crate::peers::PeerRegistry;
use crate::protocol::{GroupMessage, PeerId, Role, StreamCommand, StreamDescriptor, TrackId, ZoneId};
use crate::streaming::allocator::AddressAllocator;
use crate::streaming::session::{Effect, Input, Session, SessionState};

/// Consecutive frame errors tolerated before the publisher gives up
const MAX_FRAME_ERRORS: u32 = 50;

/// Sessions are keyed by track and role
pub type SessionKey = (TrackId, Role);

/// Timing and addressing shared by all sessions
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub stream_port: u16,
    pub starting_address: Ipv4Addr,
    pub ack_timeout: Duration,
    pub jitter_capacity: usize,
    pub jitter_delay: usize,
}

impl StreamSettings {
    pub fn from_config(network: &NetworkConfig, streaming: &StreamingConfig) -> Self {
        Self {
            stream_port: network.stream_port,
            starting_address: network.starting_multicast_address,
            ack_timeout: Duration::from_millis(streaming.ack_timeout_ms),
            jitter_capacity: streaming.jitter_capacity,
            jitter_delay: streaming.jitter_delay,
        }
    }
}

/// Collaborators a session needs
pub struct SessionContext {
    /// Id of this node's own peer
    pub local_id: PeerId,
    pub messenger: Messenger,
    pub registry: Arc<PeerRegistry>,
    pub allocator: Arc<dyn AddressAllocator>,
    pub codec: Arc<dyn AudioCodec>,
    pub links: Arc<dyn StreamLinks>,
    pub settings: StreamSettings,
}

/// Commands accepted by a session task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Setup,
    Play,
    Pause,
    Ack(PeerId),
    Teardown,
}

/// Why a session task stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Publisher reached the end of the track
    Finished,
    TornDown,
    Failed(String),
}

/// Sent by a session task as it exits
#[derive(Debug, Clone)]
pub struct SessionEnded {
    pub key: SessionKey,
    pub serial: u64,
    pub zone: ZoneId,
    pub reason: EndReason,
}

/// Pool entry for a running session
pub struct SessionHandle {
    pub serial: u64,
    pub zone: ZoneId,
    pub descriptor: StreamDescriptor,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) -> Result<(), StreamError> {
        self.commands
            .send(command)
            .map_err(|_| StreamError::TaskGone(self.descriptor.track_id))
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
}

/// Spawn the task for a new session in `Init`
pub fn spawn_session(
    ctx: Arc<SessionContext>,
    descriptor: StreamDescriptor,
    zone: ZoneId,
    serial: u64,
    ended: mpsc::UnboundedSender<SessionEnded>,
) -> SessionHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SessionState::Init);

    let worker = Worker {
        session: Session::new(descriptor.track_id, zone, descriptor.role),
        ctx,
        descriptor: descriptor.clone(),
        serial,
        state_tx,
        ended,
        group: None,
        source: None,
        transmitter: None,
        sequence: 0,
        position: Duration::ZERO,
        streaming: false,
        next_frame_at: Instant::now(),
        frame_errors: 0,
        ack_deadline: None,
        receiver: None,
    };
    tokio::spawn(worker.run(commands_rx));

    SessionHandle {
        serial,
        zone,
        descriptor,
        commands: commands_tx,
        state: state_rx,
    }
}

struct Worker {
    ctx: Arc<SessionContext>,
    session: Session,
    descriptor: StreamDescriptor,
    serial: u64,
    state_tx: watch::Sender<SessionState>,
    ended: mpsc::UnboundedSender<SessionEnded>,

    // Publisher
    group: Option<Ipv4Addr>,
    source: Option<Box<dyn FrameSource>>,
    transmitter: Option<Box<dyn FrameTransmitter>>,
    sequence: u32,
    position: Duration,
    streaming: bool,
    next_frame_at: Instant,
    frame_errors: u32,
    ack_deadline: Option<Instant>,

    // Receiver
    receiver: Option<ReceiverThread>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let reason = loop {
            let pumping = self.streaming && self.session.role() == Role::Publisher;
            let ack_deadline = self.ack_deadline;

            tokio::select! {
                command = commands.recv() => {
                    let command = command.unwrap_or(SessionCommand::Teardown);
                    if let Some(reason) = self.handle(command).await {
                        break reason;
                    }
                }
                _ = tokio::time::sleep_until(self.next_frame_at), if pumping => {
                    if let Some(reason) = self.pump_frame().await {
                        break reason;
                    }
                }
                _ = tokio::time::sleep_until(ack_deadline.unwrap_or_else(Instant::now)), if ack_deadline.is_some() => {
                    tracing::warn!(
                        "Track {}: only {} of {} receivers acknowledged, starting anyway",
                        self.descriptor.track_id,
                        self.session.acks(),
                        self.session.quorum()
                    );
                    self.ack_deadline = None;
                    if let Some(reason) = self.step(Input::AckTimeout) {
                        break reason;
                    }
                }
            }
        };

        tracing::debug!(
            "Session for track {} ({:?}) ended: {:?}",
            self.descriptor.track_id,
            self.descriptor.role,
            reason
        );
        let _ = self.ended.send(SessionEnded {
            key: (self.descriptor.track_id, self.descriptor.role),
            serial: self.serial,
            zone: self.session.zone(),
            reason,
        });
    }

    async fn handle(&mut self, command: SessionCommand) -> Option<EndReason> {
        match command {
            SessionCommand::Setup => self.setup().await,
            SessionCommand::Play => self.step(Input::Play),
            SessionCommand::Pause => self.step(Input::Pause),
            SessionCommand::Ack(peer) => self.step(Input::Ack(peer)),
            SessionCommand::Teardown => {
                self.step(Input::Teardown);
                Some(EndReason::TornDown)
            }
        }
    }

    /// Apply an input and carry out its effects
    fn step(&mut self, input: Input) -> Option<EndReason> {
        let effects = match self.session.apply(input) {
            Ok(effects) => effects,
            Err(e) => {
                tracing::warn!("Track {}: {}", self.descriptor.track_id, e);
                return None;
            }
        };
        if !self.session.awaiting_acks() {
            self.ack_deadline = None;
        }

        for effect in effects {
            if let Err(reason) = self.execute(effect) {
                return Some(self.fail(reason));
            }
        }
        // Observers only see a state once its effects are done
        self.state_tx.send_replace(self.session.state());
        None
    }

    fn fail(&mut self, reason: String) -> EndReason {
        tracing::error!("Track {}: {}", self.descriptor.track_id, reason);
        if self.session.state() != SessionState::Teardown {
            self.step(Input::Teardown);
        }
        EndReason::Failed(reason)
    }

    async fn setup(&mut self) -> Option<EndReason> {
        if self.session.state() != SessionState::Init {
            tracing::warn!("Track {}: setup while {}", self.descriptor.track_id, self.session.state().as_str());
            return None;
        }

        match self.session.role() {
            Role::Publisher => match self.prepare_publisher().await {
                Ok(quorum) => {
                    let outcome = self.step(Input::Setup { quorum });
                    if self.session.awaiting_acks() {
                        self.ack_deadline = Some(Instant::now() + self.ctx.settings.ack_timeout);
                    }
                    outcome
                }
                Err(reason) => Some(self.fail(reason)),
            },
            Role::Receiver => self.step(Input::Setup {
                quorum: HashSet::new(),
            }),
        }
    }

    /// Open the file, claim a group and build the transmitter. Returns the
    /// peers whose acknowledgment is required.
    async fn prepare_publisher(&mut self) -> Result<HashSet<PeerId>, String> {
        let track_id = self.descriptor.track_id;
        let path = self
            .ctx
            .registry
            .lookup(&self.ctx.local_id)
            .and_then(|peer| peer.track(track_id).and_then(|t| t.path.clone()))
            .ok_or_else(|| StreamError::MissingFile(track_id).to_string())?;

        let source = self.ctx.codec.open_source(&path).map_err(|e| e.to_string())?;
        self.source = Some(source);

        let allocator = self.ctx.allocator.clone();
        let start = self.ctx.settings.starting_address;
        let group = tokio::task::spawn_blocking(move || allocator.find_free_address(start))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        self.group = Some(group);
        self.descriptor.group = Some(group);
        self.descriptor.publisher = Some(self.ctx.messenger.local_address());

        let port = self.ctx.settings.stream_port;
        let zone_peers = self.ctx.registry.peers_in_zone(self.session.zone());
        let mut targets = vec![group_target(group, port)];
        targets.extend(
            zone_peers
                .iter()
                .filter(|p| p.external)
                .filter_map(|p| p.ip.map(|ip| SocketAddr::new(ip, port))),
        );
        let transmitter = self.ctx.links.transmitter(targets).map_err(|e| e.to_string())?;
        self.transmitter = Some(transmitter);

        tracing::info!("Publishing track {} on {}:{}", track_id, group, port);
        Ok(zone_peers
            .into_iter()
            .filter(|p| !p.external)
            .map(|p| p.id)
            .collect())
    }

    fn execute(&mut self, effect: Effect) -> Result<(), String> {
        match effect {
            Effect::Announce => {
                self.send_to_receivers(StreamCommand::Play);
                Ok(())
            }
            Effect::Acknowledge => self.start_receiving(),
            Effect::ResumeReceivers => {
                self.send_to_receivers(StreamCommand::Play);
                Ok(())
            }
            Effect::StartStreaming => {
                match &self.receiver {
                    Some(receiver) => receiver.set_playing(true),
                    None => {
                        self.streaming = true;
                        self.next_frame_at = Instant::now();
                    }
                }
                tracing::debug!("Track {} playing", self.descriptor.track_id);
                Ok(())
            }
            Effect::StopStreaming => {
                self.streaming = false;
                if let Some(receiver) = &self.receiver {
                    receiver.set_playing(false);
                }
                tracing::debug!("Track {} paused", self.descriptor.track_id);
                Ok(())
            }
            Effect::Release => {
                self.release();
                Ok(())
            }
        }
    }

    /// Send `command` with the receive descriptor to every zone member
    fn send_to_receivers(&self, command: StreamCommand) {
        let message = GroupMessage::Stream {
            command,
            descriptor: self.descriptor.for_receivers(),
            zone: self.session.zone(),
        };
        for peer in self.ctx.registry.peers_in_zone(self.session.zone()) {
            if let Some(address) = &peer.address {
                self.ctx.messenger.send_logged(address, &message);
            }
        }
    }

    fn start_receiving(&mut self) -> Result<(), String> {
        let (group, publisher) = match (self.descriptor.group, self.descriptor.publisher.clone()) {
            (Some(group), Some(publisher)) => (group, publisher),
            _ => return Err("receive descriptor without group or publisher".to_string()),
        };

        let sink = self.ctx.codec.open_sink(&self.descriptor).map_err(|e| e.to_string())?;
        let listener = self
            .ctx
            .links
            .listener(group, self.descriptor.port)
            .map_err(|e| e.to_string())?;
        let jitter = JitterBuffer::new(self.ctx.settings.jitter_capacity, self.ctx.settings.jitter_delay);
        self.receiver = Some(ReceiverThread::start(self.descriptor.track_id, listener, sink, jitter)?);

        tracing::debug!("Listening for track {} on {}, acknowledging to {}", self.descriptor.track_id, group, publisher);
        self.ctx.messenger.send_logged(
            &publisher,
            &GroupMessage::StreamAck {
                track_id: self.descriptor.track_id,
                peer: self.ctx.local_id.clone(),
                zone: self.session.zone(),
            },
        );
        Ok(())
    }

    /// Read the next frame off the runtime threads
    async fn read_frame(&mut self) -> Result<Option<Result<Option<Frame>, CodecError>>, String> {
        let mut source = match self.source.take() {
            Some(source) => source,
            None => return Ok(None),
        };
        let (source, produced) = tokio::task::spawn_blocking(move || {
            let produced = source.produce_frame();
            (source, produced)
        })
        .await
        .map_err(|e| format!("frame reader stopped: {}", e))?;
        self.source = Some(source);
        Ok(Some(produced))
    }

    async fn pump_frame(&mut self) -> Option<EndReason> {
        let produced = match self.read_frame().await {
            Ok(produced) => produced,
            Err(reason) => return Some(self.fail(reason)),
        };
        let frame = match produced {
            Some(Ok(Some(frame))) => frame,
            Some(Ok(None)) | None => {
                tracing::info!("Track {} finished", self.descriptor.track_id);
                self.step(Input::Teardown);
                return Some(EndReason::Finished);
            }
            Some(Err(e)) => {
                self.frame_errors += 1;
                tracing::warn!("Track {}: skipping frame: {}", self.descriptor.track_id, e);
                if self.frame_errors >= MAX_FRAME_ERRORS {
                    return Some(self.fail(format!("{} consecutive frame errors", self.frame_errors)));
                }
                return None;
            }
        };
        self.frame_errors = 0;

        let packet = StreamPacket::new(
            self.descriptor.track_id,
            self.sequence,
            self.position.as_micros() as u64,
            frame.payload,
        );
        if let Some(transmitter) = self.transmitter.as_mut() {
            if let Err(e) = transmitter.transmit(&packet) {
                tracing::warn!("Track {}: failed to send packet {}: {}", self.descriptor.track_id, self.sequence, e);
            }
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.position += frame.duration;
        self.next_frame_at += frame.duration.max(Duration::from_millis(1));
        None
    }

    fn release(&mut self) {
        self.streaming = false;
        self.ack_deadline = None;

        if let Some(mut source) = self.source.take() {
            source.close();
        }
        if let Some(transmitter) = self.transmitter.take() {
            tracing::debug!(
                "Track {}: {} packets sent",
                self.descriptor.track_id,
                transmitter.packets_sent()
            );
        }
        if let Some(group) = self.group.take() {
            self.send_to_receivers(StreamCommand::Teardown);
            self.ctx.allocator.release(group);
        }
        if let Some(receiver) = self.receiver.take() {
            receiver.stop();
        }
    }
}

/// Blocking listener thread of a receiver session
struct ReceiverThread {
    running: Arc<AtomicBool>,
    playing: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiverThread {
    fn start(
        track_id: TrackId,
        mut listener: Box<dyn FrameListener>,
        mut sink: Box<dyn FrameSink>,
        mut jitter: JitterBuffer,
    ) -> Result<Self, String> {
        let running = Arc::new(AtomicBool::new(true));
        let playing = Arc::new(AtomicBool::new(false));

        let running_clone = running.clone();
        let playing_clone = playing.clone();
        let handle = thread::Builder::new()
            .name(format!("receiver-{}", track_id))
            .spawn(move || {
                let mut was_playing = false;

                while running_clone.load(Ordering::Relaxed) {
                    let packet = match listener.poll() {
                        Ok(Some(packet)) => packet,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!("Track {}: receive error: {}", track_id, e);
                            continue;
                        }
                    };
                    if packet.track_id != track_id {
                        continue;
                    }

                    let playing = playing_clone.load(Ordering::Relaxed);
                    if playing != was_playing {
                        jitter.reset();
                        was_playing = playing;
                    }
                    if !playing {
                        continue;
                    }

                    jitter.insert(packet);
                    while let Some(packet) = jitter.get_next() {
                        deliver(&mut *sink, track_id, packet);
                    }
                }

                for packet in jitter.drain() {
                    deliver(&mut *sink, track_id, packet);
                }
                sink.close();

                let stats = jitter.stats();
                tracing::debug!(
                    "Receiver for track {} stopped: {} received, {} lost, {} late",
                    track_id,
                    stats.received,
                    stats.lost,
                    stats.late
                );
            })
            .map_err(|e| e.to_string())?;

        Ok(Self {
            running,
            playing,
            handle: Some(handle),
        })
    }

    fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Relaxed);
    }

    fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            // The thread notices within one poll interval
            tokio::task::spawn_blocking(move || {
                let _ = handle.join();
            });
        }
    }
}

impl Drop for ReceiverThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn deliver(sink: &mut dyn FrameSink, track_id: TrackId, packet: StreamPacket) {
    let frame = Frame::new(packet.payload, Duration::ZERO);
    if let Err(e) = sink.consume_frame(&frame) {
        tracing::warn!("Track {}: dropping frame {}: {}", track_id, packet.sequence, e);
    }
}
