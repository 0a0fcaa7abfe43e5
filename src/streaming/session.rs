//! Session state machine
//!
//! ```text
//!  Init ──setup──► Setup ──play + quorum──► Playing ◄──play── Paused
//!                                               └────pause────►
//!  any ──teardown──► Teardown
//! ```
//!
//! Transitions are pure: applying an input yields the effects the session
//! task has to carry out. A play that arrives during setup is remembered and
//! takes effect when the last expected acknowledgment comes in.

use std::collections::HashSet;

use crate::error::StreamError;
use crate::protocol::{PeerId, Role, TrackId, ZoneId};

/// Playback state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Setup,
    Playing,
    Paused,
    Teardown,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::Setup => "setup",
            SessionState::Playing => "playing",
            SessionState::Paused => "paused",
            SessionState::Teardown => "teardown",
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Start the handshake; publishers wait for an ack from every peer in
    /// `quorum`
    Setup { quorum: HashSet<PeerId> },
    Ack(PeerId),
    /// Acknowledgments did not all arrive in time
    AckTimeout,
    Play,
    Pause,
    Teardown,
}

impl Input {
    fn as_str(&self) -> &'static str {
        match self {
            Input::Setup { .. } => "setup",
            Input::Ack(_) => "ack",
            Input::AckTimeout => "ack timeout",
            Input::Play => "play",
            Input::Pause => "pause",
            Input::Teardown => "teardown",
        }
    }
}

/// Work the session task must do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Publisher: send the receive descriptor to every zone peer
    Announce,
    /// Receiver: open the sink and listener, then ack the publisher
    Acknowledge,
    /// Publisher resuming: tell receivers to play again
    ResumeReceivers,
    /// Start or resume moving frames
    StartStreaming,
    /// Park the frame loop
    StopStreaming,
    /// Close the codec and free the address
    Release,
}

/// One track's playback, in publisher or receiver role
#[derive(Debug, Clone)]
pub struct Session {
    track_id: TrackId,
    zone: ZoneId,
    role: Role,
    state: SessionState,
    expected: HashSet<PeerId>,
    acked: HashSet<PeerId>,
    /// Set once every ack arrived or the wait timed out
    released: bool,
    play_pending: bool,
}

impl Session {
    pub fn new(track_id: TrackId, zone: ZoneId, role: Role) -> Self {
        Self {
            track_id,
            zone,
            role,
            state: SessionState::Init,
            expected: HashSet::new(),
            acked: HashSet::new(),
            released: false,
            play_pending: false,
        }
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of acknowledgments required before playback
    pub fn quorum(&self) -> usize {
        self.expected.len()
    }

    pub fn acks(&self) -> usize {
        self.acked.len()
    }

    /// Still waiting on acknowledgments
    pub fn awaiting_acks(&self) -> bool {
        self.state == SessionState::Setup && !self.released
    }

    pub fn apply(&mut self, input: Input) -> Result<Vec<Effect>, StreamError> {
        use SessionState::*;

        let command = input.as_str();
        let effects = match (self.state, input) {
            (Teardown, Input::Teardown) => Vec::new(),
            (_, Input::Teardown) => {
                self.state = Teardown;
                vec![Effect::Release]
            }

            (Init, Input::Setup { quorum }) => {
                self.state = Setup;
                match self.role {
                    Role::Publisher => {
                        self.released = quorum.is_empty();
                        self.expected = quorum;
                        vec![Effect::Announce]
                    }
                    Role::Receiver => {
                        self.released = true;
                        vec![Effect::Acknowledge]
                    }
                }
            }

            (Setup, Input::Ack(peer)) => {
                if !self.expected.contains(&peer) {
                    tracing::debug!("Ignoring ack from {} for track {}", peer, self.track_id);
                    return Ok(Vec::new());
                }
                self.acked.insert(peer);
                if self.acked.len() == self.expected.len() {
                    self.released = true;
                }
                self.start_if_ready()
            }
            // Late or duplicate acks change nothing
            (_, Input::Ack(_)) if self.state != Init => Vec::new(),

            (Setup, Input::AckTimeout) => {
                self.released = true;
                self.start_if_ready()
            }
            (_, Input::AckTimeout) if self.state != Init => Vec::new(),

            (Setup, Input::Play) => {
                self.play_pending = true;
                self.start_if_ready()
            }
            (Paused, Input::Play) => {
                self.state = Playing;
                match self.role {
                    Role::Publisher => vec![Effect::ResumeReceivers, Effect::StartStreaming],
                    Role::Receiver => vec![Effect::StartStreaming],
                }
            }
            (Playing, Input::Play) => Vec::new(),

            (Playing, Input::Pause) => {
                self.state = Paused;
                vec![Effect::StopStreaming]
            }

            (state, _) => {
                return Err(StreamError::InvalidTransition {
                    state: state.as_str(),
                    command,
                })
            }
        };
        Ok(effects)
    }

    fn start_if_ready(&mut self) -> Vec<Effect> {
        if self.released && self.play_pending {
            self.play_pending = false;
            self.state = SessionState::Playing;
            vec![Effect::StartStreaming]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quorum(ids: &[&str]) -> HashSet<PeerId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn publisher() -> Session {
        Session::new(1, ZoneId::new(), Role::Publisher)
    }

    #[test]
    fn test_play_waits_for_every_ack() {
        let mut session = publisher();
        assert_eq!(
            session.apply(Input::Setup { quorum: quorum(&["a", "b"]) }).unwrap(),
            vec![Effect::Announce]
        );

        assert!(session.apply(Input::Play).unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Setup);

        assert!(session.apply(Input::Ack("a".into())).unwrap().is_empty());
        // duplicate and unexpected acks do not count
        assert!(session.apply(Input::Ack("a".into())).unwrap().is_empty());
        assert!(session.apply(Input::Ack("remote".into())).unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Setup);

        assert_eq!(
            session.apply(Input::Ack("b".into())).unwrap(),
            vec![Effect::StartStreaming]
        );
        assert_eq!(session.state(), SessionState::Playing);
        assert_eq!(session.acks(), 2);
    }

    #[test]
    fn test_acks_before_play() {
        let mut session = publisher();
        session.apply(Input::Setup { quorum: quorum(&["a"]) }).unwrap();
        session.apply(Input::Ack("a".into())).unwrap();
        assert_eq!(session.state(), SessionState::Setup);
        assert_eq!(session.apply(Input::Play).unwrap(), vec![Effect::StartStreaming]);
    }

    #[test]
    fn test_empty_quorum_is_ready() {
        let mut session = publisher();
        session.apply(Input::Setup { quorum: HashSet::new() }).unwrap();
        assert!(!session.awaiting_acks());
        assert_eq!(session.apply(Input::Play).unwrap(), vec![Effect::StartStreaming]);
    }

    #[test]
    fn test_timeout_releases_pending_play() {
        let mut session = publisher();
        session.apply(Input::Setup { quorum: quorum(&["a", "b"]) }).unwrap();
        session.apply(Input::Play).unwrap();
        assert!(session.awaiting_acks());
        assert_eq!(session.apply(Input::AckTimeout).unwrap(), vec![Effect::StartStreaming]);
        assert_eq!(session.state(), SessionState::Playing);
    }

    #[test]
    fn test_pause_resume_skips_handshake() {
        let mut session = publisher();
        session.apply(Input::Setup { quorum: quorum(&["a"]) }).unwrap();
        session.apply(Input::Ack("a".into())).unwrap();
        session.apply(Input::Play).unwrap();

        assert_eq!(session.apply(Input::Pause).unwrap(), vec![Effect::StopStreaming]);
        assert_eq!(
            session.apply(Input::Play).unwrap(),
            vec![Effect::ResumeReceivers, Effect::StartStreaming]
        );
        assert_eq!(session.state(), SessionState::Playing);
    }

    #[test]
    fn test_receiver_acknowledges_on_setup() {
        let mut session = Session::new(4, ZoneId::new(), Role::Receiver);
        assert_eq!(
            session.apply(Input::Setup { quorum: HashSet::new() }).unwrap(),
            vec![Effect::Acknowledge]
        );
        assert_eq!(session.apply(Input::Play).unwrap(), vec![Effect::StartStreaming]);
        assert_eq!(session.apply(Input::Pause).unwrap(), vec![Effect::StopStreaming]);
        assert_eq!(session.apply(Input::Play).unwrap(), vec![Effect::StartStreaming]);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut session = publisher();
        assert!(matches!(
            session.apply(Input::Play),
            Err(StreamError::InvalidTransition { state: "init", command: "play" })
        ));
        assert!(session.apply(Input::Pause).is_err());

        session.apply(Input::Setup { quorum: HashSet::new() }).unwrap();
        assert!(session.apply(Input::Setup { quorum: HashSet::new() }).is_err());
        assert!(session.apply(Input::Pause).is_err());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut session = publisher();
        session.apply(Input::Setup { quorum: HashSet::new() }).unwrap();
        assert_eq!(session.apply(Input::Teardown).unwrap(), vec![Effect::Release]);
        assert!(session.apply(Input::Teardown).unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Teardown);
        assert!(session.apply(Input::Play).is_err());
    }
}
