use std::fmt;

/// Lifecycle state of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardState {
    Disconnected,
    Connecting,
    WaitingHello,
    Identifying,
    Resuming,
    Ready,
    Reconnecting,
    Closed,
}

impl ShardState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// Closed is terminal. Every live state may fall back to Reconnecting.
    pub fn can_transition_to(self, next: ShardState) -> bool {
        use ShardState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Reconnecting, Connecting) => true,
            (Connecting, WaitingHello) => true,
            (WaitingHello, Identifying) | (WaitingHello, Resuming) => true,
            (Identifying, Ready) | (Resuming, Ready) => true,
            // Invalid session on resume falls back to identify
            (Resuming, Identifying) => true,
            (Disconnected, _) => false,
            (_, Reconnecting) => true,
            _ => false,
        }
    }

    pub fn is_ready(self) -> bool {
        self == ShardState::Ready
    }
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardState::Disconnected => "disconnected",
            ShardState::Connecting => "connecting",
            ShardState::WaitingHello => "waiting_hello",
            ShardState::Identifying => "identifying",
            ShardState::Resuming => "resuming",
            ShardState::Ready => "ready",
            ShardState::Reconnecting => "reconnecting",
            ShardState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a shard is reconnecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectCause {
    /// Server closed the socket with a non-fatal code
    Closed(u16),
    /// Server sent Reconnect (op 7)
    ServerRequested,
    /// Server sent Invalid Session (op 9)
    InvalidSession { resumable: bool },
    /// Heartbeat deadline passed without an ack
    Zombie,
    /// Socket error or unexpected end of stream
    Transport,
    /// Malformed payload from the server
    Protocol,
    /// No frame within the read timeout
    ReadTimeout,
    /// Reconnect requested through the manager
    Requested,
}

impl ReconnectCause {
    /// Whether the session survives this reconnect
    pub fn is_resumable(&self) -> bool {
        match self {
            ReconnectCause::Closed(code) => {
                crate::payload::classify_close(*code) == crate::payload::CloseAction::Resume
            }
            ReconnectCause::InvalidSession { resumable } => *resumable,
            ReconnectCause::Protocol => false,
            ReconnectCause::ServerRequested
            | ReconnectCause::Zombie
            | ReconnectCause::Transport
            | ReconnectCause::ReadTimeout
            | ReconnectCause::Requested => true,
        }
    }
}

impl fmt::Display for ReconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectCause::Closed(code) => write!(
                f,
                "closed with {} ({})",
                code,
                crate::payload::close_reason(*code)
            ),
            ReconnectCause::ServerRequested => f.write_str("server requested reconnect"),
            ReconnectCause::InvalidSession { resumable } => {
                write!(f, "invalid session (resumable: {})", resumable)
            }
            ReconnectCause::Zombie => f.write_str("heartbeat not acknowledged"),
            ReconnectCause::Transport => f.write_str("transport failure"),
            ReconnectCause::Protocol => f.write_str("protocol error"),
            ReconnectCause::ReadTimeout => f.write_str("read timeout"),
            ReconnectCause::Requested => f.write_str("reconnect requested"),
        }
    }
}

/// What to send after Hello
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Identify,
    Resume {
        session_id: String,
        sequence: Option<u64>,
    },
}

/// Session state of one shard, independent of any socket.
#[derive(Debug, Clone)]
pub struct ShardSession {
    state: ShardState,
    session_id: Option<String>,
    sequence: Option<u64>,
    resume_url: Option<String>,
}

impl Default for ShardSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardSession {
    pub fn new() -> Self {
        Self {
            state: ShardState::Disconnected,
            session_id: None,
            sequence: None,
            resume_url: None,
        }
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    /// Move to `next`. Returns the previous state, or `None` if the
    /// transition is not allowed.
    pub fn set_state(&mut self, next: ShardState) -> Option<ShardState> {
        if self.state == next || !self.state.can_transition_to(next) {
            return None;
        }
        let prev = self.state;
        self.state = next;
        Some(prev)
    }

    /// Decide the handshake after Hello and enter Identifying or Resuming.
    pub fn hello(&mut self) -> Handshake {
        match &self.session_id {
            Some(session_id) => {
                let handshake = Handshake::Resume {
                    session_id: session_id.clone(),
                    sequence: self.sequence,
                };
                self.set_state(ShardState::Resuming);
                handshake
            }
            None => {
                self.set_state(ShardState::Identifying);
                Handshake::Identify
            }
        }
    }

    /// READY received
    pub fn ready(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        self.resume_url = resume_url;
        self.set_state(ShardState::Ready);
    }

    /// RESUMED received
    pub fn resumed(&mut self) {
        self.set_state(ShardState::Ready);
    }

    /// Keep the highest sequence seen
    pub fn observe_sequence(&mut self, seq: Option<u64>) {
        if let Some(seq) = seq {
            if self.sequence.map_or(true, |cur| seq > cur) {
                self.sequence = Some(seq);
            }
        }
    }

    /// Enter Reconnecting. Clears the session unless `cause` is resumable.
    pub fn reconnect(&mut self, cause: &ReconnectCause) -> bool {
        if !cause.is_resumable() {
            self.clear_session();
        }
        self.set_state(ShardState::Reconnecting).is_some()
    }

    /// Drop session id, sequence and resume url
    pub fn clear_session(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
    }
}

/// Shard responsible for a guild: `(guild_id >> 22) % total_shards`.
///
/// Returns 0 when `total_shards` is 0.
pub fn shard_for_guild(guild_id: u64, total_shards: u32) -> u32 {
    if total_shards == 0 {
        return 0;
    }
    ((guild_id >> 22) % u64::from(total_shards)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_session() -> ShardSession {
        let mut session = ShardSession::new();
        session.set_state(ShardState::Connecting);
        session.set_state(ShardState::WaitingHello);
        assert_eq!(session.hello(), Handshake::Identify);
        session.observe_sequence(Some(1));
        session.ready("sess-1".into(), Some("wss://resume.example".into()));
        session
    }

    #[test]
    fn test_identify_then_ready() {
        let session = ready_session();
        assert_eq!(session.state(), ShardState::Ready);
        assert_eq!(session.session_id(), Some("sess-1"));
        assert_eq!(session.resume_url(), Some("wss://resume.example"));
    }

    #[test]
    fn test_resumable_close_keeps_session() {
        let mut session = ready_session();
        session.observe_sequence(Some(42));

        assert!(session.reconnect(&ReconnectCause::Closed(4000)));
        assert_eq!(session.state(), ShardState::Reconnecting);

        session.set_state(ShardState::Connecting);
        session.set_state(ShardState::WaitingHello);
        assert_eq!(
            session.hello(),
            Handshake::Resume {
                session_id: "sess-1".into(),
                sequence: Some(42)
            }
        );
        assert_eq!(session.state(), ShardState::Resuming);

        session.resumed();
        assert_eq!(session.state(), ShardState::Ready);
        assert_eq!(session.session_id(), Some("sess-1"));
        assert_eq!(session.sequence(), Some(42));
    }

    #[test]
    fn test_non_resumable_close_clears_session() {
        for cause in [
            ReconnectCause::Closed(4009),
            ReconnectCause::Closed(4007),
            ReconnectCause::InvalidSession { resumable: false },
            ReconnectCause::Protocol,
        ] {
            let mut session = ready_session();
            session.reconnect(&cause);
            assert!(session.session_id().is_none(), "{:?}", cause);
            assert!(session.sequence().is_none(), "{:?}", cause);
            assert!(session.resume_url().is_none(), "{:?}", cause);
        }
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let mut session = ShardSession::new();
        session.observe_sequence(Some(5));
        session.observe_sequence(None);
        session.observe_sequence(Some(3));
        assert_eq!(session.sequence(), Some(5));
        session.observe_sequence(Some(6));
        assert_eq!(session.sequence(), Some(6));
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut session = ready_session();
        assert_eq!(session.set_state(ShardState::Closed), Some(ShardState::Ready));
        assert!(session.set_state(ShardState::Connecting).is_none());
        assert!(!session.reconnect(&ReconnectCause::Transport));
        assert_eq!(session.state(), ShardState::Closed);
        assert!(session.set_state(ShardState::Closed).is_none());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut session = ShardSession::new();
        assert!(session.set_state(ShardState::Ready).is_none());
        assert!(session.set_state(ShardState::Reconnecting).is_none());
        assert!(!ShardState::Connecting.can_transition_to(ShardState::Ready));
        assert!(ShardState::Resuming.can_transition_to(ShardState::Identifying));
    }

    #[test]
    fn test_shard_for_guild() {
        // 41771983423143937 >> 22 == 9959216934
        assert_eq!(shard_for_guild(41771983423143937, 1), 0);
        assert_eq!(shard_for_guild(41771983423143937, 16), 6);
        assert_eq!(shard_for_guild(5 << 22, 4), 1);
        assert_eq!(shard_for_guild(123, 0), 0);
    }
}
