/// Lifecycle of the client's link to the telemetry service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Last connect attempt or live session failed.
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ConnectionState::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Things that happen to a connection. Fed to `ConnectionGraph::transition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    SessionEstablished,
    ConnectFailed(String),
    /// The caller gave up on a pending connect.
    ConnectAbandoned,
    DisconnectRequested,
    /// The service closed the session in an orderly way.
    SessionClosed,
    SessionDied(String),
    /// A call failed in a way that leaves the session unusable.
    CallFailed(String),
}

/// Pure state machine for `ConnectionState`.
pub struct ConnectionGraph;

impl ConnectionGraph {
    /// (current, event) -> next. `None` means the event does not apply in
    /// the current state and must be ignored.
    pub fn transition(current: &ConnectionState, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (current, event) {
            // --- From Disconnected / Error ---
            (Disconnected | Error(_), ConnectRequested) => Some(Connecting),

            // --- From Connecting ---
            (Connecting, SessionEstablished) => Some(Connected),
            (Connecting, ConnectFailed(msg)) => Some(Error(msg)),
            (Connecting, ConnectAbandoned) => Some(Disconnected),

            // --- From Connected ---
            (Connected, DisconnectRequested) => Some(Disconnected),
            (Connected, SessionClosed) => Some(Disconnected),
            (Connected, SessionDied(msg)) => Some(Error(msg)),
            (Connected, CallFailed(msg)) => Some(Error(msg)),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_cycle() {
        let s = ConnectionState::default();
        let s = ConnectionGraph::transition(&s, ConnectionEvent::ConnectRequested).unwrap();
        assert_eq!(s, ConnectionState::Connecting);
        let s = ConnectionGraph::transition(&s, ConnectionEvent::SessionEstablished).unwrap();
        assert!(s.is_connected());
        let s = ConnectionGraph::transition(&s, ConnectionEvent::DisconnectRequested).unwrap();
        assert_eq!(s, ConnectionState::Disconnected);
    }

    #[test]
    fn death_while_connected_is_an_error() {
        let s = ConnectionGraph::transition(
            &ConnectionState::Connected,
            ConnectionEvent::SessionDied("connection lost".into()),
        )
        .unwrap();
        assert_eq!(s.error_message(), Some("connection lost"));
    }

    #[test]
    fn error_state_can_retry() {
        let s = ConnectionState::Error("refused".into());
        assert_eq!(
            ConnectionGraph::transition(&s, ConnectionEvent::ConnectRequested),
            Some(ConnectionState::Connecting)
        );
    }

    #[test]
    fn stray_events_are_ignored() {
        assert_eq!(
            ConnectionGraph::transition(&ConnectionState::Disconnected, ConnectionEvent::DisconnectRequested),
            None
        );
        assert_eq!(
            ConnectionGraph::transition(&ConnectionState::Error("x".into()), ConnectionEvent::SessionDied("y".into())),
            None
        );
        assert_eq!(
            ConnectionGraph::transition(&ConnectionState::Connected, ConnectionEvent::ConnectRequested),
            None
        );
    }
}
