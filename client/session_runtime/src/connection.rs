/// Transport lifecycle. Owned by the transport; the session only reacts to
/// transitions reported through [`crate::session::SessionCore::on_connection_state_changed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Initial,
    PingingServer,
    Connecting,
    Connected,
    DisconnectedForever,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// What a state change means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTransition {
    Unchanged,
    Established,
    Lost,
    Closed,
    Progress,
}

pub fn classify(previous: ConnectionState, next: ConnectionState) -> ConnectionTransition {
    use ConnectionState::*;

    match (previous, next) {
        (prev, next) if prev == next => ConnectionTransition::Unchanged,
        (_, DisconnectedForever) => ConnectionTransition::Closed,
        (_, Connected) => ConnectionTransition::Established,
        (Connected, _) => ConnectionTransition::Lost,
        _ => ConnectionTransition::Progress,
    }
}
