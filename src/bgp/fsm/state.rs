use std::fmt;

use super::error::FsmErrorSubcode;

/// BGP FSM States per RFC 4271 Section 8.2.2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FsmState {
    /// No connection. The next step arms a connection attempt.
    #[default]
    Idle,
    /// Dialing the peer (active mode).
    Connect,
    /// Waiting for the peer to dial in (passive mode), retrying on failure.
    Active,
    /// Connected, OPEN sent, waiting for peer's OPEN.
    OpenSent,
    /// Received peer's OPEN, sent KEEPALIVE, waiting for peer's KEEPALIVE.
    OpenConfirm,
    /// Session established, exchanging UPDATE messages.
    Established,
}

impl FsmState {
    /// Returns true if a transport connection is held in this state.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            FsmState::OpenSent | FsmState::OpenConfirm | FsmState::Established
        )
    }

    pub fn is_established(&self) -> bool {
        matches!(self, FsmState::Established)
    }

    /// RFC 6608 subcode for a message that is not acceptable in this state.
    pub fn unexpected_message_subcode(&self) -> FsmErrorSubcode {
        match self {
            FsmState::OpenSent => FsmErrorSubcode::UnexpectedMessageInOpenSentState,
            FsmState::OpenConfirm => FsmErrorSubcode::UnexpectedMessageInOpenConfirmState,
            FsmState::Established => FsmErrorSubcode::UnexpectedMessageInEstablishedState,
            _ => FsmErrorSubcode::UnspecifiedError,
        }
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsmState::Idle => "Idle",
            FsmState::Connect => "Connect",
            FsmState::Active => "Active",
            FsmState::OpenSent => "OpenSent",
            FsmState::OpenConfirm => "OpenConfirm",
            FsmState::Established => "Established",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_idle() {
        assert_eq!(FsmState::default(), FsmState::Idle);
    }

    #[test]
    fn test_is_connected() {
        assert!(!FsmState::Idle.is_connected());
        assert!(!FsmState::Connect.is_connected());
        assert!(!FsmState::Active.is_connected());
        assert!(FsmState::OpenSent.is_connected());
        assert!(FsmState::OpenConfirm.is_connected());
        assert!(FsmState::Established.is_connected());
    }

    #[test]
    fn test_is_established() {
        assert!(!FsmState::OpenConfirm.is_established());
        assert!(FsmState::Established.is_established());
    }

    #[test]
    fn test_unexpected_message_subcode() {
        assert_eq!(FsmState::OpenSent.unexpected_message_subcode() as u8, 1);
        assert_eq!(FsmState::OpenConfirm.unexpected_message_subcode() as u8, 2);
        assert_eq!(FsmState::Established.unexpected_message_subcode() as u8, 3);
        assert_eq!(FsmState::Idle.unexpected_message_subcode() as u8, 0);
    }
}
