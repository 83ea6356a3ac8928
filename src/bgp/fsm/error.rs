use crate::bgp::message::{DecodeError, Notification};
use crate::bgp::update::attr_type;

/// NOTIFICATION error codes (RFC 4271, 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    MessageHeaderError = 1,
    OpenMessageError = 2,
    UpdateMessageError = 3,
    HoldTimerExpired = 4,
    FiniteStateMachineError = 5,
    Cease = 6,
}

/// Header error subcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderErrorSubcode {
    ConnectionNotSynchronized = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
}

/// OPEN error subcodes. Only the ones this speaker sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpenErrorSubcode {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnacceptableHoldTime = 6,
}

/// UPDATE error subcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateErrorSubcode {
    MalformedAttributeList = 1,
    MissingWellKnownAttribute = 3,
    AttributeLengthError = 5,
    InvalidOriginAttribute = 6,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

/// FSM Error subcodes per RFC 6608.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FsmErrorSubcode {
    UnspecifiedError = 0,
    UnexpectedMessageInOpenSentState = 1,
    UnexpectedMessageInOpenConfirmState = 2,
    UnexpectedMessageInEstablishedState = 3,
}

/// Cease subcodes (RFC 4486).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CeaseSubcode {
    AdministrativeShutdown = 2,
    PeerDeconfigured = 3,
}

/// The NOTIFICATION a session sends when it gives up on a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationError {
    pub code: ErrorCode,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationError {
    pub fn new(code: ErrorCode, subcode: u8) -> Self {
        Self {
            code,
            subcode,
            data: Vec::new(),
        }
    }

    pub fn with_data(code: ErrorCode, subcode: u8, data: Vec<u8>) -> Self {
        Self { code, subcode, data }
    }

    pub fn hold_timer_expired() -> Self {
        Self::new(ErrorCode::HoldTimerExpired, 0)
    }

    /// Cease with Administrative Shutdown, sent when a session is cancelled.
    pub fn cease() -> Self {
        Self::new(ErrorCode::Cease, CeaseSubcode::AdministrativeShutdown as u8)
    }

    /// Cease with Peer De-configured, sent when the peer is removed for good.
    pub fn peer_deconfigured() -> Self {
        Self::new(ErrorCode::Cease, CeaseSubcode::PeerDeconfigured as u8)
    }

    pub fn fsm_error(subcode: FsmErrorSubcode) -> Self {
        Self::new(ErrorCode::FiniteStateMachineError, subcode as u8)
    }

    pub fn unsupported_version(supported_version: u8) -> Self {
        Self::with_data(
            ErrorCode::OpenMessageError,
            OpenErrorSubcode::UnsupportedVersionNumber as u8,
            vec![0, supported_version],
        )
    }

    pub fn bad_peer_as() -> Self {
        Self::new(ErrorCode::OpenMessageError, OpenErrorSubcode::BadPeerAs as u8)
    }

    pub fn bad_bgp_identifier() -> Self {
        Self::new(
            ErrorCode::OpenMessageError,
            OpenErrorSubcode::BadBgpIdentifier as u8,
        )
    }

    pub fn unacceptable_hold_time() -> Self {
        Self::new(
            ErrorCode::OpenMessageError,
            OpenErrorSubcode::UnacceptableHoldTime as u8,
        )
    }

    fn header(subcode: HeaderErrorSubcode) -> Self {
        Self::new(ErrorCode::MessageHeaderError, subcode as u8)
    }

    fn update(subcode: UpdateErrorSubcode) -> Self {
        Self::new(ErrorCode::UpdateMessageError, subcode as u8)
    }

    /// The NOTIFICATION to send for a decode failure, if the connection is
    /// still usable enough to carry one.
    pub fn from_decode_error(err: &DecodeError) -> Option<Self> {
        let notification = match err {
            DecodeError::BadMarker => Self::header(HeaderErrorSubcode::ConnectionNotSynchronized),
            DecodeError::BadLength(length) => Self::with_data(
                ErrorCode::MessageHeaderError,
                HeaderErrorSubcode::BadMessageLength as u8,
                length.to_be_bytes().to_vec(),
            ),
            DecodeError::UnknownMessageType(msg_type) => Self::with_data(
                ErrorCode::MessageHeaderError,
                HeaderErrorSubcode::BadMessageType as u8,
                vec![*msg_type],
            ),
            DecodeError::TruncatedMessage => Self::update(UpdateErrorSubcode::MalformedAttributeList),
            DecodeError::InvalidPrefixLength(_) => Self::update(UpdateErrorSubcode::InvalidNetworkField),
            DecodeError::MalformedAttribute { type_code, .. } => match *type_code {
                attr_type::ORIGIN => Self::update(UpdateErrorSubcode::InvalidOriginAttribute),
                attr_type::AS_PATH => Self::update(UpdateErrorSubcode::MalformedAsPath),
                _ => Self::update(UpdateErrorSubcode::AttributeLengthError),
            },
            DecodeError::MissingAttribute(type_code) => Self::with_data(
                ErrorCode::UpdateMessageError,
                UpdateErrorSubcode::MissingWellKnownAttribute as u8,
                vec![*type_code],
            ),
            DecodeError::Io(_) => return None,
        };
        Some(notification)
    }
}

impl From<NotificationError> for Notification {
    fn from(err: NotificationError) -> Self {
        Notification::new(err.code as u8, err.subcode, err.data)
    }
}
