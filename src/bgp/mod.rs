pub mod fsm;
pub mod message;
pub mod prefix;
pub mod session;
pub mod transport;
pub mod update;

pub use fsm::{FsmState, NotificationError};
pub use message::{DecodeError, Message, MessageCodec, Notification, OpenMessage};
pub use prefix::Prefix;
pub use session::{PeerInfo, Session, SessionConfig, SessionError};
pub use transport::{SessionMode, TcpTransport, Transport};
pub use update::{AsPath, Origin, PathAttribute, UpdateMessage};
