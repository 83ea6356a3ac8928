pub mod bgp;
pub mod config;
pub mod daemon;
pub mod error;
pub mod rib;

pub use bgp::{FsmState, Message, Session, SessionConfig, SessionError};
pub use config::Config;
pub use daemon::Coordinator;
pub use error::{ClosError, ConfigError, RibError};
pub use rib::{RibEngine, RibHandle};
