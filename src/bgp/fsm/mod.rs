//! Building blocks of the session state machine: states, NOTIFICATION error
//! codes, and OPEN validation. The state loop itself lives in `bgp::session`.

pub mod error;
pub mod state;
pub mod validation;

pub use error::{ErrorCode, FsmErrorSubcode, NotificationError};
pub use state::FsmState;
pub use validation::{keepalive_time, negotiate_hold_time, validate_open};
