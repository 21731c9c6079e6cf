//! GSM 07.10 basic-mode multiplexer: framing, per-channel state machines,
//! and the session that ties them together.

pub mod channel;
pub mod frame;
pub mod session;

pub use channel::ChannelState;
pub use session::{DataHandler, MuxSession, SessionState, StateHandler, DLCI_CONTROL};

/// Fixed DLCI assignments for this product.
pub const DLCI_AT: u8 = 1;
pub const DLCI_STATION: u8 = 2;
pub const DLCI_SOFTAP: u8 = 3;
