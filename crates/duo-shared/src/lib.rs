// Identifiers and the JSON wire protocol spoken between Duo clients and the server.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{ClientEvent, MessageStatus, ServerEvent};
pub use types::{ConnectionId, RoomId, UserId};
