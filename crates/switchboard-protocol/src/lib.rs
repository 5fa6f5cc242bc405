//! # switchboard-protocol
//!
//! Wire protocol definitions for the Switchboard realtime messaging layer.
//!
//! Every frame is a JSON object carrying a dotted `type` discriminator:
//!
//! - `room.join` / `room.leave` - Room membership
//! - `message.send` - Send a message to a room or a single recipient
//! - `typing.start` / `typing.stop` - Typing indicators
//! - `presence.update` - Change the sender's presence status
//! - `subscribe` / `unsubscribe` - Event-topic subscriptions
//!
//! Server events mirror these (`message.new`, `user.joined`, ...). Transport
//! level rejections use the stable numeric [`CloseCode`]s.
//!
//! ## Example
//!
//! ```rust
//! use switchboard_protocol::{codec, InboundFrame};
//!
//! let frame = codec::decode(r#"{"type":"room.join","room":"general"}"#).unwrap();
//! assert_eq!(frame, InboundFrame::RoomJoin { room: "general".into() });
//! ```

pub mod close;
pub mod codec;
pub mod frames;
pub mod version;

pub use close::CloseCode;
pub use codec::{decode, encode, ProtocolError};
pub use frames::{
    DeliveryStatus, ErrorBody, InboundFrame, MessageType, MessageView, OutboundFrame,
    PresenceEntry, PresenceStatus,
};
pub use version::{negotiate, Version, VersionError, PROTOCOL_VERSION};
