//! # switchboard-core
//!
//! Connections, rooms, presence and message delivery for the Switchboard
//! realtime engine.
//!
//! - **Broker** - Pub/sub fan-out to named groups
//! - **Registry** - Open connections by id and by identity
//! - **Rooms** - Directory, access policy and live membership
//! - **Presence** - Per-(identity, room) liveness
//! - **Delivery** - Persisted messages, history and retention
//! - **Hub** - Admission, sessions and the admin surface
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐    ┌───────────┐    ┌────────────┐
//! │ Transport │───▶│  Session  │───▶│ Dispatcher │
//! └───────────┘    └───────────┘    └────────────┘
//!       ▲                │                 │
//!       │ close code     ▼                 ▼
//! ┌───────────┐    ┌───────────┐    ┌────────────┐    ┌──────────┐
//! │ Admission │    │ Registry  │◀───│   Rooms    │───▶│ Presence │
//! └───────────┘    └───────────┘    └────────────┘    └──────────┘
//!                        │                 │
//!                        ▼                 ▼
//!                  ┌───────────┐    ┌────────────┐
//!                  │  Broker   │◀───│  Delivery  │───▶ Store
//!                  └───────────┘    └────────────┘
//! ```

pub mod admin;
pub mod broker;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod membership;
pub mod message;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod room;
mod session;
pub mod store;

pub use admin::{BroadcastReport, BroadcastRequest};
pub use broker::{Broker, BrokerError, BrokerStats, Event, InMemoryBroker};
pub use config::{AdmissionConfig, HubConfig, RetentionConfig, SessionConfig};
pub use connection::{ConnectionHandle, ConnectionInfo, ConnectionState, SessionChannels};
pub use delivery::{MessageService, PurgeReport};
pub use error::CoreError;
pub use hub::{ConnectRequest, Hub, HubBuilder, HubError, HubStats, RetentionReport};
pub use membership::{AllowAll, JoinOutcome, RoomAuthorizer, RoomService};
pub use message::{Destination, Message, MessageDraft, MessageId};
pub use presence::{PresenceRecord, PresenceTracker};
pub use registry::{ConnectionFilter, ConnectionRegistry, RegistryStats};
pub use room::{Room, RoomDirectory, RoomFeatures, RoomSpec, RoomType, RoomUpdate};
pub use store::{HistoryQuery, MemoryStore, Store, StoreError};
