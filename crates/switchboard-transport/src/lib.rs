//! # switchboard-transport
//!
//! Transport abstraction layer for the Switchboard messaging core.
//!
//! - **WebSocket** - An upgraded axum socket
//! - **Memory** - An in-process pair for tests and benchmarks
//!
//! ## Transport Abstraction
//!
//! Sessions are written against [`Transport`], so they never touch the
//! underlying socket type.
//!
//! ```rust,ignore
//! use switchboard_transport::Transport;
//!
//! async fn echo(mut transport: impl Transport) {
//!     while let Ok(Some(text)) = transport.recv().await {
//!         let _ = transport.send_text(text).await;
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{memory_pair, ClientEvent, MemoryClient, MemoryTransport};
pub use traits::{Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
