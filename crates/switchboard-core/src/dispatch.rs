//! Routes decoded inbound frames to room, message, presence and topic
//! operations.

use crate::connection::ConnectionHandle;
use crate::delivery::MessageService;
use crate::error::CoreError;
use crate::membership::RoomService;
use crate::message::MessageDraft;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use switchboard_protocol::{InboundFrame, OutboundFrame};
use tracing::trace;

/// The services a frame can reach.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomService>,
    messages: Arc<MessageService>,
    presence: Arc<PresenceTracker>,
    history_on_join: usize,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomService>,
        messages: Arc<MessageService>,
        presence: Arc<PresenceTracker>,
        history_on_join: usize,
    ) -> Self {
        Self {
            registry,
            rooms,
            messages,
            presence,
            history_on_join,
        }
    }

    /// Handle one frame from `conn`.
    ///
    /// Returns the reply for the sender, if the operation has one. Fan-out to
    /// other connections happens through the broker.
    ///
    /// # Errors
    ///
    /// Any [`CoreError`]; the session turns it into an `error` frame.
    pub async fn dispatch(
        &self,
        conn: &ConnectionHandle,
        frame: InboundFrame,
    ) -> Result<Option<OutboundFrame>, CoreError> {
        trace!(connection = %conn.id(), frame = frame.type_name(), "Dispatching");

        match frame {
            InboundFrame::RoomJoin { room } => self.join(conn, &room).await.map(Some),

            InboundFrame::RoomLeave { room } => {
                self.rooms.leave(conn, &room).await?;
                Ok(Some(OutboundFrame::RoomLeft { room }))
            }

            InboundFrame::MessageSend {
                room,
                recipient,
                content,
                message_type,
                metadata,
            } => {
                let draft = MessageDraft {
                    room,
                    recipient,
                    message_type: message_type.unwrap_or_default(),
                    content,
                    metadata,
                    expires_at: None,
                };
                self.messages.send(conn, draft).await?;
                Ok(None)
            }

            InboundFrame::TypingStart { room } => {
                self.rooms.typing(conn, &room, true).await?;
                Ok(None)
            }

            InboundFrame::TypingStop { room } => {
                self.rooms.typing(conn, &room, false).await?;
                Ok(None)
            }

            InboundFrame::PresenceUpdate {
                status,
                status_message,
            } => {
                self.rooms
                    .update_presence(conn, status, status_message)
                    .await?;
                Ok(None)
            }

            InboundFrame::Subscribe { event_type } => {
                self.registry.subscribe_topic(conn, &event_type).await?;
                Ok(Some(OutboundFrame::Subscribed { event_type }))
            }

            InboundFrame::Unsubscribe { event_type } => {
                self.registry.unsubscribe_topic(conn, &event_type).await?;
                Ok(Some(OutboundFrame::Unsubscribed { event_type }))
            }

            InboundFrame::Ping { timestamp } => Ok(Some(OutboundFrame::Pong { timestamp })),
        }
    }

    /// Join, then build `room.joined` with history and a presence snapshot
    /// for the features the room enables.
    async fn join(&self, conn: &ConnectionHandle, room: &str) -> Result<OutboundFrame, CoreError> {
        let outcome = self.rooms.join(conn, room).await?;
        let room = outcome.room;

        let history = if room.features.history {
            let page = self
                .messages
                .history(&room.name, self.history_on_join, None)
                .await?;
            Some(page.iter().map(|m| m.view()).collect())
        } else {
            None
        };
        let presence = room
            .features
            .presence
            .then(|| self.presence.snapshot(&room.name));

        Ok(OutboundFrame::RoomJoined {
            room: room.name,
            history,
            presence,
        })
    }
}
