//! WebSocket messaging gateway.
//!
//! A connection only reaches this module after its credential was accepted
//! during the upgrade, so every [`Session`] is authenticated from birth. The
//! session then joins project rooms and submits messages; each submission is
//! persisted before it is fanned out to the room.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::{Message as WsMessage, WebSocket};

use crate::config::RoomAccess;
use crate::error::{ErrorBody, GatewayError, MembershipError, StoreError};
use crate::identity::UserIdentity;
use crate::locks::KeyedLocks;
use crate::membership::MembershipAuthority;
use crate::messages::{ClientMessage, ServerMessage};
use crate::models::Message;
use crate::registry::RoomRegistry;
use crate::store::MessageStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: String,
    pub identity: UserIdentity,
}

pub struct Gateway {
    registry: Arc<RoomRegistry>,
    authority: Arc<MembershipAuthority>,
    messages: Arc<dyn MessageStore>,
    // Held across persist + broadcast so a room's messages reach every
    // receiver in the order they were stored.
    room_order: KeyedLocks,
    room_access: RoomAccess,
    persist_timeout: Duration,
}

impl Gateway {
    pub fn new(
        registry: Arc<RoomRegistry>,
        authority: Arc<MembershipAuthority>,
        messages: Arc<dyn MessageStore>,
        room_access: RoomAccess,
        persist_timeout: Duration,
    ) -> Self {
        Gateway {
            registry,
            authority,
            messages,
            room_order: KeyedLocks::new(),
            room_access,
            persist_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub async fn handle_connection(self: Arc<Self>, ws: WebSocket, identity: UserIdentity) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (session, mut outbound) = self.open_session(identity).await;

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode server frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::text(text)).await {
                    warn!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) if msg.is_close() => break,
                Ok(msg) => self.handle_frame(&session, &msg).await,
                Err(e) => {
                    warn!("WebSocket error on {}: {}", session.connection_id, e);
                    break;
                }
            }
        }

        // Unregistering drops the last sender, which ends the writer.
        self.close_session(&session).await;
        if let Err(e) = writer.await {
            error!("Writer task for {} failed: {}", session.connection_id, e);
        }
    }

    /// Registers a new authenticated session and greets it.
    pub async fn open_session(
        &self,
        identity: UserIdentity,
    ) -> (Session, mpsc::UnboundedReceiver<ServerMessage>) {
        let connection_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ServerMessage::Connected {
            connection_id: connection_id.clone(),
            user_id: identity.user_id.clone(),
        });
        self.registry.register(&connection_id, tx).await;
        info!("Connection {} opened for {}", connection_id, identity.user_id);

        (
            Session {
                connection_id,
                identity,
            },
            rx,
        )
    }

    pub async fn close_session(&self, session: &Session) {
        let left = self.registry.unregister(&session.connection_id).await;
        info!(
            "Connection {} closed, left {} room(s)",
            session.connection_id,
            left.len()
        );
    }

    /// Handles one inbound WebSocket frame. Control frames are left to the
    /// transport; binary payloads are refused like any other malformed frame.
    pub async fn handle_frame(&self, session: &Session, frame: &WsMessage) {
        if let Ok(text) = frame.to_str() {
            self.handle_text(session, text).await;
        } else if frame.is_binary() {
            let e = GatewayError::Malformed("binary frames are not supported".into());
            self.report(session, &e).await;
        }
    }

    /// Handles one inbound text frame. Failures are reported to the sender
    /// as an `error` frame and never change the session.
    pub async fn handle_text(&self, session: &Session, text: &str) {
        let result = match ClientMessage::parse(text) {
            Ok(frame) => self.dispatch(session, frame).await,
            Err(e) => Err(GatewayError::Malformed(e.to_string())),
        };
        if let Err(e) = result {
            self.report(session, &e).await;
        }
    }

    async fn report(&self, session: &Session, e: &GatewayError) {
        debug!("Frame from {} rejected: {}", session.connection_id, e);
        self.reply(
            session,
            ServerMessage::Error {
                error: ErrorBody::from_error(e),
            },
        )
        .await;
    }

    async fn dispatch(&self, session: &Session, frame: ClientMessage) -> Result<(), GatewayError> {
        match frame {
            ClientMessage::JoinRoom { project_id } => {
                self.join_room(session, &project_id).await?;
                self.reply(session, ServerMessage::RoomJoined { project_id }).await;
            }
            ClientMessage::LeaveRoom { project_id } => {
                self.leave_room(session, &project_id).await;
                self.reply(session, ServerMessage::RoomLeft { project_id }).await;
            }
            ClientMessage::SendMessage {
                project_id,
                content,
            } => {
                self.send_message(session, &project_id, &content).await?;
            }
        }
        Ok(())
    }

    /// Binds the session to a project's room. Re-joining is a no-op.
    pub async fn join_room(&self, session: &Session, project_id: &str) -> Result<bool, GatewayError> {
        self.check_access(&session.identity, project_id).await?;
        let joined = self
            .registry
            .join(project_id, &session.connection_id)
            .await
            .ok_or_else(|| GatewayError::SessionClosed {
                connection_id: session.connection_id.clone(),
            })?;
        if joined {
            info!("User {} joined project {}", session.identity.user_id, project_id);
        }
        Ok(joined)
    }

    pub async fn leave_room(&self, session: &Session, project_id: &str) -> bool {
        self.registry.leave(project_id, &session.connection_id).await
    }

    /// Persists a message and then broadcasts it to the whole room,
    /// including the sender.
    pub async fn send_message(
        &self,
        session: &Session,
        project_id: &str,
        content: &str,
    ) -> Result<Message, GatewayError> {
        if content.trim().is_empty() {
            return Err(GatewayError::EmptyContent);
        }
        if !self.registry.is_joined(project_id, &session.connection_id).await {
            return Err(GatewayError::NotInRoom {
                room_id: project_id.to_string(),
            });
        }
        self.check_access(&session.identity, project_id).await?;

        let _order = self.room_order.lock(project_id).await;
        let persist = self
            .messages
            .persist_message(project_id, &session.identity.user_id, content);
        let message = match tokio::time::timeout(self.persist_timeout, persist).await {
            Ok(stored) => stored?,
            Err(_) => {
                warn!("Persisting message for project {} timed out", project_id);
                return Err(StoreError::Timeout.into());
            }
        };

        let delivered = self
            .registry
            .broadcast(
                project_id,
                &ServerMessage::MessageCreated {
                    message: message.clone(),
                },
            )
            .await;
        debug!("Message {} delivered to {} connection(s)", message.id, delivered);
        Ok(message)
    }

    /// Stored messages of a project, oldest first.
    pub async fn history(
        &self,
        identity: &UserIdentity,
        project_id: &str,
    ) -> Result<Vec<Message>, GatewayError> {
        self.check_access(identity, project_id).await?;
        Ok(self.messages.load_messages(project_id).await?)
    }

    pub async fn shutdown(&self) {
        let connections = self.registry.connection_count().await;
        self.registry.clear().await;
        info!("Gateway stopped, dropped {} connection(s)", connections);
    }

    async fn check_access(&self, identity: &UserIdentity, project_id: &str) -> Result<(), GatewayError> {
        if self.room_access == RoomAccess::Permissive {
            return Ok(());
        }
        if self.authority.is_member(project_id, &identity.user_id).await? {
            Ok(())
        } else {
            Err(MembershipError::NotAuthorized {
                project_id: project_id.to_string(),
                user_id: identity.user_id.clone(),
            }
            .into())
        }
    }

    async fn reply(&self, session: &Session, message: ServerMessage) {
        if !self.registry.send_to(&session.connection_id, message).await {
            debug!("Connection {} is gone, reply dropped", session.connection_id);
        }
    }
}
