//! Dispatch of inbound messages.
//!
//! | inbound     | action                                        |
//! |-------------|-----------------------------------------------|
//! | heartbeat   | reply `heartbeat_response` "pong"             |
//! | command     | ping/status reply as `command_response`       |
//! | data        | queue in the inbox for the workload           |
//! | anything    | logged and dropped                            |

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::bridge::protocol::{
    Command, CommandReply, HEARTBEAT_REPLY, Message, MessageType,
};
use crate::channel::ChannelSender;
use crate::inbox::Inbox;
use crate::limits::ResourceLimits;

#[derive(Clone)]
pub struct Router {
    link: ChannelSender,
    inbox: Arc<Inbox>,
    limits: Arc<ResourceLimits>,
}

impl Router {
    pub fn new(link: ChannelSender, inbox: Arc<Inbox>, limits: Arc<ResourceLimits>) -> Self {
        Self {
            link,
            inbox,
            limits,
        }
    }

    /// Handle one inbound message. Never fails; problems are logged.
    pub async fn dispatch(&self, message: Message) {
        let kind = message.kind().clone();
        tracing::debug!(message_id = message.id(), message_type = %kind, "Dispatching message");

        match kind {
            MessageType::Heartbeat => {
                self.reply(MessageType::HeartbeatResponse, &HEARTBEAT_REPLY)
                    .await
            }
            MessageType::Command => self.handle_command(message.payload()).await,
            MessageType::Data => self.inbox.push(message),
            other => tracing::warn!(message_type = %other, "Unknown message type"),
        }
    }

    async fn handle_command(&self, payload: &Value) {
        match Command::from_payload(payload) {
            Some(Command::Ping) => {
                self.reply(MessageType::CommandResponse, &CommandReply::pong())
                    .await
            }
            Some(Command::Status) => {
                let reply = CommandReply::status((*self.limits).clone(), self.inbox.len());
                self.reply(MessageType::CommandResponse, &reply).await
            }
            Some(Command::Unknown(command)) => {
                tracing::warn!(command = ?command, "Unknown command type");
            }
            None => tracing::warn!(payload = %payload, "Invalid command format"),
        }
    }

    async fn reply<T: Serialize>(&self, kind: MessageType, payload: &T) {
        if !self.link.send_json(kind.clone(), payload).await {
            tracing::warn!(message_type = %kind, "Failed to send reply");
        }
    }
}
