//! Publish/subscribe broker.
//!
//! Each connection owns one outbound queue that carries both its replies
//! and its pub/sub messages. Acknowledging a subscription and publishing
//! happen under the same lock, so a subscriber always receives its
//! acknowledgement before any message published after it.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{Outcome, RequestId, ServerFrame};

/// Server-assigned connection identifier.
pub type ConnId = u64;

/// Outbound frame queue of one connection.
pub type Outbox = mpsc::UnboundedSender<ServerFrame>;

#[derive(Default)]
pub struct Broker {
    channels: Mutex<HashMap<String, Vec<(ConnId, Outbox)>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` on `channel` and queue the acknowledgement for
    /// request `id`. Subscribing twice is acknowledged but not duplicated.
    pub fn subscribe(&self, channel: &str, conn: ConnId, outbox: &Outbox, id: RequestId) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let subscribers = channels.entry(channel.to_string()).or_default();
        if !subscribers.iter().any(|(c, _)| *c == conn) {
            subscribers.push((conn, outbox.clone()));
        }
        let _ = outbox.send(ServerFrame::Reply {
            id,
            outcome: Outcome::Subscribed {
                channel: channel.to_string(),
            },
        });
        debug!(%channel, conn, "subscribed");
    }

    pub fn unsubscribe(&self, channel: &str, conn: ConnId) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|(c, _)| *c != conn);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
        debug!(%channel, conn, "unsubscribed");
    }

    /// Deliver a message to every subscriber of `channel`. Returns the
    /// number of connections reached.
    pub fn publish(&self, channel: &str, tag: &str, value: &[u8]) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = channels.get_mut(channel) else {
            return 0;
        };
        // Closed outboxes belong to connections that already went away.
        subscribers.retain(|(_, outbox)| {
            outbox
                .send(ServerFrame::Message {
                    channel: channel.to_string(),
                    tag: tag.to_string(),
                    value: value.to_vec(),
                })
                .is_ok()
        });
        let reached = subscribers.len();
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        debug!(%channel, %tag, reached, "published");
        reached
    }

    /// Drop every subscription of a closed connection.
    pub fn remove_connection(&self, conn: ConnId) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|_, subscribers| {
            subscribers.retain(|(c, _)| *c != conn);
            !subscribers.is_empty()
        });
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(channel).map_or(0, Vec::len)
    }
}
