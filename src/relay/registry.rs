//! Connection registry and channel fan-out
//!
//! Every open connection has an entry holding its channel membership and
//! the sending half of its outbound queue. The registry is entirely
//! in-memory; a disconnect forgets the participant immediately.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::protocol::{joined_message, RelayCommand, Role, MIN_CHANNEL};

/// Identifies one connection for its lifetime
pub type ConnectionId = Uuid;

/// A message queued for delivery to one connection
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
}

/// Channel and role of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub channel: u8,
    pub role: Role,
}

impl Default for Membership {
    fn default() -> Self {
        Self {
            channel: MIN_CHANNEL,
            role: Role::Unknown,
        }
    }
}

/// Why a message did not reach a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The peer's outbound queue is saturated
    QueueFull,
    /// The peer's writer has gone away
    Disconnected,
}

/// Outcome of delivering one message to one peer
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub peer: ConnectionId,
    pub result: Result<(), DeliveryError>,
}

/// What the relay did with an inbound text message
#[derive(Debug, Clone, PartialEq)]
pub enum TextOutcome {
    /// Sender moved to this channel and was acknowledged
    Joined(u8),
    /// Forwarded to channel peers
    Forwarded(Vec<Delivery>),
    /// Not a message the relay acts on
    Ignored,
}

struct Participant {
    membership: Membership,
    tx: mpsc::Sender<Outbound>,
}

/// Shared relay state: one registry for all connection handlers
pub struct RelayState {
    connections: DashMap<ConnectionId, Participant>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Register a new connection on the default channel
    pub fn connect(&self, tx: mpsc::Sender<Outbound>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            Participant {
                membership: Membership::default(),
                tx,
            },
        );
        tracing::info!("Connection {} registered ({} open)", id, self.connections.len());
        id
    }

    /// Forget a connection
    pub fn disconnect(&self, id: ConnectionId) -> Option<Membership> {
        let removed = self.connections.remove(&id).map(|(_, p)| p.membership);
        if let Some(membership) = removed {
            tracing::info!(
                "Connection {} left channel {} ({} open)",
                id,
                membership.channel,
                self.connections.len()
            );
        }
        removed
    }

    pub fn membership(&self, id: ConnectionId) -> Option<Membership> {
        self.connections.get(&id).map(|p| p.membership)
    }

    /// Move a connection to `channel` and acknowledge to it alone
    pub fn join(&self, id: ConnectionId, channel: u8, role: Role) -> Option<u8> {
        let tx = {
            let mut participant = self.connections.get_mut(&id)?;
            participant.membership = Membership { channel, role };
            participant.tx.clone()
        };

        tracing::info!("Connection {} joined channel {} as {}", id, channel, role);

        if tx.try_send(Outbound::Text(joined_message(channel))).is_err() {
            tracing::debug!("Could not queue join acknowledgement for {}", id);
        }
        Some(channel)
    }

    /// Handle a text frame from `from`
    pub fn handle_text(&self, from: ConnectionId, text: &str) -> TextOutcome {
        match RelayCommand::parse(text) {
            Some(RelayCommand::Join { channel, role }) => match self.join(from, channel, role) {
                Some(channel) => TextOutcome::Joined(channel),
                None => TextOutcome::Ignored,
            },
            Some(RelayCommand::Forward(message)) => {
                TextOutcome::Forwarded(self.fan_out(from, Outbound::Text(message)))
            }
            None => {
                tracing::debug!("Ignoring control message from {}", from);
                TextOutcome::Ignored
            }
        }
    }

    /// Handle a binary audio frame from `from`; bytes are forwarded as-is
    pub fn handle_binary(&self, from: ConnectionId, frame: Bytes) -> Vec<Delivery> {
        self.fan_out(from, Outbound::Binary(frame))
    }

    /// Queue `message` for every other connection on the sender's channel.
    ///
    /// Never waits on a peer: a saturated or closed queue is reported in
    /// that peer's [`Delivery`] and the rest still receive the message.
    pub fn fan_out(&self, from: ConnectionId, message: Outbound) -> Vec<Delivery> {
        let channel = self
            .membership(from)
            .map(|m| m.channel)
            .unwrap_or(MIN_CHANNEL);

        let mut deliveries = Vec::new();
        for entry in self.connections.iter() {
            if *entry.key() == from || entry.membership.channel != channel {
                continue;
            }

            let result = entry.tx.try_send(message.clone()).map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::QueueFull,
                TrySendError::Closed(_) => DeliveryError::Disconnected,
            });
            if let Err(e) = result {
                tracing::debug!("Dropped message for {} on channel {}: {:?}", entry.key(), channel, e);
            }

            deliveries.push(Delivery {
                peer: *entry.key(),
                result,
            });
        }
        deliveries
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections on each occupied channel
    pub fn channel_counts(&self) -> BTreeMap<u8, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.connections.iter() {
            *counts.entry(entry.membership.channel).or_insert(0) += 1;
        }
        counts
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}
