//! Channel relay: membership tracking and fan-out within a channel

pub mod registry;

pub use registry::{
    ConnectionId, Delivery, DeliveryError, Membership, Outbound, RelayState, TextOutcome,
};
