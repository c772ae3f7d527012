//! Participant side of the relay connection

pub mod client;

pub use client::{ClientEvent, ClientSession};

use crate::protocol::ControlMessage;

/// Everything a participant sends, in one ordered queue.
///
/// Control messages and audio frames share the queue so a `ptt start`
/// always reaches the relay before the first frame it announces, and a
/// `ptt stop` after the last one.
#[derive(Debug)]
pub enum Outgoing {
    Control(ControlMessage),
    /// Transport-rate PCM16 samples, in a buffer borrowed from the frame pool
    Frame(Vec<i16>),
    /// Flush what is queued ahead, then close the socket
    Close,
}
