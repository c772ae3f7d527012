//! Wire protocol shared by the relay and its participants
//!
//! Control messages travel as WebSocket text frames holding a JSON object
//! with a `type` field. Audio travels as binary frames of raw PCM16
//! little-endian mono samples at [`TRANSPORT_SAMPLE_RATE`], with no header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::TRANSPORT_SAMPLE_RATE;

/// Lowest channel number
pub const MIN_CHANNEL: u8 = 1;
/// Highest channel number
pub const MAX_CHANNEL: u8 = 255;

/// What a participant announces itself as
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Role {
    Gateway,
    Client,
    #[default]
    Unknown,
}

impl Role {
    /// Map a role string to a role. `gw` and `pwa` are accepted as short
    /// aliases; anything unrecognized is [`Role::Unknown`].
    pub fn parse(s: &str) -> Self {
        match s {
            "gateway" | "gw" => Role::Gateway,
            "client" | "pwa" => Role::Client,
            _ => Role::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Gateway => "gateway",
            Role::Client => "client",
            Role::Unknown => "unknown",
        }
    }

    fn from_value(value: Option<&Value>) -> Self {
        value.and_then(Value::as_str).map(Role::parse).unwrap_or_default()
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Role::parse(&s))
    }
}

/// Push-to-talk transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PttState {
    Start,
    Stop,
}

/// Audio format announced alongside `ptt start`. Metadata only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            encoding: "pcm_s16le".to_string(),
            sample_rate: TRANSPORT_SAMPLE_RATE,
            channels: 1,
        }
    }
}

/// Typed control message, as produced and consumed by participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Join {
        channel: u8,
        role: Role,
    },
    Joined {
        channel: u8,
    },
    Ptt {
        state: PttState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<StreamFormat>,
    },
    Busy {
        #[serde(flatten)]
        extra: serde_json::Map<String, Value>,
    },
}

impl ControlMessage {
    pub fn join(channel: u8, role: Role) -> Self {
        ControlMessage::Join { channel, role }
    }

    pub fn ptt_start() -> Self {
        ControlMessage::Ptt {
            state: PttState::Start,
            format: Some(StreamFormat::default()),
        }
    }

    pub fn ptt_stop() -> Self {
        ControlMessage::Ptt {
            state: PttState::Stop,
            format: None,
        }
    }

    pub fn to_json(&self) -> String {
        // Plain enum of strings and integers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// What the relay should do with an inbound text message
#[derive(Debug, Clone, PartialEq)]
pub enum RelayCommand {
    /// Move the sender to `channel` with `role` and acknowledge
    Join { channel: u8, role: Role },
    /// Forward the message, exactly as received, to channel peers
    Forward(String),
}

impl RelayCommand {
    /// Classify an inbound text message. Anything that is not a JSON object
    /// with a recognized `type` yields `None` and is dropped by the caller.
    ///
    /// `ptt` and `busy` are forwarded as the text the sender wrote, so
    /// fields the relay does not understand survive along with key order.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let object = value.as_object()?;

        match object.get("type").and_then(Value::as_str)? {
            "join" => Some(RelayCommand::Join {
                channel: coerce_channel(object.get("channel")),
                role: Role::from_value(object.get("role")),
            }),
            "ptt" | "busy" => Some(RelayCommand::Forward(text.to_string())),
            _ => None,
        }
    }
}

/// Build the relay's acknowledgement for a join
pub fn joined_message(channel: u8) -> String {
    ControlMessage::Joined { channel }.to_json()
}

/// Turn whatever the client sent as `channel` into a valid channel number.
///
/// Numbers truncate toward zero, numeric strings are parsed, booleans count
/// as 0/1 and everything else counts as 0. Zero maps to the default
/// channel 1, and the result is clamped to `1..=255`.
pub fn coerce_channel(value: Option<&Value>) -> u8 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        _ => 0.0,
    };
    let truncated = if raw.is_finite() { raw.trunc() } else { 0.0 };

    if truncated == 0.0 {
        return MIN_CHANNEL;
    }
    truncated.clamp(MIN_CHANNEL as f64, MAX_CHANNEL as f64) as u8
}

/// Encode PCM16 samples as a little-endian binary frame, reusing `out`
pub fn encode_frame_into(samples: &[i16], out: &mut BytesMut) {
    out.clear();
    out.reserve(samples.len() * 2);
    for &sample in samples {
        out.put_i16_le(sample);
    }
}

/// Encode PCM16 samples as a fresh binary frame
pub fn encode_frame(samples: &[i16]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    encode_frame_into(samples, &mut out);
    out.freeze()
}

/// Iterate the samples of a binary frame. A trailing odd byte is ignored.
pub fn decode_frame(mut frame: &[u8]) -> impl Iterator<Item = i16> + '_ {
    std::iter::from_fn(move || {
        if frame.remaining() >= 2 {
            Some(frame.get_i16_le())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn join_channel(channel: Value) -> u8 {
        let text = json!({"type": "join", "channel": channel, "role": "client"}).to_string();
        match RelayCommand::parse(&text) {
            Some(RelayCommand::Join { channel, .. }) => channel,
            other => panic!("expected join, got {:?}", other),
        }
    }

    #[test]
    fn test_join_channel_coercion() {
        assert_eq!(join_channel(json!(5)), 5);
        assert_eq!(join_channel(json!(0)), 1);
        assert_eq!(join_channel(json!(-4)), 1);
        assert_eq!(join_channel(json!(300)), 255);
        assert_eq!(join_channel(json!("abc")), 1);
        assert_eq!(join_channel(json!("42")), 42);
        assert_eq!(join_channel(json!(7.9)), 7);
        assert_eq!(join_channel(json!(null)), 1);
        assert_eq!(join_channel(json!([3])), 1);
    }

    #[test]
    fn test_missing_channel_defaults() {
        let cmd = RelayCommand::parse(r#"{"type":"join"}"#);
        assert_eq!(
            cmd,
            Some(RelayCommand::Join {
                channel: 1,
                role: Role::Unknown
            })
        );
    }

    #[test]
    fn test_role_aliases() {
        assert_eq!(Role::parse("gw"), Role::Gateway);
        assert_eq!(Role::parse("gateway"), Role::Gateway);
        assert_eq!(Role::parse("pwa"), Role::Client);
        assert_eq!(Role::parse("client"), Role::Client);
        assert_eq!(Role::parse("admin"), Role::Unknown);

        let cmd = RelayCommand::parse(r#"{"type":"join","channel":2,"role":42}"#);
        assert_eq!(
            cmd,
            Some(RelayCommand::Join {
                channel: 2,
                role: Role::Unknown
            })
        );
    }

    #[test]
    fn test_forward_is_verbatim() {
        for text in [
            r#"{"type":"busy","until":12,"by":"gateway-3"}"#,
            r#"{"type":"ptt","state":"start","seq":9,"format":{"sampleRate":16000,"encoding":"pcm_s16le","channels":1}}"#,
            r#"{ "state": "stop", "type": "ptt" }"#,
        ] {
            assert_eq!(
                RelayCommand::parse(text),
                Some(RelayCommand::Forward(text.to_string()))
            );
        }
    }

    #[test]
    fn test_unrecognized_messages_are_dropped() {
        assert_eq!(RelayCommand::parse("not json"), None);
        assert_eq!(RelayCommand::parse("[1,2,3]"), None);
        assert_eq!(RelayCommand::parse(r#"{"type":"joined","channel":3}"#), None);
        assert_eq!(RelayCommand::parse(r#"{"type":"chat"}"#), None);
        assert_eq!(RelayCommand::parse(r#"{"channel":3}"#), None);
    }

    #[test]
    fn test_control_message_json() {
        let start = ControlMessage::ptt_start().to_json();
        let value: Value = serde_json::from_str(&start).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "ptt",
                "state": "start",
                "format": {"encoding": "pcm_s16le", "sampleRate": 16000, "channels": 1}
            })
        );

        let stop = ControlMessage::ptt_stop().to_json();
        assert_eq!(stop, r#"{"type":"ptt","state":"stop"}"#);

        assert_eq!(joined_message(9), r#"{"type":"joined","channel":9}"#);
        assert_eq!(
            ControlMessage::from_json(r#"{"type":"joined","channel":9}"#),
            Some(ControlMessage::Joined { channel: 9 })
        );
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&[1, -1, i16::MAX, i16::MIN]);
        assert_eq!(&frame[..], &[0x01, 0x00, 0xff, 0xff, 0xff, 0x7f, 0x00, 0x80]);

        let decoded: Vec<i16> = decode_frame(&[0x01, 0x00, 0xff, 0xff, 0x07]).collect();
        assert_eq!(decoded, vec![1, -1]);
    }

    proptest! {
        #[test]
        fn prop_valid_channels_are_kept(c in 1u8..=255) {
            prop_assert_eq!(join_channel(json!(c)), c);
        }

        #[test]
        fn prop_channel_always_in_range(c in any::<i64>()) {
            let channel = join_channel(json!(c));
            prop_assert!(channel >= MIN_CHANNEL);
            if c > 255 {
                prop_assert_eq!(channel, MAX_CHANNEL);
            }
            if c <= 0 {
                prop_assert_eq!(channel, MIN_CHANNEL);
            }
        }
    }
}
