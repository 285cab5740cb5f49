//! JSON control messages exchanged on the WebSocket text channel.
//!
//! Binary messages carry frames; everything else is one of these,
//! internally tagged by `"type"`. Times are seconds since the Unix epoch
//! as floats so browser clients can echo them back unchanged.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Sent once when a session opens.
    Config {
        server_time: f64,
        server_ip: String,
        #[serde(default)]
        width: u32,
        #[serde(default)]
        height: u32,
        #[serde(default)]
        stereo: bool,
    },
    Ping {
        sent_time: f64,
    },
    /// Echo of a [`Ping`](Self::Ping) with `sent_time` unchanged.
    Pong {
        sent_time: f64,
    },
    QualityRequest {
        preset: String,
    },
}

impl ControlMessage {
    pub fn ping_now() -> Self {
        Self::Ping {
            sent_time: unix_seconds(),
        }
    }

    /// Parse a text message. Malformed or unknown messages yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn to_json(&self) -> String {
        // Infallible: no maps, and non-finite floats serialize as null.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Current wall-clock time in seconds.
pub fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One-way latency in milliseconds estimated from an echoed ping.
pub fn latency_ms(sent_time: f64, now: f64) -> f64 {
    ((now - sent_time) * 1000.0 / 2.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_wire_format() {
        let json = ControlMessage::Ping { sent_time: 12.5 }.to_json();
        assert_eq!(json, r#"{"type":"ping","sent_time":12.5}"#);

        let json = ControlMessage::QualityRequest {
            preset: "balanced".into(),
        }
        .to_json();
        assert_eq!(json, r#"{"type":"quality_request","preset":"balanced"}"#);
    }

    #[test]
    fn parses_client_messages() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"pong","sent_time":1700000000.25}"#),
            Some(ControlMessage::Pong {
                sent_time: 1_700_000_000.25
            })
        );
        assert_eq!(
            ControlMessage::parse(r#"{"preset":"quality","type":"quality_request"}"#),
            Some(ControlMessage::QualityRequest {
                preset: "quality".into()
            })
        );
    }

    #[test]
    fn config_tolerates_missing_stream_fields() {
        let msg = ControlMessage::parse(r#"{"type":"config","server_time":1.0,"server_ip":"10.0.0.2"}"#);
        assert_eq!(
            msg,
            Some(ControlMessage::Config {
                server_time: 1.0,
                server_ip: "10.0.0.2".into(),
                width: 0,
                height: 0,
                stereo: false,
            })
        );
    }

    #[test]
    fn ignores_garbage() {
        assert_eq!(ControlMessage::parse("not json"), None);
        assert_eq!(ControlMessage::parse(r#"{"type":"reboot"}"#), None);
        assert_eq!(ControlMessage::parse(r#"{"type":"pong"}"#), None);
    }

    #[test]
    fn latency_is_half_round_trip() {
        assert!((latency_ms(10.0, 10.04) - 20.0).abs() < 1e-6);
        assert_eq!(latency_ms(10.0, 9.0), 0.0);
    }
}
