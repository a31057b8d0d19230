use std::sync::Arc;

use actix::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};

use crate::{
    allocation::BandwidthStatus,
    connection::ConnectionId,
    probe::{ProbeReport, ProbeResult},
};

/// Messages a client sends over its signaling socket, tagged by `event`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ReceivedMessage {
    Ping,
    #[serde(rename_all = "camelCase")]
    RegisterStreamer {
        #[serde(default)]
        stream_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        quality: Option<String>,
        #[serde(default)]
        resolution: Option<String>,
        #[serde(default)]
        frame_rate: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    RegisterViewer { stream_id: String },
    // SDP and ICE payloads are relayed verbatim.
    #[serde(rename_all = "camelCase")]
    Offer {
        to: ConnectionId,
        offer: Value,
        #[serde(default)]
        stream_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Answer { to: ConnectionId, answer: Value },
    #[serde(rename_all = "camelCase")]
    IceCandidate { to: ConnectionId, candidate: Value },
    #[serde(rename_all = "camelCase")]
    StatsUpdate {
        #[serde(default)]
        role: Option<Role>,
        #[serde(flatten)]
        stats: Map<String, Value>,
    },
    BandwidthTestStart,
    #[serde(rename_all = "camelCase")]
    BandwidthTestUpload { size: u64 },
    BandwidthTestDownloadRequest,
    BandwidthTestComplete(ProbeReport),
    BandwidthStatusRequest,
}

/// Messages pushed to a client.
#[derive(Serialize, Message, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
#[rtype(result = "()")]
pub enum SendingMessage {
    Pong,
    #[serde(rename = "registered", rename_all = "camelCase")]
    StreamerRegistered {
        stream_id: String,
        #[serde(rename = "viewerURL")]
        viewer_url: String,
        allocated_bitrate: u64,
    },
    #[serde(rename = "registered", rename_all = "camelCase")]
    ViewerRegistered {
        stream_id: String,
        streamer_socket_id: ConnectionId,
    },
    #[serde(rename_all = "camelCase")]
    BandwidthInsufficient {
        required: f64,
        available: f64,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Error { message: String },
    #[serde(rename_all = "camelCase")]
    Offer {
        from: ConnectionId,
        offer: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Answer { from: ConnectionId, answer: Value },
    #[serde(rename_all = "camelCase")]
    IceCandidate { from: ConnectionId, candidate: Value },
    #[serde(rename_all = "camelCase")]
    NetworkUsage {
        total_bitrate: f64,
        stream_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    BandwidthTestDownloadChunk { size: usize, chunk: Arc<str> },
    BandwidthTestResult(ProbeResult),
    #[serde(rename_all = "camelCase")]
    BandwidthReallocated {
        new_bitrate: u64,
        reason: ReallocationReason,
        active_streamers: usize,
    },
    BandwidthStatus(BandwidthStatus),
    #[serde(rename_all = "camelCase")]
    StreamsUpdated { streams: Vec<StreamInfo> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ReallocationReason {
    StreamerJoined,
    StreamerLeft,
    CapacityUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Streamer,
    Viewer,
}

/// Registry entry of a published stream, as shown to every client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub id: String,
    pub name: String,
    pub socket_id: ConnectionId,
    pub quality: String,
    pub status: String,
    pub viewers: u32,
    pub created_at: DateTime<Utc>,
    pub stats: Map<String, Value>,
}

impl StreamInfo {
    pub fn bitrate(&self) -> f64 {
        self.stats
            .get("bitrate")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_register_streamer() {
        let text = r#"{"event":"register-streamer","streamId":"cam-1","quality":"1080p30","frameRate":30}"#;
        let message: ReceivedMessage = serde_json::from_str(text).unwrap();
        assert_eq!(
            message,
            ReceivedMessage::RegisterStreamer {
                stream_id: Some("cam-1".to_string()),
                name: None,
                quality: Some("1080p30".to_string()),
                resolution: None,
                frame_rate: Some(30),
            }
        );
    }

    #[test]
    fn test_parse_stats_update_keeps_extra_keys() {
        let text = r#"{"event":"stats-update","role":"streamer","bitrate":2500,"fps":30}"#;
        let message: ReceivedMessage = serde_json::from_str(text).unwrap();
        match message {
            ReceivedMessage::StatsUpdate { role, stats } => {
                assert_eq!(role, Some(Role::Streamer));
                assert_eq!(stats.get("bitrate"), Some(&json!(2500)));
                assert_eq!(stats.get("fps"), Some(&json!(30)));
                assert!(!stats.contains_key("event"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_bandwidth_test_complete() {
        let text = r#"{"event":"bandwidth-test-complete","uploadBytes":10,"downloadBytes":20,"duration":5000}"#;
        let message: ReceivedMessage = serde_json::from_str(text).unwrap();
        assert_eq!(
            message,
            ReceivedMessage::BandwidthTestComplete(ProbeReport {
                upload_bytes: 10,
                download_bytes: 20,
                duration: 5000,
            })
        );
    }

    #[test]
    fn test_malformed_message_is_rejected() {
        assert!(serde_json::from_str::<ReceivedMessage>(r#"{"event":"offer","offer":{}}"#).is_err());
        assert!(serde_json::from_str::<ReceivedMessage>(r#"{"event":"teleport"}"#).is_err());
    }

    #[test]
    fn test_serialize_registered_streamer() {
        let message = SendingMessage::StreamerRegistered {
            stream_id: "cam-1".to_string(),
            viewer_url: "http://host:3000/viewer?stream=cam-1".to_string(),
            allocated_bitrate: 8_000_000,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "event": "registered",
                "streamId": "cam-1",
                "viewerURL": "http://host:3000/viewer?stream=cam-1",
                "allocatedBitrate": 8_000_000
            })
        );
    }

    #[test]
    fn test_serialize_reallocated() {
        let message = SendingMessage::BandwidthReallocated {
            new_bitrate: 4_000_000,
            reason: ReallocationReason::StreamerJoined,
            active_streamers: 2,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "event": "bandwidth-reallocated",
                "newBitrate": 4_000_000,
                "reason": "streamer-joined",
                "activeStreamers": 2
            })
        );
        assert_eq!(ReallocationReason::CapacityUpdated.to_string(), "capacity-updated");
        assert_eq!(
            "streamer-left".parse::<ReallocationReason>().unwrap(),
            ReallocationReason::StreamerLeft
        );
        assert_eq!("viewer".parse::<Role>().unwrap(), Role::Viewer);
    }

    #[test]
    fn test_serialize_relayed_offer_annotates_sender() {
        let message = SendingMessage::Offer {
            from: ConnectionId::from("a"),
            offer: json!({"type": "offer", "sdp": "v=0"}),
            stream_id: None,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"event": "offer", "from": "a", "offer": {"type": "offer", "sdp": "v=0"}})
        );
    }
}
