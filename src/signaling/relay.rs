use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    allocation::{AllocationEngine, Allocations, BandwidthStatus},
    config::Config,
    connection::ConnectionId,
    error::{AllocationErrorKind, Error, ErrorKind, SignalingErrorKind},
    probe::{ProbeReport, ProbeResult, ProbeTracker},
    tier::QualityTierCatalog,
};

use super::message::{ReallocationReason, ReceivedMessage, Role, SendingMessage, StreamInfo};

/// Something the owner of a [`SignalingRelay`] has to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(ConnectionId, SendingMessage),
    Broadcast(SendingMessage),
    /// Call [`SignalingRelay::probe_deadline`] for this probe once `after` has elapsed.
    ScheduleProbeDeadline {
        connection: ConnectionId,
        probe_id: Uuid,
        after: Duration,
    },
}

#[derive(Debug, Default, Clone)]
struct Connection {
    role: Option<Role>,
    stream_id: Option<String>,
}

/// Routes signaling between connections and keeps the stream registry and the
/// [`AllocationEngine`] in step with streamer joins and leaves.
///
/// It does no I/O; every call returns the [`Effect`]s to perform. Calls must be serialized by
/// the owner, which makes each admission a single check, insert and reallocate step.
#[derive(Debug)]
pub struct SignalingRelay {
    config: Arc<Config>,
    engine: AllocationEngine,
    probes: ProbeTracker,
    connections: HashMap<ConnectionId, Connection>,
    streams: BTreeMap<String, StreamInfo>,
    padding: Arc<str>,
}

impl SignalingRelay {
    pub fn new(config: Arc<Config>) -> Result<Self, Error> {
        let catalog = QualityTierCatalog::new(config.video.presets.values().cloned())?;
        let padding: Arc<str> = "0".repeat(config.probe.chunk_size).into();
        Ok(Self {
            engine: AllocationEngine::new(Arc::new(catalog)),
            probes: ProbeTracker::new(config.probe.clone()),
            connections: HashMap::new(),
            streams: BTreeMap::new(),
            padding,
            config,
        })
    }

    pub fn engine(&self) -> &AllocationEngine {
        &self.engine
    }

    pub fn status(&self) -> BandwidthStatus {
        self.engine.status()
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        self.streams.values().cloned().collect()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connect(&mut self, connection: ConnectionId) {
        tracing::info!("Client connected: {}", connection);
        self.connections.insert(connection, Connection::default());
    }

    pub fn handle(
        &mut self,
        connection: &ConnectionId,
        message: ReceivedMessage,
        now: Instant,
    ) -> Vec<Effect> {
        if !self.connections.contains_key(connection) {
            tracing::warn!("Dropping message from unknown connection {}", connection);
            return Vec::new();
        }

        match message {
            ReceivedMessage::Ping => vec![Effect::Send(connection.clone(), SendingMessage::Pong)],
            ReceivedMessage::RegisterStreamer {
                stream_id,
                name,
                quality,
                resolution,
                frame_rate,
            } => self.register_streamer(connection, stream_id, name, quality, resolution, frame_rate),
            ReceivedMessage::RegisterViewer { stream_id } => {
                self.register_viewer(connection, stream_id)
            }
            ReceivedMessage::Offer {
                to,
                offer,
                stream_id,
            } => {
                tracing::debug!("Forwarding offer from {} to {}", connection, to);
                self.relay(
                    to,
                    SendingMessage::Offer {
                        from: connection.clone(),
                        offer,
                        stream_id,
                    },
                )
            }
            ReceivedMessage::Answer { to, answer } => {
                tracing::debug!("Forwarding answer from {} to {}", connection, to);
                self.relay(
                    to,
                    SendingMessage::Answer {
                        from: connection.clone(),
                        answer,
                    },
                )
            }
            ReceivedMessage::IceCandidate { to, candidate } => self.relay(
                to,
                SendingMessage::IceCandidate {
                    from: connection.clone(),
                    candidate,
                },
            ),
            ReceivedMessage::StatsUpdate { role: _, stats } => self.update_stats(connection, stats),
            ReceivedMessage::BandwidthTestStart => match self.probes.start(connection, now) {
                Ok(probe_id) => vec![Effect::ScheduleProbeDeadline {
                    connection: connection.clone(),
                    probe_id,
                    after: self.config.probe.deadline(),
                }],
                Err(err) => vec![Self::error(connection, &err)],
            },
            ReceivedMessage::BandwidthTestUpload { size } => {
                if let Err(err) = self.probes.record_upload(connection, size) {
                    tracing::debug!("{}", err);
                }
                Vec::new()
            }
            ReceivedMessage::BandwidthTestDownloadRequest => {
                match self.probes.record_download(connection) {
                    Ok(size) => vec![Effect::Send(
                        connection.clone(),
                        SendingMessage::BandwidthTestDownloadChunk {
                            size,
                            chunk: self.padding.clone(),
                        },
                    )],
                    Err(err) => {
                        tracing::debug!("{}", err);
                        Vec::new()
                    }
                }
            }
            ReceivedMessage::BandwidthTestComplete(report) => self.complete_probe(connection, report),
            ReceivedMessage::BandwidthStatusRequest => vec![Effect::Send(
                connection.clone(),
                SendingMessage::BandwidthStatus(self.engine.status()),
            )],
        }
    }

    pub fn disconnect(&mut self, connection: &ConnectionId) -> Vec<Effect> {
        tracing::info!("Client disconnected: {}", connection);
        self.probes.cancel(connection);
        let Some(state) = self.connections.remove(connection) else {
            return Vec::new();
        };
        let Some(stream_id) = state.stream_id else {
            return Vec::new();
        };

        match state.role {
            Some(Role::Streamer) => self.remove_stream(connection, &stream_id),
            Some(Role::Viewer) => match self.streams.get_mut(&stream_id) {
                Some(stream) => {
                    stream.viewers = stream.viewers.saturating_sub(1);
                    vec![self.streams_updated()]
                }
                None => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// Force completes a probe that outlived its deadline. Falls back to the configured
    /// capacity when the probe counted no data at all.
    pub fn probe_deadline(
        &mut self,
        connection: &ConnectionId,
        probe_id: Uuid,
        now: Instant,
    ) -> Vec<Effect> {
        match self.probes.expire(connection, probe_id, now) {
            None => Vec::new(),
            Some(Ok(result)) => self.apply_probe_result(connection, result),
            Some(Err(err)) => {
                let fallback = self.config.probe.fallback_capacity_mbps;
                tracing::warn!("{}, assuming {:.2} Mbps", err, fallback);
                self.apply_probe_result(connection, ProbeResult::assumed(fallback))
            }
        }
    }

    /// Drops every stream, connection and probe and zeroes the capacity.
    pub fn reset(&mut self) {
        self.engine.reset();
        self.probes.reset();
        self.connections.clear();
        self.streams.clear();
    }

    fn register_streamer(
        &mut self,
        connection: &ConnectionId,
        stream_id: Option<String>,
        name: Option<String>,
        quality: Option<String>,
        resolution: Option<String>,
        frame_rate: Option<u32>,
    ) -> Vec<Effect> {
        let stream_id =
            stream_id.unwrap_or_else(|| format!("stream-{}", Utc::now().timestamp_millis()));
        let tier_id = quality.unwrap_or_else(|| self.config.video.default_preset.clone());

        let mut effects = Vec::new();
        let previous_stream = self
            .connections
            .get(connection)
            .filter(|c| c.role == Some(Role::Streamer))
            .and_then(|c| c.stream_id.clone())
            .filter(|id| *id != stream_id);
        if let Some(previous_stream) = previous_stream {
            effects.extend(self.remove_stream(connection, &previous_stream));
        }

        let previous = self.engine.allocations();
        let admission = match self.engine.try_admit(&stream_id, &tier_id, connection.clone()) {
            Ok(admission) => admission,
            Err(err) => {
                effects.push(Self::rejection(connection, &err));
                return effects;
            }
        };

        let name = name.unwrap_or_else(|| format!("Camera {}", self.streams.len() + 1));
        let mut stats = Map::new();
        stats.insert("bitrate".to_string(), Value::from(0));
        stats.insert("fps".to_string(), Value::from(frame_rate.unwrap_or(0)));
        stats.insert(
            "resolution".to_string(),
            Value::from(resolution.unwrap_or_else(|| "unknown".to_string())),
        );
        tracing::info!("Streamer registered: {} ({}) at {}", name, stream_id, tier_id);
        self.streams.insert(
            stream_id.clone(),
            StreamInfo {
                id: stream_id.clone(),
                name,
                socket_id: connection.clone(),
                quality: tier_id,
                status: "active".to_string(),
                viewers: 0,
                created_at: Utc::now(),
                stats,
            },
        );
        if let Some(state) = self.connections.get_mut(connection) {
            state.role = Some(Role::Streamer);
            state.stream_id = Some(stream_id.clone());
        }

        effects.push(Effect::Send(
            connection.clone(),
            SendingMessage::StreamerRegistered {
                viewer_url: format!(
                    "{}/viewer?stream={}",
                    self.config.server.server_url(),
                    stream_id
                ),
                stream_id: stream_id.clone(),
                allocated_bitrate: admission.allocated_bitrate,
            },
        ));
        effects.extend(self.reallocation_notices(
            &previous,
            &admission.allocations,
            ReallocationReason::StreamerJoined,
            Some(&stream_id),
        ));
        effects.push(self.bandwidth_status());
        effects.push(self.streams_updated());
        effects
    }

    fn register_viewer(&mut self, connection: &ConnectionId, stream_id: String) -> Vec<Effect> {
        if let Some(state) = self.connections.get_mut(connection) {
            state.role = Some(Role::Viewer);
            state.stream_id = Some(stream_id.clone());
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            let err = Error::new_signaling(
                "Stream not found".to_string(),
                SignalingErrorKind::StreamNotFoundError,
            );
            return vec![Self::error(connection, &err)];
        };
        stream.viewers += 1;
        tracing::info!("Viewer {} connected to {} ({})", connection, stream.name, stream_id);

        let streamer = stream.socket_id.clone();
        let reply = if self.connections.contains_key(&streamer) {
            Effect::Send(
                connection.clone(),
                SendingMessage::ViewerRegistered {
                    stream_id,
                    streamer_socket_id: streamer,
                },
            )
        } else {
            let err = Error::new_signaling(
                "Streamer not found".to_string(),
                SignalingErrorKind::StreamerNotFoundError,
            );
            Self::error(connection, &err)
        };
        vec![reply, self.streams_updated()]
    }

    fn relay(&self, to: ConnectionId, message: SendingMessage) -> Vec<Effect> {
        if !self.connections.contains_key(&to) {
            tracing::warn!("Cannot relay to {}, not connected", to);
            return Vec::new();
        }
        vec![Effect::Send(to, message)]
    }

    fn update_stats(&mut self, connection: &ConnectionId, stats: Map<String, Value>) -> Vec<Effect> {
        let Some(stream_id) = self
            .connections
            .get(connection)
            .filter(|c| c.role == Some(Role::Streamer))
            .and_then(|c| c.stream_id.clone())
        else {
            let err = Error::new_signaling(
                "Stats update from a connection that is not streaming".to_string(),
                SignalingErrorKind::NotRegisteredError,
            );
            return vec![Self::error(connection, &err)];
        };
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Vec::new();
        };
        stream.stats.extend(stats);

        let total_bitrate = self.streams.values().map(StreamInfo::bitrate).sum::<f64>();
        vec![
            Effect::Broadcast(SendingMessage::NetworkUsage {
                total_bitrate,
                stream_count: self.streams.len(),
            }),
            self.streams_updated(),
        ]
    }

    fn complete_probe(&mut self, connection: &ConnectionId, report: ProbeReport) -> Vec<Effect> {
        match self.probes.complete(connection, report) {
            Ok(result) => self.apply_probe_result(connection, result),
            Err(err) => vec![Self::error(connection, &err)],
        }
    }

    fn apply_probe_result(&mut self, connection: &ConnectionId, result: ProbeResult) -> Vec<Effect> {
        tracing::info!(
            "Bandwidth test from {}: upload {:.2} Mbps, download {:.2} Mbps, total {:.2} Mbps",
            connection,
            result.upload,
            result.download,
            result.total
        );
        let previous = self.engine.allocations();
        self.engine.set_capacity(result.total);
        let allocations = self.engine.reallocate_all();

        let mut effects = Vec::new();
        if self.connections.contains_key(connection) {
            effects.push(Effect::Send(
                connection.clone(),
                SendingMessage::BandwidthTestResult(result),
            ));
        }
        effects.extend(self.reallocation_notices(
            &previous,
            &allocations,
            ReallocationReason::CapacityUpdated,
            None,
        ));
        effects.push(self.bandwidth_status());
        effects
    }

    fn remove_stream(&mut self, connection: &ConnectionId, stream_id: &str) -> Vec<Effect> {
        match self.streams.get(stream_id) {
            Some(stream) if stream.socket_id == *connection => {}
            _ => {
                tracing::debug!("Stream {} is not owned by {}", stream_id, connection);
                return Vec::new();
            }
        }
        if let Some(stream) = self.streams.remove(stream_id) {
            tracing::info!("Streamer disconnected: {} ({})", stream.name, stream_id);
        }

        let previous = self.engine.allocations();
        let allocations = self.engine.remove(stream_id);
        let mut effects =
            self.reallocation_notices(&previous, &allocations, ReallocationReason::StreamerLeft, None);
        effects.push(self.bandwidth_status());
        effects.push(self.streams_updated());
        effects
    }

    fn reallocation_notices(
        &self,
        previous: &Allocations,
        current: &Allocations,
        reason: ReallocationReason,
        skip: Option<&str>,
    ) -> Vec<Effect> {
        let active_streamers = self.engine.active_count();
        let mut notices: Vec<Effect> = current
            .iter()
            .filter(|(stream_id, _)| Some(stream_id.as_str()) != skip)
            .filter(|(stream_id, bitrate)| previous.get(*stream_id) != Some(*bitrate))
            .filter_map(|(stream_id, bitrate)| {
                let registration = self.engine.registration(stream_id)?;
                tracing::debug!(
                    "Notifying {} of new bitrate {} ({})",
                    stream_id,
                    bitrate,
                    reason
                );
                Some(Effect::Send(
                    registration.connection.clone(),
                    SendingMessage::BandwidthReallocated {
                        new_bitrate: *bitrate,
                        reason,
                        active_streamers,
                    },
                ))
            })
            .collect();
        notices.sort_by(|a, b| match (a, b) {
            (Effect::Send(a, _), Effect::Send(b, _)) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        });
        notices
    }

    fn bandwidth_status(&self) -> Effect {
        Effect::Broadcast(SendingMessage::BandwidthStatus(self.engine.status()))
    }

    fn streams_updated(&self) -> Effect {
        Effect::Broadcast(SendingMessage::StreamsUpdated {
            streams: self.streams(),
        })
    }

    fn error(connection: &ConnectionId, err: &Error) -> Effect {
        tracing::warn!("Replying error to {}: {}", connection, err);
        Effect::Send(
            connection.clone(),
            SendingMessage::Error {
                message: err.client_message(),
            },
        )
    }

    fn rejection(connection: &ConnectionId, err: &Error) -> Effect {
        match &err.kind {
            ErrorKind::AllocationError(AllocationErrorKind::InsufficientBandwidthError {
                required_mbps,
                available_mbps,
            }) => Effect::Send(
                connection.clone(),
                SendingMessage::BandwidthInsufficient {
                    required: *required_mbps,
                    available: *available_mbps,
                    message: err.client_message(),
                },
            ),
            _ => Self::error(connection, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn relay() -> SignalingRelay {
        let mut relay = SignalingRelay::new(Arc::new(Config::default())).unwrap();
        for id in ["c1", "c2", "c3"] {
            relay.connect(ConnectionId::from(id));
        }
        relay
    }

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    fn register(stream_id: &str, quality: &str) -> ReceivedMessage {
        ReceivedMessage::RegisterStreamer {
            stream_id: Some(stream_id.to_string()),
            name: None,
            quality: Some(quality.to_string()),
            resolution: None,
            frame_rate: None,
        }
    }

    fn set_capacity(relay: &mut SignalingRelay, connection: &str, upload_bytes: u64) {
        let now = Instant::now();
        relay.handle(&conn(connection), ReceivedMessage::BandwidthTestStart, now);
        relay.handle(
            &conn(connection),
            ReceivedMessage::BandwidthTestComplete(ProbeReport {
                upload_bytes,
                download_bytes: 0,
                duration: 5000,
            }),
            now,
        );
    }

    fn sent_to(effects: &[Effect], connection: &str) -> Vec<SendingMessage> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send(to, message) if to.as_str() == connection => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_register_rejected_without_capacity() {
        let mut relay = relay();
        let effects = relay.handle(&conn("c1"), register("cam", "1080p30"), Instant::now());
        assert_eq!(
            sent_to(&effects, "c1"),
            vec![SendingMessage::BandwidthInsufficient {
                required: 4.0,
                available: 0.0,
                message: "Insufficient bandwidth: 4.0 Mbps required, 0.0 Mbps available"
                    .to_string(),
            }]
        );
        assert_eq!(relay.stream_count(), 0);
        assert_eq!(relay.engine().active_count(), 0);
    }

    #[test]
    fn test_register_unknown_tier_replies_error() {
        let mut relay = relay();
        set_capacity(&mut relay, "c1", 6_250_000);
        let effects = relay.handle(&conn("c1"), register("cam", "8k240"), Instant::now());
        assert!(matches!(
            sent_to(&effects, "c1").as_slice(),
            [SendingMessage::Error { .. }]
        ));
        assert_eq!(relay.stream_count(), 0);
    }

    #[test]
    fn test_probe_result_sets_capacity() {
        let mut relay = relay();
        let now = Instant::now();
        let effects = relay.handle(&conn("c1"), ReceivedMessage::BandwidthTestStart, now);
        assert!(matches!(
            effects.as_slice(),
            [Effect::ScheduleProbeDeadline { after, .. }] if *after == Duration::from_millis(6000)
        ));

        let effects = relay.handle(
            &conn("c1"),
            ReceivedMessage::BandwidthTestComplete(ProbeReport {
                upload_bytes: 6_250_000,
                download_bytes: 0,
                duration: 5000,
            }),
            now,
        );
        assert_eq!(
            sent_to(&effects, "c1"),
            vec![SendingMessage::BandwidthTestResult(ProbeResult {
                upload: 10.0,
                download: 0.0,
                total: 10.0,
            })]
        );
        assert_eq!(relay.engine().capacity(), 10.0);
    }

    #[test]
    fn test_download_request_sends_padding_chunk() {
        let mut relay = relay();
        let now = Instant::now();
        relay.handle(&conn("c1"), ReceivedMessage::BandwidthTestStart, now);
        let effects = relay.handle(&conn("c1"), ReceivedMessage::BandwidthTestDownloadRequest, now);
        match sent_to(&effects, "c1").as_slice() {
            [SendingMessage::BandwidthTestDownloadChunk { size, chunk }] => {
                assert_eq!(*size, 65_536);
                assert_eq!(chunk.len(), 65_536);
            }
            other => panic!("unexpected {:?}", other),
        }

        let effects = relay.handle(&conn("c2"), ReceivedMessage::BandwidthTestDownloadRequest, now);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_join_and_leave_reallocate_other_streamers() {
        let mut relay = relay();
        set_capacity(&mut relay, "c1", 6_250_000);

        let effects = relay.handle(&conn("c1"), register("cam-1", "1080p30"), Instant::now());
        assert_eq!(
            sent_to(&effects, "c1"),
            vec![SendingMessage::StreamerRegistered {
                stream_id: "cam-1".to_string(),
                viewer_url: "http://localhost:3000/viewer?stream=cam-1".to_string(),
                allocated_bitrate: 8_000_000,
            }]
        );

        let effects = relay.handle(&conn("c2"), register("cam-2", "720p30"), Instant::now());
        assert!(matches!(
            sent_to(&effects, "c2").as_slice(),
            [SendingMessage::StreamerRegistered { allocated_bitrate: 5_000_000, .. }]
        ));
        assert_eq!(
            sent_to(&effects, "c1"),
            vec![SendingMessage::BandwidthReallocated {
                new_bitrate: 5_000_000,
                reason: ReallocationReason::StreamerJoined,
                active_streamers: 2,
            }]
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Broadcast(SendingMessage::StreamsUpdated { streams }) if streams.len() == 2
        )));

        let effects = relay.disconnect(&conn("c2"));
        assert_eq!(
            sent_to(&effects, "c1"),
            vec![SendingMessage::BandwidthReallocated {
                new_bitrate: 8_000_000,
                reason: ReallocationReason::StreamerLeft,
                active_streamers: 1,
            }]
        );
        assert_eq!(relay.stream_count(), 1);
        assert!(relay.status().streamers.iter().all(|s| s.id != "cam-2"));
    }

    #[test]
    fn test_rejected_join_leaves_members_untouched() {
        let mut relay = relay();
        set_capacity(&mut relay, "c1", 3_125_000);
        relay.handle(&conn("c1"), register("cam-1", "1080p30"), Instant::now());

        let effects = relay.handle(&conn("c2"), register("cam-2", "1080p30"), Instant::now());
        assert_eq!(
            sent_to(&effects, "c2"),
            vec![SendingMessage::BandwidthInsufficient {
                required: 4.0,
                available: 2.5,
                message: "Insufficient bandwidth: 4.0 Mbps required, 2.5 Mbps available"
                    .to_string(),
            }]
        );
        assert!(sent_to(&effects, "c1").is_empty());
        assert_eq!(relay.engine().registration("cam-1").unwrap().allocated_bitrate, 5_000_000);

        // The rejected connection holds no registration, so its disconnect changes nothing.
        assert!(relay.disconnect(&conn("c2")).is_empty());
    }

    #[test]
    fn test_viewer_registration_and_relay() {
        let mut relay = relay();
        let now = Instant::now();
        set_capacity(&mut relay, "c1", 6_250_000);
        relay.handle(&conn("c1"), register("cam-1", "720p30"), now);

        let effects = relay.handle(
            &conn("c3"),
            ReceivedMessage::RegisterViewer {
                stream_id: "missing".to_string(),
            },
            now,
        );
        assert_eq!(
            sent_to(&effects, "c3"),
            vec![SendingMessage::Error {
                message: "Stream not found".to_string()
            }]
        );

        let effects = relay.handle(
            &conn("c3"),
            ReceivedMessage::RegisterViewer {
                stream_id: "cam-1".to_string(),
            },
            now,
        );
        assert_eq!(
            sent_to(&effects, "c3"),
            vec![SendingMessage::ViewerRegistered {
                stream_id: "cam-1".to_string(),
                streamer_socket_id: conn("c1"),
            }]
        );
        assert_eq!(relay.streams()[0].viewers, 1);

        let effects = relay.handle(
            &conn("c3"),
            ReceivedMessage::Offer {
                to: conn("c1"),
                offer: json!({"type": "offer"}),
                stream_id: Some("cam-1".to_string()),
            },
            now,
        );
        assert_eq!(
            effects,
            vec![Effect::Send(
                conn("c1"),
                SendingMessage::Offer {
                    from: conn("c3"),
                    offer: json!({"type": "offer"}),
                    stream_id: Some("cam-1".to_string()),
                }
            )]
        );

        let effects = relay.handle(
            &conn("c1"),
            ReceivedMessage::IceCandidate {
                to: conn("gone"),
                candidate: json!({"candidate": "a=candidate"}),
            },
            now,
        );
        assert!(effects.is_empty());

        relay.disconnect(&conn("c3"));
        assert_eq!(relay.streams()[0].viewers, 0);
    }

    #[test]
    fn test_stats_update_broadcasts_network_usage() {
        let mut relay = relay();
        let now = Instant::now();
        set_capacity(&mut relay, "c1", 6_250_000);
        relay.handle(&conn("c1"), register("cam-1", "720p30"), now);

        let mut stats = Map::new();
        stats.insert("bitrate".to_string(), json!(2500));
        stats.insert("fps".to_string(), json!(29));
        let effects = relay.handle(
            &conn("c1"),
            ReceivedMessage::StatsUpdate {
                role: Some(Role::Streamer),
                stats,
            },
            now,
        );
        assert_eq!(
            effects[0],
            Effect::Broadcast(SendingMessage::NetworkUsage {
                total_bitrate: 2500.0,
                stream_count: 1,
            })
        );
        assert_eq!(relay.streams()[0].stats["fps"], json!(29));
        assert_eq!(relay.streams()[0].stats["resolution"], json!("unknown"));

        let effects = relay.handle(
            &conn("c2"),
            ReceivedMessage::StatsUpdate {
                role: None,
                stats: Map::new(),
            },
            now,
        );
        assert_eq!(
            effects,
            vec![Effect::Send(
                conn("c2"),
                SendingMessage::Error {
                    message: "Stats update from a connection that is not streaming".to_string(),
                }
            )]
        );
    }

    #[test]
    fn test_probe_deadline_falls_back_without_data() {
        let mut relay = relay();
        let now = Instant::now();
        let effects = relay.handle(&conn("c1"), ReceivedMessage::BandwidthTestStart, now);
        let Effect::ScheduleProbeDeadline { probe_id, after, .. } = effects[0].clone() else {
            panic!("deadline not scheduled");
        };

        let effects = relay.probe_deadline(&conn("c1"), probe_id, now + after);
        assert_eq!(relay.engine().capacity(), 5.0);
        assert!(matches!(
            sent_to(&effects, "c1").as_slice(),
            [SendingMessage::BandwidthTestResult(ProbeResult { total, .. })] if *total == 5.0
        ));

        assert!(relay.probe_deadline(&conn("c1"), probe_id, now + after).is_empty());
    }

    #[test]
    fn test_capacity_drop_notifies_streamers() {
        let mut relay = relay();
        set_capacity(&mut relay, "c1", 6_250_000);
        relay.handle(&conn("c1"), register("cam-1", "1080p30"), Instant::now());

        let now = Instant::now();
        relay.handle(&conn("c2"), ReceivedMessage::BandwidthTestStart, now);
        let effects = relay.handle(
            &conn("c2"),
            ReceivedMessage::BandwidthTestComplete(ProbeReport {
                upload_bytes: 3_750_000,
                download_bytes: 0,
                duration: 5000,
            }),
            now,
        );
        assert_eq!(
            sent_to(&effects, "c1"),
            vec![SendingMessage::BandwidthReallocated {
                new_bitrate: 6_000_000,
                reason: ReallocationReason::CapacityUpdated,
                active_streamers: 1,
            }]
        );
    }

    #[test]
    fn test_reregistering_another_stream_replaces_the_first() {
        let mut relay = relay();
        set_capacity(&mut relay, "c1", 6_250_000);
        relay.handle(&conn("c1"), register("cam-1", "720p30"), Instant::now());
        relay.handle(&conn("c1"), register("cam-2", "720p30"), Instant::now());
        assert_eq!(relay.stream_count(), 1);
        assert_eq!(relay.engine().active_count(), 1);
        assert!(relay.engine().registration("cam-2").is_some());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut relay = relay();
        set_capacity(&mut relay, "c1", 6_250_000);
        relay.handle(&conn("c1"), register("cam-1", "720p30"), Instant::now());
        relay.reset();
        assert_eq!(relay.stream_count(), 0);
        assert_eq!(relay.connection_count(), 0);
        assert_eq!(relay.engine().capacity(), 0.0);
    }
}
