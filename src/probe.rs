use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::ProbeConfig,
    connection::ConnectionId,
    error::{Error, ProbeErrorKind},
};

/// Throughput of one probe in Mbps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub upload: f64,
    pub download: f64,
    pub total: f64,
}

impl ProbeResult {
    pub fn from_bytes(upload_bytes: u64, download_bytes: u64, duration: Duration) -> Self {
        let upload = megabits_per_second(upload_bytes, duration);
        let download = megabits_per_second(download_bytes, duration);
        Self {
            upload,
            download,
            total: upload + download,
        }
    }

    /// A capacity assumed without measuring, used when a test fails.
    pub fn assumed(total: f64) -> Self {
        Self {
            upload: 0.0,
            download: 0.0,
            total,
        }
    }
}

pub fn megabits_per_second(bytes: u64, duration: Duration) -> f64 {
    let seconds = duration.as_secs_f64();
    if seconds <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / seconds / 1_000_000.0
}

/// Byte counts a client reports when its test finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub upload_bytes: u64,
    pub download_bytes: u64,
    /// Milliseconds the client actually ran the test.
    pub duration: u64,
}

#[derive(Debug, Clone)]
struct ProbeSession {
    id: Uuid,
    started_at: Instant,
    upload_bytes: u64,
    download_bytes: u64,
}

/// Per connection bookkeeping of running bandwidth tests.
#[derive(Debug)]
pub struct ProbeTracker {
    config: ProbeConfig,
    sessions: HashMap<ConnectionId, ProbeSession>,
}

impl ProbeTracker {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    pub fn is_running(&self, connection: &ConnectionId) -> bool {
        self.sessions.contains_key(connection)
    }

    /// Starts a test and returns its id, which the deadline timer must hand back to [`Self::expire`].
    pub fn start(&mut self, connection: &ConnectionId, now: Instant) -> Result<Uuid, Error> {
        if self.sessions.contains_key(connection) {
            return Err(Error::new_probe(
                format!("Bandwidth test already running for {}", connection),
                ProbeErrorKind::ProbeAlreadyRunningError,
            ));
        }
        let id = Uuid::new_v4();
        self.sessions.insert(
            connection.clone(),
            ProbeSession {
                id,
                started_at: now,
                upload_bytes: 0,
                download_bytes: 0,
            },
        );
        tracing::debug!("Bandwidth test {} started for {}", id, connection);
        Ok(id)
    }

    fn session_mut(&mut self, connection: &ConnectionId) -> Result<&mut ProbeSession, Error> {
        self.sessions.get_mut(connection).ok_or_else(|| {
            Error::new_probe(
                format!("No bandwidth test running for {}", connection),
                ProbeErrorKind::ProbeNotStartedError,
            )
        })
    }

    pub fn record_upload(&mut self, connection: &ConnectionId, size: u64) -> Result<(), Error> {
        let session = self.session_mut(connection)?;
        session.upload_bytes = session.upload_bytes.saturating_add(size);
        Ok(())
    }

    /// Counts a download chunk and returns its size.
    pub fn record_download(&mut self, connection: &ConnectionId) -> Result<usize, Error> {
        let size = self.config.chunk_size;
        let session = self.session_mut(connection)?;
        session.download_bytes = session.download_bytes.saturating_add(size as u64);
        Ok(size)
    }

    /// Finishes a test with the figures the client measured.
    pub fn complete(
        &mut self,
        connection: &ConnectionId,
        report: ProbeReport,
    ) -> Result<ProbeResult, Error> {
        self.sessions.remove(connection).ok_or_else(|| {
            Error::new_probe(
                format!("Bandwidth test completed by {} without being started", connection),
                ProbeErrorKind::ProbeNotStartedError,
            )
        })?;
        Ok(ProbeResult::from_bytes(
            report.upload_bytes,
            report.download_bytes,
            Duration::from_millis(report.duration),
        ))
    }

    /// Force completes test `id` if it is still running past its deadline, using the bytes the
    /// server counted. Returns `None` when the test already finished. A test that counted
    /// nothing yields `ProbeTimeoutError`.
    pub fn expire(
        &mut self,
        connection: &ConnectionId,
        id: Uuid,
        now: Instant,
    ) -> Option<Result<ProbeResult, Error>> {
        let elapsed = match self.sessions.get(connection) {
            Some(session) if session.id == id => now.saturating_duration_since(session.started_at),
            _ => return None,
        };
        if elapsed < self.config.deadline() {
            return None;
        }

        let session = self.sessions.remove(connection)?;
        tracing::warn!(
            "Bandwidth test {} for {} exceeded {:?}, force completing",
            session.id,
            connection,
            self.config.deadline()
        );
        if session.upload_bytes == 0 && session.download_bytes == 0 {
            return Some(Err(Error::new_probe(
                format!("Bandwidth test for {} timed out without data", connection),
                ProbeErrorKind::ProbeTimeoutError,
            )));
        }
        Some(Ok(ProbeResult::from_bytes(
            session.upload_bytes,
            session.download_bytes,
            elapsed,
        )))
    }

    pub fn cancel(&mut self, connection: &ConnectionId) {
        if self.sessions.remove(connection).is_some() {
            tracing::debug!("Bandwidth test for {} cancelled", connection);
        }
    }

    pub fn reset(&mut self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn tracker() -> ProbeTracker {
        ProbeTracker::new(ProbeConfig::default())
    }

    #[test]
    fn test_megabits_per_second() {
        assert_eq!(megabits_per_second(1_250_000, Duration::from_secs(1)), 10.0);
        assert_eq!(megabits_per_second(1_000, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_complete_uses_client_report() {
        let mut tracker = tracker();
        let conn = ConnectionId::from("c1");
        tracker.start(&conn, Instant::now()).unwrap();
        let result = tracker
            .complete(
                &conn,
                ProbeReport {
                    upload_bytes: 3_125_000,
                    download_bytes: 6_250_000,
                    duration: 5000,
                },
            )
            .unwrap();
        assert_eq!(result.upload, 5.0);
        assert_eq!(result.download, 10.0);
        assert_eq!(result.total, 15.0);
        assert!(!tracker.is_running(&conn));
    }

    #[test]
    fn test_complete_without_start_fails() {
        let mut tracker = tracker();
        let err = tracker
            .complete(
                &ConnectionId::from("c1"),
                ProbeReport {
                    upload_bytes: 1,
                    download_bytes: 1,
                    duration: 1,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::ProbeError(ProbeErrorKind::ProbeNotStartedError)
        ));
    }

    #[test]
    fn test_double_start_is_rejected() {
        let mut tracker = tracker();
        let conn = ConnectionId::from("c1");
        let now = Instant::now();
        tracker.start(&conn, now).unwrap();
        assert!(tracker.start(&conn, now).is_err());
    }

    #[test]
    fn test_expire_before_deadline_is_noop() {
        let mut tracker = tracker();
        let conn = ConnectionId::from("c1");
        let now = Instant::now();
        let id = tracker.start(&conn, now).unwrap();
        assert!(tracker
            .expire(&conn, id, now + Duration::from_millis(5999))
            .is_none());
        assert!(tracker.is_running(&conn));
    }

    #[test]
    fn test_expire_force_completes_with_counted_bytes() {
        let mut tracker = tracker();
        let conn = ConnectionId::from("c1");
        let now = Instant::now();
        let id = tracker.start(&conn, now).unwrap();
        tracker.record_upload(&conn, 3_750_000).unwrap();
        for _ in 0..10 {
            assert_eq!(tracker.record_download(&conn).unwrap(), 65_536);
        }

        let result = tracker
            .expire(&conn, id, now + Duration::from_secs(6))
            .unwrap()
            .unwrap();
        assert_eq!(result.upload, 5.0);
        assert!(result.download > 0.0);
        assert!(!tracker.is_running(&conn));
    }

    #[test]
    fn test_huge_upload_sizes_saturate() {
        let mut tracker = tracker();
        let conn = ConnectionId::from("c1");
        let now = Instant::now();
        let id = tracker.start(&conn, now).unwrap();
        tracker.record_upload(&conn, u64::MAX).unwrap();
        tracker.record_upload(&conn, 1).unwrap();
        tracker.record_download(&conn).unwrap();

        let result = tracker
            .expire(&conn, id, now + Duration::from_secs(6))
            .unwrap()
            .unwrap();
        assert!(result.upload.is_finite());
        assert!(result.upload > 0.0);
    }

    #[test]
    fn test_expire_without_data_times_out() {
        let mut tracker = tracker();
        let conn = ConnectionId::from("c1");
        let now = Instant::now();
        let id = tracker.start(&conn, now).unwrap();
        let err = tracker
            .expire(&conn, id, now + Duration::from_secs(7))
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::ProbeError(ProbeErrorKind::ProbeTimeoutError)
        ));
    }

    #[test]
    fn test_stale_deadline_ignores_newer_test() {
        let mut tracker = tracker();
        let conn = ConnectionId::from("c1");
        let now = Instant::now();
        let first = tracker.start(&conn, now).unwrap();
        tracker.cancel(&conn);
        tracker.start(&conn, now + Duration::from_secs(4)).unwrap();
        assert!(tracker
            .expire(&conn, first, now + Duration::from_secs(6))
            .is_none());
        assert!(tracker.is_running(&conn));
    }
}
