use tokio::time::Instant;

use crate::{
    config::ProbeConfig,
    error::{Error, ProbeErrorKind},
    probe::{ProbeReport, ProbeResult},
};

use super::ProbeChannel;

/// Measures link throughput against the signaling server before streaming starts: a
/// saturating upload and a request/response download run side by side for the configured
/// duration.
#[derive(Debug, Clone)]
pub struct BandwidthTester {
    config: ProbeConfig,
}

impl BandwidthTester {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Runs one test. Fails with `ProbeTimeoutError` once `duration + safetyMargin` passes.
    pub async fn run(&self, channel: &dyn ProbeChannel) -> Result<ProbeResult, Error> {
        let started = Instant::now();
        let duration = self.config.duration();
        let chunk = self.config.chunk_size;

        let measured = tokio::time::timeout(self.config.deadline(), async {
            channel.begin().await?;
            let upload = async {
                let mut bytes = 0u64;
                while started.elapsed() < duration {
                    channel.upload(chunk).await?;
                    bytes += chunk as u64;
                }
                Ok::<u64, Error>(bytes)
            };
            let download = async {
                let mut bytes = 0u64;
                while started.elapsed() < duration {
                    bytes += channel.download().await? as u64;
                }
                Ok::<u64, Error>(bytes)
            };
            tokio::try_join!(upload, download)
        })
        .await;

        let (upload_bytes, download_bytes) = match measured {
            Ok(bytes) => bytes?,
            Err(_) => {
                return Err(Error::new_probe(
                    format!(
                        "bandwidth test did not finish within {:?}",
                        self.config.deadline()
                    ),
                    ProbeErrorKind::ProbeTimeoutError,
                ))
            }
        };

        let elapsed = started.elapsed();
        channel
            .complete(ProbeReport {
                upload_bytes,
                download_bytes,
                duration: elapsed.as_millis() as u64,
            })
            .await?;
        let result = ProbeResult::from_bytes(upload_bytes, download_bytes, elapsed);
        tracing::info!(
            "bandwidth test: upload {:.2} Mbps, download {:.2} Mbps, total {:.2} Mbps",
            result.upload,
            result.download,
            result.total
        );
        Ok(result)
    }

    /// Like [`Self::run`], but any failure yields the configured fallback capacity.
    pub async fn run_or_fallback(&self, channel: &dyn ProbeChannel) -> ProbeResult {
        match self.run(channel).await {
            Ok(result) => result,
            Err(err) => {
                let fallback = self.config.fallback_capacity_mbps;
                tracing::warn!("{}, assuming {:.2} Mbps", err, fallback);
                ProbeResult::assumed(fallback)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;

    use super::*;

    /// Moves one chunk in each direction every `latency`.
    struct LoopbackChannel {
        latency: Duration,
        stall_download: bool,
        report: Mutex<Option<ProbeReport>>,
    }

    impl LoopbackChannel {
        fn new(latency: Duration) -> Self {
            Self {
                latency,
                stall_download: false,
                report: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl ProbeChannel for LoopbackChannel {
        async fn begin(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn upload(&self, _size: usize) -> Result<(), Error> {
            tokio::time::sleep(self.latency).await;
            Ok(())
        }

        async fn download(&self) -> Result<usize, Error> {
            if self.stall_download {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.latency).await;
            Ok(65_536)
        }

        async fn complete(&self, report: ProbeReport) -> Result<(), Error> {
            *self.report.lock().unwrap() = Some(report);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_measures_throughput() {
        let tester = BandwidthTester::new(ProbeConfig::default());
        let channel = LoopbackChannel::new(Duration::from_millis(50));
        let result = tester.run(&channel).await.unwrap();

        // About 100 chunks of 64 KiB each way over 5 s.
        let report = channel.report.lock().unwrap().unwrap();
        assert!(report.upload_bytes >= 95 * 65_536 && report.upload_bytes <= 100 * 65_536);
        assert_eq!(report.download_bytes, report.upload_bytes);
        assert!(report.duration >= 5000 && report.duration < 5100);
        assert!(result.upload > 9.5 && result.upload < 10.6);
        assert_eq!(result.total, result.upload + result.download);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_test_times_out() {
        let tester = BandwidthTester::new(ProbeConfig::default());
        let mut channel = LoopbackChannel::new(Duration::from_millis(50));
        channel.stall_download = true;
        let started = Instant::now();

        let err = tester.run(&channel).await.unwrap_err();
        assert!(matches!(
            err.kind,
            crate::error::ErrorKind::ProbeError(ProbeErrorKind::ProbeTimeoutError)
        ));
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert!(channel.report.lock().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_capacity() {
        let tester = BandwidthTester::new(ProbeConfig::default());
        let mut channel = LoopbackChannel::new(Duration::from_millis(50));
        channel.stall_download = true;
        let result = tester.run_or_fallback(&channel).await;
        assert_eq!(result.total, 5.0);
    }
}
