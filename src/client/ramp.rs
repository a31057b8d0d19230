use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{controller::BitrateState, BitrateSink};

/// Caps applied when a transmission starts: a percentage of `target` per step.
pub fn initial_ramp(target: u64, percents: &[u64]) -> Vec<u64> {
    percents.iter().map(|percent| target * percent / 100).collect()
}

/// Equal steps from `from` to `to`. The last step lands exactly on `to`.
pub fn transition(from: u64, to: u64, steps: u64) -> Vec<u64> {
    let steps = steps.max(1);
    let diff = to as i128 - from as i128;
    (1..=steps)
        .map(|i| (from as i128 + diff * i as i128 / steps as i128) as u64)
        .collect()
}

/// A schedule of caps applied one `interval` apart, the first one immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ramp {
    pub steps: Vec<u64>,
    pub interval: Duration,
}

impl Ramp {
    /// Applies every step unless `token` is cancelled first. The state lock is held while a step
    /// is applied, so a superseded ramp can never write after its successor started.
    pub(crate) async fn run(
        self,
        state: Arc<Mutex<BitrateState>>,
        sink: Arc<dyn BitrateSink>,
        token: CancellationToken,
    ) {
        let total = self.steps.len();
        for (i, cap) in self.steps.into_iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("ramp superseded after {}/{} steps", i, total);
                        return;
                    }
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }

            let mut state = state.lock().await;
            if token.is_cancelled() {
                return;
            }
            state.apply_step(cap);
            if let Err(err) = sink.apply_bitrate_cap(cap).await {
                tracing::error!("failed to apply bitrate cap {}: {}", cap, err);
            }
            tracing::debug!("ramp step {}/{}: {} bps", i + 1, total, cap);
            if i + 1 == total {
                state.finish_ramp(tokio::time::Instant::now());
            }
        }
    }
}
