//! The sending side of a stream: adaptive bitrate control driven by packet loss and server
//! reallocations, plus the pre-stream bandwidth test. Media and transport stay behind the
//! traits below.
use async_trait::async_trait;

use crate::{error::Error, probe::ProbeReport};

pub mod controller;
pub mod probe;
pub mod ramp;
pub mod stats;

pub use controller::{Adjustment, BitrateController, BitrateState};
pub use probe::BandwidthTester;
pub use stats::{LossSampler, TransportCounters};

/// Where bitrate caps end up, e.g. the max bitrate of a video sender's encoding.
#[async_trait]
pub trait BitrateSink: Send + Sync {
    async fn apply_bitrate_cap(&self, bitrate: u64) -> Result<(), Error>;
}

/// Cumulative transport statistics of the sender.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn transport_counters(&self) -> Result<TransportCounters, Error>;
}

/// The signaling round trips a [`BandwidthTester`] needs.
#[async_trait]
pub trait ProbeChannel: Send + Sync {
    /// Announces the test to the server.
    async fn begin(&self) -> Result<(), Error>;
    /// Sends `size` bytes of payload.
    async fn upload(&self, size: usize) -> Result<(), Error>;
    /// Requests one chunk and returns its size once it arrived.
    async fn download(&self) -> Result<usize, Error>;
    async fn complete(&self, report: ProbeReport) -> Result<(), Error>;
}
