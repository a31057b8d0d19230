use std::{collections::HashMap, sync::Arc};

use serde::Serialize;

use crate::{
    connection::ConnectionId,
    error::{AllocationErrorKind, Error},
    tier::{QualityTier, QualityTierCatalog},
};

const BITS_PER_MEGABIT: f64 = 1_000_000.0;

/// Stream id to allocated bitrate in bits per second.
pub type Allocations = HashMap<String, u64>;

fn mbps_to_bps(mbps: f64) -> u64 {
    (mbps * BITS_PER_MEGABIT) as u64
}

fn bps_to_mbps(bps: u64) -> f64 {
    bps as f64 / BITS_PER_MEGABIT
}

/// An admitted streamer. Only the engine mutates `allocated_bitrate`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamerRegistration {
    pub stream_id: String,
    pub tier_id: String,
    pub connection: ConnectionId,
    pub allocated_bitrate: u64,
}

/// Outcome of [`AllocationEngine::evaluate_admission`].
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Admitted {
        allocated_bitrate: u64,
    },
    Rejected {
        required_mbps: f64,
        available_mbps: f64,
    },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Result of a successful [`AllocationEngine::try_admit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub allocated_bitrate: u64,
    pub allocations: Allocations,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerStatus {
    pub id: String,
    pub quality: String,
    pub bitrate: u64,
}

/// Side effect free snapshot of the engine. Bandwidth figures are in Mbps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthStatus {
    pub total_bandwidth: f64,
    pub used_bandwidth: f64,
    pub available_bandwidth: f64,
    pub active_streamers: usize,
    pub streamers: Vec<StreamerStatus>,
}

/// Tracks active streamers and divides the measured capacity evenly between them, clipped
/// to each tier's ceiling. A tier whose ceiling sits below the fair share leaves its slack
/// unused; it is not redistributed to the other streamers.
#[derive(Debug)]
pub struct AllocationEngine {
    catalog: Arc<QualityTierCatalog>,
    capacity_mbps: f64,
    registrations: HashMap<String, StreamerRegistration>,
}

impl AllocationEngine {
    pub fn new(catalog: Arc<QualityTierCatalog>) -> Self {
        tracing::debug!("AllocationEngine is created");
        Self {
            catalog,
            capacity_mbps: 0.0,
            registrations: HashMap::new(),
        }
    }

    pub fn catalog(&self) -> &QualityTierCatalog {
        &self.catalog
    }

    pub fn capacity(&self) -> f64 {
        self.capacity_mbps
    }

    /// Replaces the capacity estimate. Negative and NaN values are stored as 0. Does not
    /// reallocate; call [`Self::reallocate_all`] when the new figure should take effect.
    pub fn set_capacity(&mut self, mbps: f64) {
        let mbps = if mbps.is_nan() || mbps < 0.0 {
            tracing::warn!("Ignoring invalid capacity {}, using 0 Mbps", mbps);
            0.0
        } else {
            mbps
        };
        self.capacity_mbps = mbps;
        tracing::info!("Total available bandwidth set to {:.2} Mbps", mbps);
    }

    pub fn active_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn registration(&self, stream_id: &str) -> Option<&StreamerRegistration> {
        self.registrations.get(stream_id)
    }

    pub fn registrations(&self) -> impl Iterator<Item = &StreamerRegistration> {
        self.registrations.values()
    }

    /// Current allocation of every registration.
    pub fn allocations(&self) -> Allocations {
        self.registrations
            .values()
            .map(|r| (r.stream_id.clone(), r.allocated_bitrate))
            .collect()
    }

    fn tier(&self, tier_id: &str) -> Result<&QualityTier, Error> {
        self.catalog.get(tier_id).ok_or_else(|| {
            Error::new_allocation(
                format!("Invalid quality tier: {}", tier_id),
                AllocationErrorKind::UnknownTierError,
            )
        })
    }

    /// Decides whether one more streamer of `tier_id` fits, assuming the head count grows by one.
    pub fn evaluate_admission(
        &self,
        tier_id: &str,
        prospective_stream_id: &str,
    ) -> Result<AdmissionDecision, Error> {
        let tier = self.tier(tier_id)?;
        let future_count = self.registrations.len() + 1;
        let fair_share_mbps = self.capacity_mbps / future_count as f64;
        let candidate = tier.bitrate_max.min(mbps_to_bps(fair_share_mbps));

        tracing::debug!(
            "Checking streamer {} ({}): total={:.2} Mbps, active={}, fair share={:.2} Mbps, tier min={:.2} Mbps",
            prospective_stream_id,
            tier_id,
            self.capacity_mbps,
            self.registrations.len(),
            fair_share_mbps,
            bps_to_mbps(tier.bitrate_min),
        );

        if candidate < tier.bitrate_min {
            tracing::info!(
                "Insufficient bandwidth for {} ({}): required {:.2} Mbps, available {:.2} Mbps",
                prospective_stream_id,
                tier_id,
                bps_to_mbps(tier.bitrate_min),
                fair_share_mbps
            );
            return Ok(AdmissionDecision::Rejected {
                required_mbps: bps_to_mbps(tier.bitrate_min),
                available_mbps: fair_share_mbps,
            });
        }

        Ok(AdmissionDecision::Admitted {
            allocated_bitrate: candidate,
        })
    }

    /// Inserts a registration and reallocates everybody. The caller must hold an admitted
    /// decision for the current state; prefer [`Self::try_admit`].
    pub fn admit(
        &mut self,
        stream_id: &str,
        tier_id: &str,
        connection: ConnectionId,
    ) -> Allocations {
        let registration = StreamerRegistration {
            stream_id: stream_id.to_string(),
            tier_id: tier_id.to_string(),
            connection,
            allocated_bitrate: 0,
        };
        if self
            .registrations
            .insert(stream_id.to_string(), registration)
            .is_some()
        {
            tracing::debug!("Streamer {} re-admitted, previous registration replaced", stream_id);
        }
        tracing::info!("Added streamer {} ({})", stream_id, tier_id);
        self.reallocate_all()
    }

    /// Evaluates and, when admitted, registers in one step.
    pub fn try_admit(
        &mut self,
        stream_id: &str,
        tier_id: &str,
        connection: ConnectionId,
    ) -> Result<Admission, Error> {
        match self.evaluate_admission(tier_id, stream_id)? {
            AdmissionDecision::Admitted { allocated_bitrate } => {
                let allocations = self.admit(stream_id, tier_id, connection);
                Ok(Admission {
                    allocated_bitrate: allocations
                        .get(stream_id)
                        .copied()
                        .unwrap_or(allocated_bitrate),
                    allocations,
                })
            }
            AdmissionDecision::Rejected {
                required_mbps,
                available_mbps,
            } => Err(Error::new_allocation(
                format!("Streamer {} rejected for tier {}", stream_id, tier_id),
                AllocationErrorKind::InsufficientBandwidthError {
                    required_mbps,
                    available_mbps,
                },
            )),
        }
    }

    /// Drops the registration if present and reallocates the remaining streamers.
    pub fn remove(&mut self, stream_id: &str) -> Allocations {
        if let Some(registration) = self.registrations.remove(stream_id) {
            tracing::info!("Removed streamer {} ({})", stream_id, registration.tier_id);
        }
        self.reallocate_all()
    }

    /// Recomputes every allocation as `min(tier max, capacity / n)`. A registration whose tier
    /// is unknown keeps its previous allocation and is left out of the returned map.
    pub fn reallocate_all(&mut self) -> Allocations {
        let mut allocations = Allocations::new();
        let count = self.registrations.len();
        if count == 0 {
            return allocations;
        }

        let fair_share_bps = mbps_to_bps(self.capacity_mbps / count as f64);
        tracing::debug!(
            "Reallocating {:.2} Mbps between {} streamers",
            self.capacity_mbps,
            count
        );

        for registration in self.registrations.values_mut() {
            let Some(tier) = self.catalog.get(&registration.tier_id) else {
                tracing::warn!(
                    "Unknown quality tier {} for streamer {}, keeping {} bps",
                    registration.tier_id,
                    registration.stream_id,
                    registration.allocated_bitrate
                );
                continue;
            };
            let allocated = tier.bitrate_max.min(fair_share_bps);
            registration.allocated_bitrate = allocated;
            allocations.insert(registration.stream_id.clone(), allocated);
            tracing::debug!(
                "Streamer {} ({}): {:.2} Mbps",
                registration.stream_id,
                registration.tier_id,
                bps_to_mbps(allocated)
            );
        }

        allocations
    }

    pub fn status(&self) -> BandwidthStatus {
        let mut streamers: Vec<StreamerStatus> = self
            .registrations
            .values()
            .map(|r| StreamerStatus {
                id: r.stream_id.clone(),
                quality: r.tier_id.clone(),
                bitrate: r.allocated_bitrate,
            })
            .collect();
        streamers.sort_by(|a, b| a.id.cmp(&b.id));

        let used_bandwidth = streamers
            .iter()
            .map(|s| bps_to_mbps(s.bitrate))
            .sum::<f64>();

        BandwidthStatus {
            total_bandwidth: self.capacity_mbps,
            used_bandwidth,
            available_bandwidth: (self.capacity_mbps - used_bandwidth).max(0.0),
            active_streamers: self.registrations.len(),
            streamers,
        }
    }

    pub fn reset(&mut self) {
        self.capacity_mbps = 0.0;
        self.registrations.clear();
        tracing::info!("AllocationEngine reset");
    }

    /// Test hook for registrations whose tier vanished from the catalog.
    #[cfg(test)]
    fn insert_raw(&mut self, registration: StreamerRegistration) {
        self.registrations
            .insert(registration.stream_id.clone(), registration);
    }
}
