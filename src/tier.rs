use std::collections::{btree_map, BTreeMap};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigErrorKind, Error};

/// A named quality preset: resolution, frame rate and the bitrate envelope in bits per second.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityTier {
    /// Filled from the preset key when loaded from configuration.
    #[serde(default, skip_serializing)]
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_min: u64,
    pub bitrate_target: u64,
    pub bitrate_max: u64,
}

impl QualityTier {
    pub fn new(
        id: &str,
        width: u32,
        height: u32,
        frame_rate: u32,
        bitrate_min: u64,
        bitrate_target: u64,
        bitrate_max: u64,
    ) -> Self {
        Self {
            id: id.to_string(),
            width,
            height,
            frame_rate,
            bitrate_min,
            bitrate_target,
            bitrate_max,
        }
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.bitrate_min == 0
            || self.bitrate_min > self.bitrate_target
            || self.bitrate_target > self.bitrate_max
        {
            return Err(Error::new_config(
                format!(
                    "tier {} must satisfy 0 < min <= target <= max, got {}/{}/{}",
                    self.id, self.bitrate_min, self.bitrate_target, self.bitrate_max
                ),
                ConfigErrorKind::InvalidTierError,
            ));
        }
        Ok(())
    }
}

/// Read-only lookup of [`QualityTier`] by id. Built once at startup.
#[derive(Debug, Clone, Default)]
pub struct QualityTierCatalog {
    tiers: BTreeMap<String, QualityTier>,
}

impl QualityTierCatalog {
    /// Builds a catalog, rejecting duplicate ids and tiers that break `min <= target <= max`.
    pub fn new(tiers: impl IntoIterator<Item = QualityTier>) -> Result<Self, Error> {
        let mut map = BTreeMap::new();
        for tier in tiers {
            tier.validate()?;
            match map.entry(tier.id.clone()) {
                btree_map::Entry::Occupied(_) => {
                    return Err(Error::new_config(
                        format!("tier {} is defined twice", tier.id),
                        ConfigErrorKind::DuplicateTierError,
                    ));
                }
                btree_map::Entry::Vacant(entry) => {
                    entry.insert(tier);
                }
            }
        }
        tracing::info!("Quality tiers loaded: {:?}", map.keys().collect::<Vec<_>>());
        Ok(Self { tiers: map })
    }

    pub fn get(&self, id: &str) -> Option<&QualityTier> {
        self.tiers.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.tiers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}
