//! Per-size consumption rates and material level snapshots.

use serde::{Deserialize, Serialize};

use crate::op::MaterialDraw;
use crate::types::{MaterialCategory, PacketSize};

/// Raw material consumed by one packet of a given size. A zero rate means the
/// material is not required for that size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSpec {
    /// Pouches consumed per packet.
    pub pouches: u64,
    /// Base ingredient consumed per packet, in grams.
    pub grams: u64,
}

/// Point-in-time levels of both material pools, as used by a ceiling
/// computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MaterialSnapshot {
    /// Pouch units on hand.
    pub pouches: u64,
    /// Base ingredient grams on hand.
    pub base_grams: u64,
}

/// Consumption rates for every packet size.
///
/// The default matches the production recipe: one pouch per packet of any
/// size, and the packet's net weight in base ingredient. Deployments with
/// different recipes build a profile from their own specs; rates are data,
/// not code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumptionProfile {
    specs: [PacketSpec; 4],
}

impl Default for ConsumptionProfile {
    fn default() -> Self {
        let mut specs = [PacketSpec {
            pouches: 1,
            grams: 0,
        }; 4];
        for size in PacketSize::ALL {
            specs[Self::slot(size)].grams = size.grams();
        }
        Self { specs }
    }
}

impl ConsumptionProfile {
    /// Replaces the spec for one size, builder style.
    pub fn with_spec(mut self, size: PacketSize, spec: PacketSpec) -> Self {
        self.specs[Self::slot(size)] = spec;
        self
    }

    /// Consumption rates for one packet of `size`.
    pub fn spec(&self, size: PacketSize) -> PacketSpec {
        self.specs[Self::slot(size)]
    }

    /// Material drawn by producing `quantity` packets of `size`, in pool
    /// order. Returns `None` on arithmetic overflow. Zero-rate materials are
    /// omitted.
    pub fn draws(&self, size: PacketSize, quantity: u64) -> Option<Vec<MaterialDraw>> {
        let spec = self.spec(size);
        let mut draws = Vec::with_capacity(2);
        if spec.pouches > 0 {
            draws.push(MaterialDraw {
                category: MaterialCategory::Pouch,
                amount: spec.pouches.checked_mul(quantity)?,
            });
        }
        if spec.grams > 0 {
            draws.push(MaterialDraw {
                category: MaterialCategory::BaseIngredient,
                amount: spec.grams.checked_mul(quantity)?,
            });
        }
        Some(draws)
    }

    /// Maximum packets of `size` producible from `levels`: the minimum over
    /// required materials of available quantity divided by the per-packet
    /// rate. A size that requires no material at all reports zero.
    pub fn producible(&self, size: PacketSize, levels: MaterialSnapshot) -> u64 {
        let spec = self.spec(size);
        let mut bound: Option<u64> = None;
        if spec.pouches > 0 {
            bound = Some(levels.pouches / spec.pouches);
        }
        if spec.grams > 0 {
            let by_grams = levels.base_grams / spec.grams;
            bound = Some(bound.map_or(by_grams, |b| b.min(by_grams)));
        }
        bound.unwrap_or(0)
    }

    fn slot(size: PacketSize) -> usize {
        match size {
            PacketSize::G30 => 0,
            PacketSize::G60 => 1,
            PacketSize::G500 => 2,
            PacketSize::Kg1 => 3,
        }
    }
}
