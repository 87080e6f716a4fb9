use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{
    profile::{ConsumptionProfile, MaterialSnapshot},
    types::PacketSize,
};

/// Advisory upper bound on producible packets for one size, together with
/// the material levels it was derived from.
///
/// The ceiling is not an authority: the ledger re-validates against live
/// material state at commit time. It exists so callers can show "max you can
/// add" without contending with the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityCeiling {
    /// Packet size the ceiling applies to.
    pub size: PacketSize,
    /// Maximum producible packets at `derived_from` levels.
    pub max_producible: u64,
    /// Material levels used in the computation.
    pub derived_from: MaterialSnapshot,
    /// Wall-clock time of the computation, milliseconds since epoch.
    pub updated_at_ms: u64,
}

/// Derived ceiling per size, kept current by recomputing after every
/// material mutation.
///
/// Both material pools are shared by every size, so any material change can
/// move all four ceilings; a full recompute over the fixed size set is
/// cheaper than tracking which sizes a change touches.
#[derive(Debug)]
pub struct CapacityBoard {
    profile: ConsumptionProfile,
    ceilings: HashMap<PacketSize, CapacityCeiling>,
}

impl CapacityBoard {
    /// Creates an empty board; no ceiling is known until the first
    /// [`CapacityBoard::recompute`].
    pub fn new(profile: ConsumptionProfile) -> Self {
        Self {
            profile,
            ceilings: HashMap::new(),
        }
    }

    /// Recomputes every size's ceiling from `levels` and returns the
    /// ceilings that changed. Idempotent: recomputing at unchanged levels
    /// returns nothing.
    pub fn recompute(&mut self, levels: MaterialSnapshot, ts_ms: u64) -> Vec<CapacityCeiling> {
        let mut changed = Vec::new();
        for size in PacketSize::ALL {
            let max_producible = self.profile.producible(size, levels);
            let stale = self
                .ceilings
                .get(&size)
                .is_none_or(|c| c.max_producible != max_producible || c.derived_from != levels);
            if stale {
                let ceiling = CapacityCeiling {
                    size,
                    max_producible,
                    derived_from: levels,
                    updated_at_ms: ts_ms,
                };
                self.ceilings.insert(size, ceiling);
                changed.push(ceiling);
            }
        }
        changed
    }

    /// Latest ceiling for `size`, if one has been computed.
    pub fn ceiling(&self, size: PacketSize) -> Option<CapacityCeiling> {
        self.ceilings.get(&size).copied()
    }

    /// Latest producible bound for `size`; zero before the first recompute.
    pub fn max_producible(&self, size: PacketSize) -> u64 {
        self.ceilings
            .get(&size)
            .map(|c| c.max_producible)
            .unwrap_or(0)
    }

    /// Every known ceiling, in weight order.
    pub fn all(&self) -> Vec<CapacityCeiling> {
        PacketSize::ALL
            .iter()
            .filter_map(|size| self.ceilings.get(size).copied())
            .collect()
    }
}
