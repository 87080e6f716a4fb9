//! Shared primitive sequence aliases and partition-key enums.

use serde::{Deserialize, Serialize};

/// Monotonic journal operation sequence number.
pub type OpSeq = u64;
/// Monotonic transaction record sequence number (shared with the op that produced it).
pub type TxSeq = u64;

/// Finished-goods packet weight class. Partition key for balances, the
/// transaction log, and capacity ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketSize {
    /// 30 gram packet.
    G30,
    /// 60 gram packet.
    G60,
    /// 500 gram packet.
    G500,
    /// 1 kilogram packet.
    Kg1,
}

impl PacketSize {
    /// All sizes, in ascending weight order.
    pub const ALL: [PacketSize; 4] = [
        PacketSize::G30,
        PacketSize::G60,
        PacketSize::G500,
        PacketSize::Kg1,
    ];

    /// Net weight of one packet in grams.
    pub fn grams(self) -> u64 {
        match self {
            PacketSize::G30 => 30,
            PacketSize::G60 => 60,
            PacketSize::G500 => 500,
            PacketSize::Kg1 => 1000,
        }
    }

    /// Stable label used in journal rows and cache tables.
    pub fn label(self) -> &'static str {
        match self {
            PacketSize::G30 => "30gm",
            PacketSize::G60 => "60gm",
            PacketSize::G500 => "500gm",
            PacketSize::Kg1 => "1kg",
        }
    }

    /// Inverse of [`PacketSize::label`].
    pub fn from_label(label: &str) -> Option<Self> {
        PacketSize::ALL.into_iter().find(|s| s.label() == label)
    }
}

impl core::fmt::Display for PacketSize {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

/// Raw-material pool category. Both pools are shared by every packet size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaterialCategory {
    /// Empty pouches, counted in units.
    Pouch,
    /// Bulk base ingredient, measured in whole grams.
    BaseIngredient,
}

impl MaterialCategory {
    /// Both categories.
    pub const ALL: [MaterialCategory; 2] =
        [MaterialCategory::Pouch, MaterialCategory::BaseIngredient];

    /// Stable label used in messages and cache tables.
    pub fn label(self) -> &'static str {
        match self {
            MaterialCategory::Pouch => "pouch",
            MaterialCategory::BaseIngredient => "base ingredient",
        }
    }
}

impl core::fmt::Display for MaterialCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}
