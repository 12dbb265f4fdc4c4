//! Response tiering
//!
//! Ranked packs are split roughly 40/40/20 into essential, contextual and
//! reference tiers. A non-empty answer always has at least one essential pack.

use serde::{Deserialize, Serialize};

use crate::domain::knowledge::ContextPack;

/// Pack counts per tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSplit {
    pub essential: usize,
    pub contextual: usize,
    pub reference: usize,
}

pub fn split(count: usize) -> TierSplit {
    if count == 0 {
        return TierSplit {
            essential: 0,
            contextual: 0,
            reference: 0,
        };
    }
    let share = (count as f64 * 0.4).round() as usize;
    let essential = share.max(1).min(count);
    let contextual = share.min(count - essential);
    TierSplit {
        essential,
        contextual,
        reference: count - essential - contextual,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tiers {
    pub essential: Vec<ContextPack>,
    pub contextual: Vec<ContextPack>,
    pub reference: Vec<ContextPack>,
}

/// Split packs, in rank order, into tiers
pub fn tier(packs: Vec<ContextPack>) -> Tiers {
    let counts = split(packs.len());
    let mut packs = packs.into_iter();
    Tiers {
        essential: packs.by_ref().take(counts.essential).collect(),
        contextual: packs.by_ref().take(counts.contextual).collect(),
        reference: packs.collect(),
    }
}
