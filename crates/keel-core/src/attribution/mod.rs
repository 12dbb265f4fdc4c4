//! Fault attribution
//!
//! Spectrum-based fault localization over recorded outcomes. Every context
//! pack is a "component"; every outcome is a "test run" that passed or
//! failed with some set of packs in play. The Ochiai coefficient ranks packs
//! by how strongly their presence correlates with failure.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::knowledge::OutcomeRecord;

/// Observations that yield roughly 63% attribution confidence
const CONFIDENCE_SCALE: f64 = 5.0;

/// Ochiai coefficient: `failed / sqrt((passed + failed) * total_failed)`
pub fn ochiai(failed: u32, passed: u32, total_failed: u32) -> f64 {
    let executed = failed as f64 + passed as f64;
    let denominator = (executed * total_failed as f64).sqrt();
    if denominator == 0.0 {
        return 0.0;
    }
    failed as f64 / denominator
}

/// Confidence in an attribution given how often the pack was observed
pub fn attribution_confidence(samples: u32) -> f64 {
    1.0 - (-(samples as f64) / CONFIDENCE_SCALE).exp()
}

/// Pass/fail counts for one pack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spectrum {
    pub failed: u32,
    pub passed: u32,
}

impl Spectrum {
    pub fn samples(&self) -> u32 {
        self.failed + self.passed
    }
}

/// Per-pack spectra and the number of failing outcomes
pub fn spectra(history: &[OutcomeRecord]) -> (BTreeMap<String, Spectrum>, u32) {
    let mut spectra: BTreeMap<String, Spectrum> = BTreeMap::new();
    let mut total_failed = 0;
    for outcome in history {
        if !outcome.success {
            total_failed += 1;
        }
        for pack_id in &outcome.pack_ids {
            let entry = spectra.entry(pack_id.clone()).or_default();
            if outcome.success {
                entry.passed += 1;
            } else {
                entry.failed += 1;
            }
        }
    }
    (spectra, total_failed)
}

/// A pack scored against a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suspect {
    pub pack_id: String,
    pub score: f64,
    pub failed: u32,
    pub passed: u32,
    /// Grows with the number of observations
    pub confidence: f64,
    /// Score at or above the suspicion threshold
    pub flagged: bool,
}

/// Attribution of one failed outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub outcome_id: String,
    /// Packs of the outcome, most suspicious first
    pub suspects: Vec<Suspect>,
    pub total_failed: u32,
    pub caveats: Vec<String>,
}

impl Attribution {
    /// Pack ids at or above the suspicion threshold
    pub fn flagged(&self) -> Vec<&str> {
        self.suspects
            .iter()
            .filter(|s| s.flagged)
            .map(|s| s.pack_id.as_str())
            .collect()
    }
}

/// Score every pack of a failed outcome against the outcome history
///
/// The outcome itself counts towards the spectra when the history does not
/// already contain it.
pub fn attribute(outcome: &OutcomeRecord, history: &[OutcomeRecord], threshold: f64) -> Attribution {
    let mut attribution = Attribution {
        outcome_id: outcome.id.clone(),
        ..Attribution::default()
    };

    if outcome.success {
        attribution
            .caveats
            .push("Outcome succeeded; nothing to attribute".to_string());
        return attribution;
    }
    if outcome.pack_ids.is_empty() {
        attribution
            .caveats
            .push("Outcome used no context packs".to_string());
        return attribution;
    }

    let known: HashSet<&str> = history.iter().map(|o| o.id.as_str()).collect();
    let (spectra, total_failed) = if known.contains(outcome.id.as_str()) {
        spectra(history)
    } else {
        let mut all = history.to_vec();
        all.push(outcome.clone());
        spectra(&all)
    };
    attribution.total_failed = total_failed;

    let mut suspects: Vec<Suspect> = outcome
        .pack_ids
        .iter()
        .map(|pack_id| {
            let spectrum = spectra.get(pack_id).copied().unwrap_or_default();
            let score = ochiai(spectrum.failed, spectrum.passed, total_failed);
            Suspect {
                pack_id: pack_id.clone(),
                score,
                failed: spectrum.failed,
                passed: spectrum.passed,
                confidence: attribution_confidence(spectrum.samples()),
                flagged: score >= threshold,
            }
        })
        .collect();

    suspects.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pack_id.cmp(&b.pack_id))
    });

    if suspects.iter().all(|s| !s.flagged) {
        attribution
            .caveats
            .push(format!("No pack reached the suspicion threshold of {:.2}", threshold));
    }
    if suspects.iter().any(|s| s.failed + s.passed < 3) {
        attribution
            .caveats
            .push("Some packs have fewer than 3 observations".to_string());
    }

    attribution.suspects = suspects;
    attribution
}
