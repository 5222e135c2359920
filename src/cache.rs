//! Inversion cache and the reuse/recompute decision.
//!
//! An inversion is reusable while the model and the source it was computed
//! from are unchanged.
//! [`decide`] is a pure function so the whole table is testable without a
//! model.

use std::fmt;
use std::sync::Arc;

use crate::config::ModelId;
use crate::inversion::Trajectory;

/// What an inversion result was computed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InversionKey {
    pub model_id: ModelId,
    /// SHA-256 of the source audio file.
    pub fingerprint: String,
    pub source_prompt: String,
    pub steps: usize,
    /// Source guidance scale, stored as bits so the key stays `Eq`.
    cfg_scale_bits: u64,
    /// Seed the forward noise was drawn with. Not part of the reuse check.
    pub seed: u64,
}

impl InversionKey {
    pub fn new(
        model_id: ModelId,
        fingerprint: impl Into<String>,
        source_prompt: impl Into<String>,
        steps: usize,
        cfg_scale_src: f64,
        seed: u64,
    ) -> Self {
        Self {
            model_id,
            fingerprint: fingerprint.into(),
            source_prompt: source_prompt.into(),
            steps,
            cfg_scale_bits: cfg_scale_src.to_bits(),
            seed,
        }
    }

    pub fn cfg_scale_src(&self) -> f64 {
        f64::from_bits(self.cfg_scale_bits)
    }

    /// True when the inputs that define the source differ.
    fn source_differs(&self, other: &Self) -> bool {
        self.fingerprint != other.fingerprint
            || self.source_prompt != other.source_prompt
            || self.steps != other.steps
            || self.cfg_scale_bits != other.cfg_scale_bits
    }
}

/// Why an inversion is being recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeReason {
    NoCache,
    RedoRequested,
    ModelChanged,
    SourceChanged,
    RandomizedSeed,
}

impl fmt::Display for RecomputeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NoCache => "no cached inversion",
            Self::RedoRequested => "redo requested",
            Self::ModelChanged => "model changed",
            Self::SourceChanged => "source changed",
            Self::RandomizedSeed => "seed randomized",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InversionDecision {
    Reuse,
    Recompute(RecomputeReason),
}

/// Decide whether the cached inversion (if any) can serve `next`.
///
/// | model changed | redo | randomize | action    |
/// |---------------|------|-----------|-----------|
/// | any           | yes  | any       | recompute |
/// | yes           | no   | any       | recompute |
/// | no            | no   | yes       | recompute |
/// | no            | no   | no        | reuse     |
///
/// A missing cache or a differing source counts as redo. The seed only
/// matters when inversion runs, so a new explicit seed alone reuses the cache
/// and the cached seed stays in effect.
pub fn decide(
    cached: Option<&InversionKey>,
    next: &InversionKey,
    redo: bool,
    randomize_seed: bool,
) -> InversionDecision {
    use InversionDecision::{Recompute, Reuse};

    let Some(cached) = cached else {
        return Recompute(RecomputeReason::NoCache);
    };
    if redo {
        return Recompute(RecomputeReason::RedoRequested);
    }
    if cached.source_differs(next) {
        return Recompute(RecomputeReason::SourceChanged);
    }
    if cached.model_id != next.model_id {
        return Recompute(RecomputeReason::ModelChanged);
    }
    if randomize_seed {
        return Recompute(RecomputeReason::RandomizedSeed);
    }
    Reuse
}

/// A trajectory and the key it was computed under.
#[derive(Debug, Clone)]
pub struct CachedInversion {
    pub key: InversionKey,
    pub trajectory: Arc<Trajectory>,
}
