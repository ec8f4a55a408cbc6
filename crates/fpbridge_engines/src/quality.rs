#![forbid(unsafe_code)]

use fpbridge_kernel_contracts::enrollment::QualityScore;
use fpbridge_kernel_contracts::ContractViolation;

/// Template length treated as "full quality" for the ZK-family templates the bridge ships with.
pub const DEFAULT_REFERENCE_SIZE: usize = 500;

/// Byte-density quality heuristic.
///
/// `score = floor(density * min(size / reference, 1) * 100)` where `density` is the share of
/// non-zero bytes. Sparse captures and truncated templates both pull the score down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityScorer {
    reference_size: usize,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self {
            reference_size: DEFAULT_REFERENCE_SIZE,
        }
    }
}

impl QualityScorer {
    pub fn with_reference_size(reference_size: usize) -> Result<Self, ContractViolation> {
        if reference_size == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "quality.reference_size",
                reason: "must be > 0",
            });
        }
        Ok(Self { reference_size })
    }

    pub fn reference_size(&self) -> usize {
        self.reference_size
    }

    pub fn score(&self, template: &[u8]) -> QualityScore {
        if template.is_empty() {
            return QualityScore::ZERO;
        }
        let nonzero = template.iter().filter(|b| **b != 0).count() as u64;
        // density * size_factor collapses to nonzero / max(size, reference).
        let denominator = template.len().max(self.reference_size) as u64;
        QualityScore::saturating(nonzero * 100 / denominator)
    }

    /// Arithmetic mean of the per-attempt scores, rounded down.
    pub fn composite(scores: &[QualityScore]) -> QualityScore {
        if scores.is_empty() {
            return QualityScore::ZERO;
        }
        let sum: u64 = scores.iter().map(|s| u64::from(s.value())).sum();
        QualityScore::saturating(sum / scores.len() as u64)
    }
}
