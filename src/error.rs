//! Error kinds raised while building the ISDF caches or contracting J/K.
//!
//! `RankDeficiency` and (outside strict mode) `SymmetryViolation` are
//! recorded into a [`BuildReport`] and never stop sibling blocks.
//! `SolveFailure` and `DimensionMismatch` abort the build.

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IsdfError {
    #[error("rank deficiency for atom group {group}: achieved rank {rank} below floor {floor}")]
    RankDeficiency {
        group: usize,
        rank: usize,
        floor: usize,
    },

    #[error("linear solve failed for block {block}: {reason}")]
    SolveFailure { block: String, reason: String },

    #[error("symmetry violation in {context}: deviation {deviation:.3e} exceeds tolerance {tolerance:.3e}")]
    SymmetryViolation {
        context: String,
        deviation: f64,
        tolerance: f64,
    },

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("ISDF caches are not built; call build() before contracting J/K")]
    NotBuilt,
}

pub type Result<T> = std::result::Result<T, IsdfError>;

impl IsdfError {
    pub fn is_fatal(&self, strict: bool) -> bool {
        match self {
            IsdfError::RankDeficiency { .. } => false,
            IsdfError::SymmetryViolation { .. } => strict,
            _ => true,
        }
    }
}

/// Non-fatal diagnostics collected during a build.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub diagnostics: Vec<IsdfError>,
    pub max_aux_residual: f64,
    pub max_metric_asymmetry: f64,
}

impl BuildReport {
    /// Record a diagnostic. Returns it back as an error when it is fatal
    /// under the current strictness.
    pub fn record(&mut self, err: IsdfError, strict: bool) -> Result<()> {
        if err.is_fatal(strict) {
            return Err(err);
        }
        warn!("{}", err);
        self.diagnostics.push(err);
        Ok(())
    }

    pub fn rank_deficiencies(&self) -> impl Iterator<Item = &IsdfError> {
        self.diagnostics
            .iter()
            .filter(|e| matches!(e, IsdfError::RankDeficiency { .. }))
    }

    pub fn symmetry_violations(&self) -> impl Iterator<Item = &IsdfError> {
        self.diagnostics
            .iter()
            .filter(|e| matches!(e, IsdfError::SymmetryViolation { .. }))
    }
}
