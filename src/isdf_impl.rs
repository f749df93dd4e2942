//! Interpolative separable density fitting on a translation-symmetric
//! supercell.
//!
//! The pipeline runs grid partition, interpolation-point selection, the
//! auxiliary basis solve and the Coulomb metric once per geometry, then
//! contracts density matrices into J and K as often as needed. Every
//! supercell quantity is held as the first block row of a block-circulant
//! matrix and moved between real and momentum space with a DFT over the
//! lattice translations.

pub mod aux_basis;
mod engine;
pub mod ip_select;
pub mod jk;
pub mod metric;
pub mod partition;

#[cfg(test)]
mod tests;

pub use aux_basis::{AuxBasis, AuxBasisBuilder};
pub use engine::IsdfEngine;
pub use ip_select::{IpSelector, IpSet, SelectionParams};
pub use jk::{atomic_guess_density, pack_blocks, symmetrize_density, JkContractor};
pub use metric::{MetricBuilder, MetricTensor};
pub use partition::{AtomGridBlock, GridPartition, OrbitalGrid, PartitionPolicy};

/// Tunables shared by every build stage.
#[derive(Debug, Clone, PartialEq)]
pub struct IsdfSettings {
    pub partition: PartitionPolicy,
    pub selection: SelectionParams,
    /// Auxiliary basis entries below this magnitude are zeroed.
    pub aux_cutoff: f64,
    /// Relative tolerance of the solve-residual and Hermiticity checks.
    pub symmetry_tolerance: f64,
    /// Retry failed Cholesky solves through an eigen-decomposition.
    pub eigen_fallback: bool,
    pub eigen_cutoff: f64,
    /// Contract J/K with the robust-fitting correction, which needs the
    /// kernel-convolved auxiliary basis alongside W.
    pub robust_fitting: bool,
    /// Treat symmetry violations as fatal.
    pub strict: bool,
}

impl Default for IsdfSettings {
    fn default() -> Self {
        IsdfSettings {
            partition: PartitionPolicy::default(),
            selection: SelectionParams::default(),
            aux_cutoff: 1e-14,
            symmetry_tolerance: 1e-8,
            eigen_fallback: true,
            eigen_cutoff: 1e-18,
            robust_fitting: false,
            strict: false,
        }
    }
}
