use crate::error::IsdfError;
use crate::isdf_impl::IsdfEngine;
use crate::orbitals::GridEvaluator;
use color_eyre::eyre::Result;
use tracing::{info, warn};

/// Energies of the guess density and the optional reference comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct JkSummary {
    pub nip: usize,
    pub nao: usize,
    pub electrons: f64,
    pub coulomb_energy: f64,
    pub exchange_energy: f64,
    pub reference_errors: Option<(f64, f64)>,
}

pub fn report_build_summary<E: GridEvaluator>(engine: &IsdfEngine<E>) -> Result<()> {
    info!("ISDF build finished.");
    let ip_set = engine.ip_set()?;
    let partition = engine.partition()?;
    info!(
        "  {} interpolation points per cell, {} in the supercell",
        ip_set.len(),
        ip_set.len() * engine.lattice().ncell()
    );
    for (atom, count) in partition.counts().iter().enumerate() {
        let nip = ip_set.owners().iter().filter(|&&a| a == atom).count();
        info!("  Atom {:>3}: {:>6} grid points, {:>4} IPs", atom + 1, count, nip);
    }

    let report = engine.report();
    info!("  Max auxiliary basis solve residual: {:.3e}", report.max_aux_residual);
    info!("  Max metric asymmetry: {:.3e}", report.max_metric_asymmetry);
    for diagnostic in &report.diagnostics {
        match diagnostic {
            IsdfError::RankDeficiency { .. } => warn!("  Rank: {}", diagnostic),
            _ => warn!("  Symmetry: {}", diagnostic),
        }
    }
    info!("  Scratch arena: {} complex elements", engine.arena_capacity());
    Ok(())
}

pub fn report_jk_summary(summary: &JkSummary) {
    info!("J/K contraction of the atomic guess density:");
    info!("  Electrons: {:.6}", summary.electrons);
    info!("  Coulomb energy: {:.10} au", summary.coulomb_energy);
    info!("  Exchange energy: {:.10} au", summary.exchange_energy);
    if let Some((j_err, k_err)) = summary.reference_errors {
        info!("  Relative J error vs full supercell: {:.3e}", j_err);
        info!("  Relative K error vs full supercell: {:.3e}", k_err);
    }
}
