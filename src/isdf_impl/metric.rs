//! Coulomb metric `W` between auxiliary basis functions.
//!
//! Each translation-Fourier component `X̂(k)` of the auxiliary basis is
//! convolved with the kernel on the primitive mesh. The supercell frequency
//! `q * kmesh + k` is reached through the phase `exp(-2πi k·p/n)` applied
//! before the forward FFT and removed after the inverse. Then
//! `Ŵ(k) = X̂(k) V̂(k)^H`, and an inverse translation DFT gives `W_t`.

use super::aux_basis::{hermitian_deviation, AuxBasis};
use super::IsdfSettings;
use crate::arena::ScratchArena;
use crate::backend::TransformBackend;
use crate::error::{BuildReport, IsdfError, Result};
use crate::lattice::Lattice;
use nalgebra::DMatrix;
use num_complex::Complex64;
use rayon::prelude::*;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone)]
pub struct MetricTensor {
    /// `W_t` (nIP x nIP): home-cell IP `i` against IP `j` of cell `t`.
    pub blocks: Vec<DMatrix<f64>>,
    /// `Σ_t W_t`.
    pub w0: DMatrix<f64>,
    /// Kernel-convolved auxiliary basis (nIP x ngrid), kept for robust fitting.
    pub v: Option<DMatrix<f64>>,
    /// Largest relative deviation from Hermiticity over momenta.
    pub hermiticity: f64,
}

impl MetricTensor {
    fn from_blocks(blocks: Vec<DMatrix<f64>>, v: Option<DMatrix<f64>>, hermiticity: f64) -> Self {
        let w0 = blocks
            .iter()
            .fold(DMatrix::zeros(blocks[0].nrows(), blocks[0].ncols()), |acc, b| acc + b);
        Self {
            blocks,
            w0,
            v,
            hermiticity,
        }
    }

    /// `W[home IPs, supercell IPs]` as one nIP x (ncell nIP) matrix.
    pub fn dense(&self) -> DMatrix<f64> {
        let nip = self.w0.nrows();
        let mut w = DMatrix::zeros(nip, nip * self.blocks.len());
        for (t, block) in self.blocks.iter().enumerate() {
            w.columns_mut(t * nip, nip).copy_from(block);
        }
        w
    }
}

/// Largest `|W_t - W_{-t}^T|` relative to the largest entry.
fn block_asymmetry(lattice: &Lattice, blocks: &[DMatrix<f64>]) -> f64 {
    let scale = blocks.iter().map(|b| b.amax()).fold(0.0, f64::max);
    if scale == 0.0 {
        return 0.0;
    }
    lattice
        .translations()
        .map(|c| (&blocks[c.flatten()] - blocks[(-c).flatten()].transpose()).amax())
        .fold(0.0, f64::max)
        / scale
}

pub struct MetricBuilder<'a> {
    settings: &'a IsdfSettings,
    transform: &'a dyn TransformBackend,
}

impl<'a> MetricBuilder<'a> {
    pub fn new(settings: &'a IsdfSettings, transform: &'a dyn TransformBackend) -> Self {
        Self {
            settings,
            transform,
        }
    }

    fn check_kernel(&self, lattice: &Lattice, coulg: &[f64]) -> Result<()> {
        if coulg.len() != lattice.ngrid() {
            return Err(IsdfError::DimensionMismatch(format!(
                "Coulomb kernel has {} entries for a mesh of {} points",
                coulg.len(),
                lattice.ngrid()
            )));
        }
        Ok(())
    }

    /// Worker count, rows per worker and FFT scratch per worker for
    /// `nrows` transforms of `shape`.
    fn worker_layout(&self, nrows: usize, shape: [usize; 3]) -> (usize, usize, usize) {
        let nworkers = rayon::current_num_threads().clamp(1, nrows.max(1));
        let chunk = nrows.div_ceil(nworkers).max(1);
        (nworkers, chunk, self.transform.scratch_len(shape).max(1))
    }

    fn check_hermiticity(&self, deviation: f64, report: &mut BuildReport) -> Result<()> {
        report.max_metric_asymmetry = report.max_metric_asymmetry.max(deviation);
        if deviation > self.settings.symmetry_tolerance {
            report.record(
                IsdfError::SymmetryViolation {
                    context: "Coulomb metric".to_string(),
                    deviation,
                    tolerance: self.settings.symmetry_tolerance,
                },
                self.settings.strict,
            )?;
        }
        Ok(())
    }

    pub fn build(
        &self,
        lattice: &Lattice,
        aux: &AuxBasis,
        coulg: &[f64],
        arena: &mut ScratchArena,
        report: &mut BuildReport,
    ) -> Result<MetricTensor> {
        self.check_kernel(lattice, coulg)?;
        if lattice.ncell() == 1 {
            let metric = self.build_brute_force(lattice, aux, coulg)?;
            self.check_hermiticity(metric.hermiticity, report)?;
            return Ok(metric);
        }

        let now = Instant::now();
        let nip = aux.nip();
        let ngp = lattice.ngrid_prim();
        let mesh_prim = lattice.mesh_prim();
        let (nworkers, chunk, scratch_len) = self.worker_layout(nip, mesh_prim);
        arena.reserve((lattice.ncell() * nip * nip.max(ngp)).max(nip * ngp + nworkers * scratch_len));

        let x_blocks: Vec<DMatrix<f64>> = (0..lattice.ncell()).map(|t| aux.block(lattice, t)).collect();
        let x_hat = lattice.forward_translation(self.transform, &mut arena.frame(), &x_blocks)?;

        let momenta = lattice.half_spectrum();
        let mut w_hat = Vec::with_capacity(momenta.len());
        let mut v_hat = Vec::with_capacity(momenta.len());
        let mut hermiticity = 0.0f64;

        for k in &momenta {
            let xk = &x_hat[k.flatten()];
            let phase = lattice.momentum_phase(*k);
            let kernel: Vec<f64> = lattice
                .folded_frequencies(*k)
                .into_iter()
                .map(|g| coulg[g])
                .collect();

            let mut frame = arena.frame();
            let rows = frame.acquire(nip * ngp)?;
            let scratch = frame.acquire(nworkers * scratch_len)?;
            rows.par_chunks_mut(chunk * ngp)
                .zip(scratch.par_chunks_mut(scratch_len))
                .enumerate()
                .try_for_each(|(w, (block, scratch))| -> Result<()> {
                    for (r, row) in block.chunks_mut(ngp).enumerate() {
                        let i = w * chunk + r;
                        for (p, z) in row.iter_mut().enumerate() {
                            *z = xk[(i, p)] * phase[p];
                        }
                        self.transform.forward_3d_with_scratch(row, mesh_prim, scratch)?;
                        row.iter_mut().zip(kernel.iter()).for_each(|(z, c)| *z *= *c);
                        self.transform.inverse_3d_with_scratch(row, mesh_prim, scratch)?;
                        row.iter_mut().zip(phase.iter()).for_each(|(z, ph)| *z *= ph.conj());
                    }
                    Ok(())
                })?;

            let vk = DMatrix::from_fn(nip, ngp, |i, p| rows[i * ngp + p]);
            let wk = xk * vk.adjoint();
            hermiticity = hermiticity.max(hermitian_deviation(&wk));
            w_hat.push(wk);
            if self.settings.robust_fitting {
                v_hat.push(vk);
            }
        }
        self.check_hermiticity(hermiticity, report)?;

        let w_spectrum = lattice.assemble_spectrum(w_hat)?;
        let blocks = lattice.inverse_translation(self.transform, &mut arena.frame(), &w_spectrum)?;

        let v = if self.settings.robust_fitting {
            let v_spectrum = lattice.assemble_spectrum(v_hat)?;
            let v_blocks = lattice.inverse_translation(self.transform, &mut arena.frame(), &v_spectrum)?;
            let mut v = DMatrix::zeros(nip, lattice.ngrid());
            for (t, block) in v_blocks.iter().enumerate() {
                v.columns_mut(t * ngp, ngp).copy_from(block);
            }
            Some(v)
        } else {
            None
        };

        info!(
            "Coulomb metric built in {:.2?}, max Hermiticity deviation {:.3e}",
            now.elapsed(),
            hermiticity
        );
        Ok(MetricTensor::from_blocks(blocks, v, hermiticity))
    }

    /// Metric of a group-local auxiliary basis. Each row is convolved on
    /// the full supercell mesh, and `W_t[i, j]` only sums over the support
    /// of row `i`.
    pub fn build_local(
        &self,
        lattice: &Lattice,
        aux: &AuxBasis,
        coulg: &[f64],
        arena: &mut ScratchArena,
        report: &mut BuildReport,
    ) -> Result<MetricTensor> {
        self.check_kernel(lattice, coulg)?;
        let support = aux.support.as_ref().ok_or_else(|| {
            IsdfError::DimensionMismatch("auxiliary basis carries no row supports".to_string())
        })?;
        let now = Instant::now();
        let nip = aux.nip();
        let ngrid = lattice.ngrid();
        let mesh = lattice.mesh();
        let natural: Vec<usize> = (0..ngrid).map(|o| lattice.ordered_to_natural(o)).collect();
        let (nworkers, chunk, scratch_len) = self.worker_layout(nip, mesh);
        arena.reserve(nip * ngrid + nworkers * scratch_len);

        let mut frame = arena.frame();
        let rows = frame.acquire(nip * ngrid)?;
        let scratch = frame.acquire(nworkers * scratch_len)?;
        rows.par_chunks_mut(chunk * ngrid)
            .zip(scratch.par_chunks_mut(scratch_len))
            .enumerate()
            .try_for_each(|(w, (block, scratch))| -> Result<()> {
                for (r, row) in block.chunks_mut(ngrid).enumerate() {
                    let i = w * chunk + r;
                    for &o in &support[i] {
                        row[natural[o]] = Complex64::new(aux.values[(i, o)], 0.0);
                    }
                    self.transform.forward_3d_with_scratch(row, mesh, scratch)?;
                    row.iter_mut().zip(coulg.iter()).for_each(|(z, c)| *z *= *c);
                    self.transform.inverse_3d_with_scratch(row, mesh, scratch)?;
                }
                Ok(())
            })?;
        let v = DMatrix::from_fn(nip, ngrid, |i, o| rows[i * ngrid + natural[o]].re);

        let blocks: Vec<DMatrix<f64>> = lattice
            .translations()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|&t| {
                DMatrix::from_fn(nip, nip, |i, j| {
                    support[i]
                        .iter()
                        .map(|&o| aux.values[(i, o)] * v[(j, lattice.translate_point(o, -t))])
                        .sum()
                })
            })
            .collect();
        let hermiticity = block_asymmetry(lattice, &blocks);
        self.check_hermiticity(hermiticity, report)?;

        info!(
            "Group-local Coulomb metric built in {:.2?}, max Hermiticity deviation {:.3e}",
            now.elapsed(),
            hermiticity
        );
        let v = self.settings.robust_fitting.then_some(v);
        Ok(MetricTensor::from_blocks(blocks, v, hermiticity))
    }

    /// Reference construction: full supercell FFT of every auxiliary
    /// function, `W = X V^T` over the whole grid.
    pub fn build_brute_force(&self, lattice: &Lattice, aux: &AuxBasis, coulg: &[f64]) -> Result<MetricTensor> {
        self.check_kernel(lattice, coulg)?;
        let nip = aux.nip();
        let ngrid = lattice.ngrid();
        let mesh = lattice.mesh();
        let natural: Vec<usize> = (0..ngrid).map(|o| lattice.ordered_to_natural(o)).collect();

        let v_rows = (0..nip)
            .into_par_iter()
            .map(|i| -> Result<Vec<f64>> {
                let mut buf = vec![Complex64::default(); ngrid];
                for (o, &n) in natural.iter().enumerate() {
                    buf[n] = Complex64::new(aux.values[(i, o)], 0.0);
                }
                self.transform.forward_3d(&mut buf, mesh)?;
                buf.iter_mut().zip(coulg.iter()).for_each(|(z, c)| *z *= *c);
                self.transform.inverse_3d(&mut buf, mesh)?;
                Ok(natural.iter().map(|&n| buf[n].re).collect())
            })
            .collect::<Result<Vec<_>>>()?;
        let v = DMatrix::from_fn(nip, ngrid, |i, o| v_rows[i][o]);

        let blocks: Vec<DMatrix<f64>> = lattice
            .translations()
            .map(|c| {
                let moved: Vec<usize> = (0..ngrid).map(|o| lattice.translate_point(o, -c)).collect();
                let vc = v.select_columns(moved.iter());
                &aux.values * vc.transpose()
            })
            .collect();

        let hermiticity = block_asymmetry(lattice, &blocks);
        let v = self.settings.robust_fitting.then_some(v);
        Ok(MetricTensor::from_blocks(blocks, v, hermiticity))
    }
}
