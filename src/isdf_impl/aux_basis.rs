//! Auxiliary basis: least-squares fit of every grid point's pair density
//! onto the pair densities at the interpolation points.
//!
//! With `G_t` the orbitals of the home cell at the IPs of cell `t` and `F_t`
//! the same orbitals on all points of cell `t`, the normal equations are
//! block-circulant with first block row
//!
//! ```text
//! A_t = (Σ_e G_e^T G_{t+e})^∘2,   B_t = (Σ_e G_e^T F_{t+e})^∘2
//! ```
//!
//! A DFT over `t` splits `A X = B` into one Hermitian solve per momentum.
//! With atom groups configured, each group is instead fitted on the grid
//! points it owns ([`AuxBasisBuilder::build_local`]).

use super::ip_select::IpSet;
use super::partition::{GridPartition, OrbitalGrid};
use super::IsdfSettings;
use crate::arena::ScratchArena;
use crate::backend::{LinearSolver, TransformBackend};
use crate::error::{BuildReport, IsdfError, Result};
use crate::lattice::{Lattice, LatticeIndex};
use nalgebra::{ComplexField, DMatrix};
use num_complex::Complex64;
use rayon::prelude::*;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AuxBasis {
    /// nIP x ngrid in ordered layout: the function of home-cell IP `i`
    /// at every supercell point.
    pub values: DMatrix<f64>,
    /// Largest backward error of the normal-equation solves.
    pub residual: f64,
    /// Group-local fits only: the sorted supercell points each row may be
    /// nonzero on. `None` means every row spans the whole supercell.
    pub support: Option<Vec<Vec<usize>>>,
}

impl AuxBasis {
    pub fn nip(&self) -> usize {
        self.values.nrows()
    }

    /// Block `X_t`: columns of cell `t`.
    pub fn block(&self, lattice: &Lattice, t: usize) -> DMatrix<f64> {
        let ngp = lattice.ngrid_prim();
        self.values.columns(t * ngp, ngp).into_owned()
    }

    pub fn is_local(&self) -> bool {
        self.support.is_some()
    }
}

/// `G_t` for every translation `t`: home-cell orbitals at the IPs of cell `t`.
pub fn ip_orbital_blocks(lattice: &Lattice, grid: &OrbitalGrid, ip_set: &IpSet) -> Vec<DMatrix<f64>> {
    let f = grid.prim_values();
    lattice
        .translations()
        .map(|t| {
            let cols: Vec<usize> = ip_set
                .prim_points()
                .iter()
                .map(|&p| lattice.ordered_index(t, p))
                .collect();
            f.select_columns(cols.iter())
        })
        .collect()
}

/// `F_t` for every translation `t`: home-cell orbitals on the points of cell `t`.
pub fn grid_blocks(lattice: &Lattice, grid: &OrbitalGrid) -> Vec<DMatrix<f64>> {
    let ngp = lattice.ngrid_prim();
    (0..lattice.ncell())
        .map(|t| grid.prim_values().columns(t * ngp, ngp).into_owned())
        .collect()
}

/// `C_t = Σ_e L_e^T R_{t+e}` for every translation `t`.
pub fn translation_products(
    lattice: &Lattice,
    left: &[DMatrix<f64>],
    right: &[DMatrix<f64>],
) -> Vec<DMatrix<f64>> {
    let translations: Vec<LatticeIndex> = lattice.translations().collect();
    let (rows, cols) = (left[0].ncols(), right[0].ncols());
    translations
        .par_iter()
        .map(|&t| {
            let mut acc = DMatrix::zeros(rows, cols);
            for &e in &translations {
                acc.gemm_tr(1.0, &left[e.flatten()], &right[(t + e).flatten()], 1.0);
            }
            acc
        })
        .collect()
}

pub fn max_norm(m: &DMatrix<Complex64>) -> f64 {
    m.iter().map(|z| z.norm()).fold(0.0, f64::max)
}

/// Largest `|M - M^H|` relative to the largest entry.
pub fn hermitian_deviation(m: &DMatrix<Complex64>) -> f64 {
    let scale = max_norm(m);
    if scale == 0.0 {
        return 0.0;
    }
    max_norm(&(m - m.adjoint())) / scale
}

/// Normwise backward error `|AX - B| / (|A| |X| + |B|)` in the Frobenius norm.
pub fn solve_residual<T: ComplexField<RealField = f64>>(
    a: &DMatrix<T>,
    x: &DMatrix<T>,
    b: &DMatrix<T>,
) -> f64 {
    let scale = a.norm() * x.norm() + b.norm();
    if scale == 0.0 {
        return 0.0;
    }
    (a * x - b).norm() / scale
}

pub struct AuxBasisBuilder<'a> {
    settings: &'a IsdfSettings,
    solver: &'a dyn LinearSolver,
    transform: &'a dyn TransformBackend,
}

impl<'a> AuxBasisBuilder<'a> {
    pub fn new(
        settings: &'a IsdfSettings,
        solver: &'a dyn LinearSolver,
        transform: &'a dyn TransformBackend,
    ) -> Self {
        Self {
            settings,
            solver,
            transform,
        }
    }

    fn apply_cutoff(&self, mut x: DMatrix<f64>) -> DMatrix<f64> {
        let cutoff = self.settings.aux_cutoff;
        x.iter_mut().filter(|v| v.abs() < cutoff).for_each(|v| *v = 0.0);
        x
    }

    fn solve_real(&self, a: &DMatrix<f64>, b: &DMatrix<f64>, label: &str) -> Result<DMatrix<f64>> {
        match self.solver.solve_real_spd(a, b, label) {
            Err(err @ IsdfError::SolveFailure { .. }) if self.settings.eigen_fallback => {
                warn!("{}; retrying with eigen decomposition", err);
                self.solver
                    .solve_real_eigen(a, b, self.settings.eigen_cutoff, label)
            }
            other => other,
        }
    }

    fn solve_momentum(
        &self,
        a: &DMatrix<Complex64>,
        b: &DMatrix<Complex64>,
        k: LatticeIndex,
    ) -> Result<DMatrix<Complex64>> {
        let label = format!("aux k={:?}", k.components());
        match self.solver.solve_hermitian(a, b, &label) {
            Err(err @ IsdfError::SolveFailure { .. }) if self.settings.eigen_fallback => {
                warn!("{}; retrying with eigen decomposition", err);
                self.solver
                    .solve_hermitian_eigen(a, b, self.settings.eigen_cutoff, &label)
            }
            other => other,
        }
    }

    /// Dense real solve with the given orbital values at the IPs and on
    /// the grid. Every row of `aorg`/`aor` is one orbital. Returns the fit
    /// and its residual.
    fn solve_dense(&self, aorg: &DMatrix<f64>, aor: &DMatrix<f64>, label: &str) -> Result<(DMatrix<f64>, f64)> {
        let a = (aorg.transpose() * aorg).map(|x| x * x);
        let b = (aorg.transpose() * aor).map(|x| x * x);
        let x = self.solve_real(&a, &b, label)?;
        let residual = solve_residual(&a, &x, &b);
        Ok((x, residual))
    }

    fn check_residual(&self, residual: f64, report: &mut BuildReport) -> Result<()> {
        report.max_aux_residual = report.max_aux_residual.max(residual);
        if residual > self.settings.symmetry_tolerance {
            report.record(
                IsdfError::SymmetryViolation {
                    context: "auxiliary basis solve residual".to_string(),
                    deviation: residual,
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
        grid: &OrbitalGrid,
        ip_set: &IpSet,
        arena: &mut ScratchArena,
        report: &mut BuildReport,
    ) -> Result<AuxBasis> {
        if ip_set.is_empty() {
            return Err(IsdfError::DimensionMismatch(
                "no interpolation points selected".to_string(),
            ));
        }
        if lattice.ncell() == 1 {
            return self.build_direct(lattice, grid, ip_set, report);
        }

        let now = Instant::now();
        let nip = ip_set.len();
        let ngp = lattice.ngrid_prim();
        let g = ip_orbital_blocks(lattice, grid, ip_set);
        let f = grid_blocks(lattice, grid);
        let square = |blocks: Vec<DMatrix<f64>>| -> Vec<DMatrix<f64>> {
            blocks.into_iter().map(|m| m.map(|x| x * x)).collect()
        };
        let a_blocks = square(translation_products(lattice, &g, &g));
        let b_blocks = square(translation_products(lattice, &g, &f));

        arena.reserve(lattice.ncell() * nip * nip.max(ngp));
        let a_hat = lattice.forward_translation(self.transform, &mut arena.frame(), &a_blocks)?;
        let b_hat = lattice.forward_translation(self.transform, &mut arena.frame(), &b_blocks)?;

        let momenta = lattice.half_spectrum();
        info!(
            "Solving {} of {} momentum blocks of size {}",
            momenta.len(),
            lattice.ncell(),
            nip
        );
        let solved = momenta
            .par_iter()
            .map(|k| -> Result<(DMatrix<Complex64>, f64)> {
                let (ak, bk) = (&a_hat[k.flatten()], &b_hat[k.flatten()]);
                let xk = self.solve_momentum(ak, bk, *k)?;
                let residual = solve_residual(ak, &xk, bk);
                Ok((xk, residual))
            })
            .collect::<Result<Vec<_>>>()?;
        let residual = solved.iter().map(|(_, r)| *r).fold(0.0, f64::max);
        self.check_residual(residual, report)?;

        let spectrum = lattice.assemble_spectrum(solved.into_iter().map(|(xk, _)| xk).collect())?;
        let x_blocks = lattice.inverse_translation(self.transform, &mut arena.frame(), &spectrum)?;

        let mut values = DMatrix::zeros(nip, lattice.ngrid());
        for (t, block) in x_blocks.iter().enumerate() {
            values.columns_mut(t * ngp, ngp).copy_from(block);
        }
        info!("Auxiliary basis built in {:.2?}", now.elapsed());
        Ok(AuxBasis {
            values: self.apply_cutoff(values),
            residual,
            support: None,
        })
    }

    /// Single-cell path: one real solve, no translation transform.
    pub fn build_direct(
        &self,
        lattice: &Lattice,
        grid: &OrbitalGrid,
        ip_set: &IpSet,
        report: &mut BuildReport,
    ) -> Result<AuxBasis> {
        let g = ip_orbital_blocks(lattice, grid, ip_set);
        let (x, residual) = self.solve_dense(&g[0], grid.prim_values(), "aux direct")?;
        self.check_residual(residual, report)?;
        Ok(AuxBasis {
            values: self.apply_cutoff(x),
            residual,
            support: None,
        })
    }

    /// Group-local fit. The IPs of each atom group in the home cell are
    /// fitted only on the grid points that group owns, then every row is
    /// moved back to its home-cell IP.
    pub fn build_local(
        &self,
        lattice: &Lattice,
        grid: &OrbitalGrid,
        partition: &GridPartition,
        ip_set: &IpSet,
        groups: &[Vec<usize>],
        report: &mut BuildReport,
    ) -> Result<AuxBasis> {
        if ip_set.is_empty() {
            return Err(IsdfError::DimensionMismatch(
                "no interpolation points selected".to_string(),
            ));
        }
        if groups.len() != ip_set.groups().len() {
            return Err(IsdfError::DimensionMismatch(format!(
                "{} atom groups for {} IP groups",
                groups.len(),
                ip_set.groups().len()
            )));
        }

        let now = Instant::now();
        let aos: Vec<usize> = (0..lattice.ncell() * grid.nao_prim()).collect();
        let fits = groups
            .par_iter()
            .zip(ip_set.groups().par_iter())
            .enumerate()
            .filter(|(_, (_, rows))| !rows.is_empty())
            .map(|(g, (atoms, rows))| -> Result<_> {
                let shifts: Vec<LatticeIndex> = rows
                    .iter()
                    .map(|&i| partition.home_image(ip_set.prim_points()[i]))
                    .collect();
                let ips: Vec<usize> = rows
                    .iter()
                    .zip(&shifts)
                    .map(|(&i, &s)| lattice.ordered_index(s, ip_set.prim_points()[i]))
                    .collect();
                let mut sector: Vec<usize> = atoms
                    .iter()
                    .flat_map(|&a| partition.points_of(lattice, a))
                    .collect();
                sector.sort_unstable();

                let aorg = grid.block(lattice, &aos, &ips);
                let aor = grid.block(lattice, &aos, &sector);
                let (x, residual) = self.solve_dense(&aorg, &aor, &format!("aux group {}", g))?;
                Ok((rows, shifts, sector, x, residual))
            })
            .collect::<Result<Vec<_>>>()?;

        let nip = ip_set.len();
        let mut values = DMatrix::zeros(nip, lattice.ngrid());
        let mut support = vec![Vec::new(); nip];
        let mut residual = 0.0f64;
        for (rows, shifts, sector, x, group_residual) in fits {
            residual = residual.max(group_residual);
            for (r, (&i, &s)) in rows.iter().zip(&shifts).enumerate() {
                let mut points: Vec<usize> = sector.iter().map(|&o| lattice.translate_point(o, -s)).collect();
                for (col, &o) in points.iter().enumerate() {
                    values[(i, o)] = x[(r, col)];
                }
                points.sort_unstable();
                support[i] = points;
            }
        }
        self.check_residual(residual, report)?;

        info!(
            "Group-local auxiliary basis built for {} groups in {:.2?}",
            groups.len(),
            now.elapsed()
        );
        Ok(AuxBasis {
            values: self.apply_cutoff(values),
            residual,
            support: Some(support),
        })
    }

    /// Reference solve on the full supercell system, ignoring symmetry.
    pub fn build_brute_force(&self, lattice: &Lattice, grid: &OrbitalGrid, ip_set: &IpSet) -> Result<AuxBasis> {
        let aor = grid.full(lattice);
        let aorg = aor.select_columns(ip_set.supercell_points(lattice).iter());
        let (x, residual) = self.solve_dense(&aorg, &aor, "aux brute force")?;
        Ok(AuxBasis {
            values: self.apply_cutoff(x.rows(0, ip_set.len()).into_owned()),
            residual,
            support: None,
        })
    }
}
