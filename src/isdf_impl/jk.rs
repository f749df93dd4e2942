//! Coulomb (J) and exchange (K) contraction against the cached auxiliary
//! basis and metric.
//!
//! Supercell matrices are block-circulant over primitive-cell AO blocks:
//! block `(r, c)` equals block `(0, c - r)`, so only the first block row
//! is ever computed and [`pack_blocks`] rebuilds the rest.

use super::ip_select::IpSet;
use super::metric::MetricTensor;
use super::partition::OrbitalGrid;
use crate::arena::ScratchArena;
use crate::backend::TransformBackend;
use crate::error::{IsdfError, Result};
use crate::lattice::{Lattice, LatticeIndex};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use periodic_table_on_an_enum::Element;
use rayon::prelude::*;

fn check_square(lattice: &Lattice, nao_prim: usize, dm: &DMatrix<f64>) -> Result<()> {
    let n = lattice.ncell() * nao_prim;
    if dm.shape() != (n, n) {
        return Err(IsdfError::DimensionMismatch(format!(
            "density matrix {:?} does not match {} supercell orbitals",
            dm.shape(),
            n
        )));
    }
    Ok(())
}

/// First block row `D_t = D[(0), (t)]`.
pub fn first_row_blocks(lattice: &Lattice, nao_prim: usize, dm: &DMatrix<f64>) -> Result<Vec<DMatrix<f64>>> {
    check_square(lattice, nao_prim, dm)?;
    Ok((0..lattice.ncell())
        .map(|t| dm.view((0, t * nao_prim), (nao_prim, nao_prim)).into_owned())
        .collect())
}

/// Average every block over the lattice shifts that map it onto itself,
/// returning the first block row of the symmetrized matrix.
pub fn symmetrize_blocks(lattice: &Lattice, nao_prim: usize, dm: &DMatrix<f64>) -> Result<Vec<DMatrix<f64>>> {
    check_square(lattice, nao_prim, dm)?;
    let ncell = lattice.ncell();
    Ok(lattice
        .translations()
        .map(|s| {
            let sum = lattice.translations().fold(DMatrix::zeros(nao_prim, nao_prim), |acc, r| {
                let c = (r + s).flatten();
                acc + dm.view((r.flatten() * nao_prim, c * nao_prim), (nao_prim, nao_prim))
            });
            sum / ncell as f64
        })
        .collect())
}

/// Translation-averaged density matrix.
pub fn symmetrize_density(lattice: &Lattice, nao_prim: usize, dm: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    pack_blocks(lattice, &symmetrize_blocks(lattice, nao_prim, dm)?)
}

/// Block-circulant matrix whose block `(row, col)` is `blocks[col - row]`.
pub fn pack_blocks(lattice: &Lattice, blocks: &[DMatrix<f64>]) -> Result<DMatrix<f64>> {
    if blocks.len() != lattice.ncell() {
        return Err(IsdfError::DimensionMismatch(format!(
            "{} blocks for {} cells",
            blocks.len(),
            lattice.ncell()
        )));
    }
    let (br, bc) = blocks[0].shape();
    let ncell = lattice.ncell();
    let mut out = DMatrix::zeros(ncell * br, ncell * bc);
    for row in lattice.translations() {
        for col in lattice.translations() {
            let block = &blocks[(col - row).flatten()];
            out.view_mut((row.flatten() * br, col.flatten() * bc), (br, bc))
                .copy_from(block);
        }
    }
    Ok(out)
}

/// Valence electron count of a neutral atom.
pub fn valence_electrons(element: &Element) -> f64 {
    let z = element.get_atomic_number() as i64;
    let core = match z {
        0..=2 => 0,
        3..=10 => 2,
        11..=18 => 10,
        19..=36 => 18,
        37..=54 => 36,
        _ => 54,
    };
    (z - core) as f64
}

/// Diagonal atomic-guess density over the supercell: each atom's valence
/// electrons spread evenly over its orbitals.
pub fn atomic_guess_density(lattice: &Lattice, elements: &[Element], ao_atom: &[usize]) -> DMatrix<f64> {
    let nao_prim = ao_atom.len();
    let mut nao_atm = vec![0usize; elements.len()];
    for &a in ao_atom {
        nao_atm[a] += 1;
    }
    let occupations: Vec<f64> = ao_atom
        .iter()
        .map(|&a| valence_electrons(&elements[a]) / nao_atm[a] as f64)
        .collect();
    let diag = DVector::from_fn(lattice.ncell() * nao_prim, |i, _| occupations[i % nao_prim]);
    DMatrix::from_diagonal(&diag)
}

/// Contraction on the translation-symmetric representation.
///
/// With robust fitting the metric also carries `V`, and the contraction
/// adds the cross terms between the fitted and the exact pair densities:
/// `J = J[V ρ_R] + J_R[V^T ρ_IP] - J[W ρ_IP]` and `K = K_V + K_V^T - K_W`.
pub struct JkContractor<'a> {
    lattice: &'a Lattice,
    ip_orbitals: &'a [DMatrix<f64>],
    grid_orbitals: Option<&'a [DMatrix<f64>]>,
    metric: &'a MetricTensor,
    transform: &'a dyn TransformBackend,
}

impl<'a> JkContractor<'a> {
    pub fn new(
        lattice: &'a Lattice,
        ip_orbitals: &'a [DMatrix<f64>],
        metric: &'a MetricTensor,
        transform: &'a dyn TransformBackend,
    ) -> Self {
        Self {
            lattice,
            ip_orbitals,
            grid_orbitals: None,
            metric,
            transform,
        }
    }

    /// Home-cell orbitals on the points of every cell, needed for robust
    /// fitting.
    pub fn with_grid_orbitals(mut self, grid_orbitals: &'a [DMatrix<f64>]) -> Self {
        self.grid_orbitals = Some(grid_orbitals);
        self
    }

    fn nao_prim(&self) -> usize {
        self.ip_orbitals[0].nrows()
    }

    fn scale(&self) -> f64 {
        self.lattice.ngrid() as f64 / self.lattice.volume()
    }

    fn g(&self, t: LatticeIndex) -> &DMatrix<f64> {
        &self.ip_orbitals[t.flatten()]
    }

    /// `V` split into its per-cell blocks `V_t` and the grid orbitals, when
    /// the metric was built for robust fitting.
    fn robust_terms(&self) -> Result<Option<(Vec<DMatrix<f64>>, &'a [DMatrix<f64>])>> {
        let Some(v) = &self.metric.v else {
            return Ok(None);
        };
        let f = self.grid_orbitals.ok_or_else(|| {
            IsdfError::DimensionMismatch("robust fitting needs the grid orbitals".to_string())
        })?;
        let ngp = self.lattice.ngrid_prim();
        let v_blocks = (0..self.lattice.ncell())
            .map(|t| v.columns(t * ngp, ngp).into_owned())
            .collect();
        Ok(Some((v_blocks, f)))
    }

    /// `ρ_i = Σ_{μν} φ_μ(i) D_{μν} φ_ν(i)` on the home-cell columns of
    /// `orbitals`, given per cell as `orbitals[t]`.
    fn density_on(&self, orbitals: &[DMatrix<f64>], d_blocks: &[DMatrix<f64>]) -> DVector<f64> {
        let lattice = self.lattice;
        let translations: Vec<LatticeIndex> = lattice.translations().collect();
        let npoint = orbitals[0].ncols();
        let at = |t: LatticeIndex| &orbitals[t.flatten()];
        translations
            .par_iter()
            .map(|&d| {
                // Y_d = Σ_{d'} D_{d'-d} O_{-d'}
                let mut y = DMatrix::zeros(self.nao_prim(), npoint);
                for &dp in &translations {
                    y.gemm(1.0, &d_blocks[(dp - d).flatten()], at(-dp), 1.0);
                }
                let od = at(-d);
                DVector::from_fn(npoint, |i, _| od.column(i).dot(&y.column(i)))
            })
            .reduce(|| DVector::zeros(npoint), |a, b| a + b)
    }

    /// Density at the home-cell IPs.
    pub fn density_at_ips(&self, d_blocks: &[DMatrix<f64>]) -> DVector<f64> {
        self.density_on(self.ip_orbitals, d_blocks)
    }

    /// `Σ_c O_c diag(w) O_{c-q}^T` for every `q`, unscaled.
    fn weighted_products(&self, orbitals: &[DMatrix<f64>], w: &DVector<f64>) -> Vec<DMatrix<f64>> {
        let translations: Vec<LatticeIndex> = self.lattice.translations().collect();
        let at = |t: LatticeIndex| &orbitals[t.flatten()];
        translations
            .par_iter()
            .map(|&q| {
                let mut acc = DMatrix::zeros(self.nao_prim(), self.nao_prim());
                for &c in &translations {
                    let mut weighted = at(c).clone();
                    for (i, mut col) in weighted.column_iter_mut().enumerate() {
                        col *= w[i];
                    }
                    acc.gemm(1.0, &weighted, &at(c - q).transpose(), 1.0);
                }
                acc
            })
            .collect()
    }

    /// First block row of J for symmetrized density blocks.
    pub fn j_blocks(&self, d_blocks: &[DMatrix<f64>]) -> Result<Vec<DMatrix<f64>>> {
        let rho = self.density_at_ips(d_blocks);
        let scale = self.scale();
        let w = &self.metric.w0 * &rho;
        let mut j = self.weighted_products(self.ip_orbitals, &w);

        if let Some((v_blocks, f)) = self.robust_terms()? {
            let v0 = v_blocks.iter().skip(1).fold(v_blocks[0].clone(), |acc, b| acc + b);
            let rho_grid = self.density_on(f, d_blocks);
            let u = &v0 * rho_grid;
            let s = v0.transpose() * &rho;
            let j_ip = self.weighted_products(self.ip_orbitals, &u);
            let j_grid = self.weighted_products(f, &s);
            for ((jq, a), b) in j.iter_mut().zip(j_ip).zip(j_grid) {
                *jq = a + b - &*jq;
            }
        }
        Ok(j.into_iter().map(|b| b * scale).collect())
    }

    /// `L(k) ((L(k)^H D(k) R(k)) ∘ metric) R(k)^H` back in real space,
    /// with the elementwise product taken per translation block.
    fn sandwich(
        &self,
        left_hat: &[DMatrix<Complex64>],
        right_hat: &[DMatrix<Complex64>],
        d_hat: &[DMatrix<Complex64>],
        metric_blocks: &[DMatrix<f64>],
        arena: &mut ScratchArena,
    ) -> Result<Vec<DMatrix<f64>>> {
        let lattice = self.lattice;
        let momenta = lattice.half_spectrum();

        let m_hat: Vec<DMatrix<Complex64>> = momenta
            .par_iter()
            .map(|k| left_hat[k.flatten()].adjoint() * &d_hat[k.flatten()] * &right_hat[k.flatten()])
            .collect();
        let m_spectrum = lattice.assemble_spectrum(m_hat)?;
        let m_blocks = lattice.inverse_translation(self.transform, &mut arena.frame(), &m_spectrum)?;

        let n_blocks: Vec<DMatrix<f64>> = m_blocks
            .iter()
            .zip(metric_blocks.iter())
            .map(|(m, w)| m.component_mul(w))
            .collect();
        let n_hat = lattice.forward_translation(self.transform, &mut arena.frame(), &n_blocks)?;

        let k_hat: Vec<DMatrix<Complex64>> = momenta
            .par_iter()
            .map(|k| &left_hat[k.flatten()] * &n_hat[k.flatten()] * right_hat[k.flatten()].adjoint())
            .collect();
        let k_spectrum = lattice.assemble_spectrum(k_hat)?;
        lattice.inverse_translation(self.transform, &mut arena.frame(), &k_spectrum)
    }

    /// First block row of K for symmetrized density blocks.
    pub fn k_blocks(&self, d_blocks: &[DMatrix<f64>], arena: &mut ScratchArena) -> Result<Vec<DMatrix<f64>>> {
        let lattice = self.lattice;
        let nao = self.nao_prim();
        let nip = self.ip_orbitals[0].ncols();
        let robust = self.robust_terms()?;
        let width = if robust.is_some() { nip.max(lattice.ngrid_prim()) } else { nip };
        arena.reserve(lattice.ncell() * (nao * nao).max(nao * width).max(nip * width));

        let g_hat = lattice.forward_translation(self.transform, &mut arena.frame(), self.ip_orbitals)?;
        let d_hat = lattice.forward_translation(self.transform, &mut arena.frame(), d_blocks)?;
        let mut k = self.sandwich(&g_hat, &g_hat, &d_hat, &self.metric.blocks, arena)?;

        if let Some((v_blocks, f)) = robust {
            let f_hat = lattice.forward_translation(self.transform, &mut arena.frame(), f)?;
            let kv = self.sandwich(&g_hat, &f_hat, &d_hat, &v_blocks, arena)?;
            for (flat, kt) in k.iter_mut().enumerate() {
                let t = lattice.translation(flat);
                *kt = &kv[flat] + kv[(-t).flatten()].transpose() - &*kt;
            }
        }
        let scale = self.scale();
        Ok(k.into_iter().map(|b| b * scale).collect())
    }
}

fn full_metric(lattice: &Lattice, metric: &MetricTensor) -> Result<DMatrix<f64>> {
    pack_blocks(lattice, &metric.blocks)
}

fn full_ip_orbitals(lattice: &Lattice, grid: &OrbitalGrid, ip_set: &IpSet) -> DMatrix<f64> {
    let aos: Vec<usize> = (0..lattice.ncell() * grid.nao_prim()).collect();
    grid.block(lattice, &aos, &ip_set.supercell_points(lattice))
}

/// `V` for every supercell IP: row `(t, i)` is home row `i` moved by `t`.
fn full_convolved(lattice: &Lattice, v: &DMatrix<f64>) -> DMatrix<f64> {
    let nip = v.nrows();
    DMatrix::from_fn(lattice.ncell() * nip, lattice.ngrid(), |r, o| {
        let t = lattice.translation(r / nip);
        v[(r % nip, lattice.translate_point(o, -t))]
    })
}

fn pair_density(orbitals: &DMatrix<f64>, dm: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_iterator(
        orbitals.ncols(),
        orbitals.column_iter().map(|col| col.dot(&(dm * col))),
    )
}

fn weighted_product(orbitals: &DMatrix<f64>, w: &DVector<f64>) -> DMatrix<f64> {
    let mut weighted = orbitals.clone();
    for (i, mut col) in weighted.column_iter_mut().enumerate() {
        col *= w[i];
    }
    weighted * orbitals.transpose()
}

/// Reference J on full supercell matrices.
pub fn get_j_brute_force(
    lattice: &Lattice,
    grid: &OrbitalGrid,
    ip_set: &IpSet,
    metric: &MetricTensor,
    dm: &DMatrix<f64>,
) -> Result<DMatrix<f64>> {
    check_square(lattice, grid.nao_prim(), dm)?;
    let aorg = full_ip_orbitals(lattice, grid, ip_set);
    let w = full_metric(lattice, metric)?;
    let rho = pair_density(&aorg, dm);
    let mut j = weighted_product(&aorg, &(w * &rho));
    if let Some(v) = &metric.v {
        let v = full_convolved(lattice, v);
        let aor = grid.full(lattice);
        let rho_grid = pair_density(&aor, dm);
        j = weighted_product(&aorg, &(&v * rho_grid)) + weighted_product(&aor, &(v.transpose() * rho)) - j;
    }
    Ok(j * (lattice.ngrid() as f64 / lattice.volume()))
}

/// Reference K on full supercell matrices.
pub fn get_k_brute_force(
    lattice: &Lattice,
    grid: &OrbitalGrid,
    ip_set: &IpSet,
    metric: &MetricTensor,
    dm: &DMatrix<f64>,
) -> Result<DMatrix<f64>> {
    check_square(lattice, grid.nao_prim(), dm)?;
    let aorg = full_ip_orbitals(lattice, grid, ip_set);
    let w = full_metric(lattice, metric)?;
    let m = aorg.transpose() * dm * &aorg;
    let mut k = &aorg * w.component_mul(&m) * aorg.transpose();
    if let Some(v) = &metric.v {
        let v = full_convolved(lattice, v);
        let aor = grid.full(lattice);
        let m = aorg.transpose() * dm * &aor;
        let kv = &aorg * v.component_mul(&m) * aor.transpose();
        k = &kv + kv.transpose() - k;
    }
    Ok(k * (lattice.ngrid() as f64 / lattice.volume()))
}
