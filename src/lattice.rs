//! Lattice bookkeeping for a supercell built by tiling a primitive cell.
//!
//! Two layouts of the supercell real-space grid are used throughout the crate:
//!
//! * natural: row-major over the full supercell mesh, the layout an FFT over the
//!   supercell expects;
//! * ordered: `box * ngrid_prim + p`, where `box` is the flattened lattice
//!   translation and `p` is row-major within the primitive mesh.
//!
//! Supercell orbitals and atoms are always box-major (`box * n_prim + a`).
//!
//! The translation DFT follows the usual sign convention
//! `Â(k) = Σ_t A_t exp(-2πi k·t/L)`, with the inverse normalized by `1/ncell`.

extern crate nalgebra as na;

use crate::arena::ArenaFrame;
use crate::backend::TransformBackend;
use crate::error::{IsdfError, Result};
use itertools::iproduct;
use na::{DMatrix, Vector3};
use num_complex::Complex64;
use rayon::prelude::*;
use std::ops::{Add, Neg, Sub};


/// A lattice translation (or lattice momentum) reduced modulo `kmesh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LatticeIndex {
    kmesh: [usize; 3],
    idx: [usize; 3],
}

impl LatticeIndex {
    pub fn new(kmesh: [usize; 3], idx: [usize; 3]) -> Self {
        Self {
            kmesh,
            idx: [idx[0] % kmesh[0], idx[1] % kmesh[1], idx[2] % kmesh[2]],
        }
    }

    pub fn from_signed(kmesh: [usize; 3], idx: [i64; 3]) -> Self {
        let wrap = |v: i64, n: usize| v.rem_euclid(n as i64) as usize;
        Self {
            kmesh,
            idx: [
                wrap(idx[0], kmesh[0]),
                wrap(idx[1], kmesh[1]),
                wrap(idx[2], kmesh[2]),
            ],
        }
    }

    pub fn zero(kmesh: [usize; 3]) -> Self {
        Self {
            kmesh,
            idx: [0, 0, 0],
        }
    }

    pub fn unflatten(kmesh: [usize; 3], flat: usize) -> Self {
        let z = flat % kmesh[2];
        let y = (flat / kmesh[2]) % kmesh[1];
        let x = (flat / (kmesh[1] * kmesh[2])) % kmesh[0];
        Self {
            kmesh,
            idx: [x, y, z],
        }
    }

    pub fn flatten(&self) -> usize {
        (self.idx[0] * self.kmesh[1] + self.idx[1]) * self.kmesh[2] + self.idx[2]
    }

    pub fn components(&self) -> [usize; 3] {
        self.idx
    }

    pub fn kmesh(&self) -> [usize; 3] {
        self.kmesh
    }

    /// All translations in flattened order.
    pub fn iter(kmesh: [usize; 3]) -> impl Iterator<Item = LatticeIndex> {
        iproduct!(0..kmesh[0], 0..kmesh[1], 0..kmesh[2])
            .map(move |(x, y, z)| LatticeIndex { kmesh, idx: [x, y, z] })
    }

    /// Momenta kept for real input: last axis restricted to `0..=k2/2`.
    pub fn half_spectrum(kmesh: [usize; 3]) -> impl Iterator<Item = LatticeIndex> {
        Self::iter(kmesh).filter(|k| k.in_half_spectrum())
    }

    pub fn in_half_spectrum(&self) -> bool {
        self.idx[2] <= self.kmesh[2] / 2
    }

    pub fn is_zero(&self) -> bool {
        self.idx == [0, 0, 0]
    }
}

impl Add for LatticeIndex {
    type Output = LatticeIndex;

    fn add(self, rhs: LatticeIndex) -> LatticeIndex {
        debug_assert_eq!(self.kmesh, rhs.kmesh);
        LatticeIndex::new(
            self.kmesh,
            [
                self.idx[0] + rhs.idx[0],
                self.idx[1] + rhs.idx[1],
                self.idx[2] + rhs.idx[2],
            ],
        )
    }
}

impl Neg for LatticeIndex {
    type Output = LatticeIndex;

    fn neg(self) -> LatticeIndex {
        LatticeIndex::new(
            self.kmesh,
            [
                self.kmesh[0] - self.idx[0],
                self.kmesh[1] - self.idx[1],
                self.kmesh[2] - self.idx[2],
            ],
        )
    }
}

impl Sub for LatticeIndex {
    type Output = LatticeIndex;

    fn sub(self, rhs: LatticeIndex) -> LatticeIndex {
        self + (-rhs)
    }
}

/// Primitive cell, translation counts and real-space meshes of a periodic
/// calculation. Orthorhombic cells only.
#[derive(Debug, Clone, PartialEq)]
pub struct Lattice {
    prim_lengths: Vector3<f64>,
    kmesh: [usize; 3],
    mesh_prim: [usize; 3],
}

impl Lattice {
    pub fn new(prim_lengths: [f64; 3], kmesh: [usize; 3], mesh_prim: [usize; 3]) -> Result<Self> {
        if kmesh.iter().any(|&k| k == 0) {
            return Err(IsdfError::DimensionMismatch(format!(
                "kmesh must be positive along every axis, got {:?}",
                kmesh
            )));
        }
        if mesh_prim.iter().any(|&m| m == 0) {
            return Err(IsdfError::DimensionMismatch(format!(
                "primitive mesh must be positive along every axis, got {:?}",
                mesh_prim
            )));
        }
        if prim_lengths.iter().any(|&l| !(l > 0.0)) {
            return Err(IsdfError::DimensionMismatch(format!(
                "cell lengths must be positive, got {:?}",
                prim_lengths
            )));
        }
        Ok(Self {
            prim_lengths: Vector3::new(prim_lengths[0], prim_lengths[1], prim_lengths[2]),
            kmesh,
            mesh_prim,
        })
    }

    /// Build from the supercell mesh, which must be divisible by `kmesh`.
    pub fn from_supercell_mesh(
        prim_lengths: [f64; 3],
        kmesh: [usize; 3],
        mesh: [usize; 3],
    ) -> Result<Self> {
        let mut mesh_prim = [0; 3];
        for axis in 0..3 {
            if kmesh[axis] == 0 || mesh[axis] % kmesh[axis] != 0 {
                return Err(IsdfError::DimensionMismatch(format!(
                    "supercell mesh {:?} is not divisible by kmesh {:?}",
                    mesh, kmesh
                )));
            }
            mesh_prim[axis] = mesh[axis] / kmesh[axis];
        }
        Self::new(prim_lengths, kmesh, mesh_prim)
    }

    pub fn kmesh(&self) -> [usize; 3] {
        self.kmesh
    }

    pub fn mesh_prim(&self) -> [usize; 3] {
        self.mesh_prim
    }

    pub fn mesh(&self) -> [usize; 3] {
        [
            self.kmesh[0] * self.mesh_prim[0],
            self.kmesh[1] * self.mesh_prim[1],
            self.kmesh[2] * self.mesh_prim[2],
        ]
    }

    pub fn ncell(&self) -> usize {
        self.kmesh.iter().product()
    }

    /// Number of momenta actually solved for real input.
    pub fn ncell_complex(&self) -> usize {
        self.kmesh[0] * self.kmesh[1] * (self.kmesh[2] / 2 + 1)
    }

    pub fn ngrid_prim(&self) -> usize {
        self.mesh_prim.iter().product()
    }

    pub fn ngrid(&self) -> usize {
        self.ncell() * self.ngrid_prim()
    }

    pub fn prim_lengths(&self) -> Vector3<f64> {
        self.prim_lengths
    }

    pub fn supercell_lengths(&self) -> Vector3<f64> {
        Vector3::new(
            self.prim_lengths.x * self.kmesh[0] as f64,
            self.prim_lengths.y * self.kmesh[1] as f64,
            self.prim_lengths.z * self.kmesh[2] as f64,
        )
    }

    /// Supercell volume.
    pub fn volume(&self) -> f64 {
        let l = self.supercell_lengths();
        l.x * l.y * l.z
    }

    pub fn translation(&self, flat: usize) -> LatticeIndex {
        LatticeIndex::unflatten(self.kmesh, flat)
    }

    pub fn translations(&self) -> impl Iterator<Item = LatticeIndex> {
        LatticeIndex::iter(self.kmesh)
    }

    pub fn half_spectrum(&self) -> Vec<LatticeIndex> {
        LatticeIndex::half_spectrum(self.kmesh).collect()
    }

    pub fn box_of(&self, ordered: usize) -> LatticeIndex {
        self.translation(ordered / self.ngrid_prim())
    }

    pub fn prim_point(&self, ordered: usize) -> usize {
        ordered % self.ngrid_prim()
    }

    pub fn ordered_index(&self, cell: LatticeIndex, prim_point: usize) -> usize {
        cell.flatten() * self.ngrid_prim() + prim_point
    }

    /// Move an ordered grid index by a lattice translation.
    pub fn translate_point(&self, ordered: usize, shift: LatticeIndex) -> usize {
        let cell = self.box_of(ordered) + shift;
        self.ordered_index(cell, self.prim_point(ordered))
    }

    fn prim_components(&self, p: usize) -> [usize; 3] {
        let m = self.mesh_prim;
        [p / (m[1] * m[2]), (p / m[2]) % m[1], p % m[2]]
    }

    /// Integer supercell mesh coordinates of an ordered grid index.
    pub fn mesh_coords(&self, ordered: usize) -> [usize; 3] {
        let s = self.box_of(ordered).components();
        let p = self.prim_components(self.prim_point(ordered));
        [
            s[0] * self.mesh_prim[0] + p[0],
            s[1] * self.mesh_prim[1] + p[1],
            s[2] * self.mesh_prim[2] + p[2],
        ]
    }

    pub fn ordered_to_natural(&self, ordered: usize) -> usize {
        let n = self.mesh();
        let x = self.mesh_coords(ordered);
        (x[0] * n[1] + x[1]) * n[2] + x[2]
    }

    pub fn natural_to_ordered(&self, natural: usize) -> usize {
        let n = self.mesh();
        let x = [natural / (n[1] * n[2]), (natural / n[2]) % n[1], natural % n[2]];
        let cell = LatticeIndex::new(
            self.kmesh,
            [
                x[0] / self.mesh_prim[0],
                x[1] / self.mesh_prim[1],
                x[2] / self.mesh_prim[2],
            ],
        );
        let m = self.mesh_prim;
        let p = ((x[0] % m[0]) * m[1] + x[1] % m[1]) * m[2] + x[2] % m[2];
        self.ordered_index(cell, p)
    }

    /// Cartesian position of an ordered grid point.
    pub fn point_coords(&self, ordered: usize) -> Vector3<f64> {
        let n = self.mesh();
        let l = self.supercell_lengths();
        let x = self.mesh_coords(ordered);
        Vector3::new(
            x[0] as f64 / n[0] as f64 * l.x,
            x[1] as f64 / n[1] as f64 * l.y,
            x[2] as f64 / n[2] as f64 * l.z,
        )
    }

    /// Minimum-image displacement `a - b` in the supercell.
    pub fn minimum_image(&self, a: &Vector3<f64>, b: &Vector3<f64>) -> Vector3<f64> {
        let l = self.supercell_lengths();
        let mut d = a - b;
        for axis in 0..3 {
            d[axis] -= l[axis] * (d[axis] / l[axis]).round();
        }
        d
    }

    /// Phase `exp(-2πi Σ k_a p_a / n_a)` for every primitive mesh point,
    /// row-major over the primitive mesh.
    pub fn momentum_phase(&self, k: LatticeIndex) -> Vec<Complex64> {
        let n = self.mesh();
        let k = k.components();
        (0..self.ngrid_prim())
            .map(|p| {
                let p = self.prim_components(p);
                let arg: f64 = (0..3)
                    .map(|a| k[a] as f64 * p[a] as f64 / n[a] as f64)
                    .sum();
                Complex64::from_polar(1.0, -2.0 * std::f64::consts::PI * arg)
            })
            .collect()
    }

    /// Natural supercell index of the reciprocal point `q * kmesh + k`, for
    /// every primitive-mesh frequency `q` in row-major order.
    pub fn folded_frequencies(&self, k: LatticeIndex) -> Vec<usize> {
        let n = self.mesh();
        let k = k.components();
        (0..self.ngrid_prim())
            .map(|q| {
                let q = self.prim_components(q);
                let g = [
                    q[0] * self.kmesh[0] + k[0],
                    q[1] * self.kmesh[1] + k[1],
                    q[2] * self.kmesh[2] + k[2],
                ];
                (g[0] * n[1] + g[1]) * n[2] + g[2]
            })
            .collect()
    }

    fn check_blocks<T: na::Scalar>(&self, blocks: &[DMatrix<T>]) -> Result<(usize, usize)> {
        if blocks.len() != self.ncell() {
            return Err(IsdfError::DimensionMismatch(format!(
                "expected {} translation blocks, got {}",
                self.ncell(),
                blocks.len()
            )));
        }
        let shape = blocks[0].shape();
        if blocks.iter().any(|b| b.shape() != shape) {
            return Err(IsdfError::DimensionMismatch(
                "translation blocks differ in shape".to_string(),
            ));
        }
        Ok(shape)
    }

    /// Forward translation DFT of real blocks. Returns the full spectrum in
    /// flattened momentum order.
    pub fn forward_translation(
        &self,
        backend: &dyn TransformBackend,
        frame: &mut ArenaFrame<'_>,
        blocks: &[DMatrix<f64>],
    ) -> Result<Vec<DMatrix<Complex64>>> {
        let (rows, cols) = self.check_blocks(blocks)?;
        let ncell = self.ncell();
        let kmesh = self.kmesh;
        let lines = frame.acquire(rows * cols * ncell)?;

        let scratch_len = backend.scratch_len(kmesh);
        lines
            .par_chunks_mut(ncell)
            .enumerate()
            .try_for_each_init(
                || vec![Complex64::default(); scratch_len],
                |scratch, (e, line)| {
                    for (t, block) in blocks.iter().enumerate() {
                        line[t] = Complex64::new(block[e], 0.0);
                    }
                    backend.forward_3d_with_scratch(line, kmesh, scratch)
                },
            )?;

        Ok((0..ncell)
            .map(|k| DMatrix::from_fn(rows, cols, |i, j| lines[(i + j * rows) * ncell + k]))
            .collect())
    }

    /// Inverse translation DFT back to real blocks. The imaginary part is
    /// dropped, so the spectrum must be conjugate-symmetric.
    pub fn inverse_translation(
        &self,
        backend: &dyn TransformBackend,
        frame: &mut ArenaFrame<'_>,
        spectrum: &[DMatrix<Complex64>],
    ) -> Result<Vec<DMatrix<f64>>> {
        let (rows, cols) = self.check_blocks(spectrum)?;
        let ncell = self.ncell();
        let kmesh = self.kmesh;
        let lines = frame.acquire(rows * cols * ncell)?;

        let scratch_len = backend.scratch_len(kmesh);
        lines
            .par_chunks_mut(ncell)
            .enumerate()
            .try_for_each_init(
                || vec![Complex64::default(); scratch_len],
                |scratch, (e, line)| {
                    for (k, block) in spectrum.iter().enumerate() {
                        line[k] = block[e];
                    }
                    backend.inverse_3d_with_scratch(line, kmesh, scratch)
                },
            )?;

        Ok((0..ncell)
            .map(|t| DMatrix::from_fn(rows, cols, |i, j| lines[(i + j * rows) * ncell + t].re))
            .collect())
    }

    /// Expand per-momentum results computed on the half spectrum to the full
    /// spectrum, filling `-k` with the conjugate of `k`.
    pub fn assemble_spectrum(
        &self,
        half: Vec<DMatrix<Complex64>>,
    ) -> Result<Vec<DMatrix<Complex64>>> {
        let momenta = self.half_spectrum();
        if half.len() != momenta.len() {
            return Err(IsdfError::DimensionMismatch(format!(
                "expected {} half-spectrum blocks, got {}",
                momenta.len(),
                half.len()
            )));
        }
        let mut full: Vec<Option<DMatrix<Complex64>>> = vec![None; self.ncell()];
        for (k, block) in momenta.iter().zip(half) {
            full[k.flatten()] = Some(block);
        }
        for k in self.translations() {
            if full[k.flatten()].is_none() {
                let partner = full[(-k).flatten()]
                    .as_ref()
                    .map(|b| b.map(|z| z.conj()))
                    .ok_or_else(|| {
                        IsdfError::DimensionMismatch(format!(
                            "momentum {:?} has no conjugate partner",
                            k.components()
                        ))
                    })?;
                full[k.flatten()] = Some(partner);
            }
        }
        Ok(full.into_iter().flatten().collect())
    }
}
