//! Grid ownership: which atom each real-space grid point belongs to, plus
//! the per-atom orbital/grid blocks the IP selector works on.

use crate::error::{IsdfError, Result};
use crate::lattice::{Lattice, LatticeIndex};
use nalgebra::{DMatrix, Vector3};
use rayon::prelude::*;

/// Orbital values of the whole supercell, stored as the primitive-cell
/// block `F[a, o]` (primitive orbital `a`, ordered supercell point `o`).
/// Supercell orbital `(b, a)` at point `o` is `F[a, o - b]`.
#[derive(Debug, Clone)]
pub struct OrbitalGrid {
    values: DMatrix<f64>,
    ao_atom: Vec<usize>,
    natm_prim: usize,
}

impl OrbitalGrid {
    pub fn new(
        lattice: &Lattice,
        values: DMatrix<f64>,
        ao_atom: Vec<usize>,
        natm_prim: usize,
    ) -> Result<Self> {
        if values.ncols() != lattice.ngrid() || values.nrows() != ao_atom.len() {
            return Err(IsdfError::DimensionMismatch(format!(
                "orbital values {:?} do not match {} orbitals on {} grid points",
                values.shape(),
                ao_atom.len(),
                lattice.ngrid()
            )));
        }
        Ok(Self {
            values,
            ao_atom,
            natm_prim,
        })
    }

    pub fn nao_prim(&self) -> usize {
        self.values.nrows()
    }

    pub fn natm_prim(&self) -> usize {
        self.natm_prim
    }

    pub fn prim_values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn ao_atom_prim(&self) -> &[usize] {
        &self.ao_atom
    }

    /// Supercell atom owning supercell orbital `ao`.
    pub fn ao_atom(&self, ao: usize) -> usize {
        let (cell, a) = (ao / self.nao_prim(), ao % self.nao_prim());
        cell * self.natm_prim + self.ao_atom[a]
    }

    pub fn value(&self, lattice: &Lattice, ao: usize, point: usize) -> f64 {
        let cell = lattice.translation(ao / self.nao_prim());
        let a = ao % self.nao_prim();
        self.values[(a, lattice.translate_point(point, -cell))]
    }

    /// Values of the given supercell orbitals at the given points.
    pub fn block(&self, lattice: &Lattice, aos: &[usize], points: &[usize]) -> DMatrix<f64> {
        DMatrix::from_fn(aos.len(), points.len(), |i, j| {
            self.value(lattice, aos[i], points[j])
        })
    }

    /// Every supercell orbital on every grid point.
    pub fn full(&self, lattice: &Lattice) -> DMatrix<f64> {
        let aos: Vec<usize> = (0..lattice.ncell() * self.nao_prim()).collect();
        let points: Vec<usize> = (0..lattice.ngrid()).collect();
        self.block(lattice, &aos, &points)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartitionPolicy {
    /// Owner is the atom of the orbital with the largest magnitude.
    LargestOrbital,
    /// Among atoms within `rcut`, the one carrying the largest orbital
    /// magnitude; points with no atom in range go to the nearest atom.
    NearestAtom { rcut: f64 },
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        PartitionPolicy::LargestOrbital
    }
}

/// Grid point to atom map. Only the primitive-cell points are classified;
/// the rest of the supercell follows by translation.
#[derive(Debug, Clone)]
pub struct GridPartition {
    natm_prim: usize,
    prim_owner: Vec<(LatticeIndex, usize)>,
}

impl GridPartition {
    pub fn build(
        policy: PartitionPolicy,
        lattice: &Lattice,
        grid: &OrbitalGrid,
        positions: &[Vector3<f64>],
    ) -> Result<Self> {
        let natm_prim = grid.natm_prim();
        if positions.len() != natm_prim {
            return Err(IsdfError::DimensionMismatch(format!(
                "{} atom positions for {} atoms",
                positions.len(),
                natm_prim
            )));
        }
        let nao = lattice.ncell() * grid.nao_prim();
        let l = lattice.prim_lengths();
        let atom_coords: Vec<Vector3<f64>> = lattice
            .translations()
            .flat_map(|cell| {
                let c = cell.components();
                positions.iter().map(move |r| {
                    r + Vector3::new(c[0] as f64 * l.x, c[1] as f64 * l.y, c[2] as f64 * l.z)
                })
            })
            .collect();

        let prim_owner = (0..lattice.ngrid_prim())
            .into_par_iter()
            .map(|p| {
                let magnitudes: Vec<f64> = (0..nao).map(|ao| grid.value(lattice, ao, p).abs()).collect();
                let largest_on = |allowed: &dyn Fn(usize) -> bool| {
                    let mut best: Option<(usize, f64)> = None;
                    for (ao, &v) in magnitudes.iter().enumerate() {
                        if allowed(grid.ao_atom(ao)) && best.map_or(true, |(_, b)| v > b) {
                            best = Some((ao, v));
                        }
                    }
                    best.map(|(ao, _)| grid.ao_atom(ao))
                };

                let owner = match policy {
                    PartitionPolicy::LargestOrbital => largest_on(&|_| true),
                    PartitionPolicy::NearestAtom { rcut } => {
                        let r = lattice.point_coords(p);
                        let dist: Vec<f64> = atom_coords
                            .iter()
                            .map(|ra| lattice.minimum_image(&r, ra).norm())
                            .collect();
                        largest_on(&|atm| dist[atm] <= rcut).or_else(|| {
                            dist.iter()
                                .enumerate()
                                .fold(None, |best: Option<(usize, f64)>, (i, &d)| match best {
                                    Some((_, bd)) if bd <= d => best,
                                    _ => Some((i, d)),
                                })
                                .map(|(i, _)| i)
                        })
                    }
                };
                owner.map(|atm| (lattice.translation(atm / natm_prim), atm % natm_prim))
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| IsdfError::DimensionMismatch("no orbitals to partition the grid".to_string()))?;

        Ok(Self {
            natm_prim,
            prim_owner,
        })
    }

    pub fn natm_prim(&self) -> usize {
        self.natm_prim
    }

    /// Supercell atom owning an ordered grid point.
    pub fn atom_of(&self, lattice: &Lattice, point: usize) -> usize {
        let (cell, atm) = self.prim_owner[lattice.prim_point(point)];
        let owner_cell = cell + lattice.box_of(point);
        owner_cell.flatten() * self.natm_prim + atm
    }

    /// Ordered supercell points owned by a supercell atom.
    pub fn points_of(&self, lattice: &Lattice, atom: usize) -> Vec<usize> {
        let target = lattice.translation(atom / self.natm_prim);
        let atm = atom % self.natm_prim;
        self.prim_owner
            .iter()
            .enumerate()
            .filter(|(_, (_, a))| *a == atm)
            .map(|(p, (cell, _))| lattice.ordered_index(target - *cell, p))
            .collect()
    }

    /// Number of points owned by each primitive-cell atom.
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.natm_prim];
        for (_, a) in &self.prim_owner {
            counts[*a] += 1;
        }
        counts
    }

    /// Box `c` in which point `(c, p)` belongs to a home-cell atom.
    pub fn home_image(&self, p: usize) -> LatticeIndex {
        -self.prim_owner[p].0
    }
}

/// Orbitals relevant to one atom's grid points and their values there.
#[derive(Debug, Clone)]
pub struct AtomGridBlock {
    pub atom: usize,
    pub orbitals: Vec<usize>,
    pub grid_points: Vec<usize>,
    pub values: DMatrix<f64>,
}

impl AtomGridBlock {
    /// Gather the block, keeping orbitals whose largest magnitude on the
    /// points exceeds `cutoff`.
    pub fn gather(
        lattice: &Lattice,
        grid: &OrbitalGrid,
        atom: usize,
        grid_points: Vec<usize>,
        cutoff: f64,
    ) -> Self {
        let nao = lattice.ncell() * grid.nao_prim();
        let orbitals: Vec<usize> = (0..nao)
            .filter(|&ao| {
                grid_points
                    .iter()
                    .any(|&p| grid.value(lattice, ao, p).abs() > cutoff)
            })
            .collect();
        let values = grid.block(lattice, &orbitals, &grid_points);
        Self {
            atom,
            orbitals,
            grid_points,
            values,
        }
    }

    pub fn nao_involved(&self) -> usize {
        self.orbitals.len()
    }

    /// The same block for the atom moved by `shift`, by relabelling.
    pub fn translated(
        &self,
        lattice: &Lattice,
        natm_prim: usize,
        nao_prim: usize,
        shift: LatticeIndex,
    ) -> Self {
        let move_index = |idx: usize, per_cell: usize| {
            let cell = lattice.translation(idx / per_cell) + shift;
            cell.flatten() * per_cell + idx % per_cell
        };
        Self {
            atom: move_index(self.atom, natm_prim),
            orbitals: self.orbitals.iter().map(|&ao| move_index(ao, nao_prim)).collect(),
            grid_points: self
                .grid_points
                .iter()
                .map(|&p| lattice.translate_point(p, shift))
                .collect(),
            values: self.values.clone(),
        }
    }
}
