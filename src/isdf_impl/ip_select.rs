//! Interpolation point (IP) selection.
//!
//! For every primitive-cell atom the orbital values on the atom's grid
//! points are sketched with random projections, turned into pair products
//! and factorized with a column-pivoted Gram-Schmidt. The pivots are the
//! IPs. Selections are folded back to primitive-cell grid indices, merged
//! and sorted; the supercell set is the primitive set repeated per cell.

use super::partition::{AtomGridBlock, GridPartition, OrbitalGrid};
use crate::error::{BuildReport, IsdfError, Result};
use crate::lattice::Lattice;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionParams {
    /// Oversampling factor on the number of orbitals per atom.
    pub c: usize,
    /// Extra sketch columns.
    pub m: usize,
    pub rela_cutoff: f64,
    /// Minimum acceptable rank per atom; defaults to the atom's orbital count.
    pub rank_floor: Option<usize>,
    pub orbital_cutoff: f64,
    pub seed: u64,
    /// Primitive atom groups for a second, group-level selection pass.
    pub groups: Option<Vec<Vec<usize>>>,
    pub group_c: Option<usize>,
}

impl Default for SelectionParams {
    fn default() -> Self {
        Self {
            c: 5,
            m: 5,
            rela_cutoff: 1e-10,
            rank_floor: None,
            orbital_cutoff: 1e-8,
            seed: 20240611,
            groups: None,
            group_c: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PivotResult {
    pub pivots: Vec<usize>,
    pub rank: usize,
}

/// Column-pivoted modified Gram-Schmidt. The pivot is the remaining column
/// with the largest norm, ties going to the lowest column index. Stops at
/// `max_rank` or once the largest remaining norm drops below
/// `rela_cutoff` times the first pivot norm. If `max_rank` covers every
/// column, every column is returned.
pub fn pivoted_columns(mat: &DMatrix<f64>, max_rank: usize, rela_cutoff: f64) -> PivotResult {
    let ncols = mat.ncols();
    if max_rank >= ncols {
        return PivotResult {
            pivots: (0..ncols).collect(),
            rank: ncols,
        };
    }

    let nrows = mat.nrows();
    let mut work = mat.clone();
    let mut active = vec![true; ncols];
    let mut norms: Vec<f64> = work.column_iter().map(|c| c.norm()).collect();
    let mut pivots = Vec::with_capacity(max_rank);
    let mut first_norm = None;

    while pivots.len() < max_rank {
        let mut best: Option<(usize, f64)> = None;
        for j in (0..ncols).filter(|&j| active[j]) {
            if best.map_or(true, |(_, b)| norms[j] > b) {
                best = Some((j, norms[j]));
            }
        }
        let Some((pivot, norm)) = best else { break };
        let first = *first_norm.get_or_insert(norm);
        if norm <= 0.0 || norm <= rela_cutoff * first {
            break;
        }

        pivots.push(pivot);
        active[pivot] = false;
        let q: Vec<f64> = work.column(pivot).iter().map(|x| x / norm).collect();

        work.as_mut_slice()
            .par_chunks_mut(nrows)
            .zip(norms.par_iter_mut())
            .enumerate()
            .filter(|(j, _)| active[*j])
            .for_each(|(_, (col, n))| {
                let proj: f64 = col.iter().zip(q.iter()).map(|(a, b)| a * b).sum();
                col.iter_mut().zip(q.iter()).for_each(|(a, b)| *a -= proj * b);
                *n = col.iter().map(|a| a * a).sum::<f64>().sqrt();
            });
    }

    let rank = pivots.len();
    PivotResult { pivots, rank }
}

fn orthonormal_sketch(rows: usize, cols: usize, rng: &mut StdRng) -> DMatrix<f64> {
    let g = DMatrix::<f64>::from_fn(rows, cols, |_, _| StandardNormal.sample(rng));
    g.qr().q()
}

/// Pair-product matrix of a value block (orbitals x points). With more
/// sketch columns than orbitals the raw values are used and only distinct
/// pairs are formed.
pub fn pair_matrix(values: &DMatrix<f64>, naux_tmp: usize, rng: &mut StdRng) -> DMatrix<f64> {
    let (nao, npts) = values.shape();
    if naux_tmp > nao {
        let pairs: Vec<(usize, usize)> = (0..nao).flat_map(|i| (i..nao).map(move |j| (i, j))).collect();
        return DMatrix::from_fn(pairs.len(), npts, |r, g| {
            let (i, j) = pairs[r];
            values[(i, g)] * values[(j, g)]
        });
    }

    let a1 = orthonormal_sketch(nao, naux_tmp, rng).transpose() * values;
    let a2 = orthonormal_sketch(nao, naux_tmp, rng).transpose() * values;
    DMatrix::from_fn(naux_tmp * naux_tmp, npts, |r, g| {
        a1[(r / naux_tmp, g)] * a2[(r % naux_tmp, g)]
    })
}

/// Run the sketched pivoted factorization on one block, returning the
/// selected grid points in pivot order and the achieved rank.
pub fn select_block(
    block: &AtomGridBlock,
    nao_target: usize,
    c: usize,
    m: usize,
    rela_cutoff: f64,
    seed: u64,
) -> (Vec<usize>, usize) {
    if block.grid_points.is_empty() || block.orbitals.is_empty() {
        return (Vec::new(), 0);
    }
    let max_rank = c * nao_target + 10;
    let naux_tmp = ((c * nao_target) as f64).sqrt().floor() as usize + m;
    let mut rng = StdRng::seed_from_u64(seed);
    let pairs = pair_matrix(&block.values, naux_tmp, &mut rng);
    let result = pivoted_columns(&pairs, max_rank, rela_cutoff);
    let points = result.pivots.iter().map(|&j| block.grid_points[j]).collect();
    (points, result.rank)
}

/// Drop translation images: a candidate outside the home cell survives only
/// if no home-cell candidate shares its primitive image. Output is sorted.
pub fn possible_ip_filter(lattice: &Lattice, candidates: &[usize]) -> Vec<usize> {
    let mut by_image: BTreeMap<usize, usize> = BTreeMap::new();
    for &point in candidates {
        let image = lattice.prim_point(point);
        by_image
            .entry(image)
            .and_modify(|kept| {
                if lattice.box_of(point).is_zero() && !lattice.box_of(*kept).is_zero() {
                    *kept = point;
                }
            })
            .or_insert(point);
    }
    let mut kept: Vec<usize> = by_image.into_values().collect();
    kept.sort_unstable();
    kept
}

/// Sorted, deduplicated primitive-cell IPs with their owning atoms and
/// group membership.
#[derive(Debug, Clone, PartialEq)]
pub struct IpSet {
    prim: Vec<usize>,
    owner: Vec<usize>,
    groups: Vec<Vec<usize>>,
}

impl IpSet {
    /// `entries` are (primitive grid point, owning primitive atom);
    /// `atom_group` maps each primitive atom to its group.
    pub fn new(mut entries: Vec<(usize, usize)>, atom_group: &[usize]) -> Self {
        entries.sort_unstable();
        entries.dedup_by_key(|e| e.0);
        let ngroups = atom_group.iter().map(|g| g + 1).max().unwrap_or(0);
        let mut groups = vec![Vec::new(); ngroups];
        for (i, (_, atm)) in entries.iter().enumerate() {
            groups[atom_group[*atm]].push(i);
        }
        let (prim, owner) = entries.into_iter().unzip();
        Self { prim, owner, groups }
    }

    pub fn len(&self) -> usize {
        self.prim.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prim.is_empty()
    }

    pub fn prim_points(&self) -> &[usize] {
        &self.prim
    }

    pub fn owners(&self) -> &[usize] {
        &self.owner
    }

    /// Positions in `prim_points` of each group's IPs.
    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    /// Ordered supercell indices, cell-major: entry `c * len + i` is IP `i`
    /// of cell `c`.
    pub fn supercell_points(&self, lattice: &Lattice) -> Vec<usize> {
        lattice
            .translations()
            .flat_map(|cell| self.prim.iter().map(move |&p| lattice.ordered_index(cell, p)))
            .collect()
    }

    /// Group membership in the supercell set, one list per (cell, group).
    pub fn supercell_groups(&self, lattice: &Lattice) -> Vec<Vec<usize>> {
        let nip = self.len();
        (0..lattice.ncell())
            .flat_map(|c| {
                self.groups
                    .iter()
                    .map(move |g| g.iter().map(|&i| c * nip + i).collect())
            })
            .collect()
    }
}

pub struct IpSelector<'a> {
    params: &'a SelectionParams,
}

impl<'a> IpSelector<'a> {
    pub fn new(params: &'a SelectionParams) -> Self {
        Self { params }
    }

    fn atom_groups(&self, natm: usize) -> Result<Vec<usize>> {
        let mut atom_group = vec![usize::MAX; natm];
        match &self.params.groups {
            None => atom_group.iter_mut().enumerate().for_each(|(a, g)| *g = a),
            Some(groups) => {
                for (g, atoms) in groups.iter().enumerate() {
                    if atoms.is_empty() {
                        return Err(IsdfError::DimensionMismatch(format!("atom group {} is empty", g)));
                    }
                    for &a in atoms {
                        if a >= natm || atom_group[a] != usize::MAX {
                            return Err(IsdfError::DimensionMismatch(format!(
                                "atom {} is out of range or listed in several groups",
                                a
                            )));
                        }
                        atom_group[a] = g;
                    }
                }
                if atom_group.contains(&usize::MAX) {
                    return Err(IsdfError::DimensionMismatch(
                        "atom groups do not cover every atom".to_string(),
                    ));
                }
            }
        }
        Ok(atom_group)
    }

    pub fn select(
        &self,
        lattice: &Lattice,
        grid: &OrbitalGrid,
        partition: &GridPartition,
        report: &mut BuildReport,
    ) -> Result<IpSet> {
        let p = self.params;
        let natm = grid.natm_prim();
        let atom_group = self.atom_groups(natm)?;
        let mut nao_atm = vec![0; natm];
        for &a in grid.ao_atom_prim() {
            nao_atm[a] += 1;
        }

        let per_atom: Vec<(Vec<usize>, usize)> = (0..natm)
            .into_par_iter()
            .map(|atm| {
                let candidates = partition.points_of(lattice, atm);
                let block = AtomGridBlock::gather(lattice, grid, atm, candidates, p.orbital_cutoff);
                debug!(
                    "Atom {}: {} candidate points, {} involved orbitals",
                    atm,
                    block.grid_points.len(),
                    block.nao_involved()
                );
                select_block(&block, nao_atm[atm], p.c, p.m, p.rela_cutoff, p.seed + atm as u64)
            })
            .collect();

        let mut owner_of: BTreeMap<usize, usize> = BTreeMap::new();
        for (atm, (points, rank)) in per_atom.iter().enumerate() {
            let floor = p.rank_floor.unwrap_or(nao_atm[atm]);
            if *rank < floor {
                report.record(
                    IsdfError::RankDeficiency {
                        group: atm,
                        rank: *rank,
                        floor,
                    },
                    false,
                )?;
            }
            for &pt in points {
                owner_of.insert(pt, atm);
            }
        }

        let mut selected: Vec<usize> = owner_of.keys().copied().collect();
        if let Some(groups) = &p.groups {
            selected = self.select_groups(lattice, grid, groups, &nao_atm, &owner_of, report)?;
        }

        let entries: Vec<(usize, usize)> = possible_ip_filter(lattice, &selected)
            .into_iter()
            .map(|pt| (lattice.prim_point(pt), owner_of[&pt]))
            .collect();
        let ip_set = IpSet::new(entries, &atom_group);
        info!(
            "Selected {} interpolation points in the primitive cell ({} in the supercell)",
            ip_set.len(),
            ip_set.len() * lattice.ncell()
        );
        Ok(ip_set)
    }

    fn select_groups(
        &self,
        lattice: &Lattice,
        grid: &OrbitalGrid,
        groups: &[Vec<usize>],
        nao_atm: &[usize],
        owner_of: &BTreeMap<usize, usize>,
        report: &mut BuildReport,
    ) -> Result<Vec<usize>> {
        let p = self.params;
        let group_c = p.group_c.unwrap_or(p.c);

        let per_group: Vec<(Vec<usize>, usize, usize)> = groups
            .par_iter()
            .enumerate()
            .map(|(g, atoms)| {
                let pool: Vec<usize> = owner_of
                    .iter()
                    .filter(|&(_, &atm)| atoms.contains(&atm))
                    .map(|(&pt, _)| pt)
                    .collect();
                let candidates = possible_ip_filter(lattice, &pool);
                let nao_group: usize = atoms.iter().map(|&a| nao_atm[a]).sum();
                let block = AtomGridBlock::gather(lattice, grid, atoms[0], candidates, p.orbital_cutoff);
                let (points, rank) = select_block(
                    &block,
                    nao_group,
                    group_c,
                    p.m,
                    p.rela_cutoff,
                    p.seed + (groups.len() + g) as u64,
                );
                (points, rank, nao_group)
            })
            .collect();

        let mut selected = Vec::new();
        for (g, (points, rank, nao_group)) in per_group.into_iter().enumerate() {
            let floor = p.rank_floor.unwrap_or(nao_group);
            if rank < floor {
                report.record(
                    IsdfError::RankDeficiency {
                        group: g,
                        rank,
                        floor,
                    },
                    false,
                )?;
            }
            selected.extend(points);
        }
        selected.sort_unstable();
        Ok(selected)
    }
}
