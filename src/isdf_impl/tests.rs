//! Tests for the ISDF pipeline

use super::ip_select::{pivoted_columns, possible_ip_filter, select_block};
use super::jk::first_row_blocks;
use super::*;
use crate::arena::{ArenaPlan, ScratchArena};
use crate::backend::{
    BareCoulomb, CoulombKernel, DenseSolver, LinearSolver, RustFftBackend, TransformBackend,
};
use crate::error::{BuildReport, IsdfError, Result};
use crate::lattice::{Lattice, LatticeIndex};
use crate::orbitals::{GridEvaluator, TableEvaluator};
use nalgebra::{DMatrix, Vector3};
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const NAO_PER_ATOM: usize = 5;

fn test_lattice(kmesh: [usize; 3]) -> Lattice {
    Lattice::new([3.0, 3.0, 4.0], kmesh, [3, 3, 4]).unwrap()
}

fn random_table(lattice: &Lattice, seed: u64) -> TableEvaluator {
    let mut rng = StdRng::seed_from_u64(seed);
    let nao = 2 * NAO_PER_ATOM;
    let values = DMatrix::from_fn(nao, lattice.ngrid(), |_, _| rng.gen_range(-1.0..1.0));
    let ao_atom = (0..nao).map(|ao| ao / NAO_PER_ATOM).collect();
    let positions = vec![Vector3::new(0.5, 0.5, 0.5), Vector3::new(2.0, 1.5, 2.5)];
    TableEvaluator::new(values, ao_atom, positions).unwrap()
}

fn test_settings() -> IsdfSettings {
    IsdfSettings {
        selection: SelectionParams {
            c: 1,
            ..SelectionParams::default()
        },
        ..IsdfSettings::default()
    }
}

fn random_engine(kmesh: [usize; 3], seed: u64) -> IsdfEngine<TableEvaluator> {
    let lattice = test_lattice(kmesh);
    let table = random_table(&lattice, seed);
    IsdfEngine::new(lattice, table, test_settings())
}

fn engine_with(kmesh: [usize; 3], seed: u64, settings: IsdfSettings) -> IsdfEngine<TableEvaluator> {
    let lattice = test_lattice(kmesh);
    let table = random_table(&lattice, seed);
    let mut engine = IsdfEngine::new(lattice, table, settings);
    engine.build().unwrap();
    engine
}

fn grouped_settings(groups: Vec<Vec<usize>>) -> IsdfSettings {
    let mut settings = test_settings();
    settings.selection.groups = Some(groups);
    settings
}

fn built_engine(kmesh: [usize; 3], seed: u64) -> IsdfEngine<TableEvaluator> {
    let mut engine = random_engine(kmesh, seed);
    engine.build().unwrap();
    engine
}

fn random_symmetric(n: usize, seed: u64) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let a = DMatrix::from_fn(n, n, |_, _| rng.gen_range(-1.0..1.0));
    (&a + a.transpose()) * 0.5
}

fn relative_error(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    (a - b).amax() / b.amax()
}

/// `P M P^T` for the permutation moving every orbital by `shift` cells.
fn shift_matrix(lattice: &Lattice, nao_prim: usize, m: &DMatrix<f64>, shift: LatticeIndex) -> DMatrix<f64> {
    let moved = |ao: usize| (lattice.translation(ao / nao_prim) + shift).flatten() * nao_prim + ao % nao_prim;
    let mut out = DMatrix::zeros(m.nrows(), m.ncols());
    for i in 0..m.nrows() {
        for j in 0..m.ncols() {
            out[(moved(i), moved(j))] = m[(i, j)];
        }
    }
    out
}

fn orbital_grid(lattice: &Lattice, table: &TableEvaluator) -> OrbitalGrid {
    let points: Vec<usize> = (0..lattice.ngrid()).collect();
    OrbitalGrid::new(lattice, table.evaluate(lattice, &points), table.ao_atom(), table.natm()).unwrap()
}

#[test]
fn test_partition_replicates_across_cells() {
    let lattice = test_lattice([1, 1, 2]);
    let table = random_table(&lattice, 1);
    let grid = orbital_grid(&lattice, &table);
    let positions = vec![Vector3::new(0.5, 0.5, 0.5), Vector3::new(2.0, 1.5, 2.5)];

    for policy in [PartitionPolicy::LargestOrbital, PartitionPolicy::NearestAtom { rcut: 1.5 }] {
        let partition = GridPartition::build(policy, &lattice, &grid, &positions).unwrap();
        let shift = lattice.translation(1);
        for o in 0..lattice.ngrid() {
            let atom = partition.atom_of(&lattice, o);
            let moved = partition.atom_of(&lattice, lattice.translate_point(o, shift));
            let expected = (lattice.translation(atom / 2) + shift).flatten() * 2 + atom % 2;
            assert_eq!(moved, expected);
        }

        let mut owned = vec![0; lattice.ngrid()];
        for atom in 0..lattice.ncell() * 2 {
            for p in partition.points_of(&lattice, atom) {
                assert_eq!(partition.atom_of(&lattice, p), atom);
                owned[p] += 1;
            }
        }
        assert!(owned.iter().all(|&n| n == 1));
        assert_eq!(partition.counts().iter().sum::<usize>(), lattice.ngrid_prim());
    }
}

#[test]
fn test_nearest_atom_partition_uses_distance() {
    let lattice = test_lattice([1, 1, 1]);
    let table = random_table(&lattice, 2);
    let grid = orbital_grid(&lattice, &table);
    let positions = vec![Vector3::new(0.5, 0.5, 0.5), Vector3::new(2.0, 1.5, 2.5)];
    // no atom within range: every point goes to the nearest one
    let partition =
        GridPartition::build(PartitionPolicy::NearestAtom { rcut: 0.0 }, &lattice, &grid, &positions).unwrap();
    for o in 0..lattice.ngrid() {
        let r = lattice.point_coords(o);
        let d0 = lattice.minimum_image(&r, &positions[0]).norm();
        let d1 = lattice.minimum_image(&r, &positions[1]).norm();
        let expected = if d0 <= d1 { 0 } else { 1 };
        assert_eq!(partition.atom_of(&lattice, o), expected);
    }
}

#[test]
fn test_nearest_atom_prefers_largest_orbital_in_range() {
    let lattice = test_lattice([1, 1, 1]);
    let mut rng = StdRng::seed_from_u64(30);
    // atom 1 carries much larger orbitals than atom 0 everywhere
    let values = DMatrix::from_fn(2 * NAO_PER_ATOM, lattice.ngrid(), |ao, _| {
        if ao < NAO_PER_ATOM {
            rng.gen_range(0.01..0.1)
        } else {
            rng.gen_range(1.0..2.0)
        }
    });
    let ao_atom = (0..2 * NAO_PER_ATOM).map(|ao| ao / NAO_PER_ATOM).collect();
    let positions = vec![Vector3::new(0.5, 0.5, 0.5), Vector3::new(2.0, 1.5, 2.5)];
    let table = TableEvaluator::new(values, ao_atom, positions.clone()).unwrap();
    let grid = orbital_grid(&lattice, &table);

    let rcut = 2.0;
    let partition =
        GridPartition::build(PartitionPolicy::NearestAtom { rcut }, &lattice, &grid, &positions).unwrap();
    let mut overridden = 0;
    for o in 0..lattice.ngrid() {
        let r = lattice.point_coords(o);
        let d0 = lattice.minimum_image(&r, &positions[0]).norm();
        let d1 = lattice.minimum_image(&r, &positions[1]).norm();
        let nearest = if d0 <= d1 { 0 } else { 1 };
        let expected = match (d0 <= rcut, d1 <= rcut) {
            (_, true) => 1,
            (true, false) => 0,
            (false, false) => nearest,
        };
        if expected != nearest {
            overridden += 1;
        }
        assert_eq!(partition.atom_of(&lattice, o), expected);
    }
    // (1, 1, 1) has both atoms in range and is nearest to atom 0
    assert!(overridden > 0);
    assert!(partition.counts()[0] > 0);
}

#[test]
fn test_translated_block_matches_gathered_block() {
    let lattice = test_lattice([1, 1, 2]);
    let table = random_table(&lattice, 3);
    let grid = orbital_grid(&lattice, &table);
    let positions = vec![Vector3::new(0.5, 0.5, 0.5), Vector3::new(2.0, 1.5, 2.5)];
    let partition = GridPartition::build(PartitionPolicy::default(), &lattice, &grid, &positions).unwrap();
    let shift = lattice.translation(1);

    for atom in 0..2 {
        let block = AtomGridBlock::gather(&lattice, &grid, atom, partition.points_of(&lattice, atom), 1e-8);
        let moved = block.translated(&lattice, 2, grid.nao_prim(), shift);
        assert_eq!(moved.atom, 2 + atom);
        assert_eq!(grid.block(&lattice, &moved.orbitals, &moved.grid_points), moved.values);

        let target = AtomGridBlock::gather(&lattice, &grid, 2 + atom, partition.points_of(&lattice, 2 + atom), 1e-8);
        assert_eq!(moved.grid_points, target.grid_points);
        let mut a = moved.orbitals.clone();
        let mut b = target.orbitals.clone();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
    }
}

#[test]
fn test_pivot_ties_go_to_first_column() {
    let mat = DMatrix::from_row_slice(2, 4, &[1.0, 2.0, 2.0, 0.5, 0.0, 0.0, 0.0, 0.5]);
    let result = pivoted_columns(&mat, 2, 1e-12);
    assert_eq!(result.pivots[0], 1);
    // column 2 is parallel to column 1 and vanishes after the first step
    assert_eq!(result.pivots[1], 3);
    assert_eq!(result.rank, 2);
}

#[test]
fn test_pivoting_stops_at_relative_cutoff() {
    let mat = DMatrix::from_row_slice(2, 3, &[1.0, 1.0, 0.0, 0.0, 0.0, 1e-12]);
    let result = pivoted_columns(&mat, 2, 1e-8);
    assert_eq!(result.pivots, vec![0]);
    assert_eq!(result.rank, 1);
}

#[test]
fn test_rank_target_above_candidates_selects_all() {
    let mat = DMatrix::from_element(3, 4, 1.0);
    let result = pivoted_columns(&mat, 4, 1e-10);
    assert_eq!(result.pivots, vec![0, 1, 2, 3]);
}

#[test]
fn test_selection_is_idempotent() {
    let lattice = test_lattice([1, 1, 2]);
    let table = random_table(&lattice, 4);
    let grid = orbital_grid(&lattice, &table);
    let positions = vec![Vector3::new(0.5, 0.5, 0.5), Vector3::new(2.0, 1.5, 2.5)];
    let partition = GridPartition::build(PartitionPolicy::default(), &lattice, &grid, &positions).unwrap();
    let params = test_settings().selection;

    let block = AtomGridBlock::gather(&lattice, &grid, 0, partition.points_of(&lattice, 0), 1e-8);
    let (first, rank) = select_block(&block, NAO_PER_ATOM, params.c, params.m, params.rela_cutoff, 7);
    assert!(rank > 0);

    let again = AtomGridBlock::gather(&lattice, &grid, 0, first.clone(), 1e-8);
    let (second, _) = select_block(&again, NAO_PER_ATOM, params.c, params.m, params.rela_cutoff, 7);
    let mut a = first;
    let mut b = second;
    a.sort_unstable();
    b.sort_unstable();
    assert_eq!(a, b);
}

#[test]
fn test_possible_ip_filter_keeps_home_cell() {
    let lattice = test_lattice([1, 1, 2]);
    let shift = lattice.translation(1);
    let home = 5;
    let image = lattice.translate_point(home, shift);
    let other = lattice.translate_point(9, shift);
    let kept = possible_ip_filter(&lattice, &[image, home, other]);
    assert_eq!(kept, vec![home, other]);
}

#[test]
fn test_ip_set_expansion() {
    let lattice = test_lattice([1, 1, 2]);
    let ip_set = IpSet::new(vec![(7, 1), (2, 0), (7, 1), (11, 0)], &[0, 1]);
    assert_eq!(ip_set.prim_points(), &[2, 7, 11]);
    assert_eq!(ip_set.owners(), &[0, 1, 0]);
    assert_eq!(ip_set.groups(), &[vec![0, 2], vec![1]]);

    let points = ip_set.supercell_points(&lattice);
    assert_eq!(points.len(), 6);
    let mut unique = points.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 6);
    assert_eq!(points[3], lattice.ordered_index(lattice.translation(1), 2));

    let groups = ip_set.supercell_groups(&lattice);
    assert_eq!(groups, vec![vec![0, 2], vec![1], vec![3, 5], vec![4]]);
}

#[test]
fn test_selected_ips_sorted_and_unique() {
    let engine = built_engine([1, 1, 2], 5);
    let ip_set = engine.ip_set().unwrap();
    assert!(!ip_set.is_empty());
    assert!(ip_set.prim_points().windows(2).all(|w| w[0] < w[1]));
    assert!(ip_set.prim_points().iter().all(|&p| p < engine.lattice().ngrid_prim()));
}

#[test]
fn test_group_selection_covers_groups() {
    let lattice = test_lattice([1, 1, 2]);
    let table = random_table(&lattice, 6);
    let mut settings = test_settings();
    settings.selection.groups = Some(vec![vec![0, 1]]);
    let mut engine = IsdfEngine::new(lattice, table, settings);
    engine.build().unwrap();
    let ip_set = engine.ip_set().unwrap();
    assert_eq!(ip_set.groups().len(), 1);
    assert_eq!(ip_set.groups()[0].len(), ip_set.len());

    let mut bad = test_settings();
    bad.selection.groups = Some(vec![vec![0], vec![0, 1]]);
    let lattice = test_lattice([1, 1, 2]);
    let mut engine = IsdfEngine::new(lattice.clone(), random_table(&lattice, 6), bad);
    assert!(matches!(engine.build(), Err(IsdfError::DimensionMismatch(_))));
}

#[test]
fn test_aux_basis_matches_brute_force() {
    let engine = built_engine([1, 1, 2], 7);
    let aux = engine.aux_basis().unwrap();
    let reference = engine.brute_force_aux_basis().unwrap();
    assert_eq!(aux.values.shape(), reference.values.shape());
    assert!(relative_error(&aux.values, &reference.values) < 1e-8);
    assert!(aux.residual < 1e-10);
    assert!(!aux.is_local());
    assert_eq!(engine.report().max_aux_residual, aux.residual);
    assert_eq!(engine.report().symmetry_violations().count(), 0);
}

#[test]
fn test_single_cell_uses_direct_path() {
    let engine = built_engine([1, 1, 1], 8);
    let aux = engine.aux_basis().unwrap();
    let reference = engine.brute_force_aux_basis().unwrap();
    assert_eq!(aux.values, reference.values);

    let metric = engine.metric().unwrap();
    let brute = engine.brute_force_metric().unwrap();
    assert_eq!(metric.blocks, brute.blocks);
}

#[test]
fn test_metric_matches_brute_force_and_is_hermitian() {
    let engine = built_engine([1, 1, 2], 9);
    let metric = engine.metric().unwrap();
    let brute = engine.brute_force_metric().unwrap();
    for (a, b) in metric.blocks.iter().zip(brute.blocks.iter()) {
        assert!(relative_error(a, b) < 1e-8);
    }
    assert!(metric.hermiticity < 1e-10);
    assert!(metric.v.is_none());

    let nip = metric.w0.nrows();
    let sum = metric.blocks.iter().fold(DMatrix::zeros(nip, nip), |acc, b| acc + b);
    assert!(relative_error(&metric.w0, &sum) < 1e-14);
    assert_eq!(metric.dense().ncols(), nip * engine.lattice().ncell());

    // W_t is the transpose of W_{-t}
    let lattice = engine.lattice();
    for t in lattice.translations() {
        let w = &metric.blocks[t.flatten()];
        let partner = metric.blocks[(-t).flatten()].transpose();
        assert!(relative_error(w, &partner) < 1e-10);
    }
}

#[test]
fn test_robust_fitting_keeps_potential() {
    let lattice = test_lattice([1, 1, 2]);
    let table = random_table(&lattice, 10);
    let settings = IsdfSettings {
        robust_fitting: true,
        ..test_settings()
    };
    let mut engine = IsdfEngine::new(lattice, table, settings);
    engine.build().unwrap();
    let v = engine.metric().unwrap().v.as_ref().unwrap();
    let brute = engine.brute_force_metric().unwrap();
    let reference = brute.v.as_ref().unwrap();
    assert!(relative_error(v, reference) < 1e-8);
}

#[test]
fn test_jk_match_brute_force() {
    let mut engine = built_engine([1, 1, 2], 11);
    let dm = random_symmetric(engine.nao(), 12);
    let (j, k) = engine.get_jk(&dm, true, true).unwrap();
    let (j_ref, k_ref) = engine.reference_jk(&dm, true, true).unwrap();
    let (j, k) = (j.unwrap(), k.unwrap());
    assert!(relative_error(&j, &j_ref.unwrap()) < 1e-6);
    assert!(relative_error(&k, &k_ref.unwrap()) < 1e-6);
}

#[test]
fn test_jk_single_cell_matches_brute_force() {
    let mut engine = built_engine([1, 1, 1], 13);
    let dm = random_symmetric(engine.nao(), 14);
    let (j, k) = engine.get_jk(&dm, true, true).unwrap();
    let (j_ref, k_ref) = engine.reference_jk(&dm, true, true).unwrap();
    assert!(relative_error(&j.unwrap(), &j_ref.unwrap()) < 1e-10);
    assert!(relative_error(&k.unwrap(), &k_ref.unwrap()) < 1e-10);
}

#[test]
fn test_jk_are_block_circulant() {
    let mut engine = built_engine([1, 1, 2], 15);
    let nao_prim = engine.nao_prim();
    let dm = random_symmetric(engine.nao(), 16);
    let (j, k) = engine.get_jk(&dm, true, true).unwrap();
    let lattice = engine.lattice().clone();
    for m in [j.unwrap(), k.unwrap()] {
        let first = first_row_blocks(&lattice, nao_prim, &m).unwrap();
        for r in lattice.translations() {
            for c in lattice.translations() {
                let block = m.view((r.flatten() * nao_prim, c.flatten() * nao_prim), (nao_prim, nao_prim));
                assert_eq!(block, first[(c - r).flatten()]);
            }
        }
    }
}

#[test]
fn test_jk_invariant_under_lattice_shift() {
    let mut engine = built_engine([1, 1, 2], 17);
    let nao_prim = engine.nao_prim();
    let lattice = engine.lattice().clone();
    let dm = random_symmetric(engine.nao(), 18);
    let (j, k) = engine.get_jk(&dm, true, true).unwrap();
    let (j, k) = (j.unwrap(), k.unwrap());

    for shift in lattice.translations() {
        let moved = shift_matrix(&lattice, nao_prim, &dm, shift);
        let (j_moved, k_moved) = engine.get_jk(&moved, true, true).unwrap();
        assert!(relative_error(&j_moved.unwrap(), &j) < 1e-12);
        assert!(relative_error(&k_moved.unwrap(), &k) < 1e-12);
        assert!(relative_error(&shift_matrix(&lattice, nao_prim, &j, shift), &j) < 1e-12);
        assert!(relative_error(&shift_matrix(&lattice, nao_prim, &k, shift), &k) < 1e-12);
    }

    let symmetric = symmetrize_density(&lattice, nao_prim, &dm).unwrap();
    let (j_sym, _) = engine.get_jk(&symmetric, true, false).unwrap();
    assert!(relative_error(&j_sym.unwrap(), &j) < 1e-12);
}

#[test]
fn test_pack_blocks_layout() {
    let lattice = Lattice::new([1.0; 3], [1, 2, 3], [1, 1, 1]).unwrap();
    let blocks: Vec<DMatrix<f64>> = (0..lattice.ncell())
        .map(|t| DMatrix::from_element(2, 2, t as f64))
        .collect();
    let packed = pack_blocks(&lattice, &blocks).unwrap();
    for r in lattice.translations() {
        for c in lattice.translations() {
            assert_eq!(packed[(r.flatten() * 2, c.flatten() * 2 + 1)], (c - r).flatten() as f64);
        }
    }
    assert!(pack_blocks(&lattice, &blocks[1..]).is_err());
}

#[test]
fn test_atomic_guess_density_counts_valence() {
    use periodic_table_on_an_enum::Element;
    let lattice = test_lattice([1, 1, 2]);
    let elements = vec![Element::Carbon, Element::Hydrogen];
    let ao_atom = vec![0, 0, 0, 0, 1];
    let dm = atomic_guess_density(&lattice, &elements, &ao_atom);
    assert_eq!(dm.nrows(), 10);
    assert!((dm.trace() - 2.0 * 5.0).abs() < 1e-12);
    assert_eq!(dm[(0, 0)], 1.0);
    assert_eq!(dm[(9, 9)], 1.0);
    assert_eq!(dm[(0, 1)], 0.0);
}

#[test]
fn test_contraction_requires_build() {
    let mut engine = random_engine([1, 1, 2], 19);
    let dm = DMatrix::identity(engine.nao(), engine.nao());
    assert_eq!(engine.get_jk(&dm, true, true).unwrap_err(), IsdfError::NotBuilt);
    assert!(matches!(engine.ip_set(), Err(IsdfError::NotBuilt)));
    assert!(matches!(engine.reference_jk(&dm, true, false), Err(IsdfError::NotBuilt)));
}

#[test]
fn test_wrong_density_shape_is_rejected() {
    let mut engine = built_engine([1, 1, 2], 20);
    let dm = DMatrix::identity(3, 3);
    assert!(matches!(engine.get_jk(&dm, true, false), Err(IsdfError::DimensionMismatch(_))));
}

#[test]
fn test_uneven_kmesh_matches_brute_force() {
    let mut engine = built_engine([2, 1, 3], 31);
    let aux = engine.aux_basis().unwrap();
    let reference = engine.brute_force_aux_basis().unwrap();
    assert!(relative_error(&aux.values, &reference.values) < 1e-8);

    let metric = engine.metric().unwrap();
    let brute = engine.brute_force_metric().unwrap();
    for (a, b) in metric.blocks.iter().zip(brute.blocks.iter()) {
        assert!(relative_error(a, b) < 1e-8);
    }
    assert_eq!(engine.report().symmetry_violations().count(), 0);

    let dm = random_symmetric(engine.nao(), 32);
    let (j, k) = engine.get_jk(&dm, true, true).unwrap();
    let (j_ref, k_ref) = engine.reference_jk(&dm, true, true).unwrap();
    assert!(relative_error(&j.unwrap(), &j_ref.unwrap()) < 1e-6);
    assert!(relative_error(&k.unwrap(), &k_ref.unwrap()) < 1e-6);
}

#[test]
fn test_robust_jk_match_brute_force() {
    let robust = IsdfSettings {
        robust_fitting: true,
        ..test_settings()
    };
    for (kmesh, tolerance) in [([1, 1, 1], 1e-10), ([1, 1, 2], 1e-6), ([2, 1, 3], 1e-6)] {
        let mut engine = engine_with(kmesh, 33, robust.clone());
        let dm = random_symmetric(engine.nao(), 34);
        let (j, k) = engine.get_jk(&dm, true, true).unwrap();
        let (j, k) = (j.unwrap(), k.unwrap());
        let (j_ref, k_ref) = engine.reference_jk(&dm, true, true).unwrap();
        assert!(relative_error(&j, &j_ref.unwrap()) < tolerance);
        assert!(relative_error(&k, &k_ref.unwrap()) < tolerance);
        assert!(relative_error(&k, &k.transpose()) < 1e-10);

        // the correction changes the result
        let mut plain = engine_with(kmesh, 33, test_settings());
        let (j_plain, k_plain) = plain.get_jk(&dm, true, true).unwrap();
        assert!(relative_error(&j, &j_plain.unwrap()) > 1e-12);
        assert!(relative_error(&k, &k_plain.unwrap()) > 1e-12);
    }
}

#[test]
fn test_robust_metric_without_grid_orbitals_is_rejected() {
    let engine = engine_with(
        [1, 1, 2],
        35,
        IsdfSettings {
            robust_fitting: true,
            ..test_settings()
        },
    );
    let lattice = engine.lattice();
    let table = random_table(lattice, 35);
    let grid = orbital_grid(lattice, &table);
    let ip_orbitals = super::aux_basis::ip_orbital_blocks(lattice, &grid, engine.ip_set().unwrap());
    let backend = RustFftBackend::new();
    let contractor = JkContractor::new(lattice, &ip_orbitals, engine.metric().unwrap(), &backend);
    let d_blocks = vec![DMatrix::identity(engine.nao_prim(), engine.nao_prim()); lattice.ncell()];
    assert!(matches!(contractor.j_blocks(&d_blocks), Err(IsdfError::DimensionMismatch(_))));
}

#[test]
fn test_single_group_local_fit_equals_global_fit() {
    let engine = engine_with([1, 1, 1], 36, grouped_settings(vec![vec![0, 1]]));
    let aux = engine.aux_basis().unwrap();
    assert!(aux.is_local());
    let support = aux.support.as_ref().unwrap();
    assert!(support.iter().all(|s| s.len() == engine.lattice().ngrid()));

    let reference = engine.brute_force_aux_basis().unwrap();
    assert!(relative_error(&aux.values, &reference.values) < 1e-12);
}

#[test]
fn test_local_fit_stays_on_group_sector() {
    let engine = engine_with([1, 1, 2], 37, grouped_settings(vec![vec![0], vec![1]]));
    let lattice = engine.lattice();
    let aux = engine.aux_basis().unwrap();
    let ip_set = engine.ip_set().unwrap();
    let partition = engine.partition().unwrap();
    let support = aux.support.as_ref().unwrap();

    for (i, &owner) in ip_set.owners().iter().enumerate() {
        let home = partition.home_image(ip_set.prim_points()[i]);
        let mut sector: Vec<usize> = partition
            .points_of(lattice, owner)
            .into_iter()
            .map(|o| lattice.translate_point(o, -home))
            .collect();
        sector.sort_unstable();
        assert_eq!(support[i], sector);
        for o in 0..lattice.ngrid() {
            if sector.binary_search(&o).is_err() {
                assert_eq!(aux.values[(i, o)], 0.0);
            }
        }
    }
    assert!(aux.residual < 1e-10);
    assert_eq!(engine.report().symmetry_violations().count(), 0);
}

#[test]
fn test_local_metric_matches_momentum_metric() {
    let engine = engine_with([1, 1, 2], 38, grouped_settings(vec![vec![0], vec![1]]));
    let lattice = engine.lattice();
    let aux = engine.aux_basis().unwrap();
    let local = engine.metric().unwrap();

    let backend = RustFftBackend::new();
    let coulg = BareCoulomb.coulomb_g(lattice);
    let momentum = MetricBuilder::new(engine.settings(), &backend)
        .build(lattice, aux, &coulg, &mut ScratchArena::new(), &mut BuildReport::default())
        .unwrap();
    let brute = engine.brute_force_metric().unwrap();
    for t in 0..lattice.ncell() {
        assert!(relative_error(&local.blocks[t], &momentum.blocks[t]) < 1e-8);
        assert!(relative_error(&local.blocks[t], &brute.blocks[t]) < 1e-10);
    }
    assert!(local.hermiticity < 1e-10);
}

#[test]
fn test_local_jk_match_brute_force() {
    let mut settings = grouped_settings(vec![vec![0], vec![1]]);
    for robust_fitting in [false, true] {
        settings.robust_fitting = robust_fitting;
        let mut engine = engine_with([1, 1, 2], 39, settings.clone());
        assert_eq!(engine.metric().unwrap().v.is_some(), robust_fitting);
        let dm = random_symmetric(engine.nao(), 40);
        let (j, k) = engine.get_jk(&dm, true, true).unwrap();
        let (j_ref, k_ref) = engine.reference_jk(&dm, true, true).unwrap();
        assert!(relative_error(&j.unwrap(), &j_ref.unwrap()) < 1e-6);
        assert!(relative_error(&k.unwrap(), &k_ref.unwrap()) < 1e-6);
    }
}

#[test]
fn test_metric_workers_reuse_planned_scratch() {
    let engine = built_engine([1, 1, 2], 41);
    let lattice = engine.lattice();
    let aux = engine.aux_basis().unwrap();
    let backend = RustFftBackend::new();
    let worker_scratch = rayon::current_num_threads() * backend.scratch_len(lattice.mesh_prim()).max(1);
    let plan = ArenaPlan::new(lattice, engine.nao_prim(), aux.nip(), worker_scratch);

    let mut arena = ScratchArena::new();
    arena.ensure(&plan);
    let grown = arena.grow_count();
    let coulg = BareCoulomb.coulomb_g(lattice);
    let builder = MetricBuilder::new(engine.settings(), &backend);
    for _ in 0..2 {
        let metric = builder
            .build(lattice, aux, &coulg, &mut arena, &mut BuildReport::default())
            .unwrap();
        for (a, b) in metric.blocks.iter().zip(engine.metric().unwrap().blocks.iter()) {
            assert!(relative_error(a, b) < 1e-14);
        }
    }
    assert_eq!(arena.grow_count(), grown);
}

/// Orbitals whose owner table disagrees with the atom list.
struct MislabelledOrbitals {
    ao_atom: Vec<usize>,
}

impl GridEvaluator for MislabelledOrbitals {
    fn nao(&self) -> usize {
        3
    }

    fn ao_atom(&self) -> Vec<usize> {
        self.ao_atom.clone()
    }

    fn atom_positions(&self) -> Vec<Vector3<f64>> {
        vec![Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0)]
    }

    fn evaluate(&self, _lattice: &Lattice, _points: &[usize]) -> DMatrix<f64> {
        panic!("orbitals evaluated before their metadata was checked")
    }
}

#[test]
fn test_orbital_metadata_checked_before_evaluation() {
    for ao_atom in [vec![0, 2, 0], vec![0, 1]] {
        let mut engine = IsdfEngine::new(test_lattice([1, 1, 2]), MislabelledOrbitals { ao_atom }, test_settings());
        assert!(matches!(engine.build(), Err(IsdfError::DimensionMismatch(_))));
        assert!(!engine.is_built());
    }
}

/// Solver without a working Cholesky path, so every solve goes through the
/// eigen fallback.
struct CholeskyFreeSolver;

impl LinearSolver for CholeskyFreeSolver {
    fn solve_real_spd(&self, _a: &DMatrix<f64>, _b: &DMatrix<f64>, block: &str) -> Result<DMatrix<f64>> {
        Err(IsdfError::SolveFailure {
            block: block.to_string(),
            reason: "no Cholesky".to_string(),
        })
    }

    fn solve_hermitian(
        &self,
        _a: &DMatrix<Complex64>,
        _b: &DMatrix<Complex64>,
        block: &str,
    ) -> Result<DMatrix<Complex64>> {
        Err(IsdfError::SolveFailure {
            block: block.to_string(),
            reason: "no Cholesky".to_string(),
        })
    }

    fn solve_hermitian_eigen(
        &self,
        a: &DMatrix<Complex64>,
        b: &DMatrix<Complex64>,
        cutoff: f64,
        block: &str,
    ) -> Result<DMatrix<Complex64>> {
        DenseSolver.solve_hermitian_eigen(a, b, cutoff, block)
    }
}

fn residual_violations(report: &BuildReport) -> usize {
    report
        .symmetry_violations()
        .filter(|e| {
            matches!(e, IsdfError::SymmetryViolation { context, .. } if context == "auxiliary basis solve residual")
        })
        .count()
}

#[test]
fn test_truncated_aux_solve_is_reported() {
    let build = |eigen_cutoff: f64, strict: bool| {
        let lattice = test_lattice([1, 1, 2]);
        let table = random_table(&lattice, 42);
        let settings = IsdfSettings {
            eigen_cutoff,
            strict,
            ..test_settings()
        };
        let mut engine = IsdfEngine::new(lattice, table, settings).with_solver(Box::new(CholeskyFreeSolver));
        let result = engine.build();
        (engine, result)
    };

    let (engine, result) = build(1e-18, false);
    result.unwrap();
    assert_eq!(residual_violations(engine.report()), 0);

    // keeping only the eigenvalues above half the largest leaves most of B unfitted
    let (engine, result) = build(0.5, false);
    result.unwrap();
    assert!(residual_violations(engine.report()) >= 1);
    let residual = engine.aux_basis().unwrap().residual;
    assert!(residual > engine.settings().symmetry_tolerance);
    assert_eq!(engine.report().max_aux_residual, residual);

    let (engine, result) = build(0.5, true);
    match result {
        Err(IsdfError::SymmetryViolation { context, deviation, .. }) => {
            assert_eq!(context, "auxiliary basis solve residual");
            assert!(deviation > 1e-8);
        }
        other => panic!("expected a symmetry violation, got {:?}", other),
    }
    assert!(!engine.is_built());
}

/// Dense solver that starts failing once armed.
struct ArmedSolver {
    armed: Arc<AtomicBool>,
}

impl ArmedSolver {
    fn check(&self, block: &str) -> Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(IsdfError::SolveFailure {
                block: block.to_string(),
                reason: "armed".to_string(),
            });
        }
        Ok(())
    }
}

impl LinearSolver for ArmedSolver {
    fn solve_real_spd(&self, a: &DMatrix<f64>, b: &DMatrix<f64>, block: &str) -> Result<DMatrix<f64>> {
        self.check(block)?;
        DenseSolver.solve_real_spd(a, b, block)
    }

    fn solve_hermitian(
        &self,
        a: &DMatrix<Complex64>,
        b: &DMatrix<Complex64>,
        block: &str,
    ) -> Result<DMatrix<Complex64>> {
        self.check(block)?;
        DenseSolver.solve_hermitian(a, b, block)
    }

    fn solve_hermitian_eigen(
        &self,
        a: &DMatrix<Complex64>,
        b: &DMatrix<Complex64>,
        cutoff: f64,
        block: &str,
    ) -> Result<DMatrix<Complex64>> {
        self.check(block)?;
        DenseSolver.solve_hermitian_eigen(a, b, cutoff, block)
    }
}

#[test]
fn test_failed_build_clears_cache() {
    let armed = Arc::new(AtomicBool::new(false));
    let mut engine = random_engine([1, 1, 2], 21).with_solver(Box::new(ArmedSolver {
        armed: armed.clone(),
    }));
    engine.build().unwrap();
    assert!(engine.is_built());

    armed.store(true, Ordering::SeqCst);
    match engine.build() {
        Err(IsdfError::SolveFailure { block, .. }) => assert!(block.starts_with("aux k=")),
        other => panic!("expected a solve failure, got {:?}", other),
    }
    assert!(!engine.is_built());
    let dm = DMatrix::identity(engine.nao(), engine.nao());
    assert_eq!(engine.get_jk(&dm, true, true).unwrap_err(), IsdfError::NotBuilt);
}

#[test]
fn test_arena_is_reused_across_contractions() {
    let mut engine = built_engine([1, 1, 2], 22);
    let nip = engine.ip_set().unwrap().len();
    let plan = ArenaPlan::new(engine.lattice(), engine.nao_prim(), nip, 0);
    assert!(engine.arena_capacity() >= plan.required());

    let grown = engine.arena_grow_count();
    let dm = random_symmetric(engine.nao(), 23);
    engine.get_jk(&dm, true, true).unwrap();
    engine.get_jk(&dm, true, true).unwrap();
    assert_eq!(engine.arena_grow_count(), grown);
}

#[test]
fn test_rank_floor_is_reported_not_fatal() {
    let lattice = test_lattice([1, 1, 2]);
    let table = random_table(&lattice, 24);
    let mut settings = test_settings();
    settings.selection.rank_floor = Some(1000);
    let mut engine = IsdfEngine::new(lattice, table, settings);
    engine.build().unwrap();
    assert_eq!(engine.report().rank_deficiencies().count(), 2);

    let mut report = BuildReport::default();
    assert!(report
        .record(
            IsdfError::RankDeficiency {
                group: 0,
                rank: 1,
                floor: 2
            },
            true
        )
        .is_ok());
}
