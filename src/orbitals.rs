//! Atomic orbital values on the periodic real-space grid.
//!
//! An evaluator describes the orbitals of one primitive cell. Values are
//! periodic over the whole supercell; the orbitals of the other primitive
//! cells are obtained by translating grid indices, never by re-evaluation.

extern crate nalgebra as na;

use crate::error::{IsdfError, Result};
use crate::lattice::Lattice;
use itertools::iproduct;
use na::{DMatrix, Vector3};
use periodic_table_on_an_enum::Element;
use rayon::prelude::*;
use std::f64::consts::PI;

pub trait GridEvaluator: Send + Sync {
    /// Number of primitive-cell orbitals.
    fn nao(&self) -> usize;

    /// Primitive-cell atom owning each orbital.
    fn ao_atom(&self) -> Vec<usize>;

    fn atom_positions(&self) -> Vec<Vector3<f64>>;

    fn natm(&self) -> usize {
        self.atom_positions().len()
    }

    /// Orbital values (nao x npts) at ordered supercell grid points.
    /// Must be deterministic.
    fn evaluate(&self, lattice: &Lattice, points: &[usize]) -> DMatrix<f64>;
}

fn factorial(n: i32) -> f64 {
    (1..=n).fold(1.0, |acc, x| acc * x as f64)
}

/// Normalization of `x^l exp(-alpha x^2)` on the real line.
fn norm_1d(alpha: f64, l: i32) -> f64 {
    let numerator = 2.0_f64.powi(3 * l) * factorial(l) * alpha.powi(l);
    let n_squared = numerator * (2.0 * alpha / PI).sqrt() / factorial(2 * l);
    n_squared.sqrt()
}

#[derive(Debug, Clone, Copy)]
struct CartesianGaussian {
    atom: usize,
    alpha: f64,
    l_xyz: [i32; 3],
    norm: f64,
}

impl CartesianGaussian {
    fn new(atom: usize, alpha: f64, l_xyz: [i32; 3]) -> Self {
        let norm = norm_1d(alpha, l_xyz[0]) * norm_1d(alpha, l_xyz[1]) * norm_1d(alpha, l_xyz[2]);
        Self {
            atom,
            alpha,
            l_xyz,
            norm,
        }
    }

    fn evaluate(&self, d: &Vector3<f64>) -> f64 {
        self.norm
            * d.x.powi(self.l_xyz[0])
            * d.y.powi(self.l_xyz[1])
            * d.z.powi(self.l_xyz[2])
            * (-self.alpha * d.norm_squared()).exp()
    }
}

/// One s and, optionally, three p Cartesian Gaussians per atom of an
/// orthorhombic primitive cell.
#[derive(Debug, Clone)]
pub struct GaussianOrbitals {
    elements: Vec<Element>,
    positions: Vec<Vector3<f64>>,
    functions: Vec<CartesianGaussian>,
}

impl GaussianOrbitals {
    pub fn new(
        elements: Vec<Element>,
        positions: Vec<Vector3<f64>>,
        exponents: &[f64],
        with_p: bool,
    ) -> Result<Self> {
        if elements.len() != positions.len() || elements.len() != exponents.len() {
            return Err(IsdfError::DimensionMismatch(format!(
                "{} elements, {} positions and {} exponents given",
                elements.len(),
                positions.len(),
                exponents.len()
            )));
        }
        let mut functions = Vec::new();
        for (atom, &alpha) in exponents.iter().enumerate() {
            functions.push(CartesianGaussian::new(atom, alpha, [0, 0, 0]));
            if with_p {
                functions.push(CartesianGaussian::new(atom, alpha, [1, 0, 0]));
                functions.push(CartesianGaussian::new(atom, alpha, [0, 1, 0]));
                functions.push(CartesianGaussian::new(atom, alpha, [0, 0, 1]));
            }
        }
        Ok(Self {
            elements,
            positions,
            functions,
        })
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }
}

impl GridEvaluator for GaussianOrbitals {
    fn nao(&self) -> usize {
        self.functions.len()
    }

    fn ao_atom(&self) -> Vec<usize> {
        self.functions.iter().map(|f| f.atom).collect()
    }

    fn atom_positions(&self) -> Vec<Vector3<f64>> {
        self.positions.clone()
    }

    fn evaluate(&self, lattice: &Lattice, points: &[usize]) -> DMatrix<f64> {
        let l = lattice.supercell_lengths();
        let images: Vec<Vector3<f64>> = iproduct!(-1..=1, -1..=1, -1..=1)
            .map(|(i, j, k)| Vector3::new(i as f64 * l.x, j as f64 * l.y, k as f64 * l.z))
            .collect();

        let values: Vec<f64> = points
            .par_iter()
            .flat_map_iter(|&o| {
                let r = lattice.point_coords(o);
                self.functions
                    .iter()
                    .map(|f| {
                        let d0 = lattice.minimum_image(&r, &self.positions[f.atom]);
                        images.iter().map(|shift| f.evaluate(&(d0 + shift))).sum::<f64>()
                    })
                    .collect::<Vec<f64>>()
            })
            .collect();

        DMatrix::from_vec(self.nao(), points.len(), values)
    }
}

/// Orbital values tabulated on the ordered supercell grid.
#[derive(Debug, Clone)]
pub struct TableEvaluator {
    values: DMatrix<f64>,
    ao_atom: Vec<usize>,
    positions: Vec<Vector3<f64>>,
}

impl TableEvaluator {
    pub fn new(values: DMatrix<f64>, ao_atom: Vec<usize>, positions: Vec<Vector3<f64>>) -> Result<Self> {
        if values.nrows() != ao_atom.len() || ao_atom.iter().any(|&a| a >= positions.len()) {
            return Err(IsdfError::DimensionMismatch(
                "orbital table rows do not match the orbital-to-atom map".to_string(),
            ));
        }
        Ok(Self {
            values,
            ao_atom,
            positions,
        })
    }
}

impl GridEvaluator for TableEvaluator {
    fn nao(&self) -> usize {
        self.values.nrows()
    }

    fn ao_atom(&self) -> Vec<usize> {
        self.ao_atom.clone()
    }

    fn atom_positions(&self) -> Vec<Vector3<f64>> {
        self.positions.clone()
    }

    fn evaluate(&self, _lattice: &Lattice, points: &[usize]) -> DMatrix<f64> {
        self.values.select_columns(points.iter())
    }
}
