//! Services injected into the ISDF builders: multi-dimensional transforms,
//! dense solves and the reciprocal-space Coulomb kernel.
//!
//! The builders only see these traits, so a different FFT or LAPACK-style
//! backend can be swapped in at construction time.

extern crate nalgebra as na;

mod fft;
mod kernel;
mod linalg;


pub use fft::RustFftBackend;
pub use kernel::{fft_freq, BareCoulomb};
pub use linalg::DenseSolver;

use crate::error::Result;
use crate::lattice::Lattice;
use na::DMatrix;
use num_complex::Complex64;

/// In-place discrete Fourier transforms over a row-major 3D block.
///
/// The `*_with_scratch` variants take caller-owned scratch of at least
/// [`scratch_len`](TransformBackend::scratch_len) elements, so a worker can
/// reuse one buffer across many transforms.
pub trait TransformBackend: Send + Sync {
    /// Scratch elements a transform of `shape` needs.
    fn scratch_len(&self, shape: [usize; 3]) -> usize;

    /// Unnormalized forward transform, `exp(-2πi k·x/n)`.
    fn forward_3d_with_scratch(
        &self,
        data: &mut [Complex64],
        shape: [usize; 3],
        scratch: &mut [Complex64],
    ) -> Result<()>;

    /// Inverse transform normalized by `1/N`.
    fn inverse_3d_with_scratch(
        &self,
        data: &mut [Complex64],
        shape: [usize; 3],
        scratch: &mut [Complex64],
    ) -> Result<()>;

    fn forward_3d(&self, data: &mut [Complex64], shape: [usize; 3]) -> Result<()> {
        let mut scratch = vec![Complex64::default(); self.scratch_len(shape)];
        self.forward_3d_with_scratch(data, shape, &mut scratch)
    }

    fn inverse_3d(&self, data: &mut [Complex64], shape: [usize; 3]) -> Result<()> {
        let mut scratch = vec![Complex64::default(); self.scratch_len(shape)];
        self.inverse_3d_with_scratch(data, shape, &mut scratch)
    }
}

/// Dense linear solves. `block` names the system in error messages.
pub trait LinearSolver: Send + Sync {
    fn solve_real_spd(&self, a: &DMatrix<f64>, b: &DMatrix<f64>, block: &str)
        -> Result<DMatrix<f64>>;

    fn solve_hermitian(
        &self,
        a: &DMatrix<Complex64>,
        b: &DMatrix<Complex64>,
        block: &str,
    ) -> Result<DMatrix<Complex64>>;

    /// Pseudo-inverse solve through an eigen-decomposition, discarding
    /// eigenvalues below `cutoff` times the largest one.
    fn solve_hermitian_eigen(
        &self,
        a: &DMatrix<Complex64>,
        b: &DMatrix<Complex64>,
        cutoff: f64,
        block: &str,
    ) -> Result<DMatrix<Complex64>>;

    fn solve_real_eigen(
        &self,
        a: &DMatrix<f64>,
        b: &DMatrix<f64>,
        cutoff: f64,
        block: &str,
    ) -> Result<DMatrix<f64>> {
        let a = a.map(|x| Complex64::new(x, 0.0));
        let b = b.map(|x| Complex64::new(x, 0.0));
        Ok(self.solve_hermitian_eigen(&a, &b, cutoff, block)?.map(|z| z.re))
    }
}

/// Reciprocal-space Coulomb kernel over the full supercell mesh, in natural
/// (row-major, FFT) order.
pub trait CoulombKernel: Send + Sync {
    fn coulomb_g(&self, lattice: &Lattice) -> Vec<f64>;
}
