use super::CoulombKernel;
use crate::lattice::Lattice;
use itertools::iproduct;
use nalgebra::Vector3;
use std::f64::consts::PI;

/// Signed integer frequency of FFT index `i` on an axis of length `n`.
pub fn fft_freq(i: usize, n: usize) -> f64 {
    if i < (n + 1) / 2 {
        i as f64
    } else {
        i as f64 - n as f64
    }
}

/// Bare Coulomb kernel `4π/|G|²` with the `G = 0` term dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct BareCoulomb;

impl CoulombKernel for BareCoulomb {
    fn coulomb_g(&self, lattice: &Lattice) -> Vec<f64> {
        let n = lattice.mesh();
        let l = lattice.supercell_lengths();
        iproduct!(0..n[0], 0..n[1], 0..n[2])
            .map(|(x, y, z)| {
                let g = Vector3::new(
                    2.0 * PI * fft_freq(x, n[0]) / l.x,
                    2.0 * PI * fft_freq(y, n[1]) / l.y,
                    2.0 * PI * fft_freq(z, n[2]) / l.z,
                );
                let g2 = g.norm_squared();
                if g2 == 0.0 {
                    0.0
                } else {
                    4.0 * PI / g2
                }
            })
            .collect()
    }
}
