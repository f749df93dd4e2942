use super::TransformBackend;
use crate::error::{IsdfError, Result};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::sync::{Arc, Mutex};

/// [`TransformBackend`] on top of `rustfft`, one axis at a time.
pub struct RustFftBackend {
    planner: Mutex<FftPlanner<f64>>,
}

impl Default for RustFftBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RustFftBackend {
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(FftPlanner::new()),
        }
    }

    fn plan(&self, len: usize, inverse: bool) -> Arc<dyn Fft<f64>> {
        // plans are cached by the planner
        let mut planner = self.planner.lock().unwrap_or_else(|e| e.into_inner());
        if inverse {
            planner.plan_fft_inverse(len)
        } else {
            planner.plan_fft_forward(len)
        }
    }

    fn transform(
        &self,
        data: &mut [Complex64],
        shape: [usize; 3],
        inverse: bool,
        scratch: &mut [Complex64],
    ) -> Result<()> {
        let total: usize = shape.iter().product();
        if data.len() != total {
            return Err(IsdfError::DimensionMismatch(format!(
                "FFT buffer of length {} does not match shape {:?}",
                data.len(),
                shape
            )));
        }

        for axis in 0..3 {
            let n = shape[axis];
            if n <= 1 {
                continue;
            }
            let fft = self.plan(n, inverse);
            let need = n + fft.get_inplace_scratch_len();
            if scratch.len() < need {
                return Err(IsdfError::DimensionMismatch(format!(
                    "FFT scratch of length {} is shorter than {}",
                    scratch.len(),
                    need
                )));
            }
            let (line, fft_scratch) = scratch[..need].split_at_mut(n);
            let stride: usize = shape[axis + 1..].iter().product();

            // the last axis is contiguous and transforms in place
            if stride == 1 {
                for chunk in data.chunks_exact_mut(n) {
                    fft.process_with_scratch(chunk, fft_scratch);
                }
                continue;
            }
            let outer = total / (n * stride);
            for o in 0..outer {
                for s in 0..stride {
                    let base = o * n * stride + s;
                    for (i, z) in line.iter_mut().enumerate() {
                        *z = data[base + i * stride];
                    }
                    fft.process_with_scratch(line, fft_scratch);
                    for (i, z) in line.iter().enumerate() {
                        data[base + i * stride] = *z;
                    }
                }
            }
        }

        if inverse {
            let scale = 1.0 / total as f64;
            data.iter_mut().for_each(|z| *z *= scale);
        }
        Ok(())
    }
}

impl TransformBackend for RustFftBackend {
    fn scratch_len(&self, shape: [usize; 3]) -> usize {
        shape
            .iter()
            .filter(|&&n| n > 1)
            .map(|&n| {
                let forward = self.plan(n, false).get_inplace_scratch_len();
                let inverse = self.plan(n, true).get_inplace_scratch_len();
                n + forward.max(inverse)
            })
            .max()
            .unwrap_or(0)
    }

    fn forward_3d_with_scratch(
        &self,
        data: &mut [Complex64],
        shape: [usize; 3],
        scratch: &mut [Complex64],
    ) -> Result<()> {
        self.transform(data, shape, false, scratch)
    }

    fn inverse_3d_with_scratch(
        &self,
        data: &mut [Complex64],
        shape: [usize; 3],
        scratch: &mut [Complex64],
    ) -> Result<()> {
        self.transform(data, shape, true, scratch)
    }
}
