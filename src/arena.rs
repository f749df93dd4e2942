//! One preallocated complex scratch region reused by every build stage.
//!
//! A call borrows the region through an [`ArenaFrame`]; every slice handed
//! out by the frame is exclusively owned for the frame's lifetime and is
//! overwritten by the next frame, which the borrow checker enforces.

use crate::error::{IsdfError, Result};
use crate::lattice::Lattice;
use num_complex::Complex64;
use tracing::debug;

/// Worst-case complex element counts of each stage. The arena is sized to
/// the maximum over stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaPlan {
    pub aux_basis: usize,
    pub metric: usize,
    pub contraction: usize,
}

impl ArenaPlan {
    /// `worker_scratch` is the FFT scratch of all metric workers together.
    pub fn new(lattice: &Lattice, nao_prim: usize, nip_prim: usize, worker_scratch: usize) -> Self {
        let ncell = lattice.ncell();
        let ngrid_prim = lattice.ngrid_prim();
        let aux_basis = ncell * nip_prim * nip_prim.max(ngrid_prim);
        let metric = aux_basis.max(nip_prim * ngrid_prim + worker_scratch);
        // the grid-orbital terms are only reached with robust fitting
        let contraction = ncell
            * [
                nao_prim * nao_prim,
                nao_prim * nip_prim,
                nip_prim * nip_prim,
                nao_prim * ngrid_prim,
                nip_prim * ngrid_prim,
            ]
            .into_iter()
            .max()
            .unwrap_or(0);
        Self {
            aux_basis,
            metric,
            contraction,
        }
    }

    pub fn required(&self) -> usize {
        self.aux_basis.max(self.metric).max(self.contraction)
    }
}

#[derive(Debug, Default)]
pub struct ScratchArena {
    storage: Vec<Complex64>,
    grow_count: usize,
}

impl ScratchArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&mut self, plan: &ArenaPlan) {
        self.reserve(plan.required());
    }

    /// Grow to at least `len` elements. Never shrinks.
    pub fn reserve(&mut self, len: usize) {
        if len > self.storage.len() {
            debug!(
                "Growing scratch arena from {} to {} complex elements",
                self.storage.len(),
                len
            );
            self.storage.resize(len, Complex64::default());
            self.grow_count += 1;
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn grow_count(&self) -> usize {
        self.grow_count
    }

    pub fn frame(&mut self) -> ArenaFrame<'_> {
        ArenaFrame {
            rest: &mut self.storage,
        }
    }
}

pub struct ArenaFrame<'a> {
    rest: &'a mut [Complex64],
}

impl<'a> ArenaFrame<'a> {
    /// Hand out a zeroed slice disjoint from every other slice of this frame.
    pub fn acquire(&mut self, len: usize) -> Result<&'a mut [Complex64]> {
        if len > self.rest.len() {
            return Err(IsdfError::DimensionMismatch(format!(
                "scratch arena exhausted: requested {} elements, {} left",
                len,
                self.rest.len()
            )));
        }
        let rest = std::mem::take(&mut self.rest);
        let (head, tail) = rest.split_at_mut(len);
        self.rest = tail;
        head.fill(Complex64::default());
        Ok(head)
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}
