// Interpolative separable density fitting for periodic J/K builds

pub mod app;
pub mod arena;
pub mod backend;
pub mod config;
pub mod error;
pub mod io;
pub mod isdf_impl;
pub mod lattice;
pub mod orbitals;

pub use error::{BuildReport, IsdfError, Result};
pub use isdf_impl::{IsdfEngine, IsdfSettings};
pub use lattice::{Lattice, LatticeIndex};
