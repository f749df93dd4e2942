//! Configuration management for ISDF runs
//!
//! This module handles the YAML configuration structures and their defaults.

mod args;

pub use args::Args;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub cell: CellConfig,
    pub geometry: Vec<Atom>,
    pub orbitals: Option<OrbitalParams>,
    #[serde(default)]
    pub isdf: IsdfParams,
}

/// Orthorhombic primitive cell tiled `kmesh` times
#[derive(Debug, Deserialize, Serialize)]
pub struct CellConfig {
    pub lengths: [f64; 3],
    pub kmesh: [usize; 3],
    /// Real-space mesh of one primitive cell
    pub mesh: Option<[usize; 3]>,
    /// Real-space mesh of the whole supercell, split over `kmesh`
    pub supercell_mesh: Option<[usize; 3]>,
    /// "bohr" (default) or "angstrom", for lengths and atom coordinates
    pub unit: Option<String>,
}

/// Atomic position in the primitive cell
#[derive(Debug, Deserialize, Serialize)]
pub struct Atom {
    pub element: String,
    pub coords: [f64; 3],
}

/// Gaussian orbitals placed on every atom
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OrbitalParams {
    /// Exponent per element symbol
    pub exponents: Option<HashMap<String, f64>>,
    pub default_exponent: Option<f64>,
    pub with_p: Option<bool>,
}

impl Default for OrbitalParams {
    fn default() -> Self {
        OrbitalParams {
            exponents: Some(HashMap::new()),
            default_exponent: Some(0.5),
            with_p: Some(true),
        }
    }
}

impl OrbitalParams {
    /// Apply default values to any missing parameters
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.exponents.is_none() {
            self.exponents = defaults.exponents;
        }
        if self.default_exponent.is_none() {
            self.default_exponent = defaults.default_exponent;
        }
        if self.with_p.is_none() {
            self.with_p = defaults.with_p;
        }
        self
    }

    pub fn exponent(&self, symbol: &str) -> f64 {
        self.exponents
            .as_ref()
            .and_then(|e| e.get(symbol).copied())
            .or(self.default_exponent)
            .unwrap_or(0.5)
    }
}

/// ISDF fitting parameters
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IsdfParams {
    pub c: Option<usize>,
    pub m: Option<usize>,
    pub rela_cutoff: Option<f64>,
    pub rank_floor: Option<usize>,
    pub orbital_cutoff: Option<f64>,
    pub seed: Option<u64>,
    /// Primitive atom indices per group for the second selection pass
    pub groups: Option<Vec<Vec<usize>>>,
    pub group_c: Option<usize>,
    /// "largest_orbital" or "nearest_atom"
    pub partition: Option<String>,
    pub rcut: Option<f64>,
    pub aux_cutoff: Option<f64>,
    pub symmetry_tolerance: Option<f64>,
    pub eigen_fallback: Option<bool>,
    pub eigen_cutoff: Option<f64>,
    pub robust_fitting: Option<bool>,
    pub strict: Option<bool>,
    pub brute_force_check: Option<bool>,
}

impl Default for IsdfParams {
    fn default() -> Self {
        IsdfParams {
            c: Some(5),
            m: Some(5),
            rela_cutoff: Some(1e-10),
            rank_floor: None,
            orbital_cutoff: Some(1e-8),
            seed: Some(20240611),
            groups: None,
            group_c: None,
            partition: Some("largest_orbital".to_string()),
            rcut: Some(4.0),
            aux_cutoff: Some(1e-14),
            symmetry_tolerance: Some(1e-8),
            eigen_fallback: Some(true),
            eigen_cutoff: Some(1e-18),
            robust_fitting: Some(false),
            strict: Some(false),
            brute_force_check: Some(false),
        }
    }
}

impl IsdfParams {
    /// Apply default values to any missing parameters
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.c.is_none() {
            self.c = defaults.c;
        }
        if self.m.is_none() {
            self.m = defaults.m;
        }
        if self.rela_cutoff.is_none() {
            self.rela_cutoff = defaults.rela_cutoff;
        }
        if self.orbital_cutoff.is_none() {
            self.orbital_cutoff = defaults.orbital_cutoff;
        }
        if self.seed.is_none() {
            self.seed = defaults.seed;
        }
        if self.partition.is_none() {
            self.partition = defaults.partition;
        }
        if self.rcut.is_none() {
            self.rcut = defaults.rcut;
        }
        if self.aux_cutoff.is_none() {
            self.aux_cutoff = defaults.aux_cutoff;
        }
        if self.symmetry_tolerance.is_none() {
            self.symmetry_tolerance = defaults.symmetry_tolerance;
        }
        if self.eigen_fallback.is_none() {
            self.eigen_fallback = defaults.eigen_fallback;
        }
        if self.eigen_cutoff.is_none() {
            self.eigen_cutoff = defaults.eigen_cutoff;
        }
        if self.robust_fitting.is_none() {
            self.robust_fitting = defaults.robust_fitting;
        }
        if self.strict.is_none() {
            self.strict = defaults.strict;
        }
        if self.brute_force_check.is_none() {
            self.brute_force_check = defaults.brute_force_check;
        }
        self
    }
}

impl Config {
    /// Apply defaults to all configuration sections
    pub fn with_defaults(mut self) -> Self {
        self.orbitals = Some(self.orbitals.take().unwrap_or_default().with_defaults());
        self.isdf = self.isdf.with_defaults();
        self
    }

    /// Conversion factor from the configured unit to bohr
    pub fn length_scale(&self) -> f64 {
        match self.cell.unit.as_deref() {
            Some(u) if u.eq_ignore_ascii_case("angstrom") => 1.0 / 0.529177210903,
            _ => 1.0,
        }
    }

    pub fn orbital_params(&self) -> OrbitalParams {
        self.orbitals.clone().unwrap_or_default().with_defaults()
    }
}
