use super::geometry::Geometry;
use super::report::JkSummary;
use crate::config::{Args, Config};
use crate::isdf_impl::{atomic_guess_density, IsdfEngine, IsdfSettings, PartitionPolicy, SelectionParams};
use crate::lattice::Lattice;
use crate::orbitals::{GaussianOrbitals, GridEvaluator};
use color_eyre::eyre::{eyre, Result, WrapErr};
use nalgebra::DMatrix;
use tracing::info;

/// Gaussian orbitals on every atom of the primitive cell.
pub fn build_orbitals(config: &Config, geometry: &Geometry) -> Result<GaussianOrbitals> {
    let params = config.orbital_params();
    let exponents: Vec<f64> = geometry
        .elements
        .iter()
        .map(|e| params.exponent(e.get_symbol()))
        .collect();
    let orbitals = GaussianOrbitals::new(
        geometry.elements.clone(),
        geometry.coords.clone(),
        &exponents,
        params.with_p.unwrap_or(true),
    )
    .wrap_err("Unable to place orbitals")?;
    info!("{} orbitals per primitive cell", orbitals.nao());
    Ok(orbitals)
}

/// Merge config values and command-line overrides into engine settings.
pub fn resolve_settings(args: &Args, config: &Config) -> Result<IsdfSettings> {
    let p = &config.isdf;
    let defaults = IsdfSettings::default();

    let partition = match p.partition.as_deref().unwrap_or("largest_orbital") {
        "largest_orbital" => PartitionPolicy::LargestOrbital,
        "nearest_atom" => PartitionPolicy::NearestAtom {
            rcut: p.rcut.unwrap_or(4.0) * config.length_scale(),
        },
        other => return Err(eyre!("Unknown partition policy: {}", other)),
    };

    let selection = SelectionParams {
        c: args.c.or(p.c).unwrap_or(defaults.selection.c),
        m: args.m.or(p.m).unwrap_or(defaults.selection.m),
        rela_cutoff: p.rela_cutoff.unwrap_or(defaults.selection.rela_cutoff),
        rank_floor: p.rank_floor,
        orbital_cutoff: p.orbital_cutoff.unwrap_or(defaults.selection.orbital_cutoff),
        seed: p.seed.unwrap_or(defaults.selection.seed),
        groups: p.groups.clone(),
        group_c: p.group_c,
    };

    Ok(IsdfSettings {
        partition,
        selection,
        aux_cutoff: p.aux_cutoff.unwrap_or(defaults.aux_cutoff),
        symmetry_tolerance: p.symmetry_tolerance.unwrap_or(defaults.symmetry_tolerance),
        eigen_fallback: p.eigen_fallback.unwrap_or(defaults.eigen_fallback),
        eigen_cutoff: p.eigen_cutoff.unwrap_or(defaults.eigen_cutoff),
        robust_fitting: args.robust_fitting || p.robust_fitting.unwrap_or(false),
        strict: args.strict || p.strict.unwrap_or(false),
    })
}

pub fn run_isdf<E: GridEvaluator>(
    lattice: Lattice,
    evaluator: E,
    settings: IsdfSettings,
) -> Result<IsdfEngine<E>> {
    info!("Starting ISDF build...");
    let mut engine = IsdfEngine::new(lattice, evaluator, settings);
    engine.build().wrap_err("ISDF build failed")?;
    Ok(engine)
}

fn relative_error(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    let scale = b.amax();
    if scale == 0.0 {
        return (a - b).amax();
    }
    (a - b).amax() / scale
}

/// Contract the atomic guess density, optionally checking J and K against
/// the full supercell computation.
pub fn contract_guess_density<E: GridEvaluator>(
    engine: &mut IsdfEngine<E>,
    geometry: &Geometry,
    check: bool,
) -> Result<JkSummary> {
    let ao_atom = engine.evaluator().ao_atom();
    let dm = atomic_guess_density(engine.lattice(), &geometry.elements, &ao_atom);

    let (j, k) = engine.get_jk(&dm, true, true)?;
    let (j, k) = j
        .zip(k)
        .ok_or_else(|| eyre!("Contraction returned no J/K"))?;

    let reference_errors = if check {
        info!("Running full supercell reference contraction...");
        let (j_ref, k_ref) = engine.reference_jk(&dm, true, true)?;
        let (j_ref, k_ref) = j_ref
            .zip(k_ref)
            .ok_or_else(|| eyre!("Reference contraction returned no J/K"))?;
        Some((relative_error(&j, &j_ref), relative_error(&k, &k_ref)))
    } else {
        None
    };

    Ok(JkSummary {
        nip: engine.ip_set()?.len(),
        nao: engine.nao(),
        electrons: dm.trace(),
        coulomb_energy: 0.5 * dm.component_mul(&j).sum(),
        exchange_energy: -0.25 * dm.component_mul(&k).sum(),
        reference_errors,
    })
}
