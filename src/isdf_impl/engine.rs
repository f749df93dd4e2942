use super::aux_basis::{grid_blocks, ip_orbital_blocks, AuxBasis, AuxBasisBuilder};
use super::ip_select::{IpSelector, IpSet};
use super::jk::{
    get_j_brute_force, get_k_brute_force, pack_blocks, symmetrize_blocks, symmetrize_density,
    JkContractor,
};
use super::metric::{MetricBuilder, MetricTensor};
use super::partition::{GridPartition, OrbitalGrid};
use super::IsdfSettings;
use crate::arena::{ArenaPlan, ScratchArena};
use crate::backend::{
    BareCoulomb, CoulombKernel, DenseSolver, LinearSolver, RustFftBackend, TransformBackend,
};
use crate::error::{BuildReport, IsdfError, Result};
use crate::lattice::Lattice;
use crate::orbitals::GridEvaluator;
use nalgebra::DMatrix;
use std::time::Instant;
use tracing::info;

type JkPair = (Option<DMatrix<f64>>, Option<DMatrix<f64>>);

/// Everything a successful build leaves behind for the contraction.
#[derive(Debug, Clone)]
struct IsdfCache {
    grid: OrbitalGrid,
    partition: GridPartition,
    ip_set: IpSet,
    aux: AuxBasis,
    metric: MetricTensor,
    ip_orbitals: Vec<DMatrix<f64>>,
    /// Home-cell orbitals per cell, kept for robust fitting only.
    grid_orbitals: Option<Vec<DMatrix<f64>>>,
}

/// Owns the lattice, the orbital evaluator, the injected backends, the
/// scratch arena and the cached fit.
pub struct IsdfEngine<E: GridEvaluator> {
    lattice: Lattice,
    evaluator: E,
    settings: IsdfSettings,
    transform: Box<dyn TransformBackend>,
    solver: Box<dyn LinearSolver>,
    kernel: Box<dyn CoulombKernel>,
    arena: ScratchArena,
    cache: Option<IsdfCache>,
    report: BuildReport,
}

impl<E: GridEvaluator> IsdfEngine<E> {
    pub fn new(lattice: Lattice, evaluator: E, settings: IsdfSettings) -> Self {
        IsdfEngine {
            lattice,
            evaluator,
            settings,
            transform: Box::new(RustFftBackend::new()),
            solver: Box::new(DenseSolver),
            kernel: Box::new(BareCoulomb),
            arena: ScratchArena::new(),
            cache: None,
            report: BuildReport::default(),
        }
    }

    pub fn with_transform(mut self, transform: Box<dyn TransformBackend>) -> Self {
        self.transform = transform;
        self.cache = None;
        self
    }

    pub fn with_solver(mut self, solver: Box<dyn LinearSolver>) -> Self {
        self.solver = solver;
        self.cache = None;
        self
    }

    pub fn with_kernel(mut self, kernel: Box<dyn CoulombKernel>) -> Self {
        self.kernel = kernel;
        self.cache = None;
        self
    }

    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    pub fn settings(&self) -> &IsdfSettings {
        &self.settings
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    pub fn is_built(&self) -> bool {
        self.cache.is_some()
    }

    pub fn arena_capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub fn arena_grow_count(&self) -> usize {
        self.arena.grow_count()
    }

    fn cache(&self) -> Result<&IsdfCache> {
        self.cache.as_ref().ok_or(IsdfError::NotBuilt)
    }

    pub fn ip_set(&self) -> Result<&IpSet> {
        Ok(&self.cache()?.ip_set)
    }

    pub fn aux_basis(&self) -> Result<&AuxBasis> {
        Ok(&self.cache()?.aux)
    }

    pub fn metric(&self) -> Result<&MetricTensor> {
        Ok(&self.cache()?.metric)
    }

    pub fn partition(&self) -> Result<&GridPartition> {
        Ok(&self.cache()?.partition)
    }

    pub fn orbital_grid(&self) -> Result<&OrbitalGrid> {
        Ok(&self.cache()?.grid)
    }

    pub fn nao_prim(&self) -> usize {
        self.evaluator.nao()
    }

    /// Supercell orbital count.
    pub fn nao(&self) -> usize {
        self.lattice.ncell() * self.evaluator.nao()
    }

    /// Run the whole fit. On failure the previous fit is dropped as well.
    pub fn build(&mut self) -> Result<()> {
        self.cache = None;
        self.report = BuildReport::default();
        self.check_evaluator()?;
        let now = Instant::now();
        let cache = self.run_pipeline()?;
        info!(
            "ISDF build finished in {:.2?}: {} IPs per cell, {} diagnostics",
            now.elapsed(),
            cache.ip_set.len(),
            self.report.diagnostics.len()
        );
        self.cache = Some(cache);
        Ok(())
    }

    /// Orbital metadata must be consistent before any grid evaluation.
    fn check_evaluator(&self) -> Result<()> {
        let nao = self.evaluator.nao();
        let natm = self.evaluator.natm();
        let ao_atom = self.evaluator.ao_atom();
        if nao == 0 || ao_atom.len() != nao {
            return Err(IsdfError::DimensionMismatch(format!(
                "{} orbital owners for {} orbitals",
                ao_atom.len(),
                nao
            )));
        }
        if let Some(&atm) = ao_atom.iter().find(|&&a| a >= natm) {
            return Err(IsdfError::DimensionMismatch(format!(
                "orbital owner {} out of range for {} atoms",
                atm, natm
            )));
        }
        Ok(())
    }

    /// Orbital values on the whole supercell grid, weighted so that
    /// `aoR aoR^T` approximates the overlap integral.
    fn evaluate_grid(&self) -> Result<OrbitalGrid> {
        let lattice = &self.lattice;
        let points: Vec<usize> = (0..lattice.ngrid()).collect();
        let weight = (lattice.volume() / lattice.ngrid() as f64).sqrt();
        let values = self.evaluator.evaluate(lattice, &points) * weight;
        OrbitalGrid::new(lattice, values, self.evaluator.ao_atom(), self.evaluator.natm())
    }

    fn run_pipeline(&mut self) -> Result<IsdfCache> {
        let lattice = &self.lattice;
        info!(
            "Building ISDF on kmesh {:?}, primitive mesh {:?}, {} orbitals per cell",
            lattice.kmesh(),
            lattice.mesh_prim(),
            self.evaluator.nao()
        );

        let now = Instant::now();
        let grid = self.evaluate_grid()?;
        info!("Orbitals evaluated on {} grid points in {:.2?}", lattice.ngrid(), now.elapsed());

        let now = Instant::now();
        let partition = GridPartition::build(
            self.settings.partition,
            lattice,
            &grid,
            &self.evaluator.atom_positions(),
        )?;
        info!(
            "Grid partitioned in {:.2?}, points per atom {:?}",
            now.elapsed(),
            partition.counts()
        );

        let now = Instant::now();
        let ip_set = IpSelector::new(&self.settings.selection).select(
            lattice,
            &grid,
            &partition,
            &mut self.report,
        )?;
        info!("Interpolation points selected in {:.2?}", now.elapsed());

        let worker_scratch =
            rayon::current_num_threads() * self.transform.scratch_len(lattice.mesh_prim()).max(1);
        self.arena.ensure(&ArenaPlan::new(
            lattice,
            grid.nao_prim(),
            ip_set.len(),
            worker_scratch,
        ));

        let aux_builder =
            AuxBasisBuilder::new(&self.settings, self.solver.as_ref(), self.transform.as_ref());
        let aux = match &self.settings.selection.groups {
            Some(groups) => aux_builder.build_local(
                lattice,
                &grid,
                &partition,
                &ip_set,
                groups,
                &mut self.report,
            )?,
            None => aux_builder.build(lattice, &grid, &ip_set, &mut self.arena, &mut self.report)?,
        };

        let coulg = self.kernel.coulomb_g(lattice);
        let metric_builder = MetricBuilder::new(&self.settings, self.transform.as_ref());
        let metric = if aux.is_local() {
            metric_builder.build_local(lattice, &aux, &coulg, &mut self.arena, &mut self.report)?
        } else {
            metric_builder.build(lattice, &aux, &coulg, &mut self.arena, &mut self.report)?
        };

        let ip_orbitals = ip_orbital_blocks(lattice, &grid, &ip_set);
        let grid_orbitals = self
            .settings
            .robust_fitting
            .then(|| grid_blocks(lattice, &grid));
        Ok(IsdfCache {
            grid,
            partition,
            ip_set,
            aux,
            metric,
            ip_orbitals,
            grid_orbitals,
        })
    }

    /// J and K of a supercell density matrix. The density is averaged over
    /// the lattice translations first, so the results are block-circulant.
    pub fn get_jk(&mut self, dm: &DMatrix<f64>, with_j: bool, with_k: bool) -> Result<JkPair> {
        let cache = self.cache.as_ref().ok_or(IsdfError::NotBuilt)?;
        let lattice = &self.lattice;
        let nao_prim = cache.grid.nao_prim();
        let d_blocks = symmetrize_blocks(lattice, nao_prim, dm)?;
        let mut contractor = JkContractor::new(
            lattice,
            &cache.ip_orbitals,
            &cache.metric,
            self.transform.as_ref(),
        );
        if let Some(grid_orbitals) = &cache.grid_orbitals {
            contractor = contractor.with_grid_orbitals(grid_orbitals);
        }

        let j = if with_j {
            let now = Instant::now();
            let j = pack_blocks(lattice, &contractor.j_blocks(&d_blocks)?)?;
            info!("J built in {:.2?}", now.elapsed());
            Some(j)
        } else {
            None
        };

        let k = if with_k {
            let now = Instant::now();
            let k = if lattice.ncell() == 1 {
                let dm = pack_blocks(lattice, &d_blocks)?;
                get_k_brute_force(lattice, &cache.grid, &cache.ip_set, &cache.metric, &dm)?
            } else {
                pack_blocks(lattice, &contractor.k_blocks(&d_blocks, &mut self.arena)?)?
            };
            info!("K built in {:.2?}", now.elapsed());
            Some(k)
        } else {
            None
        };
        Ok((j, k))
    }

    /// Auxiliary basis from the full supercell system with the cached IPs.
    pub fn brute_force_aux_basis(&self) -> Result<AuxBasis> {
        let cache = self.cache()?;
        AuxBasisBuilder::new(&self.settings, self.solver.as_ref(), self.transform.as_ref())
            .build_brute_force(&self.lattice, &cache.grid, &cache.ip_set)
    }

    /// Metric of the cached auxiliary basis without the momentum split.
    pub fn brute_force_metric(&self) -> Result<MetricTensor> {
        let cache = self.cache()?;
        let coulg = self.kernel.coulomb_g(&self.lattice);
        MetricBuilder::new(&self.settings, self.transform.as_ref())
            .build_brute_force(&self.lattice, &cache.aux, &coulg)
    }

    /// J and K on full supercell matrices, from a brute-force metric over
    /// the same interpolation points. The auxiliary basis is the global
    /// brute-force fit, or the cached fit when it is group-local.
    pub fn reference_jk(&self, dm: &DMatrix<f64>, with_j: bool, with_k: bool) -> Result<JkPair> {
        let cache = self.cache()?;
        let lattice = &self.lattice;
        let now = Instant::now();
        let aux = if cache.aux.is_local() {
            cache.aux.clone()
        } else {
            self.brute_force_aux_basis()?
        };
        let coulg = self.kernel.coulomb_g(lattice);
        let metric = MetricBuilder::new(&self.settings, self.transform.as_ref())
            .build_brute_force(lattice, &aux, &coulg)?;
        let dm = symmetrize_density(lattice, cache.grid.nao_prim(), dm)?;

        let j = with_j
            .then(|| get_j_brute_force(lattice, &cache.grid, &cache.ip_set, &metric, &dm))
            .transpose()?;
        let k = with_k
            .then(|| get_k_brute_force(lattice, &cache.grid, &cache.ip_set, &metric, &dm))
            .transpose()?;
        info!("Reference J/K built in {:.2?}", now.elapsed());
        Ok((j, k))
    }
}
