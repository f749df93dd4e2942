mod geometry;
mod report;
mod runner;

pub use geometry::{build_geometry, build_lattice, Geometry};
pub use report::JkSummary;
pub use runner::{build_orbitals, contract_guess_density, resolve_settings, run_isdf};

use self::report::{report_build_summary, report_jk_summary};
use crate::config::{Args, Config};
use crate::io::{print_jk_summary, setup_output};
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use std::fs::{self, File};
use std::path::Path;
use tracing::info;

pub struct IsdfApplication {
    args: Args,
    config: Config,
}

impl IsdfApplication {
    pub fn from_cli() -> Result<Self> {
        let args = Args::parse();
        let config = load_config(&args.config_file)?;
        Ok(Self { args, config })
    }

    pub fn run(self) -> Result<()> {
        setup_output(self.args.output.as_ref());
        info!("Configuration loaded:\n{:?}", self.config);

        let geometry = build_geometry(&self.config)?;
        let lattice = build_lattice(&self.config)?;
        let orbitals = build_orbitals(&self.config, &geometry)?;
        let settings = resolve_settings(&self.args, &self.config)?;

        let mut engine = run_isdf(lattice, orbitals, settings)?;
        report_build_summary(&engine)?;

        let check = self.args.brute_force_check
            || self.config.isdf.brute_force_check.unwrap_or(false);
        let summary = contract_guess_density(&mut engine, &geometry, check)?;
        report_jk_summary(&summary);

        if let Some(ref path) = self.args.summary_file {
            let mut file = File::create(path)
                .wrap_err_with(|| format!("Unable to create summary file: {}", path))?;
            print_jk_summary(&mut file, &summary)?;
        }

        Ok(())
    }
}

/// Read and default-fill a YAML configuration file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let config_content = fs::read_to_string(path)
        .wrap_err_with(|| format!("Unable to read configuration file: {}", path.display()))?;

    let config = serde_yml::from_str::<Config>(&config_content)
        .wrap_err("Failed to parse configuration file")?
        .with_defaults();

    Ok(config)
}
