//! Command-line argument parsing for ISDF runs

use clap::Parser;

/// ISDF fit and J/K contraction with YAML configuration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config_file: String,

    /// Override output file: (default stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Write the J/K summary to this file
    #[arg(long)]
    pub summary_file: Option<String>,

    /// Override the oversampling factor
    #[arg(long)]
    pub c: Option<usize>,

    /// Override the number of extra sketch columns
    #[arg(long)]
    pub m: Option<usize>,

    /// Treat symmetry violations as errors
    #[arg(long)]
    pub strict: bool,

    /// Keep the convolved auxiliary basis
    #[arg(long)]
    pub robust_fitting: bool,

    /// Compare J/K against the full supercell computation
    #[arg(long)]
    pub brute_force_check: bool,
}
