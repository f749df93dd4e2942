//! ISDF Command-Line Interface
//!
//! Fits the auxiliary basis and Coulomb metric for a periodic cell described
//! in YAML, then contracts the atomic guess density into J and K.

use color_eyre::eyre::Result;
use isdf::app::IsdfApplication;

fn main() -> Result<()> {
    color_eyre::install()?;
    IsdfApplication::from_cli()?.run()
}
