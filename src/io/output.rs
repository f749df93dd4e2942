//! Output formatting and logging utilities

use crate::app::JkSummary;
use color_eyre::eyre::Result;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::time::SystemTime as StdSystemTime;
use tracing::info;
use tracing_subscriber::{
    fmt::format::Writer, fmt::layer, fmt::time::FormatTime, layer::SubscriberExt,
    util::SubscriberInitExt, Registry,
};

/// Custom time formatter that shows only seconds
struct SecondPrecisionTimer;

impl FormatTime for SecondPrecisionTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let duration = StdSystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        let total_seconds = duration.as_secs();
        let hours = (total_seconds / 3600) % 24;
        let minutes = (total_seconds / 60) % 60;
        let seconds = total_seconds % 60;

        write!(w, "{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

/// Setup output logging to file or stdout
pub fn setup_output(output_path: Option<&String>) {
    match output_path {
        Some(path) => {
            if let Ok(log) = File::create(path) {
                let file_layer = layer()
                    .with_writer(log)
                    .with_timer(SecondPrecisionTimer)
                    .with_ansi(false);
                Registry::default().with(file_layer).init();
                info!("Output will be written to: {}", path);
            } else {
                eprintln!("Could not create output file: {}", path);
            }
        }
        None => {
            let stdout_layer = layer()
                .with_writer(std::io::stdout)
                .with_timer(SecondPrecisionTimer)
                .with_ansi(true);
            Registry::default().with(stdout_layer).init();
            info!("Output will be printed to stdout");
        }
    }
}

/// Print the contraction summary to a writer
pub fn print_jk_summary<W: Write>(writer: &mut W, summary: &JkSummary) -> Result<()> {
    writeln!(writer, "ISDF summary:")?;
    writeln!(writer, "  Interpolation points per cell: {}", summary.nip)?;
    writeln!(writer, "  Supercell orbitals: {}", summary.nao)?;
    writeln!(writer, "  Electrons in guess density: {:.6}", summary.electrons)?;
    writeln!(writer, "  Coulomb energy: {:.10} au", summary.coulomb_energy)?;
    writeln!(writer, "  Exchange energy: {:.10} au", summary.exchange_energy)?;
    if let Some((j_err, k_err)) = summary.reference_errors {
        writeln!(writer, "  Relative J error vs full supercell: {:.3e}", j_err)?;
        writeln!(writer, "  Relative K error vs full supercell: {:.3e}", k_err)?;
    }
    Ok(())
}
