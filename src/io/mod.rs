//! Input/Output operations for ISDF runs
//!
//! This module handles logging setup and summary output.

mod output;

pub use output::{print_jk_summary, setup_output};
