//! Command line interface
//!
//! Argument parsing plus the runner that executes `list-images`, `list-tags`
//! and `migrate`.

pub mod args;
pub mod runner;

pub use args::{Args, Command, RegistryArgs};
pub use runner::{Migration, RunSummary, Runner};
