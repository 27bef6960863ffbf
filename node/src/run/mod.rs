//! Run orchestration module.
//!
//! - `commands`: inspection subcommands (pool, sections)
//! - `simulate`: the default `run` command over simulated servers

mod commands;
mod simulate;

pub use commands::{handle_pool, handle_sections};
pub use simulate::{ready_sections, run_simulation, SimulationReport};
