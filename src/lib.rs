use anyhow::{Context, Result};
use std::path::Path;

pub mod bam_ext;
pub mod bed;
pub mod config;
pub mod filters;
pub mod gtf;
pub mod io;
pub mod tasks;

use config::Config;
use tasks::TaskRun;

pub fn run(toml_file: &Path) -> Result<()> {
    let raw_config = ex::fs::read_to_string(toml_file)
        .with_context(|| format!("Could not read toml file: {}", toml_file.to_string_lossy()))?;
    let parsed = toml::from_str::<Config>(&raw_config)
        .with_context(|| format!("Could not parse toml file: {}", toml_file.to_string_lossy()))?;
    parsed.check().context("Error in configuration")?;

    parsed
        .task
        .run(&parsed.input, &parsed.output)
        .with_context(|| format!("Error in task {}", parsed.task))?;

    Ok(())
}
