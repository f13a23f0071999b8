use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info};
use measure_time::info_time;
use serde::{Deserialize, Serialize};

use super::TaskRun;
use crate::config::{Config, Input, Output};
use crate::gtf;
use crate::io;

fn default_stringtie() -> String {
    "stringtie".to_string()
}

fn default_threads() -> usize {
    4
}

fn default_merged_name() -> String {
    "merged.gtf.gz".to_string()
}

/// Merge assembly GTFs with `stringtie --merge` against the reference and
/// re-emit the result in gene+transcript order.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Task {
    #[serde(default = "default_stringtie")]
    pub stringtie: String,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_merged_name")]
    pub merged_name: String,
}

impl Default for Task {
    fn default() -> Self {
        Task {
            stringtie: default_stringtie(),
            threads: default_threads(),
            extra_args: Vec::new(),
            merged_name: default_merged_name(),
        }
    }
}

impl Task {
    pub fn probe_stringtie(&self) -> Result<()> {
        let output = Command::new(&self.stringtie)
            .arg("--version")
            .output()
            .map_err(|e| {
                anyhow!(
                    "Failed to spawn {}: {}. Is stringtie installed?",
                    self.stringtie,
                    e
                )
            })?;
        if !output.status.success() {
            bail!("{} --version failed", self.stringtie);
        }
        debug!(
            "stringtie version {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }

    /// stringtie reads plain files only, gzipped inputs are staged through
    /// temp files.
    fn stage(path: &Path, keep_alive: &mut Vec<tempfile::NamedTempFile>) -> Result<PathBuf> {
        if !path.extension().map(|e| e == "gz").unwrap_or(false) {
            return Ok(path.to_path_buf());
        }
        let mut staged = tempfile::Builder::new()
            .suffix(".gtf")
            .tempfile()
            .context("Failed to create staging file")?;
        let mut reader = io::open_file(path)?;
        std::io::copy(&mut reader, &mut staged)
            .with_context(|| format!("Failed to decompress {} for staging", path.display()))?;
        staged.flush()?;
        let staged_path = staged.path().to_path_buf();
        keep_alive.push(staged);
        Ok(staged_path)
    }

    /// Run one merge; also used per saturation cell.
    pub fn merge_files(
        &self,
        gtf_paths: &[PathBuf],
        reference: &Path,
        out_gtf: &Path,
    ) -> Result<()> {
        if gtf_paths.is_empty() {
            bail!("No assembly GTFs to merge");
        }
        info_time!("stringtie --merge of {} assemblies", gtf_paths.len());
        let mut staged_files = Vec::new();
        let reference = Self::stage(reference, &mut staged_files)?;
        let mut inputs = Vec::with_capacity(gtf_paths.len());
        for path in gtf_paths {
            inputs.push(Self::stage(path, &mut staged_files)?);
        }

        let mut command = Command::new(&self.stringtie);
        command
            .arg("--merge")
            .arg("-G")
            .arg(&reference)
            .arg("-p")
            .arg(self.threads.to_string());
        for arg in &self.extra_args {
            command.arg(arg);
        }
        for input in &inputs {
            command.arg(input);
        }
        debug!("running {:?}", command);
        let output = command.output().map_err(|e| {
            anyhow!(
                "Failed to spawn {}: {}. Is stringtie installed?",
                self.stringtie,
                e
            )
        })?;

        let log_path = out_gtf.with_extension("gz.log");
        let mut log_file = io::open_output(&log_path)?;
        log_file.write_all(&output.stderr)?;
        drop(log_file);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(10).collect();
            bail!(
                "stringtie --merge failed with {}; last lines:\n{}",
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join("\n")
            );
        }

        let merged = gtf::parse_gtf(Cursor::new(output.stdout))
            .context("Failed to parse stringtie --merge output")?;
        info!(
            "merged {} assemblies into {} transcripts",
            gtf_paths.len(),
            merged.len()
        );
        let mut out = io::open_output(out_gtf)?;
        gtf::write_gtf(&merged, &mut out)?;
        Ok(())
    }
}

impl TaskRun for Task {
    fn run(&self, input: &Input, output: &Output) -> Result<()> {
        self.probe_stringtie()?;
        let gtfs = input.resolve_gtfs()?;
        let reference = input.reference_gtf()?;
        output.ensure_dir()?;
        self.merge_files(&gtfs, Path::new(reference), &output.path(&self.merged_name))
    }

    fn check(&self, config: &Config) -> Result<()> {
        if config.input.gtfs.is_none() {
            bail!("merge requires input.gtfs");
        }
        if config.input.reference_gtf.is_none() {
            bail!("merge requires input.reference_gtf");
        }
        if self.threads == 0 {
            bail!("threads must be at least 1");
        }
        Ok(())
    }
}
