use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::TaskRun;
use crate::config::{Config, Input, Output};

fn default_seed() -> u64 {
    0
}

/// Build the randomized saturation tree: for every simulation and every
/// interval n, symlink n randomly drawn assemblies into
/// `saturation/rep_<r>/n<n>/`.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Task {
    /// numbers of assemblies to merge per cell
    pub intervals: Vec<usize>,
    pub simulations: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn list_assemblies(dir: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read assembly directory {}", dir))?
    {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn link_into(target: &Path, cell_dir: &Path) -> Result<()> {
    let absolute = std::fs::canonicalize(target)
        .with_context(|| format!("Failed to resolve {}", target.display()))?;
    let link = cell_dir.join(target.file_name().context("Assembly without file name")?);
    if link.exists() || link.is_symlink() {
        std::fs::remove_file(&link)
            .with_context(|| format!("Failed to replace existing link {}", link.display()))?;
    }
    std::os::unix::fs::symlink(&absolute, &link)
        .with_context(|| format!("Failed to link {} into {}", absolute.display(), cell_dir.display()))?;
    Ok(())
}

impl TaskRun for Task {
    fn run(&self, input: &Input, output: &Output) -> Result<()> {
        let files = list_assemblies(input.assembly_dir()?)?;
        if let Some(too_big) = self.intervals.iter().find(|n| **n > files.len()) {
            bail!(
                "Interval {} exceeds the {} assemblies available",
                too_big,
                files.len()
            );
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        for rep in 1..=self.simulations {
            let rep_dir = output.path(format!("saturation/rep_{}", rep));
            for (ii, n) in self.intervals.iter().enumerate() {
                let cell_dir = rep_dir.join(format!("n{}", n));
                ex::fs::create_dir_all(&cell_dir)?;
                // a fresh draw per cell, cells are deliberately not nested
                let drawn = rand::seq::index::sample(&mut rng, files.len(), *n);
                for index in drawn.iter() {
                    link_into(&files[index], &cell_dir)?;
                }
                info!(
                    "file structure built for interval {}/{}",
                    ii + 1,
                    self.intervals.len()
                );
            }
            info!(
                "file structure built for simulation {}/{}",
                rep, self.simulations
            );
        }
        Ok(())
    }

    fn check(&self, config: &Config) -> Result<()> {
        if config.input.assembly_dir.is_none() {
            bail!("layout requires input.assembly_dir");
        }
        if self.intervals.is_empty() {
            bail!("layout requires at least one interval");
        }
        if self.intervals.iter().any(|n| *n == 0) {
            bail!("intervals must be at least 1");
        }
        if self.simulations == 0 {
            bail!("simulations must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn build(dir: &Path, seed: u64) -> (Input, Output, Task) {
        let assembly_dir = dir.join("all_files.dir");
        std::fs::create_dir_all(&assembly_dir).unwrap();
        for ii in 0..6 {
            std::fs::write(assembly_dir.join(format!("sample_{}.gtf.gz", ii)), b"x").unwrap();
        }
        let input = Input {
            assembly_dir: Some(assembly_dir.to_string_lossy().to_string()),
            ..Input::default()
        };
        let output = Output {
            directory: dir.join("out").to_string_lossy().to_string(),
        };
        let task = Task {
            intervals: vec![1, 3, 5],
            simulations: 2,
            seed,
        };
        (input, output, task)
    }

    fn links_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_layout_structure_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let (input, output, task) = build(dir.path(), 42);
        task.run(&input, &output).unwrap();
        for rep in 1..=2 {
            for n in [1usize, 3, 5] {
                let cell = output.path(format!("saturation/rep_{}/n{}", rep, n));
                let links = links_in(&cell);
                assert_eq!(links.len(), n, "cell {:?}", cell);
                // links resolve back into the assembly dir
                for link in links {
                    let resolved = std::fs::canonicalize(cell.join(link)).unwrap();
                    assert!(resolved.to_string_lossy().contains("all_files.dir"));
                }
            }
        }
    }

    #[test]
    fn test_layout_is_deterministic_per_seed() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (input_a, output_a, task_a) = build(dir_a.path(), 7);
        let (input_b, output_b, task_b) = build(dir_b.path(), 7);
        task_a.run(&input_a, &output_a).unwrap();
        task_b.run(&input_b, &output_b).unwrap();
        for rep in 1..=2 {
            for n in [1usize, 3, 5] {
                let cell = format!("saturation/rep_{}/n{}", rep, n);
                assert_eq!(
                    links_in(&output_a.path(&cell)),
                    links_in(&output_b.path(&cell))
                );
            }
        }
    }

    #[test]
    fn test_interval_larger_than_pool_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (input, output, mut task) = build(dir.path(), 1);
        task.intervals = vec![7];
        assert!(task.run(&input, &output).is_err());
    }
}
