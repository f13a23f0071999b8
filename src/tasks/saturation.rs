use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::info;
use measure_time::info_time;
use serde::{Deserialize, Serialize};

use super::{TaskRun, classify, filter, merge, summarize, utrons};
use crate::config::{Config, Input, Output, read_transcripts};
use crate::io;

/// Run the whole detection chain over a saturation layout:
/// merge -> classify -> filter -> utrons per cell, then the summaries.
#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct Task {
    #[serde(default)]
    pub merge: merge::Task,
    #[serde(default)]
    pub classify: classify::Task,
    #[serde(default)]
    pub filter: filter::Task,
}

fn cell_assemblies(cell_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut gtfs = Vec::new();
    for entry in std::fs::read_dir(cell_dir)
        .with_context(|| format!("Failed to read cell directory {}", cell_dir.display()))?
    {
        let path = entry?.path();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        if path.is_file() && (name.ends_with(".gtf") || name.ends_with(".gtf.gz")) {
            gtfs.push(path);
        }
    }
    gtfs.sort();
    Ok(gtfs)
}

impl Task {
    fn run_cell(
        &self,
        cell_dir: &Path,
        track: &str,
        reference: &crate::gtf::TranscriptSet,
        reference_path: &Path,
    ) -> Result<()> {
        info_time!("saturation cell {}", track);
        let gtfs = cell_assemblies(cell_dir)?;
        if gtfs.is_empty() {
            bail!("Cell {} contains no assemblies", cell_dir.display());
        }
        let merged_dir = cell_dir.join("merged");

        let merged_gtf = merged_dir.join(format!("{}.merged.gtf.gz", track));
        self.merge.merge_files(&gtfs, reference_path, &merged_gtf)?;

        let merged = read_transcripts(&merged_gtf)?;
        let class_rows = classify::classify_set(&merged, reference, self.classify.flank);
        let class_file = merged_dir.join(format!("{}.class.tsv.gz", track));
        classify::write_class_table(&class_rows, io::open_output(&class_file)?)?;

        let filtered_gtf = merged_dir.join(format!("{}.filtered.gtf.gz", track));
        let filtered_class = merged_dir.join(format!("{}.filtered.class.tsv.gz", track));
        let filtered = self.filter.filter_files(
            &merged_gtf,
            class_file.to_str().unwrap(),
            &filtered_gtf,
            &filtered_class,
        )?;

        let classes = classify::read_class_table(filtered_class.to_str().unwrap())?;
        let sets = utrons::find_utrons(&filtered, reference, &classes);
        let beds_dir = merged_dir.join("utron_beds.dir");
        ex::fs::create_dir_all(&beds_dir)?;
        utrons::write_utron_beds(&sets, &beds_dir, Some(track))?;
        info!(
            "{}: {} utrons over {} transcripts",
            track,
            sets.individual.len(),
            sets.all.len()
        );
        Ok(())
    }
}

impl TaskRun for Task {
    fn run(&self, input: &Input, output: &Output) -> Result<()> {
        self.merge.probe_stringtie()?;
        let saturation_dir = Path::new(input.saturation_dir()?);
        let reference_path = Path::new(input.reference_gtf()?);
        let reference = input.reference_models()?;

        let mut cells = Vec::new();
        for entry in std::fs::read_dir(saturation_dir)
            .with_context(|| format!("Failed to read {}", saturation_dir.display()))?
        {
            let rep_dir = entry?.path();
            let rep_name = rep_dir.file_name().unwrap().to_string_lossy().to_string();
            if !rep_dir.is_dir() || !rep_name.starts_with("rep_") {
                continue;
            }
            for entry in std::fs::read_dir(&rep_dir)? {
                let cell_dir = entry?.path();
                let cell_name = cell_dir.file_name().unwrap().to_string_lossy().to_string();
                if cell_dir.is_dir() && cell_name.starts_with('n') {
                    cells.push((cell_dir.clone(), format!("{}.{}", rep_name, cell_name)));
                }
            }
        }
        if cells.is_empty() {
            bail!(
                "No rep_*/n* cells under {}, run the layout task first",
                saturation_dir.display()
            );
        }
        cells.sort();
        info!("running {} saturation cells", cells.len());

        // stringtie occupies the configured threads, cells run one after
        // the other
        for (cell_dir, track) in cells.iter() {
            self.run_cell(cell_dir, track, &reference, reference_path)?;
        }

        summarize::Task::default().run(input, output)
    }

    fn check(&self, config: &Config) -> Result<()> {
        if config.input.saturation_dir.is_none() {
            bail!("saturation requires input.saturation_dir");
        }
        if config.input.reference_gtf.is_none() {
            bail!("saturation requires input.reference_gtf");
        }
        if self.merge.threads == 0 {
            bail!("threads must be at least 1");
        }
        Ok(())
    }
}
