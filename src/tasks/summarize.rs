use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};

use super::TaskRun;
use crate::bed::parse_bed;
use crate::config::{Config, Input, Output};
use crate::gtf::Strand;
use crate::io;

/// Count distinct utron events per saturation cell and aggregate across
/// simulations.
#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct Task {}

/// Distinct (chrom, start, end, strand) intervals in one all_utrons bed.
pub fn count_events(bed_path: &Path) -> Result<usize> {
    let records = parse_bed(io::open_buffered(bed_path)?)
        .with_context(|| format!("Failed to parse {}", bed_path.display()))?;
    let mut events: HashSet<(String, u64, u64, Strand)> = HashSet::new();
    for record in records {
        for (start, end) in record.intervals() {
            events.insert((record.chrom.clone(), start, end, record.strand));
        }
    }
    Ok(events.len())
}

fn numbered_subdirs(dir: &Path, prefix: &str) -> Result<Vec<(usize, std::path::PathBuf)>> {
    let pattern = regex::Regex::new(&format!(r"^{}(\d+)$", regex::escape(prefix))).unwrap();
    let mut res = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        if let Some(captures) = pattern.captures(&name) {
            res.push((captures[1].parse().unwrap(), path));
        }
    }
    res.sort();
    Ok(res)
}

/// `saturation/<rep>/n<k>/merged/utron_beds.dir/<rep>.n<k>.all_utrons.bed.gz`
/// per cell, as laid down by the saturation chain.
pub fn summarize_rep(rep_dir: &Path, summary_path: &Path) -> Result<()> {
    let rep_name = rep_dir.file_name().unwrap().to_string_lossy().to_string();
    let mut table = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(io::open_output(summary_path)?);
    table.write_record(["n", "events"])?;
    for (n, cell_dir) in numbered_subdirs(rep_dir, "n")? {
        let bed = cell_dir
            .join("merged/utron_beds.dir")
            .join(format!("{}.n{}.all_utrons.bed.gz", rep_name, n));
        let events = count_events(&bed)?;
        table.write_record([n.to_string(), events.to_string()])?;
    }
    table.flush()?;
    Ok(())
}

/// Concatenate the per-rep tables, adding the rep number from the filename.
pub fn summarize_experiment(output_dir: &Path) -> Result<()> {
    let pattern = regex::Regex::new(r"^rep_(\d+)\.summary\.tsv$").unwrap();
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(output_dir)
        .with_context(|| format!("Failed to read directory {}", output_dir.display()))?
    {
        let path = entry?.path();
        let name = path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        if let Some(captures) = pattern.captures(&name) {
            summaries.push((captures[1].parse::<usize>().unwrap(), path));
        }
    }
    if summaries.is_empty() {
        bail!(
            "No per-simulation summaries under {}",
            output_dir.display()
        );
    }
    summaries.sort();

    let all_path = output_dir.join("all/all.summary.tsv");
    let mut table = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(io::open_output(&all_path)?);
    table.write_record(["n", "events", "rep"])?;
    for (rep, path) in summaries {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_reader(io::open_file(&path)?);
        for record in reader.records() {
            let record = record?;
            table.write_record([
                record[0].to_string(),
                record[1].to_string(),
                rep.to_string(),
            ])?;
        }
    }
    table.flush()?;
    info!("experiment summary written to {}", all_path.display());
    Ok(())
}

impl TaskRun for Task {
    fn run(&self, input: &Input, output: &Output) -> Result<()> {
        let saturation_dir = Path::new(input.saturation_dir()?);
        let reps = numbered_subdirs(saturation_dir, "rep_")?;
        if reps.is_empty() {
            bail!(
                "No rep_* directories under {}",
                saturation_dir.display()
            );
        }
        let summary_dir = output.path("output");
        for (rep, rep_dir) in reps {
            summarize_rep(&rep_dir, &summary_dir.join(format!("rep_{}.summary.tsv", rep)))?;
        }
        summarize_experiment(&summary_dir)
    }

    fn check(&self, config: &Config) -> Result<()> {
        if config.input.saturation_dir.is_none() {
            bail!("summarize requires input.saturation_dir");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bed::{BedRecord, write_bed};
    use std::io::Write;

    fn write_cell_bed(root: &Path, rep: usize, n: usize, records: &[BedRecord]) {
        let dir = root
            .join(format!("rep_{}/n{}/merged/utron_beds.dir", rep, n));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("rep_{}.n{}.all_utrons.bed.gz", rep, n));
        let mut out = io::open_output(&path).unwrap();
        write_bed(records, &mut out).unwrap();
        out.flush().unwrap();
    }

    #[test]
    fn test_count_events_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bed.gz");
        let records = vec![
            BedRecord::new("chr1", 100, 200, "a", Strand::Plus),
            // same event reported by a second transcript
            BedRecord::new("chr1", 100, 200, "b", Strand::Plus),
            BedRecord::new("chr1", 100, 200, "c", Strand::Minus),
            BedRecord::new("chr2", 5, 900, "d", Strand::Plus)
                .with_blocks(vec![(5, 50), (400, 900)]),
        ];
        let mut out = io::open_output(&path).unwrap();
        write_bed(&records, &mut out).unwrap();
        out.flush().unwrap();
        drop(out);
        assert_eq!(count_events(&path).unwrap(), 4);
    }

    #[test]
    fn test_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let saturation = dir.path().join("saturation");
        let one = vec![BedRecord::new("chr1", 1, 50, "a", Strand::Plus)];
        let two = vec![
            BedRecord::new("chr1", 1, 50, "a", Strand::Plus),
            BedRecord::new("chr1", 70, 90, "b", Strand::Plus),
        ];
        write_cell_bed(&saturation, 1, 1, &one);
        write_cell_bed(&saturation, 1, 2, &two);
        write_cell_bed(&saturation, 2, 1, &two);
        write_cell_bed(&saturation, 2, 2, &two);

        let input = Input {
            saturation_dir: Some(saturation.to_string_lossy().to_string()),
            ..Input::default()
        };
        let output = Output {
            directory: saturation.to_string_lossy().to_string(),
        };
        Task::default().run(&input, &output).unwrap();

        let rep1 =
            std::fs::read_to_string(saturation.join("output/rep_1.summary.tsv")).unwrap();
        assert_eq!(rep1, "n\tevents\n1\t1\n2\t2\n");
        let all =
            std::fs::read_to_string(saturation.join("output/all/all.summary.tsv")).unwrap();
        assert_eq!(
            all,
            "n\tevents\trep\n1\t1\t1\n2\t2\t1\n1\t2\t2\n2\t2\t2\n"
        );
    }
}
