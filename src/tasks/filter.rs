use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};

use super::TaskRun;
use crate::config::{Config, Input, Output, read_transcripts};
use crate::gtf::{TranscriptSet, write_gtf};
use crate::io;

fn default_classes_to_remove() -> Vec<String> {
    [
        "intergenic",
        "complete",
        "flank3",
        "flank5",
        "fragment",
        "intronic",
        "utr3",
        "utr5",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_novel_prefix() -> String {
    "MSTRG".to_string()
}

fn default_filtered_gtf_name() -> String {
    "merged.filtered.gtf.gz".to_string()
}

fn default_filtered_class_name() -> String {
    "merged.filtered.class.tsv.gz".to_string()
}

/// Drop novel transcripts whose class carries no isoform information;
/// reference-matching ids always survive.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Task {
    #[serde(default = "default_classes_to_remove")]
    pub classes_to_remove: Vec<String>,
    #[serde(default = "default_novel_prefix")]
    pub novel_prefix: String,
    #[serde(default = "default_filtered_gtf_name")]
    pub filtered_gtf_name: String,
    #[serde(default = "default_filtered_class_name")]
    pub filtered_class_name: String,
}

impl Default for Task {
    fn default() -> Self {
        Task {
            classes_to_remove: default_classes_to_remove(),
            novel_prefix: default_novel_prefix(),
            filtered_gtf_name: default_filtered_gtf_name(),
            filtered_class_name: default_filtered_class_name(),
        }
    }
}

impl Task {
    /// One pass over class table and models; returns the surviving models
    /// and writes the surviving class rows.
    pub fn filter_files(
        &self,
        assembled_gtf: &std::path::Path,
        class_file: &str,
        filtered_gtf: &std::path::Path,
        filtered_class: &std::path::Path,
    ) -> Result<TranscriptSet> {
        let remove: HashSet<&str> = self.classes_to_remove.iter().map(|s| s.as_str()).collect();

        let mut table = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_reader(io::open_file(class_file)?);
        let headers = table.headers()?.clone();
        let class_idx = headers
            .iter()
            .position(|h| h == "class")
            .with_context(|| format!("No 'class' column in {}", class_file))?;

        let mut kept_ids: HashSet<String> = HashSet::new();
        let mut class_out = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(io::open_output(filtered_class)?);
        class_out.write_record(&headers)?;
        let mut dropped = 0usize;
        for record in table.records() {
            let record = record?;
            let transcript_id = &record[0];
            if transcript_id.starts_with(&self.novel_prefix) && remove.contains(&record[class_idx])
            {
                dropped += 1;
                continue;
            }
            kept_ids.insert(transcript_id.to_string());
            class_out.write_record(&record)?;
        }
        class_out.flush()?;

        let assembled = read_transcripts(assembled_gtf)?;
        let mut kept = Vec::with_capacity(kept_ids.len());
        for transcript in assembled.transcripts.iter() {
            if kept_ids.contains(&transcript.transcript_id) {
                kept.push(transcript.clone());
            } else if !transcript.transcript_id.starts_with(&self.novel_prefix) {
                bail!(
                    "Transcript {} is in the GTF but has no class row",
                    transcript.transcript_id
                );
            }
        }
        info!(
            "kept {} of {} transcripts ({} filtered by class)",
            kept.len(),
            assembled.len(),
            dropped
        );
        let filtered = TranscriptSet::from_transcripts(kept);
        write_gtf(&filtered, io::open_output(filtered_gtf)?)?;
        Ok(filtered)
    }
}

impl TaskRun for Task {
    fn run(&self, input: &Input, output: &Output) -> Result<()> {
        let gtfs = input.resolve_gtfs()?;
        if gtfs.len() != 1 {
            bail!("filter takes exactly one assembled GTF, got {}", gtfs.len());
        }
        output.ensure_dir()?;
        self.filter_files(
            &gtfs[0],
            input.class_file()?,
            &output.path(&self.filtered_gtf_name),
            &output.path(&self.filtered_class_name),
        )?;
        Ok(())
    }

    fn check(&self, config: &Config) -> Result<()> {
        if config.input.gtfs.is_none() {
            bail!("filter requires input.gtfs");
        }
        if config.input.class_file.is_none() {
            bail!("filter requires input.class_file");
        }
        Ok(())
    }
}
