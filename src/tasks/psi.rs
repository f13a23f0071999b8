use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use measure_time::info_time;
use rayon::iter::ParallelIterator;
use rayon::slice::ParallelSlice;
use rust_htslib::bam::{self, Read};
use serde::{Deserialize, Serialize};

use super::TaskRun;
use crate::bam_ext::BamRecordExtensions;
use crate::config::{Config, Input, Output};
use crate::filters::{Filter, ReadFilter, default_filters};

fn default_splice_tolerance() -> i64 {
    3
}

/// Classify reads over a set of utron junctions into retained / spliced /
/// incompatible and report the retention PSI per junction.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Task {
    /// allowed distance between a block boundary and the junction
    #[serde(default = "default_splice_tolerance")]
    splice_tolerance: i64,
    filters: Option<Vec<Filter>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JunctionCounts {
    pub retained: u32,
    pub spliced: u32,
    pub incompatible: u32,
    pub total: u32,
}

impl JunctionCounts {
    pub fn psi(&self) -> Option<f64> {
        let denominator = self.retained + self.spliced;
        if denominator == 0 {
            None
        } else {
            Some(self.retained as f64 / denominator as f64)
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadCall {
    Retained,
    Spliced,
    Incompatible,
}

/// Per-read verdict against one junction. Pure over the alignment's blocks
/// so it is testable without BAM fixtures.
///
/// A read without a splice whose alignment spans the junction start is
/// retained. Otherwise the block walk decides: a block spanning the start
/// means retention, a block ending at the start whose successor begins at
/// the end (both within the tolerance) means the junction was spliced.
/// Exactly one verdict per read.
pub fn classify_read(
    blocks: &[(i64, i64)],
    is_spliced_alignment: bool,
    start: i64,
    end: i64,
    tolerance: i64,
) -> ReadCall {
    if blocks.is_empty() {
        return ReadCall::Incompatible;
    }
    let pos = blocks[0].0;
    let end_pos = blocks[blocks.len() - 1].1;
    if !is_spliced_alignment && pos < start && end_pos > start {
        return ReadCall::Retained;
    }
    for (ii, block) in blocks.iter().enumerate() {
        if block.0 < start && block.1 > start {
            return ReadCall::Retained;
        }
        if let Some(next) = blocks.get(ii + 1) {
            if (block.1 - start).abs() < tolerance && (next.0 - end).abs() < tolerance {
                return ReadCall::Spliced;
            }
        }
    }
    ReadCall::Incompatible
}

struct Junction {
    chrom: String,
    start: u64,
    end: u64,
    name: String,
}

impl Task {
    fn count_junction(
        &self,
        bam: &mut bam::IndexedReader,
        junction: &Junction,
        filters: &[Filter],
    ) -> Result<JunctionCounts> {
        let tid = bam
            .header()
            .tid(junction.chrom.as_bytes())
            .with_context(|| format!("Contig {} not present in the bam", junction.chrom))?;
        bam.fetch((
            tid,
            junction.start.saturating_sub(1),
            junction.end + 1,
        ))?;
        let mut counts = JunctionCounts::default();
        let mut read = bam::Record::new();
        'outer: while let Some(bam_result) = bam.read(&mut read) {
            bam_result.with_context(|| {
                format!(
                    "Failed to read alignment over {}:{}-{}",
                    junction.chrom, junction.start, junction.end
                )
            })?;
            counts.total += 1;
            for f in filters.iter() {
                if f.remove_read(&read) {
                    continue 'outer;
                }
            }
            match classify_read(
                &read.blocks(),
                read.is_spliced(),
                junction.start as i64,
                junction.end as i64,
                self.splice_tolerance,
            ) {
                ReadCall::Retained => counts.retained += 1,
                ReadCall::Spliced => counts.spliced += 1,
                ReadCall::Incompatible => counts.incompatible += 1,
            }
        }
        Ok(counts)
    }
}

impl TaskRun for Task {
    fn run(&self, input: &Input, output: &Output) -> Result<()> {
        info_time!("psi over {}", input.bam()?);
        let filters = match &self.filters {
            Some(filters) => filters.clone(),
            None => default_filters(),
        };
        // fail early on a missing index, before any worker does
        drop(input.get_indexed_bam_reader()?);

        let junctions: Vec<Junction> = input
            .junctions()?
            .iter()
            .flat_map(|record| {
                record
                    .intervals()
                    .into_iter()
                    .map(|(start, end)| Junction {
                        chrom: record.chrom.clone(),
                        start,
                        end,
                        name: record.name.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        if junctions.is_empty() {
            bail!("No junctions in the input bed");
        }

        let rows: Arc<Mutex<Vec<(usize, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let pool = rayon::ThreadPoolBuilder::new().build().unwrap();
        let chunk_size = (junctions.len() / (pool.current_num_threads() * 4)).max(16);
        let indexed: Vec<(usize, &Junction)> = junctions.iter().enumerate().collect();
        let worker_results: Vec<Result<()>> = pool.install(|| {
            indexed
                .par_chunks(chunk_size)
                .map(|chunk| -> Result<()> {
                    let mut bam = input.get_indexed_bam_reader()?;
                    let mut local = Vec::with_capacity(chunk.len());
                    for (ii, junction) in chunk.iter() {
                        let counts = self.count_junction(&mut bam, junction, &filters)?;
                        if counts.total == 0 {
                            continue;
                        }
                        let psi = counts
                            .psi()
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "NA".to_string());
                        local.push((
                            *ii,
                            format!(
                                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
                                junction.chrom,
                                junction.start,
                                junction.end,
                                junction.name,
                                counts.retained,
                                counts.spliced,
                                counts.incompatible,
                                counts.total,
                                psi
                            ),
                        ));
                    }
                    match rows.lock() {
                        Ok(mut rows) => rows.extend(local),
                        Err(_) => bail!("Another thread panicked, output no longer available."),
                    }
                    Ok(())
                })
                .collect()
        });
        for result in worker_results {
            result?;
        }

        let mut rows = Arc::into_inner(rows)
            .context("Failed to retrieve output from arc")?
            .into_inner()
            .context("Failed to unlock output mutex")?;
        rows.sort_by_key(|(ii, _)| *ii);

        output.ensure_dir()?;
        let mut out = crate::io::open_output(output.path("psi.tsv"))?;
        out.write_all(b"contig\tstart\tend\tname\tretained\tspliced\tincompatible\ttotal\tpsi\n")
            .context("Failed to write header to output file")?;
        for (_, row) in rows {
            out.write_all(row.as_bytes())
                .context("Failed to write counts to output file")?;
        }
        Ok(())
    }

    fn check(&self, config: &Config) -> Result<()> {
        if config.input.bam.is_none() {
            bail!("psi requires input.bam");
        }
        if config.input.junctions.is_none() {
            bail!("psi requires input.junctions");
        }
        if self.splice_tolerance < 1 {
            bail!("splice_tolerance must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // junction at 1000..1100 throughout

    #[test]
    fn test_unspliced_read_spanning_start_is_retained() {
        let blocks = vec![(950, 1050)];
        assert_eq!(
            classify_read(&blocks, false, 1000, 1100, 3),
            ReadCall::Retained
        );
    }

    #[test]
    fn test_read_with_deletion_spanning_start_is_retained() {
        // deletions split blocks but the alignment still spans the start
        let blocks = vec![(950, 990), (992, 1050)];
        assert_eq!(
            classify_read(&blocks, false, 1000, 1100, 3),
            ReadCall::Retained
        );
    }

    #[test]
    fn test_spliced_read_matching_junction() {
        let blocks = vec![(950, 1000), (1100, 1150)];
        assert_eq!(
            classify_read(&blocks, true, 1000, 1100, 3),
            ReadCall::Spliced
        );
    }

    #[test]
    fn test_spliced_read_within_tolerance() {
        let blocks = vec![(950, 1002), (1099, 1150)];
        assert_eq!(
            classify_read(&blocks, true, 1000, 1100, 3),
            ReadCall::Spliced
        );
    }

    #[test]
    fn test_spliced_read_beyond_tolerance_is_incompatible() {
        let blocks = vec![(950, 1003), (1100, 1150)];
        assert_eq!(
            classify_read(&blocks, true, 1000, 1100, 3),
            ReadCall::Incompatible
        );
    }

    #[test]
    fn test_spliced_read_with_block_over_start_is_retained() {
        // a different, upstream splice; the block over the junction start
        // still shows retention
        let blocks = vec![(800, 900), (980, 1020)];
        assert_eq!(
            classify_read(&blocks, true, 1000, 1100, 3),
            ReadCall::Retained
        );
    }

    #[test]
    fn test_read_entirely_inside_intron_is_incompatible() {
        let blocks = vec![(1010, 1090)];
        assert_eq!(
            classify_read(&blocks, false, 1000, 1100, 3),
            ReadCall::Incompatible
        );
    }

    #[test]
    fn test_retention_wins_over_later_splice_match() {
        // block walk order decides, as a single verdict per read
        let blocks = vec![(990, 1010), (1010, 1098), (1099, 1150)];
        assert_eq!(
            classify_read(&blocks, true, 1000, 1100, 3),
            ReadCall::Retained
        );
    }

    #[test]
    fn test_psi_values() {
        let counts = JunctionCounts {
            retained: 3,
            spliced: 1,
            incompatible: 5,
            total: 9,
        };
        assert_eq!(counts.psi(), Some(0.75));
        let empty = JunctionCounts::default();
        assert_eq!(empty.psi(), None);
    }
}
