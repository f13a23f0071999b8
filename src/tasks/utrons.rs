use std::collections::HashMap;
use std::path::Path;

use anyhow::{Result, bail};
use log::{debug, info};
use measure_time::info_time;
use serde::{Deserialize, Serialize};

use super::TaskRun;
use crate::bed::{BedRecord, write_bed};
use crate::config::{Config, Input, Output, read_transcripts};
use crate::gtf::{Strand, Transcript, TranscriptSet};
use crate::io;

/// Detect 3' UTR introns: introns of an assembled transcript lying entirely
/// downstream of its coding partner's stop codon.
#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct Task {
    /// optional file-name prefix, `<track>.all_utrons.bed.gz` etc.
    pub track: Option<String>,
}

#[derive(Debug, Default)]
pub struct UtronSets {
    pub all: Vec<BedRecord>,
    pub individual: Vec<BedRecord>,
    pub partnered: Vec<BedRecord>,
    pub novel: Vec<BedRecord>,
    pub no_cds: Vec<BedRecord>,
}

fn shared_exonic_bases(a: &Transcript, b: &Transcript) -> u64 {
    let mut shared = 0;
    for &(a_start, a_end) in a.exons.iter() {
        for &(b_start, b_end) in b.exons.iter() {
            let start = a_start.max(b_start);
            let end = a_end.min(b_end);
            if start < end {
                shared += end - start;
            }
        }
    }
    shared
}

/// Introns of `transcript` strictly downstream of `boundary`, strand-aware.
fn downstream_introns(transcript: &Transcript, boundary: u64) -> Vec<(u64, u64)> {
    transcript
        .introns()
        .into_iter()
        .filter(|&(start, end)| match transcript.strand {
            Strand::Plus => start >= boundary,
            Strand::Minus => end <= boundary,
            Strand::Unstranded => false,
        })
        .collect()
}

pub fn find_utrons(
    assembled: &TranscriptSet,
    reference: &TranscriptSet,
    classes: &HashMap<String, (String, String)>,
) -> UtronSets {
    // candidates are drawn gene-wise from the class partner
    let mut by_gene: HashMap<&str, Vec<usize>> = HashMap::new();
    for (ii, transcript) in reference.transcripts.iter().enumerate() {
        by_gene
            .entry(transcript.gene_id.as_str())
            .or_default()
            .push(ii);
    }
    let reference_introns = reference.intron_set();

    let mut sets = UtronSets::default();
    for ii in assembled.sorted_indices() {
        let transcript = &assembled.transcripts[ii];
        if transcript.exons.len() < 2 {
            continue;
        }
        let Some((_, partner_id)) = classes.get(&transcript.transcript_id) else {
            continue;
        };
        if partner_id == "." {
            continue;
        }
        let Some(partner) = reference.get(partner_id) else {
            debug!(
                "class partner {} of {} not in the reference",
                partner_id, transcript.transcript_id
            );
            continue;
        };
        // prefer a coding partner from the same gene over the class partner
        let best_coding = by_gene
            .get(partner.gene_id.as_str())
            .into_iter()
            .flatten()
            .map(|jj| &reference.transcripts[*jj])
            .filter(|candidate| candidate.stop_codon_boundary().is_some())
            .max_by_key(|candidate| {
                (
                    shared_exonic_bases(transcript, candidate),
                    std::cmp::Reverse(candidate.transcript_id.clone()),
                )
            });

        let (partner, utrons, coding) = match best_coding {
            Some(coding_partner) => {
                let boundary = coding_partner
                    .stop_codon_boundary()
                    .expect("unreachable");
                (
                    coding_partner,
                    downstream_introns(transcript, boundary),
                    true,
                )
            }
            None => {
                // no coding model in the gene: introns extending past the
                // partner's 3' end cannot be assessed for coding context
                let boundary = match transcript.strand {
                    Strand::Minus => partner.start(),
                    _ => partner.end(),
                };
                (partner, downstream_introns(transcript, boundary), false)
            }
        };
        if utrons.is_empty() {
            continue;
        }

        if !coding {
            for &(start, end) in utrons.iter() {
                sets.no_cds.push(
                    BedRecord::new(
                        &transcript.chrom,
                        start,
                        end,
                        &format!("{}:{}", transcript.transcript_id, partner.transcript_id),
                        transcript.strand,
                    ),
                );
            }
            continue;
        }

        let span_start = utrons.iter().map(|u| u.0).min().unwrap();
        let span_end = utrons.iter().map(|u| u.1).max().unwrap();
        sets.all.push(
            BedRecord::new(
                &transcript.chrom,
                span_start,
                span_end,
                &transcript.transcript_id,
                transcript.strand,
            )
            .with_blocks(utrons.clone()),
        );
        for (kk, &(start, end)) in utrons.iter().enumerate() {
            sets.individual.push(BedRecord::new(
                &transcript.chrom,
                start,
                end,
                &format!("{}.{}", transcript.transcript_id, kk + 1),
                transcript.strand,
            ));
            sets.partnered.push(BedRecord::new(
                &transcript.chrom,
                start,
                end,
                &format!("{}:{}", transcript.transcript_id, partner.transcript_id),
                transcript.strand,
            ));
            let known = reference_introns.contains(&(
                transcript.chrom.clone(),
                start,
                end,
                transcript.strand,
            ));
            if !known {
                sets.novel.push(BedRecord::new(
                    &transcript.chrom,
                    start,
                    end,
                    &transcript.transcript_id,
                    transcript.strand,
                ));
            }
        }
    }
    sets
}

pub fn write_utron_beds(sets: &UtronSets, directory: &Path, track: Option<&str>) -> Result<()> {
    let name = |suffix: &str| match track {
        Some(track) => format!("{}.{}", track, suffix),
        None => suffix.to_string(),
    };
    for (records, suffix) in [
        (&sets.all, "all_utrons.bed.gz"),
        (&sets.individual, "indevidual_utrons.bed.gz"),
        (&sets.partnered, "partnered_utrons.bed.gz"),
        (&sets.novel, "novel_utrons.bed.gz"),
        (&sets.no_cds, "no_cds_utrons.bed.gz"),
    ] {
        write_bed(records, io::open_output(directory.join(name(suffix)))?)?;
    }
    Ok(())
}

impl TaskRun for Task {
    fn run(&self, input: &Input, output: &Output) -> Result<()> {
        info_time!("finding utrons");
        let gtfs = input.resolve_gtfs()?;
        if gtfs.len() != 1 {
            bail!("utrons takes exactly one assembled GTF, got {}", gtfs.len());
        }
        let assembled = read_transcripts(&gtfs[0])?;
        let reference = input.reference_models()?;
        let classes = crate::tasks::classify::read_class_table(input.class_file()?)?;
        let sets = find_utrons(&assembled, &reference, &classes);
        info!(
            "{} transcripts with utrons, {} utrons ({} novel, {} without cds)",
            sets.all.len(),
            sets.individual.len(),
            sets.novel.len(),
            sets.no_cds.len()
        );
        output.ensure_dir()?;
        write_utron_beds(&sets, Path::new(&output.directory), self.track.as_deref())
    }

    fn check(&self, config: &Config) -> Result<()> {
        if config.input.gtfs.is_none() {
            bail!("utrons requires input.gtfs");
        }
        if config.input.reference_gtf.is_none() {
            bail!("utrons requires input.reference_gtf");
        }
        if config.input.class_file.is_none() {
            bail!("utrons requires input.class_file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gtf::parse_gtf;
    use std::io::Cursor;

    fn reference() -> TranscriptSet {
        // RT1: coding, stop codon ends at 550 (0-based); its own 3' UTR
        // carries a known intron 700..800. RT2: non-coding single gene.
        let gtf = "\
chr1\tr\texon\t101\t550\t.\t+\t.\tgene_id \"RG1\"; transcript_id \"RT1\";
chr1\tr\texon\t601\t700\t.\t+\t.\tgene_id \"RG1\"; transcript_id \"RT1\";
chr1\tr\texon\t801\t900\t.\t+\t.\tgene_id \"RG1\"; transcript_id \"RT1\";
chr1\tr\tCDS\t121\t550\t.\t+\t0\tgene_id \"RG1\"; transcript_id \"RT1\";
chr2\tr\texon\t101\t300\t.\t+\t.\tgene_id \"RG2\"; transcript_id \"RT2\";
";
        parse_gtf(Cursor::new(gtf)).unwrap()
    }

    fn classes_for(ids: &[(&str, &str)]) -> HashMap<String, (String, String)> {
        ids.iter()
            .map(|(id, partner)| {
                (
                    id.to_string(),
                    ("alternative".to_string(), partner.to_string()),
                )
            })
            .collect()
    }

    #[test]
    fn test_utron_downstream_of_stop_is_detected() {
        // novel intron 571..650 after the stop codon at 550
        let assembled = parse_gtf(Cursor::new(
            "\
chr1\tst\texon\t101\t570\t.\t+\t.\tgene_id \"M\"; transcript_id \"MSTRG.1.1\";
chr1\tst\texon\t651\t900\t.\t+\t.\tgene_id \"M\"; transcript_id \"MSTRG.1.1\";
",
        ))
        .unwrap();
        let classes = classes_for(&[("MSTRG.1.1", "RT1")]);
        let sets = find_utrons(&assembled, &reference(), &classes);
        assert_eq!(sets.all.len(), 1);
        assert_eq!(sets.individual.len(), 1);
        assert_eq!(sets.individual[0].start, 570);
        assert_eq!(sets.individual[0].end, 650);
        assert_eq!(sets.individual[0].name, "MSTRG.1.1.1");
        assert_eq!(sets.partnered[0].name, "MSTRG.1.1:RT1");
        assert_eq!(sets.novel.len(), 1);
        assert!(sets.no_cds.is_empty());
    }

    #[test]
    fn test_known_utron_is_not_novel() {
        // reproduces the reference's own UTR intron 700..800
        let assembled = parse_gtf(Cursor::new(
            "\
chr1\tst\texon\t101\t700\t.\t+\t.\tgene_id \"M\"; transcript_id \"MSTRG.2.1\";
chr1\tst\texon\t801\t900\t.\t+\t.\tgene_id \"M\"; transcript_id \"MSTRG.2.1\";
",
        ))
        .unwrap();
        let classes = classes_for(&[("MSTRG.2.1", "RT1")]);
        let sets = find_utrons(&assembled, &reference(), &classes);
        assert_eq!(sets.individual.len(), 1);
        assert!(sets.novel.is_empty());
    }

    #[test]
    fn test_intron_before_stop_is_no_utron() {
        let assembled = parse_gtf(Cursor::new(
            "\
chr1\tst\texon\t101\t300\t.\t+\t.\tgene_id \"M\"; transcript_id \"MSTRG.3.1\";
chr1\tst\texon\t401\t550\t.\t+\t.\tgene_id \"M\"; transcript_id \"MSTRG.3.1\";
",
        ))
        .unwrap();
        let classes = classes_for(&[("MSTRG.3.1", "RT1")]);
        let sets = find_utrons(&assembled, &reference(), &classes);
        assert!(sets.all.is_empty());
        assert!(sets.individual.is_empty());
    }

    #[test]
    fn test_minus_strand_boundary() {
        // minus strand gene: stop codon boundary is the CDS start
        let reference = parse_gtf(Cursor::new(
            "\
chr3\tr\texon\t101\t400\t.\t-\t.\tgene_id \"RG3\"; transcript_id \"RT3\";
chr3\tr\tCDS\t251\t400\t.\t-\t0\tgene_id \"RG3\"; transcript_id \"RT3\";
",
        ))
        .unwrap();
        let assembled = parse_gtf(Cursor::new(
            "\
chr3\tst\texon\t101\t150\t.\t-\t.\tgene_id \"M\"; transcript_id \"MSTRG.4.1\";
chr3\tst\texon\t181\t400\t.\t-\t.\tgene_id \"M\"; transcript_id \"MSTRG.4.1\";
",
        ))
        .unwrap();
        let classes = classes_for(&[("MSTRG.4.1", "RT3")]);
        let sets = find_utrons(&assembled, &reference, &classes);
        // intron 150..180 lies entirely below the boundary at 250
        assert_eq!(sets.individual.len(), 1);
        assert_eq!(sets.individual[0].start, 150);
        assert_eq!(sets.individual[0].end, 180);
    }

    #[test]
    fn test_non_coding_partner_goes_to_no_cds() {
        let assembled = parse_gtf(Cursor::new(
            "\
chr2\tst\texon\t101\t300\t.\t+\t.\tgene_id \"M\"; transcript_id \"MSTRG.5.1\";
chr2\tst\texon\t401\t500\t.\t+\t.\tgene_id \"M\"; transcript_id \"MSTRG.5.1\";
",
        ))
        .unwrap();
        let classes = classes_for(&[("MSTRG.5.1", "RT2")]);
        let sets = find_utrons(&assembled, &reference(), &classes);
        assert!(sets.all.is_empty());
        assert_eq!(sets.no_cds.len(), 1);
        assert_eq!(sets.no_cds[0].name, "MSTRG.5.1:RT2");
    }

    #[test]
    fn test_bed12_blocks_carry_all_utrons() {
        let assembled = parse_gtf(Cursor::new(
            "\
chr1\tst\texon\t101\t570\t.\t+\t.\tgene_id \"M\"; transcript_id \"MSTRG.6.1\";
chr1\tst\texon\t651\t700\t.\t+\t.\tgene_id \"M\"; transcript_id \"MSTRG.6.1\";
chr1\tst\texon\t801\t900\t.\t+\t.\tgene_id \"M\"; transcript_id \"MSTRG.6.1\";
",
        ))
        .unwrap();
        let classes = classes_for(&[("MSTRG.6.1", "RT1")]);
        let sets = find_utrons(&assembled, &reference(), &classes);
        assert_eq!(sets.all.len(), 1);
        assert_eq!(
            sets.all[0].intervals(),
            vec![(570, 650), (700, 800)]
        );
        assert_eq!(sets.individual.len(), 2);
    }
}
