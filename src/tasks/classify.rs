use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use measure_time::info_time;
use serde::{Deserialize, Serialize};

use super::TaskRun;
use crate::config::{Config, Input, Output, read_transcripts};
use crate::gtf::{Strand, Transcript, TranscriptSet};
use crate::io;

fn default_flank() -> u64 {
    1000
}

fn default_class_name() -> String {
    "merged.class.tsv.gz".to_string()
}

/// Assign each assembled transcript a class relative to the reference
/// geneset. The class vocabulary is fixed by the downstream filter:
/// complete, fragment, alternative, utr5, utr3, intronic, flank5, flank3,
/// intergenic.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Task {
    /// how far up/downstream of a gene a transcript still counts as flanking
    #[serde(default = "default_flank")]
    pub flank: u64,
    #[serde(default = "default_class_name")]
    pub class_name: String,
}

impl Default for Task {
    fn default() -> Self {
        Task {
            flank: default_flank(),
            class_name: default_class_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClassRow {
    pub transcript_id: String,
    pub gene_id: String,
    pub n_exons: usize,
    pub partner_id: String,
    pub partner_gene: String,
    pub class: String,
    pub sense: char,
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

fn is_contiguous_subchain(sub: &[(u64, u64)], full: &[(u64, u64)]) -> bool {
    if sub.is_empty() {
        return true;
    }
    if sub.len() > full.len() {
        return false;
    }
    full.windows(sub.len()).any(|window| window == sub)
}

fn classify_against_partner(transcript: &Transcript, partner: &Transcript) -> String {
    if let Some((cds_start, cds_end)) = partner.cds {
        let (class_before, class_after) = match partner.strand {
            Strand::Minus => ("utr3", "utr5"),
            _ => ("utr5", "utr3"),
        };
        if transcript.end() <= cds_start {
            return class_before.to_string();
        }
        if transcript.start() >= cds_end {
            return class_after.to_string();
        }
    }
    let own_introns = transcript.introns();
    let partner_introns = partner.introns();
    if own_introns == partner_introns {
        "complete".to_string()
    } else if is_contiguous_subchain(&own_introns, &partner_introns) {
        "fragment".to_string()
    } else {
        "alternative".to_string()
    }
}

fn sense(a: Strand, b: Strand) -> char {
    match (a, b) {
        (Strand::Unstranded, _) | (_, Strand::Unstranded) => '.',
        (a, b) if a == b => '+',
        _ => '-',
    }
}

/// Pick the partner and the class for every assembled transcript.
pub fn classify_set(
    assembled: &TranscriptSet,
    reference: &TranscriptSet,
    flank: u64,
) -> Vec<ClassRow> {
    let span_trees = reference.span_trees();
    let empty = bio::data_structures::interval_tree::IntervalTree::new();
    let mut rows = Vec::with_capacity(assembled.len());
    for ii in assembled.sorted_indices() {
        let transcript = &assembled.transcripts[ii];
        let tree = span_trees.get(&transcript.chrom).unwrap_or(&empty);
        let window_start = transcript.start().saturating_sub(flank);
        let window_end = transcript.end() + flank;
        let mut overlapping: Vec<&Transcript> = Vec::new();
        let mut flanking: Vec<&Transcript> = Vec::new();
        for entry in tree.find(window_start..window_end) {
            let candidate = &reference.transcripts[*entry.data()];
            if candidate.start() < transcript.end() && candidate.end() > transcript.start() {
                overlapping.push(candidate);
            } else {
                flanking.push(candidate);
            }
        }

        let row = if overlapping.is_empty() && flanking.is_empty() {
            ClassRow {
                transcript_id: transcript.transcript_id.clone(),
                gene_id: transcript.gene_id.clone(),
                n_exons: transcript.exons.len(),
                partner_id: ".".to_string(),
                partner_gene: ".".to_string(),
                class: "intergenic".to_string(),
                sense: '.',
            }
        } else if overlapping.is_empty() {
            // nearest neighbour decides which side we flank
            let partner = flanking
                .iter()
                .min_by_key(|candidate| {
                    if candidate.start() >= transcript.end() {
                        candidate.start() - transcript.end()
                    } else {
                        transcript.start() - candidate.end()
                    }
                })
                .unwrap();
            let transcript_is_upstream = transcript.end() <= partner.start();
            let class = match (transcript_is_upstream, partner.strand) {
                (true, Strand::Minus) => "flank3",
                (false, Strand::Minus) => "flank5",
                (true, _) => "flank5",
                (false, _) => "flank3",
            };
            ClassRow {
                transcript_id: transcript.transcript_id.clone(),
                gene_id: transcript.gene_id.clone(),
                n_exons: transcript.exons.len(),
                partner_id: partner.transcript_id.clone(),
                partner_gene: partner.gene_id.clone(),
                class: class.to_string(),
                sense: sense(transcript.strand, partner.strand),
            }
        } else {
            let best = overlapping
                .iter()
                .max_by_key(|candidate| {
                    (
                        shared_exonic_bases(transcript, candidate),
                        candidate.is_coding(),
                        std::cmp::Reverse(candidate.transcript_id.clone()),
                    )
                })
                .unwrap();
            let class = if shared_exonic_bases(transcript, best) == 0 {
                "intronic".to_string()
            } else {
                classify_against_partner(transcript, best)
            };
            ClassRow {
                transcript_id: transcript.transcript_id.clone(),
                gene_id: transcript.gene_id.clone(),
                n_exons: transcript.exons.len(),
                partner_id: best.transcript_id.clone(),
                partner_gene: best.gene_id.clone(),
                class,
                sense: sense(transcript.strand, best.strand),
            }
        };
        rows.push(row);
    }
    rows
}

pub fn write_class_table(rows: &[ClassRow], writer: impl std::io::Write) -> Result<()> {
    let mut table = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(writer);
    table.write_record([
        "transcript_id",
        "gene_id",
        "n_exons",
        "partner_id",
        "partner_gene",
        "class",
        "sense",
    ])?;
    for row in rows {
        table.write_record([
            row.transcript_id.clone(),
            row.gene_id.clone(),
            row.n_exons.to_string(),
            row.partner_id.clone(),
            row.partner_gene.clone(),
            row.class.clone(),
            row.sense.to_string(),
        ])?;
    }
    table.flush()?;
    Ok(())
}

/// Read a class table back into transcript_id -> (class, partner_id).
pub fn read_class_table(path: &str) -> Result<HashMap<String, (String, String)>> {
    let mut table = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_reader(io::open_file(path)?);
    let headers = table.headers()?.clone();
    let class_idx = headers
        .iter()
        .position(|h| h == "class")
        .with_context(|| format!("No 'class' column in {}", path))?;
    let partner_idx = headers
        .iter()
        .position(|h| h == "partner_id")
        .with_context(|| format!("No 'partner_id' column in {}", path))?;
    let mut res = HashMap::new();
    for record in table.records() {
        let record = record?;
        res.insert(
            record[0].to_string(),
            (record[class_idx].to_string(), record[partner_idx].to_string()),
        );
    }
    Ok(res)
}

impl TaskRun for Task {
    fn run(&self, input: &Input, output: &Output) -> Result<()> {
        info_time!("classifying transcripts");
        let gtfs = input.resolve_gtfs()?;
        if gtfs.len() != 1 {
            bail!("classify takes exactly one assembled GTF, got {}", gtfs.len());
        }
        let assembled = read_transcripts(&gtfs[0])?;
        let reference = input.reference_models()?;
        let rows = classify_set(&assembled, &reference, self.flank);
        output.ensure_dir()?;
        write_class_table(&rows, io::open_output(output.path(&self.class_name))?)?;
        Ok(())
    }

    fn check(&self, config: &Config) -> Result<()> {
        if config.input.gtfs.is_none() {
            bail!("classify requires input.gtfs");
        }
        if config.input.reference_gtf.is_none() {
            bail!("classify requires input.reference_gtf");
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
        // coding gene on chr1: exons 100-200, 300-400, 500-700; CDS 120-550
        let gtf = "\
chr1\ttest\texon\t101\t200\t.\t+\t.\tgene_id \"RG1\"; transcript_id \"RT1\";
chr1\ttest\texon\t301\t400\t.\t+\t.\tgene_id \"RG1\"; transcript_id \"RT1\";
chr1\ttest\texon\t501\t700\t.\t+\t.\tgene_id \"RG1\"; transcript_id \"RT1\";
chr1\ttest\tCDS\t121\t550\t.\t+\t0\tgene_id \"RG1\"; transcript_id \"RT1\";
";
        parse_gtf(Cursor::new(gtf)).unwrap()
    }

    fn assemble(gtf: &str) -> TranscriptSet {
        parse_gtf(Cursor::new(gtf)).unwrap()
    }

    fn single_class(assembled: &TranscriptSet) -> ClassRow {
        let rows = classify_set(assembled, &reference(), 1000);
        assert_eq!(rows.len(), 1);
        rows.into_iter().next().unwrap()
    }

    #[test]
    fn test_complete_match() {
        let assembled = assemble(
            "\
chr1\tst\texon\t91\t200\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.1.1\";
chr1\tst\texon\t301\t400\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.1.1\";
chr1\tst\texon\t501\t720\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.1.1\";
",
        );
        let row = single_class(&assembled);
        assert_eq!(row.class, "complete");
        assert_eq!(row.partner_id, "RT1");
        assert_eq!(row.sense, '+');
    }

    #[test]
    fn test_fragment() {
        let assembled = assemble(
            "\
chr1\tst\texon\t151\t200\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.2.1\";
chr1\tst\texon\t301\t400\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.2.1\";
",
        );
        assert_eq!(single_class(&assembled).class, "fragment");
    }

    #[test]
    fn test_alternative_with_novel_junction() {
        let assembled = assemble(
            "\
chr1\tst\texon\t101\t200\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.3.1\";
chr1\tst\texon\t301\t350\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.3.1\";
chr1\tst\texon\t381\t400\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.3.1\";
chr1\tst\texon\t501\t700\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.3.1\";
",
        );
        assert_eq!(single_class(&assembled).class, "alternative");
    }

    #[test]
    fn test_utr3() {
        // entirely downstream of the CDS end at 550, inside the last exon
        let assembled = assemble(
            "chr1\tst\texon\t581\t690\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.4.1\";\n",
        );
        assert_eq!(single_class(&assembled).class, "utr3");
    }

    #[test]
    fn test_intronic() {
        let assembled = assemble(
            "chr1\tst\texon\t211\t290\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.5.1\";\n",
        );
        assert_eq!(single_class(&assembled).class, "intronic");
    }

    #[test]
    fn test_flank_and_intergenic() {
        let upstream = assemble(
            "chr1\tst\texon\t11\t60\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.6.1\";\n",
        );
        assert_eq!(single_class(&upstream).class, "flank5");
        let downstream = assemble(
            "chr1\tst\texon\t801\t900\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.7.1\";\n",
        );
        assert_eq!(single_class(&downstream).class, "flank3");
        let far = assemble(
            "chr1\tst\texon\t9001\t9100\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.8.1\";\n",
        );
        assert_eq!(single_class(&far).class, "intergenic");
    }

    #[test]
    fn test_class_table_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.tsv.gz");
        let assembled = assemble(
            "chr1\tst\texon\t211\t290\t.\t+\t.\tgene_id \"M1\"; transcript_id \"MSTRG.5.1\";\n",
        );
        let rows = classify_set(&assembled, &reference(), 1000);
        write_class_table(&rows, io::open_output(&path).unwrap()).unwrap();
        let table = read_class_table(path.to_str().unwrap()).unwrap();
        assert_eq!(
            table.get("MSTRG.5.1"),
            Some(&("intronic".to_string(), "RT1".to_string()))
        );
    }
}
