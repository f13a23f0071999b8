use anyhow::{Context, Result, bail};
use bio::data_structures::interval_tree::IntervalTree;
use std::{
    collections::{HashMap, HashSet},
    io::{BufRead, Write},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strand {
    Plus,
    Minus,
    Unstranded,
}

impl Strand {
    pub fn from_str(value: &str) -> Strand {
        match value {
            "+" => Strand::Plus,
            "-" => Strand::Minus,
            _ => Strand::Unstranded,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Strand::Plus => '+',
            Strand::Minus => '-',
            Strand::Unstranded => '.',
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transcript {
    pub transcript_id: String,
    pub gene_id: String,
    pub chrom: String,
    pub strand: Strand,
    /// 0-based half-open, ascending, non-overlapping after parsing
    pub exons: Vec<(u64, u64)>,
    /// CDS span including the stop codon, when annotated
    pub cds: Option<(u64, u64)>,
}

impl Transcript {
    pub fn start(&self) -> u64 {
        self.exons.first().map(|e| e.0).unwrap_or(0)
    }

    pub fn end(&self) -> u64 {
        self.exons.last().map(|e| e.1).unwrap_or(0)
    }

    /// Successor-pair gaps of the exon chain.
    pub fn introns(&self) -> Vec<(u64, u64)> {
        self.exons
            .windows(2)
            .map(|pair| (pair[0].1, pair[1].0))
            .collect()
    }

    /// Genomic boundary of the stop codon: CDS end on plus, CDS start on
    /// minus. None for non-coding models and unstranded ones.
    pub fn stop_codon_boundary(&self) -> Option<u64> {
        let (cds_start, cds_end) = self.cds?;
        match self.strand {
            Strand::Plus => Some(cds_end),
            Strand::Minus => Some(cds_start),
            Strand::Unstranded => None,
        }
    }

    pub fn is_coding(&self) -> bool {
        self.cds.is_some()
    }

    fn add_exon(&mut self, start: u64, end: u64) {
        self.exons.push((start, end));
    }

    fn extend_cds(&mut self, start: u64, end: u64) {
        self.cds = match self.cds {
            None => Some((start, end)),
            Some((s, e)) => Some((s.min(start), e.max(end))),
        };
    }

    fn finish(&mut self) {
        self.exons.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.exons.len());
        for &(start, end) in self.exons.iter() {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        self.exons = merged;
    }
}

#[derive(Debug, Default)]
pub struct TranscriptSet {
    pub transcripts: Vec<Transcript>,
    by_id: HashMap<String, usize>,
}

impl TranscriptSet {
    pub fn from_transcripts(transcripts: Vec<Transcript>) -> TranscriptSet {
        let by_id = transcripts
            .iter()
            .enumerate()
            .map(|(ii, t)| (t.transcript_id.clone(), ii))
            .collect();
        TranscriptSet { transcripts, by_id }
    }

    pub fn len(&self) -> usize {
        self.transcripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transcripts.is_empty()
    }

    pub fn get(&self, transcript_id: &str) -> Option<&Transcript> {
        self.by_id.get(transcript_id).map(|ii| &self.transcripts[*ii])
    }

    /// Per-chromosome trees over whole transcript spans, carrying the
    /// transcript's index.
    pub fn span_trees(&self) -> HashMap<String, IntervalTree<u64, usize>> {
        let mut trees: HashMap<String, IntervalTree<u64, usize>> = HashMap::new();
        for (ii, transcript) in self.transcripts.iter().enumerate() {
            if transcript.exons.is_empty() {
                continue;
            }
            let tree = trees.entry(transcript.chrom.clone()).or_default();
            tree.insert(transcript.start()..transcript.end(), ii);
        }
        trees
    }

    /// Per-chromosome trees over individual exons, carrying the
    /// transcript's index.
    pub fn exon_trees(&self) -> HashMap<String, IntervalTree<u64, usize>> {
        let mut trees: HashMap<String, IntervalTree<u64, usize>> = HashMap::new();
        for (ii, transcript) in self.transcripts.iter().enumerate() {
            let tree = trees.entry(transcript.chrom.clone()).or_default();
            for &(start, end) in transcript.exons.iter() {
                tree.insert(start..end, ii);
            }
        }
        trees
    }

    /// Every annotated intron as (chrom, start, end, strand).
    pub fn intron_set(&self) -> HashSet<(String, u64, u64, Strand)> {
        let mut introns = HashSet::new();
        for transcript in self.transcripts.iter() {
            for (start, end) in transcript.introns() {
                introns.insert((transcript.chrom.clone(), start, end, transcript.strand));
            }
        }
        introns
    }

    /// Indices in gene+transcript order: genes by position of their first
    /// transcript, transcripts within a gene by id, then start.
    pub fn sorted_indices(&self) -> Vec<usize> {
        let mut gene_start: HashMap<&str, (&str, u64)> = HashMap::new();
        for transcript in self.transcripts.iter() {
            let entry = gene_start
                .entry(transcript.gene_id.as_str())
                .or_insert((transcript.chrom.as_str(), transcript.start()));
            if (transcript.chrom.as_str(), transcript.start()) < *entry {
                *entry = (transcript.chrom.as_str(), transcript.start());
            }
        }
        let mut indices: Vec<usize> = (0..self.transcripts.len()).collect();
        indices.sort_by(|a, b| {
            let ta = &self.transcripts[*a];
            let tb = &self.transcripts[*b];
            let ga = gene_start[ta.gene_id.as_str()];
            let gb = gene_start[tb.gene_id.as_str()];
            ga.cmp(&gb)
                .then_with(|| ta.gene_id.cmp(&tb.gene_id))
                .then_with(|| ta.transcript_id.cmp(&tb.transcript_id))
                .then_with(|| ta.start().cmp(&tb.start()))
        });
        indices
    }
}

fn parse_attributes(attributes: &str) -> HashMap<&str, &str> {
    let mut res = HashMap::new();
    let it = attributes
        .split_terminator(';')
        .map(str::trim_start)
        .filter(|x| !x.is_empty());
    for attr_value in it {
        let mut kv = attr_value.splitn(2, ' ');
        let key = kv.next().unwrap();
        if let Some(value) = kv.next() {
            res.insert(key, value.trim_matches('"'));
        }
    }
    res
}

pub fn parse_gtf(reader: impl BufRead) -> Result<TranscriptSet> {
    let mut set = TranscriptSet::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(9, '\t');
        let seqname = parts.next().context("Failed to find seqname")?;
        parts.next(); //consume source
        let feature = parts.next().context("Failed to find feature")?;
        if feature != "exon" && feature != "CDS" && feature != "stop_codon" {
            continue;
        }
        let start: u64 = parts.next().context("Failed to find start")?.parse()?;
        let start = start - 1;
        let end: u64 = parts.next().context("Failed to find end")?.parse()?;
        parts.next(); //consume score
        let strand = Strand::from_str(parts.next().context("Failed to find strand")?);
        parts.next(); //consume frame
        let attributes = parts.next().context("Failed to find attributes")?;
        let attributes = parse_attributes(attributes);
        let transcript_id = attributes.get("transcript_id").with_context(|| {
            format!("Line {}: {} row without transcript_id", line_no + 1, feature)
        })?;
        let gene_id = attributes
            .get("gene_id")
            .with_context(|| format!("Line {}: {} row without gene_id", line_no + 1, feature))?;

        let ii = match set.by_id.get(*transcript_id) {
            Some(ii) => *ii,
            None => {
                set.transcripts.push(Transcript {
                    transcript_id: transcript_id.to_string(),
                    gene_id: gene_id.to_string(),
                    chrom: seqname.to_string(),
                    strand,
                    exons: Vec::new(),
                    cds: None,
                });
                set.by_id
                    .insert(transcript_id.to_string(), set.transcripts.len() - 1);
                set.transcripts.len() - 1
            }
        };
        let transcript = &mut set.transcripts[ii];
        match feature {
            "exon" => transcript.add_exon(start, end),
            // GTF CDS rows exclude the stop codon, fold both into one span
            "CDS" | "stop_codon" => transcript.extend_cds(start, end),
            _ => unreachable!(),
        }
    }
    for transcript in set.transcripts.iter_mut() {
        if transcript.exons.is_empty() {
            bail!(
                "Transcript {} has CDS rows but no exon rows",
                transcript.transcript_id
            );
        }
        transcript.finish();
    }
    Ok(set)
}

/// Emit transcript/exon (and CDS span) rows in gene+transcript order.
/// Downstream consumers stream transcripts gene-wise, so the order is part
/// of the contract.
pub fn write_gtf(set: &TranscriptSet, mut writer: impl Write) -> Result<()> {
    for ii in set.sorted_indices() {
        let transcript = &set.transcripts[ii];
        let attrs = format!(
            "gene_id \"{}\"; transcript_id \"{}\";",
            transcript.gene_id, transcript.transcript_id
        );
        writeln!(
            writer,
            "{}\tutron_tools\ttranscript\t{}\t{}\t.\t{}\t.\t{}",
            transcript.chrom,
            transcript.start() + 1,
            transcript.end(),
            transcript.strand.symbol(),
            attrs
        )?;
        for (exon_no, (start, end)) in transcript.exons.iter().enumerate() {
            writeln!(
                writer,
                "{}\tutron_tools\texon\t{}\t{}\t.\t{}\t.\t{} exon_number \"{}\";",
                transcript.chrom,
                start + 1,
                end,
                transcript.strand.symbol(),
                attrs,
                exon_no + 1
            )?;
        }
        if let Some((cds_start, cds_end)) = transcript.cds {
            writeln!(
                writer,
                "{}\tutron_tools\tCDS\t{}\t{}\t.\t{}\t.\t{}",
                transcript.chrom,
                cds_start + 1,
                cds_end,
                transcript.strand.symbol(),
                attrs
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &str = "\
#!genome-build test
chr1\thavana\texon\t101\t200\t.\t+\t.\tgene_id \"G1\"; transcript_id \"T1\";
chr1\thavana\texon\t301\t400\t.\t+\t.\tgene_id \"G1\"; transcript_id \"T1\";
chr1\thavana\tCDS\t121\t200\t.\t+\t0\tgene_id \"G1\"; transcript_id \"T1\";
chr1\thavana\tCDS\t301\t330\t.\t+\t1\tgene_id \"G1\"; transcript_id \"T1\";
chr1\thavana\tstop_codon\t331\t333\t.\t+\t0\tgene_id \"G1\"; transcript_id \"T1\";
chr2\thavana\texon\t51\t90\t.\t-\t.\tgene_id \"G2\"; transcript_id \"T2\";
";

    #[test]
    fn test_parse() {
        let set = parse_gtf(Cursor::new(SAMPLE)).unwrap();
        assert_eq!(set.len(), 2);
        let t1 = set.get("T1").unwrap();
        assert_eq!(t1.exons, vec![(100, 200), (300, 400)]);
        assert_eq!(t1.introns(), vec![(200, 300)]);
        assert_eq!(t1.cds, Some((120, 333)));
        assert_eq!(t1.stop_codon_boundary(), Some(333));
        let t2 = set.get("T2").unwrap();
        assert!(!t2.is_coding());
        assert_eq!(t2.strand, Strand::Minus);
    }

    #[test]
    fn test_overlapping_exons_are_merged() {
        let gtf = "\
chr1\tstringtie\texon\t1\t100\t.\t+\t.\tgene_id \"G\"; transcript_id \"T\";
chr1\tstringtie\texon\t50\t150\t.\t+\t.\tgene_id \"G\"; transcript_id \"T\";
";
        let set = parse_gtf(Cursor::new(gtf)).unwrap();
        assert_eq!(set.get("T").unwrap().exons, vec![(0, 150)]);
    }

    #[test]
    fn test_missing_transcript_id_is_an_error() {
        let gtf = "chr1\tx\texon\t1\t10\t.\t+\t.\tgene_id \"G\";\n";
        assert!(parse_gtf(Cursor::new(gtf)).is_err());
    }

    #[test]
    fn test_write_round_trip_is_sorted() {
        let gtf = "\
chr1\tstringtie\texon\t500\t600\t.\t+\t.\tgene_id \"G2\"; transcript_id \"T3\";
chr1\tstringtie\texon\t1\t100\t.\t+\t.\tgene_id \"G1\"; transcript_id \"T2\";
chr1\tstringtie\texon\t1\t80\t.\t+\t.\tgene_id \"G1\"; transcript_id \"T1\";
";
        let set = parse_gtf(Cursor::new(gtf)).unwrap();
        let mut out = Vec::new();
        write_gtf(&set, &mut out).unwrap();
        let rendered = String::from_utf8(out).unwrap();
        let reparsed = parse_gtf(Cursor::new(rendered.as_str())).unwrap();
        let ids: Vec<&str> = reparsed
            .transcripts
            .iter()
            .map(|t| t.transcript_id.as_str())
            .collect();
        assert_eq!(ids, vec!["T1", "T2", "T3"]);
    }

    #[test]
    fn test_intron_set() {
        let set = parse_gtf(Cursor::new(SAMPLE)).unwrap();
        let introns = set.intron_set();
        assert!(introns.contains(&("chr1".to_string(), 200, 300, Strand::Plus)));
        assert_eq!(introns.len(), 1);
    }
}
