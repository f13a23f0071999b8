use crate::gtf::Strand;
use anyhow::{Context, Result, bail};
use itertools::Itertools;
use std::io::{BufRead, Write};

/// One BED6/BED12 record. Coordinates are 0-based half-open as in the
/// format itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BedRecord {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub name: String,
    pub score: u32,
    pub strand: Strand,
    /// BED12 blocks as genomic intervals, ascending
    pub blocks: Option<Vec<(u64, u64)>>,
}

impl BedRecord {
    pub fn new(chrom: &str, start: u64, end: u64, name: &str, strand: Strand) -> BedRecord {
        BedRecord {
            chrom: chrom.to_string(),
            start,
            end,
            name: name.to_string(),
            score: 0,
            strand,
            blocks: None,
        }
    }

    pub fn with_blocks(mut self, blocks: Vec<(u64, u64)>) -> BedRecord {
        self.blocks = Some(blocks);
        self
    }

    /// The intervals this record describes: the blocks for a BED12 record,
    /// the plain span otherwise.
    pub fn intervals(&self) -> Vec<(u64, u64)> {
        match &self.blocks {
            Some(blocks) => blocks.clone(),
            None => vec![(self.start, self.end)],
        }
    }
}

pub fn parse_bed(reader: impl BufRead) -> Result<Vec<BedRecord>> {
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') || line.starts_with("track") {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 6 {
            bail!(
                "Line {}: BED record with {} fields, need at least 6",
                line_no + 1,
                fields.len()
            );
        }
        let start: u64 = fields[1]
            .parse()
            .with_context(|| format!("Line {}: unparseable start", line_no + 1))?;
        let end: u64 = fields[2]
            .parse()
            .with_context(|| format!("Line {}: unparseable end", line_no + 1))?;
        let score: u32 = fields[4].parse().unwrap_or(0);
        let blocks = if fields.len() >= 12 {
            let count: usize = fields[9]
                .parse()
                .with_context(|| format!("Line {}: unparseable block count", line_no + 1))?;
            let sizes: Vec<u64> = split_list(fields[10])
                .with_context(|| format!("Line {}: unparseable block sizes", line_no + 1))?;
            let starts: Vec<u64> = split_list(fields[11])
                .with_context(|| format!("Line {}: unparseable block starts", line_no + 1))?;
            if sizes.len() != count || starts.len() != count {
                bail!(
                    "Line {}: block count {} disagrees with size/start lists",
                    line_no + 1,
                    count
                );
            }
            Some(
                starts
                    .iter()
                    .zip(sizes.iter())
                    .map(|(block_start, size)| (start + block_start, start + block_start + size))
                    .collect(),
            )
        } else {
            None
        };
        records.push(BedRecord {
            chrom: fields[0].to_string(),
            start,
            end,
            name: fields[3].to_string(),
            score,
            strand: Strand::from_str(fields[5]),
            blocks,
        });
    }
    Ok(records)
}

fn split_list(value: &str) -> Result<Vec<u64>> {
    value
        .split_terminator(',')
        .map(|x| x.parse().context("not a number"))
        .collect()
}

pub fn write_bed(records: &[BedRecord], mut writer: impl Write) -> Result<()> {
    for record in records {
        match &record.blocks {
            None => writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}\t{}",
                record.chrom,
                record.start,
                record.end,
                record.name,
                record.score,
                record.strand.symbol()
            )?,
            Some(blocks) => {
                let sizes = blocks.iter().map(|(s, e)| e - s).join(",");
                let starts = blocks.iter().map(|(s, _)| s - record.start).join(",");
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t0\t{}\t{},\t{},",
                    record.chrom,
                    record.start,
                    record.end,
                    record.name,
                    record.score,
                    record.strand.symbol(),
                    record.start,
                    record.end,
                    blocks.len(),
                    sizes,
                    starts
                )?
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_bed6() {
        let bed = "chr1\t100\t200\tjunction_1\t0\t+\n";
        let records = parse_bed(Cursor::new(bed)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].intervals(), vec![(100, 200)]);
        assert_eq!(records[0].strand, Strand::Plus);
    }

    #[test]
    fn test_parse_bed12_blocks() {
        let bed = "chr1\t100\t500\tt1\t0\t-\t100\t500\t0\t2\t50,100,\t0,300,\n";
        let records = parse_bed(Cursor::new(bed)).unwrap();
        assert_eq!(records[0].intervals(), vec![(100, 150), (400, 500)]);
    }

    #[test]
    fn test_short_record_is_an_error() {
        assert!(parse_bed(Cursor::new("chr1\t1\t2\tname\n")).is_err());
    }

    #[test]
    fn test_block_count_mismatch_is_an_error() {
        let bed = "chr1\t100\t500\tt1\t0\t-\t100\t500\t0\t3\t50,100,\t0,300,\n";
        assert!(parse_bed(Cursor::new(bed)).is_err());
    }

    #[test]
    fn test_write_round_trip() {
        let records = vec![
            BedRecord::new("chr1", 10, 90, "a", Strand::Plus),
            BedRecord::new("chr2", 5, 500, "b", Strand::Minus)
                .with_blocks(vec![(5, 50), (400, 500)]),
        ];
        let mut out = Vec::new();
        write_bed(&records, &mut out).unwrap();
        let reparsed = parse_bed(Cursor::new(String::from_utf8(out).unwrap())).unwrap();
        assert_eq!(reparsed[0], records[0]);
        assert_eq!(reparsed[1].intervals(), vec![(5, 50), (400, 500)]);
    }
}
