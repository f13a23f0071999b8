use rust_htslib::bam::record::{Aux, Cigar, Record};

/// The bits of record-level convenience rust-htslib leaves to us.
pub trait BamRecordExtensions {
    /// Gap-free aligned blocks in reference coordinates, split at
    /// skips (N) and deletions (D).
    fn blocks(&self) -> Vec<(i64, i64)>;
    /// Whether the alignment contains a splice (an N cigar op).
    fn is_spliced(&self) -> bool;
    /// NH tag value; a missing tag counts as a single alignment.
    fn no_of_alignments(&self) -> usize;
}

impl BamRecordExtensions for Record {
    fn blocks(&self) -> Vec<(i64, i64)> {
        let mut res = Vec::new();
        let mut pos = self.pos();
        for op in self.cigar().iter() {
            match op {
                Cigar::Match(len) | Cigar::Equal(len) | Cigar::Diff(len) => {
                    res.push((pos, pos + *len as i64));
                    pos += *len as i64;
                }
                Cigar::Del(len) | Cigar::RefSkip(len) => {
                    pos += *len as i64;
                }
                Cigar::Ins(_) | Cigar::SoftClip(_) | Cigar::HardClip(_) | Cigar::Pad(_) => {}
            }
        }
        res
    }

    fn is_spliced(&self) -> bool {
        self.cigar().iter().any(|op| matches!(op, Cigar::RefSkip(_)))
    }

    fn no_of_alignments(&self) -> usize {
        match self.aux(b"NH") {
            Ok(Aux::I8(value)) => value as usize,
            Ok(Aux::I16(value)) => value as usize,
            Ok(Aux::I32(value)) => value as usize,
            Ok(Aux::U8(value)) => value as usize,
            Ok(Aux::U16(value)) => value as usize,
            Ok(Aux::U32(value)) => value as usize,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rust_htslib::bam;

    fn record_from(sam: &str) -> Record {
        let mut header = bam::Header::new();
        header.push_record(
            bam::header::HeaderRecord::new(b"SQ")
                .push_tag(b"SN", &"chr1")
                .push_tag(b"LN", &100000),
        );
        let header_view = bam::HeaderView::from_header(&header);
        Record::from_sam(&header_view, sam.as_bytes()).unwrap()
    }

    #[test]
    fn test_blocks_split_on_skips_and_deletions() {
        let read = record_from("r1\t0\tchr1\t951\t60\t50M100N50M\t*\t0\t0\t*\t*");
        assert_eq!(read.blocks(), vec![(950, 1000), (1100, 1150)]);
        assert!(read.is_spliced());

        let read = record_from("r2\t0\tchr1\t951\t60\t10M2D10M\t*\t0\t0\t*\t*");
        assert_eq!(read.blocks(), vec![(950, 960), (962, 972)]);
        assert!(!read.is_spliced());

        // insertions and soft clips do not advance the reference
        let read = record_from("r3\t0\tchr1\t951\t60\t5S10M3I10M\t*\t0\t0\t*\t*");
        assert_eq!(read.blocks(), vec![(950, 960), (960, 970)]);
    }

    #[test]
    fn test_no_of_alignments() {
        let read = record_from("r1\t0\tchr1\t951\t60\t10M\t*\t0\t0\t*\t*\tNH:i:3");
        assert_eq!(read.no_of_alignments(), 3);
        let untagged = record_from("r2\t0\tchr1\t951\t60\t10M\t*\t0\t0\t*\t*");
        assert_eq!(untagged.no_of_alignments(), 1);
    }
}
