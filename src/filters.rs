use crate::bam_ext::BamRecordExtensions;
use enum_dispatch::enum_dispatch;

#[derive(serde::Deserialize, Debug, Clone, serde::Serialize, PartialEq, Eq)]
enum KeepOrRemove {
    #[serde(alias = "keep")]
    Keep,
    #[serde(alias = "remove")]
    Remove,
}

#[enum_dispatch(Filter)]
pub trait ReadFilter: Send + Sync {
    fn remove_read(&self, read: &rust_htslib::bam::record::Record) -> bool;
}

#[derive(serde::Deserialize, Debug, Clone, strum_macros::Display, serde::Serialize)]
#[serde(tag = "mode")]
#[enum_dispatch]
pub enum Filter {
    #[serde(alias = "multimapper")]
    MultiMapper(MultiMapper),
    #[serde(alias = "unmapped")]
    Unmapped(Unmapped),
    #[serde(alias = "non_primary")]
    NonPrimary(NonPrimary),
    #[serde(alias = "min_map_quality")]
    MinMapQuality(MinMapQuality),
}

/// What the read-classification task applies when the config sets nothing:
/// unique mappers only, no unmapped reads. Matches what the counts mean.
pub fn default_filters() -> Vec<Filter> {
    vec![
        Filter::MultiMapper(MultiMapper {
            action: KeepOrRemove::Remove,
        }),
        Filter::Unmapped(Unmapped {
            action: KeepOrRemove::Remove,
        }),
    ]
}

#[derive(serde::Deserialize, Debug, Clone, serde::Serialize)]
pub struct MultiMapper {
    action: KeepOrRemove,
}

impl ReadFilter for MultiMapper {
    fn remove_read(&self, read: &rust_htslib::bam::record::Record) -> bool {
        // a missing NH tag counts as uniquely mapped
        let hit = read.no_of_alignments() > 1;
        match self.action {
            KeepOrRemove::Keep => !hit,
            KeepOrRemove::Remove => hit,
        }
    }
}

#[derive(serde::Deserialize, Debug, Clone, serde::Serialize)]
pub struct Unmapped {
    action: KeepOrRemove,
}

impl ReadFilter for Unmapped {
    fn remove_read(&self, read: &rust_htslib::bam::record::Record) -> bool {
        if read.is_unmapped() {
            return self.action == KeepOrRemove::Remove;
        }
        false
    }
}

#[derive(serde::Deserialize, Debug, Clone, serde::Serialize)]
pub struct NonPrimary {
    action: KeepOrRemove,
}

impl ReadFilter for NonPrimary {
    fn remove_read(&self, read: &rust_htslib::bam::record::Record) -> bool {
        if read.is_secondary() {
            return self.action == KeepOrRemove::Remove;
        }
        false
    }
}

#[derive(serde::Deserialize, Debug, Clone, serde::Serialize)]
pub struct MinMapQuality {
    min: u8,
}

impl ReadFilter for MinMapQuality {
    fn remove_read(&self, read: &rust_htslib::bam::record::Record) -> bool {
        read.mapq() < self.min
    }
}
