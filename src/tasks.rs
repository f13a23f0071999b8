pub mod classify;
pub mod extract;
pub mod filter;
pub mod layout;
pub mod merge;
pub mod parquet;
pub mod psi;
pub mod saturation;
pub mod summarize;
pub mod utrons;

use crate::config::{Config, Input, Output};
use enum_dispatch::enum_dispatch;

#[enum_dispatch(Task)]
pub trait TaskRun {
    fn run(&self, input: &Input, output: &Output) -> anyhow::Result<()>;
    fn check(&self, _config: &Config) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(serde::Deserialize, Debug, Clone, strum_macros::Display, serde::Serialize)]
#[serde(tag = "mode")]
#[enum_dispatch]
pub enum Task {
    #[serde(alias = "psi")]
    Psi(psi::Task),
    #[serde(alias = "merge")]
    Merge(merge::Task),
    #[serde(alias = "classify")]
    Classify(classify::Task),
    #[serde(alias = "filter")]
    Filter(filter::Task),
    #[serde(alias = "utrons")]
    Utrons(utrons::Task),
    #[serde(alias = "layout")]
    Layout(layout::Task),
    #[serde(alias = "saturation")]
    Saturation(saturation::Task),
    #[serde(alias = "summarize")]
    Summarize(summarize::Task),
    #[serde(alias = "tables-to-parquet")]
    #[serde(alias = "tables_to_parquet")]
    TablesToParquet(parquet::Task),
    #[serde(alias = "extract-quant")]
    #[serde(alias = "extract_quant")]
    ExtractQuant(extract::Task),
}
