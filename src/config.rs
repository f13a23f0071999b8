use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::bed::BedRecord;
use crate::gtf::TranscriptSet;
use crate::io;
use crate::tasks::{Task, TaskRun};

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Config {
    pub input: Input,
    #[serde(alias = "step")]
    pub task: Task,
    pub output: Output,
}

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Input {
    /// indexed alignment file (psi)
    pub bam: Option<String>,
    /// utron junctions in BED format (psi)
    pub junctions: Option<String>,
    /// assembly GTFs, globs allowed (merge)
    pub gtfs: Option<Vec<String>>,
    /// reference geneset GTF (merge, classify, utrons, saturation)
    pub reference_gtf: Option<String>,
    /// class table produced by the classify task (filter, utrons)
    pub class_file: Option<String>,
    /// TSV/CSV tables, globs allowed (tables-to-parquet)
    pub tables: Option<Vec<String>>,
    /// parquet dataset directory (extract-quant)
    pub dataset: Option<String>,
    /// directory of per-sample assemblies (layout)
    pub assembly_dir: Option<String>,
    /// saturation layout root (saturation, summarize)
    pub saturation_dir: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Output {
    pub directory: String,
}

impl Config {
    pub fn check(&self) -> Result<()> {
        self.task.check(self)?;
        Ok(())
    }
}

impl Input {
    pub fn bam(&self) -> Result<&String> {
        self.bam.as_ref().context("No bam defined in input, but required")
    }

    pub fn junctions(&self) -> Result<Vec<BedRecord>> {
        let path = self
            .junctions
            .as_ref()
            .context("No junctions defined in input, but required")?;
        crate::bed::parse_bed(io::open_buffered(path)?)
            .with_context(|| format!("Failed to parse junction bed {}", path))
    }

    pub fn get_indexed_bam_reader(&self) -> Result<rust_htslib::bam::IndexedReader> {
        let bam = self.bam()?;
        rust_htslib::bam::IndexedReader::from_path(bam)
            .with_context(|| format!("Failed to open bam file {} (with index)", bam))
    }

    pub fn reference_gtf(&self) -> Result<&String> {
        self.reference_gtf
            .as_ref()
            .context("No reference_gtf defined in input, but required")
    }

    pub fn reference_models(&self) -> Result<TranscriptSet> {
        read_transcripts(self.reference_gtf()?)
    }

    pub fn class_file(&self) -> Result<&String> {
        self.class_file
            .as_ref()
            .context("No class_file defined in input, but required")
    }

    pub fn dataset(&self) -> Result<&String> {
        self.dataset
            .as_ref()
            .context("No dataset defined in input, but required")
    }

    pub fn assembly_dir(&self) -> Result<&String> {
        self.assembly_dir
            .as_ref()
            .context("No assembly_dir defined in input, but required")
    }

    pub fn saturation_dir(&self) -> Result<&String> {
        self.saturation_dir
            .as_ref()
            .context("No saturation_dir defined in input, but required")
    }

    pub fn resolve_gtfs(&self) -> Result<Vec<PathBuf>> {
        let patterns = self
            .gtfs
            .as_ref()
            .context("No gtfs defined in input, but required")?;
        resolve_globs(patterns)
    }

    pub fn resolve_tables(&self) -> Result<Vec<PathBuf>> {
        let patterns = self
            .tables
            .as_ref()
            .context("No tables defined in input, but required")?;
        resolve_globs(patterns)
    }
}

impl Output {
    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        Path::new(&self.directory).join(name)
    }

    pub fn ensure_dir(&self) -> Result<()> {
        ex::fs::create_dir_all(&self.directory)
            .with_context(|| format!("Failed to create output directory {}", self.directory))?;
        Ok(())
    }
}

pub fn read_transcripts(path: impl AsRef<Path>) -> Result<TranscriptSet> {
    let path = path.as_ref();
    crate::gtf::parse_gtf(io::open_buffered(path)?)
        .with_context(|| format!("Failed to parse GTF {}", path.display()))
}

/// Expand literal paths and glob patterns (* within a path segment, ** across
/// segments). Patterns that expand to nothing are an error, matching what a
/// silently empty merge would otherwise produce.
pub fn resolve_globs(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut res = Vec::new();
    for pattern in patterns {
        if !pattern.contains('*') {
            res.push(PathBuf::from(pattern));
            continue;
        }
        let matcher = glob_to_regex(pattern)?;
        let walk_root: PathBuf = {
            let prefix: PathBuf = Path::new(pattern)
                .components()
                .take_while(|c| !c.as_os_str().to_string_lossy().contains('*'))
                .collect();
            if prefix.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                prefix
            }
        };
        let mut hits = Vec::new();
        walk_files(&walk_root, &mut |path| {
            if matcher.is_match(&path.to_string_lossy()) {
                hits.push(path.to_path_buf());
            }
        })
        .with_context(|| format!("Failed to expand pattern {}", pattern))?;
        if hits.is_empty() {
            bail!("Pattern '{}' matched no files", pattern);
        }
        hits.sort();
        res.extend(hits);
    }
    Ok(res)
}

fn glob_to_regex(pattern: &str) -> Result<regex::Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*", "\u{1}")
        .replace(r"\*", "[^/]*")
        .replace('\u{1}', ".*");
    regex::Regex::new(&format!("^{}$", escaped))
        .with_context(|| format!("Pattern '{}' is not a valid glob", pattern))
}

pub(crate) fn walk_files(dir: &Path, cb: &mut impl FnMut(&Path)) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            walk_files(&path, cb)?;
        } else {
            cb(&path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resolve_globs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("a/n1")).unwrap();
        std::fs::create_dir_all(root.join("a/n2")).unwrap();
        std::fs::write(root.join("a/n1/x.gtf.gz"), b"").unwrap();
        std::fs::write(root.join("a/n2/y.gtf.gz"), b"").unwrap();
        std::fs::write(root.join("a/n2/z.txt"), b"").unwrap();

        let pattern = format!("{}/a/*/*.gtf.gz", root.display());
        let hits = resolve_globs(&[pattern]).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].ends_with("a/n1/x.gtf.gz"));
        assert!(hits[1].ends_with("a/n2/y.gtf.gz"));

        // literal paths pass through untouched
        let literal = vec!["does/not/exist.gtf".to_string()];
        assert_eq!(resolve_globs(&literal).unwrap().len(), 1);

        let miss = format!("{}/a/*/*.bam", root.display());
        assert!(resolve_globs(&[miss]).is_err());
    }

    #[test]
    fn test_double_star_crosses_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("x/y/z")).unwrap();
        std::fs::write(root.join("x/y/z/deep.gtf"), b"").unwrap();
        let pattern = format!("{}/**/*.gtf", root.display());
        let hits = resolve_globs(&[pattern]).unwrap();
        assert_eq!(hits.len(), 1);
    }
}
