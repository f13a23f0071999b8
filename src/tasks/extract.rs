use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use arrow2::array::{Array, Float32Array, Float64Array, Int32Array, Int64Array, Utf8Array};
use arrow2::datatypes::DataType;
use arrow2::io::parquet::read;
use log::debug;
use serde::{Deserialize, Serialize};

use super::TaskRun;
use crate::config::{Config, Input, Output, walk_files};
use crate::io::FilePool;

fn default_columns() -> Vec<String> {
    ["Name", "Length", "EffectiveLength", "TPM", "NumReads"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_track_column() -> String {
    "track".to_string()
}

fn default_pattern() -> String {
    "%s.sf".to_string()
}

/// Pull per-sample quantification tables back out of the parquet dataset,
/// one .sf file per track.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Task {
    /// output filename pattern, %s becomes the track
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// dataset sub-directory holding the table, when there is one
    pub table: Option<String>,
    #[serde(default = "default_columns")]
    pub columns: Vec<String>,
    #[serde(default = "default_track_column")]
    pub track_column: String,
}

fn cell_to_string(array: &dyn Array, row: usize) -> Result<String> {
    Ok(match array.data_type() {
        DataType::Utf8 => array
            .as_any()
            .downcast_ref::<Utf8Array<i32>>()
            .unwrap()
            .value(row)
            .to_string(),
        DataType::LargeUtf8 => array
            .as_any()
            .downcast_ref::<Utf8Array<i64>>()
            .unwrap()
            .value(row)
            .to_string(),
        DataType::Int64 => array
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .value(row)
            .to_string(),
        DataType::Int32 => array
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap()
            .value(row)
            .to_string(),
        DataType::Float64 => array
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap()
            .value(row)
            .to_string(),
        DataType::Float32 => array
            .as_any()
            .downcast_ref::<Float32Array>()
            .unwrap()
            .value(row)
            .to_string(),
        other => bail!("Unsupported parquet column type {:?}", other),
    })
}

fn parquet_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    walk_files(dir, &mut |path| {
        if path.extension().map(|e| e == "parquet").unwrap_or(false) {
            files.push(path.to_path_buf());
        }
    })?;
    files.sort();
    Ok(files)
}

impl Task {
    fn extract_file(&self, path: &Path, pool: &mut FilePool, current: &mut String) -> Result<()> {
        let mut reader = std::fs::File::open(path)
            .with_context(|| format!("Could not open parquet file {}", path.display()))?;
        let metadata = read::read_metadata(&mut reader)
            .with_context(|| format!("Failed to read parquet metadata of {}", path.display()))?;
        let schema = read::infer_schema(&metadata)?;

        let column_index = |name: &str| -> Result<usize> {
            schema
                .fields
                .iter()
                .position(|field| field.name == name)
                .with_context(|| {
                    format!("No '{}' column in {}", name, path.display())
                })
        };
        let track_idx = column_index(&self.track_column)?;
        let wanted: Vec<usize> = self
            .columns
            .iter()
            .map(|name| column_index(name))
            .collect::<Result<_>>()?;

        let chunks =
            read::FileReader::new(reader, metadata.row_groups, schema, None, None, None);
        for maybe_chunk in chunks {
            let chunk = maybe_chunk
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let arrays = chunk.columns();
            for row in 0..chunk.len() {
                let track = cell_to_string(arrays[track_idx].as_ref(), row)?;
                if track != *current {
                    debug!("{}", track);
                    *current = track.clone();
                }
                let cells: Vec<String> = wanted
                    .iter()
                    .map(|idx| cell_to_string(arrays[*idx].as_ref(), row))
                    .collect::<Result<_>>()?;
                pool.write(&track, &format!("{}\n", cells.join("\t")))?;
            }
        }
        Ok(())
    }
}

impl TaskRun for Task {
    fn run(&self, input: &Input, output: &Output) -> Result<()> {
        let mut dataset = PathBuf::from(input.dataset()?);
        if let Some(table) = &self.table {
            dataset = dataset.join(table);
        }
        let files = parquet_files(&dataset)?;
        if files.is_empty() {
            bail!("No parquet files under {}", dataset.display());
        }
        let pattern = output
            .path(&self.pattern)
            .to_string_lossy()
            .to_string();
        let mut pool = FilePool::new(&pattern, &format!("{}\n", self.columns.join("\t")))?;
        let mut current = String::new();
        for path in files {
            self.extract_file(&path, &mut pool, &mut current)?;
        }
        pool.close()
    }

    fn check(&self, config: &Config) -> Result<()> {
        if config.input.dataset.is_none() {
            bail!("extract-quant requires input.dataset");
        }
        if !self.pattern.contains("%s") {
            bail!("pattern must contain %s");
        }
        if self.columns.is_empty() {
            bail!("at least one column is required");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tasks::TaskRun;
    use std::collections::HashMap;

    const QUANT_HEADER: &str = "Name\tLength\tEffectiveLength\tTPM\tNumReads\n";

    #[test]
    fn test_quant_round_trip_through_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let quant_dir = dir.path().join("quant");
        std::fs::create_dir_all(&quant_dir).unwrap();
        std::fs::write(
            quant_dir.join("sampleA.quant.sf"),
            format!("{}ENST1\t1000\t850.5\t12.25\t100\nENST2\t500\t350.5\t0.5\t7\n", QUANT_HEADER),
        )
        .unwrap();
        std::fs::write(
            quant_dir.join("sampleB.quant.sf"),
            format!("{}ENST1\t1000\t850.5\t3.5\t30\n", QUANT_HEADER),
        )
        .unwrap();

        let dataset_dir = dir.path().join("dataset");
        let convert = crate::tasks::parquet::Task {
            regex_filename: Some(r".*/(.+)\.quant\.sf$".to_string()),
            key_columns: vec!["track".to_string()],
            partition: true,
            separator: "\t".to_string(),
            header: true,
            col_names: None,
            dtypes: HashMap::new(),
        };
        let convert_input = crate::config::Input {
            tables: Some(vec![format!("{}/*.quant.sf", quant_dir.display())]),
            ..Default::default()
        };
        let convert_output = crate::config::Output {
            directory: dataset_dir.to_string_lossy().to_string(),
        };
        convert.run(&convert_input, &convert_output).unwrap();
        assert!(dataset_dir.join("track=sampleA/part-0.parquet").exists());

        let extract = Task {
            pattern: "sf/%s.sf".to_string(),
            table: None,
            columns: default_columns(),
            track_column: "track".to_string(),
        };
        let extract_input = crate::config::Input {
            dataset: Some(dataset_dir.to_string_lossy().to_string()),
            ..Default::default()
        };
        let extract_output = crate::config::Output {
            directory: dir.path().join("out").to_string_lossy().to_string(),
        };
        extract.run(&extract_input, &extract_output).unwrap();

        let sample_a =
            std::fs::read_to_string(dir.path().join("out/sf/sampleA.sf")).unwrap();
        let mut lines = sample_a.lines();
        assert_eq!(lines.next(), Some("Name\tLength\tEffectiveLength\tTPM\tNumReads"));
        let first: Vec<&str> = lines.next().unwrap().split('\t').collect();
        assert_eq!(first[0], "ENST1");
        assert_eq!(first[1], "1000");
        assert_eq!(first[2], "850.5");
        assert_eq!(sample_a.lines().count(), 3);
        let sample_b =
            std::fs::read_to_string(dir.path().join("out/sf/sampleB.sf")).unwrap();
        assert_eq!(sample_b.lines().count(), 2);
    }
}
