use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use arrow2::array::{Array, PrimitiveArray, Utf8Array};
use arrow2::chunk::Chunk;
use arrow2::datatypes::{DataType, Field, Schema};
use arrow2::io::parquet::write::{
    CompressionOptions, Encoding, FileWriter, RowGroupIterator, Version, WriteOptions,
};
use log::debug;
use serde::{Deserialize, Serialize};

use super::TaskRun;
use crate::config::{Config, Input, Output};
use crate::io;

fn default_key_columns() -> Vec<String> {
    vec!["track".to_string()]
}

fn default_separator() -> String {
    "\t".to_string()
}

fn default_header() -> bool {
    true
}

/// Convert TSV/CSV tables into a parquet dataset with a shared schema,
/// key columns recording each row's file of origin.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Task {
    /// pattern applied to the filename, capture groups become the key
    /// column values
    pub regex_filename: Option<String>,
    #[serde(default = "default_key_columns")]
    pub key_columns: Vec<String>,
    /// partition the dataset into key=value directories
    #[serde(default)]
    pub partition: bool,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_header")]
    pub header: bool,
    /// replaces the header line (header = true) or names headerless
    /// columns (header = false)
    pub col_names: Option<Vec<String>>,
    /// explicit column types when guessing fails: int, float or str
    #[serde(default)]
    pub dtypes: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Int,
    Float,
    Str,
}

impl ColumnType {
    fn from_config(name: &str) -> Result<ColumnType> {
        match name {
            "int" => Ok(ColumnType::Int),
            "float" => Ok(ColumnType::Float),
            "str" => Ok(ColumnType::Str),
            other => bail!("Unknown dtype '{}', use int, float or str", other),
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            ColumnType::Int => DataType::Int64,
            ColumnType::Float => DataType::Float64,
            ColumnType::Str => DataType::Utf8,
        }
    }
}

fn infer_column_type(values: impl Iterator<Item = impl AsRef<str>> + Clone) -> ColumnType {
    if values
        .clone()
        .all(|v| v.as_ref().parse::<i64>().is_ok())
    {
        ColumnType::Int
    } else if values.clone().all(|v| v.as_ref().parse::<f64>().is_ok()) {
        ColumnType::Float
    } else {
        ColumnType::Str
    }
}

struct ParsedTable {
    names: Vec<String>,
    types: Vec<ColumnType>,
    /// row-major string cells, converted at write time
    rows: Vec<csv::StringRecord>,
}

impl Task {
    fn read_table(&self, path: &Path) -> Result<ParsedTable> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.separator.as_bytes()[0])
            .has_headers(self.header)
            .comment(Some(b'#'))
            .from_reader(io::open_file(path)?);

        let names: Vec<String> = match (&self.col_names, self.header) {
            (Some(names), _) => names.clone(),
            (None, true) => reader.headers()?.iter().map(|h| h.to_string()).collect(),
            (None, false) => bail!("Headerless input needs col_names"),
        };

        let mut rows = Vec::new();
        for record in reader.records() {
            let record =
                record.with_context(|| format!("Failed to read {}", path.display()))?;
            if record.len() != names.len() {
                bail!(
                    "{}: row with {} fields, expected {}",
                    path.display(),
                    record.len(),
                    names.len()
                );
            }
            rows.push(record);
        }

        let mut types = Vec::with_capacity(names.len());
        for (ii, name) in names.iter().enumerate() {
            let column_type = match self.dtypes.get(name) {
                Some(dtype) => ColumnType::from_config(dtype)?,
                None => infer_column_type(rows.iter().map(|row| &row[ii])),
            };
            types.push(column_type);
        }
        Ok(ParsedTable { names, types, rows })
    }

    fn keys_for(&self, path: &Path) -> Result<Vec<String>> {
        let filename = path.to_string_lossy();
        match &self.regex_filename {
            Some(pattern) => {
                let regex = regex::Regex::new(pattern)
                    .with_context(|| format!("Invalid regex_filename '{}'", pattern))?;
                let captures = regex.captures(&filename).with_context(|| {
                    format!("regex_filename did not match '{}'", filename)
                })?;
                let keys: Vec<String> = (1..captures.len())
                    .map(|g| captures[g].to_string())
                    .collect();
                if keys.len() != self.key_columns.len() {
                    bail!(
                        "regex_filename yields {} captures but there are {} key columns",
                        keys.len(),
                        self.key_columns.len()
                    );
                }
                Ok(keys)
            }
            None => {
                if self.key_columns.len() != 1 {
                    bail!("More than one key column needs a regex_filename");
                }
                Ok(vec![filename.to_string()])
            }
        }
    }

    fn build_arrays(
        &self,
        table: &ParsedTable,
        path: &Path,
        keys: &[String],
    ) -> Result<(Schema, Chunk<Box<dyn Array>>)> {
        let mut fields: Vec<Field> = Vec::new();
        let mut arrays: Vec<Box<dyn Array>> = Vec::new();
        for (ii, (name, column_type)) in
            table.names.iter().zip(table.types.iter()).enumerate()
        {
            fields.push(Field::new(name, column_type.data_type(), false));
            let array: Box<dyn Array> = match column_type {
                ColumnType::Int => {
                    let mut values = Vec::with_capacity(table.rows.len());
                    for row in table.rows.iter() {
                        values.push(row[ii].parse::<i64>().with_context(|| {
                            format!(
                                "{}: column {} value '{}' is not an int",
                                path.display(),
                                name,
                                &row[ii]
                            )
                        })?);
                    }
                    PrimitiveArray::from_vec(values).boxed()
                }
                ColumnType::Float => {
                    let mut values = Vec::with_capacity(table.rows.len());
                    for row in table.rows.iter() {
                        values.push(row[ii].parse::<f64>().with_context(|| {
                            format!(
                                "{}: column {} value '{}' is not a float",
                                path.display(),
                                name,
                                &row[ii]
                            )
                        })?);
                    }
                    PrimitiveArray::from_vec(values).boxed()
                }
                ColumnType::Str => Utf8Array::<i32>::from_iter_values(
                    table.rows.iter().map(|row| &row[ii]),
                )
                .boxed(),
            };
            arrays.push(array);
        }
        for (name, value) in self.key_columns.iter().zip(keys.iter()) {
            fields.push(Field::new(name, DataType::Utf8, false));
            arrays.push(
                Utf8Array::<i32>::from_iter_values(
                    std::iter::repeat(value.as_str()).take(table.rows.len()),
                )
                .boxed(),
            );
        }
        Ok((Schema::from(fields), Chunk::new(arrays)))
    }

    fn target_path(&self, output: &Output, keys: &[String], index: usize) -> PathBuf {
        let mut dir = PathBuf::from(&output.directory);
        if self.partition {
            for (name, value) in self.key_columns.iter().zip(keys.iter()) {
                dir = dir.join(format!("{}={}", name, value));
            }
        }
        dir.join(format!("part-{}.parquet", index))
    }
}

fn write_parquet(path: &Path, schema: Schema, chunk: Chunk<Box<dyn Array>>) -> Result<()> {
    if let Some(parent) = path.parent() {
        ex::fs::create_dir_all(parent)?;
    }
    let options = WriteOptions {
        write_statistics: true,
        compression: CompressionOptions::Snappy,
        version: Version::V2,
        data_pagesize_limit: None,
    };
    let encodings = vec![vec![Encoding::Plain]; schema.fields.len()];
    let file = ex::fs::File::create(path)?;
    let mut writer = FileWriter::try_new(file, schema.clone(), options)?;
    let row_groups = RowGroupIterator::try_new(
        vec![Ok(chunk)].into_iter(),
        &schema,
        options,
        encodings,
    )?;
    for group in row_groups {
        writer.write(group?)?;
    }
    writer.end(None)?;
    Ok(())
}

impl TaskRun for Task {
    fn run(&self, input: &Input, output: &Output) -> Result<()> {
        let tables = input.resolve_tables()?;
        output.ensure_dir()?;
        let mut canonical: Option<(Vec<String>, Vec<ColumnType>)> = None;
        for (index, path) in tables.iter().enumerate() {
            debug!("importing file {}", path.display());
            let table = self.read_table(path)?;
            match &canonical {
                None => canonical = Some((table.names.clone(), table.types.clone())),
                Some((names, types)) => {
                    if *names != table.names {
                        bail!(
                            "{}: columns {:?} disagree with the dataset schema {:?}",
                            path.display(),
                            table.names,
                            names
                        );
                    }
                    if *types != table.types {
                        bail!(
                            "{}: column types disagree with the dataset schema",
                            path.display()
                        );
                    }
                }
            }
            let keys = self.keys_for(path)?;
            let (schema, chunk) = self.build_arrays(&table, path, &keys)?;
            write_parquet(&self.target_path(output, &keys, index), schema, chunk)?;
        }
        Ok(())
    }

    fn check(&self, config: &Config) -> Result<()> {
        if config.input.tables.is_none() {
            bail!("tables-to-parquet requires input.tables");
        }
        if self.separator.len() != 1 {
            bail!("separator must be a single byte");
        }
        if self.key_columns.is_empty() {
            bail!("at least one key column is required");
        }
        for dtype in self.dtypes.values() {
            ColumnType::from_config(dtype)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_infer_column_type() {
        assert_eq!(
            infer_column_type(["1", "2", "-3"].iter()),
            ColumnType::Int
        );
        assert_eq!(
            infer_column_type(["1.5", "2", "3"].iter()),
            ColumnType::Float
        );
        assert_eq!(
            infer_column_type(["1", "x", "3"].iter()),
            ColumnType::Str
        );
    }

    #[test]
    fn test_keys_from_regex() {
        let task = Task {
            regex_filename: Some(r".*/(.+)\.quant\.sf".to_string()),
            key_columns: vec!["track".to_string()],
            partition: false,
            separator: "\t".to_string(),
            header: true,
            col_names: None,
            dtypes: HashMap::new(),
        };
        let keys = task.keys_for(Path::new("quant/sampleA.quant.sf")).unwrap();
        assert_eq!(keys, vec!["sampleA"]);
        assert!(task.keys_for(Path::new("quant/other.txt")).is_err());
    }

    #[test]
    fn test_partitioned_target_path() {
        let task = Task {
            regex_filename: None,
            key_columns: vec!["track".to_string()],
            partition: true,
            separator: "\t".to_string(),
            header: true,
            col_names: None,
            dtypes: HashMap::new(),
        };
        let output = Output {
            directory: "dataset".to_string(),
        };
        assert_eq!(
            task.target_path(&output, &["sampleA".to_string()], 3),
            PathBuf::from("dataset/track=sampleA/part-3.parquet")
        );
    }
}
