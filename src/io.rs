use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

pub fn open_file(filename: impl AsRef<Path>) -> Result<Box<dyn Read + Send>> {
    let fh = ex::fs::File::open(filename.as_ref())
        .context(format!("Could not open file {:?}", filename.as_ref()))?;
    let wrapped = niffler::send::get_reader(Box::new(fh))?;
    Ok(wrapped.0)
}

pub fn open_buffered(filename: impl AsRef<Path>) -> Result<Box<dyn BufRead + Send>> {
    Ok(Box::new(BufReader::new(open_file(filename)?)))
}

/// Open a writer, gzip-compressing when the path ends in .gz.
/// Parent directories are created.
pub fn open_output(filename: impl AsRef<Path>) -> Result<Box<dyn Write + Send>> {
    let filename = filename.as_ref();
    if let Some(parent) = filename.parent() {
        if !parent.as_os_str().is_empty() {
            ex::fs::create_dir_all(parent)
                .context(format!("Could not create directory {:?}", parent))?;
        }
    }
    let fh = ex::fs::File::create(filename)
        .context(format!("Could not create file {:?}", filename))?;
    let buffered = BufWriter::new(fh);
    if filename.extension().map(|e| e == "gz").unwrap_or(false) {
        Ok(niffler::send::get_writer(
            Box::new(buffered),
            niffler::send::compression::Format::Gzip,
            niffler::Level::Six,
        )?)
    } else {
        Ok(Box::new(buffered))
    }
}

/// One lazily opened writer per key, derived from a filename pattern
/// containing %s. Each file starts with the configured header line.
pub struct FilePool {
    pattern: String,
    header: String,
    writers: HashMap<String, Box<dyn Write + Send>>,
}

impl FilePool {
    pub fn new(pattern: &str, header: &str) -> Result<FilePool> {
        if !pattern.contains("%s") {
            bail!("Output pattern '{}' does not contain %s", pattern);
        }
        Ok(FilePool {
            pattern: pattern.to_string(),
            header: header.to_string(),
            writers: HashMap::new(),
        })
    }

    pub fn write(&mut self, key: &str, line: &str) -> Result<()> {
        if !self.writers.contains_key(key) {
            let filename = self.pattern.replace("%s", key);
            let mut writer = open_output(&filename)?;
            writer
                .write_all(self.header.as_bytes())
                .with_context(|| format!("Failed to write header to {}", filename))?;
            self.writers.insert(key.to_string(), writer);
        }
        self.writers
            .get_mut(key)
            .unwrap()
            .write_all(line.as_bytes())
            .with_context(|| format!("Failed to write to pooled file for '{}'", key))?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        for (key, writer) in self.writers.iter_mut() {
            writer
                .flush()
                .with_context(|| format!("Failed to flush pooled file for '{}'", key))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trip_plain_and_gz() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["plain.txt", "compressed.txt.gz"] {
            let path = dir.path().join(name);
            let mut out = open_output(&path).unwrap();
            out.write_all(b"hello\nworld\n").unwrap();
            drop(out);
            let mut content = String::new();
            open_file(&path)
                .unwrap()
                .read_to_string(&mut content)
                .unwrap();
            assert_eq!(content, "hello\nworld\n");
        }
    }

    #[test]
    fn test_file_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/out/%s.sf", dir.path().display());
        let mut pool = FilePool::new(&pattern, "Name\tTPM\n").unwrap();
        pool.write("a", "t1\t1.0\n").unwrap();
        pool.write("b", "t2\t2.0\n").unwrap();
        pool.write("a", "t3\t3.0\n").unwrap();
        pool.close().unwrap();
        let a = std::fs::read_to_string(dir.path().join("out/a.sf")).unwrap();
        assert_eq!(a, "Name\tTPM\nt1\t1.0\nt3\t3.0\n");
        let b = std::fs::read_to_string(dir.path().join("out/b.sf")).unwrap();
        assert_eq!(b, "Name\tTPM\nt2\t2.0\n");
    }

    #[test]
    fn test_pattern_without_placeholder() {
        assert!(FilePool::new("no_placeholder.sf", "h\n").is_err());
    }
}
