use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Lines starting with this token describe the training label, not a feature.
const LABEL_PREFIX: &str = "label";
const COMMENT_PREFIX: &str = "#";

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema from {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Ordered feature-column names expected by the served model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<String>,
}

impl Schema {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let io_err = |source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let schema = Self::parse(BufReader::new(file)).map_err(io_err)?;
        debug!(path = %path.display(), columns = schema.len(), "loaded schema");
        Ok(schema)
    }

    pub fn parse<R: BufRead>(reader: R) -> io::Result<Self> {
        let lines = reader.lines().collect::<io::Result<Vec<_>>>()?;
        Ok(Self::from_lines(lines))
    }

    /// Takes the first whitespace-delimited token of each line, skipping
    /// blank lines, comments and the label line.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let columns = lines
            .into_iter()
            .filter_map(|line| {
                let line = line.as_ref();
                if line.starts_with(COMMENT_PREFIX) || line.starts_with(LABEL_PREFIX) {
                    return None;
                }
                line.split_whitespace().next().map(str::to_owned)
            })
            .inspect(|name| {
                if !seen.insert(name.clone()) {
                    warn!(column = %name, "duplicate schema column");
                }
            })
            .collect();
        Self { columns }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.columns.join(", "))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_lines() {
        let schema = Schema::from_lines(["# comment", "label weight", "age int", "city string"]);
        assert_eq!(schema.columns(), &["age", "city"]);
    }

    #[test]
    fn test_skips_blank_lines_and_extra_whitespace() {
        let input = "age   int 10\n\n   \n\tcity\tstring\nlabels_are_skipped_too\n";
        let schema = Schema::parse(input.as_bytes()).unwrap();
        assert_eq!(schema.columns(), &["age", "city"]);
        assert_eq!(schema.to_string(), "[age, city]");
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# features").unwrap();
        writeln!(file, "user_id string").unwrap();
        writeln!(file, "item_id string").unwrap();
        writeln!(file, "label float").unwrap();

        let schema = Schema::load(file.path()).unwrap();
        assert_eq!(schema.iter().collect::<Vec<_>>(), vec!["user_id", "item_id"]);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.conf");
        let err = Schema::load(&path).unwrap_err();
        let SchemaError::Io { path: err_path, source } = err;
        assert_eq!(err_path, path);
        assert_eq!(source.kind(), io::ErrorKind::NotFound);
    }
}
