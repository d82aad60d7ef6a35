use crate::app::error::QueryFileError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Named `.sql` files in a single directory.
pub struct QueryLibrary {
    dir: PathBuf,
}

impl QueryLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a named query, with `.sql` appended when missing.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let file_name = if name.ends_with(".sql") {
            name.to_string()
        } else {
            format!("{name}.sql")
        };
        let path = self.dir.join(file_name);
        path.is_file().then_some(path)
    }

    /// Loads a query by name from the library, or else as a plain file path.
    pub fn load(&self, name_or_path: &str) -> Result<String, QueryFileError> {
        let path = match self.resolve(name_or_path) {
            Some(path) => path,
            None => {
                let direct = PathBuf::from(name_or_path);
                if !direct.is_file() {
                    return Err(QueryFileError::NotFound {
                        name: name_or_path.to_string(),
                    });
                }
                direct
            }
        };

        info!(path = %path.display(), "loading query");
        let sql = fs::read_to_string(&path).map_err(|source| QueryFileError::Io {
            path: path.clone(),
            source,
        })?;
        let sql = sql.trim();
        if sql.is_empty() {
            warn!(path = %path.display(), "query file is empty");
            return Err(QueryFileError::Empty { path });
        }
        Ok(sql.to_string())
    }

    /// Sorted file names of the `.sql` files in the library directory.
    pub fn list(&self) -> Result<Vec<String>, QueryFileError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(QueryFileError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "sql"))
            .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}
