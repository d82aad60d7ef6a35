use std::path::PathBuf;

use thiserror::Error;

use crate::app::db::Backend;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to connect to {backend}: {message}")]
    Connect { backend: Backend, message: String },

    #[error("{backend} statement failed: {message}")]
    Execute { backend: Backend, message: String },

    #[error("failed to read {backend} result: {message}")]
    Materialize { backend: Backend, message: String },

    #[error("{backend} configuration error: {message}")]
    Config { backend: Backend, message: String },

    #[error("{operation} is not supported by {backend}")]
    Unsupported {
        backend: Backend,
        operation: &'static str,
    },
}

impl DbError {
    pub fn execute(backend: Backend, err: impl std::fmt::Display) -> Self {
        Self::Execute {
            backend,
            message: err.to_string(),
        }
    }

    pub fn connect(backend: Backend, err: impl std::fmt::Display) -> Self {
        Self::Connect {
            backend,
            message: err.to_string(),
        }
    }

    pub fn materialize(backend: Backend, err: impl std::fmt::Display) -> Self {
        Self::Materialize {
            backend,
            message: err.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("no tables found or table listing failed")]
    NoTables,

    #[error("io error writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("format error: {0}")]
    Format(#[from] std::fmt::Error),
}

#[derive(Error, Debug)]
pub enum QueryFileError {
    #[error("query not found: {name}")]
    NotFound { name: String },

    #[error("query file is empty: {}", .path.display())]
    Empty { path: PathBuf },

    #[error("io error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
