use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("malformed catalog element <{element}>: {message}")]
    CatalogFormat { element: String, message: String },

    #[error("unable to access archive {}: {message}", path.display())]
    ArchiveAccess { path: PathBuf, message: String },

    #[error("unable to prepare target folder {}: {source}", path.display())]
    TargetSetup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn catalog(element: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::CatalogFormat {
            element: element.into(),
            message: message.into(),
        }
    }

    pub(crate) fn archive(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        EngineError::ArchiveAccess {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
