use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Unsupported hook language: {0}")]
    UnsupportedLanguage(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Path {path} escapes output directory {root}")]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
