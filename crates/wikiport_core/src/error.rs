use std::path::PathBuf;

/// Fatal conditions of an export run. Everything else is either recovered
/// locally (undecodable bytes) or reported as a skip.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    #[error("archive entry is not a regular file: {0}")]
    NotRegularFile(String),

    #[error("failed to read archive entry {path}")]
    UnreadableEntry {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown legacy encoding label: {0}")]
    UnknownEncoding(String),
}
