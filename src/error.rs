use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SfError {
    #[error("invalid content address: {0:?}")]
    InvalidAddress(String),

    #[error("unknown sorter {0} (known sorters: {known})", known = crate::domain::SorterName::known_names().join(", "))]
    UnknownSorter(String),

    #[error("{0}")]
    UnknownStudySet(String),

    #[error("required file does not exist: {0}")]
    MissingFile(PathBuf),

    #[error("refusing to overwrite existing output file {0}")]
    #[diagnostic(help("choose a different --outfile or move the existing file away"))]
    OutputExists(PathBuf),

    #[error("conflicting options: {0}")]
    ConflictingFlags(String),

    #[error("failed to parse study-set manifest: {0}")]
    ManifestParse(String),

    #[error("failed to parse sorter spec file: {0}")]
    SpecParse(String),

    #[error("invalid sample rate: {0}")]
    SampleRate(String),

    #[error("object not found in store: {0}")]
    ObjectNotFound(String),

    #[error("stored object {address} is not valid JSON: {message}")]
    ObjectDecode { address: String, message: String },

    #[error("gateway request failed: {0}")]
    GatewayHttp(String),

    #[error("gateway returned status {status}: {message}")]
    GatewayStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("sorter {sorter} failed: {message}")]
    SorterFailed { sorter: String, message: String },

    #[error("sorter {sorter} timed out after {seconds}s")]
    SorterTimeout { sorter: String, seconds: u64 },

    #[error("job handler error: {0}")]
    JobHandler(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("recording not found: {0}")]
    RecordingNotFound(String),

    #[error("sorting output not found: {0}")]
    SortingOutputNotFound(String),

    #[error("inconsistent output record for {0}: errored and sortingOutput disagree")]
    InconsistentRecord(String),
}

impl SfError {
    /// Fatal pre-flight errors: the run stops before any job is submitted.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SfError::InvalidAddress(_)
                | SfError::UnknownSorter(_)
                | SfError::UnknownStudySet(_)
                | SfError::MissingFile(_)
                | SfError::OutputExists(_)
                | SfError::ConflictingFlags(_)
                | SfError::ManifestParse(_)
                | SfError::SpecParse(_)
                | SfError::SampleRate(_)
        )
    }
}
