use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::check_output_target;
use crate::domain::{ContentAddress, SorterName};
use crate::error::SfError;

/// Durable result of one (recording, sorter) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    pub recording_name: String,
    pub study_name: String,
    pub sorter_name: SorterName,
    pub sorting_parameters: Value,
    pub console_out_uri: ContentAddress,
    pub cpu_time_sec: f64,
    pub errored: bool,
    pub start_time: String,
    pub end_time: String,
    pub sorting_output: Option<ContentAddress>,
    pub recording_uri: ContentAddress,
    pub ground_truth_uri: ContentAddress,
}

impl OutputRecord {
    pub fn label(&self) -> String {
        format!(
            "{}/{}/{}",
            self.study_name, self.recording_name, self.sorter_name
        )
    }

    /// `errored` holds exactly when there is no sorting output.
    pub fn check_consistent(&self) -> Result<(), SfError> {
        if self.errored == self.sorting_output.is_none() {
            Ok(())
        } else {
            Err(SfError::InconsistentRecord(self.label()))
        }
    }
}

/// Writes the records as a JSON array to `destination`, or stdout when none is given.
/// An existing destination is never touched.
pub fn emit_records(records: &[OutputRecord], destination: Option<&Path>) -> Result<(), SfError> {
    let json = serde_json::to_string_pretty(records)
        .map_err(|err| SfError::Filesystem(err.to_string()))?;

    let Some(path) = destination.filter(|path| !path.as_os_str().is_empty()) else {
        let mut stdout = io::stdout();
        return write_all(&mut stdout, &json);
    };

    check_output_target(path)?;
    let mut options = OpenOptions::new();
    if path == Path::new("/dev/null") {
        options.write(true);
    } else {
        options.write(true).create_new(true);
    }
    let mut file = options.open(path).map_err(|err| {
        if err.kind() == io::ErrorKind::AlreadyExists {
            SfError::OutputExists(path.to_path_buf())
        } else {
            SfError::Filesystem(format!("open {}: {err}", path.display()))
        }
    })?;
    write_all(&mut file, &json)?;
    tracing::info!(path = %path.display(), records = records.len(), "wrote output records");
    Ok(())
}

fn write_all(writer: &mut dyn Write, json: &str) -> Result<(), SfError> {
    let write = |writer: &mut dyn Write| -> io::Result<()> {
        writer.write_all(json.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    };
    write(writer).map_err(|err| SfError::Filesystem(err.to_string()))
}

/// Reads records back from a JSON array, either bare or wrapped as `{"sortingOutputs": [...]}`.
pub fn parse_records(value: Value) -> Result<Vec<OutputRecord>, SfError> {
    let array = match value {
        Value::Object(mut map) => map.remove("sortingOutputs").ok_or_else(|| {
            SfError::ManifestParse("expected an array of sorting outputs".to_string())
        })?,
        other => other,
    };
    let records: Vec<OutputRecord> =
        serde_json::from_value(array).map_err(|err| SfError::ManifestParse(err.to_string()))?;
    for record in &records {
        record.check_consistent()?;
    }
    Ok(records)
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl crate::app::ProgressSink for JsonOutput {
    fn event(&self, _event: crate::app::ProgressEvent) {}
}
