use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ContentAddress, SorterName};
use crate::error::SfError;
use crate::output::{OutputRecord, parse_records};
use crate::runner::ConsoleLine;
use crate::store::ContentStore;

/// Read-only view over a previously emitted sortings file.
pub struct SortingOutputCatalog<'a> {
    store: &'a dyn ContentStore,
    source: ContentAddress,
    records: Vec<OutputRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputSummary {
    pub label: String,
    pub errored: bool,
    pub cpu_time_sec: f64,
    pub start_time: String,
    pub sorting_output: Option<ContentAddress>,
}

impl From<&OutputRecord> for OutputSummary {
    fn from(record: &OutputRecord) -> Self {
        Self {
            label: record.label(),
            errored: record.errored,
            cpu_time_sec: record.cpu_time_sec,
            start_time: record.start_time.clone(),
            sorting_output: record.sorting_output.clone(),
        }
    }
}

impl<'a> SortingOutputCatalog<'a> {
    pub fn load(store: &'a dyn ContentStore, source: &ContentAddress) -> Result<Self, SfError> {
        let value = store.load_json(source)?;
        let records = parse_records(value)?;
        tracing::debug!(%source, records = records.len(), "loaded sorting outputs");
        Ok(Self {
            store,
            source: source.clone(),
            records,
        })
    }

    pub fn source(&self) -> &ContentAddress {
        &self.source
    }

    pub fn records(&self) -> &[OutputRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<OutputRecord> {
        self.records
    }

    pub fn summaries(&self) -> Vec<OutputSummary> {
        self.records.iter().map(OutputSummary::from).collect()
    }

    pub fn find(
        &self,
        study_name: &str,
        recording_name: &str,
        sorter: SorterName,
    ) -> Result<&OutputRecord, SfError> {
        self.records
            .iter()
            .find(|record| {
                record.study_name == study_name
                    && record.recording_name == recording_name
                    && record.sorter_name == sorter
            })
            .ok_or_else(|| {
                SfError::SortingOutputNotFound(format!(
                    "{study_name}/{recording_name}/{sorter} in {}",
                    self.source
                ))
            })
    }

    pub fn console_out(&self, record: &OutputRecord) -> Result<Vec<ConsoleLine>, SfError> {
        let value = self.store.load_json(&record.console_out_uri)?;
        serde_json::from_value(value).map_err(|err| SfError::ObjectDecode {
            address: record.console_out_uri.to_string(),
            message: err.to_string(),
        })
    }

    /// `None` for errored records.
    pub fn sorting_object(&self, record: &OutputRecord) -> Result<Option<Value>, SfError> {
        record
            .sorting_output
            .as_ref()
            .map(|address| self.store.load_json(address))
            .transpose()
    }
}

/// Published SpikeForest recordings index.
pub const DEFAULT_RECORDINGS_URI: &str =
    "ipfs://bafkreiantrq7v7tboepsqlvvzqytmvfqe5nrlsyy2g2ztf6xubqlxtz7ae?spikeforest-recordings.json";

/// One entry of a recordings index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SfRecording {
    #[serde(rename = "name")]
    pub recording_name: String,
    pub study_name: String,
    pub study_set_name: String,
    pub sample_rate_hz: f64,
    pub num_channels: u32,
    pub duration_sec: f64,
    pub num_true_units: u32,
    pub recording_object: Value,
    pub sorting_true_object: Value,
}

impl SfRecording {
    pub fn label(&self) -> String {
        format!(
            "{}/{}/{}",
            self.study_set_name, self.study_name, self.recording_name
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingSummary {
    pub label: String,
    pub num_channels: u32,
    pub duration_sec: f64,
    pub sample_rate_hz: f64,
    pub num_true_units: u32,
}

impl From<&SfRecording> for RecordingSummary {
    fn from(recording: &SfRecording) -> Self {
        Self {
            label: recording.label(),
            num_channels: recording.num_channels,
            duration_sec: recording.duration_sec,
            sample_rate_hz: recording.sample_rate_hz,
            num_true_units: recording.num_true_units,
        }
    }
}

#[derive(Deserialize)]
struct RecordingsIndex {
    recordings: Vec<SfRecording>,
}

/// Read-only view over a recordings index (`{"recordings": [...]}`).
#[derive(Debug)]
pub struct RecordingCatalog {
    source: ContentAddress,
    recordings: Vec<SfRecording>,
}

impl RecordingCatalog {
    pub fn load(store: &dyn ContentStore, source: &ContentAddress) -> Result<Self, SfError> {
        let value = store.load_json(source)?;
        let index: RecordingsIndex =
            serde_json::from_value(value).map_err(|err| SfError::ObjectDecode {
                address: source.to_string(),
                message: err.to_string(),
            })?;
        tracing::debug!(%source, recordings = index.recordings.len(), "loaded recordings index");
        Ok(Self {
            source: source.clone(),
            recordings: index.recordings,
        })
    }

    pub fn source(&self) -> &ContentAddress {
        &self.source
    }

    pub fn recordings(&self) -> &[SfRecording] {
        &self.recordings
    }

    pub fn summaries(&self) -> Vec<RecordingSummary> {
        self.recordings.iter().map(RecordingSummary::from).collect()
    }

    /// First recording matching study and recording name.
    pub fn find(&self, study_name: &str, recording_name: &str) -> Result<&SfRecording, SfError> {
        self.recordings
            .iter()
            .find(|recording| {
                recording.study_name == study_name && recording.recording_name == recording_name
            })
            .ok_or_else(|| {
                SfError::RecordingNotFound(format!(
                    "{study_name}/{recording_name} in {}",
                    self.source
                ))
            })
    }
}
