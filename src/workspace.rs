use std::fmt;
use std::fs;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{ContentAddress, SampleRate};
use crate::error::SfError;
use crate::output::OutputRecord;
use crate::store::{ContentStore, sha1_hex, write_file_atomic};

pub const TRUE_SORT_LABEL: &str = "Ground-Truth";
pub const DEFAULT_WORKSPACE_LABEL: &str = "sortingview-default";

/// Catalog of recordings and sortings keyed by label. Entries are only ever added.
pub trait Workspace {
    fn uri(&self) -> String;
    fn recording_id(&self, label: &str) -> Option<String>;
    fn has_sorting(&self, label: &str) -> bool;
    fn add_recording(
        &mut self,
        label: &str,
        recording_uri: &ContentAddress,
    ) -> Result<String, SfError>;
    fn add_sorting(
        &mut self,
        recording_id: &str,
        label: &str,
        sorting_uri: &ContentAddress,
        sample_rate_hz: f64,
    ) -> Result<String, SfError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceUri(String);

impl WorkspaceUri {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workspace://{}", self.0)
    }
}

impl FromStr for WorkspaceUri {
    type Err = SfError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let name = value
            .trim()
            .strip_prefix("workspace://")
            .ok_or_else(|| SfError::Workspace(format!("not a workspace URI: {value}")))?;
        let is_valid = !name.is_empty()
            && name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(SfError::Workspace(format!("invalid workspace name: {value}")));
        }
        Ok(Self(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecording {
    pub recording_id: String,
    pub label: String,
    pub recording_uri: ContentAddress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSorting {
    pub sorting_id: String,
    pub recording_id: String,
    pub label: String,
    pub sorting_uri: ContentAddress,
    pub sample_rate_hz: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceData {
    pub label: String,
    #[serde(default)]
    pub recordings: Vec<WorkspaceRecording>,
    #[serde(default)]
    pub sortings: Vec<WorkspaceSorting>,
}

/// Workspace persisted as a JSON file under the store root.
#[derive(Debug)]
pub struct LocalWorkspace {
    uri: WorkspaceUri,
    path: Utf8PathBuf,
    data: WorkspaceData,
}

impl LocalWorkspace {
    pub fn path_for(root: &Utf8Path, uri: &WorkspaceUri) -> Utf8PathBuf {
        root.join("workspaces").join(format!("{}.json", uri.name()))
    }

    pub fn load(root: &Utf8Path, uri: &WorkspaceUri) -> Result<Self, SfError> {
        let path = Self::path_for(root, uri);
        if !path.as_std_path().exists() {
            return Err(SfError::Workspace(format!("requested workspace {uri} does not exist")));
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| SfError::Filesystem(err.to_string()))?;
        let data: WorkspaceData = serde_json::from_str(&content)
            .map_err(|err| SfError::Workspace(format!("corrupt workspace {uri}: {err}")))?;
        Ok(Self {
            uri: uri.clone(),
            path,
            data,
        })
    }

    pub fn create(root: &Utf8Path, label: &str) -> Result<Self, SfError> {
        let seed = format!("{label}:{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let uri = WorkspaceUri(sha1_hex(seed.as_bytes())[..16].to_string());
        let workspace = Self {
            path: Self::path_for(root, &uri),
            uri,
            data: WorkspaceData {
                label: label.to_string(),
                ..WorkspaceData::default()
            },
        };
        workspace.save()?;
        tracing::info!(uri = %workspace.uri, label, "created workspace");
        Ok(workspace)
    }

    pub fn data(&self) -> &WorkspaceData {
        &self.data
    }

    fn save(&self) -> Result<(), SfError> {
        let json = serde_json::to_vec_pretty(&self.data)
            .map_err(|err| SfError::Workspace(err.to_string()))?;
        write_file_atomic(&self.path, &json)
    }
}

impl Workspace for LocalWorkspace {
    fn uri(&self) -> String {
        self.uri.to_string()
    }

    fn recording_id(&self, label: &str) -> Option<String> {
        self.data
            .recordings
            .iter()
            .find(|recording| recording.label == label)
            .map(|recording| recording.recording_id.clone())
    }

    fn has_sorting(&self, label: &str) -> bool {
        self.data.sortings.iter().any(|sorting| sorting.label == label)
    }

    fn add_recording(
        &mut self,
        label: &str,
        recording_uri: &ContentAddress,
    ) -> Result<String, SfError> {
        if let Some(existing) = self.recording_id(label) {
            return Ok(existing);
        }
        let recording_id = format!("R-{}", &sha1_hex(label.as_bytes())[..12]);
        self.data.recordings.push(WorkspaceRecording {
            recording_id: recording_id.clone(),
            label: label.to_string(),
            recording_uri: recording_uri.clone(),
        });
        self.save()?;
        Ok(recording_id)
    }

    fn add_sorting(
        &mut self,
        recording_id: &str,
        label: &str,
        sorting_uri: &ContentAddress,
        sample_rate_hz: f64,
    ) -> Result<String, SfError> {
        if !self
            .data
            .recordings
            .iter()
            .any(|recording| recording.recording_id == recording_id)
        {
            return Err(SfError::Workspace(format!(
                "no recording with id {recording_id}"
            )));
        }
        if let Some(existing) = self.data.sortings.iter().find(|s| s.label == label) {
            return Ok(existing.sorting_id.clone());
        }
        let sorting_id = format!("S-{}", &sha1_hex(label.as_bytes())[..12]);
        self.data.sortings.push(WorkspaceSorting {
            sorting_id: sorting_id.clone(),
            recording_id: recording_id.to_string(),
            label: label.to_string(),
            sorting_uri: sorting_uri.clone(),
            sample_rate_hz,
        });
        self.save()?;
        Ok(sorting_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryLabels {
    pub recording: String,
    pub ground_truth: String,
    pub sorting: String,
}

impl EntryLabels {
    pub fn new(study_name: &str, recording_name: &str, sorter_name: &str) -> Self {
        let recording = format!("{study_name}/{recording_name}");
        Self {
            ground_truth: format!("{TRUE_SORT_LABEL}/{recording}"),
            sorting: format!("{sorter_name}/{recording}"),
            recording,
        }
    }

    pub fn for_record(record: &OutputRecord) -> Self {
        Self::new(
            &record.study_name,
            &record.recording_name,
            record.sorter_name.as_str(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Skipped {
        label: String,
        reason: String,
    },
    Published {
        labels: EntryLabels,
        recording_id: String,
        recording_added: bool,
        ground_truth_added: bool,
        sorting_added: bool,
    },
}

/// What a publish would do, without writing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishPlan {
    pub labels: EntryLabels,
    pub recording_exists: bool,
    pub ground_truth_exists: bool,
    pub sorting_exists: bool,
}

impl PublishPlan {
    pub fn describe(&self) -> Vec<String> {
        let line = |exists: bool, label: &str, what: &str| {
            if exists {
                format!("Not adding {label} as it is already in the workspace.")
            } else {
                format!("Would add {what} with label {label}")
            }
        };
        vec![
            line(self.recording_exists, &self.labels.recording, "recording"),
            line(self.ground_truth_exists, &self.labels.ground_truth, "ground truth"),
            line(self.sorting_exists, &self.labels.sorting, "sorting"),
        ]
    }
}

pub fn plan(workspace: Option<&dyn Workspace>, record: &OutputRecord) -> Option<PublishPlan> {
    if record.errored {
        return None;
    }
    let labels = EntryLabels::for_record(record);
    let (recording_exists, ground_truth_exists, sorting_exists) = match workspace {
        Some(workspace) => (
            workspace.recording_id(&labels.recording).is_some(),
            workspace.has_sorting(&labels.ground_truth),
            workspace.has_sorting(&labels.sorting),
        ),
        None => (false, false, false),
    };
    Some(PublishPlan {
        labels,
        recording_exists,
        ground_truth_exists,
        sorting_exists,
    })
}

/// Adds whatever part of the record the workspace does not hold yet.
pub fn publish(
    store: &dyn ContentStore,
    workspace: &mut dyn Workspace,
    record: &OutputRecord,
    sample_rate: SampleRate,
    sink: &dyn ProgressSink,
) -> Result<PublishOutcome, SfError> {
    record.check_consistent()?;
    let Some(sorting_uri) = &record.sorting_output else {
        tracing::debug!(record = %record.label(), "skipping errored sorting");
        return Ok(PublishOutcome::Skipped {
            label: record.label(),
            reason: "sorting errored".to_string(),
        });
    };

    let labels = EntryLabels::for_record(record);
    let recording_object = store.load_json(&record.recording_uri)?;
    let sample_rate_hz = sample_rate.resolve(&recording_object)?;

    let (recording_id, recording_added) = match workspace.recording_id(&labels.recording) {
        Some(id) => (id, false),
        None => (
            workspace.add_recording(&labels.recording, &record.recording_uri)?,
            true,
        ),
    };

    let ground_truth_added = !workspace.has_sorting(&labels.ground_truth);
    if ground_truth_added {
        workspace.add_sorting(
            &recording_id,
            &labels.ground_truth,
            &record.ground_truth_uri,
            sample_rate_hz,
        )?;
    }
    let sorting_added = !workspace.has_sorting(&labels.sorting);
    if sorting_added {
        workspace.add_sorting(&recording_id, &labels.sorting, sorting_uri, sample_rate_hz)?;
    }

    sink.event(ProgressEvent::info(format!(
        "workspace {}: {} (recording {}, ground truth {}, sorting {})",
        workspace.uri(),
        labels.recording,
        added_or_kept(recording_added),
        added_or_kept(ground_truth_added),
        added_or_kept(sorting_added),
    )));

    Ok(PublishOutcome::Published {
        labels,
        recording_id,
        recording_added,
        ground_truth_added,
        sorting_added,
    })
}

fn added_or_kept(added: bool) -> &'static str {
    if added { "added" } else { "present" }
}
