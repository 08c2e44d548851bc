use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ContentAddress;
use crate::error::SfError;
use crate::store::ContentStore;

#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(rename = "StudySets")]
    pub study_sets: Vec<StudySetEntry>,
}

#[derive(Debug, Deserialize)]
pub struct StudySetEntry {
    pub name: String,
    #[serde(default)]
    pub studies: Vec<StudyEntry>,
}

#[derive(Debug, Deserialize)]
pub struct StudyEntry {
    pub name: String,
    #[serde(default)]
    pub recordings: Vec<RecordingEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingEntry {
    pub name: String,
    pub recording_uri: String,
    pub sorting_true_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingRecord {
    pub study_name: String,
    pub recording_name: String,
    pub recording_uri: ContentAddress,
    pub ground_truth_uri: ContentAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyRecord {
    pub study_name: String,
    pub recordings: Vec<RecordingRecord>,
}

/// Study sets in manifest order.
#[derive(Debug, Clone, Default)]
pub struct StudySets {
    sets: Vec<(String, Vec<StudyRecord>)>,
}

impl StudySets {
    pub fn get(&self, name: &str) -> Option<&[StudyRecord]> {
        self.sets
            .iter()
            .find(|(set_name, _)| set_name == name)
            .map(|(_, studies)| studies.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.sets.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn recordings(&self, name: &str) -> impl Iterator<Item = &RecordingRecord> {
        self.get(name)
            .unwrap_or_default()
            .iter()
            .flat_map(|study| study.recordings.iter())
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

pub fn load_study_sets(
    store: &dyn ContentStore,
    locator: &ContentAddress,
) -> Result<StudySets, SfError> {
    tracing::debug!(%locator, "loading study-set manifest");
    let value = store.load_json(locator)?;
    parse_study_sets(value)
}

pub fn parse_study_sets(value: Value) -> Result<StudySets, SfError> {
    let manifest: Manifest =
        serde_json::from_value(value).map_err(|err| SfError::ManifestParse(err.to_string()))?;

    let mut sets: Vec<(String, Vec<StudyRecord>)> = Vec::with_capacity(manifest.study_sets.len());
    for study_set in manifest.study_sets {
        if sets.iter().any(|(name, _)| name == &study_set.name) {
            return Err(SfError::ManifestParse(format!(
                "study set {} appears more than once",
                study_set.name
            )));
        }
        let studies = study_set
            .studies
            .into_iter()
            .map(study_record)
            .collect::<Result<Vec<_>, SfError>>()?;
        sets.push((study_set.name, studies));
    }
    Ok(StudySets { sets })
}

fn study_record(study: StudyEntry) -> Result<StudyRecord, SfError> {
    let recordings = study
        .recordings
        .into_iter()
        .map(|recording| {
            Ok(RecordingRecord {
                study_name: study.name.clone(),
                recording_name: recording.name,
                recording_uri: recording.recording_uri.parse()?,
                ground_truth_uri: recording.sorting_true_uri.parse()?,
            })
        })
        .collect::<Result<Vec<_>, SfError>>()?;
    Ok(StudyRecord {
        study_name: study.name,
        recordings,
    })
}
