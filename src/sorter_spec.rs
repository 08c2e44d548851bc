use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::SorterName;
use crate::error::SfError;
use crate::manifest::{RecordingRecord, StudySets};

/// The YAML sorter spec file as written by hand.
#[derive(Debug, Deserialize)]
pub struct SorterSpecFile {
    #[serde(default)]
    pub studysets: Option<String>,
    #[serde(default)]
    pub studyset_names: Vec<String>,
    #[serde(default)]
    pub spike_sorters: Vec<SorterEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SorterEntry {
    pub name: String,
    #[serde(default)]
    pub params: Option<serde_yaml::Value>,
    #[serde(default)]
    pub studysets: Vec<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SorterRecord {
    pub sorter_name: SorterName,
    pub sorting_parameters: Value,
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SorterStudyMatrixEntry {
    pub sorter: SorterRecord,
    pub requested_study_sets: Vec<String>,
}

/// Sorters paired with the study-set names they should run against, in spec order.
#[derive(Debug, Clone, Default)]
pub struct SorterStudyMatrix {
    pub entries: Vec<SorterStudyMatrixEntry>,
}

#[derive(Debug, Clone)]
pub struct SortingMatrixEntry {
    pub sorter: SorterRecord,
    pub recordings: Vec<RecordingRecord>,
}

/// Sorters paired with the concrete recordings they should sort.
#[derive(Debug, Clone, Default)]
pub struct SortingMatrix {
    pub entries: Vec<SortingMatrixEntry>,
}

impl SortingMatrix {
    pub fn job_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.recordings.len()).sum()
    }
}

#[derive(Debug)]
pub struct SorterSpec {
    pub file: SorterSpecFile,
}

impl SorterSpec {
    pub fn load(path: &Path) -> Result<Self, SfError> {
        if !path.exists() {
            return Err(SfError::MissingFile(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)
            .map_err(|err| SfError::Filesystem(format!("read {}: {err}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, SfError> {
        let file: SorterSpecFile =
            serde_yaml::from_str(content).map_err(|err| SfError::SpecParse(err.to_string()))?;
        Ok(Self { file })
    }

    /// Study-set manifest locator named inside the spec file.
    pub fn study_source(&self) -> Option<&str> {
        self.file.studysets.as_deref()
    }

    pub fn resolve(&self, study_sets: &StudySets) -> Result<SorterStudyMatrix, SfError> {
        let declared = &self.file.studyset_names;
        let missing: Vec<&str> = declared
            .iter()
            .map(String::as_str)
            .filter(|name| !study_sets.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(SfError::UnknownStudySet(format!(
                "spec file references study sets not recorded in study set file: {}",
                missing.join(", ")
            )));
        }

        let mut entries = Vec::with_capacity(self.file.spike_sorters.len());
        for sorter in &self.file.spike_sorters {
            let sorter_name: SorterName = sorter.name.parse()?;
            if entries
                .iter()
                .any(|entry: &SorterStudyMatrixEntry| entry.sorter.sorter_name == sorter_name)
            {
                return Err(SfError::SpecParse(format!(
                    "sorter {sorter_name} is listed more than once"
                )));
            }
            let unknown: Vec<&str> = sorter
                .studysets
                .iter()
                .map(String::as_str)
                .filter(|name| !declared.iter().any(|known| known == name))
                .collect();
            if !unknown.is_empty() {
                return Err(SfError::UnknownStudySet(format!(
                    "sorter {sorter_name} requests unknown study sets {} (declared: {})",
                    unknown.join(", "),
                    declared.join(", ")
                )));
            }
            let sorting_parameters = match &sorter.params {
                Some(params) => serde_json::to_value(params)
                    .map_err(|err| SfError::SpecParse(err.to_string()))?,
                None => Value::Object(Default::default()),
            };
            let command = match &sorter.command {
                Some(command) if !command.is_empty() => command.clone(),
                Some(_) => {
                    return Err(SfError::SpecParse(format!(
                        "sorter {sorter_name} has an empty command"
                    )));
                }
                None => sorter_name.default_command(),
            };
            entries.push(SorterStudyMatrixEntry {
                sorter: SorterRecord {
                    sorter_name,
                    sorting_parameters,
                    command,
                },
                requested_study_sets: sorter.studysets.clone(),
            });
        }
        Ok(SorterStudyMatrix { entries })
    }
}

impl SorterStudyMatrix {
    pub fn populate(&self, study_sets: &StudySets) -> SortingMatrix {
        let entries = self
            .entries
            .iter()
            .map(|entry| SortingMatrixEntry {
                sorter: entry.sorter.clone(),
                recordings: entry
                    .requested_study_sets
                    .iter()
                    .flat_map(|name| study_sets.recordings(name))
                    .cloned()
                    .collect(),
            })
            .collect();
        SortingMatrix { entries }
    }
}
