use serde_json::Value;

use crate::error::SfError;
use crate::jobs::{JobHandle, JobHandler, JobRequest};
use crate::manifest::RecordingRecord;
use crate::sorter_spec::{SorterRecord, SortingMatrix};
use crate::store::ContentStore;

/// One (sorter, recording) pair and the job computing it.
#[derive(Debug, Clone)]
pub struct SortingJob {
    pub recording: RecordingRecord,
    pub sorter: SorterRecord,
    pub handle: JobHandle,
}

impl SortingJob {
    pub fn describe(&self) -> String {
        format!(
            "{}/{}/{}",
            self.sorter.sorter_name, self.recording.study_name, self.recording.recording_name
        )
    }
}

pub fn build_request(sorter: &SorterRecord, recording_object: Value) -> JobRequest {
    JobRequest {
        sorter: sorter.sorter_name,
        parameters: sorter.sorting_parameters.clone(),
        recording_object,
        command: sorter.command.clone(),
    }
}

/// Resolves the recording's data reference and queues one sorting. Never blocks on the job.
pub fn dispatch(
    store: &dyn ContentStore,
    handler: &dyn JobHandler,
    sorter: &SorterRecord,
    recording: &RecordingRecord,
) -> Result<JobHandle, SfError> {
    let recording_object = store.load_json(&recording.recording_uri)?;
    Ok(handler.submit(build_request(sorter, recording_object)))
}

/// Fans out every pair of the matrix, in matrix order, stopping after `limit` jobs when set.
/// A recording that cannot be resolved becomes an errored job instead of aborting the run.
pub fn dispatch_all(
    store: &dyn ContentStore,
    handler: &dyn JobHandler,
    matrix: &SortingMatrix,
    limit: Option<usize>,
) -> Vec<SortingJob> {
    let total = matrix.job_count();
    let cap = limit.unwrap_or(total).min(total);
    if cap < total {
        tracing::info!(cap, total, "test mode: dispatching a subset of sortings");
    }

    let mut jobs = Vec::with_capacity(cap);
    'outer: for entry in &matrix.entries {
        tracing::info!(sorter = %entry.sorter.sorter_name, recordings = entry.recordings.len(), "queueing sorts");
        for recording in &entry.recordings {
            if jobs.len() >= cap {
                break 'outer;
            }
            let handle = match dispatch(store, handler, &entry.sorter, recording) {
                Ok(handle) => handle,
                Err(err) => {
                    // Surfaces as the job's reconciliation warning.
                    tracing::debug!(
                        sorter = %entry.sorter.sorter_name,
                        recording = %recording.recording_name,
                        error = %err,
                        "could not dispatch sorting"
                    );
                    JobHandle::failed(err.to_string())
                }
            };
            jobs.push(SortingJob {
                recording: recording.clone(),
                sorter: entry.sorter.clone(),
                handle,
            });
        }
    }
    jobs
}
