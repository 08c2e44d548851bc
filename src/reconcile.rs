use std::sync::OnceLock;

use chrono::DateTime;
use regex::Regex;
use serde_json::Value;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{ContentAddress, JobStatus};
use crate::dispatch::SortingJob;
use crate::error::SfError;
use crate::jobs::JobState;
use crate::output::OutputRecord;
use crate::runner::ConsoleLine;
use crate::store::ContentStore;

pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
pub const TIME_NOT_SPECIFIED: &str = "TIME NOT SPECIFIED";

/// Turns one terminal job into its output record. Jobs that did not finish cleanly degrade to
/// errored records with a single warning; they never abort the batch.
pub fn reconcile(
    store: &dyn ContentStore,
    job: &SortingJob,
    sink: &dyn ProgressSink,
) -> Result<OutputRecord, SfError> {
    let state = job.handle.snapshot();
    let sorting_output = match (state.status, &state.return_value) {
        (JobStatus::Finished, Some(value)) => match returned_address(value) {
            Some(address) => match store.load_file(&address) {
                Ok(_) => Some(address),
                Err(err) => {
                    warn(
                        sink,
                        job,
                        &format!("returned sorting {address} is not retrievable ({err}); treating as errored"),
                    );
                    None
                }
            },
            None => Some(store.store_json(value)?),
        },
        (JobStatus::Finished, None) => {
            warn(sink, job, "finished without a return value; treating as errored");
            None
        }
        (JobStatus::Error, _) => {
            let reason = state.error_message.as_deref().unwrap_or("unknown error");
            warn(sink, job, &format!("errored: {reason}"));
            None
        }
        (status, _) => {
            warn(
                sink,
                job,
                &format!("unexpected status {status} at reconciliation; treating as errored"),
            );
            None
        }
    };

    let console_value = serde_json::to_value(&state.console_lines)
        .map_err(|err| SfError::JobHandler(err.to_string()))?;
    let console_out_uri = store.store_json(&console_value)?;
    let (start_time, end_time) = format_times(&state);

    Ok(OutputRecord {
        recording_name: job.recording.recording_name.clone(),
        study_name: job.recording.study_name.clone(),
        sorter_name: job.sorter.sorter_name,
        sorting_parameters: job.sorter.sorting_parameters.clone(),
        console_out_uri,
        cpu_time_sec: elapsed_seconds(&state),
        errored: sorting_output.is_none(),
        start_time,
        end_time,
        sorting_output,
        recording_uri: job.recording.recording_uri.clone(),
        ground_truth_uri: job.recording.ground_truth_uri.clone(),
    })
}

pub fn reconcile_all(
    store: &dyn ContentStore,
    jobs: &[SortingJob],
    sink: &dyn ProgressSink,
) -> Result<Vec<OutputRecord>, SfError> {
    jobs.iter().map(|job| reconcile(store, job, sink)).collect()
}

/// Sorters may hand back the address of an object they stored themselves.
fn returned_address(value: &Value) -> Option<ContentAddress> {
    value
        .as_str()
        .and_then(|text| text.parse::<ContentAddress>().ok())
        .filter(|address| address.local_path().is_none())
}

/// The sink is the only channel for job warnings; the log line stays at debug.
fn warn(sink: &dyn ProgressSink, job: &SortingJob, message: &str) {
    tracing::debug!(job = %job.describe(), "{message}");
    sink.event(ProgressEvent::warning(format!("{}: {message}", job.describe())));
}

fn elapsed_seconds(state: &JobState) -> f64 {
    match (state.timestamp_started, state.timestamp_completed) {
        (Some(started), Some(completed)) if completed >= started => completed - started,
        _ => 0.0,
    }
}

fn format_times(state: &JobState) -> (String, String) {
    let start = state
        .timestamp_started
        .and_then(format_timestamp)
        .or_else(|| console_time(&state.console_lines, "BEGINNING"));
    let end = state
        .timestamp_completed
        .and_then(format_timestamp)
        .or_else(|| console_time(&state.console_lines, "COMPLETED"));
    (
        start.unwrap_or_else(|| TIME_NOT_SPECIFIED.to_string()),
        end.unwrap_or_else(|| TIME_NOT_SPECIFIED.to_string()),
    )
}

pub fn format_timestamp(seconds: f64) -> Option<String> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    let micros = (seconds * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros).map(|time| time.format(DATE_FORMAT).to_string())
}

fn console_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(BEGINNING|COMPLETED) (\S*) sort: (.*)$").expect("valid console pattern")
    })
}

/// Times announced by the sorter wrapper: first BEGINNING line, last COMPLETED line.
fn console_time(lines: &[ConsoleLine], marker: &str) -> Option<String> {
    let capture = |line: &&ConsoleLine| {
        console_pattern()
            .captures(&line.text)
            .filter(|caps| &caps[1] == marker)
            .map(|caps| caps[3].trim().to_string())
    };
    if marker == "BEGINNING" {
        lines.iter().find_map(|line| capture(&line))
    } else {
        lines.iter().rev().find_map(|line| capture(&line))
    }
}
