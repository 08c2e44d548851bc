use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::catalog::{
    OutputSummary, RecordingCatalog, RecordingSummary, SfRecording, SortingOutputCatalog,
};
use crate::config::{RunConfig, SortingArgs, SortingInputs, WorkspaceParams, WorkspaceTarget};
use crate::dispatch::dispatch_all;
use crate::domain::{ContentAddress, SampleRate, SorterName};
use crate::error::SfError;
use crate::jobs::{JobCache, JobHandler, ParallelJobHandler};
use crate::manifest::load_study_sets;
use crate::output::OutputRecord;
use crate::reconcile::reconcile_all;
use crate::runner::{CommandRunner, ConsoleLine};
use crate::sorter_spec::SorterSpec;
use crate::store::ContentStore;
use crate::workspace::{
    DEFAULT_WORKSPACE_LABEL, LocalWorkspace, PublishOutcome, PublishPlan, Workspace, WorkspaceUri,
    plan, publish,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub level: EventLevel,
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: EventLevel::Info,
            message: message.into(),
            elapsed: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: EventLevel::Warning,
            message: message.into(),
            elapsed: None,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Human-readable progress on stderr. Warnings always print; info lines need `-v`.
#[derive(Debug, Clone, Copy)]
pub struct StderrProgress {
    verbosity: u8,
}

impl StderrProgress {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }
}

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        if event.level == EventLevel::Info && self.verbosity == 0 {
            return;
        }
        let prefix = match event.level {
            EventLevel::Info => "",
            EventLevel::Warning => "WARNING: ",
        };
        let mut stderr = std::io::stderr().lock();
        let _ = match event.elapsed {
            Some(elapsed) => writeln!(
                stderr,
                "{prefix}{} ({:.1}s)",
                event.message,
                elapsed.as_secs_f64()
            ),
            None => writeln!(stderr, "{prefix}{}", event.message),
        };
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigReport {
    pub store_root: String,
    pub forwarded_env: Vec<(String, String)>,
    pub config: RunConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub workspace_uri: Option<String>,
    pub loaded: usize,
    pub dry_run: bool,
    pub plans: Vec<PublishPlan>,
    pub outcomes: Vec<PublishOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputDetail {
    pub record: OutputRecord,
    pub console: Option<Vec<ConsoleLine>>,
    pub sorting: Option<serde_json::Value>,
}

/// Pipeline operations over one content store.
pub struct App<S: ContentStore + 'static> {
    store: Arc<S>,
    root: Utf8PathBuf,
}

impl<S: ContentStore + 'static> App<S> {
    /// `root` holds the job cache and local workspaces.
    pub fn new(store: S, root: Utf8PathBuf) -> Self {
        Self {
            store: Arc::new(store),
            root,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn check_config(&self, config: &RunConfig) -> ConfigReport {
        ConfigReport {
            store_root: self.root.to_string(),
            forwarded_env: config
                .env
                .vars()
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
            config: config.clone(),
        }
    }

    /// Worker pool backed by the external sorter programs.
    pub fn build_handler(&self, config: &RunConfig) -> ParallelJobHandler {
        let runner = CommandRunner {
            env: config.env.clone(),
            container: config.container.clone(),
            srun_prefix: config.slurm.as_ref().map(|slurm| slurm.srun_command.clone()),
            timeout: config.timeout,
            scratch_root: None,
        };
        let store: Arc<dyn ContentStore> = self.store.clone();
        let cache = config
            .job_cache
            .as_ref()
            .map(|feed| JobCache::new(feed.as_str(), store, self.root.as_std_path()));
        ParallelJobHandler::start(config.concurrency(), Arc::new(runner), cache)
    }

    /// Loads inputs, fans out every sorting, waits once, and reconciles the results.
    /// The handler is cleaned up whether or not waiting succeeds.
    pub fn run_sortings(
        &self,
        args: &SortingArgs,
        config: &RunConfig,
        handler: &dyn JobHandler,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<OutputRecord>, SfError> {
        let store = self.store.as_ref();
        let spec = SorterSpec::load(&args.sorter_spec_file)?;
        let inputs = SortingInputs::resolve(args, &spec)?;
        sink.event(ProgressEvent::info(format!(
            "loading study sets from {}",
            inputs.study_source
        )));
        let study_sets = load_study_sets(store, &inputs.study_source)?;
        let matrix = spec.resolve(&study_sets)?.populate(&study_sets);
        sink.event(ProgressEvent::info(format!(
            "{} sorting(s) across {} sorter(s)",
            matrix.job_count(),
            matrix.entries.len()
        )));

        let start = Instant::now();
        let jobs = dispatch_all(store, handler, &matrix, config.test_limit);
        sink.event(ProgressEvent::info(format!("dispatched {} job(s)", jobs.len())));

        let waited = handler.wait_all();
        handler.cleanup();
        waited?;
        sink.event(ProgressEvent::info("all jobs completed").with_elapsed(start.elapsed()));

        let records = reconcile_all(store, &jobs, sink)?;
        let errored = records.iter().filter(|record| record.errored).count();
        tracing::info!(records = records.len(), errored, "reconciled sortings");
        Ok(records)
    }

    pub fn load_records(&self, source: &ContentAddress) -> Result<Vec<OutputRecord>, SfError> {
        Ok(SortingOutputCatalog::load(self.store.as_ref(), source)?.into_records())
    }

    pub fn prepare_workspace(
        &self,
        params: &WorkspaceParams,
        sink: &dyn ProgressSink,
    ) -> Result<PrepareReport, SfError> {
        let records = self.load_records(&params.sortings_source)?;
        self.publish_records(
            &records,
            &params.target,
            params.dry_run,
            params.sample_rate,
            sink,
        )
    }

    pub fn publish_records(
        &self,
        records: &[OutputRecord],
        target: &WorkspaceTarget,
        dry_run: bool,
        sample_rate: SampleRate,
        sink: &dyn ProgressSink,
    ) -> Result<PrepareReport, SfError> {
        if dry_run {
            return self.plan_records(records, target, sink);
        }

        let mut workspace = self.open_workspace(target)?;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let outcome = match publish(
                self.store.as_ref(),
                &mut workspace,
                record,
                sample_rate,
                sink,
            ) {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::debug!(record = %record.label(), error = %err, "could not publish sorting");
                    sink.event(ProgressEvent::warning(format!(
                        "{}: not published: {err}",
                        record.label()
                    )));
                    PublishOutcome::Skipped {
                        label: record.label(),
                        reason: err.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let loaded = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, PublishOutcome::Published { .. }))
            .count();
        sink.event(ProgressEvent::info(format!(
            "Parsed {loaded} recording sets for workspace {}",
            workspace.uri()
        )));
        Ok(PrepareReport {
            workspace_uri: Some(workspace.uri()),
            loaded,
            dry_run: false,
            plans: Vec::new(),
            outcomes,
        })
    }

    fn plan_records(
        &self,
        records: &[OutputRecord],
        target: &WorkspaceTarget,
        sink: &dyn ProgressSink,
    ) -> Result<PrepareReport, SfError> {
        let workspace = match target {
            WorkspaceTarget::Existing(uri) => {
                Some(LocalWorkspace::load(&self.root, &uri.parse::<WorkspaceUri>()?)?)
            }
            WorkspaceTarget::CreateNew | WorkspaceTarget::Detached => None,
        };
        let plans: Vec<PublishPlan> = records
            .iter()
            .filter_map(|record| plan(workspace.as_ref().map(|w| w as &dyn Workspace), record))
            .collect();
        for line in plans.iter().flat_map(PublishPlan::describe) {
            sink.event(ProgressEvent::info(line));
        }
        Ok(PrepareReport {
            workspace_uri: workspace.as_ref().map(Workspace::uri),
            loaded: plans.len(),
            dry_run: true,
            plans,
            outcomes: Vec::new(),
        })
    }

    fn open_workspace(&self, target: &WorkspaceTarget) -> Result<LocalWorkspace, SfError> {
        match target {
            WorkspaceTarget::Existing(uri) => LocalWorkspace::load(&self.root, &uri.parse()?),
            WorkspaceTarget::CreateNew => LocalWorkspace::create(&self.root, DEFAULT_WORKSPACE_LABEL),
            WorkspaceTarget::Detached => Err(SfError::ConflictingFlags(
                "a workspace is required unless --dry-run is set".to_string(),
            )),
        }
    }

    pub fn list_outputs(&self, source: &ContentAddress) -> Result<Vec<OutputSummary>, SfError> {
        Ok(SortingOutputCatalog::load(self.store.as_ref(), source)?.summaries())
    }

    pub fn show_output(
        &self,
        source: &ContentAddress,
        study_name: &str,
        recording_name: &str,
        sorter: SorterName,
        with_console: bool,
    ) -> Result<OutputDetail, SfError> {
        let catalog = SortingOutputCatalog::load(self.store.as_ref(), source)?;
        let record = catalog.find(study_name, recording_name, sorter)?;
        let console = if with_console {
            Some(catalog.console_out(record)?)
        } else {
            None
        };
        Ok(OutputDetail {
            record: record.clone(),
            console,
            sorting: catalog.sorting_object(record)?,
        })
    }

    pub fn list_recordings(
        &self,
        source: &ContentAddress,
    ) -> Result<Vec<RecordingSummary>, SfError> {
        Ok(RecordingCatalog::load(self.store.as_ref(), source)?.summaries())
    }

    pub fn show_recording(
        &self,
        source: &ContentAddress,
        study_name: &str,
        recording_name: &str,
    ) -> Result<SfRecording, SfError> {
        let catalog = RecordingCatalog::load(self.store.as_ref(), source)?;
        catalog.find(study_name, recording_name).cloned()
    }
}
