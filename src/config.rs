use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::Serialize;

use crate::domain::{ContentAddress, SampleRate};
use crate::error::SfError;
use crate::sorter_spec::SorterSpec;

pub const DEFAULT_JOB_CACHE: &str = "default-job-cache";

/// Command-line options shared by every pipeline command that runs jobs.
#[derive(Args, Debug, Clone)]
pub struct StandardArgs {
    /// Increase log verbosity (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Stop after this many sortings (0 processes everything)
    #[arg(short, long, default_value_t = 0)]
    pub test: usize,

    /// Cancel any job running longer than this many minutes (0 disables)
    #[arg(short = 'T', long, default_value_t = 0)]
    pub timeout_min: u64,

    /// Write JSON output here instead of stdout; existing files are never overwritten
    #[arg(short, long)]
    pub outfile: Option<PathBuf>,

    /// Worker threads for the parallel job handler (ignored with --use-slurm)
    #[arg(short, long, default_value_t = 4)]
    pub workercount: usize,

    /// Feed name of the job cache
    #[arg(long, default_value = DEFAULT_JOB_CACHE)]
    pub job_cache: String,

    /// Disable the job cache
    #[arg(long)]
    pub no_job_cache: bool,

    /// Run sorters in containers (also enabled by HITHER_USE_CONTAINER)
    #[arg(short = 'C', long)]
    pub use_container: bool,

    /// Ignore HITHER_USE_CONTAINER
    #[arg(long)]
    pub no_container: bool,

    /// Launch sorters through srun
    #[arg(long)]
    pub use_slurm: bool,

    #[arg(long, default_value = "ccm")]
    pub slurm_partition: String,

    /// Run without --exclusive
    #[arg(long)]
    pub slurm_accept_shared_nodes: bool,

    #[arg(long, default_value_t = 6)]
    pub slurm_jobs_per_allocation: usize,

    #[arg(long, default_value_t = 5)]
    pub slurm_max_simultaneous_allocations: usize,

    #[arg(long, default_value_t = 0)]
    pub slurm_gpus_per_node: u32,

    /// Print the resolved configuration and exit
    #[arg(long)]
    pub check_config: bool,
}

impl Default for StandardArgs {
    fn default() -> Self {
        Self {
            verbose: 0,
            test: 0,
            timeout_min: 0,
            outfile: None,
            workercount: 4,
            job_cache: DEFAULT_JOB_CACHE.to_string(),
            no_job_cache: false,
            use_container: false,
            no_container: false,
            use_slurm: false,
            slurm_partition: "ccm".to_string(),
            slurm_accept_shared_nodes: false,
            slurm_jobs_per_allocation: 6,
            slurm_max_simultaneous_allocations: 5,
            slurm_gpus_per_node: 0,
            check_config: false,
        }
    }
}

/// `HITHER_*` variables read at start and forwarded to sorter processes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HitherEnv {
    pub use_container: Option<String>,
    pub use_singularity: Option<String>,
    pub matlab_mlm_license_file: Option<String>,
    pub matlab_lnu_credentials_path: Option<String>,
}

impl HitherEnv {
    pub fn from_env() -> Self {
        Self {
            use_container: std::env::var("HITHER_USE_CONTAINER").ok(),
            use_singularity: std::env::var("HITHER_USE_SINGULARITY").ok(),
            matlab_mlm_license_file: std::env::var("HITHER_MATLAB_MLM_LICENSE_FILE").ok(),
            matlab_lnu_credentials_path: std::env::var("HITHER_MATLAB_LNU_CREDENTIALS_PATH").ok(),
        }
    }

    pub fn container_requested(&self) -> bool {
        matches!(self.use_container.as_deref(), Some("TRUE") | Some("1"))
    }

    pub fn vars(&self) -> Vec<(&'static str, String)> {
        [
            ("HITHER_USE_CONTAINER", &self.use_container),
            ("HITHER_USE_SINGULARITY", &self.use_singularity),
            (
                "HITHER_MATLAB_MLM_LICENSE_FILE",
                &self.matlab_mlm_license_file,
            ),
            (
                "HITHER_MATLAB_LNU_CREDENTIALS_PATH",
                &self.matlab_lnu_credentials_path,
            ),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.clone().map(|value| (key, value)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ContainerRuntime {
    Docker,
    Singularity,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlurmConfig {
    pub max_jobs_per_allocation: usize,
    pub max_simultaneous_allocations: usize,
    pub srun_command: Vec<String>,
}

impl SlurmConfig {
    /// Number of jobs that may run at once across all allocations.
    pub fn concurrency(&self) -> usize {
        (self.max_jobs_per_allocation * self.max_simultaneous_allocations).max(1)
    }
}

/// Validated, immutable run configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub verbosity: u8,
    pub test_limit: Option<usize>,
    pub timeout: Option<Duration>,
    pub outfile: Option<PathBuf>,
    pub workercount: usize,
    pub job_cache: Option<String>,
    pub container: Option<ContainerRuntime>,
    pub slurm: Option<SlurmConfig>,
    pub env: HitherEnv,
}

impl RunConfig {
    pub fn from_args(args: &StandardArgs, env: HitherEnv) -> Result<Self, SfError> {
        if let Some(outfile) = &args.outfile {
            check_output_target(outfile)?;
        }
        if args.use_container && args.no_container {
            tracing::debug!("--no-container ignored because --use-container is set");
        }

        let use_container =
            args.use_container || (!args.no_container && env.container_requested());
        let container = use_container.then(|| {
            if env.use_singularity.is_some() {
                ContainerRuntime::Singularity
            } else {
                ContainerRuntime::Docker
            }
        });

        let slurm = args.use_slurm.then(|| SlurmConfig {
            max_jobs_per_allocation: args.slurm_jobs_per_allocation.max(1),
            max_simultaneous_allocations: args.slurm_max_simultaneous_allocations.max(1),
            srun_command: srun_command(
                &args.slurm_partition,
                args.slurm_accept_shared_nodes,
                args.slurm_gpus_per_node,
            ),
        });

        Ok(Self {
            verbosity: args.verbose,
            test_limit: (args.test > 0).then_some(args.test),
            timeout: (args.timeout_min > 0).then(|| Duration::from_secs(args.timeout_min * 60)),
            outfile: args.outfile.clone().filter(|path| !path.as_os_str().is_empty()),
            workercount: args.workercount.max(1),
            job_cache: (!args.no_job_cache).then(|| args.job_cache.clone()),
            container,
            slurm,
            env,
        })
    }

    /// Threads the job handler should run with.
    pub fn concurrency(&self) -> usize {
        match &self.slurm {
            Some(slurm) => slurm.concurrency(),
            None => self.workercount,
        }
    }
}

pub fn srun_command(partition: &str, accept_shared_nodes: bool, gpus_per_node: u32) -> Vec<String> {
    let mut command = vec![
        "srun".to_string(),
        "-n".to_string(),
        "1".to_string(),
        "-p".to_string(),
        partition.to_string(),
    ];
    if !accept_shared_nodes {
        command.push("--exclusive".to_string());
    }
    if gpus_per_node > 0 {
        command.push(format!("--gpus-per-node={gpus_per_node}"));
    }
    command
}

/// Fails when the output target already exists; `/dev/null` is always accepted.
pub fn check_output_target(path: &Path) -> Result<(), SfError> {
    if path.as_os_str().is_empty() || path == Path::new("/dev/null") {
        return Ok(());
    }
    if path.exists() {
        return Err(SfError::OutputExists(path.to_path_buf()));
    }
    Ok(())
}

#[derive(Args, Debug, Clone)]
pub struct SortingArgs {
    /// Path or URI of the study-set manifest; overrides the spec file's `studysets`
    #[arg(short = 's', long)]
    pub study_source_file: Option<String>,

    /// Path of the YAML sorter spec file
    #[arg(short = 'l', long)]
    pub sorter_spec_file: PathBuf,
}

/// Resolved inputs of a sorting run.
#[derive(Debug, Clone, Serialize)]
pub struct SortingInputs {
    pub study_source: ContentAddress,
    pub sorter_spec_file: PathBuf,
}

impl SortingInputs {
    pub fn resolve(args: &SortingArgs, spec: &SorterSpec) -> Result<Self, SfError> {
        let locator = match (&args.study_source_file, spec.study_source()) {
            (Some(cli), _) => cli.clone(),
            (None, Some(from_spec)) => from_spec.to_string(),
            (None, None) => {
                return Err(SfError::SpecParse(
                    "no study source given on the command line or in the spec file".to_string(),
                ));
            }
        };
        let mut study_source: ContentAddress = locator.parse()?;
        if let ContentAddress::Local(path) = &study_source {
            let path = resolve_relative(path, &args.sorter_spec_file, args.study_source_file.is_some());
            if !path.exists() {
                return Err(SfError::MissingFile(path));
            }
            study_source = ContentAddress::Local(path);
        }
        Ok(Self {
            study_source,
            sorter_spec_file: args.sorter_spec_file.clone(),
        })
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct WorkspaceArgs {
    /// URI of the workspace to add data to
    #[arg(short = 'W', long)]
    pub workspace_uri: Option<String>,

    /// Create a new workspace; conflicts with --workspace-uri
    #[arg(long)]
    pub create_new_workspace: bool,

    /// Path of a sortings file written by run-sortings
    #[arg(short = 's', long)]
    pub sortings_file: Option<PathBuf>,

    /// Content address of a sortings file
    #[arg(short = 'k', long)]
    pub sortings_file_uri: Option<String>,

    /// Only print what would be added
    #[arg(long)]
    pub dry_run: bool,

    /// Sample rate in Hz for every sorting; inferred from each recording when omitted
    #[arg(long)]
    pub sample_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum WorkspaceTarget {
    Existing(String),
    CreateNew,
    /// Dry run without a workspace to compare against.
    Detached,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceParams {
    pub target: WorkspaceTarget,
    pub sortings_source: ContentAddress,
    pub dry_run: bool,
    pub sample_rate: SampleRate,
}

impl WorkspaceParams {
    pub fn from_args(args: &WorkspaceArgs) -> Result<Self, SfError> {
        let target = match (&args.workspace_uri, args.create_new_workspace, args.dry_run) {
            (Some(_), true, _) => {
                return Err(SfError::ConflictingFlags(
                    "--create-new-workspace and --workspace-uri are both set".to_string(),
                ));
            }
            (Some(uri), false, _) => WorkspaceTarget::Existing(uri.clone()),
            (None, true, false) => WorkspaceTarget::CreateNew,
            (None, _, true) => WorkspaceTarget::Detached,
            (None, false, false) => {
                return Err(SfError::ConflictingFlags(
                    "provide either --workspace-uri or --create-new-workspace".to_string(),
                ));
            }
        };

        let sortings_source = match (&args.sortings_file, &args.sortings_file_uri) {
            (Some(path), None) => {
                if !path.exists() {
                    return Err(SfError::MissingFile(path.clone()));
                }
                ContentAddress::Local(path.clone())
            }
            (None, Some(uri)) => uri.parse()?,
            _ => {
                return Err(SfError::ConflictingFlags(
                    "exactly one of --sortings-file and --sortings-file-uri must be set".to_string(),
                ));
            }
        };

        Ok(Self {
            target,
            sortings_source,
            dry_run: args.dry_run,
            sample_rate: SampleRate::from_option(args.sample_rate)?,
        })
    }
}

/// Relative manifest paths inside a spec file are taken relative to the spec file.
fn resolve_relative(path: &Path, spec_file: &Path, from_cli: bool) -> PathBuf {
    if from_cli || path.is_absolute() || path.exists() {
        return path.to_path_buf();
    }
    spec_file
        .parent()
        .map(|dir| dir.join(path))
        .unwrap_or_else(|| path.to_path_buf())
}
