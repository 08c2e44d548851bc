use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use spikeforest_pipeline::app::{App, ProgressSink, StderrProgress};
use spikeforest_pipeline::catalog::DEFAULT_RECORDINGS_URI;
use spikeforest_pipeline::config::{
    HitherEnv, RunConfig, SortingArgs, StandardArgs, WorkspaceArgs, WorkspaceParams,
    WorkspaceTarget,
};
use spikeforest_pipeline::domain::{ContentAddress, SampleRate, SorterName};
use spikeforest_pipeline::error::SfError;
use spikeforest_pipeline::gateway::GatewayHttpClient;
use spikeforest_pipeline::output::{JsonOutput, emit_records};
use spikeforest_pipeline::store::LocalStore;

#[derive(Parser)]
#[command(name = "sf-pipeline")]
#[command(about = "Run spike sorters over SpikeForest study sets and publish the results")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run every sorter in the spec file against its study sets")]
    RunSortings(RunSortingsArgs),
    #[command(about = "Add the results of a sortings file to a workspace")]
    PrepareWorkspace(PrepareWorkspaceArgs),
    #[command(about = "Run sortings and publish the results in one step")]
    SortToWorkspace(SortToWorkspaceArgs),
    #[command(about = "Inspect a sortings file")]
    Outputs(OutputsArgs),
    #[command(about = "Inspect a SpikeForest recordings index")]
    Recordings(RecordingsArgs),
}

#[derive(Args)]
struct RunSortingsArgs {
    #[command(flatten)]
    sorting: SortingArgs,
    #[command(flatten)]
    standard: StandardArgs,
}

#[derive(Args)]
struct PrepareWorkspaceArgs {
    #[command(flatten)]
    workspace: WorkspaceArgs,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Args)]
struct SortToWorkspaceArgs {
    #[command(flatten)]
    sorting: SortingArgs,
    #[command(flatten)]
    standard: StandardArgs,
    /// Workspace to add results to; a new one is created when omitted
    #[arg(short = 'W', long)]
    workspace_uri: Option<String>,
    #[arg(long)]
    sample_rate: Option<f64>,
}

#[derive(Args)]
struct OutputsArgs {
    #[command(subcommand)]
    command: OutputsCommand,
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum OutputsCommand {
    #[command(about = "List every record in a sortings file")]
    List {
        #[arg(long)]
        source: String,
    },
    #[command(about = "Show one record and its stored sorting")]
    Show {
        #[arg(long)]
        source: String,
        #[arg(long)]
        study: String,
        #[arg(long)]
        recording: String,
        #[arg(long)]
        sorter: String,
        /// Include the captured console output
        #[arg(long)]
        console: bool,
    },
}

#[derive(Args)]
struct RecordingsArgs {
    #[command(subcommand)]
    command: RecordingsCommand,
    /// Recordings index to read
    #[arg(long, global = true, default_value = DEFAULT_RECORDINGS_URI)]
    source: String,
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum RecordingsCommand {
    #[command(about = "List every recording with its channel count, duration and true units")]
    List,
    #[command(about = "Show one recording, including its recording and ground-truth objects")]
    Show {
        #[arg(long)]
        study: String,
        #[arg(long)]
        recording: String,
    },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SfError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SfError) -> u8 {
    if error.is_configuration() {
        return 2;
    }
    match error {
        SfError::ObjectNotFound(_)
        | SfError::ObjectDecode { .. }
        | SfError::GatewayHttp(_)
        | SfError::GatewayStatus { .. }
        | SfError::Filesystem(_) => 3,
        _ => 1,
    }
}

fn init_logging(verbosity: u8) {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        EnvFilter::new(level)
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let verbosity = match &cli.command {
        Commands::RunSortings(args) => args.standard.verbose,
        Commands::PrepareWorkspace(args) => args.verbose,
        Commands::SortToWorkspace(args) => args.standard.verbose,
        Commands::Outputs(args) => args.verbose,
        Commands::Recordings(args) => args.verbose,
    };
    init_logging(verbosity);

    let store = LocalStore::new(Some(GatewayHttpClient::new()?))?;
    let root = store.root().to_path_buf();
    let app = App::new(store, root);
    let sink = StderrProgress::new(verbosity);

    match cli.command {
        Commands::RunSortings(args) => run_sortings(&app, args, &sink),
        Commands::PrepareWorkspace(args) => {
            let params = WorkspaceParams::from_args(&args.workspace)?;
            let report = app.prepare_workspace(&params, &sink)?;
            JsonOutput::print(&report).into_diagnostic()
        }
        Commands::SortToWorkspace(args) => sort_to_workspace(&app, args, &sink),
        Commands::Outputs(args) => run_outputs(&app, args.command),
        Commands::Recordings(args) => run_recordings(&app, args),
    }
}

fn run_sortings(
    app: &App<LocalStore<GatewayHttpClient>>,
    args: RunSortingsArgs,
    sink: &dyn ProgressSink,
) -> miette::Result<()> {
    let config = RunConfig::from_args(&args.standard, HitherEnv::from_env())?;
    if args.standard.check_config {
        return JsonOutput::print(&app.check_config(&config)).into_diagnostic();
    }
    let handler = app.build_handler(&config);
    let records = app.run_sortings(&args.sorting, &config, &handler, sink)?;
    emit_records(&records, config.outfile.as_deref())?;
    Ok(())
}

fn sort_to_workspace(
    app: &App<LocalStore<GatewayHttpClient>>,
    args: SortToWorkspaceArgs,
    sink: &dyn ProgressSink,
) -> miette::Result<()> {
    let config = RunConfig::from_args(&args.standard, HitherEnv::from_env())?;
    let sample_rate = SampleRate::from_option(args.sample_rate)?;
    if args.standard.check_config {
        return JsonOutput::print(&app.check_config(&config)).into_diagnostic();
    }
    let target = match args.workspace_uri {
        Some(uri) => WorkspaceTarget::Existing(uri),
        None => WorkspaceTarget::CreateNew,
    };

    let handler = app.build_handler(&config);
    let records = app.run_sortings(&args.sorting, &config, &handler, sink)?;
    if config.outfile.is_some() {
        emit_records(&records, config.outfile.as_deref())?;
    }
    let report = app.publish_records(&records, &target, false, sample_rate, sink)?;
    JsonOutput::print(&report).into_diagnostic()
}

fn run_outputs(
    app: &App<LocalStore<GatewayHttpClient>>,
    command: OutputsCommand,
) -> miette::Result<()> {
    match command {
        OutputsCommand::List { source } => {
            let source: ContentAddress = source.parse()?;
            JsonOutput::print(&app.list_outputs(&source)?).into_diagnostic()
        }
        OutputsCommand::Show {
            source,
            study,
            recording,
            sorter,
            console,
        } => {
            let source: ContentAddress = source.parse()?;
            let sorter: SorterName = sorter.parse()?;
            let detail = app.show_output(&source, &study, &recording, sorter, console)?;
            JsonOutput::print(&detail).into_diagnostic()
        }
    }
}

fn run_recordings(
    app: &App<LocalStore<GatewayHttpClient>>,
    args: RecordingsArgs,
) -> miette::Result<()> {
    let source: ContentAddress = args.source.parse()?;
    match args.command {
        RecordingsCommand::List => JsonOutput::print(&app.list_recordings(&source)?).into_diagnostic(),
        RecordingsCommand::Show { study, recording } => {
            JsonOutput::print(&app.show_recording(&source, &study, &recording)?).into_diagnostic()
        }
    }
}
