use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use spikeforest_pipeline::config::{
    ContainerRuntime, HitherEnv, RunConfig, SortingArgs, SortingInputs, StandardArgs,
    WorkspaceArgs, WorkspaceParams, WorkspaceTarget,
};
use spikeforest_pipeline::domain::{ContentAddress, SampleRate};
use spikeforest_pipeline::error::SfError;
use spikeforest_pipeline::sorter_spec::SorterSpec;

#[test]
fn standard_args_resolve_into_run_config() {
    let args = StandardArgs {
        test: 3,
        timeout_min: 90,
        workercount: 0,
        no_job_cache: true,
        ..StandardArgs::default()
    };
    let config = RunConfig::from_args(&args, HitherEnv::default()).unwrap();
    assert_eq!(config.test_limit, Some(3));
    assert_eq!(config.timeout, Some(Duration::from_secs(5400)));
    assert_eq!(config.workercount, 1);
    assert_eq!(config.job_cache, None);
    assert!(config.slurm.is_none());
    assert_eq!(config.concurrency(), 1);
}

#[test]
fn slurm_concurrency_spans_allocations() {
    let args = StandardArgs {
        use_slurm: true,
        slurm_partition: "gpu".to_string(),
        slurm_gpus_per_node: 1,
        ..StandardArgs::default()
    };
    let config = RunConfig::from_args(&args, HitherEnv::default()).unwrap();
    let slurm = config.slurm.as_ref().unwrap();
    assert_eq!(
        slurm.srun_command.join(" "),
        "srun -n 1 -p gpu --exclusive --gpus-per-node=1"
    );
    assert_eq!(config.concurrency(), 30);
}

#[test]
fn singularity_is_selected_from_environment() {
    let env = HitherEnv {
        use_container: Some("1".to_string()),
        use_singularity: Some("TRUE".to_string()),
        ..HitherEnv::default()
    };
    let config = RunConfig::from_args(&StandardArgs::default(), env).unwrap();
    assert_eq!(config.container, Some(ContainerRuntime::Singularity));
}

#[test]
fn existing_outfile_fails_before_any_work() {
    let temp = tempfile::tempdir().unwrap();
    let outfile = temp.path().join("sortings.json");
    fs::write(&outfile, "[]").unwrap();
    let args = StandardArgs {
        outfile: Some(outfile),
        ..StandardArgs::default()
    };
    assert_matches!(
        RunConfig::from_args(&args, HitherEnv::default()),
        Err(SfError::OutputExists(_))
    );

    let dev_null = StandardArgs {
        outfile: Some("/dev/null".into()),
        ..StandardArgs::default()
    };
    assert!(RunConfig::from_args(&dev_null, HitherEnv::default()).is_ok());
}

#[test]
fn study_source_is_resolved_next_to_spec_file() {
    let temp = tempfile::tempdir().unwrap();
    let spec_path = temp.path().join("sorters.yaml");
    fs::write(temp.path().join("manifest.json"), r#"{"StudySets": []}"#).unwrap();
    fs::write(&spec_path, "studysets: manifest.json\nstudyset_names: []\n").unwrap();
    let spec = SorterSpec::load(&spec_path).unwrap();

    let args = SortingArgs {
        study_source_file: None,
        sorter_spec_file: spec_path.clone(),
    };
    let inputs = SortingInputs::resolve(&args, &spec).unwrap();
    assert_eq!(
        inputs.study_source,
        ContentAddress::Local(temp.path().join("manifest.json"))
    );

    let override_args = SortingArgs {
        study_source_file: Some(
            "sha1://05536d7a37efb3f5f2ca42c987964f199305f480/studysets.json".to_string(),
        ),
        sorter_spec_file: spec_path,
    };
    let inputs = SortingInputs::resolve(&override_args, &spec).unwrap();
    assert_matches!(inputs.study_source, ContentAddress::Sha1 { .. });
}

#[test]
fn missing_study_source_is_reported() {
    let temp = tempfile::tempdir().unwrap();
    let spec_path = temp.path().join("sorters.yaml");
    fs::write(&spec_path, "studyset_names: []\n").unwrap();
    let spec = SorterSpec::load(&spec_path).unwrap();

    let args = SortingArgs {
        study_source_file: None,
        sorter_spec_file: spec_path.clone(),
    };
    assert_matches!(SortingInputs::resolve(&args, &spec), Err(SfError::SpecParse(_)));

    let args = SortingArgs {
        study_source_file: Some(temp.path().join("gone.json").display().to_string()),
        sorter_spec_file: spec_path,
    };
    assert_matches!(SortingInputs::resolve(&args, &spec), Err(SfError::MissingFile(_)));
}

#[test]
fn workspace_selection_flags_conflict() {
    let args = WorkspaceArgs {
        workspace_uri: Some("workspace://abc".to_string()),
        create_new_workspace: true,
        sortings_file_uri: Some("sha1://05536d7a37efb3f5f2ca42c987964f199305f480".to_string()),
        ..WorkspaceArgs::default()
    };
    let err = WorkspaceParams::from_args(&args).unwrap_err();
    assert_matches!(err, SfError::ConflictingFlags(_));
    assert!(err.is_configuration());

    let neither = WorkspaceArgs {
        sortings_file_uri: Some("sha1://05536d7a37efb3f5f2ca42c987964f199305f480".to_string()),
        ..WorkspaceArgs::default()
    };
    assert_matches!(
        WorkspaceParams::from_args(&neither),
        Err(SfError::ConflictingFlags(_))
    );
}

#[test]
fn exactly_one_sortings_source() {
    let temp = tempfile::tempdir().unwrap();
    let file = temp.path().join("sortings.json");
    fs::write(&file, "[]").unwrap();

    let both = WorkspaceArgs {
        create_new_workspace: true,
        sortings_file: Some(file.clone()),
        sortings_file_uri: Some("sha1://05536d7a37efb3f5f2ca42c987964f199305f480".to_string()),
        ..WorkspaceArgs::default()
    };
    assert_matches!(WorkspaceParams::from_args(&both), Err(SfError::ConflictingFlags(_)));

    let ok = WorkspaceArgs {
        create_new_workspace: true,
        sortings_file: Some(file.clone()),
        sample_rate: Some(32000.0),
        ..WorkspaceArgs::default()
    };
    let params = WorkspaceParams::from_args(&ok).unwrap();
    assert_eq!(params.target, WorkspaceTarget::CreateNew);
    assert_eq!(params.sortings_source, ContentAddress::Local(file));
    assert_eq!(params.sample_rate, SampleRate::Fixed(32000.0));
}

#[test]
fn dry_run_needs_no_workspace() {
    let args = WorkspaceArgs {
        dry_run: true,
        sortings_file_uri: Some("sha1://05536d7a37efb3f5f2ca42c987964f199305f480".to_string()),
        ..WorkspaceArgs::default()
    };
    let params = WorkspaceParams::from_args(&args).unwrap();
    assert_eq!(params.target, WorkspaceTarget::Detached);
    assert!(params.dry_run);
}

#[test]
fn non_positive_sample_rate_is_rejected() {
    let args = WorkspaceArgs {
        create_new_workspace: true,
        sortings_file_uri: Some("sha1://05536d7a37efb3f5f2ca42c987964f199305f480".to_string()),
        sample_rate: Some(0.0),
        ..WorkspaceArgs::default()
    };
    assert_matches!(WorkspaceParams::from_args(&args), Err(SfError::SampleRate(_)));
}
