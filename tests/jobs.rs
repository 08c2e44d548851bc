use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::Utf8PathBuf;
use serde_json::{Value, json};

use spikeforest_pipeline::config::{ContainerRuntime, HitherEnv};
use spikeforest_pipeline::domain::{JobStatus, SorterName};
use spikeforest_pipeline::error::SfError;
use spikeforest_pipeline::gateway::GatewayHttpClient;
use spikeforest_pipeline::jobs::{JobCache, JobHandler, JobRequest, ParallelJobHandler};
use spikeforest_pipeline::runner::{CommandRunner, ConsoleLog, SorterRunner};
use spikeforest_pipeline::store::{ContentStore, LocalStore};

#[derive(Default)]
struct CountingRunner {
    runs: AtomicUsize,
}

impl SorterRunner for CountingRunner {
    fn run(&self, request: &JobRequest, console: &mut ConsoleLog) -> Result<Value, SfError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        console.push(format!("sorting with {}", request.sorter));
        if request.recording_object["broken"] == json!(true) {
            return Err(SfError::SorterFailed {
                sorter: request.sorter.to_string(),
                message: "bad recording".to_string(),
            });
        }
        Ok(json!({"units": [7, 8]}))
    }
}

fn request(recording: Value) -> JobRequest {
    JobRequest {
        sorter: SorterName::MountainSort4,
        parameters: json!({"detect_sign": -1}),
        recording_object: recording,
        command: vec!["sf-mountainsort4".to_string()],
    }
}

fn shared_store(temp: &tempfile::TempDir) -> Arc<dyn ContentStore> {
    let root = Utf8PathBuf::from_path_buf(temp.path().join("store")).unwrap();
    Arc::new(LocalStore::<GatewayHttpClient>::new_with_root(root, None))
}

#[test]
fn cache_key_ignores_launch_command() {
    let a = request(json!({"name": "r1"}));
    let mut b = request(json!({"name": "r1"}));
    b.command = vec!["/opt/sorters/ms4".to_string()];
    assert_eq!(a.cache_key().unwrap(), b.cache_key().unwrap());

    let c = request(json!({"name": "r2"}));
    assert_ne!(a.cache_key().unwrap(), c.cache_key().unwrap());
}

#[test]
fn finished_jobs_are_served_from_cache() {
    let temp = tempfile::tempdir().unwrap();
    let store = shared_store(&temp);
    let runner = Arc::new(CountingRunner::default());

    let first = {
        let cache = JobCache::new("test-feed", Arc::clone(&store), temp.path());
        let handler = ParallelJobHandler::start(2, runner.clone(), Some(cache));
        let handle = handler.submit(request(json!({"name": "r1"})));
        handler.wait_all().unwrap();
        handle.snapshot()
    };
    assert_eq!(first.status, JobStatus::Finished);
    assert!(!first.from_cache);

    let cache = JobCache::new("test-feed", Arc::clone(&store), temp.path());
    let handler = ParallelJobHandler::start(2, runner.clone(), Some(cache));
    let handle = handler.submit(request(json!({"name": "r1"})));
    handler.wait_all().unwrap();

    let second = handle.snapshot();
    assert!(second.from_cache);
    assert_eq!(second.return_value, first.return_value);
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
}

#[test]
fn errored_jobs_are_not_cached() {
    let temp = tempfile::tempdir().unwrap();
    let store = shared_store(&temp);
    let runner = Arc::new(CountingRunner::default());

    for _ in 0..2 {
        let cache = JobCache::new("test-feed", Arc::clone(&store), temp.path());
        let handler = ParallelJobHandler::start(1, runner.clone(), Some(cache));
        let handle = handler.submit(request(json!({"name": "r1", "broken": true})));
        handler.wait_all().unwrap();
        let state = handle.snapshot();
        assert_eq!(state.status, JobStatus::Error);
        assert!(state.error_message.unwrap().contains("bad recording"));
    }
    assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
}

#[test]
fn one_failure_does_not_stop_siblings() {
    let runner = Arc::new(CountingRunner::default());
    let handler = ParallelJobHandler::start(3, runner, None);
    let handles: Vec<_> = [false, true, false, false]
        .into_iter()
        .map(|broken| handler.submit(request(json!({"broken": broken}))))
        .collect();
    handler.wait_all().unwrap();
    handler.cleanup();

    let statuses: Vec<JobStatus> = handles.iter().map(|handle| handle.status()).collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Finished,
            JobStatus::Error,
            JobStatus::Finished,
            JobStatus::Finished
        ]
    );
}

struct PanickingRunner;

impl SorterRunner for PanickingRunner {
    fn run(&self, request: &JobRequest, _console: &mut ConsoleLog) -> Result<Value, SfError> {
        if request.recording_object["broken"] == json!(true) {
            panic!("sorter wrapper crashed");
        }
        Ok(json!({"units": []}))
    }
}

#[test]
fn panicking_runner_fails_only_its_own_job() {
    let handler = ParallelJobHandler::start(1, Arc::new(PanickingRunner), None);
    let crashed = handler.submit(request(json!({"broken": true})));
    let healthy = handler.submit(request(json!({"broken": false})));
    handler.wait_all().unwrap();

    let state = crashed.snapshot();
    assert_eq!(state.status, JobStatus::Error);
    assert!(state.error_message.unwrap().contains("sorter wrapper crashed"));
    assert_eq!(healthy.status(), JobStatus::Finished);
}

#[cfg(unix)]
#[test]
fn command_runner_reads_sorting_written_by_program() {
    let runner = CommandRunner::new(HitherEnv::default());
    let mut job = request(json!({"name": "r1"}));
    job.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        r#"echo "params $SF_SORTER_PARAMS"; echo warming up >&2; printf '{"units": [3, 4]}' > "$2""#
            .to_string(),
        "sf-test".to_string(),
    ];

    let mut console = ConsoleLog::new();
    let sorting = runner.run(&job, &mut console).unwrap();
    assert_eq!(sorting, json!({"units": [3, 4]}));

    let texts: Vec<&str> = console.lines().iter().map(|line| line.text.as_str()).collect();
    assert!(texts[0].starts_with("BEGINNING MountainSort4 sort: "));
    assert!(texts.contains(&r#"params {"detect_sign":-1}"#));
    assert!(texts.contains(&"warming up"));
    assert!(texts.last().unwrap().starts_with("COMPLETED MountainSort4 sort: "));
}

#[cfg(unix)]
#[test]
fn command_runner_enforces_timeout() {
    let mut runner = CommandRunner::new(HitherEnv::default());
    runner.timeout = Some(std::time::Duration::from_millis(300));
    let mut job = request(json!({"name": "r1"}));
    job.command = vec!["sh".to_string(), "-c".to_string(), "exec sleep 5".to_string()];

    let mut console = ConsoleLog::new();
    let err = runner.run(&job, &mut console).unwrap_err();
    assert!(matches!(err, SfError::SorterTimeout { .. }));
}

#[cfg(unix)]
#[test]
fn timeout_reaches_programs_launched_by_the_sorter() {
    let mut runner = CommandRunner::new(HitherEnv::default());
    runner.timeout = Some(std::time::Duration::from_millis(300));
    let mut job = request(json!({"name": "r1"}));
    job.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        "sleep 4; echo done".to_string(),
    ];

    let started = std::time::Instant::now();
    let mut console = ConsoleLog::new();
    let err = runner.run(&job, &mut console).unwrap_err();
    assert!(matches!(err, SfError::SorterTimeout { .. }));
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
}

#[cfg(unix)]
fn container_flag_seen_by(runner: &CommandRunner) -> Vec<String> {
    let mut job = request(json!({"name": "r1"}));
    job.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        r#"echo "container=$HITHER_USE_CONTAINER singularity=$HITHER_USE_SINGULARITY"; printf '{}' > "$2""#
            .to_string(),
        "sf-test".to_string(),
    ];
    let mut console = ConsoleLog::new();
    runner.run(&job, &mut console).unwrap();
    console
        .lines()
        .iter()
        .filter(|line| line.text.starts_with("container="))
        .map(|line| line.text.clone())
        .collect()
}

#[cfg(unix)]
#[test]
fn no_container_hides_container_variables() {
    let env = HitherEnv {
        use_container: Some("TRUE".to_string()),
        use_singularity: Some("TRUE".to_string()),
        ..HitherEnv::default()
    };
    let runner = CommandRunner::new(env.clone());
    assert_eq!(container_flag_seen_by(&runner), vec!["container= singularity="]);

    let mut docker = CommandRunner::new(env);
    docker.container = Some(ContainerRuntime::Docker);
    assert_eq!(container_flag_seen_by(&docker), vec!["container=1 singularity="]);
}

#[cfg(unix)]
#[test]
fn nonzero_exit_fails_the_job() {
    let runner = CommandRunner::new(HitherEnv::default());
    let mut job = request(json!({"name": "r1"}));
    job.command = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];

    let mut console = ConsoleLog::new();
    let err = runner.run(&job, &mut console).unwrap_err();
    assert!(matches!(err, SfError::SorterFailed { .. }));
}
