use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::Builder;

use crate::config::{ContainerRuntime, HitherEnv};
use crate::error::SfError;
use crate::jobs::{JobRequest, now_seconds};
use crate::store::read_json_file;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub timestamp: f64,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct ConsoleLog {
    lines: Vec<ConsoleLine>,
}

impl ConsoleLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: impl Into<String>) {
        self.lines.push(ConsoleLine {
            timestamp: now_seconds(),
            text: text.into(),
        });
    }

    pub fn extend(&mut self, lines: impl IntoIterator<Item = ConsoleLine>) {
        self.lines.extend(lines);
    }

    pub fn lines(&self) -> &[ConsoleLine] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<ConsoleLine> {
        self.lines
    }
}

/// Runs a single sorting and returns the sorting object the sorter produced.
pub trait SorterRunner: Send + Sync {
    fn run(&self, request: &JobRequest, console: &mut ConsoleLog) -> Result<Value, SfError>;
}

/// Launches the external sorter program once per job.
///
/// The program is invoked as `<command...> <recording.json> <sorting.json>` inside a scratch
/// directory. It receives the sorter parameters as JSON in `SF_SORTER_PARAMS` and must write the
/// resulting sorting object to the second path.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    pub env: HitherEnv,
    pub container: Option<ContainerRuntime>,
    pub srun_prefix: Option<Vec<String>>,
    pub timeout: Option<Duration>,
    pub scratch_root: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new(env: HitherEnv) -> Self {
        Self {
            env,
            container: None,
            srun_prefix: None,
            timeout: None,
            scratch_root: None,
        }
    }

    pub fn command_line(&self, request: &JobRequest, recording: &Path, sorting: &Path) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(prefix) = &self.srun_prefix {
            argv.extend(prefix.iter().cloned());
        }
        argv.extend(request.command.iter().cloned());
        argv.push(recording.to_string_lossy().to_string());
        argv.push(sorting.to_string_lossy().to_string());
        argv
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir, SfError> {
        let mut builder = Builder::new();
        builder.prefix("sf-sort");
        match &self.scratch_root {
            Some(root) => {
                fs::create_dir_all(root).map_err(|err| SfError::Filesystem(err.to_string()))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|err| SfError::Filesystem(err.to_string()))
    }
}

impl SorterRunner for CommandRunner {
    fn run(&self, request: &JobRequest, console: &mut ConsoleLog) -> Result<Value, SfError> {
        let sorter = request.sorter.to_string();
        let failed = |message: String| SfError::SorterFailed {
            sorter: sorter.clone(),
            message,
        };

        if request.command.is_empty() {
            return Err(failed("no command configured".to_string()));
        }
        if request.sorter.requires_matlab()
            && self.env.matlab_mlm_license_file.is_none()
            && self.env.matlab_lnu_credentials_path.is_none()
        {
            tracing::warn!(%sorter, "no MATLAB license configured; sorter will likely fail");
        }

        let scratch = self.scratch_dir()?;
        let recording_path = scratch.path().join("recording.json");
        let sorting_path = scratch.path().join("sorting.json");
        let recording_json = serde_json::to_vec_pretty(&request.recording_object)
            .map_err(|err| failed(err.to_string()))?;
        fs::write(&recording_path, recording_json)
            .map_err(|err| SfError::Filesystem(err.to_string()))?;

        let argv = self.command_line(request, &recording_path, &sorting_path);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(scratch.path())
            .env("SF_SORTER_PARAMS", request.parameters.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in self.env.vars() {
            if CONTAINER_VARS.contains(&key) {
                continue;
            }
            cmd.env(key, value);
        }
        match self.container {
            Some(ContainerRuntime::Docker) => {
                cmd.env("HITHER_USE_CONTAINER", "1");
                cmd.env_remove("HITHER_USE_SINGULARITY");
            }
            Some(ContainerRuntime::Singularity) => {
                cmd.env("HITHER_USE_CONTAINER", "1");
                cmd.env("HITHER_USE_SINGULARITY", "1");
            }
            None => {
                for key in CONTAINER_VARS {
                    cmd.env_remove(key);
                }
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout reaches whatever the sorter launched.
            cmd.process_group(0);
        }

        console.push(format!("BEGINNING {sorter} sort: {}", format_now()));
        tracing::debug!(command = %argv.join(" "), "launching sorter");
        let mut child = cmd
            .spawn()
            .map_err(|err| failed(format!("could not launch {}: {err}", argv[0])))?;

        let captured = Arc::new(Mutex::new(Vec::<ConsoleLine>::new()));
        let readers = [
            child.stdout.take().map(|out| spawn_reader(out, Arc::clone(&captured))),
            child.stderr.take().map(|err| spawn_reader(err, Arc::clone(&captured))),
        ];

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(err) => break Err(failed(err.to_string())),
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    kill_process_tree(&mut child);
                    let _ = child.wait();
                    break Err(SfError::SorterTimeout {
                        sorter: sorter.clone(),
                        seconds: timeout.as_secs(),
                    });
                }
            }
            thread::sleep(Duration::from_millis(100));
        };

        // After a timeout a detached descendant may still hold the pipes; keep what was read.
        if !matches!(status, Err(SfError::SorterTimeout { .. })) {
            for reader in readers.into_iter().flatten() {
                let _ = reader.join();
            }
        }
        let mut lines = captured
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        lines.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        console.extend(lines);

        let status = status?;
        if !status.success() {
            return Err(failed(format!("exited with {status}")));
        }
        if !sorting_path.exists() {
            return Err(failed("sorter did not write a sorting object".to_string()));
        }
        let sorting = read_json_file(&sorting_path)?;
        console.push(format!("COMPLETED {sorter} sort: {}", format_now()));
        Ok(sorting)
    }
}

const CONTAINER_VARS: [&str; 2] = ["HITHER_USE_CONTAINER", "HITHER_USE_SINGULARITY"];

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    if let Ok(pid) = i32::try_from(child.id()) {
        // SAFETY: kill(2) with a negative pid signals the group the child leads.
        let signalled = unsafe { libc::kill(-pid, libc::SIGKILL) };
        if signalled == 0 {
            return;
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) {
    let _ = child.kill();
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    sink: Arc<Mutex<Vec<ConsoleLine>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines().map_while(Result::ok) {
            if let Ok(mut lines) = sink.lock() {
                lines.push(ConsoleLine {
                    timestamp: now_seconds(),
                    text: line,
                });
            }
        }
    })
}

fn format_now() -> String {
    Utc::now().format(crate::reconcile::DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::SorterName;

    #[test]
    fn command_line_prefixes_srun() {
        let mut runner = CommandRunner::new(HitherEnv::default());
        runner.srun_prefix = Some(crate::config::srun_command("ccm", false, 0));
        let request = JobRequest {
            sorter: SorterName::MountainSort4,
            parameters: json!({}),
            recording_object: json!({}),
            command: vec!["sf-mountainsort4".to_string()],
        };
        let argv = runner.command_line(&request, Path::new("/s/rec.json"), Path::new("/s/out.json"));
        assert_eq!(
            argv.join(" "),
            "srun -n 1 -p ccm --exclusive sf-mountainsort4 /s/rec.json /s/out.json"
        );
    }

    #[cfg(unix)]
    #[test]
    fn missing_program_fails_the_job() {
        let runner = CommandRunner::new(HitherEnv::default());
        let request = JobRequest {
            sorter: SorterName::Tridesclous,
            parameters: json!({}),
            recording_object: json!({}),
            command: vec!["/nonexistent/sf-tridesclous".to_string()],
        };
        let mut console = ConsoleLog::new();
        let err = runner.run(&request, &mut console).unwrap_err();
        assert!(matches!(err, SfError::SorterFailed { .. }));
        assert!(console.lines()[0].text.starts_with("BEGINNING Tridesclous sort:"));
    }
}
