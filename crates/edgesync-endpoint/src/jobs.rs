//! Remote job execution.
//!
//! `file://<name>` runs an executable found directly inside the jobs folder,
//! with the request's `data` split on whitespace as arguments.
//! `cmd://listJobs` lists what can be run.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use edgesync_proto::ExecRequest;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

const LIST_JOBS: &str = "listJobs";

/// Destination of job output lines.
pub(crate) trait JobOutput: Send + Sync {
    fn line(&self, correlation_id: &str, line: &str);
}

pub(crate) struct JobsManager {
    folder: PathBuf,
}

impl JobsManager {
    pub(crate) fn new(folder: PathBuf) -> Self {
        Self { folder }
    }

    pub(crate) fn spawn(&self, request: ExecRequest, output: Arc<dyn JobOutput>) -> JoinHandle<()> {
        let folder = self.folder.clone();
        tokio::spawn(async move {
            let job = Job { request, output };
            job.run(&folder).await;
        })
    }
}

struct Job {
    request: ExecRequest,
    output: Arc<dyn JobOutput>,
}

impl Job {
    fn send(&self, line: &str) {
        if self.request.send_output {
            self.output.line(&self.request.correlation_id, line);
        }
    }

    async fn run(&self, folder: &Path) {
        let uri = self.request.job_uri.as_str();
        if let Some(command) = uri.strip_prefix("cmd://") {
            if command == LIST_JOBS {
                self.list_jobs(folder).await;
            } else {
                self.send(&format!("Command not supported: {command}"));
            }
        } else if let Some(name) = uri.strip_prefix("file://") {
            self.run_file(folder, name).await;
        } else {
            self.send(&format!("Job URI not supported: {uri}"));
        }
    }

    async fn list_jobs(&self, folder: &Path) {
        self.send(&format!("cmd://{LIST_JOBS}"));
        match scripts(folder).await {
            Ok(names) => {
                for name in names {
                    self.send(&format!("file://{name}"));
                }
            }
            Err(e) => tracing::warn!(folder = %folder.display(), error = %e, "Failed to list jobs folder"),
        }
    }

    async fn run_file(&self, folder: &Path, name: &str) {
        let path = folder.join(name);
        if !is_plain_name(name) || !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
            self.send(&format!("Job not found: {name}"));
            return;
        }

        let args = self.request.data.as_deref().unwrap_or_default().split_whitespace();
        let mut child = match Command::new(&path)
            .args(args)
            .current_dir(folder)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(job = name, error = %e, "Failed to start job");
                self.send(&format!("Failed to start {name}: {e}"));
                return;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => self.send(&line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(job = name, error = %e, "Failed to read job output");
                        break;
                    }
                }
            }
        }

        match child.wait().await {
            Ok(status) => tracing::info!(job = name, %status, "Job finished"),
            Err(e) => tracing::warn!(job = name, error = %e, "Failed to wait for job"),
        }
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

async fn scripts(folder: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
