use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::config::WorkerConfig;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Byte streams of one launched worker.
pub struct WorkerLink {
    /// Worker output: response and notification lines.
    pub output: BoxedReader,
    /// Worker input: request lines.
    pub input: BoxedWriter,
    pub diagnostics: Option<BoxedReader>,
    pub process: Option<Child>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    fn describe(&self) -> String;

    async fn launch(&self) -> Result<WorkerLink>;
}

#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Explicit `worker.command` wins; otherwise the current executable is
    /// re-launched in its `worker` role with the same config file.
    pub fn from_config(worker: &WorkerConfig, config_path: Option<&Path>) -> Result<Self> {
        if let Some(command) = worker.command.as_ref() {
            return Ok(Self::new(command.clone(), worker.args.clone()));
        }
        let program =
            env::current_exe().context("failed resolving current executable for worker")?;
        let mut args = vec!["worker".to_owned()];
        if let Some(path) = config_path {
            args.push("--config".to_owned());
            args.push(path.display().to_string());
        }
        Ok(Self::new(program, args))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.display().to_string()
        } else {
            format!("{} {}", self.program.display(), self.args.join(" "))
        }
    }

    async fn launch(&self) -> Result<WorkerLink> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed spawning worker {}", self.describe()))?;
        let input = child
            .stdin
            .take()
            .context("worker stdin was not captured")?;
        let output = child
            .stdout
            .take()
            .context("worker stdout was not captured")?;
        let diagnostics = child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as BoxedReader);
        Ok(WorkerLink {
            output: Box::new(output),
            input: Box::new(input),
            diagnostics,
            process: Some(child),
        })
    }
}

/// Program lookup used by diagnostics: explicit paths must exist, bare names
/// are searched on `PATH`.
pub fn program_resolvable(program: &Path) -> bool {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file();
    }
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
