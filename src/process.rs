//! Bounded fan-out of build child processes.
//!
//! The orchestrator itself is single threaded; all parallelism comes from
//! spawning compiler children through this pool. [`ProcessPool::spawn`]
//! returns once the child is scheduled. [`ProcessPool::wait_all`] is the
//! only blocking point: it drains every outstanding child, hands their
//! combined output to a callback and reports per-key exit status. The
//! builder spawns up to the limit, barriers, and repeats (wave scheduling).

use crate::error::{BuildError, Result};
use std::{
    path::Path,
    process::{Child, Command, Stdio},
};

/// A child that has exited, identified by the caller-chosen key.
#[derive(Debug)]
pub struct FinishedProcess {
    pub key: usize,
    /// Exit code; `-1` when the child was terminated without one.
    pub status: i32,
    pub output: String,
}

impl FinishedProcess {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug)]
struct PendingChild {
    key: usize,
    program: String,
    child: Child,
}

/// Dispatches child processes with bounded parallelism.
#[derive(Debug)]
pub struct ProcessPool {
    limit: usize,
    running: Vec<PendingChild>,
}

impl ProcessPool {
    /// Concurrency limit derived from the host, roughly the core count.
    pub fn recommended_parallelism() -> usize {
        num_cpus::get().max(1)
    }

    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1), running: Vec::new() }
    }

    pub fn with_recommended_limit() -> Self {
        Self::new(Self::recommended_parallelism())
    }

    /// Number of children spawned and not yet waited for.
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Whether the current wave is full and the caller should barrier.
    pub fn at_capacity(&self) -> bool {
        self.running.len() >= self.limit
    }

    /// Launches `argv` asynchronously. Returns once the child is scheduled,
    /// not once it exits; pair with [`Self::wait_all`].
    pub fn spawn(
        &mut self,
        key: usize,
        argv: &[String],
        working_dir: Option<&Path>,
    ) -> Result<()> {
        let (program, arguments) =
            argv.split_first().ok_or_else(|| BuildError::msg("cannot spawn an empty command"))?;

        let mut command = Command::new(program);
        command.args(arguments).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        debug!("spawning {}", argv.join(" "));
        let child = command.spawn().map_err(|err| BuildError::io(err, program))?;
        self.running.push(PendingChild { key, program: program.clone(), child });
        Ok(())
    }

    /// Barrier: blocks until every outstanding child has exited. Combined
    /// stdout/stderr of each child is passed to `on_output` (when nonempty)
    /// and returned alongside its exit status.
    pub fn wait_all(&mut self, mut on_output: impl FnMut(&str)) -> Vec<FinishedProcess> {
        let mut finished = Vec::with_capacity(self.running.len());
        for pending in self.running.drain(..) {
            let PendingChild { key, program, child } = pending;
            let result = match child.wait_with_output() {
                Ok(output) => {
                    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                    FinishedProcess {
                        key,
                        status: output.status.code().unwrap_or(-1),
                        output: text,
                    }
                }
                Err(err) => {
                    error!("failed to wait on {program}: {err}");
                    FinishedProcess { key, status: -1, output: err.to_string() }
                }
            };
            trace!("{program} exited with status {}", result.status);
            if !result.output.is_empty() {
                on_output(&result.output);
            }
            finished.push(result);
        }
        finished
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn collects_status_and_output_per_key() {
        let mut pool = ProcessPool::new(4);
        pool.spawn(0, &shell("echo first"), None).unwrap();
        pool.spawn(1, &shell("exit 3"), None).unwrap();

        let mut combined = String::new();
        let mut finished = pool.wait_all(|output| combined.push_str(output));
        finished.sort_by_key(|process| process.key);

        assert_eq!(finished.len(), 2);
        assert!(finished[0].success());
        assert_eq!(finished[1].status, 3);
        assert!(combined.contains("first"));
        assert_eq!(pool.running(), 0);
    }

    #[test]
    fn capacity_tracks_outstanding_children() {
        let mut pool = ProcessPool::new(2);
        assert!(!pool.at_capacity());
        pool.spawn(0, &shell("true"), None).unwrap();
        pool.spawn(1, &shell("true"), None).unwrap();
        assert!(pool.at_capacity());
        pool.wait_all(|_| {});
        assert!(!pool.at_capacity());
    }

    #[test]
    fn spawn_failure_reports_program_path() {
        let mut pool = ProcessPool::new(1);
        let err = pool
            .spawn(0, &["/definitely/not/a/compiler".to_string()], None)
            .unwrap_err();
        assert!(err.to_string().contains("/definitely/not/a/compiler"));
    }

    #[test]
    fn respects_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = ProcessPool::new(1);
        pool.spawn(0, &shell("pwd"), Some(dir.path())).unwrap();
        let finished = pool.wait_all(|_| {});
        let canonical = dunce::canonicalize(dir.path()).unwrap();
        assert!(finished[0].output.trim().ends_with(canonical.to_str().unwrap()));
    }
}
