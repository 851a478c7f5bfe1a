//! Running external programs.
//!
//! Providers never spawn processes directly. They go through a
//! [`CommandExecutor`] so tests can substitute a scripted fake.

use std::collections::{HashMap, HashSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout and stderr joined, for error messages.
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Something that can run a program to completion.
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args` and wait for it.
    ///
    /// `Err` means the process could not be started at all. A process that
    /// ran and exited non-zero is an `Ok` with a failed status.
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;

    /// Full path of `program` if it can be found.
    fn which(&self, program: &str) -> Option<PathBuf>;
}

/// Render a command line for logs and error messages.
pub fn display_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

/// Executor backed by [`std::process::Command`].
///
/// Programs are looked up on `PATH`, then in `$GOPATH/bin` (or `~/go/bin`),
/// which is where `go install` puts them.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor {
    extra_dirs: Vec<PathBuf>,
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also search `dir` when resolving programs.
    #[must_use]
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extra_dirs.push(dir.into());
        self
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = env::var_os("PATH")
            .map(|p| env::split_paths(&p).collect())
            .unwrap_or_default();
        dirs.extend(self.extra_dirs.iter().cloned());
        if let Some(gobin) = go_bin_dir() {
            dirs.push(gobin);
        }
        dirs
    }
}

fn go_bin_dir() -> Option<PathBuf> {
    if let Some(gopath) = env::var_os("GOPATH").filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(gopath).join("bin"));
    }
    env::var_os("HOME").map(|home| PathBuf::from(home).join("go").join("bin"))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

impl CommandExecutor for SystemExecutor {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let resolved: OsString = self
            .which(program)
            .map(PathBuf::into_os_string)
            .unwrap_or_else(|| program.into());

        debug!(target: "e2e.exec", command = %display_command(program, args), "Running command");
        let output = Command::new(resolved).args(args).output()?;

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(
            target: "e2e.exec",
            program = %program,
            status = ?result.status,
            "Command finished"
        );
        Ok(result)
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        if program.contains(std::path::MAIN_SEPARATOR) {
            let path = PathBuf::from(program);
            return is_executable(&path).then_some(path);
        }
        self.search_dirs()
            .into_iter()
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }
}

/// Executor that replays canned outputs instead of spawning processes.
///
/// Responses are keyed by the full command line. Several responses queued
/// for one command are returned in order, the last one repeating. Commands
/// with nothing queued succeed with empty output. Every call is recorded.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    responses: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    available: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `output` for `command`.
    pub fn respond(&self, command: &str, output: CommandOutput) -> &Self {
        lock(&self.responses)
            .entry(command.to_string())
            .or_default()
            .push_back(output);
        self
    }

    /// Make [`CommandExecutor::which`] find `program`.
    pub fn install(&self, program: &str) -> &Self {
        lock(&self.available).insert(program.to_string());
        self
    }

    /// Command lines run so far.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let command = display_command(program, args);
        lock(&self.calls).push(command.clone());

        let mut responses = lock(&self.responses);
        let Some(queue) = responses.get_mut(&command) else {
            return Ok(CommandOutput::ok(""));
        };
        let output = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(output.unwrap_or_default())
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        lock(&self.available)
            .contains(program)
            .then(|| PathBuf::from("/usr/local/bin").join(program))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        assert_eq!(CommandOutput::ok("done\n").combined(), "done");
        assert_eq!(CommandOutput::failed(1, "boom").combined(), "boom");

        let both = CommandOutput {
            status: Some(2),
            stdout: "partial".to_string(),
            stderr: "error".to_string(),
        };
        assert_eq!(both.combined(), "partial\nerror");
        assert!(!both.success());
    }

    #[test]
    fn test_display_command() {
        assert_eq!(display_command("kind", &[]), "kind");
        assert_eq!(
            display_command("kind", &["get".to_string(), "clusters".to_string()]),
            "kind get clusters"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_system_executor_runs_programs() {
        let exec = SystemExecutor::new();
        let out = exec.run("sh", &["-c".to_string(), "echo hi".to_string()]).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hi");

        let failed = exec
            .run("sh", &["-c".to_string(), "echo oops >&2; exit 3".to_string()])
            .unwrap();
        assert_eq!(failed.status, Some(3));
        assert_eq!(failed.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn test_which() {
        let exec = SystemExecutor::new();
        assert!(exec.which("sh").is_some());
        assert!(exec.which("definitely-not-a-real-program-e2e").is_none());
    }

    #[test]
    fn test_scripted_executor_replays_in_order() {
        let exec = ScriptedExecutor::new();
        exec.respond("kind get clusters", CommandOutput::ok(""))
            .respond("kind get clusters", CommandOutput::ok("e2e\n"))
            .install("kind");

        let args = ["get".to_string(), "clusters".to_string()];
        assert_eq!(exec.run("kind", &args).unwrap().stdout, "");
        assert_eq!(exec.run("kind", &args).unwrap().stdout, "e2e\n");
        assert_eq!(exec.run("kind", &args).unwrap().stdout, "e2e\n");
        assert!(exec.run("helm", &[]).unwrap().success());

        assert_eq!(exec.calls().len(), 4);
        assert!(exec.which("kind").is_some());
        assert!(exec.which("helm").is_none());
    }

    #[test]
    fn test_missing_program_is_io_error() {
        let exec = SystemExecutor::new();
        assert!(exec.run("definitely-not-a-real-program-e2e", &[]).is_err());
    }
}
