//! External tool invocation.
//!
//! Every side effect on block devices, mounts and the OSTree repository goes
//! through a [`ToolRunner`]. Builders never spawn processes directly, so
//! the whole pipeline can be driven by a fake runner in tests.

use log::{error, trace};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use thiserror::Error;

/// Failure of an external tool.
#[derive(Error, Debug)]
pub enum ToolError {
    /// Tool could not be started at all.
    #[error("failed to spawn child process for `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Tool exited successfully but did not take all of its input.
    #[error("failed to write standard input of `{program}`: {source}")]
    Stdin {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Tool ran and exited with a non-success status.
    #[error("child process `{program}` failed with {status}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

impl ToolError {
    /// Collected standard error of a failed tool, empty when it never reported one.
    pub fn stderr(&self) -> &str {
        match self {
            Self::Spawn { .. } | Self::Stdin { .. } => "",
            Self::Failed { stderr, .. } => stderr,
        }
    }

    /// Build [`ToolError::Failed`] for a program and its stderr.
    pub fn failed(program: &str, status: &str, stderr: &str) -> Self {
        Self::Failed {
            program: program.to_string(),
            status: status.to_string(),
            stderr: stderr.to_string(),
        }
    }
}

/// Single invocation of an external program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tool {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
}

impl Tool {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    /// Run the tool from given working directory.
    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Feed bytes to the tool standard input.
    pub fn stdin<B: Into<Vec<u8>>>(mut self, input: B) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> String {
        self.program.to_string_lossy().to_string()
    }

    pub fn get_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect()
    }

    pub fn get_stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Whether any argument is exactly `arg`.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Value of the `--name=value` style argument.
    pub fn option_value(&self, name: &str) -> Option<String> {
        let prefix = format!("{}=", name);
        self.args
            .iter()
            .filter_map(|a| a.to_str())
            .find_map(|a| a.strip_prefix(&prefix).map(str::to_string))
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Something that can run external tools.
pub trait ToolRunner {
    /// Run tool to completion, returning its standard output.
    fn run(&self, tool: &Tool) -> Result<String, ToolError>;
}

/// Runs tools as child processes on the host.
///
/// Output of the child is streamed into `trace` log with program name as the target.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostRunner;

impl ToolRunner for HostRunner {
    fn run(&self, tool: &Tool) -> Result<String, ToolError> {
        let program = tool.program();
        trace!("running command: '{}'", tool);

        let mut command = Command::new(&tool.program);
        command
            .args(&tool.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if tool.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(cwd) = &tool.cwd {
            command.current_dir(cwd);
        }

        let spawn_err = |source| ToolError::Spawn {
            program: program.clone(),
            source,
        };

        let mut child = command.spawn().map_err(spawn_err)?;

        let stdout = child.stdout.take().map(|out| {
            let target = program.clone();
            thread::spawn(move || collect_lines(out, &target))
        });
        let stderr = child.stderr.take().map(|err| {
            let target = program.clone();
            thread::spawn(move || collect_lines(err, &target))
        });

        let written = match (&tool.stdin, child.stdin.take()) {
            // Dropping the pipe after writing lets the child see EOF.
            (Some(input), Some(mut pipe)) => pipe.write_all(input),
            _ => Ok(()),
        };

        // Reap the child even when feeding its stdin failed.
        let status = child.wait().map_err(spawn_err)?;

        let stdout = join_output(stdout);
        let stderr = join_output(stderr);

        if !status.success() {
            stderr
                .lines()
                .for_each(|line| error!(target: &program, "{}", line));
            return Err(ToolError::Failed {
                program,
                status: status.to_string(),
                stderr,
            });
        }
        written.map_err(|source| ToolError::Stdin { program, source })?;
        Ok(stdout)
    }
}

/// Read `reader` to the end, one line at a time.
///
/// Invalid UTF-8 is replaced rather than cutting the output short.
fn collect_lines<R: Read>(reader: R, target: &str) -> Vec<String> {
    let mut reader = BufReader::new(reader);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                trace!(target: target, "{}", line);
                lines.push(line);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                error!(target: target, "failed to read output: {}", err);
                break;
            }
        }
    }
    lines
}

fn join_output(handle: Option<thread::JoinHandle<Vec<String>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
        .join("\n")
}


#[cfg(test)]
mod tests {
    use super::fake::FakeRunner;
    use super::{HostRunner, Tool, ToolError, ToolRunner};

    #[test]
    fn test_host_runner_stdout() {
        let out = HostRunner
            .run(&Tool::new("sh").args(["-c", "echo one; echo two"]))
            .expect("sh must run");
        assert_eq!(out, "one\ntwo");
    }

    #[test]
    fn test_host_runner_stdin() {
        let out = HostRunner
            .run(&Tool::new("cat").stdin("label: gpt\n"))
            .expect("cat must run");
        assert_eq!(out, "label: gpt");
    }

    #[test]
    fn test_host_runner_failure_keeps_stderr() {
        let err = HostRunner
            .run(&Tool::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
        assert_eq!(err.stderr(), "oops");
    }

    #[test]
    fn test_host_runner_keeps_invalid_utf8_output() {
        let out = HostRunner
            .run(&Tool::new("sh").args(["-c", "printf 'first\\n\\377bad\\nthird\\n'"]))
            .expect("sh must run");
        assert_eq!(out, "first\n\u{FFFD}bad\nthird");

        let listing = HostRunner
            .run(&Tool::new("sh").args([
                "-c",
                "printf '/usr/lib/modules\\000/usr/lib/modules/\\377k\\000/usr/lib/modules/6.9\\000'",
            ]))
            .expect("sh must run");
        let entries: Vec<&str> = listing.split('\0').filter(|e| !e.is_empty()).collect();
        assert_eq!(
            entries,
            vec!["/usr/lib/modules", "/usr/lib/modules/\u{FFFD}k", "/usr/lib/modules/6.9"]
        );
    }

    #[test]
    fn test_host_runner_unread_stdin() {
        let input = vec![b'x'; 1 << 20];
        let err = HostRunner
            .run(&Tool::new("sh").args(["-c", "exit 0"]).stdin(input.clone()))
            .unwrap_err();
        assert!(matches!(err, ToolError::Stdin { .. }));

        let err = HostRunner
            .run(&Tool::new("sh").args(["-c", "echo full >&2; exit 4"]).stdin(input))
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
        assert_eq!(err.stderr(), "full");
    }

    #[test]
    fn test_host_runner_spawn_failure() {
        let err = HostRunner
            .run(&Tool::new("/nonexistent/osimgcreate-tool"))
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[test]
    fn test_tool_display_and_options() {
        let tool = Tool::new("ostree")
            .arg("--repo=/srv/repo")
            .args(["rev-parse", "os/main"]);
        assert_eq!(tool.to_string(), "ostree --repo=/srv/repo rev-parse os/main");
        assert_eq!(tool.option_value("--repo").as_deref(), Some("/srv/repo"));
        assert!(tool.has_arg("rev-parse"));
    }

    #[test]
    fn test_fake_runner_newest_handler_wins() {
        let runner = FakeRunner::new();
        runner.on("ostree", |_| Ok("old".to_string()));
        runner.on_arg("ostree", "rev-parse", |_| Ok("new".to_string()));
        let out = runner
            .run(&Tool::new("ostree").arg("rev-parse"))
            .expect("scripted");
        assert_eq!(out, "new");
        let out = runner.run(&Tool::new("ostree").arg("ls")).expect("scripted");
        assert_eq!(out, "old");
        assert_eq!(runner.calls().len(), 2);
        assert_eq!(runner.count("ostree", "ls"), 1);
    }
}
