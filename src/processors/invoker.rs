//! External tool invocation.
//!
//! Tools are launched from a [`ToolSpec`] template, waited on (optionally with
//! a timeout) and reported back as a raw [`ToolStatus`]. Output is forwarded
//! to the log line by line and never parsed.

use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use wait_timeout::ChildExt;

use crate::config::ToolSpec;

/// Which collaborator a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Convert,
    Filter,
    Rotate,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Convert => "convert",
            Self::Filter => "filter",
            Self::Rotate => "rotate",
        };
        f.pad(name)
    }
}

/// Failure of an external tool, as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("{tool} tool exited with status {code}")]
    NonZeroExit { tool: ToolKind, code: i32 },

    #[error("{tool} tool was terminated by a signal")]
    Terminated { tool: ToolKind },

    #[error("{tool} tool timed out after {after:?}")]
    Timeout { tool: ToolKind, after: Duration },

    #[error("failed to launch {tool} tool: {message}")]
    Spawn { tool: ToolKind, message: String },

    #[error("failed waiting for {tool} tool: {message}")]
    Wait { tool: ToolKind, message: String },
}

/// Raw outcome of running a tool. Produced by every invoker, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    Exited(i32),
    Signaled,
    TimedOut(Duration),
    SpawnFailed(String),
    WaitFailed(String),
}

impl ToolStatus {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Interpret the status for `tool`.
    pub fn into_result(self, tool: ToolKind) -> Result<(), ToolError> {
        match self {
            Self::Exited(0) => Ok(()),
            Self::Exited(code) => Err(ToolError::NonZeroExit { tool, code }),
            Self::Signaled => Err(ToolError::Terminated { tool }),
            Self::TimedOut(after) => Err(ToolError::Timeout { tool, after }),
            Self::SpawnFailed(message) => Err(ToolError::Spawn { tool, message }),
            Self::WaitFailed(message) => Err(ToolError::Wait { tool, message }),
        }
    }

    fn from_exit(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::Exited(code),
            None => Self::Signaled,
        }
    }
}

/// A fully rendered command ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool: ToolKind,
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    /// Render `spec` by substituting `{input}`, `{output}` and `{odom}`.
    ///
    /// Placeholders without a value render as an empty string; arguments that
    /// end up empty are dropped. Substituted values are never rescanned.
    pub fn render(
        tool: ToolKind,
        spec: &ToolSpec,
        input: &Path,
        output: &Path,
        odometry: Option<&Path>,
    ) -> Self {
        let values = [
            ("{input}", input.display().to_string()),
            ("{output}", output.display().to_string()),
            (
                "{odom}",
                odometry.map(|p| p.display().to_string()).unwrap_or_default(),
            ),
        ];

        let args = spec
            .args
            .iter()
            .map(|arg| substitute(arg, &values))
            .filter(|arg| !arg.is_empty())
            .collect();

        Self {
            tool,
            program: spec.program.clone(),
            args,
            timeout: None,
        }
    }

    /// Append a literal argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs external tools. Implementations must not panic and must report every
/// outcome through [`ToolStatus`].
pub trait ToolInvoker: Send + Sync {
    fn invoke(&self, invocation: &ToolInvocation) -> ToolStatus;
}

/// Replace placeholders in one left-to-right pass.
fn substitute(arg: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        match values.iter().find(|(key, _)| rest.starts_with(key)) {
            Some((key, value)) => {
                out.push_str(value);
                rest = &rest[key.len()..];
            }
            None => {
                out.push('{');
                rest = &rest[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// Invoker backed by real child processes.
///
/// On unix each tool runs in its own process group, so a timeout kills any
/// helpers it forked as well.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker;

impl ProcessInvoker {
    pub fn new() -> Self {
        Self
    }
}

impl ToolInvoker for ProcessInvoker {
    fn invoke(&self, invocation: &ToolInvocation) -> ToolStatus {
        let tool = invocation.tool;
        debug!("[{}] {}", tool, invocation.command_line());

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return ToolStatus::SpawnFailed(e.to_string()),
        };

        // Drain both pipes while waiting so a chatty tool cannot block on a
        // full pipe buffer.
        let stdout = child.stdout.take().map(|s| forward_lines(tool, "stdout", s));
        let stderr = child.stderr.take().map(|s| forward_lines(tool, "stderr", s));

        let status = match invocation.timeout {
            Some(timeout) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => ToolStatus::from_exit(status),
                Ok(None) => {
                    warn!("[{}] timed out after {:?}, killing", tool, timeout);
                    kill_tree(&mut child);
                    ToolStatus::TimedOut(timeout)
                }
                Err(e) => {
                    kill_tree(&mut child);
                    ToolStatus::WaitFailed(e.to_string())
                }
            },
            None => match child.wait() {
                Ok(status) => ToolStatus::from_exit(status),
                Err(e) => ToolStatus::WaitFailed(e.to_string()),
            },
        };

        // A killed tool may leave a descendant outside its group holding the
        // pipes open; only wait for the readers after a normal exit.
        if matches!(status, ToolStatus::Exited(_) | ToolStatus::Signaled) {
            for handle in [stdout, stderr].into_iter().flatten() {
                let _ = handle.join();
            }
        }

        debug!("[{}] finished: {:?}", tool, status);
        status
    }
}

/// Kill the child together with everything in its process group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: killpg only sends a signal; the group was created at spawn.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn forward_lines<R: Read + Send + 'static>(
    tool: ToolKind,
    stream: &'static str,
    source: R,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(source).lines() {
            match line {
                Ok(line) => debug!("[{} {}] {}", tool, stream, line),
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_placeholders() {
        let spec = ToolSpec::new(
            "python3",
            &["filter.py", "{input}", "{odom}", "-o", "{output}"],
        );
        let invocation = ToolInvocation::render(
            ToolKind::Filter,
            &spec,
            Path::new("/s/A.las"),
            Path::new("/s/filtered.las"),
            Some(Path::new("/s/odom.txt")),
        );

        assert_eq!(invocation.program, "python3");
        assert_eq!(
            invocation.args,
            vec!["filter.py", "/s/A.las", "/s/odom.txt", "-o", "/s/filtered.las"]
        );
    }

    #[test]
    fn test_render_drops_empty_placeholder() {
        let spec = ToolSpec::new("rotate", &["{input}", "{odom}", "{output}"]);
        let invocation = ToolInvocation::render(
            ToolKind::Rotate,
            &spec,
            Path::new("in.las"),
            Path::new("out.las"),
            None,
        );

        assert_eq!(invocation.args, vec!["in.las", "out.las"]);
    }

    #[test]
    fn test_render_inline_placeholder() {
        let spec = ToolSpec::new("conv", &["--out={output}"]);
        let invocation = ToolInvocation::render(
            ToolKind::Convert,
            &spec,
            Path::new("a.pcd"),
            Path::new("a.las"),
            None,
        )
        .arg("--quiet");

        assert_eq!(invocation.args, vec!["--out=a.las", "--quiet"]);
        assert_eq!(invocation.command_line(), "conv --out=a.las --quiet");
    }

    #[test]
    fn test_render_does_not_rescan_substituted_paths() {
        let spec = ToolSpec::new("filter", &["{input}", "{odom}", "{output}"]);
        let invocation = ToolInvocation::render(
            ToolKind::Filter,
            &spec,
            Path::new("/data/{odom}/A.las"),
            Path::new("/data/{odom}/filtered.las"),
            Some(Path::new("/data/{odom}/odom.txt")),
        );

        assert_eq!(
            invocation.args,
            vec![
                "/data/{odom}/A.las",
                "/data/{odom}/odom.txt",
                "/data/{odom}/filtered.las"
            ]
        );
    }

    #[test]
    fn test_substitute_keeps_unknown_braces() {
        let values = [("{input}", "a.pcd".to_string())];
        assert_eq!(substitute("{x}{input}{", &values), "{x}a.pcd{");
        assert_eq!(substitute("plain", &values), "plain");
    }

    #[test]
    fn test_tool_kind_respects_width() {
        assert_eq!(format!("[{:<8}]", ToolKind::Filter), "[filter  ]");
    }

    #[test]
    fn test_status_into_result() {
        assert!(ToolStatus::Exited(0).into_result(ToolKind::Filter).is_ok());
        assert_eq!(
            ToolStatus::Exited(2).into_result(ToolKind::Filter),
            Err(ToolError::NonZeroExit {
                tool: ToolKind::Filter,
                code: 2
            })
        );
        assert!(matches!(
            ToolStatus::SpawnFailed("nope".into()).into_result(ToolKind::Convert),
            Err(ToolError::Spawn { .. })
        ));

        let wait = ToolStatus::WaitFailed("interrupted".into())
            .into_result(ToolKind::Rotate)
            .unwrap_err();
        assert_eq!(wait.to_string(), "failed waiting for rotate tool: interrupted");
    }

    #[test]
    fn test_spawn_failure_is_status() {
        let invocation = ToolInvocation {
            tool: ToolKind::Convert,
            program: "definitely-not-a-real-binary-7f3a".to_string(),
            args: Vec::new(),
            timeout: None,
        };

        let status = ProcessInvoker::new().invoke(&invocation);
        assert!(matches!(status, ToolStatus::SpawnFailed(_)));
    }

    #[cfg(unix)]
    fn sh(script: &str, timeout: Option<Duration>) -> ToolInvocation {
        ToolInvocation {
            tool: ToolKind::Filter,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_process_exit_codes() {
        let invoker = ProcessInvoker::new();
        assert_eq!(invoker.invoke(&sh("echo hello", None)), ToolStatus::Exited(0));
        assert_eq!(
            invoker.invoke(&sh("echo oops >&2; exit 3", None)),
            ToolStatus::Exited(3)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_process_timeout_kills_child() {
        let invoker = ProcessInvoker::new();
        let status = invoker.invoke(&sh("exec sleep 5", Some(Duration::from_millis(100))));
        assert_eq!(status, ToolStatus::TimedOut(Duration::from_millis(100)));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_forked_helpers() {
        let invoker = ProcessInvoker::new();
        let start = std::time::Instant::now();

        let status = invoker.invoke(&sh("sleep 4; true", Some(Duration::from_millis(200))));

        assert_eq!(status, ToolStatus::TimedOut(Duration::from_millis(200)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_large_output_does_not_block() {
        let invoker = ProcessInvoker::new();
        let status = invoker.invoke(&sh(
            "i=0; while [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done",
            Some(Duration::from_secs(30)),
        ));
        assert!(status.success());
    }
}
