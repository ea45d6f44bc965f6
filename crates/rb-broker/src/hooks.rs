//! Shell-hook invocation.
//!
//! Every lifecycle transition is enacted by an external shell command run
//! under a fixed environment contract (`RESALLOC_*` variables). Combined
//! stdout and stderr are appended to a per-resource log file; allocation
//! and listing hooks additionally capture a bounded prefix of stdout.

use std::path::PathBuf;
use std::process::Stdio;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use rb_common::{BrokerError, Result};

/// Appended to captured stdout when the budget is exceeded in
/// non-secure-lines mode.
pub const TRIMMED_MARKER: &[u8] = b"<< trimmed >>\n";

const ENV_PREFIX: &str = "RESALLOC_";

/// Which log file a hook invocation appends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Alloc,
    Terminate,
    Release,
    Watch,
    List,
}

impl LogKind {
    fn as_str(&self) -> &'static str {
        match self {
            LogKind::Alloc => "alloc",
            LogKind::Terminate => "terminate",
            LogKind::Release => "release",
            LogKind::Watch => "watch",
            LogKind::List => "list",
        }
    }
}

/// The environment handed to a hook. Absent fields surface to the hook
/// as the literal string `"None"`.
#[derive(Debug, Clone)]
pub struct HookEnv<'a> {
    pub pool_id: &'a str,
    pub resource_id: i64,
    pub resource_name: Option<&'a str>,
    pub id_in_pool: Option<i64>,
    pub data: Option<&'a [u8]>,
}

/// Stdout capture settings. With `secure_lines` the captured output is
/// meant to be parsed, so it is only ever a whole-line prefix: no partial
/// line, no trim marker.
#[derive(Debug, Clone, Copy)]
pub struct Capture {
    pub budget: usize,
    pub secure_lines: bool,
}

#[derive(Debug)]
pub struct HookOutput {
    /// Hook exit code; non-zero is the hook's failure signal. A hook
    /// killed by a signal reports -1.
    pub status: i32,
    pub stdout: Vec<u8>,
}

impl HookOutput {
    pub fn succeeded(&self) -> bool {
        self.status == 0
    }
}

fn hook_err(e: std::io::Error) -> BrokerError {
    BrokerError::Hook(e.to_string())
}

/// Runs hooks and tees their output into `<logdir>/hooks/`.
#[derive(Clone)]
pub struct HookRunner {
    logdir: PathBuf,
}

impl HookRunner {
    pub fn new(logdir: impl Into<PathBuf>) -> Self {
        Self {
            logdir: logdir.into(),
        }
    }

    fn log_path(&self, resource_id: i64, kind: LogKind) -> PathBuf {
        self.logdir
            .join("hooks")
            .join(format!("{:06}_{}", resource_id, kind.as_str()))
    }

    fn command(&self, env: &HookEnv<'_>, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.env(format!("{}ID", ENV_PREFIX), env.resource_id.to_string());
        cmd.env(
            format!("{}NAME", ENV_PREFIX),
            env.resource_name.unwrap_or("None"),
        );
        cmd.env(format!("{}POOL_ID", ENV_PREFIX), env.pool_id);
        cmd.env(
            format!("{}ID_IN_POOL", ENV_PREFIX),
            env.id_in_pool
                .map(|id| id.to_string())
                .unwrap_or_else(|| "None".to_string()),
        );
        if let Some(data) = env.data {
            cmd.env(format!("{}RESOURCE_DATA", ENV_PREFIX), BASE64.encode(data));
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a hook. With `capture` set, stdout is read line by line: every
    /// line reaches the log, and lines are accumulated into the captured
    /// buffer while they fit the byte budget.
    pub async fn run(
        &self,
        env: &HookEnv<'_>,
        command: &str,
        kind: LogKind,
        capture: Option<Capture>,
    ) -> Result<HookOutput> {
        debug!(pool = %env.pool_id, resource = env.resource_id, command, "running hook");

        let path = self.log_path(env.resource_id, kind);
        std::fs::create_dir_all(self.logdir.join("hooks")).map_err(hook_err)?;
        let logfile = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(hook_err)?;

        let mut cmd = self.command(env, command);

        let Some(capture) = capture else {
            let stderr_log = logfile.try_clone().map_err(hook_err)?;
            cmd.stdout(Stdio::from(logfile)).stderr(Stdio::from(stderr_log));
            let status = cmd.status().await.map_err(hook_err)?;
            return Ok(HookOutput {
                status: status.code().unwrap_or(-1),
                stdout: Vec::new(),
            });
        };

        let stderr_log = logfile.try_clone().map_err(hook_err)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::from(stderr_log));
        let mut child = cmd.spawn().map_err(hook_err)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Hook("child stdout missing".to_string()))?;

        let mut reader = BufReader::new(stdout);
        let mut log = tokio::fs::File::from_std(logfile);
        let mut captured: Vec<u8> = Vec::new();
        let mut written = 0usize;
        let mut stopped = false;
        let mut line: Vec<u8> = Vec::new();

        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).await.map_err(hook_err)?;
            if n == 0 {
                break;
            }
            log.write_all(&line).await.map_err(hook_err)?;

            if stopped {
                continue;
            }
            if written + line.len() > capture.budget {
                if written == 0 && !capture.secure_lines {
                    // Even the first line overflows the buffer; keep at
                    // least its head.
                    captured.extend_from_slice(&line[..capture.budget]);
                }
                stopped = true;
                if !capture.secure_lines {
                    captured.extend_from_slice(TRIMMED_MARKER);
                }
                continue;
            }
            written += line.len();
            captured.extend_from_slice(&line);
        }
        log.flush().await.map_err(hook_err)?;

        let status = child.wait().await.map_err(hook_err)?;
        Ok(HookOutput {
            status: status.code().unwrap_or(-1),
            stdout: captured,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> (tempfile::TempDir, HookRunner) {
        let dir = tempfile::tempdir().unwrap();
        let runner = HookRunner::new(dir.path());
        (dir, runner)
    }

    fn env(resource_id: i64) -> HookEnv<'static> {
        HookEnv {
            pool_id: "pool0",
            resource_id,
            resource_name: Some("pool0_00000001"),
            id_in_pool: Some(0),
            data: None,
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_logs_it() {
        let (dir, runner) = runner();
        let out = runner
            .run(
                &env(1),
                "echo hello",
                LogKind::Alloc,
                Some(Capture {
                    budget: 512,
                    secure_lines: false,
                }),
            )
            .await
            .unwrap();
        assert!(out.succeeded());
        assert_eq!(out.stdout, b"hello\n");

        let log = std::fs::read(dir.path().join("hooks/000001_alloc")).unwrap();
        assert_eq!(log, b"hello\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let (_dir, runner) = runner();
        let out = runner.run(&env(1), "exit 3", LogKind::Release, None).await.unwrap();
        assert_eq!(out.status, 3);
        assert!(!out.succeeded());
    }

    #[tokio::test]
    async fn overflow_appends_trim_marker_but_logs_everything() {
        let (dir, runner) = runner();
        // Three 4-byte lines against an 8-byte budget: two lines fit.
        let out = runner
            .run(
                &env(2),
                "printf 'aaa\\nbbb\\nccc\\n'",
                LogKind::Alloc,
                Some(Capture {
                    budget: 8,
                    secure_lines: false,
                }),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, b"aaa\nbbb\n<< trimmed >>\n".to_vec());

        let log = std::fs::read(dir.path().join("hooks/000002_alloc")).unwrap();
        assert_eq!(log, b"aaa\nbbb\nccc\n");
    }

    #[tokio::test]
    async fn oversized_first_line_is_truncated() {
        let (_dir, runner) = runner();
        let out = runner
            .run(
                &env(3),
                "printf 'abcdefghij\\n'",
                LogKind::Alloc,
                Some(Capture {
                    budget: 4,
                    secure_lines: false,
                }),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, b"abcd<< trimmed >>\n".to_vec());
    }

    #[tokio::test]
    async fn secure_lines_never_emit_partial_output() {
        let (_dir, runner) = runner();
        let out = runner
            .run(
                &env(4),
                "printf 'one\\ntwo\\nthree\\n'",
                LogKind::List,
                Some(Capture {
                    budget: 8,
                    secure_lines: true,
                }),
            )
            .await
            .unwrap();
        // "one\n" + "two\n" fill the budget; "three\n" is dropped whole,
        // and no marker pollutes parseable output.
        assert_eq!(out.stdout, b"one\ntwo\n".to_vec());
    }

    #[tokio::test]
    async fn secure_lines_oversized_first_line_captures_nothing() {
        let (_dir, runner) = runner();
        let out = runner
            .run(
                &env(5),
                "printf 'abcdefghij\\n'",
                LogKind::List,
                Some(Capture {
                    budget: 4,
                    secure_lines: true,
                }),
            )
            .await
            .unwrap();
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn environment_contract() {
        let (_dir, runner) = runner();
        let hook_env = HookEnv {
            pool_id: "beta",
            resource_id: 7,
            resource_name: Some("beta_00000007"),
            id_in_pool: Some(2),
            data: Some(b"payload"),
        };
        let out = runner
            .run(
                &hook_env,
                "echo \"$RESALLOC_ID|$RESALLOC_NAME|$RESALLOC_POOL_ID|$RESALLOC_ID_IN_POOL|$RESALLOC_RESOURCE_DATA\"",
                LogKind::Watch,
                Some(Capture {
                    budget: 512,
                    secure_lines: false,
                }),
            )
            .await
            .unwrap();
        let expected = format!("7|beta_00000007|beta|2|{}\n", BASE64.encode(b"payload"));
        assert_eq!(out.stdout, expected.as_bytes());
    }

    #[tokio::test]
    async fn absent_fields_are_the_string_none() {
        let (_dir, runner) = runner();
        let hook_env = HookEnv {
            pool_id: "beta",
            resource_id: 0,
            resource_name: None,
            id_in_pool: None,
            data: None,
        };
        let out = runner
            .run(
                &hook_env,
                "echo \"$RESALLOC_NAME|$RESALLOC_ID_IN_POOL|${RESALLOC_RESOURCE_DATA-unset}\"",
                LogKind::Terminate,
                Some(Capture {
                    budget: 512,
                    secure_lines: false,
                }),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, b"None|None|unset\n".to_vec());
    }

    #[tokio::test]
    async fn log_files_append_across_invocations() {
        let (dir, runner) = runner();
        runner.run(&env(9), "echo first", LogKind::Watch, None).await.unwrap();
        runner.run(&env(9), "echo second 1>&2", LogKind::Watch, None).await.unwrap();
        let log = std::fs::read(dir.path().join("hooks/000009_watch")).unwrap();
        assert_eq!(log, b"first\nsecond\n");
    }

    #[tokio::test]
    async fn unknown_cleanup_logs_under_resource_zero() {
        let (dir, runner) = runner();
        let hook_env = HookEnv {
            pool_id: "beta",
            resource_id: 0,
            resource_name: Some("stray-vm"),
            id_in_pool: None,
            data: None,
        };
        runner.run(&hook_env, "true", LogKind::Terminate, None).await.unwrap();
        assert!(dir.path().join("hooks/000000_terminate").exists());
    }
}
