use crate::error::ManagerError;
use crate::log_relay::LogRelay;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
        }
    }

    pub fn current_dir(mut self, dir: PathBuf) -> Self {
        self.cwd = Some(dir);
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> ManagerError {
        ManagerError::Spawn {
            program: self.program.clone(),
            source,
        }
    }
}

/// Runs the command with its output relayed; fails on non-zero exit.
pub async fn run_logged(spec: &CommandSpec, relay: &LogRelay) -> Result<(), ManagerError> {
    debug!(task_id = %relay.task_id(), cmd = %spec.display(), "running");
    let mut child = spec
        .command()
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spec.spawn_error(e))?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(ManagerError::Output {
            program: spec.program.clone(),
            reason: "output pipes unavailable".into(),
        });
    };
    let pump = relay.attach(stdout, stderr);
    let status = child.wait().await?;
    if let Err(e) = pump.await {
        warn!(task_id = %relay.task_id(), error = %e, "log relay aborted");
    }

    if status.success() {
        Ok(())
    } else {
        Err(ManagerError::ExitStatus {
            program: spec.program.clone(),
            status: status.to_string(),
        })
    }
}

/// Runs the command and collects its output. Exit status is left to the caller.
pub async fn capture(spec: &CommandSpec) -> Result<Output, ManagerError> {
    spec.command()
        .output()
        .await
        .map_err(|e| spec.spawn_error(e))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::log_relay::LogSink;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use uuid::Uuid;

    #[derive(Default)]
    struct Lines(Mutex<Vec<String>>);

    #[async_trait]
    impl LogSink for Lines {
        async fn flush(&self, _task_id: Uuid, lines: Vec<String>) {
            self.0.lock().extend(lines);
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn test_run_logged_relays_both_streams_and_reports_exit() {
        let sink = Arc::new(Lines::default());
        let relay = LogRelay::new(Uuid::new_v4(), sink.clone());
        let err = run_logged(&sh("echo out; echo err 1>&2; exit 3"), &relay)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::ExitStatus { .. }));

        let mut lines = sink.0.lock().clone();
        lines.sort();
        assert_eq!(lines, vec!["err".to_string(), "out".to_string()]);
    }

    #[tokio::test]
    async fn test_non_utf8_output_does_not_break_the_pipe() {
        let sink = Arc::new(Lines::default());
        let relay = LogRelay::new(Uuid::new_v4(), sink.clone());
        let script = "printf 'caf\\351\\n'; i=0; while [ $i -lt 4000 ]; do echo line $i; i=$((i+1)); done";
        run_logged(&sh(script), &relay).await.unwrap();

        let lines = sink.0.lock().clone();
        assert_eq!(lines.len(), 4001);
        assert_eq!(lines[0], "caf\u{FFFD}");
        assert_eq!(lines[4000], "line 3999");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let relay = LogRelay::new(Uuid::new_v4(), Arc::new(Lines::default()));
        let spec = CommandSpec::new("depsync-definitely-missing", vec![]);
        assert!(matches!(
            run_logged(&spec, &relay).await,
            Err(ManagerError::Spawn { .. })
        ));
    }

    #[test]
    fn test_display_joins_args() {
        let spec = CommandSpec::new("pip", vec!["install".into(), "-U".into(), "requests".into()]);
        assert_eq!(spec.display(), "pip install -U requests");
    }
}
