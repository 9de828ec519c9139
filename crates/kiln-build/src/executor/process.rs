//! Run instructions as shell processes.

use std::process::Stdio;

use async_trait::async_trait;
use kiln_cache::referenced_args;
use tokio::process::Command;
use tracing::debug;

use super::{ExecContext, InstructionExecutor};
use crate::error::ExecError;
use crate::instruction::Instruction;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const STDERR_TAIL: usize = 2048;

/// Runs [`Instruction::Run`] with `<shell...> <command>` in the working
/// directory under the image root.
///
/// The environment is cleared and rebuilt from the stage config plus the
/// build arguments the command references; config values win over
/// arguments of the same name. The child is killed if the returned future
/// is dropped, which is how cancellation and timeouts stop it.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    shell: Vec<String>,
}

impl ProcessExecutor {
    /// Executor using `shell` (e.g. `["/bin/sh", "-c"]`).
    #[must_use]
    pub fn new(shell: Vec<String>) -> Self {
        Self { shell }
    }

    fn command(&self, ctx: &ExecContext, command: &str) -> Result<Command, ExecError> {
        let (program, args) = self
            .shell
            .split_first()
            .ok_or_else(|| ExecError::Unsupported {
                executor: "process",
                instruction: "empty shell configured".to_string(),
            })?;

        let workdir = ctx.host_path(ctx.config.workdir());
        std::fs::create_dir_all(&workdir).map_err(|e| ExecError::io(&workdir, e))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(command)
            .current_dir(&workdir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (name, value) in referenced_args(command, &ctx.build_args) {
            if let Some(value) = value {
                cmd.env(name, value);
            }
        }
        if !ctx.config.env().contains_key("PATH") {
            cmd.env("PATH", std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()));
        }
        cmd.envs(ctx.config.env());
        if let Some(user) = ctx.config.user() {
            cmd.env("USER", user);
        }
        Ok(cmd)
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(vec!["/bin/sh".to_string(), "-c".to_string()])
    }
}

#[async_trait]
impl InstructionExecutor for ProcessExecutor {
    async fn apply(&self, ctx: &ExecContext, instruction: &Instruction) -> Result<(), ExecError> {
        let Instruction::Run { command } = instruction else {
            return Err(ExecError::Unsupported {
                executor: self.name(),
                instruction: instruction.to_string(),
            });
        };

        let program = self.shell.first().cloned().unwrap_or_default();
        let child = self
            .command(ctx, command)?
            .spawn()
            .map_err(|source| ExecError::Spawn { program, source })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|e| ExecError::io(&ctx.root, e))?,
            () = ctx.cancel.cancelled() => return Err(ExecError::Canceled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            debug!(target: "kiln::run", "{line}");
        }

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let start = stderr.len().saturating_sub(STDERR_TAIL);
        let start = (start..stderr.len()).find(|i| stderr.is_char_boundary(*i)).unwrap_or(stderr.len());
        Err(ExecError::CommandFailed {
            command: command.clone(),
            status: output.status.code(),
            stderr: stderr[start..].trim_end().to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::StageConfig;

    fn context(root: &std::path::Path, config: StageConfig, args: &[(&str, &str)]) -> ExecContext {
        ExecContext {
            root: root.to_path_buf(),
            config,
            build_args: Arc::new(
                args.iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            context_dir: root.to_path_buf(),
            stage_roots: Arc::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[test_log::test(tokio::test)]
    async fn runs_in_workdir_with_env() {
        let root = tempdir().unwrap();
        let config = StageConfig::new().with_workdir("/app").with_env("GREETING", "hi");
        let ctx = context(root.path(), config, &[("NAME", "kiln"), ("UNUSED", "x")]);

        ProcessExecutor::default()
            .apply(&ctx, &Instruction::run("echo \"$GREETING $NAME ${UNUSED:-unset}\" > out.txt"))
            .await
            .unwrap();

        // `${UNUSED:-unset}` is not a plain reference, so UNUSED is not passed.
        let out = std::fs::read_to_string(root.path().join("app/out.txt")).unwrap();
        assert_eq!(out, "hi kiln unset\n");
    }

    #[test_log::test(tokio::test)]
    async fn nonzero_exit_is_reported() {
        let root = tempdir().unwrap();
        let ctx = context(root.path(), StageConfig::new(), &[]);
        let err = ProcessExecutor::default()
            .apply(&ctx, &Instruction::run("echo broken >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            ExecError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn cancel_stops_the_process() {
        let root = tempdir().unwrap();
        let ctx = context(root.path(), StageConfig::new(), &[]);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let err = ProcessExecutor::default()
            .apply(&ctx, &Instruction::run("sleep 30"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Canceled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn rejects_other_instructions() {
        let root = tempdir().unwrap();
        let ctx = context(root.path(), StageConfig::new(), &[]);
        let err = ProcessExecutor::default()
            .apply(&ctx, &Instruction::env("A", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Unsupported { .. }));
    }
}
