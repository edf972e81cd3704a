use std::process::{ExitStatus, Stdio};

use log::{debug, warn};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// The running probe daemon.
///
/// Spawned with `kill_on_drop`, so the process cannot outlive its handle.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    child: Child,
    program: String,
}

impl ProcessHandle {
    /// Launches `executable`, wrapped by `command_prefix` when one is given.
    ///
    /// # Errors
    /// Returns [`Error::Launch`] if the process cannot be started.
    pub(crate) fn start(
        executable: &str,
        command_prefix: &[String],
    ) -> Result<(Self, ChildStdin, ChildStdout)> {
        let (program, args): (&str, Vec<&str>) = match command_prefix.split_first() {
            Some((wrapper, rest)) => (
                wrapper.as_str(),
                rest.iter()
                    .map(String::as_str)
                    .chain(std::iter::once(executable))
                    .collect(),
            ),
            None => (executable, Vec::new()),
        };

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Launch {
                executable: program.into(),
                source,
            })?;
        debug!(
            "launched `{} {}` (pid {:?})",
            program,
            args.join(" "),
            child.id()
        );

        let stdin = captured(child.stdin.take(), "stdin")?;
        let stdout = captured(child.stdout.take(), "stdout")?;
        Ok((
            Self {
                child,
                program: program.into(),
            },
            stdin,
            stdout,
        ))
    }

    pub(crate) async fn wait_for_exit(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.map_err(|err| {
            Error::Process(format!("failed to wait for `{}`, reason: {}", self.program, err))
        })
    }

    /// Best effort: the process may already be gone.
    pub(crate) fn terminate(&mut self) {
        if let Err(err) = self.child.start_kill() {
            debug!("failed to kill `{}`, reason: {}", self.program, err);
        }
    }

    /// Waits for the process to exit, or kills it once `shutdown` fires.
    /// Fires `exited` either way.
    pub(crate) async fn supervise(mut self, shutdown: CancellationToken, exited: CancellationToken) {
        let status = tokio::select! {
            status = self.wait_for_exit() => status,
            _ = shutdown.cancelled() => {
                self.terminate();
                self.wait_for_exit().await
            }
        };
        match status {
            Ok(status) => debug!("`{}` exited with {}", self.program, status),
            Err(err) => warn!("{}", err),
        }
        exited.cancel();
    }
}

fn captured<T>(pipe: Option<T>, name: &str) -> Result<T> {
    pipe.ok_or_else(|| Error::Opaque(format!("{} of daemon process not captured", name).into()))
}
