//! Execution of commands and scripts on a system under test.
//!
//! The collection pipeline only ever talks to [`Executor`]; whether the SUT
//! is the local host or a machine behind ssh is decided once, when the
//! executor is built.

mod local;
mod remote;

use std::path::{Path, PathBuf};
use std::process::ExitStatus;

pub use local::LocalExecutor;
pub use remote::{RemoteExecutor, RemoteTarget};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to locate '{0}' in PATH")]
    MissingProgram(String),
    #[error("failed to run '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write script {}", .path.display())]
    WriteScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' exited with code {code}")]
    CommandFailed { command: String, code: i32 },
    #[error("failed to copy {what} (exit code {code})")]
    Transfer { what: String, code: i32 },
    #[error("cannot reach {host}: ssh exited with code {code}")]
    Unreachable { host: String, code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_code: i32,
}

pub trait Executor: Send + Sync {
    /// Runs a shell command line on the SUT and captures its stdout.
    fn run_command(&self, command: &str) -> Result<CommandOutput, Error>;

    /// Stores `body` as `file_name` in the working directory of the SUT,
    /// runs it with bash and waits for it to finish.
    fn run_script(&self, body: &str, file_name: &str) -> Result<i32, Error>;

    /// Directory on the SUT where scripts run and write their output.
    fn working_dir(&self) -> &Path;

    /// Local directory that holds the results once [`Executor::fetch_results`]
    /// returned.
    fn local_dir(&self) -> &Path;

    /// Copies everything produced in [`Executor::working_dir`] into
    /// [`Executor::local_dir`].
    fn fetch_results(&self) -> Result<(), Error> {
        Ok(())
    }

    fn run_checked(&self, command: &str) -> Result<String, Error> {
        let output = self.run_command(command)?;
        if output.exit_code != 0 {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                code: output.exit_code,
            });
        }
        Ok(output.stdout)
    }
}

/// Quotes `value` for safe interpolation into a POSIX shell command line.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    status.code().unwrap_or(-1)
}
