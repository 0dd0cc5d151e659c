use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, error, Span};

use crate::{exit_code, CommandOutput, Error, Executor};

/// Runs everything on the host hperf itself runs on.
pub struct LocalExecutor {
    test_dir: PathBuf,
    span: Span,
}

impl LocalExecutor {
    pub fn new(test_dir: impl Into<PathBuf>, span: Span) -> Self {
        LocalExecutor {
            test_dir: test_dir.into(),
            span,
        }
    }
}

impl Executor for LocalExecutor {
    fn run_command(&self, command: &str) -> Result<CommandOutput, Error> {
        let _enter = self.span.enter();
        debug!(command, "run command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.test_dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| Error::Spawn {
                program: "sh".to_string(),
                source,
            })?;

        if !output.stderr.is_empty() {
            debug!(stderr = %String::from_utf8_lossy(&output.stderr).trim_end(), "command stderr");
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: exit_code(output.status),
        })
    }

    fn run_script(&self, body: &str, file_name: &str) -> Result<i32, Error> {
        let _enter = self.span.enter();

        let path = self.test_dir.join(file_name);
        fs::write(&path, body).map_err(|source| Error::WriteScript {
            path: path.clone(),
            source,
        })?;
        debug!(script = %path.display(), "run script");

        let status = Command::new("bash")
            .arg(&path)
            .current_dir(&self.test_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|source| Error::Spawn {
                program: "bash".to_string(),
                source,
            })?;

        let code = exit_code(status);
        if code != 0 {
            error!(script = %path.display(), code, "script failed");
        } else {
            debug!(script = %path.display(), "script finished");
        }
        Ok(code)
    }

    fn working_dir(&self) -> &Path {
        &self.test_dir
    }

    fn local_dir(&self) -> &Path {
        &self.test_dir
    }
}
