use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, error, info, Span};

use crate::{exit_code, shell_quote, CommandOutput, Error, Executor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
    pub identity: Option<PathBuf>,
}

impl RemoteTarget {
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// Drives a remote SUT through the system `ssh` and `scp` clients.
///
/// Authentication is left to the user's ssh configuration; connections run
/// in batch mode so a missing key fails instead of prompting.
pub struct RemoteExecutor {
    target: RemoteTarget,
    remote_dir: PathBuf,
    local_dir: PathBuf,
    ssh: PathBuf,
    scp: PathBuf,
    span: Span,
}

impl RemoteExecutor {
    /// Locates the ssh client and prepares `remote_dir` on the target.
    pub fn connect(
        target: RemoteTarget,
        remote_dir: impl Into<PathBuf>,
        local_dir: impl Into<PathBuf>,
        span: Span,
    ) -> Result<Self, Error> {
        let ssh = which::which("ssh").map_err(|_| Error::MissingProgram("ssh".to_string()))?;
        let scp = which::which("scp").map_err(|_| Error::MissingProgram("scp".to_string()))?;

        let executor = RemoteExecutor::with_programs(target, remote_dir, local_dir, ssh, scp, span);

        let mkdir = format!(
            "mkdir -p {}",
            shell_quote(&executor.remote_dir.to_string_lossy())
        );
        let output = executor.run_command(&mkdir)?;
        if output.exit_code != 0 {
            return Err(Error::Unreachable {
                host: executor.target.host.clone(),
                code: output.exit_code,
            });
        }

        {
            let _enter = executor.span.enter();
            info!(
                host = %executor.target.host,
                dir = %executor.remote_dir.display(),
                "remote test directory"
            );
        }

        Ok(executor)
    }

    fn with_programs(
        target: RemoteTarget,
        remote_dir: impl Into<PathBuf>,
        local_dir: impl Into<PathBuf>,
        ssh: PathBuf,
        scp: PathBuf,
        span: Span,
    ) -> Self {
        RemoteExecutor {
            target,
            remote_dir: remote_dir.into(),
            local_dir: local_dir.into(),
            ssh,
            scp,
            span,
        }
    }

    fn ssh_args(&self, command: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-p".into(),
            self.target.port.to_string().into(),
        ];
        if let Some(identity) = &self.target.identity {
            args.push("-i".into());
            args.push(identity.into());
        }
        args.push(self.target.destination().into());
        args.push(command.into());
        args
    }

    fn scp_args(&self, from: OsString, to: OsString) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-q".into(),
            "-r".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-P".into(),
            self.target.port.to_string().into(),
        ];
        if let Some(identity) = &self.target.identity {
            args.push("-i".into());
            args.push(identity.into());
        }
        args.push(from);
        args.push(to);
        args
    }

    fn remote_path(&self, path: &Path) -> OsString {
        format!("{}:{}", self.target.destination(), path.display()).into()
    }

    fn copy(&self, what: &str, from: OsString, to: OsString) -> Result<(), Error> {
        debug!(what, "scp");
        let status = Command::new(&self.scp)
            .args(self.scp_args(from, to))
            .stdin(Stdio::null())
            .status()
            .map_err(|source| Error::Spawn {
                program: self.scp.display().to_string(),
                source,
            })?;

        let code = exit_code(status);
        if code != 0 {
            return Err(Error::Transfer {
                what: what.to_string(),
                code,
            });
        }
        Ok(())
    }
}

impl Executor for RemoteExecutor {
    fn run_command(&self, command: &str) -> Result<CommandOutput, Error> {
        let _enter = self.span.enter();
        debug!(host = %self.target.host, command, "run remote command");

        let output = Command::new(&self.ssh)
            .args(self.ssh_args(command))
            .stdin(Stdio::null())
            .output()
            .map_err(|source| Error::Spawn {
                program: self.ssh.display().to_string(),
                source,
            })?;

        if !output.stderr.is_empty() {
            debug!(stderr = %String::from_utf8_lossy(&output.stderr).trim_end(), "remote stderr");
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: exit_code(output.status),
        })
    }

    fn run_script(&self, body: &str, file_name: &str) -> Result<i32, Error> {
        let _enter = self.span.enter();

        // keep a local copy next to the results
        let local_path = self.local_dir.join(file_name);
        fs::write(&local_path, body).map_err(|source| Error::WriteScript {
            path: local_path.clone(),
            source,
        })?;

        let remote_path = self.remote_dir.join(file_name);
        self.copy(
            file_name,
            local_path.clone().into_os_string(),
            self.remote_path(&remote_path),
        )?;

        let command = format!("bash {}", shell_quote(&remote_path.to_string_lossy()));
        let code = self.run_command(&command)?.exit_code;
        if code != 0 {
            error!(host = %self.target.host, script = %remote_path.display(), code, "script failed");
        } else {
            debug!(host = %self.target.host, script = %remote_path.display(), "script finished");
        }
        Ok(code)
    }

    fn working_dir(&self) -> &Path {
        &self.remote_dir
    }

    fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    fn fetch_results(&self) -> Result<(), Error> {
        let _enter = self.span.enter();
        info!(host = %self.target.host, "pulling results");

        let mut destination = self.local_dir.clone().into_os_string();
        destination.push("/");
        self.copy(
            "results",
            self.remote_path(&self.remote_dir.join("*")),
            destination,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(identity: Option<PathBuf>) -> RemoteExecutor {
        let target = RemoteTarget {
            host: "sut.example".to_string(),
            user: Some("bench".to_string()),
            port: 2222,
            identity,
        };
        RemoteExecutor::with_programs(
            target,
            "/tmp/hperf/20240101_test001",
            "/home/me/results",
            PathBuf::from("ssh"),
            PathBuf::from("scp"),
            Span::none(),
        )
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn destination_includes_user() {
        let mut target = executor(None).target;
        assert_eq!(target.destination(), "bench@sut.example");
        target.user = None;
        assert_eq!(target.destination(), "sut.example");
    }

    #[test]
    fn ssh_runs_in_batch_mode() {
        let args = strings(executor(None).ssh_args("lscpu"));
        assert_eq!(
            args,
            vec!["-o", "BatchMode=yes", "-p", "2222", "bench@sut.example", "lscpu"]
        );
    }

    #[test]
    fn scp_passes_identity_and_port() {
        let exec = executor(Some(PathBuf::from("/keys/id_ed25519")));
        let from = exec.remote_path(Path::new("/tmp/hperf/20240101_test001/*"));
        let args = strings(exec.scp_args(from, "/home/me/results/".into()));
        assert_eq!(
            args,
            vec![
                "-q",
                "-r",
                "-o",
                "BatchMode=yes",
                "-P",
                "2222",
                "-i",
                "/keys/id_ed25519",
                "bench@sut.example:/tmp/hperf/20240101_test001/*",
                "/home/me/results/",
            ]
        );
    }

    #[test]
    fn reports_both_directories() {
        let exec = executor(None);
        assert_eq!(exec.working_dir(), Path::new("/tmp/hperf/20240101_test001"));
        assert_eq!(exec.local_dir(), Path::new("/home/me/results"));
    }
}
