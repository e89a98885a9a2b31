use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ExecError;

/// A command to execute: program, arguments, working directory and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// `sh -c <command>`
    pub fn shell(command: &str) -> Self {
        Self::new("sh").args(["-c", command])
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// How a command sees the image filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Isolation {
    /// Image paths are host paths.
    #[default]
    None,
    /// Working directories are mapped under `root`; `HOIST_ROOT` points at it.
    Rooted(PathBuf),
    /// The command runs in `chroot root`, changing into the image working directory first.
    Chroot(PathBuf),
}

impl CommandSpec {
    /// Rewrites the command so it runs against the image filesystem.
    pub fn isolate(self, isolation: &Isolation) -> Self {
        match isolation {
            Isolation::None => self,
            Isolation::Rooted(root) => {
                let cwd = self
                    .cwd
                    .map(|dir| root.join(dir.to_string_lossy().trim_start_matches('/')));
                let mut env = self.env;
                env.insert("HOIST_ROOT".to_owned(), root.display().to_string());
                Self { cwd, env, ..self }
            }
            Isolation::Chroot(root) => {
                let cwd = self
                    .cwd
                    .as_ref()
                    .map(|dir| dir.display().to_string())
                    .unwrap_or_else(|| "/".to_owned());
                let mut args = vec![
                    root.display().to_string(),
                    "/bin/sh".to_owned(),
                    "-c".to_owned(),
                    r#"cd "$1" && shift && exec "$@""#.to_owned(),
                    "sh".to_owned(),
                    cwd,
                    self.program,
                ];
                args.extend(self.args);
                Self {
                    program: "chroot".to_owned(),
                    args,
                    cwd: None,
                    env: self.env,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Abstraction over process execution for testability.
///
/// Production code uses [`RealExecutor`], tests use mockall-generated mocks.
#[allow(async_fn_in_trait)]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command and capture its output. A non-zero exit is an error.
    async fn exec(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError>;
}

/// Runs commands on the host with `tokio::process`.
pub struct RealExecutor;

impl CommandExecutor for RealExecutor {
    async fn exec(&self, command: &CommandSpec) -> Result<CommandOutput, ExecError> {
        use std::process::Stdio;

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        tracing::debug!(program = %command.program, args = ?command.args, "exec");
        let output = cmd.output().await.map_err(|e| ExecError::NotFound {
            program: command.program.clone(),
            source: e,
        })?;

        if output.status.success() {
            let stdout = String::from_utf8(output.stdout).map_err(|e| ExecError::InvalidUtf8 {
                program: command.program.clone(),
                source: e,
            })?;
            Ok(CommandOutput {
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        } else {
            Err(ExecError::CommandFailed {
                program: command.program.clone(),
                args: command.args.clone(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}
