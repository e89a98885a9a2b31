#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start {program}: is it installed?")]
    NotFound {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} {args:?} exited with {}\n{stderr}", format_status(*status))]
    CommandFailed {
        program: String,
        args: Vec<String>,
        /// Exit code, `None` when the process was killed by a signal
        status: Option<i32>,
        stderr: String,
    },

    #[error("{program} output was not valid UTF-8")]
    InvalidUtf8 {
        program: String,
        source: std::string::FromUtf8Error,
    },
}

impl ExecError {
    /// Exit code of a command that ran and failed.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            ExecError::CommandFailed { status, .. } => *status,
            _ => None,
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            ExecError::CommandFailed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

fn format_status(status: Option<i32>) -> String {
    match status {
        Some(code) => format!("status {code}"),
        None => "a signal".to_owned(),
    }
}
