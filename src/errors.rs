//! Error taxonomy for the pipeline core.

use std::path::PathBuf;

use nix::unistd::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShellError {
    /// Malformed pipe/redirect token sequence. Nothing was spawned.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// A redirection target could not be opened.
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The process-creation primitive (pipe or fork) failed.
    #[error("stage {stage}: cannot spawn: {source}")]
    Spawn {
        stage: usize,
        #[source]
        source: nix::Error,
    },

    /// The target program could not be exec'd inside the child.
    #[error("{program}: {reason}")]
    Exec { program: String, reason: String },

    /// Reaping a child failed.
    #[error("wait for pid {pid} failed: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: nix::Error,
    },
}

impl ShellError {
    pub(crate) fn syntax(msg: impl Into<String>) -> Self {
        ShellError::Syntax(msg.into())
    }

    /// Status reported to the interpreter loop when this error ends a line.
    pub fn status(&self) -> i32 {
        match self {
            ShellError::Syntax(_) => 2,
            ShellError::Exec { .. } => 127,
            ShellError::Io { .. } | ShellError::Spawn { .. } | ShellError::Wait { .. } => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShellError>;
