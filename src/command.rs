use std::fmt;
use std::path::{Path, PathBuf};

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

/// Exit code of a stage whose program could not be exec'd.
pub const EXEC_FAILED: ExitCode = 127;

/// One program invocation within a pipeline: argv plus optional redirections.
///
/// Paths are kept unopened; files are opened right before the stage is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    argv: Vec<String>,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
}

impl Stage {
    pub(crate) fn new(argv: Vec<String>, input: Option<PathBuf>, output: Option<PathBuf>) -> Self {
        debug_assert!(!argv.is_empty() && !argv[0].is_empty());
        Self { argv, input, output }
    }

    /// Program name, `argv[0]`.
    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn input(&self) -> Option<&Path> {
        self.input.as_deref()
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }
}

/// A non-empty, ordered sequence of stages connected by pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Returns `None` for an empty stage list.
    pub(crate) fn new(stages: Vec<Stage>) -> Option<Self> {
        if stages.is_empty() {
            None
        } else {
            Some(Self { stages })
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether there are no stages. A `Pipeline` from `new` always has one.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The only stage, when the pipeline has exactly one.
    pub fn single(&self) -> Option<&Stage> {
        match self.stages.as_slice() {
            [stage] => Some(stage),
            _ => None,
        }
    }
}

/// Terminal state of a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The process exited normally with the given code.
    Exited(ExitCode),
    /// The process was terminated by the given signal number.
    Signaled(i32),
    /// The program could not be started.
    SpawnFailed(String),
}

impl ExitStatus {
    /// Collapse into a shell-style integer status.
    ///
    /// Signals map to `128 + signal`, like POSIX shells report them.
    pub fn code(&self) -> ExitCode {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => 128 + signal,
            ExitStatus::SpawnFailed(_) => EXEC_FAILED,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with {code}"),
            ExitStatus::Signaled(signal) => write!(f, "killed by signal {signal}"),
            ExitStatus::SpawnFailed(reason) => write!(f, "failed to start: {reason}"),
        }
    }
}
