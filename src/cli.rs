//! Command-line arguments for the `pipesh` binary.

use argh::FromArgs;

/// Prompt used when `--prompt` is not given; mirrors `<cwd>> `.
pub const DEFAULT_PROMPT: &str = "{cwd}> ";

#[derive(FromArgs, Debug)]
/// A small interactive shell: builtins, pipes and `<` / `>` redirections.
pub struct Args {
    #[argh(option, short = 'c')]
    /// run a single command line and exit with its status
    pub command: Option<String>,

    #[argh(option)]
    /// log verbosity: error, warn, info, debug or trace (default: $PIPESH_LOG, then warn)
    pub log_level: Option<LogLevel>,

    #[argh(option, default = "DEFAULT_PROMPT.to_string()")]
    /// prompt template; `{cwd}` is replaced with the working directory
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}
