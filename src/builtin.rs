use crate::command::ExitCode;
use anyhow::{Context, Result};
use argh::{EarlyExit, FromArgs};
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::PathBuf;
use tracing::warn;

/// What a builtin hands back to the interpreter loop.
///
/// Loop termination travels in `continue_loop`, never in `status`: `exit 0`
/// and a failed `cd` are told apart by the flag alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinStatus {
    pub continue_loop: bool,
    pub status: ExitCode,
}

impl BuiltinStatus {
    /// Keep looping with the given status.
    pub fn proceed(status: ExitCode) -> Self {
        Self {
            continue_loop: true,
            status,
        }
    }

    /// Stop the interpreter loop with the given status.
    pub fn exit(status: ExitCode) -> Self {
        Self {
            continue_loop: false,
            status,
        }
    }
}

/// Object-safe handler stored in the [`BuiltinRegistry`].
///
/// Handlers run synchronously in the interpreter's own process.
pub trait BuiltinHandler {
    /// One-line summary shown by `help`.
    fn description(&self) -> &'static str;

    /// Run the builtin with its full argv (`argv[0]` is the builtin's name).
    fn invoke(
        &self,
        argv: &[String],
        stdout: &mut dyn Write,
        registry: &BuiltinRegistry,
    ) -> BuiltinStatus;
}

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed directly
/// in-process without spawning a child process.
pub trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "pwd" or "cd".
    fn name() -> &'static str;

    fn description() -> &'static str;

    /// Executes the command, writing any output to `stdout`.
    fn execute(self, stdout: &mut dyn Write, registry: &BuiltinRegistry) -> Result<BuiltinStatus>;
}

/// Adapts a [`BuiltinCommand`] into a registry entry.
pub struct Factory<T> {
    _phantom: PhantomData<T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: BuiltinCommand> BuiltinHandler for Factory<T> {
    fn description(&self) -> &'static str {
        T::description()
    }

    fn invoke(
        &self,
        argv: &[String],
        stdout: &mut dyn Write,
        registry: &BuiltinRegistry,
    ) -> BuiltinStatus {
        let args: Vec<&str> = argv.iter().skip(1).map(String::as_str).collect();
        let cmd = match T::from_args(&[T::name()], &args) {
            Ok(cmd) => cmd,
            Err(EarlyExit { output, status }) => {
                // `--help` lands here with Ok status.
                if let Err(err) = writeln!(stdout, "{}", output.trim_end()) {
                    warn!(builtin = T::name(), error = %err, "writing usage failed");
                }
                return BuiltinStatus::proceed(if status.is_err() { 1 } else { 0 });
            }
        };
        match cmd.execute(stdout, registry) {
            Ok(status) => status,
            Err(e) => {
                eprintln!("{:#}", e);
                BuiltinStatus::proceed(1)
            }
        }
    }
}

/// Immutable-once-built mapping from builtin name to handler.
pub struct BuiltinRegistry {
    entries: BTreeMap<&'static str, Box<dyn BuiltinHandler>>,
}

impl BuiltinRegistry {
    /// A registry with no builtins at all.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register `T` under its canonical name, replacing any earlier entry.
    pub fn with<T: BuiltinCommand + 'static>(self) -> Self {
        self.with_handler(T::name(), Box::new(Factory::<T>::default()))
    }

    pub fn with_handler(mut self, name: &'static str, handler: Box<dyn BuiltinHandler>) -> Self {
        self.entries.insert(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn BuiltinHandler> {
        self.entries.get(name).map(|h| h.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Names and descriptions, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.entries.iter().map(|(name, h)| (*name, h.description()))
    }
}

impl Default for BuiltinRegistry {
    /// The builtins the interpreter ships with: `cd`, `exit`, `help`, `pwd`.
    fn default() -> Self {
        Self::empty().with::<Cd>().with::<Exit>().with::<Help>().with::<Pwd>()
    }
}

#[derive(FromArgs)]
/// Change the current working directory.
/// If no target is provided, changes to the directory specified by the HOME environment variable.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute or relative to the current directory. Defaults to $HOME when omitted.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn description() -> &'static str {
        "change the working directory (default: $HOME)"
    }

    fn execute(self, _stdout: &mut dyn Write, _registry: &BuiltinRegistry) -> Result<BuiltinStatus> {
        let target = cd_target(self.target, env::var_os("HOME"))?;
        let canonical = fs::canonicalize(&target)
            .with_context(|| format!("cd: can't canonicalize {}", target.display()))?;

        env::set_current_dir(&canonical)
            .with_context(|| format!("cd: can't chdir to {}", canonical.display()))?;
        Ok(BuiltinStatus::proceed(0))
    }
}

/// An omitted or empty target means `home`.
fn cd_target(target: Option<String>, home: Option<OsString>) -> Result<PathBuf> {
    match target {
        Some(t) if !t.is_empty() => Ok(PathBuf::from(t)),
        _ => home
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("cd: no target and HOME not set")),
    }
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Pwd {}

impl BuiltinCommand for Pwd {
    fn name() -> &'static str {
        "pwd"
    }

    fn description() -> &'static str {
        "print the working directory"
    }

    fn execute(self, stdout: &mut dyn Write, _registry: &BuiltinRegistry) -> Result<BuiltinStatus> {
        let cwd = env::current_dir().context("pwd")?;
        writeln!(stdout, "{}", cwd.display())?;
        Ok(BuiltinStatus::proceed(0))
    }
}

#[derive(FromArgs)]
/// List the built-in commands.
pub struct Help {}

impl BuiltinCommand for Help {
    fn name() -> &'static str {
        "help"
    }

    fn description() -> &'static str {
        "list built-in commands"
    }

    fn execute(self, stdout: &mut dyn Write, registry: &BuiltinRegistry) -> Result<BuiltinStatus> {
        writeln!(stdout, "Built-in commands:")?;
        let width = registry.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
        for (name, description) in registry.iter() {
            writeln!(stdout, "  {:width$}  {}", name, description, width = width)?;
        }
        writeln!(stdout, "Anything else is run as a program found on $PATH.")?;
        Ok(BuiltinStatus::proceed(0))
    }
}

#[derive(FromArgs)]
/// Exit the shell.
pub struct Exit {
    #[argh(positional, default = "0")]
    /// status to exit with.
    pub code: ExitCode,
}

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn description() -> &'static str {
        "leave the shell with an optional status"
    }

    fn execute(self, _stdout: &mut dyn Write, _registry: &BuiltinRegistry) -> Result<BuiltinStatus> {
        Ok(BuiltinStatus::exit(self.code))
    }
}
