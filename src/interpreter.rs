use crate::builtin::{BuiltinHandler, BuiltinRegistry, BuiltinStatus};
use crate::command::{ExitCode, Pipeline, Stage};
use crate::errors::{Result, ShellError};
use crate::executor::{PipelineExecutor, StageOutcome};
use crate::lexer;
use crate::parser;
use crate::redirect::{open_input, open_output};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::Write;
use tracing::{debug, info, warn};

/// Where a built pipeline is sent.
enum Route<'a> {
    /// Single stage naming a builtin: run in this process.
    Builtin(&'a dyn BuiltinHandler, &'a Stage),
    External,
}

/// Result of one interpreted line, as seen by the interpreter loop.
pub type Outcome = BuiltinStatus;

/// A minimal shell-like interpreter that runs builtins in-process and
/// everything else as a pipeline of external programs.
///
/// Example
/// ```
/// use pipesh::Interpreter;
/// let mut sh = Interpreter::default();
/// let outcome = sh.run_line("true | true");
/// assert!(outcome.continue_loop);
/// assert_eq!(outcome.status, 0);
/// ```
pub struct Interpreter {
    builtins: BuiltinRegistry,
    executor: PipelineExecutor,
    last_status: ExitCode,
}

impl Interpreter {
    /// Create an interpreter from a builtin registry and an executor.
    pub fn new(builtins: BuiltinRegistry, executor: PipelineExecutor) -> Self {
        Self {
            builtins,
            executor,
            last_status: 0,
        }
    }

    /// Status of the most recently interpreted line.
    pub fn last_status(&self) -> ExitCode {
        self.last_status
    }

    /// Interpret one line, propagating any error to the caller.
    ///
    /// A blank line is a successful no-op.
    pub fn execute(&mut self, line: &str) -> Result<Outcome> {
        let tokens = lexer::split_into_tokens(line);
        debug!(?tokens, "tokenized");
        if tokens.is_empty() {
            return Ok(Outcome::proceed(0));
        }
        let pipeline = parser::build_pipeline(&tokens)?;

        match self.dispatch(&pipeline) {
            Route::Builtin(handler, stage) => {
                info!(builtin = stage.program(), "running builtin");
                self.run_builtin(handler, stage)
            }
            Route::External => {
                info!(stages = pipeline.len(), "running pipeline");
                let report = self.executor.execute(&pipeline)?;
                let last = report.stages().len().saturating_sub(1);
                for (index, outcome) in report.stages()[..last].iter().enumerate() {
                    if let StageOutcome::Aborted(err) = outcome {
                        eprintln!("pipesh: stage {}: {}", index + 1, err);
                    }
                }
                let status = report.into_status()?;
                Ok(Outcome::proceed(status.code()))
            }
        }
    }

    /// Interpret one line; errors are reported on stderr and turned into a
    /// status. The interpreter itself never fails here.
    pub fn run_line(&mut self, line: &str) -> Outcome {
        let outcome = match self.execute(line) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "line failed");
                eprintln!("pipesh: {}", err);
                Outcome::proceed(err.status())
            }
        };
        self.last_status = outcome.status;
        outcome
    }

    /// Run lines in order until one asks the loop to stop.
    pub fn run_script<'a>(&mut self, lines: impl IntoIterator<Item = &'a str>) -> ExitCode {
        for line in lines {
            if !self.run_line(line).continue_loop {
                break;
            }
        }
        self.last_status
    }

    /// Interactive Read-Eval-Print Loop.
    ///
    /// `prompt` may contain `{cwd}`, replaced with the working directory
    /// before every line. Returns the status of the last line.
    pub fn repl(&mut self, prompt: &str) -> rustyline::Result<ExitCode> {
        let mut rl = DefaultEditor::new()?;

        loop {
            let readline = rl.readline(&render_prompt(prompt));
            match readline {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        rl.add_history_entry(line.as_str())?;
                    }
                    if !self.run_line(&line).continue_loop {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err),
            }
        }

        Ok(self.last_status)
    }

    fn dispatch<'a>(&'a self, pipeline: &'a Pipeline) -> Route<'a> {
        match pipeline.single() {
            Some(stage) => match self.builtins.get(stage.program()) {
                Some(handler) => Route::Builtin(handler, stage),
                None => Route::External,
            },
            None => Route::External,
        }
    }

    fn run_builtin(&self, handler: &dyn BuiltinHandler, stage: &Stage) -> Result<Outcome> {
        // No builtin reads stdin, but a bad `< path` still fails the line.
        if let Some(path) = stage.input() {
            open_input(path)?;
        }
        let status = match stage.output() {
            Some(path) => {
                let mut file = open_output(path)?;
                let status = handler.invoke(stage.argv(), &mut file, &self.builtins);
                flush(&mut file, path)?;
                status
            }
            None => {
                let mut stdout = std::io::stdout();
                let status = handler.invoke(stage.argv(), &mut stdout, &self.builtins);
                if let Err(err) = stdout.flush() {
                    warn!(error = %err, "flushing builtin output failed");
                }
                status
            }
        };
        Ok(status)
    }
}

fn flush(w: &mut dyn Write, path: &std::path::Path) -> Result<()> {
    w.flush().map_err(|source| ShellError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn render_prompt(template: &str) -> String {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "?".to_string());
    template.replace("{cwd}", &cwd)
}

impl Default for Interpreter {
    /// Default builtins, inherited stdin/stdout.
    fn default() -> Self {
        Self::new(BuiltinRegistry::default(), PipelineExecutor::default())
    }
}
