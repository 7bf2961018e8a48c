//! The execution core of a small interactive command interpreter.
//!
//! A line is tokenized ([`lexer`]), split into a [`Pipeline`] of stages with
//! their redirections ([`parser`]), and then either run in-process as a
//! builtin ([`builtin`]) or handed to the [`PipelineExecutor`], which spawns
//! one process per stage and wires them together with pipes.
//!
//! The main entry point is [`Interpreter`].

pub mod builtin;
pub mod cli;
pub mod command;
pub mod errors;
pub mod executor;
mod interpreter;
pub mod lexer;
pub mod logging;
pub mod parser;
pub mod redirect;

pub use command::{ExitCode, ExitStatus, Pipeline, Stage};
pub use errors::ShellError;
pub use executor::{PipelineExecutor, PipelineReport, StageOutcome};
/// Just a convenient re-export of the interactive command runner.
///
/// See [`Interpreter`] for the high-level API and examples.
pub use interpreter::{Interpreter, Outcome};
