use crate::command::{Pipeline, Stage};
use crate::errors::{Result, ShellError};
use crate::lexer::Token;
use crate::redirect;

/// Constructs a [`Pipeline`] from a vector of tokens.
///
/// The token stream is split at every `|`; each part has its redirections
/// stripped and must leave a non-empty argv. Leading, trailing or doubled
/// pipes therefore produce `SyntaxError("empty pipeline stage")`. No file is
/// opened here.
pub fn build_pipeline(tokens: &[Token]) -> Result<Pipeline> {
    let mut stages = Vec::new();

    for part in tokens.split(|t| *t == Token::Pipe) {
        if part.is_empty() {
            return Err(ShellError::syntax("empty pipeline stage"));
        }
        let resolved = redirect::resolve(part)?;
        if resolved.argv.is_empty() {
            return Err(ShellError::syntax("empty pipeline stage"));
        }
        stages.push(Stage::new(resolved.argv, resolved.input, resolved.output));
    }

    Pipeline::new(stages).ok_or_else(|| ShellError::syntax("empty pipeline stage"))
}
