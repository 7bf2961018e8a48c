//! Redirection handling: stripping `<path` / `>path` pairs out of a stage at
//! parse time, and opening the referenced files right before spawn.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::errors::{Result, ShellError};
use crate::lexer::Token;

/// Mode for files created by `>`: rw-r--r-- (further reduced by the umask).
const CREATE_MODE: u32 = 0o644;

/// A stage's words with redirection pairs removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Resolved {
    pub argv: Vec<String>,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

/// Strip redirection operators and their targets from a stage's tokens.
///
/// A repeated redirection of the same direction overwrites the earlier one.
pub(crate) fn resolve(tokens: &[Token]) -> Result<Resolved> {
    let mut resolved = Resolved::default();
    let mut iter = tokens.iter();

    while let Some(token) = iter.next() {
        let slot = match token {
            Token::Word(w) => {
                resolved.argv.push(w.clone());
                continue;
            }
            Token::InputRedirect => &mut resolved.input,
            Token::OutputRedirect => &mut resolved.output,
            Token::Pipe => {
                return Err(ShellError::syntax("unexpected `|` inside a stage"));
            }
        };
        match iter.next() {
            Some(Token::Word(target)) => *slot = Some(PathBuf::from(target)),
            _ => return Err(ShellError::syntax("redirect missing target")),
        }
    }

    Ok(resolved)
}

/// Open an input redirection target for reading.
pub fn open_input(path: &Path) -> Result<File> {
    File::open(path).map_err(|source| ShellError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Open an output redirection target, creating it if absent and truncating
/// it if present.
pub fn open_output(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(CREATE_MODE)
        .open(path)
        .map_err(|source| ShellError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::split_into_tokens;
    use std::io::{Read, Write};

    #[test]
    fn test_strips_pairs_from_argv() {
        let resolved = resolve(&split_into_tokens("sort -r < in.txt > out.txt")).unwrap();
        assert_eq!(resolved.argv, ["sort", "-r"]);
        assert_eq!(resolved.input, Some(PathBuf::from("in.txt")));
        assert_eq!(resolved.output, Some(PathBuf::from("out.txt")));
    }

    #[test]
    fn test_redirect_before_program() {
        let resolved = resolve(&split_into_tokens("> log echo hi")).unwrap();
        assert_eq!(resolved.argv, ["echo", "hi"]);
        assert_eq!(resolved.output, Some(PathBuf::from("log")));
    }

    #[test]
    fn test_last_redirect_wins() {
        let resolved = resolve(&split_into_tokens("cat <a <b >c >d")).unwrap();
        assert_eq!(resolved.input, Some(PathBuf::from("b")));
        assert_eq!(resolved.output, Some(PathBuf::from("d")));
    }

    #[test]
    fn test_missing_target() {
        for line in ["cat <", "cat > <x", "echo > > out"] {
            match resolve(&split_into_tokens(line)) {
                Err(ShellError::Syntax(msg)) => assert_eq!(msg, "redirect missing target"),
                other => panic!("expected syntax error for {line:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_open_output_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        open_output(&path).unwrap().write_all(b"a much longer line").unwrap();
        open_output(&path).unwrap().write_all(b"X").unwrap();

        let mut s = String::new();
        File::open(&path).unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "X");
    }

    #[test]
    fn test_open_output_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh");
        open_output(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        // The umask may only remove bits.
        assert_eq!(mode & !CREATE_MODE, 0);
        assert_ne!(mode & 0o600, 0);
    }

    #[test]
    fn test_open_input_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_input(&dir.path().join("missing.txt")).unwrap_err();
        assert!(matches!(err, ShellError::Io { .. }));
    }
}
