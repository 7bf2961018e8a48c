//! A module implementing lexical analysis (tokenization) of a command line.

use std::fmt;

/// Represents a token resulting from lexical analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A plain word: program name, argument or redirection target.
    Word(String),
    /// The pipe operator, `|`.
    Pipe,
    /// Input redirection symbol, `<`.
    InputRedirect,
    /// Output redirection symbol, `>`.
    OutputRedirect,
}

impl Token {
    /// The text this token was lexed from.
    pub fn as_str(&self) -> &str {
        match self {
            Token::Word(w) => w,
            Token::Pipe => "|",
            Token::InputRedirect => "<",
            Token::OutputRedirect => ">",
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whitespace recognised as a word separator (POSIX `isspace` in the C locale).
fn is_blank(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\r' | '\n' | '\x0b' | '\x0c')
}

fn operator(ch: char) -> Option<Token> {
    match ch {
        '|' => Some(Token::Pipe),
        '<' => Some(Token::InputRedirect),
        '>' => Some(Token::OutputRedirect),
        _ => None,
    }
}

struct Lexer<'a> {
    input: std::str::Chars<'a>,
    buffer: String,
    out: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(line: &'a str) -> Self {
        Lexer {
            input: line.chars(),
            buffer: String::new(),
            out: Vec::new(),
        }
    }

    fn make_tokens(mut self) -> Vec<Token> {
        while let Some(ch) = self.input.next() {
            if is_blank(ch) {
                self.finish_word();
            } else if let Some(op) = operator(ch) {
                // Operators split words even without surrounding blanks: `a|b`.
                self.finish_word();
                self.out.push(op);
            } else {
                self.buffer.push(ch);
            }
        }
        self.finish_word();
        self.out
    }

    fn finish_word(&mut self) {
        if !self.buffer.is_empty() {
            self.out.push(Token::Word(std::mem::take(&mut self.buffer)));
        }
    }
}

/// Split a raw line into words and operator tokens.
///
/// Blank or empty input yields an empty vector. There is no quoting or
/// escaping: `|`, `<` and `>` are always operators.
pub fn split_into_tokens(line: &str) -> Vec<Token> {
    Lexer::new(line).make_tokens()
}
