use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Splits a SQL script into statements in one forward pass.
///
/// * `;` ends a statement, except that `;;` is folded into one literal `;`
///   (trigger bodies use it).
/// * `#` and `--` start a comment running to the end of the line.
/// * `/* ... */` comments are stripped; `/*! ... */` vendor hints are kept.
/// * Inside `'...'` or `"..."` nothing is special, and a backslash escaped or
///   doubled quote does not close the string.
///
/// Statements are trimmed and empty ones dropped. An unterminated string or
/// block comment is a [`ErrorKind::StatementFormat`] error.
pub fn tokenize(script: &str) -> DarwinResult<Vec<String>> {
    StatementScanner::new(script).scan()
}

struct StatementScanner<'a> {
    chars: Peekable<Chars<'a>>,
    state: ScanState,
    current: String,
    statements: Vec<String>,
    line: usize,
    opened_at: usize,
}

impl<'a> StatementScanner<'a> {
    fn new(script: &'a str) -> Self {
        StatementScanner {
            chars: script.chars().peekable(),
            state: ScanState::Code,
            current: String::new(),
            statements: Vec::new(),
            line: 1,
            opened_at: 1,
        }
    }

    fn scan(mut self) -> DarwinResult<Vec<String>> {
        while let Some(c) = self.chars.next() {
            if c == '\n' {
                self.line += 1;
            }

            match self.state {
                ScanState::Code => self.code(c),
                ScanState::Quoted(quote) => self.quoted(c, quote),
                ScanState::LineComment => {
                    if c == '\n' {
                        self.current.push('\n');
                        self.state = ScanState::Code;
                    }
                }
                ScanState::BlockComment => {
                    if c == '*' && self.next_is('/') {
                        self.chars.next();
                        self.current.push(' ');
                        self.state = ScanState::Code;
                    }
                }
            }
        }

        match self.state {
            ScanState::Quoted(quote) => Err(DarwinError::new(
                &format!("Unterminated {} quoted string starting at line {}", quote, self.opened_at),
                ErrorKind::StatementFormat,
            )),
            ScanState::BlockComment => Err(DarwinError::new(
                &format!("Unterminated block comment starting at line {}", self.opened_at),
                ErrorKind::StatementFormat,
            )),
            _ => {
                self.flush();
                Ok(self.statements)
            }
        }
    }

    fn code(&mut self, c: char) {
        match c {
            '\'' | '"' => {
                self.current.push(c);
                self.opened_at = self.line;
                self.state = ScanState::Quoted(c);
            }
            '#' => self.state = ScanState::LineComment,
            '-' if self.next_is('-') => {
                self.chars.next();
                self.state = ScanState::LineComment;
            }
            '/' if self.next_is('*') => {
                self.chars.next();
                if self.next_is('!') {
                    // vendor hint, kept as statement text
                    self.current.push_str("/*");
                } else {
                    self.opened_at = self.line;
                    self.state = ScanState::BlockComment;
                }
            }
            ';' => {
                if self.next_is(';') {
                    self.chars.next();
                    self.current.push(';');
                } else {
                    self.flush();
                }
            }
            _ => self.current.push(c),
        }
    }

    fn quoted(&mut self, c: char, quote: char) {
        self.current.push(c);
        if c == '\\' {
            if let Some(escaped) = self.chars.next() {
                if escaped == '\n' {
                    self.line += 1;
                }
                self.current.push(escaped);
            }
        } else if c == quote {
            if self.next_is(quote) {
                self.chars.next();
                self.current.push(quote);
            } else {
                self.state = ScanState::Code;
            }
        }
    }

    fn flush(&mut self) {
        let statement = self.current.trim();
        if !statement.is_empty() && statement != ";" {
            self.statements.push(statement.to_string());
        }
        self.current.clear();
    }

    #[inline]
    fn next_is(&mut self, expected: char) -> bool {
        self.chars.peek() == Some(&expected)
    }
}
