//! External program launched in place of an in-process body.

use std::os::unix::process::CommandExt;
use std::process::Command;

use regex::Regex;

use crate::bus::SOCKET_ENV;
use crate::models::template::ROLE_ENV;
use crate::{AppError, Result};

/// Tokens: single-quoted, double-quoted, or bare runs of non-whitespace.
const TOKEN_PATTERN: &str = r#"'[^']*'|"[^"]*"|\S+"#;

/// A parsed command line; no shell is involved when it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    raw: String,
    program: String,
    args: Vec<String>,
}

impl ExternalCommand {
    /// Parse a command line.
    ///
    /// Quoted tokens keep embedded whitespace and lose their quotes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the line is empty or chains commands
    /// with `&&` or `||` outside quotes.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::Config("external command must not be empty".into()));
        }

        let pattern = Regex::new(TOKEN_PATTERN)
            .map_err(|err| AppError::Config(format!("command tokenizer: {err}")))?;

        let mut tokens = Vec::new();
        for found in pattern.find_iter(trimmed) {
            let token = found.as_str();
            let quoted = is_quoted(token);
            if !quoted && (token.contains("&&") || token.contains("||")) {
                return Err(AppError::Config(format!(
                    "command chaining is not supported: '{trimmed}'"
                )));
            }
            let token = if quoted {
                &token[1..token.len() - 1]
            } else {
                token
            };
            tokens.push(token.to_owned());
        }

        let mut tokens = tokens.into_iter();
        let program = tokens
            .next()
            .ok_or_else(|| AppError::Config("external command must not be empty".into()))?;

        Ok(Self {
            raw: trimmed.to_owned(),
            program,
            args: tokens.collect(),
        })
    }

    /// The command line as configured.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Program to execute.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments after the program.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Replace the current process image with the program.
    ///
    /// Only returns when the replacement failed.
    #[must_use]
    pub fn exec(&self) -> AppError {
        let err = Command::new(&self.program)
            .args(&self.args)
            .env_remove(ROLE_ENV)
            .env_remove(SOCKET_ENV)
            .exec();
        AppError::Supervision(format!("cannot execute '{}': {err}", self.raw))
    }
}

fn is_quoted(token: &str) -> bool {
    token.len() >= 2
        && ((token.starts_with('\'') && token.ends_with('\''))
            || (token.starts_with('"') && token.ends_with('"')))
}
