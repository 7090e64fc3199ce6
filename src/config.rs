/*
 * config.rs
 *
 * The not-yet-started process. Plain data, mutated freely until start
 * takes it by value. Validation happens there, not here, so a builder
 * chain never has to deal with Results.
 */

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::stream::Redirect;

/// Either one command string split on whitespace, or literal arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argv {
    Shell(String),
    Seq(Vec<String>),
}

impl Default for Argv {
    fn default() -> Self {
        Self::Seq(Vec::new())
    }
}

impl Argv {
    /// The argument vector the child will see.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Shell(cmd) => split_command(cmd),
            Self::Seq(args) => args.clone(),
        }
    }
}

/// Split on spaces and tabs. No quoting, no escapes: `"a b"` is two words.
#[must_use]
pub fn split_command(cmd: &str) -> Vec<String> {
    cmd.split([' ', '\t'])
        .filter(|word| !word.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Everything start() needs.
#[derive(Debug)]
pub struct Config {
    pub argv: Argv,
    /// None = inherit ours.
    pub cwd: Option<PathBuf>,
    /// `KEY=VALUE` entries. Empty = inherit our environment.
    pub env: Vec<String>,
    pub stdin: Redirect,
    pub stdout: Redirect,
    pub stderr: Redirect,
    /// Close every inherited descriptor above 2 in the child.
    pub close_fds: bool,
    /// Reset SIGPIPE/SIGXFSZ to SIG_DFL in the child.
    pub restore_signals: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            argv: Argv::default(),
            cwd: None,
            env: Vec::new(),
            stdin: Redirect::Inherit,
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
            close_fds: true,
            restore_signals: true,
        }
    }
}

/* non-empty argv with a non-empty program */
pub(crate) fn validate_argv(args: &[String]) -> Result<()> {
    match args.first() {
        None => Err(Error::InvalidArgument("no command given".into())),
        Some(program) if program.is_empty() => {
            Err(Error::InvalidArgument("empty program name".into()))
        }
        Some(_) => Ok(()),
    }
}

/* KEY=VALUE with a non-empty key */
pub(crate) fn validate_env(env: &[String]) -> Result<()> {
    for entry in env {
        match entry.split_once('=') {
            Some((key, _)) if !key.is_empty() => {}
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "environment entry '{entry}' is not KEY=VALUE"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command_whitespace() {
        assert_eq!(split_command("ls  -l\t/tmp "), vec!["ls", "-l", "/tmp"]);
        assert!(split_command(" \t ").is_empty());
    }

    #[test]
    fn test_split_command_no_quoting() {
        assert_eq!(split_command("echo \"a b\""), vec!["echo", "\"a", "b\""]);
    }

    #[test]
    fn test_argv_seq_is_literal() {
        let argv = Argv::Seq(vec!["echo".into(), "a b".into(), String::new()]);
        assert_eq!(argv.to_vec(), vec!["echo", "a b", ""]);
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert!(cfg.close_fds);
        assert!(cfg.restore_signals);
        assert!(cfg.cwd.is_none());
        assert!(cfg.env.is_empty());
        assert!(matches!(cfg.stdout, Redirect::Inherit));
    }

    #[test]
    fn test_validate_argv() {
        assert!(validate_argv(&[]).is_err());
        assert!(validate_argv(&[String::new(), "x".into()]).is_err());
        assert!(validate_argv(&["true".into()]).is_ok());
    }

    #[test]
    fn test_validate_env() {
        assert!(validate_env(&["A=1".into(), "B=".into(), "C=x=y".into()]).is_ok());
        assert!(validate_env(&["NOEQUALS".into()]).is_err());
        assert!(validate_env(&["=value".into()]).is_err());
    }
}
