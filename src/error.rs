/*
 * error.rs
 *
 * Hard failures only. "still running" and "someone else is reaping" are
 * PollState values, not errors - polling loops shouldn't pay for a Result.
 *
 * Exit codes follow GNU conventions so the CLI slots into scripts that
 * already understand timeout(1):
 * 124 = timed out, 125 = our fault, 126 = not executable, 127 = not found
 */

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// exit codes per GNU coreutils convention. don't change these.
pub mod exit_codes {
    /// Command ran too long (timed out)
    pub const TIMEOUT: u8 = 124;
    /// popen itself failed (bad arguments, pipe/spawn failure)
    pub const INTERNAL_ERROR: u8 = 125;
    /// Command found but couldn't be executed (permissions)
    pub const CANNOT_INVOKE: u8 = 126;
    /// Command not found
    pub const NOT_FOUND: u8 = 127;
}

/* how many bytes of captured output a diagnostic shows */
const PREVIEW_BYTES: usize = 10;

/// Everything known about a finished (or abandoned) run: the argument
/// vector, the return code if one was collected, and whatever the pipes
/// produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failure {
    pub args: Vec<String>,
    pub returncode: Option<i32>,
    pub output: Vec<u8>,
    pub error: Vec<u8>,
}

impl Failure {
    #[must_use]
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            ..Self::default()
        }
    }
}

/* write at most PREVIEW_BYTES, marking the cut */
fn preview(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    if bytes.len() <= PREVIEW_BYTES {
        write!(f, "{}", String::from_utf8_lossy(bytes))
    } else {
        write!(f, "{}[...]", String::from_utf8_lossy(&bytes[..PREVIEW_BYTES]))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Arguments:")?;
        for arg in &self.args {
            if arg.is_empty() {
                write!(f, " \"\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        match self.returncode {
            Some(code) => write!(f, "\nReturn code: {code}")?,
            None => write!(f, "\nReturn code: none")?,
        }
        write!(f, "\nOutput: ")?;
        preview(f, &self.output)?;
        write!(f, "\nError: ")?;
        preview(f, &self.error)
    }
}

/* everything that can go wrong */
#[derive(Debug, Error)]
pub enum Error {
    /// Empty command, empty argv[0], NUL bytes, merge on the wrong stream.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A libc primitive failed. `call` names it.
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// Deadline passed. The child is still running unless the caller
    /// went through `check_output`/`call`, which kill it.
    #[error("timed out after {timeout:?}\n{failure}")]
    Timeout {
        timeout: Duration,
        failure: Box<Failure>,
    },

    /// `check_output` saw a non-zero return code.
    #[error("command returned non-zero exit status\n{0}")]
    CalledProcess(Box<Failure>),

    /// Lifecycle query against a `Popen` that was never started.
    #[error("process has not been started")]
    NotStarted,
}

impl Error {
    /* errno-carrying constructor, the common case after a -1 return */
    pub(crate) fn last_os(call: &'static str) -> Self {
        Self::Os {
            call,
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn os(call: &'static str, source: io::Error) -> Self {
        Self::Os { call, source }
    }

    pub(crate) fn from_errno(call: &'static str, errno: i32) -> Self {
        Self::Os {
            call,
            source: io::Error::from_raw_os_error(errno),
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Captured state attached to timeout and called-process errors.
    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Timeout { failure, .. } | Self::CalledProcess(failure) => Some(failure),
            _ => None,
        }
    }

    /* map errors to exit codes. 126 vs 127 matters to scripts. */
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Timeout { .. } => exit_codes::TIMEOUT,
            Self::Os { source, .. } => match source.raw_os_error() {
                Some(libc::ENOENT) => exit_codes::NOT_FOUND,
                Some(libc::EACCES | libc::EPERM | libc::ENOEXEC) => exit_codes::CANNOT_INVOKE,
                _ => exit_codes::INTERNAL_ERROR,
            },
            Self::CalledProcess(failure) => match failure.returncode {
                /* keep the child's own code when it fits an exit status */
                Some(code) if (1..=255).contains(&code) => code as u8,
                _ => exit_codes::INTERNAL_ERROR,
            },
            Self::InvalidArgument(_) | Self::NotStarted => exit_codes::INTERNAL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
