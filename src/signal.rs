/*
 * signal.rs
 *
 * "TERM", "SIGTERM", "term", "15" all mean the same thing. "SIGFOO" and
 * "999" mean nothing.
 *
 * One table, searched in order: TERM and KILL first since that's what
 * everybody sends. IOT is an alias for ABRT, so ABRT comes first and
 * wins the reverse lookup.
 */

use std::fmt;

use crate::error::{Error, Result};

const TABLE: &[(&str, i32)] = &[
    ("TERM", libc::SIGTERM),
    ("KILL", libc::SIGKILL),
    ("INT", libc::SIGINT),
    ("HUP", libc::SIGHUP),
    ("QUIT", libc::SIGQUIT),
    ("ABRT", libc::SIGABRT),
    ("IOT", libc::SIGABRT),
    ("USR1", libc::SIGUSR1),
    ("USR2", libc::SIGUSR2),
    ("ALRM", libc::SIGALRM),
    ("CONT", libc::SIGCONT),
    ("STOP", libc::SIGSTOP),
    ("TSTP", libc::SIGTSTP),
    ("PIPE", libc::SIGPIPE),
    ("CHLD", libc::SIGCHLD),
    ("SEGV", libc::SIGSEGV),
    ("BUS", libc::SIGBUS),
    ("FPE", libc::SIGFPE),
    ("ILL", libc::SIGILL),
    ("TRAP", libc::SIGTRAP),
    ("TTIN", libc::SIGTTIN),
    ("TTOU", libc::SIGTTOU),
    ("URG", libc::SIGURG),
    ("XCPU", libc::SIGXCPU),
    ("XFSZ", libc::SIGXFSZ),
    ("VTALRM", libc::SIGVTALRM),
    ("PROF", libc::SIGPROF),
    ("WINCH", libc::SIGWINCH),
    ("IO", libc::SIGIO),
    ("SYS", libc::SIGSYS),
];

/// A signal from the table. Always a valid number on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signal(i32);

impl Signal {
    pub const TERM: Self = Self(libc::SIGTERM);
    pub const KILL: Self = Self(libc::SIGKILL);
    pub const INT: Self = Self(libc::SIGINT);
    pub const HUP: Self = Self(libc::SIGHUP);

    /* only numbers we have a name for */
    #[must_use]
    pub fn try_from_raw(num: i32) -> Option<Self> {
        TABLE.iter().any(|&(_, n)| n == num).then_some(Self(num))
    }

    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Name without the SIG prefix, e.g. "TERM".
    #[must_use]
    pub fn name(self) -> &'static str {
        TABLE
            .iter()
            .find(|&&(_, n)| n == self.0)
            .map_or("?", |&(name, _)| name)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

/// Parse "TERM", "SIGKILL", "9", "hup".
///
/// # Examples
///
/// ```
/// use popen::signal::{parse_signal, Signal};
///
/// assert_eq!(parse_signal("TERM").unwrap(), Signal::TERM);
/// assert_eq!(parse_signal("sigkill").unwrap(), Signal::KILL);
/// assert_eq!(parse_signal("15").unwrap(), Signal::TERM);
/// ```
pub fn parse_signal(input: &str) -> Result<Signal> {
    let input = input.trim();

    if let Ok(num) = input.parse::<i32>() {
        return Signal::try_from_raw(num)
            .ok_or_else(|| Error::InvalidArgument(format!("invalid signal number: {num}")));
    }

    /* optional SIG prefix, any case */
    let name = match input.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("SIG") => &input[3..],
        _ => input,
    };

    TABLE
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(name))
        .map(|&(_, num)| Signal(num))
        .ok_or_else(|| Error::InvalidArgument(format!("unknown signal: {input}")))
}
