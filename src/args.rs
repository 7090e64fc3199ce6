/*
 * args.rs
 *
 * Clap derive macros handle parsing. Life's too short to do this by hand.
 *
 * Every flag maps onto one Popen builder call, so the CLI is a thin,
 * scriptable window onto the library: try a redirect combination here
 * before writing the Rust for it.
 *
 * trailing_var_arg grabs everything after COMMAND so `popen -t 5 grep -r`
 * doesn't try to parse grep's flags.
 */

use std::path::PathBuf;

use clap::Parser;

use crate::popen::Popen;
use crate::stream::Redirect;

#[derive(Parser, Debug)]
#[command(
    name = "popen",
    version,
    about = "Run a command with redirected streams and an optional time limit",
    long_about = "Start COMMAND with the requested stdin/stdout/stderr wiring and wait for it.\n\n\
                  DURATION is a floating-point number with optional suffix:\n\
                  'ms' for milliseconds, 's' for seconds (default), 'm' for minutes,\n\
                  'h' for hours, 'd' for days. A duration of 0 disables the timeout.\n\n\
                  On timeout SIGNAL is sent, then SIGKILL after --kill-after if the\n\
                  command is still running.",
    after_help = "Exit status:\n\
                  124 if COMMAND times out\n\
                  125 if popen itself fails\n\
                  126 if COMMAND is found but cannot be invoked\n\
                  127 if COMMAND cannot be found\n\
                  128+N if COMMAND is killed by signal N\n\
                  the exit status of COMMAND otherwise"
)]
pub struct Args {
    /// Time limit for the whole run. 0 = none.
    #[arg(
        short = 't',
        long = "timeout",
        value_name = "DURATION",
        default_value = "0",
        env = "POPEN_TIMEOUT"
    )]
    pub timeout: String,

    /// Signal sent on timeout. Name ('TERM', 'SIGHUP') or number.
    #[arg(short = 's', long = "signal", default_value = "TERM", value_name = "SIGNAL")]
    pub signal: String,

    /// Grace period between SIGNAL and SIGKILL.
    #[arg(short = 'k', long = "kill-after", default_value = "1s", value_name = "DURATION")]
    pub kill_after: String,

    /// Run COMMAND in this directory.
    #[arg(short = 'C', long = "cwd", value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Replace the environment. Repeat for each KEY=VALUE.
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Treat COMMAND and ARGs as one string split on whitespace.
    #[arg(long = "shell")]
    pub shell: bool,

    /// Pipe TEXT into the command's stdin, then close it.
    #[arg(long = "input", value_name = "TEXT", conflicts_with = "null_stdin")]
    pub input: Option<String>,

    /// Connect stdin to /dev/null.
    #[arg(long = "null-stdin")]
    pub null_stdin: bool,

    /// Capture stdout/stderr through pipes and print them after the command ends.
    #[arg(long = "capture")]
    pub capture: bool,

    /// Send the command's stderr wherever its stdout goes.
    #[arg(long = "merge-stderr", conflicts_with = "null_stderr")]
    pub merge_stderr: bool,

    /// Discard the command's stderr.
    #[arg(long = "null-stderr")]
    pub null_stderr: bool,

    /// Let the command inherit our open descriptors above 2.
    #[arg(long = "keep-fds")]
    pub keep_fds: bool,

    /// Leave SIGPIPE/SIGXFSZ as we have them instead of resetting to default.
    #[arg(long = "keep-signals")]
    pub keep_signals: bool,

    /// Log spawn, reap and signal activity to stderr.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Command to run.
    #[arg(value_name = "COMMAND", required = true, allow_hyphen_values = true)]
    pub command: String,

    /// Arguments for the command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARG")]
    pub args: Vec<String>,
}

impl Args {
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Parse an argument list that excludes the program name. Help and
    /// version requests come back as errors instead of exiting.
    pub fn try_parse_from_slice(args: &[String]) -> Result<Self, clap::Error> {
        Self::try_parse_from(std::iter::once("popen").chain(args.iter().map(String::as_str)))
    }

    /// Does the run need communicate rather than a plain wait?
    #[must_use]
    pub fn needs_communicate(&self) -> bool {
        self.capture || self.input.is_some()
    }

    /// The configured, not yet started Popen.
    #[must_use]
    pub fn popen(&self) -> Popen {
        let mut popen = if self.shell {
            let mut line = self.command.clone();
            for arg in &self.args {
                line.push(' ');
                line.push_str(arg);
            }
            Popen::command(line)
        } else {
            Popen::args(std::iter::once(&self.command).chain(&self.args).cloned())
        };

        if let Some(dir) = &self.cwd {
            popen = popen.cwd(dir);
        }
        if !self.env.is_empty() {
            popen = popen.env(self.env.iter().cloned());
        }

        if self.input.is_some() {
            popen = popen.stdin(Redirect::Pipe);
        } else if self.null_stdin {
            popen = popen.stdin(Redirect::Null);
        }

        if self.capture {
            popen = popen.stdout(Redirect::Pipe);
        }
        if self.merge_stderr {
            popen = popen.stderr(Redirect::Merge);
        } else if self.null_stderr {
            popen = popen.stderr(Redirect::Null);
        } else if self.capture {
            popen = popen.stderr(Redirect::Pipe);
        }

        popen
            .close_fds(!self.keep_fds)
            .restore_signals(!self.keep_signals)
    }
}
