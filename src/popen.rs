/*
 * popen.rs
 *
 * The builder. Holds a Config until the first lifecycle call, then starts
 * a Process and forwards everything to it.
 *
 * Builder methods take self by value for chaining. Calling them after the
 * start has no effect: the config is already gone.
 *
 * wait/poll/communicate start the process if needed. Signals don't - a
 * signal to a process that doesn't exist is an error, not a reason to
 * create one.
 */

use std::mem;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;

use crate::communicate::Capture;
use crate::config::{Argv, Config};
use crate::error::{Error, Result};
use crate::process::{Process, State, Watcher};
use crate::reap::PollState;
use crate::stream::Redirect;

/// Configure, then run.
///
/// ```no_run
/// use popen::{Popen, Redirect};
///
/// let mut p = Popen::args(["echo", "hello"]).stdout(Redirect::Pipe);
/// let capture = p.communicate(None).unwrap();
/// assert_eq!(capture.output, b"hello\n");
/// assert_eq!(p.returncode(), Some(0));
/// ```
#[derive(Debug, Default)]
pub struct Popen {
    config: Config,
    process: Option<Process>,
}

impl Popen {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Single command string, split on whitespace. No quoting.
    #[must_use]
    pub fn command(cmd: impl Into<String>) -> Self {
        Self::new().argv(Argv::Shell(cmd.into()))
    }

    /// Literal argument vector.
    #[must_use]
    pub fn args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new().argv(Argv::Seq(args.into_iter().map(Into::into).collect()))
    }

    /// Wrap an already-built config.
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            process: None,
        }
    }

    /* true = builder call arrived too late */
    fn started(&self, what: &str) -> bool {
        if self.process.is_some() {
            warn!("{what} set after start, ignored");
            return true;
        }
        false
    }

    #[must_use]
    pub fn argv(mut self, argv: Argv) -> Self {
        if !self.started("argv") {
            self.config.argv = argv;
        }
        self
    }

    #[must_use]
    pub fn stdin(mut self, redirect: impl Into<Redirect>) -> Self {
        if !self.started("stdin") {
            self.config.stdin = redirect.into();
        }
        self
    }

    #[must_use]
    pub fn stdout(mut self, redirect: impl Into<Redirect>) -> Self {
        if !self.started("stdout") {
            self.config.stdout = redirect.into();
        }
        self
    }

    #[must_use]
    pub fn stderr(mut self, redirect: impl Into<Redirect>) -> Self {
        if !self.started("stderr") {
            self.config.stderr = redirect.into();
        }
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        if !self.started("cwd") {
            self.config.cwd = Some(dir.into());
        }
        self
    }

    /// Replace the child's environment with these `KEY=VALUE` entries.
    #[must_use]
    pub fn env<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.started("env") {
            self.config.env = entries.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Add one entry to the replacement environment.
    #[must_use]
    pub fn env_var(mut self, key: &str, value: &str) -> Self {
        if !self.started("env") {
            self.config.env.push(format!("{key}={value}"));
        }
        self
    }

    #[must_use]
    pub fn close_fds(mut self, close: bool) -> Self {
        if !self.started("close_fds") {
            self.config.close_fds = close;
        }
        self
    }

    /// Inverse of `close_fds`.
    #[must_use]
    pub fn inherit_handles(self, inherit: bool) -> Self {
        self.close_fds(!inherit)
    }

    #[must_use]
    pub fn restore_signals(mut self, restore: bool) -> Self {
        if !self.started("restore_signals") {
            self.config.restore_signals = restore;
        }
        self
    }

    /// Spawn now. Later calls return the running process.
    pub fn start(&mut self) -> Result<&Process> {
        if self.process.is_none() {
            let config = mem::take(&mut self.config);
            self.process = Some(Process::start(config)?);
        }
        self.process.as_ref().ok_or(Error::NotStarted)
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.process.as_ref().map_or(State::Initial, Process::state)
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(Process::pid)
    }

    #[must_use]
    pub fn returncode(&self) -> Option<i32> {
        self.process.as_ref().and_then(Process::returncode)
    }

    /// The argument vector, before or after start.
    #[must_use]
    pub fn arguments(&self) -> Vec<String> {
        match &self.process {
            Some(p) => p.args().to_vec(),
            None => self.config.argv.to_vec(),
        }
    }

    #[must_use]
    pub fn process(&self) -> Option<&Process> {
        self.process.as_ref()
    }

    /// Start if needed and hand over the process.
    pub fn into_process(mut self) -> Result<Process> {
        self.start()?;
        self.process.ok_or(Error::NotStarted)
    }

    /// Cloneable wait/signal handle, starting if needed.
    pub fn watcher(&mut self) -> Result<Watcher> {
        Ok(self.start()?.watcher())
    }

    pub fn wait(&mut self) -> Result<i32> {
        self.start()?.wait()
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<i32> {
        self.start()?.wait_timeout(timeout)
    }

    pub fn poll(&mut self) -> Result<PollState> {
        self.start()?.poll()
    }

    pub fn communicate(&mut self, input: Option<&[u8]>) -> Result<Capture> {
        self.start()?.communicate(input)
    }

    pub fn communicate_timeout(
        &mut self,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Capture> {
        self.start()?.communicate_timeout(input, timeout)
    }

    fn running(&self) -> Result<&Process> {
        self.process.as_ref().ok_or(Error::NotStarted)
    }

    pub fn send_signal(&self, sig: i32) -> Result<()> {
        self.running()?.send_signal(sig)
    }

    pub fn terminate(&self) -> Result<()> {
        self.running()?.terminate()
    }

    pub fn kill(&self) -> Result<()> {
        self.running()?.kill()
    }
}

#[cfg(test)]
#[cfg(not(miri))]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let p = Popen::command("echo hi");
        assert_eq!(p.state(), State::Initial);
        assert_eq!(p.pid(), None);
        assert_eq!(p.returncode(), None);
        assert_eq!(p.arguments(), vec!["echo", "hi"]);
    }

    #[test]
    fn test_signal_before_start() {
        let p = Popen::command("true");
        assert!(matches!(p.kill(), Err(Error::NotStarted)));
        assert!(matches!(p.send_signal(libc::SIGINT), Err(Error::NotStarted)));
    }

    #[test]
    fn test_wait_starts_lazily() {
        let mut p = Popen::args(["sh", "-c", "exit 2"]);
        assert_eq!(p.wait().unwrap(), 2);
        assert_eq!(p.state(), State::Ended);
        assert!(p.pid().is_some());
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut p = Popen::command("true");
        let first = p.start().unwrap().pid();
        let second = p.start().unwrap().pid();
        assert_eq!(first, second);
        p.wait().unwrap();
    }

    #[test]
    fn test_builder_after_start_ignored() {
        let mut p = Popen::args(["echo", "x"]);
        p.start().unwrap();
        let mut p = p.cwd("/nonexistent");
        assert_eq!(p.arguments(), vec!["echo", "x"]);
        assert_eq!(p.wait().unwrap(), 0);
    }

    #[test]
    fn test_inherit_handles_inverts() {
        let p = Popen::command("true").inherit_handles(true);
        assert!(!p.config.close_fds);
        let p = p.inherit_handles(false);
        assert!(p.config.close_fds);
    }

    #[test]
    fn test_env_var_builds_entries() {
        let p = Popen::command("true").env(["A=1"]).env_var("B", "2");
        assert_eq!(p.config.env, vec!["A=1", "B=2"]);
    }

    #[test]
    fn test_empty_command_fails_on_start() {
        let mut p = Popen::command("   ");
        assert!(matches!(p.wait(), Err(Error::InvalidArgument(_))));
        assert_eq!(p.state(), State::Initial);
    }
}
