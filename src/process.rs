/*
 * process.rs
 *
 * A started child. Process owns the parent-side pipe ends; Watcher is the
 * cheap, cloneable part (pid, args, shared reaper) that other threads
 * hold to wait, poll or signal.
 *
 * Process and Watcher are Send + Sync. Pipe ends sit behind mutexes and
 * are taken out for the duration of a communicate, so two concurrent
 * communicates never read the same pipe: the second finds it gone.
 *
 * Fields drop in declaration order: the pipe ends go first, so a child
 * waiting on stdin EOF (or blocked on a full stdout) can finish before the
 * last Watcher reaps it.
 *
 * State only moves forward. There is no Initial here - a Process exists
 * only once spawn succeeded. Popen is the one with an Initial state.
 */

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::debug;

use crate::communicate::{Capture, Pipes, drain, drain_until};
use crate::config::{Config, validate_argv, validate_env};
use crate::error::{Error, Failure, Result};
use crate::handle::Handle;
use crate::reap::{ExitStatus, PollState, Reaper};
use crate::spawn::SpawnPlan;
use crate::stream::resolve_all;
use crate::time_math::deadline_after;

/// Lifecycle position. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Initial,
    Started,
    Ended,
}

/// Shareable view of a running child: wait, poll, signal.
#[derive(Debug, Clone)]
pub struct Watcher {
    reaper: Arc<Reaper>,
    args: Arc<[String]>,
}

impl Watcher {
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.reaper.pid() as u32
    }

    /// Argument vector the child was started with.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn state(&self) -> State {
        if self.reaper.status().is_some() {
            State::Ended
        } else {
            State::Started
        }
    }

    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.reaper.status()
    }

    /// Stored return code, once ended.
    #[must_use]
    pub fn returncode(&self) -> Option<i32> {
        self.reaper.status().map(ExitStatus::returncode)
    }

    /// How many times waitpid actually collected this child. 0 or 1.
    #[must_use]
    pub fn reap_count(&self) -> usize {
        self.reaper.reap_count()
    }

    /// Block until the child ends. Returns the return code.
    pub fn wait(&self) -> Result<i32> {
        self.reaper.wait().map(ExitStatus::returncode)
    }

    /// Wait at most `timeout`. On timeout the child keeps running.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<i32> {
        match self.reaper.wait_deadline(deadline_after(Instant::now(), timeout))? {
            Some(status) => Ok(status.returncode()),
            None => {
                debug!("pid {} still running after {timeout:?}", self.pid());
                Err(self.timeout(timeout, Capture::default()))
            }
        }
    }

    /// One non-blocking reap attempt.
    pub fn poll(&self) -> Result<PollState> {
        self.reaper.poll()
    }

    /// kill(2). No-op once ended; a child that vanished meanwhile is fine too.
    ///
    /// The ended check and the kill are not atomic: if another thread reaps
    /// in between and the pid is reused straight away, the signal reaches
    /// the new process. Signal from the thread that waits to rule that out.
    pub fn send_signal(&self, sig: i32) -> Result<()> {
        if self.reaper.status().is_some() {
            return Ok(());
        }
        // SAFETY: kill takes plain integers
        if unsafe { libc::kill(self.reaper.pid(), sig) } < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                /* already dead */
                return Ok(());
            }
            return Err(Error::os("kill", err));
        }
        debug!("sent signal {sig} to pid {}", self.pid());
        Ok(())
    }

    /// SIGTERM.
    pub fn terminate(&self) -> Result<()> {
        self.send_signal(libc::SIGTERM)
    }

    /// SIGKILL.
    pub fn kill(&self) -> Result<()> {
        self.send_signal(libc::SIGKILL)
    }

    pub(crate) fn failure(&self, capture: Capture) -> Failure {
        Failure {
            args: self.args.to_vec(),
            returncode: self.returncode(),
            output: capture.output,
            error: capture.error,
        }
    }

    pub(crate) fn timeout(&self, timeout: Duration, capture: Capture) -> Error {
        Error::Timeout {
            timeout,
            failure: Box::new(self.failure(capture)),
        }
    }
}

/// A spawned child plus the parent ends of its pipes.
#[derive(Debug)]
pub struct Process {
    stdin: Mutex<Option<Handle>>,
    stdout: Mutex<Option<Handle>>,
    stderr: Mutex<Option<Handle>>,
    /* input a timed-out communicate did not get to send */
    unsent: Mutex<Option<Vec<u8>>>,
    watcher: Watcher,
}

fn take(slot: &Mutex<Option<Handle>>) -> Option<Handle> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

fn put(slot: &Mutex<Option<Handle>>, handle: Option<Handle>) {
    if handle.is_some() {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = handle;
    }
}

impl Process {
    /// Validate, resolve redirects, spawn. Child-facing handles are closed
    /// in the parent before this returns.
    pub fn start(config: Config) -> Result<Self> {
        let args = config.argv.to_vec();
        validate_argv(&args)?;
        validate_env(&config.env)?;

        let [input, output, error] = resolve_all(config.stdin, config.stdout, config.stderr)?;
        let stdio = [&input, &output, &error].map(|ep| ep.child.as_ref().map(Handle::id));
        let plan = SpawnPlan::new(
            &args,
            &config.env,
            config.cwd.as_deref(),
            stdio,
            config.close_fds,
            config.restore_signals,
        )?;
        let pid = plan.spawn()?;

        /* the child has its copies now; ours would only hold pipes open */
        drop(input.child);
        drop(output.child);
        drop(error.child);

        Ok(Self {
            stdin: Mutex::new(input.parent),
            stdout: Mutex::new(output.parent),
            stderr: Mutex::new(error.parent),
            unsent: Mutex::new(None),
            watcher: Watcher {
                reaper: Arc::new(Reaper::new(pid)),
                args: args.into(),
            },
        })
    }

    /// A cloneable handle for waiting/signalling from other threads.
    #[must_use]
    pub fn watcher(&self) -> Watcher {
        self.watcher.clone()
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.watcher.pid()
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        self.watcher.args()
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.watcher.state()
    }

    #[must_use]
    pub fn returncode(&self) -> Option<i32> {
        self.watcher.returncode()
    }

    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.watcher.exit_status()
    }

    #[must_use]
    pub fn reap_count(&self) -> usize {
        self.watcher.reap_count()
    }

    pub fn wait(&self) -> Result<i32> {
        self.watcher.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<i32> {
        self.watcher.wait_timeout(timeout)
    }

    pub fn poll(&self) -> Result<PollState> {
        self.watcher.poll()
    }

    pub fn send_signal(&self, sig: i32) -> Result<()> {
        self.watcher.send_signal(sig)
    }

    pub fn terminate(&self) -> Result<()> {
        self.watcher.terminate()
    }

    pub fn kill(&self) -> Result<()> {
        self.watcher.kill()
    }

    /// Parent end of the stdin pipe, if there is one and nobody took it.
    pub fn take_stdin(&self) -> Option<Handle> {
        take(&self.stdin)
    }

    pub fn take_stdout(&self) -> Option<Handle> {
        take(&self.stdout)
    }

    pub fn take_stderr(&self) -> Option<Handle> {
        take(&self.stderr)
    }

    fn take_pipes(&self) -> Pipes {
        Pipes {
            stdin: self.take_stdin(),
            stdout: self.take_stdout(),
            stderr: self.take_stderr(),
        }
    }

    fn put_back(&self, pipes: Pipes) {
        put(&self.stdin, pipes.stdin);
        put(&self.stdout, pipes.stdout);
        put(&self.stderr, pipes.stderr);
    }

    /* the unsent tail of an earlier input wins over a new one */
    fn resume_input(&self, input: Option<&[u8]>) -> Option<Vec<u8>> {
        let unsent = self.unsent.lock().unwrap_or_else(PoisonError::into_inner).take();
        if unsent.is_some() && input.is_some() {
            debug!("pid {}: resuming earlier input, new input ignored", self.pid());
        }
        unsent
    }

    /// Send `input`, close stdin, read stdout/stderr to EOF, wait.
    /// Pipes already consumed (by an earlier call or take_*) are skipped,
    /// so calling this again after the end just returns an empty capture.
    ///
    /// After a timed-out `communicate_timeout`, the input it did not get to
    /// send is sent here instead of `input`.
    pub fn communicate(&self, input: Option<&[u8]>) -> Result<Capture> {
        let unsent = self.resume_input(input);
        let capture = drain(self.take_pipes(), unsent.as_deref().or(input))?;
        self.wait()?;
        Ok(capture)
    }

    /// Like communicate, bounded by `timeout` overall. On timeout the
    /// error carries what was read so far, the child keeps running, and
    /// unfinished pipes go back in place for a later call to finish. The
    /// later call picks up the input where this one stopped.
    pub fn communicate_timeout(&self, input: Option<&[u8]>, timeout: Duration) -> Result<Capture> {
        let Some(deadline) = deadline_after(Instant::now(), timeout) else {
            return self.communicate(input);
        };
        let unsent = self.resume_input(input);
        let input = unsent.as_deref().or(input);
        let drained = drain_until(self.take_pipes(), input, deadline)?;
        if drained.timed_out {
            if drained.leftover.stdin.is_some() {
                let tail = input.unwrap_or_default()[drained.written..].to_vec();
                *self.unsent.lock().unwrap_or_else(PoisonError::into_inner) = Some(tail);
            }
            self.put_back(drained.leftover);
            debug!("communicate with pid {} timed out after {timeout:?}", self.pid());
            return Err(self.watcher.timeout(timeout, drained.capture));
        }
        match self.watcher.reaper.wait_deadline(Some(deadline))? {
            Some(_) => Ok(drained.capture),
            None => Err(self.watcher.timeout(timeout, drained.capture)),
        }
    }
}
