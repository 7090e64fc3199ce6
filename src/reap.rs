/*
 * reap.rs
 *
 * Exactly one waitpid success per child, however many threads ask.
 *
 * The Reaper lives in an Arc shared by the Process and every Watcher.
 * The status is a OnceLock: readers check it lock-free, and only whoever
 * holds `lock` may call waitpid. Losers of the race re-check after taking
 * the lock and find the winner's status waiting for them.
 *
 * Timed waits only ever try_lock, and drop the lock before sleeping, so a
 * blocked untimed waiter can't stretch someone else's deadline by more
 * than one backoff step.
 *
 * Last Arc gone with the child unreaped -> blocking waitpid in Drop. No
 * zombies, even if nobody ever called wait.
 */

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::time_math::{BACKOFF_START, backoff_sleep, next_backoff, remaining};

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// exit(code) or return from main
    Exited(i32),
    /// killed by this signal
    Signaled(i32),
    /// stopped by this signal
    Stopped(i32),
}

impl ExitStatus {
    /// Decode a raw waitpid status.
    #[must_use]
    pub fn from_raw(status: libc::c_int) -> Self {
        if libc::WIFSTOPPED(status) {
            Self::Stopped(libc::WSTOPSIG(status))
        } else if libc::WIFEXITED(status) {
            Self::Exited(libc::WEXITSTATUS(status))
        } else {
            Self::Signaled(libc::WTERMSIG(status))
        }
    }

    /// Single number: negative stop signal, exit code, or terminating
    /// signal number.
    #[must_use]
    pub const fn returncode(self) -> i32 {
        match self {
            Self::Stopped(sig) => -sig,
            Self::Exited(code) => code,
            Self::Signaled(sig) => sig,
        }
    }

    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }

    #[must_use]
    pub const fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            _ => None,
        }
    }

    #[must_use]
    pub const fn signal(self) -> Option<i32> {
        match self {
            Self::Signaled(sig) => Some(sig),
            _ => None,
        }
    }
}

/// Outcome of one non-blocking reap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Ended, with this returncode.
    Done(i32),
    /// Child hasn't terminated.
    StillActive,
    /// Another waiter holds the reap guard. Try again.
    LockMissed,
}

#[derive(Debug)]
pub(crate) struct Reaper {
    pid: libc::pid_t,
    lock: Mutex<()>,
    status: OnceLock<ExitStatus>,
    reaps: AtomicUsize,
}

impl Reaper {
    pub(crate) fn new(pid: libc::pid_t) -> Self {
        Self {
            pid,
            lock: Mutex::new(()),
            status: OnceLock::new(),
            reaps: AtomicUsize::new(0),
        }
    }

    pub(crate) fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub(crate) fn status(&self) -> Option<ExitStatus> {
        self.status.get().copied()
    }

    pub(crate) fn reap_count(&self) -> usize {
        self.reaps.load(Ordering::Acquire)
    }

    /* caller holds `lock` and has seen status unset */
    fn record(&self, raw: libc::c_int) -> ExitStatus {
        let status = ExitStatus::from_raw(raw);
        if self.status.set(status).is_ok() {
            self.reaps.fetch_add(1, Ordering::AcqRel);
            debug!("reaped pid {}: {status:?}", self.pid);
        }
        status
    }

    /* one waitpid under the lock. Ok(None) = WNOHANG and still running */
    fn reap_locked(&self, flags: libc::c_int) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.status() {
            return Ok(Some(status));
        }
        match waitpid(self.pid, flags)? {
            Some(raw) => Ok(Some(self.record(raw))),
            None => Ok(None),
        }
    }

    /// Block until the child ends.
    pub(crate) fn wait(&self) -> Result<ExitStatus> {
        if let Some(status) = self.status() {
            return Ok(status);
        }
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.reap_locked(0)? {
            Some(status) => Ok(status),
            /* waitpid(.., 0) only returns 0 with WNOHANG */
            None => Err(Error::os("waitpid", io::Error::from(io::ErrorKind::WouldBlock))),
        }
    }

    /// Wait until the child ends or `deadline` passes. Ok(None) = deadline.
    /// A None deadline waits forever, but still never blocks on the lock.
    pub(crate) fn wait_deadline(&self, deadline: Option<Instant>) -> Result<Option<ExitStatus>> {
        let mut step = BACKOFF_START;
        loop {
            if let Some(status) = self.status() {
                return Ok(Some(status));
            }
            /* guard lives only for this attempt, never across the sleep */
            let attempt = match self.lock.try_lock() {
                Ok(_guard) => self.reap_locked(libc::WNOHANG)?,
                Err(TryLockError::Poisoned(poisoned)) => {
                    let _guard = poisoned.into_inner();
                    self.reap_locked(libc::WNOHANG)?
                }
                Err(TryLockError::WouldBlock) => None,
            };
            if let Some(status) = attempt {
                return Ok(Some(status));
            }

            let left = match deadline {
                Some(deadline) => remaining(Instant::now(), deadline),
                None => Duration::MAX,
            };
            if left.is_zero() {
                return Ok(None);
            }
            let nap = backoff_sleep(step, left);
            trace!("pid {} still running, sleeping {nap:?}", self.pid);
            thread::sleep(nap);
            step = next_backoff(step);
        }
    }

    /// One attempt, no blocking anywhere.
    pub(crate) fn poll(&self) -> Result<PollState> {
        if let Some(status) = self.status() {
            return Ok(PollState::Done(status.returncode()));
        }
        let attempt = match self.lock.try_lock() {
            Ok(_guard) => self.reap_locked(libc::WNOHANG)?,
            Err(TryLockError::Poisoned(poisoned)) => {
                let _guard = poisoned.into_inner();
                self.reap_locked(libc::WNOHANG)?
            }
            Err(TryLockError::WouldBlock) => return Ok(PollState::LockMissed),
        };
        Ok(match attempt {
            Some(status) => PollState::Done(status.returncode()),
            None => PollState::StillActive,
        })
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if self.status.get().is_some() {
            return;
        }
        debug!("pid {} dropped while running, blocking until it exits", self.pid);
        if let Err(e) = waitpid(self.pid, 0) {
            warn!("final reap of pid {} failed: {e}", self.pid);
        }
    }
}

/*
 * waitpid with EINTR retry. Ok(Some(raw)) = reaped, Ok(None) = WNOHANG
 * and still running.
 *
 * ECHILD means someone outside this crate (a SIGCHLD=SIG_IGN setting, a
 * stray waitpid(-1)) took the status. Nothing left to collect; report 0.
 */
fn waitpid(pid: libc::pid_t, flags: libc::c_int) -> Result<Option<libc::c_int>> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status is a valid out-pointer
        let ret = unsafe { libc::waitpid(pid, &mut status, flags) };
        if ret == pid {
            return Ok(Some(status));
        }
        if ret == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => {
                debug!("pid {pid} already reaped elsewhere (ECHILD), treating as exit 0");
                return Ok(Some(0));
            }
            _ => return Err(Error::os("waitpid", err)),
        }
    }
}
