/*
 * runner.rs
 *
 * check_output and call: the two "just run it" entry points.
 *
 * Their contract is what makes them convenient - callers see either a
 * result or a definitive failure, never a half-dead child:
 *
 *   timeout          -> kill, grab trailing output, reap, return Timeout
 *   other failure    -> kill, reap, return it
 *   non-zero exit    -> CalledProcess with everything captured
 *   lock contention  -> retried here, never surfaces
 */

use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::communicate::Capture;
use crate::error::{Error, Failure, Result};
use crate::popen::Popen;
use crate::process::Process;
use crate::reap::PollState;
use crate::stream::Redirect;

/* how long a killed child gets to flush what's left in its pipes */
const TRAILING_GRACE: Duration = Duration::from_millis(100);
/* pause between polls that lost the reap lock */
const POLL_RETRY: Duration = Duration::from_micros(50);

fn communicate(process: &Process, input: Option<&[u8]>, timeout: Option<Duration>) -> Result<Capture> {
    match timeout {
        Some(t) => process.communicate_timeout(input, t),
        None => process.communicate(input),
    }
}

/* best effort: kill, then reap so nothing blocks on drop */
fn kill_and_reap(process: &Process) {
    if let Err(e) = process.kill() {
        warn!("failed to kill pid {}: {e}", process.pid());
    }
    if let Err(e) = process.wait() {
        warn!("failed to reap pid {}: {e}", process.pid());
    }
}

/* poll until there's a real answer; lock contention is just noise here */
fn settle(process: &Process) -> Result<i32> {
    loop {
        match process.poll()? {
            PollState::Done(code) => return Ok(code),
            PollState::LockMissed | PollState::StillActive => thread::sleep(POLL_RETRY),
        }
    }
}

/// Run to completion with stdout piped and return what it printed.
///
/// `input` goes to stdin if the Popen pipes it. With a `timeout` the
/// whole exchange is bounded; on expiry the child is killed.
pub fn check_output(popen: Popen, input: Option<&[u8]>, timeout: Option<Duration>) -> Result<Vec<u8>> {
    let process = popen.stdout(Redirect::Pipe).into_process()?;

    let capture = match communicate(&process, input, timeout) {
        Ok(capture) => capture,
        Err(Error::Timeout {
            timeout,
            mut failure,
        }) => {
            debug!("check_output: pid {} timed out, killing", process.pid());
            if let Err(e) = process.kill() {
                warn!("failed to kill pid {}: {e}", process.pid());
            }
            /* whatever the child flushed before dying */
            match process.communicate_timeout(None, TRAILING_GRACE) {
                Ok(rest) => {
                    failure.output.extend_from_slice(&rest.output);
                    failure.error.extend_from_slice(&rest.error);
                }
                Err(Error::Timeout { failure: rest, .. }) => {
                    failure.output.extend_from_slice(&rest.output);
                    failure.error.extend_from_slice(&rest.error);
                }
                Err(e) => warn!("could not collect trailing output: {e}"),
            }
            if let Err(e) = process.wait() {
                warn!("failed to reap pid {}: {e}", process.pid());
            }
            failure.returncode = process.returncode();
            return Err(Error::Timeout { timeout, failure });
        }
        Err(e) => {
            kill_and_reap(&process);
            return Err(e);
        }
    };

    let code = settle(&process)?;
    if code != 0 {
        return Err(Error::CalledProcess(Box::new(Failure {
            args: process.args().to_vec(),
            returncode: Some(code),
            output: capture.output,
            error: capture.error,
        })));
    }
    Ok(capture.output)
}

/// Run and return the raw return code. No capture.
///
/// On timeout the child is killed and reaped before the error comes back.
pub fn call(mut popen: Popen, timeout: Option<Duration>) -> Result<i32> {
    let Some(timeout) = timeout else {
        return popen.wait();
    };
    match popen.wait_timeout(timeout) {
        Err(e) if e.is_timeout() => {
            if let Some(process) = popen.process() {
                debug!("call: pid {} timed out, killing", process.pid());
                kill_and_reap(process);
            }
            Err(e)
        }
        other => other,
    }
}
