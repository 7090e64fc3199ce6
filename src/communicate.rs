/*
 * communicate.rs
 *
 * Feed stdin, drain stdout/stderr, without deadlocking.
 *
 * The deadlock: child blocks writing a full stdout pipe, we block writing
 * its stdin, nobody reads. So whenever more than one pipe is live, reads
 * and writes have to make progress independently.
 *
 * Untimed: one scoped thread per output pipe drains to EOF while the
 * caller writes input and closes stdin. Threads never outlive the call.
 *
 * Timed: a single poll(2) loop. Input goes out in PIPE_BUF-sized chunks
 * only after POLLOUT (so a write never blocks), output comes in one read
 * per POLLIN. The deadline bounds the poll timeout, so no syscall blocks
 * past it and partial output is always at hand when it fires.
 *
 * EPIPE on stdin means the child stopped reading. Not an error: whatever
 * it wrote is still worth collecting.
 */

use std::borrow::Cow;
use std::io;
use std::panic;
use std::thread;
use std::time::Instant;

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::time_math::{deadline_reached, poll_timeout_ms, remaining};

/* POSIX guarantees writes up to this size into a pipe are atomic */
const INPUT_CHUNK: usize = 512;
/* per-read buffer in the timed loop */
const READ_CHUNK: usize = 32 * 1024;

/// Everything the child wrote to its stdout and stderr pipes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub output: Vec<u8>,
    pub error: Vec<u8>,
}

impl Capture {
    #[must_use]
    pub fn output_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }

    #[must_use]
    pub fn error_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.error)
    }
}

/* parent-side pipe ends taken out of a Process for one communicate */
#[derive(Debug, Default)]
pub(crate) struct Pipes {
    pub stdin: Option<Handle>,
    pub stdout: Option<Handle>,
    pub stderr: Option<Handle>,
}

impl Pipes {
    fn active(&self) -> usize {
        usize::from(self.stdin.is_some())
            + usize::from(self.stdout.is_some())
            + usize::from(self.stderr.is_some())
    }
}

/* result of a timed drain: what was read, and what's still open */
#[derive(Debug)]
pub(crate) struct Drained {
    pub capture: Capture,
    pub leftover: Pipes,
    /* input bytes the child accepted */
    pub written: usize,
    pub timed_out: bool,
}

fn is_broken_pipe(err: &Error) -> bool {
    matches!(err, Error::Os { source, .. } if source.kind() == io::ErrorKind::BrokenPipe)
}

/* write everything, then close so the child sees EOF */
fn feed(stdin: Handle, input: &[u8]) -> Result<()> {
    match stdin.send(input) {
        Ok(_) => {}
        Err(e) if is_broken_pipe(&e) => trace!("child closed stdin early, dropping rest of input"),
        Err(e) => return Err(e),
    }
    drop(stdin);
    Ok(())
}

/// Untimed drain. Blocks until every output pipe hits EOF.
pub(crate) fn drain(pipes: Pipes, input: Option<&[u8]>) -> Result<Capture> {
    let input = input.unwrap_or_default();
    if pipes.stdin.is_none() && !input.is_empty() {
        warn!("input given but stdin is not a pipe, ignoring {} bytes", input.len());
    }

    let mut capture = Capture::default();

    /* zero or one live pipe: no concurrency needed */
    if pipes.active() <= 1 {
        if let Some(stdin) = pipes.stdin {
            feed(stdin, input)?;
        } else if let Some(stdout) = pipes.stdout {
            capture.output = stdout.receive_to_end()?;
        } else if let Some(stderr) = pipes.stderr {
            capture.error = stderr.receive_to_end()?;
        }
        return Ok(capture);
    }

    let Pipes {
        stdin,
        stdout,
        stderr,
    } = pipes;

    thread::scope(|scope| -> Result<()> {
        let out_thread = stdout.map(|h| scope.spawn(move || h.receive_to_end()));
        let err_thread = stderr.map(|h| scope.spawn(move || h.receive_to_end()));

        let fed = match stdin {
            Some(stdin) => feed(stdin, input),
            None => Ok(()),
        };

        /* join both before reporting anything, so no thread is left reading */
        let output = out_thread.map(join_drain).transpose();
        let error = err_thread.map(join_drain).transpose();
        fed?;
        capture.output = output?.unwrap_or_default();
        capture.error = error?.unwrap_or_default();
        Ok(())
    })?;

    Ok(capture)
}

fn join_drain(handle: thread::ScopedJoinHandle<'_, Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(payload) => panic::resume_unwind(payload),
    }
}

/* which pipe a pollfd entry belongs to */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Which {
    Stdin,
    Stdout,
    Stderr,
}

/// Timed drain. Returns at EOF on every output pipe or at `deadline`,
/// whichever comes first; `timed_out` says which. Pipes still open at the
/// deadline come back in `leftover`.
pub(crate) fn drain_until(
    pipes: Pipes,
    input: Option<&[u8]>,
    deadline: Instant,
) -> Result<Drained> {
    let input = input.unwrap_or_default();
    let Pipes {
        mut stdin,
        mut stdout,
        mut stderr,
    } = pipes;
    if stdin.is_none() && !input.is_empty() {
        warn!("input given but stdin is not a pipe, ignoring {} bytes", input.len());
    }
    if input.is_empty() {
        /* nothing to say, let the child see EOF right away */
        stdin = None;
    }

    let mut capture = Capture::default();
    let mut written = 0usize;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut fds: Vec<libc::pollfd> = Vec::with_capacity(3);
    let mut tags: Vec<Which> = Vec::with_capacity(3);

    while stdin.is_some() || stdout.is_some() || stderr.is_some() {
        let now = Instant::now();
        if deadline_reached(now, deadline) {
            return Ok(Drained {
                capture,
                leftover: Pipes {
                    stdin,
                    stdout,
                    stderr,
                },
                written,
                timed_out: true,
            });
        }
        let left = remaining(now, deadline);

        fds.clear();
        tags.clear();
        for (handle, which, events) in [
            (&stdin, Which::Stdin, libc::POLLOUT),
            (&stdout, Which::Stdout, libc::POLLIN),
            (&stderr, Which::Stderr, libc::POLLIN),
        ] {
            if let Some(h) = handle {
                fds.push(libc::pollfd {
                    fd: h.id(),
                    events,
                    revents: 0,
                });
                tags.push(which);
            }
        }

        // SAFETY: fds is a valid array of fds.len() pollfd structs
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, poll_timeout_ms(left)) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::os("poll", err));
        }
        if ret == 0 {
            continue;
        }

        for (pfd, which) in fds.iter().zip(tags.iter().copied()) {
            let revents = pfd.revents;
            if revents == 0 {
                continue;
            }
            if revents & libc::POLLNVAL != 0 {
                return Err(Error::from_errno("poll", libc::EBADF));
            }
            match which {
                Which::Stdin => {
                    let Some(h) = &stdin else { continue };
                    let end = (written + INPUT_CHUNK).min(input.len());
                    /* POLLERR/POLLHUP land here too; the write reports EPIPE */
                    match h.write_once(&input[written..end]) {
                        Ok(n) => written += n,
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                            trace!("child closed stdin early, dropping rest of input");
                            written = input.len();
                        }
                        Err(e) => return Err(Error::os("write", e)),
                    }
                    if written >= input.len() {
                        stdin = None;
                    }
                }
                Which::Stdout | Which::Stderr => {
                    let (slot, sink) = if which == Which::Stdout {
                        (&mut stdout, &mut capture.output)
                    } else {
                        (&mut stderr, &mut capture.error)
                    };
                    let Some(h) = slot.as_ref() else { continue };
                    let n = h.read_once(&mut buf).map_err(|e| Error::os("read", e))?;
                    if n == 0 {
                        *slot = None;
                    } else {
                        sink.extend_from_slice(&buf[..n]);
                    }
                }
            }
        }
    }

    Ok(Drained {
        capture,
        leftover: Pipes::default(),
        written,
        timed_out: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;
    use std::time::Duration;

    /* a fake child: one thread echoing stdin to stdout */
    fn echo_pair() -> (Pipes, thread::JoinHandle<()>) {
        let (child_in, parent_in) = pipe().unwrap();
        let (parent_out, child_out) = pipe().unwrap();
        let worker = thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                let n = child_in.receive(&mut buf[..1024]).unwrap();
                if n == 0 {
                    break;
                }
                child_out.send(&buf[..n]).unwrap();
                if n < 1024 {
                    break;
                }
            }
        });
        let pipes = Pipes {
            stdin: Some(parent_in),
            stdout: Some(parent_out),
            stderr: None,
        };
        (pipes, worker)
    }

    #[test]
    fn test_drain_single_output() {
        let (rx, tx) = pipe().unwrap();
        tx.send(b"only stdout").unwrap();
        drop(tx);
        let pipes = Pipes {
            stdout: Some(rx),
            ..Pipes::default()
        };
        let capture = drain(pipes, None).unwrap();
        assert_eq!(capture.output, b"only stdout");
        assert!(capture.error.is_empty());
    }

    #[test]
    fn test_drain_single_input() {
        let (rx, tx) = pipe().unwrap();
        let pipes = Pipes {
            stdin: Some(tx),
            ..Pipes::default()
        };
        drain(pipes, Some(b"fed")).unwrap();
        assert_eq!(rx.receive_to_end().unwrap(), b"fed");
    }

    #[test]
    fn test_drain_input_to_closed_reader_is_ok() {
        let (rx, tx) = pipe().unwrap();
        drop(rx);
        let pipes = Pipes {
            stdin: Some(tx),
            ..Pipes::default()
        };
        drain(pipes, Some(b"nobody listens")).unwrap();
    }

    #[test]
    fn test_drain_echo_both_directions() {
        let (pipes, worker) = echo_pair();
        let capture = drain(pipes, Some(b"ping")).unwrap();
        worker.join().unwrap();
        assert_eq!(capture.output, b"ping");
    }

    #[test]
    fn test_drain_until_echo() {
        let (pipes, worker) = echo_pair();
        let deadline = Instant::now() + Duration::from_secs(5);
        let drained = drain_until(pipes, Some(b"pong"), deadline).unwrap();
        worker.join().unwrap();
        assert!(!drained.timed_out);
        assert_eq!(drained.capture.output, b"pong");
        assert!(drained.leftover.stdout.is_none());
    }

    #[test]
    fn test_drain_until_times_out_with_partial_output() {
        let (rx, tx) = pipe().unwrap();
        tx.send(b"partial").unwrap();
        /* tx stays open: no EOF ever comes */
        let pipes = Pipes {
            stdout: Some(rx),
            ..Pipes::default()
        };
        let start = Instant::now();
        let drained = drain_until(pipes, None, start + Duration::from_millis(100)).unwrap();
        assert!(drained.timed_out);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(drained.capture.output, b"partial");
        /* stdout handed back for a later attempt */
        let rx = drained.leftover.stdout.unwrap();
        drop(tx);
        assert!(rx.receive_to_end().unwrap().is_empty());
    }

    #[test]
    fn test_drain_until_reports_written_on_timeout() {
        let (rx, tx) = pipe().unwrap();
        /* nobody reads rx: the pipe fills and the write stalls */
        let input = vec![b'z'; 1 << 20];
        let pipes = Pipes {
            stdin: Some(tx),
            ..Pipes::default()
        };
        let drained = drain_until(pipes, Some(&input), Instant::now() + Duration::from_millis(100)).unwrap();
        assert!(drained.timed_out);
        assert!(drained.leftover.stdin.is_some());
        assert!(drained.written > 0);
        assert!(drained.written < input.len());
        drop(drained.leftover);
        assert_eq!(rx.receive_to_end().unwrap().len(), drained.written);
    }

    #[test]
    fn test_capture_lossy_strings() {
        let capture = Capture {
            output: b"ok\n".to_vec(),
            error: vec![0xff, b'!'],
        };
        assert_eq!(capture.output_str(), "ok\n");
        assert_eq!(capture.error_str(), "\u{fffd}!");
    }
}
