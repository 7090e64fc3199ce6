/*
 * main.rs
 *
 * Parse args, build the Popen, run it, turn the outcome into an exit
 * code. Boring on purpose. The interesting stuff is in the library.
 *
 * Exit codes: child's own code, 128+N for signal N, 124 on timeout,
 * 125/126/127 for our failures (see error::exit_codes).
 */

use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;

use log::{debug, info, warn};

use popen::args::Args;
use popen::duration::{as_timeout, parse_duration};
use popen::error::{Error, Result, exit_codes};
use popen::signal::{Signal, parse_signal};
use popen::{Capture, ExitStatus, Popen};

/* how long a stopped child's leftover pipe contents get to show up */
const TRAILING_GRACE: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    let args = Args::parse_args();

    let default_level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();

    match run(&args) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("popen: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/* child's status as a shell would report it */
fn status_code(status: Option<ExitStatus>) -> u8 {
    match status {
        Some(ExitStatus::Exited(code)) => (code & 0xFF) as u8,
        Some(ExitStatus::Signaled(sig) | ExitStatus::Stopped(sig)) => {
            128u8.saturating_add((sig & 0x7F) as u8)
        }
        None => exit_codes::INTERNAL_ERROR,
    }
}

/* forward whatever was captured to our own streams */
fn emit(capture: &Capture) {
    if let Err(e) = io::stdout().write_all(&capture.output) {
        warn!("writing captured stdout failed: {e}");
    }
    if let Err(e) = io::stderr().write_all(&capture.error) {
        warn!("writing captured stderr failed: {e}");
    }
}

/* what the child wrote between the timeout and its death */
fn emit_trailing(popen: &mut Popen) {
    match popen.communicate_timeout(None, TRAILING_GRACE) {
        Ok(rest) => emit(&rest),
        Err(Error::Timeout { failure, .. }) => emit(&Capture {
            output: failure.output,
            error: failure.error,
        }),
        Err(e) => warn!("could not collect trailing output: {e}"),
    }
}

/* polite signal first, SIGKILL if it's ignored, then reap */
fn stop(popen: &mut Popen, signal: Signal, kill_after: Duration) -> Result<()> {
    info!("timed out, sending {signal}");
    popen.send_signal(signal.as_raw())?;
    if signal != Signal::KILL {
        match popen.wait_timeout(kill_after) {
            Ok(_) => return Ok(()),
            Err(e) if e.is_timeout() => {
                info!("still running after {kill_after:?}, sending SIGKILL");
                popen.kill()?;
            }
            Err(e) => return Err(e),
        }
    }
    popen.wait()?;
    Ok(())
}

fn run(args: &Args) -> Result<u8> {
    let timeout = as_timeout(parse_duration(&args.timeout)?);
    let signal = parse_signal(&args.signal)?;
    let kill_after = parse_duration(&args.kill_after)?;

    let mut popen = args.popen();
    debug!("running {:?} (timeout {timeout:?})", popen.arguments());

    let outcome = if args.needs_communicate() {
        let input = args.input.as_deref().map(str::as_bytes);
        match timeout {
            Some(t) => popen.communicate_timeout(input, t),
            None => popen.communicate(input),
        }
        .map(|capture| emit(&capture))
    } else {
        match timeout {
            Some(t) => popen.wait_timeout(t),
            None => popen.wait(),
        }
        .map(drop)
    };

    match outcome {
        Ok(()) => {}
        Err(Error::Timeout { failure, .. }) => {
            /* partial output is still the command's output */
            emit(&Capture {
                output: failure.output,
                error: failure.error,
            });
            stop(&mut popen, signal, kill_after)?;
            if args.needs_communicate() {
                emit_trailing(&mut popen);
            }
            return Ok(exit_codes::TIMEOUT);
        }
        Err(e) => return Err(e),
    }

    Ok(status_code(popen.process().and_then(|p| p.exit_status())))
}
