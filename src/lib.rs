/*
 * lib.rs
 *
 * The crate is the library; the popen binary is a thin CLI over it.
 */

//! # popen
//!
//! Spawn a child process, wire its standard streams to pipes, files,
//! `/dev/null` or the parent's own, then wait, poll, signal or
//! communicate with it, optionally under a deadline.
//!
//! ## Quick Start
//!
//! ```no_run
//! use popen::{Popen, Redirect, check_output};
//! use std::time::Duration;
//!
//! // one-shot: run and capture stdout
//! let out = check_output(Popen::args(["echo", "hi"]), None, None).unwrap();
//! assert_eq!(out, b"hi\n");
//!
//! // feed stdin and read stdout without deadlocking, bounded to 5s
//! let mut p = Popen::args(["cat"]).stdin(Redirect::Pipe).stdout(Redirect::Pipe);
//! let capture = p
//!     .communicate_timeout(Some(b"round trip"), Duration::from_secs(5))
//!     .unwrap();
//! assert_eq!(capture.output, b"round trip");
//! ```
//!
//! Unix only: the spawn path is `posix_spawnp`, or `fork`+`execvp` when
//! a working directory is set.

#[cfg(not(unix))]
compile_error!("popen supports Unix targets only");

pub mod args;
pub mod communicate;
pub mod config;
pub mod duration;
pub mod error;
pub mod handle;
pub mod pipe;
pub mod popen;
pub mod process;
pub mod reap;
pub mod runner;
pub mod signal;
mod spawn;
pub mod stream;
pub mod time_math;

pub use communicate::Capture;
pub use config::{Argv, Config, split_command};
pub use error::{Error, Failure, Result, exit_codes};
pub use handle::{Handle, null_device};
pub use pipe::pipe;
pub use popen::Popen;
pub use process::{Process, State, Watcher};
pub use reap::{ExitStatus, PollState};
pub use runner::{call, check_output};
pub use signal::{Signal, parse_signal};
pub use stream::{Redirect, Slot};
