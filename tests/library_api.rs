/*
 * library_api.rs
 *
 * integration-style tests exercising popen as a library.
 *
 * goal: ensure the public API is usable from outside the crate, with real
 * children on the other end of every pipe.
 */

use std::fs::{self, File};
use std::thread;
use std::time::{Duration, Instant};

use popen::{
    Argv, Config, Error, ExitStatus, PollState, Popen, Process, Redirect, State, call,
    check_output, split_command,
};

/* =========================================================================
 * ONE-SHOT HELPERS
 * ========================================================================= */

#[test]
fn library_check_output_echo() {
    let out = check_output(Popen::args(["echo", "hello"]), None, None).unwrap();
    assert_eq!(out, b"hello\n");
}

#[test]
fn library_check_output_command_string() {
    let out = check_output(Popen::command("echo  two   words"), None, None).unwrap();
    assert_eq!(out, b"two words\n");
}

#[test]
fn library_check_output_with_input() {
    let out = check_output(
        Popen::args(["tr", "a-z", "A-Z"]).stdin(Redirect::Pipe),
        Some(b"shout"),
        Some(Duration::from_secs(5)),
    )
    .unwrap();
    assert_eq!(out, b"SHOUT");
}

#[test]
fn library_check_output_nonzero_is_called_process() {
    let err = check_output(
        Popen::args(["sh", "-c", "echo partial; exit 3"]),
        None,
        None,
    )
    .unwrap_err();

    match err {
        Error::CalledProcess(failure) => {
            assert_eq!(failure.returncode, Some(3));
            assert_eq!(failure.output, b"partial\n");
            assert_eq!(failure.args, vec!["sh", "-c", "echo partial; exit 3"]);
        }
        other => panic!("expected CalledProcess, got {other:?}"),
    }
}

#[test]
fn library_check_output_timeout_kills() {
    let start = Instant::now();
    let err = check_output(
        Popen::args(["sh", "-c", "echo early; exec sleep 10"]),
        None,
        Some(Duration::from_millis(300)),
    )
    .unwrap_err();

    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_secs(5));
    let failure = err.failure().unwrap();
    assert_eq!(failure.output, b"early\n");
    /* killed and reaped before returning */
    assert_eq!(failure.returncode, Some(libc_sigkill()));
}

#[test]
fn library_call_returns_code() {
    assert_eq!(call(Popen::args(["sh", "-c", "exit 7"]), None).unwrap(), 7);
    assert_eq!(call(Popen::args(["true"]), None).unwrap(), 0);
}

#[test]
fn library_call_timeout() {
    let start = Instant::now();
    let err = call(Popen::args(["sleep", "10"]), Some(Duration::from_millis(200))).unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn library_missing_program() {
    let err = call(Popen::args(["definitely-not-a-real-program-xyz"]), None).unwrap_err();
    assert_eq!(err.exit_code(), 127);
}

fn libc_sigkill() -> i32 {
    9
}

/* =========================================================================
 * REDIRECTS
 * ========================================================================= */

#[test]
fn library_merge_into_stdout() {
    let mut p = Popen::args(["sh", "-c", "echo out; echo err >&2"])
        .stdout(Redirect::Pipe)
        .stderr(Redirect::Merge);
    let capture = p.communicate(None).unwrap();

    assert_eq!(capture.output_str(), "out\nerr\n");
    assert!(capture.error.is_empty());
}

#[test]
fn library_separate_stdout_stderr() {
    let mut p = Popen::args(["sh", "-c", "echo out; echo err >&2"])
        .stdout(Redirect::Pipe)
        .stderr(Redirect::Pipe);
    let capture = p.communicate(None).unwrap();

    assert_eq!(capture.output, b"out\n");
    assert_eq!(capture.error, b"err\n");
    assert_eq!(p.returncode(), Some(0));
}

#[test]
fn library_null_stdin_reads_eof() {
    let mut p = Popen::args(["wc", "-c"])
        .stdin(Redirect::Null)
        .stdout(Redirect::Pipe);
    let capture = p.communicate(None).unwrap();
    assert_eq!(capture.output_str().trim(), "0");
}

#[test]
fn library_file_redirect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let file = File::create(&path).unwrap();

    let mut p = Popen::args(["sh", "-c", "echo to-file; echo hidden >&2"])
        .stdout(file)
        .stderr(Redirect::Null);
    assert_eq!(p.wait().unwrap(), 0);

    assert_eq!(fs::read_to_string(&path).unwrap(), "to-file\n");
}

#[test]
fn library_merge_on_stdin_rejected() {
    let mut p = Popen::args(["true"]).stdin(Redirect::Merge);
    let err = p.start().unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(p.state(), State::Initial);
}

/* =========================================================================
 * COMMUNICATE
 * ========================================================================= */

#[test]
fn library_large_echo_untimed_all_pipes() {
    /*
     * same volume without a deadline, plus a stderr that overflows its
     * own pipe buffer before cat even starts reading
     */
    let input: Vec<u8> = (0..(1 << 20) + 4096).map(|i| (i % 241) as u8).collect();

    let mut p = Popen::args([
        "sh",
        "-c",
        "head -c 200000 /dev/zero | tr '\\0' e >&2; exec cat",
    ])
    .stdin(Redirect::Pipe)
    .stdout(Redirect::Pipe)
    .stderr(Redirect::Pipe);
    let capture = p.communicate(Some(&input)).unwrap();

    assert_eq!(capture.output.len(), input.len());
    assert!(capture.output == input);
    assert_eq!(capture.error.len(), 200_000);
    assert!(capture.error.iter().all(|&b| b == b'e'));
    assert_eq!(p.returncode(), Some(0));
}

#[test]
fn library_large_echo_through_cat() {
    /*
     * more than any pipe buffer in both directions. A naive write-all
     * then read-all would deadlock here.
     */
    let input: Vec<u8> = (0..(1 << 20) + 4096).map(|i| (i % 251) as u8).collect();

    let mut p = Popen::args(["cat"])
        .stdin(Redirect::Pipe)
        .stdout(Redirect::Pipe);
    let capture = p
        .communicate_timeout(Some(&input), Duration::from_secs(30))
        .unwrap();

    assert_eq!(capture.output.len(), input.len());
    assert!(capture.output == input);
    assert_eq!(p.returncode(), Some(0));
}

#[test]
fn library_awk_round_trip() {
    let mut p = Popen::args(["awk", "{printf \"%.5f\\n\", $1/$3}"])
        .stdin(Redirect::Pipe)
        .stdout(Redirect::Pipe);
    let capture = p.communicate(Some(b"355.0 / 113.0\n")).unwrap();
    assert_eq!(capture.output_str(), "3.14159\n");
}

#[test]
fn library_communicate_timeout_partial_then_finish() {
    let mut p = Popen::args(["sh", "-c", "echo first; sleep 1; echo second"])
        .stdout(Redirect::Pipe);

    let err = p
        .communicate_timeout(None, Duration::from_millis(300))
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.failure().unwrap().output, b"first\n");
    assert_eq!(p.state(), State::Started);

    /* the pipe went back in place, so a second call picks up the rest */
    let rest = p.communicate(None).unwrap();
    assert_eq!(rest.output, b"second\n");
    assert_eq!(p.returncode(), Some(0));
}

#[test]
fn library_communicate_again_after_end_is_empty() {
    let mut p = Popen::args(["echo", "once"]).stdout(Redirect::Pipe);
    assert_eq!(p.communicate(None).unwrap().output, b"once\n");
    let again = p.communicate(None).unwrap();
    assert!(again.output.is_empty());
    assert!(again.error.is_empty());
}

#[test]
fn library_taken_pipe_is_skipped() {
    let process = Popen::args(["sh", "-c", "echo out; echo err >&2"])
        .stdout(Redirect::Pipe)
        .stderr(Redirect::Pipe)
        .into_process()
        .unwrap();

    let stdout = process.take_stdout().unwrap();
    let capture = process.communicate(None).unwrap();
    assert!(capture.output.is_empty());
    assert_eq!(capture.error, b"err\n");
    assert_eq!(stdout.receive_to_end().unwrap(), b"out\n");
}

/* =========================================================================
 * WAIT / POLL / SIGNAL
 * ========================================================================= */

#[test]
fn library_wait_is_idempotent() {
    let process = Process::start(Config {
        argv: Argv::Seq(vec!["sh".into(), "-c".into(), "exit 5".into()]),
        ..Config::default()
    })
    .unwrap();

    assert_eq!(process.wait().unwrap(), 5);
    assert_eq!(process.wait().unwrap(), 5);
    assert_eq!(process.poll().unwrap(), PollState::Done(5));
    assert_eq!(process.reap_count(), 1);
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(5)));
    assert_eq!(process.state(), State::Ended);
}

#[test]
fn library_concurrent_waiters() {
    let mut p = Popen::args(["sh", "-c", "sleep 0.2; exit 3"]);
    let watcher = p.watcher().unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let w = watcher.clone();
            thread::spawn(move || w.wait().unwrap())
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), 3);
    }
    assert_eq!(watcher.reap_count(), 1);
    assert_eq!(p.returncode(), Some(3));
}

#[test]
fn library_wait_timeout_leaves_child_running() {
    let mut p = Popen::args(["sleep", "10"]);

    let start = Instant::now();
    let err = p.wait_timeout(Duration::from_millis(250)).unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed < Duration::from_secs(2), "overshoot: {elapsed:?}");
    assert_eq!(p.state(), State::Started);
    assert_eq!(p.poll().unwrap(), PollState::StillActive);

    p.kill().unwrap();
    assert_eq!(p.wait().unwrap(), libc_sigkill());
    assert_eq!(
        p.process().unwrap().exit_status(),
        Some(ExitStatus::Signaled(libc_sigkill()))
    );
}

#[test]
fn library_terminate_then_signal_after_end_is_noop() {
    let mut p = Popen::args(["sleep", "10"]);
    p.start().unwrap();
    p.terminate().unwrap();
    assert_eq!(p.wait().unwrap(), 15);

    /* the pid may be recycled; signalling must not reach it */
    p.kill().unwrap();
    p.send_signal(15).unwrap();
}

#[test]
fn library_signal_before_start() {
    let p = Popen::args(["true"]);
    assert!(matches!(p.kill(), Err(Error::NotStarted)));
    assert!(p.pid().is_none());
    assert!(p.returncode().is_none());
}

/* =========================================================================
 * CONFIGURATION
 * ========================================================================= */

#[test]
fn library_cwd() {
    let dir = tempfile::tempdir().unwrap();
    File::create(dir.path().join("marker.txt")).unwrap();

    let out = check_output(Popen::args(["ls"]).cwd(dir.path()), None, None).unwrap();
    assert_eq!(out, b"marker.txt\n");
}

#[test]
fn library_missing_cwd() {
    let mut p = Popen::args(["true"]).cwd("/definitely/not/a/dir");
    let err = p.start().unwrap_err();
    assert!(matches!(err, Error::Os { call: "chdir", .. }));
}

#[test]
fn library_env_replaces_environment() {
    let out = check_output(
        Popen::args(["/usr/bin/env"]).env(["ONLY=this"]),
        None,
        None,
    )
    .unwrap();
    assert_eq!(out, b"ONLY=this\n");
}

#[test]
fn library_env_var_visible_to_child() {
    let out = check_output(
        Popen::args(["sh", "-c", "echo $GREETING"]).env_var("GREETING", "hi"),
        None,
        None,
    )
    .unwrap();
    assert_eq!(out, b"hi\n");
}

#[test]
fn library_split_command_matches_args() {
    assert_eq!(split_command("ls  -l\t/tmp"), vec!["ls", "-l", "/tmp"]);
    assert_eq!(
        Popen::command("ls  -l\t/tmp").arguments(),
        Popen::args(["ls", "-l", "/tmp"]).arguments()
    );
}

#[test]
fn library_empty_argv_rejected() {
    let mut p = Popen::command("   ");
    assert!(matches!(p.start(), Err(Error::InvalidArgument(_))));
}
