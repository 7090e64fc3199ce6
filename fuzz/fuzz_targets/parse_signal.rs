/*
 * fuzz_targets/parse_signal.rs
 *
 * parse_signal must not panic, and anything it accepts must survive a
 * trip through its number and its name.
 *
 * edge cases: "SIGFOO", "999", "-1", "term", "  TERM  ", "SIG", "", "sIg"
 */

#![no_main]

use libfuzzer_sys::fuzz_target;
use popen::signal::parse_signal;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = core::str::from_utf8(data) {
        if let Ok(sig) = parse_signal(s) {
            assert_eq!(parse_signal(&sig.as_raw().to_string()).ok(), Some(sig));
            assert_eq!(parse_signal(sig.name()).ok(), Some(sig));
        }
    }
});
