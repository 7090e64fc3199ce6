/*
 * fuzz_targets/parse_args.rs
 *
 * CLI parsing plus the Popen it configures. Neither step may panic on
 * any argument combination; nothing is spawned.
 *
 * edge cases: "--unknown", "-t" (missing value), "-Cdir", "--input" with
 * "--null-stdin", "--" anywhere, very long args
 */

#![no_main]

use libfuzzer_sys::fuzz_target;
use popen::args::Args;

fuzz_target!(|data: &[u8]| {
    /* split input on null bytes to simulate multiple arguments */
    let args: Vec<String> = data
        .split(|&b| b == 0)
        .filter_map(|chunk| core::str::from_utf8(chunk).ok())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    /* help and version come back as Err here, no exit(0) to dodge */
    if let Ok(parsed) = Args::try_parse_from_slice(&args) {
        let _ = parsed.popen().arguments();
    }
});
