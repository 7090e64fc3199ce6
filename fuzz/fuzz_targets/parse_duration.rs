/*
 * fuzz_targets/parse_duration.rs
 *
 * parse_duration must return Ok or Err for any string, never panic, and
 * whatever it accepts must be a real Duration (try_from_secs_f64 is the
 * only thing standing between "1e400d" and a panic).
 *
 * edge cases: "", "1e400", "-0", "nan", "inf", "1.2.3s", "5ms5", unicode
 */

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = core::str::from_utf8(data) {
        if let Ok(d) = popen::duration::parse_duration(s) {
            /* zero and only zero disables the timeout */
            assert_eq!(popen::duration::as_timeout(d).is_none(), d.is_zero());
        }
    }
});
