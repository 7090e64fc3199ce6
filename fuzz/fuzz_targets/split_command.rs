/*
 * fuzz_targets/split_command.rs
 *
 * split_command on arbitrary text: no panics, no empty words, no blanks
 * inside a word, and the words rejoined with single spaces split the
 * same way again.
 */

#![no_main]

use libfuzzer_sys::fuzz_target;
use popen::config::split_command;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = core::str::from_utf8(data) {
        let words = split_command(s);
        for w in &words {
            assert!(!w.is_empty());
            assert!(!w.contains([' ', '\t']));
        }
        assert_eq!(split_command(&words.join(" ")), words);
    }
});
