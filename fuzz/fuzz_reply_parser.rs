//! Fuzz target for the control-reply parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_reply_parser
//!
//! Splits the input into lines and feeds them through `ReplyParser`, then runs
//! every completed reply through the event, GETINFO and circuit parsers.

#![no_main]

use libfuzzer_sys::fuzz_target;
use onionkeeper_core::protocol::{ReplyParser, parse_circuits, parse_event, parse_info};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let mut parser = ReplyParser::new();
    for line in s.split('\n') {
        if let Ok(Some(reply)) = parser.push_line(line) {
            let _ = parse_event(&reply);
            if let Ok(values) = parse_info(&reply) {
                for value in values.values() {
                    let _ = parse_circuits(value);
                }
            }
        }
    }
});
