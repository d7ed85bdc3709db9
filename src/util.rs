use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, Utc};
use sha2::{Digest, Sha256};

/// Current wall clock as unix epoch seconds, the time representation used
/// everywhere in persistent and cached state.
pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before epoch")
        .as_secs() as i64
}

/// Proleptic day number of the UTC date `ts` falls on. Rotates daily, which
/// is what makes obfuscated ids unlinkable across days.
pub fn day_ordinal(ts: i64) -> i64 {
    let dt = DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_default();
    dt.date_naive().num_days_from_ce() as i64
}

pub fn format_datetime(ts: i64) -> String {
    match DateTime::<Utc>::from_timestamp(ts, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M UTC").to_string(),
        None => "?".into(),
    }
}

/// Renders a duration as its largest whole unit: "1w", "3d", "2h", "5m", "30s".
pub fn format_duration(secs: i64) -> String {
    let units = [(7 * 86400, 'w'), (86400, 'd'), (3600, 'h'), (60, 'm')];
    for (unit, ch) in units {
        if secs >= unit {
            return format!("{}{}", secs / unit, ch);
        }
    }
    format!("{}s", secs.max(0))
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(c),
        }
    }
    out
}

/// 32-bit FNV-1a over integers (little-endian, sign dropped) and raw bytes.
pub fn fnv32a(int_parts: &[i64], byte_parts: &[u8]) -> u32 {
    const PRIME: u32 = 0x0100_0193;
    let mut h: u32 = 0x811c_9dc5;
    for part in int_parts {
        let mut i = part.unsigned_abs();
        while i != 0 {
            h = (h ^ (i & 0xff) as u32).wrapping_mul(PRIME);
            i >>= 8;
        }
    }
    for b in byte_parts {
        h = (h ^ *b as u32).wrapping_mul(PRIME);
    }
    h
}

/// Splits a `name#pass` tripcode and derives the public code from the
/// password. The code is a one-way hash so knowing it does not reveal the
/// password, only that two messages share it.
pub fn gen_tripcode(tripcode: &str) -> (String, String) {
    let pos = tripcode.find('#').expect("tripcode without separator");
    let name = &tripcode[..pos];
    let pass = &tripcode[pos + 1..];

    let mut hasher = Sha256::new();
    hasher.update(b"trip:");
    hasher.update(pass.as_bytes());
    let digest = hasher.finalize();
    let code = format!("!{}", &hex::encode(digest)[..10]);
    (name.to_owned(), code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(60), "1m");
        assert_eq!(format_duration(25 * 60), "25m");
        assert_eq!(format_duration(2 * 3600), "2h");
        assert_eq!(format_duration(3 * 86400), "3d");
        assert_eq!(format_duration(10 * 86400), "1w");
    }

    #[test]
    fn test_format_datetime() {
        assert_eq!(format_datetime(0), "1970-01-01 00:00 UTC");
        assert_eq!(format_datetime(1700000000), "2023-11-14 22:13 UTC");
    }

    #[test]
    fn test_fnv32a() {
        // reference value for empty input is the FNV offset basis
        assert_eq!(fnv32a(&[], &[]), 0x811c_9dc5);
        assert_ne!(fnv32a(&[42], b"salt"), fnv32a(&[42], b"pepper"));
        assert_eq!(fnv32a(&[42], b"salt"), fnv32a(&[-42], b"salt"));
    }

    #[test]
    fn test_tripcode() {
        let (name, code) = gen_tripcode("alice#hunter2");
        assert_eq!(name, "alice");
        assert_eq!(code.len(), 11);
        assert!(code.starts_with('!'));
        // same password, same code; the name does not factor in
        let (_, code2) = gen_tripcode("bob#hunter2");
        assert_eq!(code, code2);
        let (_, code3) = gen_tripcode("alice#other");
        assert_ne!(code, code3);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>&c"), "a&lt;b&gt;&amp;c");
        assert_eq!(escape_html("plain"), "plain");
    }
}
