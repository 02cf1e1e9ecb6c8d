// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Build time configuration.
//!
//! Both values are read from the environment of the build, e.g.
//! `LIBEXCEPT_MAX_EXCEPTIONS=2 cargo build`. Invalid values fail the build.

/// The number of exceptions that can be alive at the same time.
pub const MAX_EXCEPTIONS: usize = parse_or(option_env!("LIBEXCEPT_MAX_EXCEPTIONS"), 4);

/// The largest exception object, in bytes, a registry slot can hold.
pub const MAX_EXCEPTION_SIZE: usize = parse_or(option_env!("LIBEXCEPT_MAX_EXCEPTION_SIZE"), 128);

const _: () = assert!(MAX_EXCEPTIONS > 0, "LIBEXCEPT_MAX_EXCEPTIONS must not be zero");
const _: () = assert!(
    MAX_EXCEPTION_SIZE > 0,
    "LIBEXCEPT_MAX_EXCEPTION_SIZE must not be zero"
);

const fn parse_or(value: Option<&str>, default: usize) -> usize {
    match value {
        Some(value) => parse(value),
        None => default,
    }
}

/// Parses a decimal or `0x` prefixed hexadecimal number, `_` separators are allowed.
const fn parse(value: &str) -> usize {
    let bytes = value.as_bytes();
    let hex = bytes.len() > 2 && bytes[0] == b'0' && (bytes[1] == b'x' || bytes[1] == b'X');
    let (radix, mut i) = if hex {
        (16, 2)
    } else {
        (10, 0)
    };

    let mut digits = 0;
    let mut out: usize = 0;
    while i < bytes.len() {
        let digit = match bytes[i] {
            b'_' => {
                i += 1;
                continue;
            }
            b @ b'0'..=b'9' => (b - b'0') as usize,
            b @ b'a'..=b'f' if radix == 16 => (b - b'a' + 10) as usize,
            b @ b'A'..=b'F' if radix == 16 => (b - b'A' + 10) as usize,
            _ => panic!("invalid digit in libexcept configuration value"),
        };

        out = match out.checked_mul(radix) {
            Some(out) => match out.checked_add(digit) {
                Some(out) => out,
                None => panic!("libexcept configuration value overflows"),
            },
            None => panic!("libexcept configuration value overflows"),
        };
        digits += 1;
        i += 1;
    }

    assert!(digits > 0, "empty libexcept configuration value");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_values() {
        assert_eq!(parse("4"), 4);
        assert_eq!(parse("1_024"), 1024);
        assert_eq!(parse("0x80"), 128);
        assert_eq!(parse_or(None, 7), 7);
    }

    #[test]
    #[should_panic = "invalid digit"]
    fn reject_garbage() {
        parse("12k");
    }

    #[test]
    #[should_panic = "empty"]
    fn reject_empty() {
        parse("");
    }
}
