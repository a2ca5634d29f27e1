//! Parsing of human-written durations into whole seconds.
//!
//! Accepted forms are a bare integer (`"300"`) or a sequence of integer and
//! unit pairs (`"1h5m"`, `"30s"`, `"2d"`).

use pom::utf8::{end, one_of, sym, Parser};

use crate::error::Error;

fn number<'a>() -> Parser<'a, i64> {
    one_of("0123456789")
        .repeat(1..)
        .collect()
        .convert(|digits: &str| digits.parse::<i64>())
        .name("number")
}

fn unit<'a>() -> Parser<'a, i64> {
    let seconds = sym('s').map(|_| 1);
    let minutes = sym('m').map(|_| 60);
    let hours = sym('h').map(|_| 60 * 60);
    let days = sym('d').map(|_| 24 * 60 * 60);

    (seconds | minutes | hours | days).name("unit")
}

fn component<'a>() -> Parser<'a, i64> {
    (number() + unit())
        .convert(|(n, unit)| n.checked_mul(unit).ok_or("duration overflows"))
        .name("duration component")
}

fn duration<'a>() -> Parser<'a, i64> {
    let bare = number() - end();
    let units = component()
        .repeat(1..)
        .convert(|parts| {
            parts
                .into_iter()
                .try_fold(0i64, |acc, n| acc.checked_add(n))
                .ok_or("duration overflows")
        })
        - end();

    (bare | units).name("duration")
}

/// Parses a duration string into seconds.
pub fn parse_duration(input: &str) -> Result<i64, Error> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(0);
    }
    if input.starts_with('-') {
        return Err(Error::validation(format!(
            "invalid duration {input:?}: must not be negative"
        )));
    }

    duration()
        .parse_str(input)
        .map_err(|e| Error::validation(format!("invalid duration {input:?}: {e}")))
}
