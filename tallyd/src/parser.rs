//! The statsd line protocol.
//!
//! One line is `name:value|type` with an optional `|@rate` tail, e.g.
//! `api.requests:1|c|@0.5`. The parser borrows from the input line; the
//! registry copies names on insertion, so nothing here outlives the ingest
//! call.

use std::borrow::Cow;

use thiserror::Error;

/// The kind of a metric sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Summed occurrence counts.
    Counter,
    /// Latency-style observations with quantile queries.
    Timer,
    /// Point-in-time value with per-flush history.
    Gauge,
    /// A gauge update that adds to the current value instead of replacing it.
    GaugeDelta,
    /// Last-write-wins value with no history.
    GaugeDirect,
    /// Distinct-element observations.
    Set,
    /// Raw value passed through to stream sinks without aggregation.
    KeyVal,
}

/// Errors from [`parse_line`].
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    /// The line does not split into `name:value|type`.
    #[error("line is not name:value|type")]
    BadFormat,

    /// The value (or an explicit sample rate) is not a number.
    #[error("value is not a number")]
    BadValue,

    /// The type field starts with a byte we do not recognize.
    #[error("unknown metric type {0:?}")]
    UnknownType(char),
}

/// A successfully parsed line.
#[derive(Debug, PartialEq)]
pub enum Parsed<'a> {
    /// A numeric sample. Counter values arrive pre-multiplied by `1/rate`.
    Sample { kind: MetricKind, name: Cow<'a, str>, value: f64, rate: f64 },

    /// A set observation; the element is the raw value string.
    SetElement { name: Cow<'a, str>, element: Cow<'a, str> },
}

/// Parses a single line (without its trailing newline).
///
/// The name is everything before the *last* colon, so names may themselves
/// contain colons. The type is decided by the first byte after the first `|`:
/// `c` counter, `h`/`m` timer, `g` gauge (a leading `+`/`-` on the value makes
/// it a delta), `k` key/value, `s` set. A `|@rate` tail is honored for
/// counters and timers when `0 < rate <= 1`; out-of-range rates silently fall
/// back to 1.0.
pub fn parse_line(line: &[u8]) -> Result<Parsed<'_>, ParseError> {
    let colon = line.iter().rposition(|&b| b == b':').ok_or(ParseError::BadFormat)?;
    let (name, rest) = (&line[..colon], &line[colon + 1..]);
    if name.is_empty() {
        return Err(ParseError::BadFormat);
    }

    let pipe = rest.iter().position(|&b| b == b'|').ok_or(ParseError::BadFormat)?;
    let (value_bytes, type_tail) = (&rest[..pipe], &rest[pipe + 1..]);

    let type_byte = *type_tail.first().ok_or(ParseError::BadFormat)?;
    let kind = match type_byte {
        b'c' => MetricKind::Counter,
        b'h' | b'm' => MetricKind::Timer,
        b'g' => match value_bytes.first() {
            Some(b'+') | Some(b'-') => MetricKind::GaugeDelta,
            _ => MetricKind::Gauge,
        },
        b'k' => MetricKind::KeyVal,
        b's' => MetricKind::Set,
        other => return Err(ParseError::UnknownType(other as char)),
    };

    let name = String::from_utf8_lossy(name);

    // Sets skip numeric parsing entirely; the raw string is the element.
    if kind == MetricKind::Set {
        return Ok(Parsed::SetElement { name, element: String::from_utf8_lossy(value_bytes) });
    }

    let mut value = parse_f64(value_bytes)?;

    let mut rate = 1.0;
    if matches!(kind, MetricKind::Counter | MetricKind::Timer) {
        if let Some(at) = type_tail.iter().position(|&b| b == b'@') {
            let unchecked = parse_f64(&type_tail[at + 1..])?;
            if unchecked > 0.0 && unchecked <= 1.0 {
                rate = unchecked;
                // Magnify sampled counters back up to their estimated total.
                if kind == MetricKind::Counter {
                    value *= 1.0 / rate;
                }
            }
        }
    }

    Ok(Parsed::Sample { kind, name, value, rate })
}

fn parse_f64(bytes: &[u8]) -> Result<f64, ParseError> {
    std::str::from_utf8(bytes)
        .map_err(|_| ParseError::BadValue)?
        .trim()
        .parse()
        .map_err(|_| ParseError::BadValue)
}

#[cfg(test)]
mod tests {
    use super::{parse_line, MetricKind, Parsed, ParseError};

    fn sample(line: &str) -> (MetricKind, String, f64, f64) {
        match parse_line(line.as_bytes()).expect("line should parse") {
            Parsed::Sample { kind, name, value, rate } => (kind, name.into_owned(), value, rate),
            other => panic!("expected a sample, got {other:?}"),
        }
    }

    #[test]
    fn basic_counter() {
        assert_eq!(sample("foo:1|c"), (MetricKind::Counter, "foo".into(), 1.0, 1.0));
    }

    #[test]
    fn sampled_counter_is_magnified() {
        assert_eq!(sample("bar:2|c|@0.5"), (MetricKind::Counter, "bar".into(), 4.0, 0.5));
    }

    #[test]
    fn out_of_range_rate_falls_back() {
        assert_eq!(sample("bar:2|c|@0"), (MetricKind::Counter, "bar".into(), 2.0, 1.0));
        assert_eq!(sample("bar:2|c|@1.5"), (MetricKind::Counter, "bar".into(), 2.0, 1.0));
        assert_eq!(sample("bar:2|c|@-0.5"), (MetricKind::Counter, "bar".into(), 2.0, 1.0));
    }

    #[test]
    fn unparsable_rate_is_rejected() {
        assert_eq!(parse_line(b"bar:2|c|@oops"), Err(ParseError::BadValue));
    }

    #[test]
    fn timer_keeps_raw_value_and_rate() {
        assert_eq!(sample("glork:320|ms|@0.1"), (MetricKind::Timer, "glork".into(), 320.0, 0.1));
        assert_eq!(sample("glork:320|h"), (MetricKind::Timer, "glork".into(), 320.0, 1.0));
    }

    #[test]
    fn rate_ignored_for_gauges() {
        // A gauge with an `@` tail parses, but the rate stays 1.0.
        assert_eq!(sample("g1:5|g|@0.5"), (MetricKind::Gauge, "g1".into(), 5.0, 1.0));
    }

    #[test]
    fn gauge_and_deltas() {
        assert_eq!(sample("gaugor:333|g"), (MetricKind::Gauge, "gaugor".into(), 333.0, 1.0));
        assert_eq!(sample("gaugor:+10|g"), (MetricKind::GaugeDelta, "gaugor".into(), 10.0, 1.0));
        assert_eq!(sample("gaugor:-4|g"), (MetricKind::GaugeDelta, "gaugor".into(), -4.0, 1.0));
    }

    #[test]
    fn key_val() {
        assert_eq!(sample("kv:42.5|kv"), (MetricKind::KeyVal, "kv".into(), 42.5, 1.0));
    }

    #[test]
    fn set_keeps_raw_element() {
        match parse_line(b"uniques:alice|s").expect("line should parse") {
            Parsed::SetElement { name, element } => {
                assert_eq!(name, "uniques");
                assert_eq!(element, "alice");
            }
            other => panic!("expected a set element, got {other:?}"),
        }
    }

    #[test]
    fn name_may_contain_colons() {
        assert_eq!(sample("a:b:1|c"), (MetricKind::Counter, "a:b".into(), 1.0, 1.0));
    }

    #[test]
    fn bad_format() {
        assert_eq!(parse_line(b""), Err(ParseError::BadFormat));
        assert_eq!(parse_line(b"no-colon|c"), Err(ParseError::BadFormat));
        assert_eq!(parse_line(b"name:no-pipe"), Err(ParseError::BadFormat));
        assert_eq!(parse_line(b":1|c"), Err(ParseError::BadFormat));
        assert_eq!(parse_line(b"name:1|"), Err(ParseError::BadFormat));
    }

    #[test]
    fn bad_value() {
        assert_eq!(parse_line(b"name:|c"), Err(ParseError::BadValue));
        assert_eq!(parse_line(b"name:abc|c"), Err(ParseError::BadValue));
    }

    #[test]
    fn unknown_type() {
        assert_eq!(parse_line(b"name:1|x"), Err(ParseError::UnknownType('x')));
    }

    #[test]
    fn non_ascii_name_passes_through() {
        assert_eq!(sample("caf\u{e9}.hits:1|c").1, "caf\u{e9}.hits");
    }

    #[test]
    fn non_finite_values_parse() {
        // The parser passes these through; the timer aggregator rejects them.
        let (_, _, value, _) = sample("t:inf|ms");
        assert!(value.is_infinite());
        let (_, _, value, _) = sample("t:nan|ms");
        assert!(value.is_nan());
    }
}
